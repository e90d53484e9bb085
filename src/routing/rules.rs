/// Ordered routing rule table
///
/// Rules are evaluated in `(priority, insertion order)`; the first active
/// rule whose matcher accepts the statement decides its destination pool.
/// The table is swapped as a whole on every change so classification never
/// waits on an administrative update.
use arc_swap::ArcSwap;
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::statement;
use crate::core::PoolId;
use crate::error::{RutaError, RutaResult};

/// How a rule's pattern is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MatchKind {
    /// Leading keyword equals the pattern
    Keyword,
    /// Statement starts with the pattern
    Prefix,
    /// Regular expression over the statement
    Regex,
}

/// A compiled statement matcher. All matching is case-insensitive and runs
/// on the statement with leading whitespace and comments removed.
#[derive(Debug, Clone)]
pub enum RuleMatcher {
    Keyword(String),
    Prefix(String),
    Regex(Regex),
}

impl RuleMatcher {
    pub fn new(kind: MatchKind, pattern: &str) -> RutaResult<Self> {
        if pattern.trim().is_empty() {
            return Err(RutaError::validation("rule pattern must not be empty"));
        }
        match kind {
            MatchKind::Keyword => Ok(RuleMatcher::Keyword(pattern.trim().to_string())),
            MatchKind::Prefix => Ok(RuleMatcher::Prefix(pattern.to_string())),
            MatchKind::Regex => Self::regex(pattern),
        }
    }

    pub fn keyword<S: Into<String>>(keyword: S) -> Self {
        RuleMatcher::Keyword(keyword.into())
    }

    pub fn regex(pattern: &str) -> RutaResult<Self> {
        RegexBuilder::new(pattern)
            .case_insensitive(true)
            .dot_matches_new_line(true)
            .build()
            .map(RuleMatcher::Regex)
            .map_err(|e| RutaError::validation(format!("invalid rule pattern '{}': {}", pattern, e)))
    }

    pub fn kind(&self) -> MatchKind {
        match self {
            RuleMatcher::Keyword(_) => MatchKind::Keyword,
            RuleMatcher::Prefix(_) => MatchKind::Prefix,
            RuleMatcher::Regex(_) => MatchKind::Regex,
        }
    }

    pub fn pattern(&self) -> &str {
        match self {
            RuleMatcher::Keyword(p) | RuleMatcher::Prefix(p) => p,
            RuleMatcher::Regex(re) => re.as_str(),
        }
    }

    /// Test an already-normalized statement
    pub fn matches(&self, normalized: &str) -> bool {
        match self {
            RuleMatcher::Keyword(keyword) => {
                statement::leading_keyword(normalized).eq_ignore_ascii_case(keyword)
            }
            RuleMatcher::Prefix(prefix) => normalized
                .get(..prefix.len())
                .map_or(false, |head| head.eq_ignore_ascii_case(prefix)),
            RuleMatcher::Regex(re) => re.is_match(normalized),
        }
    }
}

/// One entry of the routing table
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub rule_id: u32,
    pub priority: u32,
    pub matcher: RuleMatcher,
    pub destination: PoolId,
    pub active: bool,
    pub comment: String,
    seq: u64,
    hits: Arc<AtomicU64>,
}

impl RoutingRule {
    pub fn new(rule_id: u32, matcher: RuleMatcher, destination: PoolId) -> Self {
        Self {
            rule_id,
            priority: 0,
            matcher,
            destination,
            active: true,
            comment: String::new(),
            seq: 0,
            hits: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_active(mut self, active: bool) -> Self {
        self.active = active;
        self
    }

    pub fn with_comment<S: Into<String>>(mut self, comment: S) -> Self {
        self.comment = comment.into();
        self
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> RuleInfo {
        RuleInfo {
            rule_id: self.rule_id,
            priority: self.priority,
            match_kind: self.matcher.kind(),
            match_pattern: self.matcher.pattern().to_string(),
            destination_pool: self.destination,
            active: self.active,
            comment: self.comment.clone(),
            hits: self.hits(),
        }
    }
}

/// Serializable view of a rule and its hit count
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuleInfo {
    pub rule_id: u32,
    pub priority: u32,
    pub match_kind: MatchKind,
    pub match_pattern: String,
    pub destination_pool: PoolId,
    pub active: bool,
    pub comment: String,
    pub hits: u64,
}

/// The rule that decided a statement's destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RuleMatch {
    pub rule_id: u32,
    pub destination: PoolId,
}

pub struct RuleTable {
    rules: ArcSwap<Vec<Arc<RoutingRule>>>,
    /// Serializes writers; readers only load the current table
    update: Mutex<()>,
    next_seq: AtomicU64,
}

impl RuleTable {
    pub fn new() -> Self {
        Self {
            rules: ArcSwap::from_pointee(Vec::new()),
            update: Mutex::new(()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// First active rule matching the statement
    pub fn classify(&self, sql: &str) -> Option<RuleMatch> {
        let normalized = statement::normalize(sql);
        let rules = self.rules.load();
        rules
            .iter()
            .find(|rule| rule.active && rule.matcher.matches(normalized))
            .map(|rule| {
                rule.hits.fetch_add(1, Ordering::Relaxed);
                RuleMatch {
                    rule_id: rule.rule_id,
                    destination: rule.destination,
                }
            })
    }

    pub fn add(&self, mut rule: RoutingRule) -> RutaResult<()> {
        self.modify(|rules| {
            if rules.iter().any(|r| r.rule_id == rule.rule_id) {
                return Err(RutaError::DuplicateRule { id: rule.rule_id });
            }
            rule.seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            rules.push(Arc::new(rule));
            Ok(())
        })
    }

    pub fn remove(&self, rule_id: u32) -> RutaResult<()> {
        self.modify(|rules| {
            let before = rules.len();
            rules.retain(|r| r.rule_id != rule_id);
            if rules.len() == before {
                return Err(RutaError::UnknownRule { id: rule_id });
            }
            Ok(())
        })
    }

    pub fn set_active(&self, rule_id: u32, active: bool) -> RutaResult<()> {
        self.modify(|rules| {
            let slot = rules
                .iter_mut()
                .find(|r| r.rule_id == rule_id)
                .ok_or(RutaError::UnknownRule { id: rule_id })?;
            // Hit counter is shared with the replaced rule
            let updated = RoutingRule {
                active,
                ..RoutingRule::clone(slot)
            };
            *slot = Arc::new(updated);
            Ok(())
        })
    }

    pub fn list(&self) -> Vec<RuleInfo> {
        self.rules.load().iter().map(|r| r.info()).collect()
    }

    pub fn len(&self) -> usize {
        self.rules.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn modify<F>(&self, f: F) -> RutaResult<()>
    where
        F: FnOnce(&mut Vec<Arc<RoutingRule>>) -> RutaResult<()>,
    {
        let _guard = self
            .update
            .lock()
            .map_err(|_| RutaError::internal("rule table lock poisoned"))?;
        let mut rules: Vec<Arc<RoutingRule>> = self.rules.load().as_ref().clone();
        f(&mut rules)?;
        rules.sort_by_key(|r| (r.priority, r.seq));
        self.rules.store(Arc::new(rules));
        Ok(())
    }
}

impl Default for RuleTable {
    fn default() -> Self {
        Self::new()
    }
}
