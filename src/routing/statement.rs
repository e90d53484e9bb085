/// Lightweight statement inspection
///
/// Nothing here parses SQL. Statements are trimmed of leading whitespace,
/// comments and parentheses, then recognized by their leading keywords.
use aho_corasick::AhoCorasick;
use lazy_static::lazy_static;

/// Clauses that turn a SELECT into a locking or writing statement
const WRITE_CLAUSES: &[&str] = &["FOR UPDATE", "FOR SHARE", "LOCK IN SHARE MODE", " INTO "];

const READ_KEYWORDS: &[&str] = &["SELECT", "SHOW", "DESC", "DESCRIBE", "EXPLAIN"];

lazy_static! {
    static ref WRITE_CLAUSE_FINDER: AhoCorasick = AhoCorasick::builder()
        .ascii_case_insensitive(true)
        .build(WRITE_CLAUSES)
        .expect("Failed to create AhoCorasick clause finder");
}

/// Statements the session handler treats specially
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatementKind {
    Begin,
    Commit,
    Rollback,
    SetAutocommit(bool),
    UseSchema(String),
    /// Proxy-local diagnostic: which backend serves this connection
    ShowProxyBackend,
    Other,
}

impl StatementKind {
    /// Whether the statement opens a transaction or keeps one open
    pub fn starts_pinning(&self) -> bool {
        matches!(self, StatementKind::Begin | StatementKind::SetAutocommit(false))
    }
}

/// Skip leading whitespace, comments and opening parentheses
pub fn normalize(sql: &str) -> &str {
    let mut rest = sql;
    loop {
        let trimmed = rest.trim_start_matches(|c: char| c.is_whitespace() || c == '(');
        if let Some(body) = trimmed.strip_prefix("/*") {
            rest = match body.find("*/") {
                Some(end) => &body[end + 2..],
                None => "",
            };
        } else if trimmed.starts_with('#') || is_dash_comment(trimmed) {
            rest = match trimmed.find('\n') {
                Some(end) => &trimmed[end + 1..],
                None => "",
            };
        } else {
            return trimmed;
        }
    }
}

fn is_dash_comment(text: &str) -> bool {
    text.strip_prefix("--")
        .map(|after| after.chars().next().map_or(true, char::is_whitespace))
        .unwrap_or(false)
}

/// The first word of the statement, as written
pub fn leading_keyword(sql: &str) -> &str {
    let text = normalize(sql);
    let end = text
        .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
        .unwrap_or(text.len());
    &text[..end]
}

/// Whether the statement only reads data and may run on a replica
pub fn is_read_statement(sql: &str) -> bool {
    let text = normalize(sql);
    let keyword = leading_keyword(text);
    if keyword.eq_ignore_ascii_case("SELECT") {
        return !WRITE_CLAUSE_FINDER.is_match(text);
    }
    READ_KEYWORDS.iter().any(|k| keyword.eq_ignore_ascii_case(k))
}

/// Recognize transaction control, session state and proxy-local statements
pub fn statement_kind(sql: &str) -> StatementKind {
    let text = normalize(sql).trim_end_matches(|c: char| c == ';' || c.is_whitespace());
    let words: Vec<String> = text
        .split_whitespace()
        .take(3)
        .map(|w| w.to_ascii_uppercase())
        .collect();
    let words: Vec<&str> = words.iter().map(String::as_str).collect();

    match words.as_slice() {
        ["BEGIN"] | ["BEGIN", "WORK"] => StatementKind::Begin,
        ["START", "TRANSACTION", ..] => StatementKind::Begin,
        ["COMMIT", ..] if !chains(text) => StatementKind::Commit,
        ["ROLLBACK", "TO", ..] | ["ROLLBACK", "WORK", "TO"] => StatementKind::Other,
        ["ROLLBACK", ..] if !chains(text) => StatementKind::Rollback,
        ["USE", _, ..] => StatementKind::UseSchema(unquote_identifier(&text[3..]).to_string()),
        ["SHOW", "PROXY", "BACKEND"] => StatementKind::ShowProxyBackend,
        ["SET", ..] => match parse_autocommit(&text[3..]) {
            Some(enabled) => StatementKind::SetAutocommit(enabled),
            None => StatementKind::Other,
        },
        _ => StatementKind::Other,
    }
}

/// `COMMIT AND CHAIN` opens a new transaction immediately
fn chains(text: &str) -> bool {
    let upper = text.to_ascii_uppercase();
    upper.contains("AND CHAIN") && !upper.contains("AND NO CHAIN")
}

fn unquote_identifier(name: &str) -> &str {
    let name = name.trim();
    name.strip_prefix('`')
        .and_then(|n| n.strip_suffix('`'))
        .unwrap_or(name)
}

/// Value of the last `autocommit` assignment in a SET list
fn parse_autocommit(assignments: &str) -> Option<bool> {
    let mut result = None;
    for part in assignments.split(',') {
        let compact: String = part
            .chars()
            .filter(|c| !c.is_whitespace() && *c != '\'' && *c != '"')
            .collect::<String>()
            .to_ascii_lowercase();
        let name_value = ["@@session.", "@@local.", "@@", "session", "local"]
            .iter()
            .find_map(|prefix| compact.strip_prefix(prefix))
            .unwrap_or(compact.as_str());
        let value = match name_value.strip_prefix("autocommit=") {
            Some(value) => value,
            None => continue,
        };
        result = match value {
            "0" | "off" | "false" => Some(false),
            "1" | "on" | "true" => Some(true),
            _ => result,
        };
    }
    result
}
