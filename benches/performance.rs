use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use ruta::core::registry::BackendRegistry;
use ruta::core::{Backend, PoolRole};
use ruta::routing::balancer::{Candidate, LoadBalancingAlgorithm, Selection};
use ruta::routing::rules::{MatchKind, RoutingRule, RuleMatcher, RuleTable};
use ruta::routing::{statement, Router};
use std::sync::Arc;
use tokio::runtime::Runtime;

const STATEMENTS: [&str; 6] = [
    "SELECT id, name FROM users WHERE id = 42",
    "select * from orders where user_id = 7 for update",
    "/* app:checkout */ INSERT INTO orders (user_id, total) VALUES (7, 19.90)",
    "UPDATE users SET last_login = NOW() WHERE id = 42",
    "  BEGIN",
    "SHOW TABLES",
];

fn demo_rules() -> RuleTable {
    let table = RuleTable::new();
    let rules = [
        (1, MatchKind::Regex, "^SELECT.*FOR UPDATE", 10),
        (2, MatchKind::Regex, "^SELECT", 20),
    ];
    for (id, kind, pattern, dest) in rules {
        let matcher = RuleMatcher::new(kind, pattern).unwrap();
        table.add(RoutingRule::new(id, matcher, dest)).unwrap();
    }
    table
}

async fn demo_registry(readers: usize) -> Arc<BackendRegistry> {
    let registry = Arc::new(BackendRegistry::new());
    registry.add_pool(10, "writer", PoolRole::Writer).await.unwrap();
    registry.add_pool(20, "readers", PoolRole::Reader).await.unwrap();
    registry
        .register(Backend::new("primary", "10.0.0.1:3306", 10))
        .await
        .unwrap();
    for i in 0..readers {
        registry
            .register(Backend::new(format!("replica-{}", i), format!("10.0.1.{}:3306", i), 20))
            .await
            .unwrap();
    }
    registry
}

/// Statement classification benchmarks
fn bench_classification(c: &mut Criterion) {
    let mut group = c.benchmark_group("classification");

    group.bench_function("normalize", |b| {
        b.iter(|| {
            for sql in STATEMENTS {
                black_box(statement::normalize(sql));
            }
        });
    });

    group.bench_function("statement_kind", |b| {
        b.iter(|| {
            for sql in STATEMENTS {
                black_box(statement::statement_kind(sql));
            }
        });
    });

    let rules = demo_rules();
    group.bench_function("rule_table_classify", |b| {
        b.iter(|| {
            for sql in STATEMENTS {
                black_box(rules.classify(sql));
            }
        });
    });

    group.finish();
}

/// Backend selection benchmarks
fn bench_selection(c: &mut Criterion) {
    let rt = Runtime::new().unwrap();
    let mut group = c.benchmark_group("selection");

    for count in [2usize, 8, 32] {
        for selection in [Selection::WeightedRoundRobin, Selection::WeightedRandom] {
            let balancer = selection.build();
            let candidates: Vec<Candidate> = (0..count)
                .map(|i| Candidate::new(format!("replica-{}", i), (i % 3 + 1) as u32, i % 4))
                .collect();
            group.bench_with_input(
                BenchmarkId::new(format!("{:?}", selection), count),
                &candidates,
                |b, candidates| {
                    b.iter(|| black_box(balancer.select(candidates)));
                },
            );
        }

        let registry = rt.block_on(demo_registry(count));
        let router = Router::new(registry, Arc::new(demo_rules()), Selection::default());
        group.bench_with_input(
            BenchmarkId::new("route_and_select", count),
            &count,
            |b, _| {
                b.to_async(&rt).iter(|| async {
                    let pool = router.classify("SELECT * FROM users").await.unwrap();
                    black_box(router.select_backend(pool).await.unwrap());
                });
            },
        );
    }

    group.finish();
}

criterion_group!(benches, bench_classification, bench_selection);
criterion_main!(benches);
