use std::collections::BTreeSet;

use bookscout_core::{recommend, Item, RecommendRequest, Strategy};
use criterion::{criterion_group, criterion_main, Criterion};

const TITLES: &[&str] = &[
    "Desert Planet",
    "Orbital Mechanics",
    "Garden of Forking Paths",
    "Murder on the Line",
    "Voyage Out",
    "Storm Season",
    "Circuit Breaker",
    "Collected Poetry",
];

const TOPICS: &[&str] = &["scifi", "mystery", "poetry", "history"];

fn mk_item(index: usize) -> Item {
    Item {
        id: format!("item{index}"),
        title: TITLES[index % TITLES.len()].to_string(),
        author: format!("Author {}", index % 50),
        topic: TOPICS[index % TOPICS.len()].to_string(),
    }
}

fn bench_content(c: &mut Criterion) {
    let corpus = (0..1_000).map(mk_item).collect::<Vec<_>>();
    let history: BTreeSet<String> = (0..20).map(|index| format!("item{index}")).collect();
    let request = RecommendRequest { strategy: Strategy::Content, query: None, count: 5 };

    c.bench_function("content_recommendation_1000_items", |b| {
        b.iter(|| {
            let outcome = recommend(&corpus, &history, &request);
            if let Err(err) = outcome {
                panic!("content benchmark recommendation failed: {err}");
            }
        });
    });
}

fn bench_query(c: &mut Criterion) {
    let corpus = (0..1_000).map(mk_item).collect::<Vec<_>>();
    let history = BTreeSet::new();
    let request = RecommendRequest {
        strategy: Strategy::Query,
        query: Some("desert storm poetry".to_string()),
        count: 5,
    };

    c.bench_function("query_recommendation_1000_items", |b| {
        b.iter(|| {
            let outcome = recommend(&corpus, &history, &request);
            if let Err(err) = outcome {
                panic!("query benchmark recommendation failed: {err}");
            }
        });
    });
}

criterion_group!(engine_benches, bench_content, bench_query);
criterion_main!(engine_benches);
