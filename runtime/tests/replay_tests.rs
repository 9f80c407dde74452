//! Integration tests for history replay.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)] // Test code can use unwrap/expect/panic

use denormalizer_core::config::DenormalizerConfig;
use denormalizer_core::{Event, EventTarget, ViewModel};
use denormalizer_runtime::{Collection, Denormalizer, DispatchTree, GuardOutcome, ViewBuilder};
use denormalizer_testing::{
    EventBuilder, FlakyRepository, InMemoryDispatchQueue, InMemoryRepository, InMemoryRevisionStore,
    init_tracing,
};
use serde_json::{Value, json};
use std::sync::Arc;
use tokio_test::assert_err;

// ============================================================================
// Test Fixtures
// ============================================================================

struct Fixture {
    denormalizer: Denormalizer,
    documents: InMemoryRepository,
    stats: InMemoryRepository,
    revisions: InMemoryRevisionStore,
}

/// `documents` is maintained by a prioritized builder, `stats` by an
/// unordered one, both from the same document events.
fn fixture(config: DenormalizerConfig) -> Fixture {
    init_tracing();
    let documents = InMemoryRepository::new();
    let stats = InMemoryRepository::new();
    let revisions = InMemoryRevisionStore::new();

    let documents_collection = Arc::new(Collection::new("documents", Arc::new(documents.clone())));
    let stats_collection =
        Arc::new(Collection::new("stats", Arc::new(stats.clone())).with_defaults(json!({ "changes": 0 })));

    let tree = DispatchTree::builder()
        .view_builder(
            ViewBuilder::new(EventTarget::new("created").aggregate("document"), Arc::clone(&documents_collection))
                .with_priority(1)
                .with_handler(|event, vm| {
                    vm.set("title", event.get("payload.title").cloned().unwrap_or_default());
                    vm.set("state", json!("draft"));
                    Ok(())
                }),
        )
        .view_builder(
            ViewBuilder::new(EventTarget::new("changed").aggregate("document"), Arc::clone(&documents_collection))
                .with_priority(1)
                .with_handler(|event, vm| {
                    vm.set("title", event.get("payload.title").cloned().unwrap_or_default());
                    Ok(())
                }),
        )
        .view_builder(
            ViewBuilder::new(EventTarget::new("flushed").aggregate("document"), documents_collection)
                .with_priority(1)
                .with_handler(|_, vm| {
                    vm.set("state", json!("published"));
                    Ok(())
                }),
        )
        .view_builder(
            ViewBuilder::new(EventTarget::new("changed").aggregate("document"), Arc::clone(&stats_collection))
                .with_handler(count_change),
        )
        .view_builder(
            ViewBuilder::new(EventTarget::new("flushed").aggregate("document"), stats_collection)
                .with_handler(count_change),
        );

    let (denormalizer, _signals) = Denormalizer::builder()
        .config(config)
        .dispatch_tree(tree)
        .revision_store(Arc::new(revisions.clone()))
        .dispatch_queue(Arc::new(InMemoryDispatchQueue::new()))
        .build()
        .unwrap();

    Fixture {
        denormalizer,
        documents,
        stats,
        revisions,
    }
}

fn count_change(_: &Event, vm: &mut ViewModel) -> anyhow::Result<()> {
    let changes = vm.get("changes").and_then(Value::as_u64).unwrap_or(0);
    vm.set("changes", json!(changes + 1));
    Ok(())
}

fn history() -> Vec<Event> {
    vec![
        EventBuilder::new("created")
            .id("ev-1")
            .aggregate("document", "d1")
            .revision(1)
            .payload(json!({ "title": "Draft" }))
            .build(),
        EventBuilder::new("changed")
            .id("ev-2")
            .aggregate("document", "d1")
            .revision(2)
            .payload(json!({ "title": "Final" }))
            .build(),
        EventBuilder::new("flushed")
            .id("ev-3")
            .aggregate("document", "d1")
            .revision(2)
            .build(),
    ]
}

fn snapshot(repo: &InMemoryRepository, id: &str) -> Option<Value> {
    repo.get_stored(id).map(|vm| vm.attributes().clone())
}

// ============================================================================
// Tests
// ============================================================================

#[tokio::test]
async fn batch_and_streamed_replay_reach_the_same_state() {
    let batch = fixture(DenormalizerConfig::default());
    let batch_summary = batch.denormalizer.replay(history()).await.unwrap();

    let streamed = fixture(DenormalizerConfig::default());
    let mut stream = streamed.denormalizer.replay_streamed();
    for event in history() {
        stream.feed(event);
    }
    let streamed_summary = stream.finish().await.unwrap();

    assert_eq!(batch_summary, streamed_summary);
    assert_eq!(snapshot(&batch.documents, "d1"), snapshot(&streamed.documents, "d1"));
    assert_eq!(snapshot(&batch.stats, "d1"), snapshot(&streamed.stats, "d1"));

    assert_eq!(
        snapshot(&batch.documents, "d1"),
        Some(json!({ "title": "Final", "state": "published" }))
    );
    assert_eq!(snapshot(&batch.stats, "d1"), Some(json!({ "changes": 2 })));

    for run in [&batch, &streamed] {
        assert_eq!(run.revisions.revision("revision", "document::d1"), Some(3));
        assert_eq!(run.revisions.last_event("revision"), history().pop());
    }
}

#[tokio::test]
async fn prioritized_builders_run_as_separate_tasks() {
    let f = fixture(DenormalizerConfig::default());

    let summary = f.denormalizer.replay(history()).await.unwrap();

    // created: 1 builder; changed and flushed: 2 builders each, one prioritized
    assert_eq!(summary.events, 3);
    assert_eq!(summary.tasks, 5);
    assert_eq!(summary.aggregates, 1);
}

#[tokio::test]
async fn same_event_fed_twice_applies_once() {
    let f = fixture(DenormalizerConfig::default());
    let mut events = history();
    events.insert(2, events[1].clone());

    let summary = f.denormalizer.replay(events).await.unwrap();

    assert_eq!(summary.duplicates, 1);
    assert_eq!(snapshot(&f.stats, "d1"), Some(json!({ "changes": 2 })));
}

#[tokio::test]
async fn live_processing_resumes_after_replay() {
    let f = fixture(DenormalizerConfig::default());
    f.denormalizer.replay(history()).await.unwrap();

    let next = EventBuilder::new("changed")
        .id("ev-4")
        .aggregate("document", "d1")
        .revision(3)
        .payload(json!({ "title": "Revised" }))
        .build();
    let outcome = f.denormalizer.handle(next).await.unwrap();

    assert_eq!(outcome, GuardOutcome::Admitted { count: 1 });
    assert_eq!(snapshot(&f.documents, "d1").unwrap()["title"], json!("Revised"));
    assert_eq!(snapshot(&f.stats, "d1"), Some(json!({ "changes": 3 })));

    let stale = EventBuilder::new("changed").id("ev-2").aggregate("document", "d1").revision(2).build();
    assert_eq!(f.denormalizer.handle(stale).await.unwrap(), GuardOutcome::Stale);
}

#[tokio::test]
async fn bounded_batches_give_the_same_result() {
    let mut config = DenormalizerConfig::default();
    config.replay.batch_size = Some(1);
    let bounded = fixture(config);
    let unbounded = fixture(DenormalizerConfig::default());

    let many: Vec<Event> = (1..=20u64)
        .map(|n| {
            EventBuilder::new("created")
                .id(format!("ev-{n}"))
                .aggregate("document", format!("d{n}"))
                .revision(1)
                .payload(json!({ "title": format!("Doc {n}") }))
                .build()
        })
        .collect();

    bounded.denormalizer.replay(many.clone()).await.unwrap();
    unbounded.denormalizer.replay(many).await.unwrap();

    assert_eq!(bounded.documents.len(), 20);
    assert_eq!(bounded.documents.ids(), unbounded.documents.ids());
    assert_eq!(snapshot(&bounded.documents, "d7"), snapshot(&unbounded.documents, "d7"));
}

#[tokio::test]
async fn destroyed_then_recreated_during_replay_is_a_fresh_create() {
    let repo = InMemoryRepository::new();
    repo.insert(ViewModel::stored("t1", json!({ "label": "stale" }), 4));
    let tags = Arc::new(Collection::new("tags", Arc::new(repo.clone())));

    let tree = DispatchTree::builder()
        .view_builder(
            ViewBuilder::new(EventTarget::new("tagRemoved"), Arc::clone(&tags))
                .with_id_path("payload.tag")
                .with_handler(|_, vm| {
                    vm.destroy();
                    Ok(())
                }),
        )
        .view_builder(
            ViewBuilder::new(EventTarget::new("tagAdded"), tags)
                .with_id_path("payload.tag")
                .with_handler(|event, vm| {
                    assert!(vm.get("label").is_none(), "deleted view model must reload blank");
                    vm.set("label", event.get("payload.label").cloned().unwrap_or_default());
                    Ok(())
                }),
        );
    let (denormalizer, _signals) = Denormalizer::builder()
        .dispatch_tree(tree)
        .revision_store(Arc::new(InMemoryRevisionStore::new()))
        .dispatch_queue(Arc::new(InMemoryDispatchQueue::new()))
        .build()
        .unwrap();

    denormalizer
        .replay(vec![
            EventBuilder::new("tagRemoved").id("x1").payload(json!({ "tag": "t1" })).build(),
            EventBuilder::new("tagAdded")
                .id("x2")
                .payload(json!({ "tag": "t1", "label": "fresh" }))
                .build(),
        ])
        .await
        .unwrap();

    let stored = repo.get_stored("t1").unwrap();
    assert_eq!(stored.get("label"), Some(&json!("fresh")));
    assert_eq!(stored.revision(), Some(1));
}

#[tokio::test]
async fn failed_batch_commit_fails_the_replay_without_reapplying() {
    let repo = InMemoryRepository::new();
    let flaky = FlakyRepository::new(repo.clone(), 1).only_for("u1");
    let users = Arc::new(Collection::new("users", Arc::new(flaky)));

    let tree = DispatchTree::builder().view_builder(
        ViewBuilder::new(EventTarget::new("userSeen").aggregate("user"), users).with_handler(|_, vm| {
            let visits = vm.get("visits").and_then(Value::as_u64).unwrap_or(0);
            vm.set("visits", json!(visits + 1));
            Ok(())
        }),
    );
    let mut config = DenormalizerConfig::default();
    config.replay.batch_size = Some(2);
    let (denormalizer, _signals) = Denormalizer::builder()
        .config(config)
        .dispatch_tree(tree)
        .revision_store(Arc::new(InMemoryRevisionStore::new()))
        .dispatch_queue(Arc::new(InMemoryDispatchQueue::new()))
        .build()
        .unwrap();

    let events = ["u1", "u2"]
        .into_iter()
        .map(|user| {
            EventBuilder::new("userSeen")
                .id(format!("seen-{user}"))
                .aggregate("user", user)
                .revision(1)
                .build()
        })
        .collect();

    let err = assert_err!(denormalizer.replay(events).await);

    assert_eq!(err.errors.len(), 1);
    assert!(err.errors[0].is_concurrency_conflict());
    assert_eq!(err.summary.events, 2);
    assert!(repo.get_stored("u1").is_none());
    assert_eq!(repo.get_stored("u2").unwrap().get("visits"), Some(&json!(1)));
}
