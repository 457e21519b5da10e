//! Integration Tests for the Mutation Lifecycle
//!
//! Exercises the write path through the client and observer APIs:
//! execution, retry defaults, live counts, observer delivery, cache
//! invalidation after settlement, and retention.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use requery::{
    query_key, GcTime, MutationObserver, MutationOptions, MutationStatus, QueryClient,
    QueryFilters, RetryDelay, RetryPolicy,
};
use serde_json::json;
use tokio::time::sleep;

// == Helper Functions ==

/// Options whose mutation function counts invocations and echoes the
/// variables back.
fn echo_options(calls: Arc<AtomicUsize>) -> MutationOptions {
    MutationOptions::new().with_mutation_fn(move |variables, _ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!({ "saved": variables }))
        }
    })
}

// == Execution ==

#[tokio::test]
async fn test_execute_mutation_returns_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let data = client
        .execute_mutation(echo_options(calls.clone()), json!({ "title": "new" }))
        .await
        .unwrap();

    assert_eq!(data, json!({ "saved": { "title": "new" } }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_mutations_never_retry_by_default() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = MutationOptions::new().with_mutation_fn({
        let calls = calls.clone();
        move |_variables, _ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err("write failed".into())
            }
        }
    });

    let result = client.execute_mutation(options, json!(null)).await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_opt_in_retry_applies_to_writes() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = MutationOptions::new()
        .with_retry(
            RetryPolicy::count(2).with_delay(RetryDelay::Fixed(Duration::from_millis(1))),
        )
        .with_mutation_fn({
            let calls = calls.clone();
            move |_variables, _ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("still failing".into())
                }
            }
        });

    let result = client.execute_mutation(options, json!(null)).await;
    assert!(result.is_err());
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_each_invocation_runs_independently() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = echo_options(calls.clone()).with_key(query_key!["todo-add"]);

    client.execute_mutation(options.clone(), json!(1)).await.unwrap();
    client.execute_mutation(options, json!(2)).await.unwrap();

    // No dedup on the write path: two invocations, two retained entries
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(client.mutation_cache().len(), 2);
}

// == Live Counts ==

#[tokio::test]
async fn test_is_mutating_counts_pending_writes() {
    let client = QueryClient::new();

    let options = MutationOptions::new().with_mutation_fn(|_variables, _ctx| async {
        sleep(Duration::from_millis(100)).await;
        Ok(json!(null))
    });

    let mutate_client = client.clone();
    let task = tokio::spawn(async move {
        mutate_client.execute_mutation(options, json!(null)).await
    });
    sleep(Duration::from_millis(20)).await;

    assert_eq!(client.is_mutating(), 1);
    task.await.unwrap().unwrap();
    assert_eq!(client.is_mutating(), 0);
}

// == Observer Delivery ==

#[tokio::test]
async fn test_observer_delivers_pending_then_success() {
    let client = QueryClient::new();
    let results = Arc::new(Mutex::new(Vec::new()));

    let options = MutationOptions::new().with_mutation_fn(|variables, _ctx| async move {
        sleep(Duration::from_millis(20)).await;
        Ok(variables)
    });

    let observer = MutationObserver::new(&client, options);
    let seen = results.clone();
    let _handle = observer.subscribe(move |result| seen.lock().push(result));

    assert!(observer.current_result().is_idle());
    let data = observer.mutate(json!({ "id": 9 })).await.unwrap();
    assert_eq!(data, json!({ "id": 9 }));

    let results = results.lock();
    assert!(results.iter().any(|r| r.is_pending()));
    let last = results.last().unwrap();
    assert!(last.is_success());
    assert_eq!(last.variables, Some(json!({ "id": 9 })));
}

#[tokio::test]
async fn test_failed_mutation_surfaces_error_state() {
    let client = QueryClient::new();

    let options = MutationOptions::new()
        .with_mutation_fn(|_variables, _ctx| async { Err("conflict".into()) });

    let observer = MutationObserver::new(&client, options);
    let _handle = observer.subscribe(|_result| {});
    let result = observer.mutate(json!(null)).await;
    assert!(result.is_err());

    let current = observer.current_result();
    assert!(current.is_error());
    assert_eq!(current.error.unwrap().message, "conflict");
}

// == Write-Then-Invalidate ==

#[tokio::test]
async fn test_settled_write_drives_read_path_invalidation() {
    let client = QueryClient::new();
    let fetches = Arc::new(AtomicUsize::new(0));

    let list_key = query_key!["todos"];
    let list_options = requery::QueryOptions::new(list_key.clone()).with_fetcher({
        let fetches = fetches.clone();
        move |_ctx| {
            let fetches = fetches.clone();
            async move {
                fetches.fetch_add(1, Ordering::SeqCst);
                Ok(json!([]))
            }
        }
    });
    client.fetch_query(list_options).await.unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    client
        .execute_mutation(echo_options(calls), json!({ "title": "x" }))
        .await
        .unwrap();
    client.invalidate_queries(&QueryFilters::key(list_key.clone()));

    let state = client.get_query_state(&list_key).unwrap();
    assert!(state.is_invalidated);
    assert_eq!(fetches.load(Ordering::SeqCst), 1);
}

// == Retention ==

#[tokio::test]
async fn test_settled_unobserved_mutation_is_garbage_collected() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = echo_options(calls).with_gc_time(GcTime::After(Duration::from_millis(30)));
    client.execute_mutation(options, json!(null)).await.unwrap();
    assert_eq!(client.mutation_cache().len(), 1);

    sleep(Duration::from_millis(100)).await;
    assert!(client.mutation_cache().is_empty());
}

#[tokio::test]
async fn test_unexecutable_mutation_is_garbage_collected() {
    let client = QueryClient::new();

    // No mutation function: execution fails fast before any settlement
    let options = MutationOptions::new().with_gc_time(GcTime::After(Duration::from_millis(30)));
    let result = client.execute_mutation(options, json!(null)).await;
    assert!(result.is_err());
    assert_eq!(client.mutation_cache().len(), 1);

    sleep(Duration::from_millis(100)).await;
    assert!(client.mutation_cache().is_empty());
}

#[tokio::test]
async fn test_tagged_mutations_match_key_filters() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    client
        .execute_mutation(
            echo_options(calls.clone()).with_key(query_key!["todo", "add"]),
            json!(1),
        )
        .await
        .unwrap();
    client
        .execute_mutation(echo_options(calls), json!(2))
        .await
        .unwrap();

    let filters = requery::MutationFilters::key(query_key!["todo"]);
    assert_eq!(client.mutation_cache().find_all(&filters).len(), 1);

    let settled = requery::MutationFilters::default().with_status(MutationStatus::Success);
    assert_eq!(client.mutation_cache().find_all(&settled).len(), 2);
}
