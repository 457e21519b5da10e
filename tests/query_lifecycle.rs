//! Integration Tests for the Query Lifecycle
//!
//! Exercises fetching, deduplication, staleness, retries, cancellation,
//! invalidation, observer delivery and garbage collection through the
//! public client API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::Mutex;
use requery::{
    query_key, FetchStatus, GcTime, QueryClient, QueryFilters, QueryObserver, QueryOptions,
    QueryStatus, RetryDelay, RetryPolicy, StaleTime,
};
use serde_json::json;
use tokio::time::sleep;

// == Helper Functions ==

/// Options whose fetcher counts invocations and resolves to `"ok"`.
fn counting_options(key: requery::QueryKey, calls: Arc<AtomicUsize>) -> QueryOptions {
    QueryOptions::new(key).with_fetcher(move |_ctx| {
        let calls = calls.clone();
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(json!("ok"))
        }
    })
}

fn fast_retry(count: u32) -> RetryPolicy {
    RetryPolicy::count(count).with_delay(RetryDelay::Fixed(Duration::from_millis(1)))
}

// == Fetch and Dedup ==

#[tokio::test]
async fn test_fetch_query_returns_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let data = client
        .fetch_query(counting_options(query_key!["user", 1], calls.clone()))
        .await
        .unwrap();

    assert_eq!(data, json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    let state = client.get_query_state(&query_key!["user", 1]).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.fetch_status, FetchStatus::Idle);
}

#[tokio::test]
async fn test_concurrent_fetches_share_one_invocation() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let key = query_key!["users"];
    let options = QueryOptions::new(key).with_fetcher({
        let calls = calls.clone();
        move |_ctx| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                sleep(Duration::from_millis(50)).await;
                Ok(json!([1, 2, 3]))
            }
        }
    });

    let futures = (0..10).map(|_| client.fetch_query(options.clone()));
    let results = join_all(futures).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), json!([1, 2, 3]));
    }
}

#[tokio::test]
async fn test_fresh_data_short_circuits_refetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counting_options(query_key!["fresh"], calls.clone())
        .with_stale_time(StaleTime::After(Duration::from_secs(60)));

    client.fetch_query(options.clone()).await.unwrap();
    let data = client.fetch_query(options).await.unwrap();

    assert_eq!(data, json!("ok"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_stale_data_refetches() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    // Default stale time is zero: data is stale the moment it settles
    let options = counting_options(query_key!["stale"], calls.clone());

    client.fetch_query(options.clone()).await.unwrap();
    client.fetch_query(options).await.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_prefetch_then_mounts_across_stale_horizon() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counting_options(query_key!["warm"], calls.clone())
        .with_stale_time(StaleTime::After(Duration::from_millis(100)));

    client.prefetch_query(options.clone()).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    // Mounting within the horizon reads the warm data without fetching
    let first = QueryObserver::new(&client, options.clone());
    let _first_handle = first.subscribe(|_result| {});
    sleep(Duration::from_millis(20)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(first.current_result().is_success());

    // Mounting past the horizon triggers a background refetch
    sleep(Duration::from_millis(150)).await;
    let second = QueryObserver::new(&client, options);
    let _second_handle = second.subscribe(|_result| {});
    sleep(Duration::from_millis(50)).await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_remove_queries_drops_matching_entries() {
    let client = QueryClient::new();
    client.set_query_data(query_key!["todos", 1], |_| json!(1));
    client.set_query_data(query_key!["todos", 2], |_| json!(2));
    client.set_query_data(query_key!["users", 1], |_| json!(3));

    client.remove_queries(&QueryFilters::key(query_key!["todos"]));

    assert_eq!(client.query_cache().len(), 1);
    assert!(client.get_query_data(&query_key!["todos", 1]).is_none());
    assert_eq!(client.get_query_data(&query_key!["users", 1]), Some(json!(3)));
}

// == Retry ==

#[tokio::test]
async fn test_retry_exhaustion_settles_with_error() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = QueryOptions::new(query_key!["flaky"])
        .with_retry(fast_retry(2))
        .with_fetcher({
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom".into())
                }
            }
        });

    let result = client.fetch_query(options).await;
    assert!(result.is_err());
    // Initial attempt plus two retries
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let state = client.get_query_state(&query_key!["flaky"]).unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    assert_eq!(state.failure_count, 3);
    assert!(state.data.is_none());
    assert_eq!(state.error.unwrap().message, "boom");
}

#[tokio::test]
async fn test_error_after_success_keeps_previous_data() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = QueryOptions::new(query_key!["degrading"])
        .with_retry(RetryPolicy::never())
        .with_fetcher({
            let calls = calls.clone();
            move |_ctx| {
                let calls = calls.clone();
                async move {
                    if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                        Ok(json!({ "v": 1 }))
                    } else {
                        Err("down".into())
                    }
                }
            }
        });

    client.fetch_query(options.clone()).await.unwrap();
    let result = client.fetch_query(options).await;
    assert!(result.is_err());

    let state = client.get_query_state(&query_key!["degrading"]).unwrap();
    assert_eq!(state.status, QueryStatus::Error);
    // The last good data stays visible alongside the error
    assert_eq!(state.data, Some(json!({ "v": 1 })));
    assert!(state.error.is_some());
}

// == Cancellation ==

#[tokio::test]
async fn test_cancel_reverts_to_idle_without_touching_data() {
    let client = QueryClient::new();

    let key = query_key!["slow"];
    let options = QueryOptions::new(key.clone()).with_fetcher(|_ctx| async {
        sleep(Duration::from_secs(60)).await;
        Ok(json!("never"))
    });

    let fetch_client = client.clone();
    let fetch = tokio::spawn(async move { fetch_client.fetch_query(options).await });
    sleep(Duration::from_millis(20)).await;

    assert_eq!(
        client.get_query_state(&key).unwrap().fetch_status,
        FetchStatus::Fetching
    );

    client.cancel_queries(&QueryFilters::key(key.clone()));
    let result = fetch.await.unwrap();
    assert!(result.is_err());

    let state = client.get_query_state(&key).unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(state.status, QueryStatus::Pending);
}

// == Imperative Writes ==

#[tokio::test]
async fn test_set_query_data_creates_and_updates() {
    let client = QueryClient::new();
    let key = query_key!["counter"];

    let first = client.set_query_data(key.clone(), |prev| {
        assert!(prev.is_none());
        json!(1)
    });
    assert_eq!(first, json!(1));

    let second = client.set_query_data(key.clone(), |prev| {
        json!(prev.unwrap().as_i64().unwrap() + 1)
    });
    assert_eq!(second, json!(2));
    assert_eq!(client.get_query_data(&key), Some(json!(2)));

    let state = client.get_query_state(&key).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
}

#[tokio::test]
async fn test_batched_writes_coalesce_into_one_delivery() {
    let client = QueryClient::new();
    let key = query_key!["count"];
    let deliveries = Arc::new(AtomicUsize::new(0));

    let observer = QueryObserver::new(&client, QueryOptions::new(key.clone()));
    let counter = deliveries.clone();
    let _handle = observer.subscribe(move |_result| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let bump =
        |prev: Option<serde_json::Value>| json!(prev.and_then(|v| v.as_i64()).unwrap_or(0) + 1);
    let final_value = client.batch(|| {
        client.set_query_data(key.clone(), bump);
        client.set_query_data(key.clone(), bump)
    });

    assert_eq!(final_value, json!(2));
    assert_eq!(client.get_query_data(&key), Some(json!(2)));
    // Two writes, one coalesced delivery carrying the final state
    assert_eq!(deliveries.load(Ordering::SeqCst), 1);
    assert_eq!(observer.current_result().data, Some(json!(2)));
}

// == Supersession ==

#[tokio::test]
async fn test_refetch_supersedes_in_flight_fetch() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));
    let key = query_key!["race"];

    let options = QueryOptions::new(key.clone()).with_fetcher({
        let calls = calls.clone();
        move |_ctx| {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if n == 0 {
                    sleep(Duration::from_millis(40)).await;
                    Ok(json!("first"))
                } else {
                    sleep(Duration::from_millis(100)).await;
                    Ok(json!("second"))
                }
            }
        }
    });

    let join_client = client.clone();
    let join_options = options.clone();
    let first = tokio::spawn(async move { join_client.fetch_query(join_options).await });
    sleep(Duration::from_millis(10)).await;

    client.refetch_queries(&QueryFilters::exact(key.clone()));
    // The superseded fetch resolves as cancelled for its joiners
    assert!(first.await.unwrap().is_err());

    // The superseded fetch's settlement must not touch the fetch that
    // replaced it: the entry is still fetching the second request
    sleep(Duration::from_millis(50)).await;
    let state = client.get_query_state(&key).unwrap();
    assert_eq!(state.fetch_status, FetchStatus::Fetching);
    assert!(state.data.is_none());

    sleep(Duration::from_millis(100)).await;
    let state = client.get_query_state(&key).unwrap();
    assert_eq!(state.status, QueryStatus::Success);
    assert_eq!(state.data, Some(json!("second")));
    assert_eq!(state.fetch_status, FetchStatus::Idle);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// == Invalidation ==

#[tokio::test]
async fn test_invalidate_refetches_only_observed_entries() {
    let client = QueryClient::new();
    let observed_calls = Arc::new(AtomicUsize::new(0));
    let unobserved_calls = Arc::new(AtomicUsize::new(0));

    client
        .fetch_query(counting_options(query_key!["todos", 1], observed_calls.clone()))
        .await
        .unwrap();
    client
        .fetch_query(counting_options(query_key!["todos", 2], unobserved_calls.clone()))
        .await
        .unwrap();

    let observer = QueryObserver::new(
        &client,
        counting_options(query_key!["todos", 1], observed_calls.clone())
            .with_stale_time(StaleTime::After(Duration::from_secs(60))),
    );
    let _handle = observer.subscribe(|_result| {});
    sleep(Duration::from_millis(20)).await;
    let baseline = observed_calls.load(Ordering::SeqCst);

    // Prefix filter hits both entries
    client.invalidate_queries(&QueryFilters::key(query_key!["todos"]));
    sleep(Duration::from_millis(50)).await;

    assert_eq!(observed_calls.load(Ordering::SeqCst), baseline + 1);
    assert_eq!(unobserved_calls.load(Ordering::SeqCst), 1);
    // The unobserved entry is marked stale for its next access
    let unobserved = client.get_query_state(&query_key!["todos", 2]).unwrap();
    assert!(unobserved.is_invalidated);
}

// == Observer Delivery ==

#[tokio::test]
async fn test_observer_delivers_loading_then_success() {
    let client = QueryClient::new();
    let results = Arc::new(Mutex::new(Vec::new()));

    let options = QueryOptions::new(query_key!["profile"]).with_fetcher(|_ctx| async {
        sleep(Duration::from_millis(20)).await;
        Ok(json!({ "name": "ada" }))
    });

    let observer = QueryObserver::new(&client, options);
    let seen = results.clone();
    let _handle = observer.subscribe(move |result| seen.lock().push(result));
    sleep(Duration::from_millis(100)).await;

    let results = results.lock();
    assert!(results.iter().any(|r| r.is_loading()));
    let last = results.last().unwrap();
    assert!(last.is_success());
    assert_eq!(last.data, Some(json!({ "name": "ada" })));
    assert_eq!(last.fetch_status, FetchStatus::Idle);
}

#[tokio::test]
async fn test_select_transforms_observer_data() {
    let client = QueryClient::new();

    let options = QueryOptions::new(query_key!["list"])
        .with_fetcher(|_ctx| async { Ok(json!([1, 2, 3])) })
        .with_select(|value| json!(value.as_array().map_or(0, Vec::len)));

    let observer = QueryObserver::new(&client, options);
    let _handle = observer.subscribe(|_result| {});
    sleep(Duration::from_millis(50)).await;

    let result = observer.current_result();
    assert!(result.is_success());
    assert_eq!(result.data, Some(json!(3)));
}

#[tokio::test]
async fn test_keep_previous_data_across_key_switch() {
    let client = QueryClient::new();

    let page = |n: i64| {
        QueryOptions::new(query_key!["page", n])
            .with_keep_previous_data(true)
            .with_fetcher(move |_ctx| async move {
                sleep(Duration::from_millis(30)).await;
                Ok(json!({ "page": n }))
            })
    };

    let observer = QueryObserver::new(&client, page(1));
    let _handle = observer.subscribe(|_result| {});
    sleep(Duration::from_millis(100)).await;
    assert_eq!(observer.current_result().data, Some(json!({ "page": 1 })));

    observer.set_options(page(2));
    let during = observer.current_result();
    assert!(during.is_placeholder_data);
    assert_eq!(during.data, Some(json!({ "page": 1 })));
    assert!(during.is_success());

    sleep(Duration::from_millis(100)).await;
    let after = observer.current_result();
    assert!(!after.is_placeholder_data);
    assert_eq!(after.data, Some(json!({ "page": 2 })));
}

// == Garbage Collection ==

#[tokio::test]
async fn test_unobserved_entry_is_garbage_collected() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = counting_options(query_key!["ephemeral"], calls)
        .with_gc_time(GcTime::After(Duration::from_millis(30)));
    client.fetch_query(options).await.unwrap();
    assert_eq!(client.query_cache().len(), 1);

    sleep(Duration::from_millis(100)).await;
    assert!(client.query_cache().is_empty());
}

#[tokio::test]
async fn test_attached_observer_disarms_gc() {
    let client = QueryClient::new();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = counting_options(query_key!["kept"], calls)
        .with_gc_time(GcTime::After(Duration::from_millis(30)));
    let observer = QueryObserver::new(&client, options);
    let handle = observer.subscribe(|_result| {});

    sleep(Duration::from_millis(100)).await;
    assert_eq!(client.query_cache().len(), 1);

    // Dropping the last observer arms the timer again
    drop(handle);
    sleep(Duration::from_millis(100)).await;
    assert!(client.query_cache().is_empty());
}

// == Signal-Driven Refetch ==

#[tokio::test]
async fn test_focus_regain_refetches_stale_observed_entries() {
    let client = QueryClient::new();
    client.mount();
    let calls = Arc::new(AtomicUsize::new(0));

    let observer = QueryObserver::new(&client, counting_options(query_key!["feed"], calls.clone()));
    let _handle = observer.subscribe(|_result| {});
    sleep(Duration::from_millis(50)).await;
    let baseline = calls.load(Ordering::SeqCst);

    client.focus_signal().set(false);
    client.focus_signal().set(true);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), baseline + 1);
    client.unmount();
}

#[tokio::test]
async fn test_focus_regain_skips_fresh_entries() {
    let client = QueryClient::new();
    client.mount();
    let calls = Arc::new(AtomicUsize::new(0));

    let options = counting_options(query_key!["fresh-feed"], calls.clone())
        .with_stale_time(StaleTime::After(Duration::from_secs(60)));
    let observer = QueryObserver::new(&client, options);
    let _handle = observer.subscribe(|_result| {});
    sleep(Duration::from_millis(50)).await;

    client.focus_signal().set(false);
    client.focus_signal().set(true);
    sleep(Duration::from_millis(50)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    client.unmount();
}

// == Reset and Counts ==

#[tokio::test]
async fn test_reset_restores_initial_data() {
    let client = QueryClient::new();
    let key = query_key!["settings"];

    // Build the entry with seeded data, then overwrite it
    let options = QueryOptions::new(key.clone()).with_initial_data(json!({ "theme": "light" }));
    let _observer = QueryObserver::new(&client, options);
    client.set_query_data(key.clone(), |_| json!({ "theme": "dark" }));
    assert_eq!(client.get_query_data(&key), Some(json!({ "theme": "dark" })));

    client.reset_queries(&QueryFilters::exact(key.clone()));
    assert_eq!(client.get_query_data(&key), Some(json!({ "theme": "light" })));
}

#[tokio::test]
async fn test_is_fetching_counts_in_flight_entries() {
    let client = QueryClient::new();

    let options = QueryOptions::new(query_key!["slow-count"]).with_fetcher(|_ctx| async {
        sleep(Duration::from_millis(100)).await;
        Ok(json!(null))
    });

    let fetch_client = client.clone();
    let fetch = tokio::spawn(async move { fetch_client.fetch_query(options).await });
    sleep(Duration::from_millis(20)).await;

    assert_eq!(client.is_fetching(&QueryFilters::default()), 1);
    fetch.await.unwrap().unwrap();
    assert_eq!(client.is_fetching(&QueryFilters::default()), 0);
}
