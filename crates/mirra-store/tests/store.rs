//! Single-replica behaviour of the store: mutations, state access,
//! subscribers, reset and the commit log.

use mirra_store::{
    CommitOptions, CommitRecord, CoreError, Store, StoreError, Subscription, RESET_MUTATION,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio_test::{assert_err, assert_ok};

const TEST: &str = "TEST";

#[derive(Clone, Debug, Default, PartialEq)]
struct Counter {
    a: i64,
}

fn counter_store() -> Store<Counter> {
    Store::builder()
        .state(Counter { a: 1 })
        .mutation(TEST, |state: &mut Counter, n: &Value| {
            state.a += n.as_i64().unwrap_or(0)
        })
        .build()
        .unwrap()
}

#[test]
fn test_function_style_commit() {
    let store = counter_store();
    assert_ok!(store.commit(TEST, 2));
    assert_eq!(store.state().a, 3);
}

#[test]
fn test_object_style_commit() {
    let store: Store<Counter> = Store::builder()
        .state(Counter { a: 1 })
        .mutation(TEST, |state: &mut Counter, payload: &Value| {
            state.a += payload["amount"].as_i64().unwrap_or(0)
        })
        .build()
        .unwrap();

    assert_ok!(store.commit_with(json!({ "type": TEST, "amount": 2 }), CommitOptions::local()));
    assert_eq!(store.state().a, 3);
    assert_eq!(store.commit_log()[0].payload["amount"], json!(2));
}

#[test]
fn test_object_style_commit_requires_string_type() {
    let store = counter_store();
    let err = store.commit_with(json!({ "type": 3 }), CommitOptions::local()).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Core(CoreError::InvalidCommitShape(_))
    ));
    assert_eq!(store.state().a, 1);
}

#[test]
fn test_unknown_mutation_is_a_noop() {
    let store = counter_store();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    store.subscribe(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    assert_ok!(store.commit(TEST, 2));
    assert_eq!(store.state().a, 3);

    let err = store.commit("dec", 2).unwrap_err();
    assert!(err.is_unknown_mutation());
    assert_eq!(
        err,
        StoreError::Core(CoreError::UnknownMutationType("dec".to_string()))
    );
    assert_eq!(store.state().a, 3);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
    assert_eq!(store.commit_log().len(), 1);
}

#[test]
fn test_rejected_mutation_skips_log_and_subscribers() {
    let store: Store<Counter> = Store::builder()
        .state(Counter { a: 1 })
        .mutation("set_positive", |state: &mut Counter, n: &Value| {
            match n.as_i64() {
                Some(n) if n > 0 => {
                    state.a = n;
                    true
                }
                _ => false,
            }
        })
        .build()
        .unwrap();
    let notified = Arc::new(AtomicUsize::new(0));
    let counter = notified.clone();
    store.subscribe(move |_, _| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    let err = store.commit("set_positive", -5).unwrap_err();
    assert!(matches!(
        err,
        StoreError::Core(CoreError::MutationRejected(kind)) if kind == "set_positive"
    ));
    assert_eq!(store.state().a, 1);
    assert!(store.commit_log().is_empty());
    assert_eq!(notified.load(Ordering::SeqCst), 0);

    assert_ok!(store.commit("set_positive", 8));
    assert_eq!(store.state().a, 8);
    assert_eq!(notified.load(Ordering::SeqCst), 1);
}

#[test]
fn test_partial_mutation_kept_on_rejection() {
    let store: Store<Counter> = Store::builder()
        .state(Counter { a: 1 })
        .mutation("bump_then_refuse", |state: &mut Counter, _: &Value| {
            state.a += 10;
            false
        })
        .build()
        .unwrap();

    assert_err!(store.commit("bump_then_refuse", Value::Null));
    assert_eq!(store.state().a, 11);
}

#[test]
fn test_state_factory_runs_once() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counted = calls.clone();
    let store: Store<Counter> = Store::builder()
        .state_with(move || {
            counted.fetch_add(1, Ordering::SeqCst);
            Counter { a: 1 }
        })
        .mutation(TEST, |state: &mut Counter, n: &Value| {
            state.a += n.as_i64().unwrap_or(0)
        })
        .build()
        .unwrap();

    assert_ok!(store.commit(TEST, 2));
    store.reset();
    assert_eq!(store.state().a, 3);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_missing_state() {
    let result = Store::<Counter>::builder().build();
    assert!(matches!(result, Err(StoreError::MissingState)));
}

#[test]
fn test_direct_state_assignment_rejected() {
    let store = counter_store();
    let err = store.set_state(Counter { a: 42 }).unwrap_err();
    assert_eq!(err, StoreError::Core(CoreError::StateWriteViolation));
    assert_eq!(store.state().a, 1);
}

#[test]
fn test_replace_state_is_immediately_visible() {
    let store = counter_store();
    store.replace_state(Counter { a: 42 });
    assert_eq!(store.state().a, 42);

    assert_ok!(store.commit(TEST, 1));
    assert_eq!(store.state().a, 43);
    // replace_state does not go through the commit log
    assert_eq!(store.commit_log().len(), 1);
}

#[test]
fn test_snapshots_do_not_change_after_commit() {
    let store = counter_store();
    let before = store.state();
    assert_ok!(store.commit(TEST, 5));
    assert_eq!(before.a, 1);
    assert_eq!(store.state().a, 6);
}

#[test]
fn test_subscribers_receive_record_and_new_state() {
    let store = counter_store();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    store.subscribe(move |record, state: &Counter| {
        sink.lock().push((record.clone(), state.a));
    });

    assert_ok!(store.commit(TEST, 2));
    assert_ok!(store.commit(TEST, 3));

    assert_eq!(
        *seen.lock(),
        vec![
            (CommitRecord::new(TEST, json!(2)), 3),
            (CommitRecord::new(TEST, json!(3)), 6),
        ]
    );
}

#[test]
fn test_subscriber_unsubscribing_itself() {
    let store = counter_store();
    let calls = Arc::new(Mutex::new(Vec::new()));
    let own_handle: Arc<Mutex<Option<Subscription>>> = Arc::new(Mutex::new(None));

    let subscription = {
        let calls = calls.clone();
        let own_handle = own_handle.clone();
        store.subscribe(move |_, _| {
            calls.lock().push("first");
            if let Some(handle) = own_handle.lock().as_ref() {
                handle.unsubscribe();
            }
        })
    };
    *own_handle.lock() = Some(subscription);

    let later = calls.clone();
    store.subscribe(move |_, _| later.lock().push("second"));

    assert_ok!(store.commit(TEST, 1));
    assert_ok!(store.commit(TEST, 1));

    assert_eq!(*calls.lock(), vec!["first", "second", "second"]);
    assert_eq!(store.subscriber_count(), 1);
}

#[test]
fn test_subscriber_may_commit_again() {
    let store: Store<Counter> = Store::builder()
        .state(Counter { a: 0 })
        .mutation("inc", |state: &mut Counter, n: &Value| {
            state.a += n.as_i64().unwrap_or(0)
        })
        .mutation("double", |state: &mut Counter, _: &Value| state.a *= 2)
        .build()
        .unwrap();

    let handle = store.clone();
    store.subscribe(move |record, _| {
        if record.kind == "inc" {
            assert!(!handle.is_committing());
            handle.commit("double", Value::Null).unwrap();
        }
    });

    assert_ok!(store.commit("inc", 3));
    assert_eq!(store.state().a, 6);
    let kinds: Vec<_> = store.commit_log().into_iter().map(|r| r.kind).collect();
    assert_eq!(kinds, vec!["inc", "double"]);
    assert!(!store.is_committing());
}

#[test]
fn test_reset_keeps_data_and_mutations() {
    let store = counter_store();
    assert_eq!(store.state().a, 1);
    store.reset();
    assert_eq!(store.state().a, 1);
    assert_ok!(store.commit(TEST, 2));
    assert_eq!(store.state().a, 3);
}

#[test]
fn test_hot_reset_notifies_subscribers() {
    let store = counter_store();
    let kinds = Arc::new(Mutex::new(Vec::new()));
    let sink = kinds.clone();
    store.subscribe(move |record, _| sink.lock().push(record.kind.clone()));

    store.reset_hot();
    assert_eq!(store.state().a, 1);
    assert_eq!(*kinds.lock(), vec![RESET_MUTATION.to_string()]);
    assert!(store.commit_log().is_empty());

    assert_ok!(store.commit(TEST, 2));
    assert_eq!(store.state().a, 3);
}

#[test]
fn test_devtools_hook_subscribes() {
    let store: Store<Counter> = Store::builder()
        .state(Counter::default())
        .mutation(TEST, |state: &mut Counter, _: &Value| state.a += 1)
        .devtools(true)
        .build()
        .unwrap();
    assert_eq!(store.subscriber_count(), 1);
    assert_ok!(store.commit(TEST, Value::Null));
    assert_eq!(store.state().a, 1);
}

#[test]
fn test_plugins_run_once_at_build() {
    let runs = Arc::new(AtomicUsize::new(0));
    let counted = runs.clone();
    let store: Store<Counter> = Store::builder()
        .state(Counter::default())
        .mutation(TEST, |state: &mut Counter, _: &Value| state.a += 1)
        .plugin(move |store| {
            counted.fetch_add(1, Ordering::SeqCst);
            assert!(store.commit_log().is_empty());
            Ok(())
        })
        .build()
        .unwrap();

    assert_ok!(store.commit(TEST, Value::Null));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn test_failing_plugin_fails_build() {
    let result: Result<Store<Counter>, StoreError> = Store::builder()
        .state(Counter::default())
        .plugin(|_| Err(StoreError::MissingState))
        .build();
    assert!(matches!(result, Err(StoreError::MissingState)));
}

#[test]
fn test_fixed_client_id_and_mutation_types() {
    let store: Store<Counter> = Store::builder()
        .state(Counter::default())
        .client_id(mirra_store::ClientId::new("replica-1"))
        .mutation("b", |_: &mut Counter, _: &Value| {})
        .mutation("a", |_: &mut Counter, _: &Value| {})
        .build()
        .unwrap();
    assert_eq!(store.client_id().as_str(), "replica-1");
    assert_eq!(store.mutation_types(), vec!["a".to_string(), "b".to_string()]);
}
