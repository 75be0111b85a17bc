//! Integration tests for computation definition, binding, and caching.

use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use memovault::{Args, Computation, ConfigValue, Error, Key, Store};
use serde_json::json;

fn test_store() -> Store {
    Store::in_memory().expect("failed to create in-memory store")
}

// ---------------------------------------------------------------------------
// Basic caching
// ---------------------------------------------------------------------------

#[test]
fn identical_arguments_compute_once() {
    let store = test_store();
    let counter = Arc::new(Mutex::new(HashMap::<(i64, i64), u32>::new()));
    let seen = Arc::clone(&counter);
    let combine = Computation::builder("combine")
        .param("x")
        .param("y")
        .body(move |ctx| {
            let x = ctx.arg("x")?.as_i64().unwrap();
            let y = ctx.arg("y")?.as_i64().unwrap();
            *seen.lock().unwrap().entry((x, y)).or_insert(0) += 1;
            Ok(json!(x * 10 + y))
        })
        .build()
        .unwrap();

    let call = |x: i64, y: i64| {
        combine
            .call(&store, Args::new().set("x", x).set("y", y))
            .unwrap()
    };
    assert_eq!(call(10, 1), json!(101));
    assert_eq!(call(10, 1), json!(101));
    assert_eq!(call(1, 10), json!(20));
    assert_eq!(call(1, 10), json!(20));
    assert_eq!(call(10, 1), json!(101));

    let counts = counter.lock().unwrap();
    assert_eq!(counts[&(10, 1)], 1);
    assert_eq!(counts[&(1, 10)], 1);
}

#[test]
fn null_results_are_cached_like_any_other_value() {
    let store = test_store();
    let executions = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&executions);
    let comp = Computation::builder("yields_nothing")
        .body(move |_| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        })
        .build()
        .unwrap();

    for _ in 0..3 {
        assert_eq!(
            comp.call(&store, Args::new()).unwrap(),
            serde_json::Value::Null
        );
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
}

// ---------------------------------------------------------------------------
// Failure is never cached
// ---------------------------------------------------------------------------

#[test]
fn failure_leaves_the_key_retryable() {
    let store = test_store();
    let failing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&failing);
    let comp = Computation::builder("flaky_double")
        .param("x")
        .body(move |ctx| {
            if flag.load(Ordering::SeqCst) {
                return Err(Error::Other("not ready".to_string()));
            }
            let x = ctx.arg("x")?.as_i64().unwrap();
            Ok(json!(x * 2))
        })
        .build()
        .unwrap();

    assert!(comp.call(&store, Args::new().set("x", 10)).is_err());
    assert!(comp.call(&store, Args::new().set("x", 10)).is_err());
    // Nothing was persisted by the failed runs
    assert!(
        comp.load_entry_or_none(&store, Args::new().set("x", 10))
            .unwrap()
            .is_none()
    );

    failing.store(false, Ordering::SeqCst);
    assert_eq!(
        comp.call(&store, Args::new().set("x", 10)).unwrap(),
        json!(20)
    );

    // The cached result survives the flag flipping back
    failing.store(true, Ordering::SeqCst);
    assert_eq!(
        comp.call(&store, Args::new().set("x", 10)).unwrap(),
        json!(20)
    );
}

#[test]
fn panicking_body_leaves_the_key_retryable() {
    let store = test_store();
    let failing = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&failing);
    let comp = Computation::builder("crashy")
        .body(move |_| {
            if flag.load(Ordering::SeqCst) {
                panic!("body bug");
            }
            Ok(json!(7))
        })
        .build()
        .unwrap();

    let crashed = std::panic::catch_unwind(AssertUnwindSafe(|| comp.call(&store, Args::new())));
    assert!(crashed.is_err());
    // No running row survives the panic
    assert!(
        comp.load_entry_or_none(&store, Args::new())
            .unwrap()
            .is_none()
    );

    // No stale waiter either: the same thread can compute the key again
    failing.store(false, Ordering::SeqCst);
    assert_eq!(comp.call(&store, Args::new()).unwrap(), json!(7));
}

// ---------------------------------------------------------------------------
// Nested computations
// ---------------------------------------------------------------------------

#[test]
fn nested_calls_cache_each_level() {
    let store = test_store();

    let base = Computation::builder("base")
        .body(|_| Ok(json!(10)))
        .build()
        .unwrap();
    let base_dep = base.clone();
    let scale = Computation::builder("scale")
        .param("x")
        .body(move |ctx| {
            let x = ctx.arg("x")?.as_i64().unwrap();
            let factor = base_dep.call(ctx.store(), Args::new())?;
            Ok(json!(x * factor.as_i64().unwrap()))
        })
        .build()
        .unwrap();
    let scale_dep = scale.clone();
    let pair = Computation::builder("pair")
        .param("x")
        .param("y")
        .body(move |ctx| {
            let a = scale_dep.call(ctx.store(), Args::new().set("x", ctx.arg("x")?.clone()))?;
            let b = scale_dep.call(ctx.store(), Args::new().set("x", ctx.arg("y")?.clone()))?;
            Ok(json!([a, b]))
        })
        .build()
        .unwrap();

    assert!(
        store
            .load_or_none(base.bind(Args::new()).unwrap().key())
            .unwrap()
            .is_none()
    );
    match store.load(base.bind(Args::new()).unwrap().key()) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {other:?}"),
    }

    assert_eq!(
        pair.call(&store, Args::new().set("x", 1).set("y", 3))
            .unwrap(),
        json!([10, 30])
    );
    assert_eq!(
        scale.load(&store, Args::new().set("x", 1)).unwrap(),
        json!(10)
    );
    assert!(
        scale
            .load_or_none(&store, Args::new().set("x", 2))
            .unwrap()
            .is_none()
    );
    assert_eq!(
        scale.load(&store, Args::new().set("x", 3)).unwrap(),
        json!(30)
    );
    assert_eq!(store.load(&base.bind(Args::new()).unwrap()).unwrap(), json!(10));

    let scale_keys: HashSet<Key> = scale.keys(&store).unwrap().into_iter().collect();
    let expected: HashSet<Key> = [
        scale.bind(Args::new().set("x", 1)).unwrap().key().clone(),
        scale.bind(Args::new().set("x", 3)).unwrap().key().clone(),
    ]
    .into_iter()
    .collect();
    assert_eq!(scale_keys, expected);

    let pair_keys = pair.keys(&store).unwrap();
    assert_eq!(
        pair_keys,
        vec![
            pair.bind(Args::new().set("x", 1).set("y", 3))
                .unwrap()
                .key()
                .clone()
        ]
    );
}

#[test]
fn a_body_cannot_reenter_its_own_key() {
    let store = test_store();
    let slot: Arc<OnceLock<Computation>> = Arc::new(OnceLock::new());
    let inner = Arc::clone(&slot);
    let comp = Computation::builder("recursive")
        .body(move |ctx| inner.get().unwrap().call(ctx.store(), Args::new()))
        .build()
        .unwrap();
    slot.set(comp.clone()).unwrap();

    match comp.call(&store, Args::new()) {
        Err(Error::ComputedElsewhere(_)) => {}
        other => panic!("expected ComputedElsewhere, got {other:?}"),
    }
    // The failed run left nothing behind
    assert!(
        comp.load_entry_or_none(&store, Args::new())
            .unwrap()
            .is_none()
    );
}

// ---------------------------------------------------------------------------
// Ephemeral arguments
// ---------------------------------------------------------------------------

#[test]
fn ephemeral_arguments_do_not_affect_identity() {
    let store = test_store();
    let comp = Computation::builder("padded_add")
        .param("a")
        .param("__pad")
        .param("b")
        .body(|ctx| {
            let a = ctx.arg("a")?.as_i64().unwrap();
            let b = ctx.arg("b")?.as_i64().unwrap();
            let pad = ctx.arg("__pad")?.as_i64().unwrap();
            Ok(json!(a + b + pad))
        })
        .build()
        .unwrap();

    let with_pad = |pad: i64| Args::new().set("a", 10).set("__pad", pad).set("b", 20);
    assert_eq!(
        comp.bind(with_pad(1)).unwrap().key(),
        comp.bind(with_pad(2)).unwrap().key()
    );

    // First invocation runs with pad=1; the second hits the cache
    assert_eq!(comp.call(&store, with_pad(1)).unwrap(), json!(31));
    assert_eq!(comp.call(&store, with_pad(2)).unwrap(), json!(31));

    let key = comp.bind(with_pad(1)).unwrap().key().clone();
    assert_eq!(key.config().len(), 2);
    assert_eq!(key.config().get("a"), Some(&ConfigValue::Int(10)));
    assert_eq!(key.config().get("b"), Some(&ConfigValue::Int(20)));
}

// ---------------------------------------------------------------------------
// Keys as inputs
// ---------------------------------------------------------------------------

#[test]
fn a_key_can_be_passed_as_an_argument() {
    let store = test_store();
    let add = Computation::builder("add")
        .param("x")
        .param("y")
        .body(|ctx| {
            let x = ctx.arg("x")?.as_i64().unwrap();
            let y = ctx.arg("y")?.as_i64().unwrap();
            Ok(json!(x + y))
        })
        .build()
        .unwrap();
    let add_dep = add.clone();
    let tenfold = Computation::builder("tenfold_of")
        .param("key")
        .body(move |ctx| {
            let key = ctx.arg("key")?.as_key().unwrap().clone();
            let r = add_dep.ref_from_key(&key, Args::new())?;
            let value = ctx.store().get(&r)?;
            Ok(json!(value.as_i64().unwrap() * 10))
        })
        .build()
        .unwrap();

    let inner = add.bind(Args::new().set("x", 10).set("y", 20)).unwrap();
    let result = tenfold
        .call(&store, Args::new().set("key", inner.key().clone()))
        .unwrap();
    assert_eq!(result, json!(300));
}

// ---------------------------------------------------------------------------
// Dry runs
// ---------------------------------------------------------------------------

#[test]
fn dry_run_bypasses_the_cache() {
    let store = test_store();
    let executions = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&executions);
    let comp = Computation::builder("probe")
        .param("x")
        .body(move |ctx| {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(json!(ctx.arg("x")?.as_i64().unwrap() * 2))
        })
        .build()
        .unwrap();

    assert_eq!(
        comp.dry_run(&store, Args::new().set("x", 5)).unwrap(),
        json!(10)
    );
    assert_eq!(
        comp.dry_run(&store, Args::new().set("x", 5)).unwrap(),
        json!(10)
    );
    assert_eq!(executions.load(Ordering::SeqCst), 2);
    assert!(
        comp.load_entry_or_none(&store, Args::new().set("x", 5))
            .unwrap()
            .is_none()
    );
}
