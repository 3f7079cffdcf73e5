//! State shared across simulated contexts: connect, transactions,
//! migrations and persistence.

#![allow(clippy::arithmetic_side_effects)]

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::Browser;
use futures::future::join_all;
use strand_core::{ContextKind, Location, Value};
use strand_state::{
    ConnectOptions, ModelDescriptor, ModelRegistry, NodeKind, NodeMut, StateError, StateResult,
    UPDATE, Versioner,
};
use strand_storage::{Record, RecordStore};
use strand_test::{counter_options, eventually, test_location};

/// Poll the persisted record until `accept` holds.
async fn persisted(records: &RecordStore, location: &Location, accept: impl Fn(&Record) -> bool) -> Record {
    let poll = async {
        loop {
            if let Some(record) = records.load(location).await.unwrap()
                && accept(&record)
            {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    tokio::time::timeout(Duration::from_secs(5), poll)
        .await
        .expect("record never reached the expected state")
}

fn n_options() -> ConnectOptions {
    ConnectOptions::new().initial(|| Value::from_iter([("n", 0)]))
}

fn increment(key: &'static str) -> impl FnOnce(&mut NodeMut<'_>) -> StateResult<()> + Send {
    move |root| {
        let n = root.get(key).and_then(|v| v.as_i64()).unwrap_or(0);
        root.set(key, n + 1)
    }
}

#[tokio::test]
async fn test_concurrent_increments_from_two_contexts() {
    let browser = Browser::start();
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let tab = browser.spoke(ContextKind::ContentScript, "tab-1");
    let location = test_location("proj/s/x");

    let (a, b) = tokio::join!(
        popup.store().connect(&location, n_options()),
        tab.store().connect(&location, n_options()),
    );
    let (a, b) = (a.unwrap(), b.unwrap());

    let (ra, rb) = tokio::join!(a.transaction(increment("n")), b.transaction(increment("n")));
    ra.unwrap();
    rb.unwrap();

    let record = persisted(&browser.records(), &location, |r| {
        r.data.get("n") == Some(&Value::Int(2))
    })
    .await;
    assert_eq!(record.data.get("n"), Some(&Value::Int(2)));
    assert!(eventually(Duration::from_secs(2), || {
        a.get("n") == Some(Value::Int(2)) && b.get("n") == Some(Value::Int(2))
    })
    .await);
}

#[tokio::test]
async fn test_many_interleaved_increments_are_not_lost() {
    let browser = Browser::start();
    let location = test_location("proj/s/hits");
    let contexts = [
        browser.spoke(ContextKind::Popup, "popup"),
        browser.spoke(ContextKind::SidePanel, "panel"),
        browser.spoke(ContextKind::ContentScript, "tab-1"),
    ];

    let mut states = Vec::new();
    for runtime in contexts.iter().chain([&browser.background]) {
        states.push(runtime.store().connect(&location, n_options()).await.unwrap());
    }
    join_all(states.iter().map(|state| async move {
        for _ in 0..5 {
            state.transaction(increment("n")).await.unwrap();
        }
    }))
    .await;

    let hub_state = browser.background.store().get(&location).unwrap();

    assert_eq!(hub_state.get("n"), Some(Value::Int(20)));
    persisted(&browser.records(), &location, |r| {
        r.data.get("n") == Some(&Value::Int(20))
    })
    .await;
}

#[tokio::test]
async fn test_concurrent_connects_in_one_context_share_setup() {
    let browser = Browser::start();
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let location = test_location("proj/s/once");
    let calls = Arc::new(AtomicUsize::new(0));
    let options = {
        let calls = Arc::clone(&calls);
        ConnectOptions::new().initial(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Value::from_iter([("ready", true)])
        })
    };

    let (a, b) = tokio::join!(
        popup.store().connect(&location, options.clone()),
        popup.store().connect(&location, options),
    );
    let (a, b) = (a.unwrap(), b.unwrap());
    assert!(a.ptr_eq(&b));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_initial_runs_once_across_contexts() {
    let browser = Browser::start();
    let location = test_location("proj/s/seed");
    let calls = Arc::new(AtomicUsize::new(0));
    let options = {
        let calls = Arc::clone(&calls);
        ConnectOptions::new().initial(move || {
            calls.fetch_add(1, Ordering::SeqCst);
            Value::from_iter([("items", Value::List(vec![]))])
        })
    };
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let tab = browser.spoke(ContextKind::ContentScript, "tab-1");
    let panel = browser.spoke(ContextKind::SidePanel, "panel");

    let (a, b, c) = tokio::join!(
        popup.store().connect(&location, options.clone()),
        tab.store().connect(&location, options.clone()),
        panel.store().connect(&location, options),
    );
    a.unwrap();
    b.unwrap();
    let c = c.unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    c.transaction(|root| {
        root.child_mut("items")
            .ok_or_else(|| StateError::InvalidOperation("no items".into()))?
            .push("first")
    })
    .await
    .unwrap();
    persisted(&browser.records(), &location, |r| {
        r.data.get("items").and_then(Value::as_list).is_some_and(|l| l.len() == 1)
    })
    .await;
}

#[tokio::test]
async fn test_v1_record_upgrades_to_v2_everywhere() {
    let browser = Browser::start();
    let location = test_location("proj/s/todos");
    browser
        .records()
        .save(
            &location,
            &Record::new(Value::from_iter([("title", "groceries")]), 1),
        )
        .await
        .unwrap();

    let options = ConnectOptions::new().versioner(Versioner::new().step(2, |map| {
        map.entry("items".to_owned())
            .or_insert_with(|| Value::List(Vec::new()));
        Ok(())
    }));
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let state = popup.store().connect(&location, options).await.unwrap();

    assert_eq!(state.version(), Some(2));
    assert_eq!(
        state.read(|root| root.child("items").map(|n| n.kind())),
        Some(NodeKind::List)
    );
    assert_eq!(state.get("title"), Some(Value::from("groceries")));

    let record = persisted(&browser.records(), &location, |r| r.version == Some(2)).await;
    assert_eq!(record.data.get("items"), Some(&Value::List(Vec::new())));
    assert_eq!(record.data.get("title"), Some(&Value::from("groceries")));
}

#[tokio::test]
async fn test_nested_model_upgrades_on_load() {
    let models = Arc::new(ModelRegistry::new());
    models.register(
        ModelDescriptor::new("TodoList")
            .field("title", "")
            .versioner(Versioner::new().step(2, |map| {
                map.entry("items".to_owned())
                    .or_insert_with(|| Value::List(Vec::new()));
                Ok(())
            })),
    );
    let browser = Browser::with_config(strand_config::Config::default(), Arc::clone(&models));
    let location = test_location("proj/s/lists");
    let list = Value::from_iter([
        ("$model", Value::from("TodoList")),
        ("$version", Value::Int(1)),
        ("title", Value::from("chores")),
    ]);
    browser
        .records()
        .save(&location, &Record::new(Value::from_iter([("main", list)]), 0))
        .await
        .unwrap();

    let tab = browser.spoke(ContextKind::ContentScript, "tab-1");
    let state = tab
        .store()
        .connect(&location, ConnectOptions::new())
        .await
        .unwrap();

    let (model, version, items) = state.read(|root| {
        let main = root.child("main").expect("main model");
        (main.model(), main.version(), main.child("items").map(|n| n.kind()))
    });
    assert_eq!(model.as_deref(), Some("TodoList"));
    assert_eq!(version, Some(2));
    assert_eq!(items, Some(NodeKind::List));

    persisted(&browser.records(), &location, |r| {
        r.data
            .get("main")
            .and_then(|m| m.get("items"))
            .is_some()
    })
    .await;
}

#[tokio::test]
async fn test_model_moved_by_root_migration_runs_its_own_steps() {
    let models = Arc::new(ModelRegistry::new());
    models.register(ModelDescriptor::new("Item").versioner(Versioner::new().step(1, |map| {
        map.insert("x".to_owned(), Value::Bool(true));
        Ok(())
    })));
    let browser = Browser::with_config(strand_config::Config::default(), Arc::clone(&models));
    let location = test_location("proj/s/moved");
    let item = Value::from_iter([("$model", Value::from("Item")), ("a", Value::Int(1))]);
    browser
        .records()
        .save(&location, &Record::new(Value::from_iter([("old", item)]), 1))
        .await
        .unwrap();

    let options = ConnectOptions::new().versioner(Versioner::new().step(2, |map| {
        if let Some(item) = map.remove("old") {
            map.insert("new".to_owned(), item);
        }
        Ok(())
    }));
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let state = popup.store().connect(&location, options).await.unwrap();

    let (x, version) = state.read(|root| {
        let item = root.child("new").expect("moved item");
        (item.get("x"), item.version())
    });
    assert_eq!(x, Some(Value::Bool(true)));
    assert_eq!(version, Some(1));
    assert_eq!(state.get("old"), None);

    let record = persisted(&browser.records(), &location, |r| r.version == Some(2)).await;
    let moved = record.data.get("new").expect("persisted item");
    assert_eq!(moved.get("x"), Some(&Value::Bool(true)));
    assert_eq!(moved.get("a"), Some(&Value::Int(1)));
}

#[tokio::test]
async fn test_only_newer_migrations_run() {
    let browser = Browser::start();
    let location = test_location("proj/s/steps");
    browser
        .records()
        .save(&location, &Record::new(Value::from_iter([("steps", "")]), 2))
        .await
        .unwrap();

    let ran = Arc::new(Mutex::new(Vec::new()));
    let versioner = (1..=4).fold(Versioner::new(), |versioner, version| {
        let ran = Arc::clone(&ran);
        versioner.step(version, move |map| {
            ran.lock().unwrap().push(version);
            map.insert("steps".to_owned(), Value::from(format!("v{version}")));
            Ok(())
        })
    });
    let options = ConnectOptions::new().versioner(versioner);

    let popup = browser.spoke(ContextKind::Popup, "popup");
    let state = popup.store().connect(&location, options.clone()).await.unwrap();
    assert_eq!(*ran.lock().unwrap(), vec![3, 4]);
    assert_eq!(state.version(), Some(4));
    assert_eq!(state.get("steps"), Some(Value::from("v4")));

    // Another context sees version 4 and runs nothing.
    let tab = browser.spoke(ContextKind::ContentScript, "tab-1");
    let again = tab.store().connect(&location, options).await.unwrap();
    assert_eq!(again.version(), Some(4));
    assert_eq!(*ran.lock().unwrap(), vec![3, 4]);
}

#[tokio::test]
async fn test_failed_migration_leaves_location_retryable() {
    let browser = Browser::start();
    let location = test_location("proj/s/broken");
    browser
        .records()
        .save(&location, &Record::new(Value::from_iter([("a", 1)]), 1))
        .await
        .unwrap();
    let popup = browser.spoke(ContextKind::Popup, "popup");

    let failing = ConnectOptions::new()
        .versioner(Versioner::new().step(2, |_| Err("schema drift".into())));
    match popup.store().connect(&location, failing).await {
        Err(StateError::Migration { version, message }) => {
            assert_eq!(version, 2);
            assert_eq!(message, "schema drift");
        },
        other => panic!("expected migration failure, got {other:?}"),
    }
    assert!(popup.store().get(&location).is_none());

    let fixed = ConnectOptions::new().versioner(Versioner::new().step(2, |map| {
        map.insert("b".to_owned(), Value::Int(2));
        Ok(())
    }));
    let state = popup.store().connect(&location, fixed).await.unwrap();
    assert_eq!(state.version(), Some(2));
    assert_eq!(state.get("b"), Some(Value::Int(2)));
}

#[tokio::test]
async fn test_observers_never_see_half_a_transaction() {
    let browser = Browser::start();
    let location = test_location("proj/s/pair");
    let options = ConnectOptions::new().initial(|| Value::from_iter([("a", 0), ("b", 0)]));

    let observed = browser
        .background
        .store()
        .connect(&location, options.clone())
        .await
        .unwrap();
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let writer = popup.store().connect(&location, options).await.unwrap();

    let mut changes = observed.subscribe();
    let watcher = {
        let observed = observed.clone();
        tokio::spawn(async move {
            let mut torn = 0_usize;
            while changes.changed().await.is_ok() {
                let snapshot = observed.snapshot().unwrap();
                if snapshot.get("a") != snapshot.get("b") {
                    torn += 1;
                }
                if snapshot.get("a") == Some(&Value::Int(10)) {
                    break;
                }
            }
            torn
        })
    };

    for i in 1..=10_i64 {
        writer
            .transaction(move |root| {
                root.set("a", i)?;
                root.set("b", i)
            })
            .await
            .unwrap();
    }

    let torn = tokio::time::timeout(Duration::from_secs(5), watcher)
        .await
        .expect("observer never saw the last write")
        .unwrap();
    assert_eq!(torn, 0);
}

#[tokio::test]
async fn test_hub_writes_reach_dependents() {
    let browser = Browser::start();
    let location = test_location("proj/s/feed");
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let reader = popup.store().connect(&location, counter_options()).await.unwrap();
    let hub = browser
        .background
        .store()
        .connect(&location, counter_options())
        .await
        .unwrap();

    hub.transaction(|root| root.set("count", 7)).await.unwrap();
    assert!(eventually(Duration::from_secs(2), || reader.get("count") == Some(Value::Int(7))).await);
}

#[tokio::test]
async fn test_dependent_list_and_destroy() {
    let browser = Browser::start();
    let popup = browser.spoke(ContextKind::Popup, "popup");
    for name in ["b", "a"] {
        let state = popup
            .store()
            .connect(&test_location(&format!("proj/s/{name}")), counter_options())
            .await
            .unwrap();
        state.transaction(|root| root.set("count", 1)).await.unwrap();
    }

    let listed = popup.store().list(&test_location("proj/s")).await.unwrap();
    assert_eq!(listed, vec![test_location("proj/s/a"), test_location("proj/s/b")]);

    assert!(popup.store().destroy(&test_location("proj/s/a")).await.unwrap());
    assert!(popup.store().get(&test_location("proj/s/a")).is_none());
    assert!(
        browser
            .records()
            .load(&test_location("proj/s/a"))
            .await
            .unwrap()
            .is_none()
    );
    let listed = popup.store().list(&test_location("proj/s")).await.unwrap();
    assert_eq!(listed, vec![test_location("proj/s/b")]);
}

#[tokio::test]
async fn test_disconnect_keeps_data_for_the_next_context() {
    let mut browser = Browser::start();
    let location = test_location("proj/s/kept");
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let state = popup.store().connect(&location, counter_options()).await.unwrap();
    state.transaction(|root| root.set("count", 5)).await.unwrap();
    popup.store().disconnect(&location).await.unwrap();
    assert!(!state.is_connected());

    persisted(&browser.records(), &location, |r| {
        r.data.get("count") == Some(&Value::Int(5))
    })
    .await;
    browser.background.close().await.unwrap();
    browser.restart_background();

    let tab = browser.spoke(ContextKind::ContentScript, "tab-1");
    let state = tab.store().connect(&location, counter_options()).await.unwrap();
    assert_eq!(state.get("count"), Some(Value::Int(5)));
}

#[tokio::test]
async fn test_undelivered_change_reaches_the_hub_with_the_next_transaction() {
    let browser = Browser::start();
    let location = test_location("proj/s/resend");
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let state = popup.store().connect(&location, n_options()).await.unwrap();

    // The hub instance stops taking updates, so the next push goes nowhere.
    browser
        .background
        .bus()
        .scoped(location.to_string())
        .off(UPDATE, None);
    let err = state.transaction(increment("n")).await.unwrap_err();
    assert!(matches!(err, StateError::Unavailable(_)));

    // A fresh hub instance has none of the dependent's history.
    assert!(browser.background.store().destroy(&location).await.unwrap());
    state.transaction(increment("n")).await.unwrap();

    let hub = browser
        .background
        .store()
        .get(&location)
        .expect("reopened for the lease");
    assert_eq!(hub.get("n"), Some(Value::Int(2)));
    persisted(&browser.records(), &location, |r| {
        r.data.get("n") == Some(&Value::Int(2))
    })
    .await;
}

#[tokio::test]
async fn test_transaction_without_hub_is_unavailable() {
    let browser = Browser::start();
    let location = test_location("proj/s/orphan");
    let popup = browser.spoke(ContextKind::Popup, "popup");
    let state = popup.store().connect(&location, counter_options()).await.unwrap();

    browser.host.kill(common::BACKGROUND);
    let err = state.transaction(|root| root.set("count", 1)).await.unwrap_err();
    assert!(matches!(err, StateError::Unavailable(_) | StateError::Bus(_)));
    assert_eq!(state.get("count"), Some(Value::Int(0)));
}
