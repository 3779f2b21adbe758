mod common;

use std::sync::{Arc, Mutex};

use proptest::prelude::*;

use cafeledger::{
    client::CafeClient,
    config::ClientConfig,
    core::store::CacheStore,
    entity::User,
    remote::{RemoteDataService, RemoteError, StaticSession},
    runtime::events::CacheEvent,
    types::{CollectionKind, Money, RefetchToken},
};

use common::{ScriptedRemote, client, product, strict_config, user};

fn ids(store: &CacheStore) -> Vec<String> {
    store.users().iter().map(|u| u.id.clone()).collect()
}

#[tokio::test]
async fn older_fetch_completing_late_never_overwrites_newer() {
    let remote = ScriptedRemote::new();
    let release_first = remote.push_gated_rows(&[user("t1-a", 100), user("t1-b", 200)]);
    remote.push_rows(&[user("t2-a", 300)]);
    let client = client(&remote, strict_config());
    let coordinator = client.coordinator();

    let first = coordinator.refresh_users();
    let second = async {
        let out = coordinator.refresh_users().await;
        release_first.send(()).expect("first fetch still waiting");
        out
    };
    let (first, second) = tokio::join!(first, second);

    assert!(first.is_none(), "superseded fetch must not commit");
    assert_eq!(second.expect("newest fetch commits").len(), 1);
    assert_eq!(ids(client.store()), vec!["t2-a".to_string()]);
    assert_eq!(client.store().current_token(CollectionKind::Users), RefetchToken(2));
}

#[tokio::test]
async fn stale_commit_notifies_nobody() {
    let remote = ScriptedRemote::new();
    let release_first = remote.push_gated_rows(&[user("old", 1)]);
    remote.push_rows(&[user("new", 2)]);
    let client = client(&remote, strict_config());

    let seen = Arc::new(Mutex::new(Vec::<CacheEvent>::new()));
    let sink = Arc::clone(&seen);
    client.store().add_listener(Arc::new(move |ev: &CacheEvent| {
        sink.lock().expect("lock").push(ev.clone());
    }));

    let coordinator = client.coordinator();
    let _ = tokio::join!(coordinator.refresh_users(), async {
        let out = coordinator.refresh_users().await;
        let _ = release_first.send(());
        out
    });

    let seen = seen.lock().expect("lock");
    assert_eq!(
        *seen,
        vec![CacheEvent::CollectionReplaced {
            kind: CollectionKind::Users,
            token: Some(RefetchToken(2)),
            len: 1,
        }]
    );
}

#[tokio::test]
async fn no_scope_means_no_fetch() {
    let remote = ScriptedRemote::new();
    let service: Arc<dyn RemoteDataService> = Arc::clone(&remote) as Arc<dyn RemoteDataService>;
    let client = CafeClient::new(service, Arc::new(StaticSession::signed_out()), strict_config());

    assert!(client.coordinator().refresh_users().await.is_none());
    assert!(client.coordinator().refresh_balances().await.is_none());
    assert!(remote.calls().is_empty());
    assert_eq!(client.store().current_token(CollectionKind::Users), RefetchToken(0));
}

#[tokio::test]
async fn remote_failure_leaves_cache_untouched() {
    let remote = ScriptedRemote::new();
    remote.push_rows(&[product("p1", 250, 0)]);
    remote.push_query_error(RemoteError::rejected("42501", "permission denied"));
    let client = client(&remote, strict_config());

    assert!(client.coordinator().refresh_products().await.is_some());
    assert!(client.coordinator().refresh_products().await.is_none());
    assert_eq!(client.store().products().len(), 1);
}

#[tokio::test]
async fn transient_failure_is_retried_within_budget() {
    let remote = ScriptedRemote::new();
    remote.push_query_error(RemoteError::Transport("connection reset".to_string()));
    remote.push_rows(&[user("u1", 0)]);
    let client = client(&remote, ClientConfig::default());

    let users = client.coordinator().refresh_users().await.expect("retried");
    assert_eq!(users.len(), 1);
    assert_eq!(remote.calls().len(), 2);
}

#[tokio::test]
async fn balance_refresh_patches_cached_users_and_is_throttled() {
    let remote = ScriptedRemote::new();
    remote.push_rows(&[user("u1", 1000), user("u2", 500)]);
    remote.push_raw_rows(vec![
        serde_json::json!({"id": "u1", "balance": 7.5}),
        serde_json::json!({"id": "u2", "balance": 5.0}),
        serde_json::json!({"id": "ghost", "balance": 1.0}),
    ]);
    let client = client(&remote, strict_config());
    client.coordinator().refresh_users().await.expect("users");

    let mut events = client.store().subscribe();
    assert_eq!(client.coordinator().refresh_balances().await, Some(1));
    assert_eq!(
        client.store().get::<User>("u1").expect("u1").balance,
        Money::from_minor(750)
    );
    assert_eq!(
        client.store().get::<User>("u1").expect("u1").display_name,
        "User u1"
    );
    assert_eq!(
        events.recv().await.expect("event"),
        CacheEvent::EntitiesReplaced {
            kind: CollectionKind::Users,
            count: 1
        }
    );

    let before = remote.calls().len();
    assert_eq!(client.coordinator().refresh_balances().await, None);
    assert_eq!(remote.calls().len(), before, "throttled run must not query");

    client.coordinator().balance_throttle().reset();
    assert_eq!(client.coordinator().refresh_balances().await, Some(0));
}

#[tokio::test]
async fn balance_read_overtaken_by_full_refresh_is_dropped() {
    let remote = ScriptedRemote::new();
    remote.push_rows(&[user("u1", 500)]);
    let release = remote.push_gated_rows(&[serde_json::json!({"id": "u1", "balance": 10.0})]);
    remote.push_rows(&[user("u1", 9000)]);
    let client = client(&remote, strict_config());
    client.coordinator().refresh_users().await.expect("seed");

    let coordinator = client.coordinator();
    let (balances, _) = tokio::join!(coordinator.refresh_balances(), async {
        coordinator.refresh_users().await.expect("newer full refresh");
        release.send(()).expect("balances still waiting");
    });

    assert_eq!(balances, None);
    assert_eq!(
        client.store().get::<User>("u1").expect("u1").balance,
        Money::from_minor(9000)
    );
    assert!(coordinator.balance_throttle().is_open(), "dropped read is not a success");
}

#[tokio::test]
async fn refresh_all_reports_both_collections() {
    let remote = ScriptedRemote::new();
    let client = client(&remote, strict_config());
    let report = client.coordinator().refresh_all().await;
    assert_eq!(report.users, Some(0));
    assert_eq!(report.products, Some(0));
}

proptest! {
    #[test]
    fn store_reflects_most_recently_started_fetch(order in Just((0..6usize).collect::<Vec<_>>()).prop_shuffle()) {
        let store = CacheStore::default();
        let tokens: Vec<RefetchToken> = (0..order.len())
            .map(|_| store.begin_fetch(CollectionKind::Users))
            .collect();
        let newest = order.len() - 1;

        for &i in &order {
            let committed = store
                .commit_fetch(tokens[i], vec![user(&format!("fetch-{i}"), i as i64)])
                .is_some();
            prop_assert_eq!(committed, i == newest);
        }
        prop_assert_eq!(ids(&store), vec![format!("fetch-{newest}")]);
    }
}
