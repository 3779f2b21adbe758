mod common;

use std::{collections::BTreeMap, sync::Arc};

use serde_json::json;
use tempfile::TempDir;

use cafeledger::{
    client::CafeClient,
    entity::{Product, ProductPatch, User},
    ledger::{
        AdjustmentError, AdjustmentRequest,
        event::{EventFilter, EventWindow},
        reconcile::RejectionReason,
    },
    remote::{
        ProcedureCall, RemoteDataService, Resource, StaticSession, sqlite::SqliteDataService,
    },
    types::Money,
};

use common::strict_config;

fn seed_user(id: &str, institution: &str, balance_minor: i64) -> User {
    User {
        id: id.to_string(),
        institution_id: institution.to_string(),
        display_name: format!("User {id}"),
        balance: Money::from_minor(balance_minor),
        is_adult: false,
        is_active: true,
        product_limits: BTreeMap::new(),
    }
}

fn seed_product(id: &str, price_minor: i64, sort_order: i32) -> Product {
    Product {
        id: id.to_string(),
        institution_id: "inst".to_string(),
        name: format!("Product {id}"),
        price: Money::from_minor(price_minor),
        visible: true,
        sort_order,
    }
}

fn everything() -> EventWindow {
    EventWindow::new(0, u64::MAX)
}

fn open_seeded(tmp: &TempDir) -> (SqliteDataService, String) {
    let service = SqliteDataService::open(tmp.path().join("till.db")).expect("open sqlite");
    service.insert_user(&seed_user("u1", "inst", 10_000)).expect("u1");
    service.insert_user(&seed_user("x1", "other", 500)).expect("x1");
    service.insert_product(&seed_product("p1", 2500, 1)).expect("p1");
    service.insert_product(&seed_product("p2", 150, 0)).expect("p2");
    let sale_id = service.record_sale("u1", &[("p1", 2)], 1_000).expect("sale");
    (service, sale_id)
}

fn connect(service: &SqliteDataService) -> CafeClient {
    CafeClient::new(
        Arc::new(service.clone()),
        Arc::new(StaticSession::new("inst")),
        strict_config(),
    )
}

#[tokio::test]
async fn refresh_is_scoped_and_ordered() {
    let tmp = TempDir::new().expect("tmp");
    let (service, _) = open_seeded(&tmp);
    let client = connect(&service);

    let report = client.coordinator().refresh_all().await;
    assert_eq!(report.users, Some(1));
    assert_eq!(report.products, Some(2));

    let order: Vec<String> = client.store().products().iter().map(|p| p.id.clone()).collect();
    assert_eq!(order, vec!["p2".to_string(), "p1".to_string()]);
    assert_eq!(
        client.store().get::<User>("u1").expect("u1").balance,
        Money::from_minor(5_000)
    );
}

#[tokio::test]
async fn refund_then_undo_round_trip() {
    let tmp = TempDir::new().expect("tmp");
    let (service, sale_id) = open_seeded(&tmp);
    let client = connect(&service);
    client.coordinator().refresh_users().await.expect("users");

    let stale = client.desk().reconcile_window(everything()).await.expect("window");
    assert_eq!(
        stale.sale(&sale_id).expect("sale").original_amount,
        Money::from_minor(5_000)
    );

    let receipt = client
        .desk()
        .submit_adjustment(
            &stale,
            AdjustmentRequest::refund(sale_id.clone(), Money::from_minor(2_000), Some("cold".to_string())),
        )
        .await
        .expect("refund");
    assert_eq!(receipt.new_balance, Some(Money::from_minor(7_000)));
    assert_eq!(
        client.store().get::<User>("u1").expect("u1").balance,
        Money::from_minor(7_000)
    );
    assert_eq!(service.balance_of("u1").expect("balance"), Money::from_minor(7_000));

    let fresh = client.desk().reconcile_window(everything()).await.expect("window");
    let view = fresh.sale(&sale_id).expect("sale");
    assert_eq!(view.remaining_refundable, Money::from_minor(3_000));

    let err = client
        .desk()
        .submit_adjustment(&fresh, AdjustmentRequest::refund(sale_id.clone(), Money::from_minor(3_001), None))
        .await
        .unwrap_err();
    assert_eq!(err.remaining_refundable(), Some(Money::from_minor(3_000)));

    let err = client
        .desk()
        .submit_adjustment(&stale, AdjustmentRequest::refund(sale_id.clone(), Money::from_minor(4_000), None))
        .await
        .unwrap_err();
    match err {
        AdjustmentError::Remote(remote) => assert_eq!(remote.rejection_code(), Some("refund_ceiling")),
        other => panic!("expected server-side rejection, got {other:?}"),
    }

    let receipt = client.desk().undo_sale(&fresh, &sale_id).await.expect("undo");
    assert_eq!(receipt.new_balance, Some(Money::from_minor(10_000)));

    let err = client.desk().undo_sale(&fresh, &sale_id).await.unwrap_err();
    match err {
        AdjustmentError::Remote(remote) => assert_eq!(remote.rejection_code(), Some("sale_voided")),
        other => panic!("expected server-side rejection, got {other:?}"),
    }

    let after = client.desk().reconcile_window(everything()).await.expect("window");
    let view = after.sale(&sale_id).expect("sale");
    assert!(view.is_voided);
    let err = client.desk().undo_sale(&after, &sale_id).await.unwrap_err();
    assert!(matches!(err, AdjustmentError::Rejected(ref r) if r.reason == RejectionReason::SaleVoided));

    let summary = client
        .desk()
        .summarize_window(everything(), &EventFilter::all())
        .await
        .expect("summary");
    assert_eq!(summary.revenue, Money::ZERO);
    assert_eq!(summary.voided_sales, 1);
    assert_eq!(summary.adjustment_count, 1);
    assert_eq!(summary.undo_count, 1);
}

#[tokio::test]
async fn money_moves_only_through_procedures() {
    let tmp = TempDir::new().expect("tmp");
    let (service, _) = open_seeded(&tmp);
    let client = connect(&service);
    client.coordinator().refresh_all().await;

    let user = client
        .mutator()
        .deposit("u1", Money::from_minor(550))
        .await
        .expect("deposit");
    assert_eq!(user.balance, Money::from_minor(5_550));
    assert_eq!(service.balance_of("u1").expect("balance"), Money::from_minor(5_550));

    let err = service
        .update(Resource::Users, "u1", json!({"balance": 1.0}))
        .await
        .unwrap_err();
    assert_eq!(err.rejection_code(), Some("procedure_only"));

    let err = service
        .invoke(&ProcedureCall::Deposit {
            user_id: "u1".to_string(),
            amount: Money::from_minor(-1),
        })
        .await
        .unwrap_err();
    assert_eq!(err.rejection_code(), Some("invalid_amount"));

    let user = client
        .mutator()
        .set_balance("u1", Money::from_minor(42))
        .await
        .expect("set balance");
    assert_eq!(user.balance, Money::from_minor(42));

    let window = client.desk().reconcile_window(everything()).await.expect("window");
    assert_eq!(window.len(), 3);
}

#[tokio::test]
async fn product_and_limit_edits_persist() {
    let tmp = TempDir::new().expect("tmp");
    let (service, _) = open_seeded(&tmp);
    let client = connect(&service);
    client.coordinator().refresh_all().await;

    let edited = client
        .mutator()
        .update_product(
            "p2",
            ProductPatch {
                price: Some(Money::from_minor(175)),
                visible: Some(false),
                ..ProductPatch::default()
            },
        )
        .await
        .expect("edit");
    assert_eq!(edited.price, Money::from_minor(175));
    assert!(!edited.visible);

    client
        .mutator()
        .set_product_limit("u1", "p1", Some(3))
        .await
        .expect("limit");

    let reread = connect(&service);
    reread.coordinator().refresh_all().await;
    assert_eq!(reread.store().get::<Product>("p2"), Some(edited));
    assert_eq!(
        reread.store().get::<User>("u1").expect("u1").product_limits.get("p1"),
        Some(&3)
    );

    let err = client
        .mutator()
        .update_product("missing", ProductPatch { visible: Some(true), ..ProductPatch::default() })
        .await
        .unwrap_err();
    assert!(err.remote().is_none(), "unknown products fail before any call");
}
