mod common;

use proptest::prelude::*;
use serde_json::json;

use cafeledger::{
    ledger::{
        AdjustmentError, AdjustmentRequest,
        event::{
            AdjustmentDetails, DepositDetails, DisplayCategory, EventBody, EventFilter,
            EventWindow, LedgerEvent, LineItem, SaleDetails, UndoDetails,
        },
        reconcile::{FULL_REVERSAL_REASON, LedgerRow, RejectionReason, check_adjustment, reconcile},
        summary::{summarize, user_statement},
    },
    remote::RemoteError,
    types::Money,
};

use common::{ScriptedRemote, client, strict_config, user};

fn sale(id: &str, ts: u64, minor: i64) -> LedgerEvent {
    LedgerEvent {
        id: id.to_string(),
        ts_ms: ts,
        user_id: Some("u1".to_string()),
        body: EventBody::Sale(SaleDetails {
            total: Some(Money::from_minor(minor)),
            items: vec![],
        }),
    }
}

fn itemized_sale(id: &str, ts: u64, user: &str, items: &[(&str, u32, i64)]) -> LedgerEvent {
    LedgerEvent {
        id: id.to_string(),
        ts_ms: ts,
        user_id: Some(user.to_string()),
        body: EventBody::Sale(SaleDetails {
            total: None,
            items: items
                .iter()
                .map(|(product, qty, price)| LineItem {
                    product_id: (*product).to_string(),
                    product_name: Some(format!("name-{product}")),
                    quantity: *qty,
                    unit_price: Money::from_minor(*price),
                })
                .collect(),
        }),
    }
}

fn adjustment(id: &str, ts: u64, sale_id: &str, minor: i64, full_reversal: bool) -> LedgerEvent {
    LedgerEvent {
        id: id.to_string(),
        ts_ms: ts,
        user_id: Some("u1".to_string()),
        body: EventBody::SaleAdjustment(AdjustmentDetails {
            adjusted_sale_id: sale_id.to_string(),
            adjustment_amount: Money::from_minor(minor),
            full_reversal,
            reason: None,
            new_balance: None,
        }),
    }
}

fn undo(id: &str, ts: u64, sale_id: &str) -> LedgerEvent {
    LedgerEvent {
        id: id.to_string(),
        ts_ms: ts,
        user_id: Some("u1".to_string()),
        body: EventBody::SaleUndo(UndoDetails {
            undone_sale_id: sale_id.to_string(),
            refunded_amount: None,
            new_balance: None,
        }),
    }
}

fn deposit(id: &str, ts: u64, user: &str, minor: i64) -> LedgerEvent {
    LedgerEvent {
        id: id.to_string(),
        ts_ms: ts,
        user_id: Some(user.to_string()),
        body: EventBody::Deposit(DepositDetails {
            amount: Money::from_minor(minor),
            new_balance: None,
        }),
    }
}

#[test]
fn untouched_sale_is_fully_refundable() {
    let rec = reconcile(&[sale("s1", 1, 5000)]);
    let view = rec.sale("s1").expect("sale");
    assert_eq!(view.remaining_refundable, Money::from_minor(5000));
    assert!(!view.is_fully_refunded);
}

#[test]
fn partial_refund_reduces_what_is_left() {
    let rec = reconcile(&[sale("s1", 1, 5000), adjustment("a1", 2, "s1", -2000, false)]);
    let view = rec.sale("s1").expect("sale");
    assert_eq!(view.remaining_refundable, Money::from_minor(3000));
    assert!(!view.is_fully_refunded);
    assert_eq!(view.already_refunded(), Money::from_minor(2000));
}

#[test]
fn refund_past_the_ceiling_is_rejected_with_remaining_amount() {
    let rec = reconcile(&[sale("s1", 1, 5000), adjustment("a1", 2, "s1", -2000, false)]);
    let view = rec.sale("s1").expect("sale");
    let err = check_adjustment(view, Money::from_minor(-3001)).unwrap_err();
    assert_eq!(err.reason, RejectionReason::ExceedsCeiling);
    assert_eq!(err.remaining_refundable, Money::from_minor(3000));
    assert!(err.message().contains("30.00"));

    let ok = check_adjustment(view, Money::from_minor(-3000)).expect("exact rest");
    assert!(ok.completes_reversal);
    assert_eq!(ok.remaining_after, Money::ZERO);
}

#[test]
fn explicit_full_reversal_marks_sale_refunded() {
    let rec = reconcile(&[sale("s1", 1, 5000), adjustment("a1", 2, "s1", -5000, true)]);
    let view = rec.sale("s1").expect("sale");
    assert!(view.is_fully_refunded);
    assert_eq!(view.remaining_refundable, Money::ZERO);
}

#[test]
fn orphan_adjustment_stays_visible_as_its_own_row() {
    let rec = reconcile(&[adjustment("a1", 5, "outside", -300, false), sale("s2", 6, 900)]);
    assert_eq!(rec.len(), 2);
    assert!(matches!(&rec.rows()[0], LedgerRow::OrphanAdjustment(ev) if ev.id == "a1"));
    assert_eq!(rec.orphan_adjustments().count(), 1);
    assert!(rec.sale("outside").is_none());

    let summary = summarize(&rec, &EventFilter::all());
    assert_eq!(summary.orphan_adjustments, 1);
    assert_eq!(summary.adjustments_net, Money::from_minor(-300));
    assert_eq!(summary.revenue, Money::from_minor(900));
}

#[test]
fn revenue_counts_original_amounts_of_active_sales_only() {
    let events = vec![
        itemized_sale("s1", 1, "u1", &[("p1", 2, 250), ("p2", 1, 400)]),
        itemized_sale("s2", 2, "u2", &[("p1", 1, 250)]),
        itemized_sale("s3", 3, "u1", &[("p2", 3, 400)]),
        adjustment("a1", 4, "s1", -250, false),
        undo("x1", 5, "s3"),
        deposit("d1", 6, "u1", 2000),
    ];
    let rec = reconcile(&events);
    let summary = summarize(&rec, &EventFilter::all());

    assert_eq!(summary.revenue, Money::from_minor(900 + 250));
    assert_eq!(summary.active_sales, 2);
    assert_eq!(summary.voided_sales, 1);
    assert_eq!(summary.voided_total, Money::from_minor(1200));
    assert_eq!(summary.adjustments_net, Money::from_minor(-250));
    assert_eq!(summary.net_revenue(), Money::from_minor(900));
    assert_eq!(summary.undo_count, 1);
    assert_eq!(summary.deposits_total, Money::from_minor(2000));

    let p1 = &summary.per_product["p1"];
    assert_eq!(p1.quantity, 3);
    assert_eq!(p1.total, Money::from_minor(750));
    assert_eq!(p1.name.as_deref(), Some("name-p1"));
    assert_eq!(summary.per_product["p2"].quantity, 1);

    let deposits_only = summarize(&rec, &EventFilter::only([DisplayCategory::Deposits]));
    assert_eq!(deposits_only.revenue, Money::ZERO);
    assert_eq!(deposits_only.deposit_count, 1);
    assert!(deposits_only.per_product.is_empty());

    let statement = user_statement(&rec, "u1");
    assert_eq!(statement.spent, Money::from_minor(900));
    assert_eq!(statement.refunded, Money::from_minor(250));
    assert_eq!(statement.voided, Money::from_minor(1200));
    assert_eq!(statement.deposited, Money::from_minor(2000));
    assert_eq!(statement.net_spent(), Money::from_minor(650));
}

#[test]
fn checkbox_keys_map_onto_display_categories() {
    let filter = EventFilter::from_keys(["SALE", "SALE_EDIT"]).expect("known keys");
    assert!(filter.admits_category(DisplayCategory::Sales));
    assert!(filter.admits_category(DisplayCategory::SaleEdits));
    assert!(!filter.admits_category(DisplayCategory::Deposits));
    assert!(EventFilter::from_keys(["COFFEE"]).is_err());
}

#[test]
fn window_bounds_are_half_open() {
    let window = EventWindow::new(10, 20);
    assert!(window.contains(10));
    assert!(!window.contains(20));
    assert_eq!(EventWindow::new(20, 10), window);
}

#[test]
fn wire_layout_decodes_sale_edit_with_camel_case_flag() {
    let ev: LedgerEvent = serde_json::from_value(json!({
        "id": "a9",
        "ts_ms": 77,
        "user_id": "u1",
        "event_type": "SALE_ADJUSTMENT",
        "details": {
            "adjusted_sale_id": "s1",
            "adjustment_amount": -12.346,
            "fullReversal": true,
            "reason": "spilled"
        }
    }))
    .expect("decode");
    let EventBody::SaleAdjustment(d) = &ev.body else {
        panic!("wrong body: {:?}", ev.body);
    };
    assert!(d.full_reversal);
    assert_eq!(d.adjustment_amount, Money::from_minor(-1235));
    assert_eq!(ev.target_sale_id(), Some("s1"));
}

#[tokio::test]
async fn desk_rejects_over_refund_without_calling_remote() {
    let remote = ScriptedRemote::new();
    let client = client(&remote, strict_config());
    let rec = reconcile(&[sale("s1", 1, 5000), adjustment("a1", 2, "s1", -2000, false)]);

    let err = client
        .desk()
        .submit_adjustment(&rec, AdjustmentRequest::refund("s1", Money::from_minor(3001), None))
        .await
        .unwrap_err();
    assert_eq!(err.remaining_refundable(), Some(Money::from_minor(3000)));
    assert!(remote.calls().is_empty());

    let err = client
        .desk()
        .submit_adjustment(&rec, AdjustmentRequest::refund("nope", Money::from_minor(1), None))
        .await
        .unwrap_err();
    assert_eq!(err, AdjustmentError::UnknownSale("nope".to_string()));
}

#[tokio::test]
async fn desk_applies_server_balance_after_refund() {
    let remote = ScriptedRemote::new();
    remote.push_rows(&[user("u1", 1000)]);
    remote.push_invoke(Ok(json!({"new_balance": 30.0, "event_id": "evt-9"})));
    let client = client(&remote, strict_config());
    client.coordinator().refresh_users().await.expect("seed");
    let rec = reconcile(&[sale("s1", 1, 5000)]);

    let view = rec.sale("s1").expect("sale");
    let request = AdjustmentRequest::full_refund(view);
    assert_eq!(request.amount, Money::from_minor(-5000));
    assert_eq!(request.reason.as_deref(), Some(FULL_REVERSAL_REASON));

    let receipt = client.desk().submit_adjustment(&rec, request).await.expect("accepted");
    assert_eq!(receipt.event_id.as_deref(), Some("evt-9"));
    assert_eq!(
        client.store().get::<cafeledger::entity::User>("u1").expect("u1").balance,
        Money::from_minor(3000)
    );
}

#[tokio::test]
async fn desk_surfaces_remote_rejection_and_refuses_second_undo() {
    let remote = ScriptedRemote::new();
    remote.push_invoke(Err(RemoteError::rejected("refund_ceiling", "too much")));
    let client = client(&remote, strict_config());
    let rec = reconcile(&[sale("s1", 1, 5000), undo("x1", 2, "s9"), sale("s9", 0, 100)]);

    let err = client
        .desk()
        .submit_adjustment(&rec, AdjustmentRequest::refund("s1", Money::from_minor(100), None))
        .await
        .unwrap_err();
    assert!(matches!(err, AdjustmentError::Remote(ref e) if e.rejection_code() == Some("refund_ceiling")));

    let err = client.desk().undo_sale(&rec, "s9").await.unwrap_err();
    assert!(matches!(
        err,
        AdjustmentError::Rejected(ref r) if r.reason == RejectionReason::SaleVoided
    ));
    assert_eq!(remote.calls(), vec!["invoke:register_adjustment".to_string()]);
}

proptest! {
    #[test]
    fn accepted_refunds_never_exceed_original(
        original in 1i64..100_000,
        requests in proptest::collection::vec(1i64..60_000, 1..12),
    ) {
        let mut events = vec![sale("s1", 0, original)];
        let mut accepted = 0i64;
        for (i, magnitude) in requests.into_iter().enumerate() {
            let rec = reconcile(&events);
            let view = rec.sale("s1").expect("sale");
            match check_adjustment(view, Money::from_minor(-magnitude)) {
                Ok(_) => {
                    accepted += magnitude;
                    events.push(adjustment(&format!("a{i}"), i as u64 + 1, "s1", -magnitude, false));
                }
                Err(rej) => {
                    prop_assert_eq!(rej.remaining_refundable, Money::from_minor(original - accepted));
                    let expected = if accepted == original {
                        RejectionReason::AlreadyFullyRefunded
                    } else {
                        RejectionReason::ExceedsCeiling
                    };
                    prop_assert_eq!(rej.reason, expected);
                    prop_assert!(accepted + magnitude > original);
                }
            }
            prop_assert!(accepted <= original);
        }
    }

    #[test]
    fn flag_and_sum_detect_full_reversal_alike(
        original in 1i64..100_000,
        split in 0.0f64..1.0,
    ) {
        let first = ((original as f64) * split) as i64;
        let rest = original - first;
        let mut by_sum = vec![sale("s1", 0, original)];
        if first > 0 {
            by_sum.push(adjustment("a1", 1, "s1", -first, false));
        }
        by_sum.push(adjustment("a2", 2, "s1", -rest, false));

        let by_flag = vec![sale("s1", 0, original), adjustment("a1", 1, "s1", -original, true)];

        let sum_view = reconcile(&by_sum).sale("s1").cloned().expect("sale");
        let flag_view = reconcile(&by_flag).sale("s1").cloned().expect("sale");
        prop_assert!(sum_view.is_fully_refunded);
        prop_assert!(flag_view.is_fully_refunded);
        prop_assert_eq!(sum_view.remaining_refundable, flag_view.remaining_refundable);
    }

    #[test]
    fn orphans_are_never_dropped(
        amounts in proptest::collection::vec(-10_000i64..-1, 1..10),
    ) {
        let events: Vec<LedgerEvent> = amounts
            .iter()
            .enumerate()
            .map(|(i, m)| adjustment(&format!("a{i}"), i as u64, &format!("gone-{i}"), *m, false))
            .collect();
        let rec = reconcile(&events);
        prop_assert_eq!(rec.orphan_adjustments().count(), amounts.len());
    }
}
