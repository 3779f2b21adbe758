//! Client-side data core for a prepaid cafeteria till.
//!
//! A shared [`core::store::CacheStore`] holds users and products. The
//! [`sync::refetch::RefetchCoordinator`] re-reads them under monotonic fetch tokens, the
//! [`sync::optimistic::OptimisticMutator`] applies edits locally before the remote call and
//! rolls them back on failure, and [`ledger`] reconciles sale adjustments and undos and
//! enforces the refund ceiling before any refund is submitted.
//!
//! # Examples
//!
//! Reconciling a window and gating a refund:
//! ```
//! use cafeledger::{
//!     ledger::{
//!         event::{AdjustmentDetails, EventBody, LedgerEvent, SaleDetails},
//!         reconcile::{RejectionReason, check_adjustment, reconcile},
//!     },
//!     types::Money,
//! };
//!
//! let sale = LedgerEvent {
//!     id: "s1".to_string(),
//!     ts_ms: 1,
//!     user_id: Some("u1".to_string()),
//!     body: EventBody::Sale(SaleDetails { total: Some(Money::from_major_units(50)), items: vec![] }),
//! };
//! let refund = LedgerEvent {
//!     id: "a1".to_string(),
//!     ts_ms: 2,
//!     user_id: Some("u1".to_string()),
//!     body: EventBody::SaleAdjustment(AdjustmentDetails {
//!         adjusted_sale_id: "s1".to_string(),
//!         adjustment_amount: Money::from_major_units(-20),
//!         full_reversal: false,
//!         reason: None,
//!         new_balance: None,
//!     }),
//! };
//!
//! let rec = reconcile(&[sale, refund]);
//! let view = rec.sale("s1").expect("sale in window");
//! assert_eq!(view.remaining_refundable, Money::from_major_units(30));
//!
//! let err = check_adjustment(view, Money::from_minor(-3001)).unwrap_err();
//! assert_eq!(err.reason, RejectionReason::ExceedsCeiling);
//! assert_eq!(err.remaining_refundable, Money::from_major_units(30));
//! ```
//!
//! Wiring a client against the SQLite stand-in:
//! ```no_run
//! use std::sync::Arc;
//!
//! use cafeledger::{
//!     client::CafeClient,
//!     config::ClientConfig,
//!     remote::{StaticSession, sqlite::SqliteDataService},
//! };
//!
//! # #[tokio::main]
//! # async fn main() {
//! let service = SqliteDataService::open("till.db").expect("open sqlite");
//! let client = CafeClient::new(
//!     Arc::new(service),
//!     Arc::new(StaticSession::new("inst-1")),
//!     ClientConfig::default(),
//! );
//! let report = client.coordinator().refresh_all().await;
//! println!("{report:?}");
//! let refresher = client.spawn_refresh_loop();
//! refresher.shutdown().await.expect("shutdown");
//! # }
//! ```
#![deny(missing_docs)]

/// Constructor-injected client bundle.
pub mod client;
/// Client configuration.
pub mod config;
/// Cache store and copy-on-write collections.
pub mod core;
/// Cached entities and patches.
pub mod entity;
/// Ledger events, reconciliation and refunds.
pub mod ledger;
/// Remote data service seam, retries and the SQLite stand-in.
pub mod remote;
/// Cache events and the background refresh loop.
pub mod runtime;
/// Refetch coordination and optimistic mutation.
pub mod sync;
/// Shared identifiers and money.
pub mod types;
