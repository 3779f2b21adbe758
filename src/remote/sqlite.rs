//! SQLite-backed stand-in for the remote data service.
//!
//! Implements the same query/procedure/update surface as the hosted service, with every
//! procedure running in one transaction and re-checking ledger rules server-side.

use std::{
    cmp::Ordering,
    collections::BTreeMap,
    path::Path,
    sync::{Arc, Mutex, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use async_trait::async_trait;
use rusqlite::{Connection, OptionalExtension, Transaction, params};
use serde_json::{Map, Value, json};

use crate::{
    entity::{EntityPatch, Product, ProductPatch, User, UserPatch},
    ledger::{
        event::{
            BalanceEditDetails, DepositDetails, EventBody, LedgerEvent, LineItem, SaleDetails,
            AdjustmentDetails, UndoDetails,
        },
        reconcile::{RejectionReason, check_adjustment, reconcile},
    },
    types::{EventId, InstitutionId, Money, TimestampMs},
};

use super::{
    Filter, FilterOp, ProcedureCall, Query, RemoteDataService, RemoteError, RemoteResult,
    Resource,
};

/// SQLite implementation of [`RemoteDataService`].
#[derive(Clone)]
pub struct SqliteDataService {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteDataService {
    /// Opens or creates a database at `path`.
    ///
    /// Enables WAL mode and sets `synchronous=NORMAL`.
    pub fn open(path: impl AsRef<Path>) -> RemoteResult<Self> {
        let conn = Connection::open(path)?;
        Self::init_connection(conn)
    }

    /// Opens a private in-memory database.
    pub fn open_in_memory() -> RemoteResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(conn)
    }

    fn init_connection(conn: Connection) -> RemoteResult<Self> {
        conn.execute_batch(include_str!("schema.sql"))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get::<_, String>(0))?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Inserts or replaces a user row, limits included.
    pub fn insert_user(&self, user: &User) -> RemoteResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO users(id, institution_id, display_name, balance_minor, is_adult, is_active)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    user.id,
                    user.institution_id,
                    user.display_name,
                    user.balance.minor(),
                    user.is_adult,
                    user.is_active
                ],
            )?;
            tx.execute("DELETE FROM product_limits WHERE user_id = ?1", params![user.id])?;
            for (product_id, limit) in &user.product_limits {
                tx.execute(
                    "INSERT INTO product_limits(user_id, product_id, max_per_day) VALUES (?1, ?2, ?3)",
                    params![user.id, product_id, limit],
                )?;
            }
            Ok(())
        })
    }

    /// Inserts or replaces a product row.
    pub fn insert_product(&self, product: &Product) -> RemoteResult<()> {
        self.with_tx(|tx| {
            tx.execute(
                "INSERT OR REPLACE INTO products(id, institution_id, name, price_minor, visible, sort_order)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    product.id,
                    product.institution_id,
                    product.name,
                    product.price.minor(),
                    product.visible,
                    product.sort_order
                ],
            )?;
            Ok(())
        })
    }

    /// Rings up a sale at current prices, debits the buyer, and appends the `SALE` event.
    pub fn record_sale(
        &self,
        user_id: &str,
        items: &[(&str, u32)],
        ts_ms: TimestampMs,
    ) -> RemoteResult<EventId> {
        self.with_tx(|tx| {
            let (balance, institution) = user_balance(tx, user_id)?;
            let mut lines = Vec::with_capacity(items.len());
            for (product_id, quantity) in items {
                let (name, price): (String, i64) = tx
                    .query_row(
                        "SELECT name, price_minor FROM products WHERE id = ?1",
                        params![product_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?
                    .ok_or_else(|| {
                        RemoteError::rejected("unknown_product", format!("no product {product_id}"))
                    })?;
                lines.push(LineItem {
                    product_id: (*product_id).to_string(),
                    product_name: Some(name),
                    quantity: *quantity,
                    unit_price: Money::from_minor(price),
                });
            }
            let total: Money = lines.iter().map(LineItem::total).sum();
            set_user_balance(tx, user_id, balance - total)?;
            append_event(
                tx,
                &institution,
                Some(user_id),
                ts_ms,
                None,
                EventBody::Sale(SaleDetails {
                    total: Some(total),
                    items: lines,
                }),
            )
        })
    }

    /// Authoritative balance, for assertions and diagnostics.
    pub fn balance_of(&self, user_id: &str) -> RemoteResult<Money> {
        self.with_tx(|tx| user_balance(tx, user_id).map(|(balance, _)| balance))
    }

    fn with_tx<R>(&self, f: impl FnOnce(&Transaction<'_>) -> RemoteResult<R>) -> RemoteResult<R> {
        let mut conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = conn.transaction()?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    async fn run_blocking<R, F>(&self, f: F) -> RemoteResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&Transaction<'_>) -> RemoteResult<R> + Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || this.with_tx(f))
            .await
            .map_err(|e| RemoteError::Storage(format!("join error: {e}")))?
    }
}

#[async_trait]
impl RemoteDataService for SqliteDataService {
    async fn query(&self, query: &Query) -> RemoteResult<Vec<Value>> {
        let query = query.clone();
        self.run_blocking(move |tx| {
            let rows = match query.resource {
                Resource::Users => load_users(tx)?,
                Resource::Products => load_products(tx)?,
                Resource::LedgerEvents => load_events(tx)?,
            };
            Ok(shape_rows(rows, &query))
        })
        .await
    }

    async fn invoke(&self, call: &ProcedureCall) -> RemoteResult<Value> {
        let call = call.clone();
        self.run_blocking(move |tx| run_procedure(tx, call, now_ms())).await
    }

    async fn update(&self, resource: Resource, id: &str, fields: Value) -> RemoteResult<Value> {
        let id = id.to_string();
        self.run_blocking(move |tx| match resource {
            Resource::Users => update_user(tx, &id, fields),
            Resource::Products => update_product(tx, &id, fields),
            Resource::LedgerEvents => Err(RemoteError::rejected(
                "append_only",
                "ledger events cannot be edited",
            )),
        })
        .await
    }
}

fn run_procedure(tx: &Transaction<'_>, call: ProcedureCall, ts_ms: TimestampMs) -> RemoteResult<Value> {
    match call {
        ProcedureCall::Deposit { user_id, amount } => {
            if !amount.is_positive() {
                return Err(RemoteError::rejected(
                    "invalid_amount",
                    "deposit must be positive",
                ));
            }
            let (balance, institution) = user_balance(tx, &user_id)?;
            let new_balance = balance + amount;
            set_user_balance(tx, &user_id, new_balance)?;
            let event_id = append_event(
                tx,
                &institution,
                Some(&user_id),
                ts_ms,
                None,
                EventBody::Deposit(DepositDetails {
                    amount,
                    new_balance: Some(new_balance),
                }),
            )?;
            Ok(json!({ "new_balance": new_balance, "event_id": event_id }))
        }
        ProcedureCall::SetBalance {
            user_id,
            new_balance,
        } => {
            let (old_balance, institution) = user_balance(tx, &user_id)?;
            set_user_balance(tx, &user_id, new_balance)?;
            let event_id = append_event(
                tx,
                &institution,
                Some(&user_id),
                ts_ms,
                None,
                EventBody::BalanceEdit(BalanceEditDetails {
                    old_balance: Some(old_balance),
                    new_balance,
                }),
            )?;
            Ok(json!({ "new_balance": new_balance, "event_id": event_id }))
        }
        ProcedureCall::RegisterAdjustment {
            sale_id,
            amount,
            reason,
            full_reversal,
        } => {
            let (sale, history) = sale_with_history(tx, &sale_id)?;
            let rec = reconcile(&history);
            let view = rec
                .sale(&sale_id)
                .ok_or_else(|| RemoteError::rejected("unknown_sale", format!("no sale {sale_id}")))?;
            check_adjustment(view, amount).map_err(|rej| {
                let code = match rej.reason {
                    RejectionReason::ExceedsCeiling => "refund_ceiling",
                    RejectionReason::SaleVoided => "sale_voided",
                    RejectionReason::AlreadyFullyRefunded => "already_refunded",
                    RejectionReason::ZeroAmount => "invalid_amount",
                };
                RemoteError::rejected(code, rej.message())
            })?;

            let user_id = buyer_of(&sale)?;
            let (balance, institution) = user_balance(tx, &user_id)?;
            let new_balance = balance - amount;
            set_user_balance(tx, &user_id, new_balance)?;
            let event_id = append_event(
                tx,
                &institution,
                Some(&user_id),
                ts_ms,
                Some(&sale_id),
                EventBody::SaleAdjustment(AdjustmentDetails {
                    adjusted_sale_id: sale_id.clone(),
                    adjustment_amount: amount,
                    full_reversal,
                    reason,
                    new_balance: Some(new_balance),
                }),
            )?;
            Ok(json!({ "new_balance": new_balance, "event_id": event_id }))
        }
        ProcedureCall::UndoSale { sale_id } => {
            let (sale, history) = sale_with_history(tx, &sale_id)?;
            let rec = reconcile(&history);
            let view = rec
                .sale(&sale_id)
                .ok_or_else(|| RemoteError::rejected("unknown_sale", format!("no sale {sale_id}")))?;
            if view.is_voided {
                return Err(RemoteError::rejected(
                    "sale_voided",
                    format!("sale {sale_id} is already undone"),
                ));
            }
            let refunded = view.net_amount();

            let user_id = buyer_of(&sale)?;
            let (balance, institution) = user_balance(tx, &user_id)?;
            let new_balance = balance + refunded;
            set_user_balance(tx, &user_id, new_balance)?;
            let event_id = append_event(
                tx,
                &institution,
                Some(&user_id),
                ts_ms,
                Some(&sale_id),
                EventBody::SaleUndo(UndoDetails {
                    undone_sale_id: sale_id.clone(),
                    refunded_amount: Some(refunded),
                    new_balance: Some(new_balance),
                }),
            )?;
            Ok(json!({ "new_balance": new_balance, "event_id": event_id }))
        }
        ProcedureCall::SetProductLimit {
            user_id,
            product_id,
            limit,
        } => {
            user_balance(tx, &user_id)?;
            match limit {
                Some(limit) => {
                    tx.execute(
                        "INSERT INTO product_limits(user_id, product_id, max_per_day) VALUES (?1, ?2, ?3)
                         ON CONFLICT(user_id, product_id) DO UPDATE SET max_per_day = excluded.max_per_day",
                        params![user_id, product_id, limit],
                    )?;
                }
                None => {
                    tx.execute(
                        "DELETE FROM product_limits WHERE user_id = ?1 AND product_id = ?2",
                        params![user_id, product_id],
                    )?;
                }
            }
            Ok(json!({ "product_id": product_id, "limit": limit }))
        }
    }
}

fn buyer_of(sale: &LedgerEvent) -> RemoteResult<String> {
    sale.user_id
        .clone()
        .ok_or_else(|| RemoteError::rejected("unknown_user", format!("sale {} has no buyer", sale.id)))
}

fn user_balance(tx: &Transaction<'_>, user_id: &str) -> RemoteResult<(Money, InstitutionId)> {
    tx.query_row(
        "SELECT balance_minor, institution_id FROM users WHERE id = ?1",
        params![user_id],
        |row| Ok((Money::from_minor(row.get(0)?), row.get(1)?)),
    )
    .optional()?
    .ok_or_else(|| RemoteError::rejected("unknown_user", format!("no user {user_id}")))
}

fn set_user_balance(tx: &Transaction<'_>, user_id: &str, balance: Money) -> RemoteResult<()> {
    tx.execute(
        "UPDATE users SET balance_minor = ?1 WHERE id = ?2",
        params![balance.minor(), user_id],
    )?;
    Ok(())
}

fn append_event(
    tx: &Transaction<'_>,
    institution_id: &str,
    user_id: Option<&str>,
    ts_ms: TimestampMs,
    target_id: Option<&str>,
    body: EventBody,
) -> RemoteResult<EventId> {
    let seq: i64 = tx.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM ledger_events",
        [],
        |row| row.get(0),
    )?;
    let event = LedgerEvent {
        id: format!("evt-{seq}"),
        ts_ms,
        user_id: user_id.map(str::to_string),
        body,
    };
    let wire = serde_json::to_value(&event)?;
    tx.execute(
        "INSERT INTO ledger_events(seq, id, institution_id, user_id, ts_ms, event_type, target_id, details)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            seq,
            event.id,
            institution_id,
            user_id,
            ts_ms as i64,
            event.kind().as_str(),
            target_id,
            wire["details"].to_string(),
        ],
    )?;
    Ok(event.id)
}

fn sale_with_history(tx: &Transaction<'_>, sale_id: &str) -> RemoteResult<(LedgerEvent, Vec<LedgerEvent>)> {
    let mut stmt = tx.prepare(
        "SELECT id, ts_ms, user_id, event_type, details FROM ledger_events
         WHERE id = ?1 OR target_id = ?1 ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map(params![sale_id], event_row_to_value)?;
    let mut history = Vec::new();
    for row in rows {
        history.push(serde_json::from_value::<LedgerEvent>(row??)?);
    }
    let sale = history
        .iter()
        .find(|ev| ev.id == sale_id && matches!(ev.body, EventBody::Sale(_)))
        .cloned()
        .ok_or_else(|| RemoteError::rejected("unknown_sale", format!("no sale {sale_id}")))?;
    Ok((sale, history))
}

fn event_row_to_value(row: &rusqlite::Row<'_>) -> rusqlite::Result<RemoteResult<Value>> {
    let id: String = row.get("id")?;
    let ts_ms: i64 = row.get("ts_ms")?;
    let user_id: Option<String> = row.get("user_id")?;
    let event_type: String = row.get("event_type")?;
    let details: String = row.get("details")?;
    Ok(serde_json::from_str::<Value>(&details)
        .map_err(RemoteError::from)
        .map(|details| {
            json!({
                "id": id,
                "ts_ms": ts_ms,
                "user_id": user_id,
                "event_type": event_type,
                "details": details,
            })
        }))
}

fn load_users(tx: &Transaction<'_>) -> RemoteResult<Vec<Value>> {
    let mut limits: BTreeMap<String, BTreeMap<String, u32>> = BTreeMap::new();
    {
        let mut stmt = tx.prepare("SELECT user_id, product_id, max_per_day FROM product_limits")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?, row.get::<_, u32>(2)?))
        })?;
        for row in rows {
            let (user_id, product_id, limit) = row?;
            limits.entry(user_id).or_default().insert(product_id, limit);
        }
    }

    let mut stmt = tx.prepare(
        "SELECT id, institution_id, display_name, balance_minor, is_adult, is_active FROM users",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok(User {
            id: row.get(0)?,
            institution_id: row.get(1)?,
            display_name: row.get(2)?,
            balance: Money::from_minor(row.get(3)?),
            is_adult: row.get(4)?,
            is_active: row.get(5)?,
            product_limits: BTreeMap::new(),
        })
    })?;

    let mut out = Vec::new();
    for row in rows {
        let mut user = row?;
        if let Some(l) = limits.remove(&user.id) {
            user.product_limits = l;
        }
        out.push(serde_json::to_value(&user)?);
    }
    Ok(out)
}

fn load_products(tx: &Transaction<'_>) -> RemoteResult<Vec<Value>> {
    let mut stmt = tx.prepare(
        "SELECT id, institution_id, name, price_minor, visible, sort_order FROM products",
    )?;
    let rows = stmt.query_map([], product_from_row)?;
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::to_value(&row?)?);
    }
    Ok(out)
}

fn product_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    Ok(Product {
        id: row.get(0)?,
        institution_id: row.get(1)?,
        name: row.get(2)?,
        price: Money::from_minor(row.get(3)?),
        visible: row.get(4)?,
        sort_order: row.get(5)?,
    })
}

fn load_events(tx: &Transaction<'_>) -> RemoteResult<Vec<Value>> {
    let mut stmt = tx.prepare(
        "SELECT id, ts_ms, user_id, event_type, details, institution_id FROM ledger_events ORDER BY seq ASC",
    )?;
    let rows = stmt.query_map([], |row| {
        let institution_id: String = row.get("institution_id")?;
        Ok(event_row_to_value(row)?.map(|mut v| {
            v["institution_id"] = Value::String(institution_id);
            v
        }))
    })?;
    let mut out = Vec::new();
    for row in rows {
        out.push(row??);
    }
    Ok(out)
}

fn update_user(tx: &Transaction<'_>, id: &str, fields: Value) -> RemoteResult<Value> {
    let patch: UserPatch = serde_json::from_value(fields)?;
    if patch.balance.is_some() {
        return Err(RemoteError::rejected(
            "procedure_only",
            "balances change only through procedures",
        ));
    }
    let current = load_users(tx)?
        .into_iter()
        .map(serde_json::from_value::<User>)
        .find(|u| u.as_ref().is_ok_and(|u| u.id == id))
        .transpose()?
        .ok_or_else(|| RemoteError::rejected("unknown_user", format!("no user {id}")))?;
    let next = patch.applied(&current);
    tx.execute(
        "UPDATE users SET display_name = ?1, is_active = ?2 WHERE id = ?3",
        params![next.display_name, next.is_active, id],
    )?;
    if patch.product_limits.is_some() {
        tx.execute("DELETE FROM product_limits WHERE user_id = ?1", params![id])?;
        for (product_id, limit) in &next.product_limits {
            tx.execute(
                "INSERT INTO product_limits(user_id, product_id, max_per_day) VALUES (?1, ?2, ?3)",
                params![id, product_id, limit],
            )?;
        }
    }
    Ok(serde_json::to_value(&next)?)
}

fn update_product(tx: &Transaction<'_>, id: &str, fields: Value) -> RemoteResult<Value> {
    let patch: ProductPatch = serde_json::from_value(fields)?;
    let current = tx
        .query_row(
            "SELECT id, institution_id, name, price_minor, visible, sort_order FROM products WHERE id = ?1",
            params![id],
            product_from_row,
        )
        .optional()?
        .ok_or_else(|| RemoteError::rejected("unknown_product", format!("no product {id}")))?;
    let next = patch.applied(&current);
    tx.execute(
        "UPDATE products SET name = ?1, price_minor = ?2, visible = ?3, sort_order = ?4 WHERE id = ?5",
        params![next.name, next.price.minor(), next.visible, next.sort_order, id],
    )?;
    Ok(serde_json::to_value(&next)?)
}

fn shape_rows(rows: Vec<Value>, query: &Query) -> Vec<Value> {
    let mut rows: Vec<Value> = rows
        .into_iter()
        .filter(|row| query.filters.iter().all(|f| filter_matches(f, row)))
        .collect();

    if !query.ordering.is_empty() {
        rows.sort_by(|a, b| {
            query
                .ordering
                .iter()
                .map(|o| {
                    let ord = compare_values(&a[&o.column], &b[&o.column]).unwrap_or(Ordering::Equal);
                    if o.ascending { ord } else { ord.reverse() }
                })
                .find(|ord| *ord != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        });
    }

    match &query.columns {
        None => rows,
        Some(columns) => rows
            .into_iter()
            .map(|row| {
                let projected: Map<String, Value> = columns
                    .iter()
                    .filter_map(|c| row.get(c).map(|v| (c.clone(), v.clone())))
                    .collect();
                Value::Object(projected)
            })
            .collect(),
    }
}

fn filter_matches(filter: &Filter, row: &Value) -> bool {
    let Some(actual) = row.get(&filter.column) else {
        return false;
    };
    match filter.op {
        FilterOp::Eq => compare_values(actual, &filter.value) == Some(Ordering::Equal),
        FilterOp::Gte => matches!(
            compare_values(actual, &filter.value),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOp::Lt => compare_values(actual, &filter.value) == Some(Ordering::Less),
        FilterOp::In => filter.value.as_array().is_some_and(|options| {
            options
                .iter()
                .any(|v| compare_values(actual, v) == Some(Ordering::Equal))
        }),
    }
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        _ => None,
    }
}

fn now_ms() -> TimestampMs {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
