#![allow(dead_code)]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;

use cafeledger::{
    client::CafeClient,
    config::ClientConfig,
    entity::{Product, User},
    remote::{
        ProcedureCall, Query, RemoteDataService, RemoteError, RemoteResult, Resource,
        StaticSession,
    },
    types::Money,
};

struct Scripted<T> {
    gate: Option<oneshot::Receiver<()>>,
    result: RemoteResult<T>,
}

impl<T> Scripted<T> {
    async fn resolve(self) -> RemoteResult<T> {
        if let Some(gate) = self.gate {
            let _ = gate.await;
        }
        self.result
    }
}

/// Remote that answers from queued scripts, optionally holding an answer until released.
#[derive(Default)]
pub struct ScriptedRemote {
    queries: Mutex<VecDeque<Scripted<Vec<Value>>>>,
    invokes: Mutex<VecDeque<Scripted<Value>>>,
    updates: Mutex<VecDeque<Scripted<Value>>>,
    calls: Mutex<Vec<String>>,
}

impl ScriptedRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn push_rows<T: serde::Serialize>(&self, rows: &[T]) {
        self.push_query(None, Ok(to_rows(rows)));
    }

    pub fn push_gated_rows<T: serde::Serialize>(&self, rows: &[T]) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.push_query(Some(rx), Ok(to_rows(rows)));
        tx
    }

    pub fn push_raw_rows(&self, rows: Vec<Value>) {
        self.push_query(None, Ok(rows));
    }

    pub fn push_query_error(&self, err: RemoteError) {
        self.push_query(None, Err(err));
    }

    pub fn push_invoke(&self, result: RemoteResult<Value>) {
        self.invokes.lock().expect("lock").push_back(Scripted { gate: None, result });
    }

    pub fn push_gated_invoke(&self, result: RemoteResult<Value>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.invokes.lock().expect("lock").push_back(Scripted {
            gate: Some(rx),
            result,
        });
        tx
    }

    pub fn push_update(&self, result: RemoteResult<Value>) {
        self.updates.lock().expect("lock").push_back(Scripted { gate: None, result });
    }

    pub fn push_gated_update(&self, result: RemoteResult<Value>) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        self.updates.lock().expect("lock").push_back(Scripted {
            gate: Some(rx),
            result,
        });
        tx
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().expect("lock").clone()
    }

    fn push_query(&self, gate: Option<oneshot::Receiver<()>>, result: RemoteResult<Vec<Value>>) {
        self.queries.lock().expect("lock").push_back(Scripted { gate, result });
    }

    fn record(&self, call: String) {
        self.calls.lock().expect("lock").push(call);
    }
}

#[async_trait]
impl RemoteDataService for ScriptedRemote {
    async fn query(&self, query: &Query) -> RemoteResult<Vec<Value>> {
        self.record(format!("query:{}", query.resource.as_str()));
        let next = self.queries.lock().expect("lock").pop_front();
        match next {
            Some(script) => script.resolve().await,
            None => Ok(Vec::new()),
        }
    }

    async fn invoke(&self, call: &ProcedureCall) -> RemoteResult<Value> {
        self.record(format!("invoke:{}", call.name()));
        let next = self.invokes.lock().expect("lock").pop_front();
        match next {
            Some(script) => script.resolve().await,
            None => Ok(Value::Null),
        }
    }

    async fn update(&self, resource: Resource, id: &str, _fields: Value) -> RemoteResult<Value> {
        self.record(format!("update:{}:{id}", resource.as_str()));
        let next = self.updates.lock().expect("lock").pop_front();
        match next {
            Some(script) => script.resolve().await,
            None => Err(RemoteError::rejected("unscripted", "no update scripted")),
        }
    }
}

fn to_rows<T: serde::Serialize>(rows: &[T]) -> Vec<Value> {
    rows.iter()
        .map(|r| serde_json::to_value(r).expect("encode row"))
        .collect()
}

pub fn user(id: &str, balance_minor: i64) -> User {
    User {
        id: id.to_string(),
        institution_id: "inst".to_string(),
        display_name: format!("User {id}"),
        balance: Money::from_minor(balance_minor),
        is_adult: false,
        is_active: true,
        product_limits: BTreeMap::new(),
    }
}

pub fn product(id: &str, price_minor: i64, sort_order: i32) -> Product {
    Product {
        id: id.to_string(),
        institution_id: "inst".to_string(),
        name: format!("Product {id}"),
        price: Money::from_minor(price_minor),
        visible: true,
        sort_order,
    }
}

pub fn client(remote: &Arc<ScriptedRemote>, config: ClientConfig) -> CafeClient {
    let service: Arc<dyn RemoteDataService> = Arc::clone(remote) as Arc<dyn RemoteDataService>;
    CafeClient::new(service, Arc::new(StaticSession::new("inst")), config)
}

/// Config with retries off so each scripted failure is seen exactly once.
pub fn strict_config() -> ClientConfig {
    ClientConfig {
        transport_retry_budget: 0,
        refresh_interval_ms: 0,
        ..ClientConfig::default()
    }
}
