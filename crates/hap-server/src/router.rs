//! Endpoint dispatch for one decoded request.

use std::sync::Arc;

use hap_core::ids::{CharacteristicId, ConnectionId};
use hap_core::SetupCode;
use hap_pairing::{handle_pairings, IdentityStore, PairSetup, SetupAttempts};
use serde_json::{json, Value};
use tokio::task;
use tracing::{debug, info, warn};

use crate::accessories::{AccessoryDatabase, HapStatus};
use crate::events::EventBroadcaster;
use crate::http::{HttpRequest, HttpResponse, Method};
use crate::session::SessionRegistry;

/// What the connection task should do with a routed request.
#[derive(Debug)]
pub struct Routed {
    pub response: HttpResponse,
    /// Staged pair-verify keys take effect once this response is written.
    pub activate: bool,
    /// Close the connection after this response.
    pub close: bool,
}

impl From<HttpResponse> for Routed {
    fn from(response: HttpResponse) -> Self {
        Self {
            response,
            activate: false,
            close: false,
        }
    }
}

/// Shared state every connection routes requests against.
pub struct Router {
    registry: Arc<SessionRegistry>,
    store: Arc<IdentityStore>,
    attempts: Arc<SetupAttempts>,
    setup_code: SetupCode,
    database: Arc<dyn AccessoryDatabase>,
    events: EventBroadcaster,
}

impl Router {
    pub fn new(
        registry: Arc<SessionRegistry>,
        store: Arc<IdentityStore>,
        setup_code: SetupCode,
        database: Arc<dyn AccessoryDatabase>,
    ) -> Self {
        Self {
            events: EventBroadcaster::new(registry.clone()),
            registry,
            store,
            attempts: Arc::new(SetupAttempts::new()),
            setup_code,
            database,
        }
    }

    pub fn events(&self) -> &EventBroadcaster {
        &self.events
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        &self.store
    }

    pub async fn handle(&self, conn: ConnectionId, request: HttpRequest) -> Routed {
        debug!(conn = %conn, method = request.method.as_str(), path = %request.path, "request");

        let open_path = matches!(
            request.path.as_str(),
            "/pair-setup" | "/pair-verify" | "/identify"
        );
        if !open_path && !self.registry.is_encrypted(conn) {
            debug!(conn = %conn, path = %request.path, "request before pair-verify");
            return status_response(470, HapStatus::InsufficientPrivileges).into();
        }

        match (request.method, request.path.as_str()) {
            (Method::Post, "/pair-setup") => self.pair_setup(conn, request.body).await,
            (Method::Post, "/pair-verify") => self.pair_verify(conn, request.body).await,
            (Method::Post, "/pairings") => self.pairings(conn, request.body).await,
            (Method::Post, "/identify") => self.identify().await,
            (Method::Get, "/accessories") => {
                HttpResponse::json(200, &self.database.accessories_json().await).into()
            }
            (Method::Get, "/characteristics") => self.read_characteristics(&request).await,
            (Method::Put, "/characteristics") => {
                self.write_characteristics(conn, &request.body).await
            }
            (
                _,
                "/pair-setup" | "/pair-verify" | "/pairings" | "/identify" | "/accessories"
                | "/characteristics",
            ) => HttpResponse::new(405).into(),
            _ => HttpResponse::new(404).into(),
        }
    }

    async fn pair_setup(&self, conn: ConnectionId, body: Vec<u8>) -> Routed {
        let mut machine = self
            .registry
            .with_session(conn, |s| s.pair_setup.take())
            .unwrap_or_else(|| PairSetup::new(conn, self.setup_code.clone(), self.attempts.clone()));
        let store = self.store.clone();

        // Persisting the new controller in M5 is blocking storage I/O.
        let outcome = task::spawn_blocking(move || {
            let response = machine.handle(&body, &store);
            (machine, response)
        })
        .await;

        match outcome {
            Ok((machine, response)) => {
                if machine.is_complete() {
                    info!(conn = %conn, "pair-setup complete");
                }
                self.registry
                    .with_session(conn, |s| s.pair_setup = Some(machine));
                HttpResponse::tlv8(response).into()
            }
            Err(e) => {
                warn!(conn = %conn, error = %e, "pair-setup task failed");
                HttpResponse::new(500).into()
            }
        }
    }

    async fn pair_verify(&self, conn: ConnectionId, body: Vec<u8>) -> Routed {
        let mut machine = self
            .registry
            .with_session(conn, |s| s.pair_verify.take())
            .unwrap_or_default();
        let store = self.store.clone();

        let outcome = task::spawn_blocking(move || {
            let response = machine.handle(&body, &store);
            (machine, response)
        })
        .await;

        let (machine, response) = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(conn = %conn, error = %e, "pair-verify task failed");
                return HttpResponse::new(500).into();
            }
        };

        match response.verified {
            Some((controller_id, keys)) => {
                info!(conn = %conn, controller = %controller_id, "pair-verify complete");
                // The machine is spent once keys exist.
                self.registry.stage_keys(conn, controller_id, keys);
                Routed {
                    response: HttpResponse::tlv8(response.body),
                    activate: true,
                    close: false,
                }
            }
            None => {
                self.registry
                    .with_session(conn, |s| s.pair_verify = Some(machine));
                HttpResponse::tlv8(response.body).into()
            }
        }
    }

    async fn pairings(&self, conn: ConnectionId, body: Vec<u8>) -> Routed {
        let controller = self.registry.controller_of(conn);
        let store = self.store.clone();
        let outcome =
            task::spawn_blocking(move || handle_pairings(&body, controller.as_deref(), &store))
                .await;

        let result = match outcome {
            Ok(result) => result,
            Err(e) => {
                warn!(conn = %conn, error = %e, "pairings task failed");
                return HttpResponse::new(500).into();
            }
        };

        let mut close = false;
        for removed in &result.removed {
            for target in self.registry.connections_of(removed) {
                if target == conn {
                    close = true;
                } else if let Some(handle) = self.registry.handle(target) {
                    debug!(conn = %target, controller = %removed, "closing unpaired controller");
                    handle.closed.notify_one();
                }
            }
        }

        Routed {
            response: HttpResponse::tlv8(result.body),
            activate: false,
            close,
        }
    }

    async fn identify(&self) -> Routed {
        if self.store.is_paired() {
            return status_response(400, HapStatus::InsufficientPrivileges).into();
        }
        match self.database.identify().await {
            Ok(()) => HttpResponse::no_content().into(),
            Err(status) => status_response(500, status).into(),
        }
    }

    async fn read_characteristics(&self, request: &HttpRequest) -> Routed {
        let Some(ids) = request.query_param("id") else {
            return status_response(400, HapStatus::InvalidValue).into();
        };
        let ids: Result<Vec<CharacteristicId>, _> =
            ids.split(',').map(str::parse::<CharacteristicId>).collect();
        let Ok(ids) = ids else {
            return status_response(400, HapStatus::InvalidValue).into();
        };

        let mut entries = Vec::with_capacity(ids.len());
        let mut failed = false;
        for id in ids {
            match self.database.read(id).await {
                Ok(value) => entries.push((id, Ok(value))),
                Err(status) => {
                    failed = true;
                    entries.push((id, Err(status)));
                }
            }
        }

        let characteristics: Vec<Value> = entries
            .into_iter()
            .map(|(id, result)| match (result, failed) {
                (Ok(value), false) => json!({"aid": id.aid, "iid": id.iid, "value": value}),
                (Ok(value), true) => json!({
                    "aid": id.aid,
                    "iid": id.iid,
                    "value": value,
                    "status": HapStatus::Success.code(),
                }),
                (Err(status), _) => json!({"aid": id.aid, "iid": id.iid, "status": status.code()}),
            })
            .collect();

        let code = if failed { 207 } else { 200 };
        HttpResponse::json(code, &json!({ "characteristics": characteristics })).into()
    }

    async fn write_characteristics(&self, conn: ConnectionId, body: &[u8]) -> Routed {
        let Ok(document) = serde_json::from_slice::<Value>(body) else {
            return status_response(400, HapStatus::InvalidValue).into();
        };
        let Some(requests) = document.get("characteristics").and_then(Value::as_array) else {
            return status_response(400, HapStatus::InvalidValue).into();
        };

        let mut statuses = Vec::with_capacity(requests.len());
        for entry in requests {
            let (Some(aid), Some(iid)) = (
                entry.get("aid").and_then(Value::as_u64),
                entry.get("iid").and_then(Value::as_u64),
            ) else {
                return status_response(400, HapStatus::InvalidValue).into();
            };
            let id = CharacteristicId::new(aid, iid);
            statuses.push((id, self.write_one(conn, id, entry).await));
        }

        if statuses.iter().all(|(_, status)| *status == HapStatus::Success) {
            return HttpResponse::no_content().into();
        }
        let characteristics: Vec<Value> = statuses
            .into_iter()
            .map(|(id, status)| json!({"aid": id.aid, "iid": id.iid, "status": status.code()}))
            .collect();
        HttpResponse::json(207, &json!({ "characteristics": characteristics })).into()
    }

    async fn write_one(&self, conn: ConnectionId, id: CharacteristicId, entry: &Value) -> HapStatus {
        if let Some(ev) = entry.get("ev") {
            let Some(on) = ev.as_bool() else {
                return HapStatus::InvalidValue;
            };
            if on {
                if let Err(status) = self.database.subscribe(id).await {
                    return status;
                }
            }
            self.registry.set_subscription(conn, id, on);
            debug!(conn = %conn, characteristic = %id, on, "event subscription");
        }

        if let Some(value) = entry.get("value") {
            if let Err(status) = self.database.write(id, value.clone()).await {
                return status;
            }
            let value = self.database.read(id).await.unwrap_or_else(|_| value.clone());
            self.events.broadcast(id, &value, Some(conn));
        }
        HapStatus::Success
    }
}

fn status_response(code: u16, status: HapStatus) -> HttpResponse {
    HttpResponse::json(code, &json!({ "status": status.code() }))
}
