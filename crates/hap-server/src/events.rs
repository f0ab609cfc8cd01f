//! Characteristic change notifications.

use std::sync::Arc;

use hap_core::ids::{CharacteristicId, ConnectionId};
use serde_json::{json, Value};
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use crate::http::HttpResponse;
use crate::session::{Outbound, SessionRegistry};

/// Fans a value change out to every subscribed connection.
///
/// Delivery goes through each connection's writer queue, so events are
/// encrypted on the same path as responses. A full or closed queue only
/// affects that one connection.
#[derive(Clone)]
pub struct EventBroadcaster {
    registry: Arc<SessionRegistry>,
}

impl EventBroadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Notify subscribers of `characteristic`, skipping `origin`.
    ///
    /// Returns the number of connections the event was queued for.
    pub fn broadcast(
        &self,
        characteristic: CharacteristicId,
        value: &Value,
        origin: Option<ConnectionId>,
    ) -> usize {
        let message = event_message(characteristic, value);
        let mut delivered = 0;

        for conn in self.registry.subscribers_of(characteristic) {
            if Some(conn) == origin || !self.registry.is_encrypted(conn) {
                continue;
            }
            let Some(handle) = self.registry.handle(conn) else {
                continue;
            };
            match handle.outbound.try_send(Outbound::Event(message.clone())) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(conn = %conn, characteristic = %characteristic, "event queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(conn = %conn, "connection gone before event delivery");
                }
            }
        }

        debug!(characteristic = %characteristic, delivered, "event broadcast");
        delivered
    }
}

/// Serialized `EVENT/1.0` message for one characteristic value.
pub fn event_message(characteristic: CharacteristicId, value: &Value) -> Vec<u8> {
    let body = json!({
        "characteristics": [{
            "aid": characteristic.aid,
            "iid": characteristic.iid,
            "value": value,
        }]
    });
    HttpResponse::json(200, &body).serialize_event()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::ConnectionHandle;
    use hap_crypto::keys::{EncryptionKey, SessionKeys};
    use tokio::sync::{mpsc, Notify};

    const LIGHT: CharacteristicId = CharacteristicId { aid: 1, iid: 10 };

    fn connect(
        registry: &SessionRegistry,
        conn: ConnectionId,
        encrypted: bool,
        capacity: usize,
    ) -> mpsc::Receiver<Outbound> {
        let (tx, rx) = mpsc::channel(capacity);
        registry.attach(
            conn,
            "127.0.0.1:50000".parse().unwrap(),
            ConnectionHandle {
                outbound: tx,
                closed: Arc::new(Notify::new()),
            },
        );
        if encrypted {
            registry.stage_keys(
                conn,
                format!("ctrl-{}", conn.0),
                SessionKeys {
                    encrypt_key: EncryptionKey::new([1; 32]),
                    decrypt_key: EncryptionKey::new([2; 32]),
                },
            );
            registry.activate_staged(conn);
        }
        rx
    }

    fn event_bytes(outbound: Outbound) -> Vec<u8> {
        match outbound {
            Outbound::Event(bytes) => bytes,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn message_uses_event_token() {
        let bytes = event_message(LIGHT, &json!(true));
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("EVENT/1.0 200 OK\r\n"));
        assert!(text.contains("application/hap+json"));
        assert!(text.ends_with(r#"{"characteristics":[{"aid":1,"iid":10,"value":true}]}"#));
    }

    #[tokio::test]
    async fn skips_origin_and_unsubscribed() {
        let registry = Arc::new(SessionRegistry::new());
        let mut origin = connect(&registry, ConnectionId(1), true, 4);
        let mut other = connect(&registry, ConnectionId(2), true, 4);
        let mut idle = connect(&registry, ConnectionId(3), true, 4);
        registry.set_subscription(ConnectionId(1), LIGHT, true);
        registry.set_subscription(ConnectionId(2), LIGHT, true);

        let broadcaster = EventBroadcaster::new(registry);
        let delivered = broadcaster.broadcast(LIGHT, &json!(1), Some(ConnectionId(1)));

        assert_eq!(delivered, 1);
        let bytes = event_bytes(other.recv().await.unwrap());
        assert!(bytes.starts_with(b"EVENT/1.0"));
        assert!(origin.try_recv().is_err());
        assert!(idle.try_recv().is_err());
    }

    #[tokio::test]
    async fn unencrypted_subscribers_are_ignored() {
        let registry = Arc::new(SessionRegistry::new());
        let mut plain = connect(&registry, ConnectionId(1), false, 4);
        registry.set_subscription(ConnectionId(1), LIGHT, true);

        let broadcaster = EventBroadcaster::new(registry);
        assert_eq!(broadcaster.broadcast(LIGHT, &json!(0), None), 0);
        assert!(plain.try_recv().is_err());
    }

    #[tokio::test]
    async fn one_stuck_connection_does_not_block_others() {
        let registry = Arc::new(SessionRegistry::new());
        let _stuck = connect(&registry, ConnectionId(1), true, 1);
        let gone = connect(&registry, ConnectionId(2), true, 1);
        let mut healthy = connect(&registry, ConnectionId(3), true, 4);
        drop(gone);
        for conn in [1, 2, 3] {
            registry.set_subscription(ConnectionId(conn), LIGHT, true);
        }

        let broadcaster = EventBroadcaster::new(registry);
        assert_eq!(broadcaster.broadcast(LIGHT, &json!(1), None), 2);
        // The stuck queue is now full; the healthy one keeps receiving.
        assert_eq!(broadcaster.broadcast(LIGHT, &json!(2), None), 1);

        assert!(event_bytes(healthy.recv().await.unwrap()).ends_with(br#""value":1}]}"#));
        assert!(event_bytes(healthy.recv().await.unwrap()).ends_with(br#""value":2}]}"#));
    }
}
