//! End-to-end tests against a real server on a loopback socket.
//!
//! The controller side is driven by `hap_pairing`'s controller flows; after
//! pair-verify the test client frames its traffic with its own cipher.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use hap_core::{CharacteristicId, Config, ConnectionId, PairingEvent};
use hap_crypto::chacha::{frame_len, FrameCipher};
use hap_crypto::tlv::{Tlv8, TlvType};
use hap_pairing::{
    AccessoryInfo, ControllerIdentity, ControllerPairSetup, ControllerPairVerify, FileStorage,
    IdentityStore, MemoryStorage, Storage,
};
use hap_server::{HttpRequest, HttpResponse, MemoryAccessories, Method, Server};
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;

const ON: CharacteristicId = CharacteristicId { aid: 1, iid: 10 };
const LABEL: CharacteristicId = CharacteristicId { aid: 1, iid: 20 };
const PIN: &str = "001-02-003";

/// Lightbulb plus a writable free-text characteristic for large payloads.
fn database() -> MemoryAccessories {
    MemoryAccessories::new(json!({
        "accessories": [{
            "aid": 1,
            "services": [
                {
                    "iid": 1,
                    "type": "3E",
                    "characteristics": [
                        {"iid": 2, "type": "14", "perms": ["pw"], "format": "bool"}
                    ]
                },
                {
                    "iid": 8,
                    "type": "43",
                    "characteristics": [
                        {"iid": 10, "type": "25", "perms": ["pr", "pw", "ev"], "format": "bool", "value": false},
                        {"iid": 20, "type": "E863F10A", "perms": ["pr", "pw"], "format": "string", "value": ""}
                    ]
                }
            ]
        }]
    }))
    .unwrap()
}

struct Harness {
    server: Arc<Server>,
    task: JoinHandle<hap_core::Result<()>>,
    addr: SocketAddr,
}

impl Harness {
    async fn start(storage: Arc<dyn Storage>) -> Self {
        let mut config = Config::default();
        config.server.bind_address = IpAddr::V4(Ipv4Addr::LOCALHOST);
        config.server.port = 0;

        let store = Arc::new(IdentityStore::load_or_create(storage).unwrap());
        let server = Arc::new(Server::bind(&config, store, Arc::new(database())).await.unwrap());
        let addr = server.local_addr().unwrap();
        let running = server.clone();
        let task = tokio::spawn(async move { running.run(std::future::pending()).await });
        Self { server, task, addr }
    }

    async fn in_memory() -> Self {
        Self::start(Arc::new(MemoryStorage::new())).await
    }

    fn store(&self) -> &IdentityStore {
        self.server.store()
    }

    async fn shutdown(self) {
        self.server.stop();
        self.task.await.unwrap().unwrap();
    }
}

/// Minimal HAP controller speaking over one TCP connection.
struct TestController {
    stream: TcpStream,
    cipher: Option<FrameCipher>,
    raw: Vec<u8>,
    plain: Vec<u8>,
    events: Vec<HttpResponse>,
}

impl TestController {
    async fn connect(addr: SocketAddr) -> Self {
        Self {
            stream: TcpStream::connect(addr).await.unwrap(),
            cipher: None,
            raw: Vec::new(),
            plain: Vec::new(),
            events: Vec::new(),
        }
    }

    async fn send(&mut self, request: HttpRequest) {
        let bytes = request.serialize();
        let wire = match self.cipher.as_mut() {
            Some(cipher) => cipher.encrypt(&bytes).unwrap(),
            None => bytes,
        };
        self.stream.write_all(&wire).await.unwrap();
    }

    /// Next complete message, or `None` once the accessory closes the socket.
    async fn receive(&mut self) -> Option<(HttpResponse, bool)> {
        loop {
            if let Some((message, is_event, used)) = HttpResponse::parse(&self.plain).unwrap() {
                self.plain.drain(..used);
                return Some((message, is_event));
            }
            let mut buf = [0u8; 4096];
            let n = self.stream.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                return None;
            }
            self.raw.extend_from_slice(&buf[..n]);
            self.decode_frames();
        }
    }

    fn decode_frames(&mut self) {
        let Some(cipher) = self.cipher.as_mut() else {
            self.plain.append(&mut self.raw);
            return;
        };
        while let Some(len) = frame_len(&self.raw).unwrap() {
            if self.raw.len() < len {
                break;
            }
            let block = cipher.decrypt(&self.raw[..len]).unwrap();
            self.plain.extend_from_slice(&block);
            self.raw.drain(..len);
        }
    }

    /// Send a request and return its response, setting aside any events.
    async fn request(&mut self, request: HttpRequest) -> HttpResponse {
        self.send(request).await;
        loop {
            let (message, is_event) = self.receive().await.expect("connection closed");
            if is_event {
                self.events.push(message);
            } else {
                return message;
            }
        }
    }

    async fn next_event(&mut self) -> HttpResponse {
        if !self.events.is_empty() {
            return self.events.remove(0);
        }
        let received = tokio::time::timeout(Duration::from_secs(5), self.receive())
            .await
            .expect("no event in time");
        let (message, is_event) = received.expect("connection closed");
        assert!(is_event, "expected an event, got a response");
        message
    }

    async fn post_tlv(&mut self, path: &str, body: Vec<u8>) -> Vec<u8> {
        let response = self
            .request(
                HttpRequest::new(Method::Post, path)
                    .header("Content-Type", "application/pairing+tlv8")
                    .body(body),
            )
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(response.header("Content-Type"), Some("application/pairing+tlv8"));
        response.body
    }

    async fn pair_setup(
        &mut self,
        pin: &str,
        identity: &ControllerIdentity,
    ) -> hap_core::Result<AccessoryInfo> {
        let mut setup = ControllerPairSetup::new(pin);
        let m2 = self.post_tlv("/pair-setup", setup.generate_m1()?).await;
        setup.process_m2(&m2)?;
        let m4 = self.post_tlv("/pair-setup", setup.generate_m3()?).await;
        setup.process_m4(&m4)?;
        let m6 = self.post_tlv("/pair-setup", setup.generate_m5(identity)?).await;
        setup.process_m6(&m6)
    }

    async fn pair_verify(&mut self, identity: &ControllerIdentity, accessory: &AccessoryInfo) {
        let mut verify = ControllerPairVerify::new(identity.clone(), accessory.public_key);
        let m2 = self.post_tlv("/pair-verify", verify.generate_m1()).await;
        verify.process_m2(&m2).unwrap();
        let m4 = self.post_tlv("/pair-verify", verify.generate_m3().unwrap()).await;
        let keys = verify.process_m4(&m4).unwrap();
        self.cipher = Some(keys.cipher());
    }

    async fn put_characteristics(&mut self, body: Value) -> HttpResponse {
        self.request(
            HttpRequest::new(Method::Put, "/characteristics")
                .header("Content-Type", "application/hap+json")
                .body(body.to_string().into_bytes()),
        )
        .await
    }

    async fn subscribe(&mut self, id: CharacteristicId) {
        let response = self
            .put_characteristics(json!({"characteristics": [{"aid": id.aid, "iid": id.iid, "ev": true}]}))
            .await;
        assert_eq!(response.status_code, 204);
    }
}

fn json_body(response: &HttpResponse) -> Value {
    serde_json::from_slice(&response.body).unwrap()
}

/// Pair one controller and return a verified connection for it.
async fn paired_controller(
    harness: &Harness,
) -> (TestController, ControllerIdentity, AccessoryInfo) {
    let identity = ControllerIdentity::generate();
    let mut controller = TestController::connect(harness.addr).await;
    let accessory = controller.pair_setup(PIN, &identity).await.unwrap();
    controller.pair_verify(&identity, &accessory).await;
    (controller, identity, accessory)
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached in time");
}

mod pairing {
    use super::*;

    #[tokio::test]
    async fn pair_setup_persists_the_controller() {
        let dir = tempfile::tempdir().unwrap();
        let harness = Harness::start(Arc::new(FileStorage::open(dir.path()).unwrap())).await;
        let mut events = harness.store().subscribe();
        assert!(!harness.store().is_paired());

        let identity = ControllerIdentity::generate();
        let mut controller = TestController::connect(harness.addr).await;
        let accessory = controller.pair_setup(PIN, &identity).await.unwrap();

        assert_eq!(accessory.id, harness.store().identifier());
        assert!(harness.store().is_paired());
        let controllers = harness.store().controllers();
        assert_eq!(controllers.len(), 1);
        assert_eq!(controllers[0].public_key, identity.public_key());
        assert_eq!(
            events.try_recv().unwrap(),
            PairingEvent::DevicePaired {
                controller_id: identity.id().to_string()
            }
        );
        harness.shutdown().await;

        // The record survives a restart on the same storage.
        let reopened = IdentityStore::load_or_create(Arc::new(FileStorage::open(dir.path()).unwrap()))
            .unwrap();
        assert!(reopened.is_paired());
        assert_eq!(reopened.identifier(), accessory.id);
    }

    #[tokio::test]
    async fn wrong_pin_creates_no_record() {
        let harness = Harness::in_memory().await;
        let identity = ControllerIdentity::generate();
        let mut controller = TestController::connect(harness.addr).await;

        assert!(controller.pair_setup("111-22-333", &identity).await.is_err());
        assert!(!harness.store().is_paired());
        assert!(harness.store().controller(identity.id()).is_none());
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn second_setup_is_unavailable_once_paired() {
        let harness = Harness::in_memory().await;
        let (_first, _, _) = paired_controller(&harness).await;

        let mut late = TestController::connect(harness.addr).await;
        let err = late
            .pair_setup(PIN, &ControllerIdentity::generate())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            hap_core::Error::Pairing(hap_core::PairingError::Unavailable)
        ));
        assert_eq!(harness.store().controllers().len(), 1);
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn removed_controller_is_disconnected() {
        let harness = Harness::in_memory().await;
        let (mut admin, _, accessory) = paired_controller(&harness).await;

        let guest = ControllerIdentity::generate();
        let add = Tlv8::new()
            .with(TlvType::State, vec![1])
            .with(TlvType::Method, vec![3])
            .with(TlvType::Identifier, guest.id().as_bytes().to_vec())
            .with(TlvType::PublicKey, guest.public_key().to_vec())
            .with(TlvType::Permissions, vec![0]);
        let reply = Tlv8::decode(&admin.post_tlv("/pairings", add.encode()).await).unwrap();
        assert_eq!(reply.state(), Some(2));
        assert!(reply.error().is_none());

        let mut guest_conn = TestController::connect(harness.addr).await;
        guest_conn.pair_verify(&guest, &accessory).await;
        let response = guest_conn
            .request(HttpRequest::new(Method::Get, "/accessories"))
            .await;
        assert_eq!(response.status_code, 200);

        let remove = Tlv8::new()
            .with(TlvType::State, vec![1])
            .with(TlvType::Method, vec![4])
            .with(TlvType::Identifier, guest.id().as_bytes().to_vec());
        admin.post_tlv("/pairings", remove.encode()).await;

        assert!(harness.store().controller(guest.id()).is_none());
        let closed = tokio::time::timeout(Duration::from_secs(5), guest_conn.receive())
            .await
            .unwrap();
        assert!(closed.is_none());
        harness.shutdown().await;
    }
}

mod transport {
    use super::*;

    #[tokio::test]
    async fn unencrypted_access_is_refused() {
        let harness = Harness::in_memory().await;
        let (_paired, _, _) = paired_controller(&harness).await;

        let mut stranger = TestController::connect(harness.addr).await;
        let response = stranger
            .request(HttpRequest::new(Method::Get, "/accessories"))
            .await;
        assert_eq!(response.status_code, 470);
        assert_eq!(response.status_text, "Connection Authorization Required");
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn large_payloads_span_frames_and_round_trip() {
        let harness = Harness::in_memory().await;
        let (mut controller, _, _) = paired_controller(&harness).await;
        let label: String = (0..2500).map(|i| (b'a' + (i % 26) as u8) as char).collect();

        let response = controller
            .put_characteristics(json!({"characteristics": [
                {"aid": LABEL.aid, "iid": LABEL.iid, "value": label}
            ]}))
            .await;
        assert_eq!(response.status_code, 204);

        let response = controller
            .request(HttpRequest::new(Method::Get, "/characteristics?id=1.20"))
            .await;
        assert_eq!(response.status_code, 200);
        assert_eq!(
            json_body(&response),
            json!({"characteristics": [{"aid": 1, "iid": 20, "value": label}]})
        );

        // Inbound: three frames for the large PUT, one for the GET.
        // Outbound: one for the 204, three for the large 200.
        let counters = harness
            .server
            .registry()
            .with_session(ConnectionId(1), |s| s.counters());
        assert_eq!(counters, Some((4, 4)));
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn tampered_frame_closes_connection() {
        let harness = Harness::in_memory().await;
        let (mut controller, _, _) = paired_controller(&harness).await;

        let mut wire = controller
            .cipher
            .as_mut()
            .unwrap()
            .encrypt(&HttpRequest::new(Method::Get, "/accessories").serialize())
            .unwrap();
        wire[4] ^= 0x01;
        controller.stream.write_all(&wire).await.unwrap();

        let closed = tokio::time::timeout(Duration::from_secs(5), controller.receive())
            .await
            .unwrap();
        assert!(closed.is_none());
        let registry = harness.server.registry().clone();
        wait_until(|| registry.is_empty()).await;
        harness.shutdown().await;
    }
}

mod events {
    use super::*;

    #[tokio::test]
    async fn events_skip_the_writing_connection() {
        let harness = Harness::in_memory().await;
        let (mut writer, identity, accessory) = paired_controller(&harness).await;
        let mut watcher = TestController::connect(harness.addr).await;
        watcher.pair_verify(&identity, &accessory).await;

        writer.subscribe(ON).await;
        watcher.subscribe(ON).await;

        let response = writer
            .put_characteristics(json!({"characteristics": [{"aid": 1, "iid": 10, "value": true}]}))
            .await;
        assert_eq!(response.status_code, 204);

        let event = watcher.next_event().await;
        assert_eq!(
            json_body(&event),
            json!({"characteristics": [{"aid": 1, "iid": 10, "value": true}]})
        );

        // A round trip on the writer proves no event was queued ahead of it.
        let response = writer
            .request(HttpRequest::new(Method::Get, "/characteristics?id=1.10"))
            .await;
        assert_eq!(response.status_code, 200);
        assert!(writer.events.is_empty());
        harness.shutdown().await;
    }

    #[tokio::test]
    async fn accessory_side_changes_reach_every_subscriber() {
        let harness = Harness::in_memory().await;
        let (mut first, identity, accessory) = paired_controller(&harness).await;
        let mut second = TestController::connect(harness.addr).await;
        second.pair_verify(&identity, &accessory).await;
        first.subscribe(ON).await;
        second.subscribe(ON).await;

        let delivered = harness.server.events().broadcast(ON, &json!(false), None);
        assert_eq!(delivered, 2);

        for controller in [&mut first, &mut second] {
            let event = controller.next_event().await;
            assert_eq!(
                json_body(&event),
                json!({"characteristics": [{"aid": 1, "iid": 10, "value": false}]})
            );
        }
        harness.shutdown().await;
    }
}
