//! TCP accept loop and per-connection tasks.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use hap_core::error::{Error, Result, TransportError};
use hap_core::ids::ConnectionId;
use hap_core::Config;
use hap_pairing::IdentityStore;
use tokio::io::{AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Notify, Semaphore};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::accessories::AccessoryDatabase;
use crate::events::EventBroadcaster;
use crate::http::{read_request, HttpResponse};
use crate::router::Router;
use crate::session::{ConnectionHandle, Outbound, SessionRegistry};
use crate::transport::{transport_error, SecureReader, SecureWriter};

/// Responses and events waiting for one connection's writer.
const OUTBOUND_QUEUE: usize = 32;

/// How long a closing connection may take to flush queued output.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// HAP accessory server.
pub struct Server {
    listener: TcpListener,
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
    slots: Arc<Semaphore>,
    next_id: AtomicU64,
    stop: Notify,
}

impl Server {
    /// Bind the listener described by `config.server`.
    pub async fn bind(
        config: &Config,
        store: Arc<IdentityStore>,
        database: Arc<dyn AccessoryDatabase>,
    ) -> Result<Self> {
        let setup_code = config.setup_code()?;
        let addr = SocketAddr::new(config.server.bind_address, config.server.port);
        let listener = TcpListener::bind(addr).await?;
        info!(
            addr = %listener.local_addr()?,
            accessory = %store.identifier(),
            paired = store.is_paired(),
            "accessory server listening"
        );

        let registry = Arc::new(SessionRegistry::new());
        let router = Arc::new(Router::new(registry.clone(), store, setup_code, database));
        Ok(Self {
            listener,
            registry,
            router,
            slots: Arc::new(Semaphore::new(config.server.max_connections)),
            next_id: AtomicU64::new(1),
            stop: Notify::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Broadcaster for value changes that originate on the accessory.
    pub fn events(&self) -> &EventBroadcaster {
        self.router.events()
    }

    pub fn store(&self) -> &Arc<IdentityStore> {
        self.router.store()
    }

    /// Accept connections until `shutdown` resolves or [`stop`](Self::stop)
    /// is called, then close every connection and wait for them to finish.
    pub async fn run(&self, shutdown: impl Future<Output = ()>) -> Result<()> {
        tokio::pin!(shutdown);
        let mut tasks = JoinSet::new();

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = self.stop.notified() => break,
                accepted = self.listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            warn!(error = %e, "accept failed");
                            continue;
                        }
                    };
                    let Ok(permit) = self.slots.clone().try_acquire_owned() else {
                        warn!(peer = %peer, "connection limit reached, refusing");
                        drop(stream);
                        continue;
                    };
                    let conn = ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed));
                    let registry = self.registry.clone();
                    let router = self.router.clone();
                    tasks.spawn(async move {
                        serve_connection(stream, peer, conn, registry, router).await;
                        drop(permit);
                    });
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            }
        }

        self.close_connections();
        while tasks.join_next().await.is_some() {}
        info!("accessory server stopped");
        Ok(())
    }

    /// Ask [`run`](Self::run) to return after closing every connection.
    pub fn stop(&self) {
        self.stop.notify_one();
    }

    fn close_connections(&self) {
        for conn in self.registry.active_connections() {
            if let Some(handle) = self.registry.handle(conn) {
                handle.closed.notify_one();
            }
        }
    }
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    conn: ConnectionId,
    registry: Arc<SessionRegistry>,
    router: Arc<Router>,
) {
    if let Err(e) = stream.set_nodelay(true) {
        debug!(conn = %conn, error = %e, "set_nodelay failed");
    }
    let (read_half, write_half) = stream.into_split();
    let (outbound, queue) = mpsc::channel(OUTBOUND_QUEUE);
    let closed = Arc::new(Notify::new());
    let activated = Arc::new(Notify::new());
    registry.attach(
        conn,
        peer,
        ConnectionHandle {
            outbound: outbound.clone(),
            closed: closed.clone(),
        },
    );
    info!(conn = %conn, peer = %peer, "connection accepted");

    let mut writer = tokio::spawn(write_loop(
        SecureWriter::new(write_half, conn, registry.clone()),
        queue,
        conn,
        registry.clone(),
        activated.clone(),
        closed.clone(),
    ));

    let mut reader = BufReader::new(SecureReader::new(read_half, conn, registry.clone()));
    loop {
        let request = tokio::select! {
            _ = closed.notified() => {
                debug!(conn = %conn, "connection closed by server");
                break;
            }
            request = read_request(&mut reader) => request,
        };
        let request = match request {
            Ok(Some(request)) => request,
            Ok(None) => {
                debug!(conn = %conn, "connection closed by peer");
                break;
            }
            Err(err) => {
                report_read_error(conn, &err);
                if matches!(err, Error::Parse(_) | Error::Transport(TransportError::RequestTooLarge(_))) {
                    let _ = outbound
                        .send(Outbound::Response {
                            bytes: HttpResponse::new(400).serialize(),
                            activate: false,
                        })
                        .await;
                }
                break;
            }
        };

        let routed = router.handle(conn, request).await;
        let queued = outbound
            .send(Outbound::Response {
                bytes: routed.response.serialize(),
                activate: routed.activate,
            })
            .await;
        if queued.is_err() {
            break;
        }
        if routed.activate {
            // Nothing more may be read until the new keys are in place.
            tokio::select! {
                _ = activated.notified() => {}
                _ = closed.notified() => break,
            }
        }
        if routed.close {
            break;
        }
    }

    registry.detach(conn);
    drop(outbound);
    if tokio::time::timeout(DRAIN_TIMEOUT, &mut writer).await.is_err() {
        debug!(conn = %conn, "writer did not drain in time");
        writer.abort();
    }
    registry.remove(conn);
    info!(conn = %conn, "connection closed");
}

async fn write_loop<W: AsyncWrite + Unpin>(
    mut writer: SecureWriter<W>,
    mut queue: mpsc::Receiver<Outbound>,
    conn: ConnectionId,
    registry: Arc<SessionRegistry>,
    activated: Arc<Notify>,
    closed: Arc<Notify>,
) {
    while let Some(message) = queue.recv().await {
        let (bytes, activate) = match message {
            Outbound::Response { bytes, activate } => (bytes, activate),
            Outbound::Event(bytes) => (bytes, false),
        };
        let written = async {
            writer.write_all(&bytes).await?;
            writer.flush().await
        }
        .await;
        if let Err(e) = written {
            debug!(conn = %conn, error = %e, "write failed");
            closed.notify_one();
            return;
        }
        if activate {
            registry.activate_staged(conn);
            activated.notify_one();
        }
    }
    let _ = writer.shutdown().await;
}

fn report_read_error(conn: ConnectionId, err: &Error) {
    let transport = match err {
        Error::Connection(io) => transport_error(io),
        Error::Transport(e) => Some(e),
        _ => None,
    };
    let integrity = matches!(
        transport,
        Some(TransportError::FrameIntegrity | TransportError::FrameTooLarge(_))
    );
    if integrity {
        warn!(conn = %conn, error = %err, "encrypted frame rejected, closing connection");
    } else {
        debug!(conn = %conn, error = %err, "request read failed");
    }
}
