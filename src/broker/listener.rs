//! Downstream listeners and their socket registry

use super::session::run_session;
use super::LocalBroker;
use crate::error::{GatewayError, Result};
use dashmap::DashMap;
use futures::StreamExt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tracing::{debug, info, warn};

const WS_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const MQTT_SUBPROTOCOL: &str = "mqtt";

/// Wire carrying MQTT for a listener
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    Tcp,
    WebSocket,
}

impl ListenerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tcp => "tcp",
            Self::WebSocket => "ws",
        }
    }
}

struct Running {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Open sockets of one listener, each with its close signal
#[derive(Default)]
struct Registry {
    sockets: DashMap<u64, watch::Sender<bool>>,
    next_id: AtomicU64,
}

impl Registry {
    fn add(&self) -> (u64, watch::Receiver<bool>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = watch::channel(false);
        self.sockets.insert(id, tx);
        (id, rx)
    }

    fn remove(&self, id: u64) {
        self.sockets.remove(&id);
    }

    fn close_all(&self) -> usize {
        let ids: Vec<u64> = self.sockets.iter().map(|entry| *entry.key()).collect();
        ids.into_iter()
            .filter_map(|id| self.sockets.remove(&id))
            .map(|(_, tx)| {
                let _ = tx.send(true);
            })
            .count()
    }
}

/// A TCP or WebSocket listener feeding the embedded broker
pub struct Listener {
    kind: ListenerKind,
    addr: SocketAddr,
    running: Mutex<Option<Running>>,
    registry: Arc<Registry>,
}

impl Listener {
    pub fn new(kind: ListenerKind, addr: SocketAddr) -> Self {
        Self {
            kind,
            addr,
            running: Mutex::new(None),
            registry: Arc::new(Registry::default()),
        }
    }

    pub fn kind(&self) -> ListenerKind {
        self.kind
    }

    /// Bind and start accepting. Returns the bound address.
    pub async fn start(&self, broker: Arc<LocalBroker>) -> Result<SocketAddr> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(GatewayError::AlreadyStarted(self.kind.as_str()));
        }

        let listener = TcpListener::bind(self.addr).await?;
        let local_addr = listener.local_addr()?;
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(accept_loop(
            listener,
            self.kind,
            broker,
            self.registry.clone(),
            shutdown_rx,
        ));

        info!(listener = self.kind.as_str(), addr = %local_addr, "Listener started");
        *running = Some(Running {
            local_addr,
            shutdown,
            task,
        });
        Ok(local_addr)
    }

    /// Stop accepting and close every open socket
    pub async fn stop(&self) -> Result<()> {
        let Some(running) = self.running.lock().await.take() else {
            return Err(GatewayError::NotStarted(self.kind.as_str()));
        };

        let _ = running.shutdown.send(true);
        running.task.abort();
        let _ = running.task.await;

        let closed = self.registry.close_all();
        info!(listener = self.kind.as_str(), closed, "Listener stopped");
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.running.lock().await.is_some()
    }

    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.local_addr)
    }

    /// Close every open socket, keep accepting. Returns the number closed.
    pub fn force_close_all(&self) -> usize {
        let closed = self.registry.close_all();
        if closed > 0 {
            info!(listener = self.kind.as_str(), closed, "Closed downstream sockets");
        }
        closed
    }

    pub fn connection_count(&self) -> usize {
        self.registry.sockets.len()
    }
}

async fn accept_loop(
    listener: TcpListener,
    kind: ListenerKind,
    broker: Arc<LocalBroker>,
    registry: Arc<Registry>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, remote_addr)) => {
                    debug!(listener = kind.as_str(), remote_addr = %remote_addr, "Accepted connection");
                    let (id, close_rx) = registry.add();
                    let broker = broker.clone();
                    let registry = registry.clone();
                    tokio::spawn(async move {
                        handle_socket(stream, remote_addr, kind, broker, close_rx).await;
                        registry.remove(id);
                    });
                }
                Err(e) => warn!(listener = kind.as_str(), error = %e, "Accept failed"),
            },
        }
    }
}

async fn handle_socket(
    stream: TcpStream,
    remote_addr: SocketAddr,
    kind: ListenerKind,
    broker: Arc<LocalBroker>,
    close_rx: watch::Receiver<bool>,
) {
    let _ = stream.set_nodelay(true);

    match kind {
        ListenerKind::Tcp => {
            let (reader, writer) = stream.into_split();
            run_session(broker, reader, writer, remote_addr, kind, close_rx).await;
        }
        ListenerKind::WebSocket => {
            let handshake = tokio_tungstenite::accept_hdr_async(stream, negotiate_subprotocol);
            let ws = match tokio::time::timeout(WS_HANDSHAKE_TIMEOUT, handshake).await {
                Ok(Ok(ws)) => ws,
                Ok(Err(e)) => {
                    debug!(remote_addr = %remote_addr, error = %e, "WebSocket handshake failed");
                    return;
                }
                Err(_) => {
                    debug!(remote_addr = %remote_addr, "WebSocket handshake timed out");
                    return;
                }
            };
            let (writer, reader) = ws.split();
            run_session(broker, reader, writer, remote_addr, kind, close_rx).await;
        }
    }
}

/// Echo the `mqtt` subprotocol when the client offers it
fn negotiate_subprotocol(
    req: &Request,
    mut response: Response,
) -> std::result::Result<Response, ErrorResponse> {
    let offered = req
        .headers()
        .get_all("Sec-WebSocket-Protocol")
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .any(|proto| proto.trim().eq_ignore_ascii_case(MQTT_SUBPROTOCOL));

    if offered {
        response.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(MQTT_SUBPROTOCOL),
        );
    }
    Ok(response)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{BrokerHooks, ConnectionInfo};
    use crate::mqtt::{Message, Subscription};
    use async_trait::async_trait;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    struct AllowAll;

    #[async_trait]
    impl BrokerHooks for AllowAll {
        async fn pre_connect(&self, _conn: &ConnectionInfo) -> bool {
            true
        }

        async fn authenticate(
            &self,
            _conn: &ConnectionInfo,
            username: Option<&str>,
            _password: Option<&[u8]>,
        ) -> Result<()> {
            match username {
                Some("bad") => Err(GatewayError::BadCredentials),
                _ => Ok(()),
            }
        }

        async fn authorize_publish(&self, _conn: &ConnectionInfo, message: Message) -> Result<Message> {
            Ok(message)
        }

        async fn authorize_subscribe(
            &self,
            _conn: &ConnectionInfo,
            sub: Subscription,
        ) -> Result<Option<Subscription>> {
            Ok(Some(sub))
        }

        fn authorize_forward(&self, _conn: &ConnectionInfo, message: &Message) -> Option<Message> {
            Some(message.clone())
        }

        async fn client_disconnect(&self, _conn: &ConnectionInfo) {}
    }

    const CONNECT: [u8; 18] = [
        0x10, 0x10, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x02, 0x00, 0x3C, 0x00, 0x04, b't',
        b'e', b's', b't',
    ];

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    async fn connack(addr: SocketAddr, connect: &[u8]) -> (TcpStream, [u8; 4]) {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(connect).await.unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).await.unwrap();
        (stream, reply)
    }

    #[tokio::test]
    async fn test_start_stop_errors() {
        let broker = Arc::new(LocalBroker::new(1024));
        let listener = Listener::new(ListenerKind::Tcp, loopback());

        assert!(matches!(
            listener.stop().await,
            Err(GatewayError::NotStarted("tcp"))
        ));

        listener.start(broker.clone()).await.unwrap();
        assert!(listener.is_started().await);
        assert!(matches!(
            listener.start(broker.clone()).await,
            Err(GatewayError::AlreadyStarted("tcp"))
        ));

        listener.stop().await.unwrap();
        assert!(!listener.is_started().await);
        assert!(listener.local_addr().await.is_none());
    }

    #[tokio::test]
    async fn test_connack_codes() {
        let broker = Arc::new(LocalBroker::new(1024));
        let listener = Listener::new(ListenerKind::Tcp, loopback());
        let addr = listener.start(broker.clone()).await.unwrap();

        // no hooks installed
        let (_s, reply) = connack(addr, &CONNECT).await;
        assert_eq!(reply, [0x20, 0x02, 0x00, 0x03]);

        broker.set_hooks(Arc::new(AllowAll));
        let (_s, reply) = connack(addr, &CONNECT).await;
        assert_eq!(reply, [0x20, 0x02, 0x00, 0x00]);

        // username "bad"
        let bad = [
            0x10, 0x15, 0x00, 0x04, b'M', b'Q', b'T', b'T', 0x04, 0x82, 0x00, 0x3C, 0x00, 0x04,
            b't', b'e', b's', b't', 0x00, 0x03, b'b', b'a', b'd',
        ];
        let (_s, reply) = connack(addr, &bad).await;
        assert_eq!(reply, [0x20, 0x02, 0x00, 0x05]);

        listener.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_force_close_all() {
        let broker = Arc::new(LocalBroker::new(1024));
        broker.set_hooks(Arc::new(AllowAll));
        let listener = Listener::new(ListenerKind::Tcp, loopback());
        let addr = listener.start(broker.clone()).await.unwrap();

        let (mut stream, reply) = connack(addr, &CONNECT).await;
        assert_eq!(reply[3], 0x00);
        assert_eq!(listener.connection_count(), 1);

        assert_eq!(listener.force_close_all(), 1);
        let mut buf = [0u8; 8];
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // still accepting
        assert!(listener.is_started().await);
        let (_s, reply) = connack(addr, &CONNECT).await;
        assert_eq!(reply[3], 0x00);

        listener.stop().await.unwrap();
    }

    #[test]
    fn test_listener_kind_names() {
        assert_eq!(ListenerKind::Tcp.as_str(), "tcp");
        assert_eq!(ListenerKind::WebSocket.as_str(), "ws");
    }
}
