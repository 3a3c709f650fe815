//! Per-connection session loop of the embedded broker

use super::{BrokerHooks, ConnectionInfo, ListenerKind, LocalBroker, Registration};
use crate::error::{GatewayError, Result};
use crate::mqtt::{
    encode_packet, frame_length, parse_packet, ConnectReturnCode, MqttPacket, Outgoing,
    ParsedConnect, ParsedPublish, ParsedSubscribe, Subscription,
};
use async_trait::async_trait;
use bytes::BytesMut;
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout, Instant};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, info, trace, warn};

/// Time allowed between accept and CONNECT
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Source of raw MQTT bytes
#[async_trait]
pub(crate) trait FrameReader: Send {
    /// Append received bytes to `buf`, `Ok(0)` at end of stream
    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize>;
}

/// Sink for encoded MQTT packets
#[async_trait]
pub(crate) trait FrameWriter: Send {
    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<()>;

    async fn shutdown(&mut self);
}

#[async_trait]
impl FrameReader for OwnedReadHalf {
    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize> {
        Ok(self.read_buf(buf).await?)
    }
}

#[async_trait]
impl FrameWriter for OwnedWriteHalf {
    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.write_all(&frame).await?;
        Ok(())
    }

    async fn shutdown(&mut self) {
        let _ = AsyncWriteExt::shutdown(self).await;
    }
}

#[async_trait]
impl FrameReader for SplitStream<WebSocketStream<TcpStream>> {
    async fn read_into(&mut self, buf: &mut BytesMut) -> Result<usize> {
        loop {
            match self.next().await {
                Some(Ok(WsMessage::Binary(data))) => {
                    if data.is_empty() {
                        continue;
                    }
                    buf.extend_from_slice(&data);
                    return Ok(data.len());
                }
                Some(Ok(WsMessage::Close(_))) | None => return Ok(0),
                Some(Ok(WsMessage::Text(_))) => {
                    return Err(GatewayError::Protocol(
                        "Text frames are not MQTT".to_string(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(GatewayError::Transport(e.to_string())),
            }
        }
    }
}

#[async_trait]
impl FrameWriter for SplitSink<WebSocketStream<TcpStream>, WsMessage> {
    async fn write_frame(&mut self, frame: Vec<u8>) -> Result<()> {
        self.send(WsMessage::Binary(frame))
            .await
            .map_err(|e| GatewayError::Transport(e.to_string()))
    }

    async fn shutdown(&mut self) {
        let _ = SinkExt::close(self).await;
    }
}

/// Pull the next complete packet out of `buf`, reading as needed.
///
/// Returns `Ok(None)` when the peer closed the stream. Partial frames stay
/// in `buf`, so the future can be dropped between reads.
async fn next_packet<R: FrameReader>(
    reader: &mut R,
    buf: &mut BytesMut,
    max_packet_size: usize,
) -> Result<Option<MqttPacket>> {
    loop {
        if let Some(len) = frame_length(&buf[..])? {
            if len > max_packet_size {
                return Err(GatewayError::Protocol(format!(
                    "Packet of {} bytes exceeds limit of {}",
                    len, max_packet_size
                )));
            }
            if buf.len() >= len {
                let frame = buf.split_to(len);
                return parse_packet(&frame).map(Some);
            }
        }

        if reader.read_into(buf).await? == 0 {
            return Ok(None);
        }
    }
}

enum Flow {
    Continue,
    Close,
}

/// Live state of an accepted session
struct Session<W> {
    broker: Arc<LocalBroker>,
    info: Arc<ConnectionInfo>,
    writer: W,
    next_pid: u16,
}

impl<W: FrameWriter> Session<W> {
    async fn send(&mut self, packet: Outgoing) -> Result<()> {
        trace!(
            client_id = %self.info.id,
            packet = packet.packet_type().as_str(),
            "Sending packet"
        );
        let frame = encode_packet(&packet)?;
        self.writer.write_frame(frame).await
    }

    /// Deliver a routed packet, assigning an id to QoS 1 publishes
    async fn send_routed(&mut self, packet: Outgoing) -> Result<()> {
        let packet = match packet {
            Outgoing::Publish { message, .. } if message.qos > 0 => {
                self.next_pid = self.next_pid.wrapping_add(1).max(1);
                Outgoing::Publish {
                    message,
                    packet_id: Some(self.next_pid),
                }
            }
            other => other,
        };
        self.send(packet).await
    }

    async fn handle(&mut self, hooks: &Arc<dyn BrokerHooks>, packet: MqttPacket) -> Result<Flow> {
        match packet {
            MqttPacket::Publish(publish) => self.handle_publish(hooks, publish).await,
            MqttPacket::Subscribe(subscribe) => self.handle_subscribe(hooks, subscribe).await,
            MqttPacket::Unsubscribe(unsubscribe) => {
                self.broker
                    .remove_subscriptions(&self.info.id, &unsubscribe.topics);
                debug!(client_id = %self.info.id, topics = ?unsubscribe.topics, "Unsubscribed");
                self.send(Outgoing::Unsuback(unsubscribe.packet_id)).await?;
                Ok(Flow::Continue)
            }
            MqttPacket::PingReq => {
                self.send(Outgoing::Pingresp).await?;
                Ok(Flow::Continue)
            }
            MqttPacket::Puback(_) => Ok(Flow::Continue),
            MqttPacket::Disconnect => {
                debug!(client_id = %self.info.id, "Client sent DISCONNECT");
                Ok(Flow::Close)
            }
            MqttPacket::Connect(_) => Err(GatewayError::Protocol(
                "Second CONNECT on session".to_string(),
            )),
            MqttPacket::Other(kind) => Err(GatewayError::Protocol(format!(
                "Unexpected {} from client",
                kind.as_str()
            ))),
        }
    }

    async fn handle_publish(
        &mut self,
        hooks: &Arc<dyn BrokerHooks>,
        publish: ParsedPublish,
    ) -> Result<Flow> {
        let ParsedPublish {
            message, packet_id, ..
        } = publish;

        let check = self.broker.qos.check_publish(message.qos);
        if !check.allowed {
            return Err(GatewayError::Protocol(
                check.reason.unwrap_or_else(|| "QoS not allowed".to_string()),
            ));
        }
        if !self.broker.matcher.is_valid_topic(&message.topic) {
            return Err(GatewayError::Protocol(format!(
                "Invalid topic name: {}",
                message.topic
            )));
        }

        let qos = message.qos;
        let accepted = hooks.authorize_publish(&self.info, message).await?;
        if let Err(e) = hooks.published(&accepted, Some(self.info.as_ref())).await {
            warn!(client_id = %self.info.id, topic = %accepted.topic, error = %e, "Published hook failed");
        }

        if let (1, Some(pid)) = (qos, packet_id) {
            self.send(Outgoing::Puback(pid)).await?;
        }
        Ok(Flow::Continue)
    }

    async fn handle_subscribe(
        &mut self,
        hooks: &Arc<dyn BrokerHooks>,
        subscribe: ParsedSubscribe,
    ) -> Result<Flow> {
        let mut granted = Vec::with_capacity(subscribe.subscriptions.len());
        let mut accepted: Vec<(String, Subscription)> = Vec::new();

        for sub in subscribe.subscriptions {
            if !self.broker.matcher.is_valid_filter(&sub.topic_filter) {
                debug!(client_id = %self.info.id, filter = %sub.topic_filter, "Invalid filter");
                granted.push(None);
                continue;
            }

            let qos = self.broker.qos.grant(sub.qos).recommended_qos;
            let requested = sub.topic_filter.clone();
            match hooks
                .authorize_subscribe(&self.info, Subscription::new(sub.topic_filter, qos))
                .await?
            {
                Some(global) => {
                    granted.push(Some(qos));
                    accepted.push((requested, Subscription::new(global.topic_filter, qos)));
                }
                None => granted.push(None),
            }
        }

        // retained replay is queued behind the SUBACK
        if !accepted.is_empty() {
            self.broker.add_subscriptions(&self.info.id, &accepted);
        }
        self.send(Outgoing::Suback {
            packet_id: subscribe.packet_id,
            granted,
        })
        .await?;

        if !accepted.is_empty() {
            let subs: Vec<Subscription> = accepted.into_iter().map(|(_, sub)| sub).collect();
            for sub in &subs {
                info!(client_id = %self.info.id, topic = %sub.topic_filter, qos = sub.qos, "Subscribed");
            }
            hooks.subscribed(&subs, &self.info).await;
        }
        Ok(Flow::Continue)
    }
}

fn client_id(connect: &ParsedConnect) -> String {
    if connect.client_id.is_empty() {
        let id = uuid::Uuid::new_v4().simple().to_string();
        format!("anon_{}", &id[..8])
    } else {
        connect.client_id.clone()
    }
}

/// Drive one downstream connection until it closes
pub(crate) async fn run_session<R, W>(
    broker: Arc<LocalBroker>,
    mut reader: R,
    mut writer: W,
    remote_addr: SocketAddr,
    listener: ListenerKind,
    mut shutdown: watch::Receiver<bool>,
) where
    R: FrameReader,
    W: FrameWriter,
{
    let max_packet_size = broker.max_packet_size;
    let mut buf = BytesMut::with_capacity(4096);

    let first = tokio::select! {
        _ = shutdown.changed() => None,
        res = timeout(CONNECT_TIMEOUT, next_packet(&mut reader, &mut buf, max_packet_size)) => match res {
            Ok(Ok(Some(MqttPacket::Connect(connect)))) => Some(connect),
            Ok(Ok(Some(other))) => {
                debug!(remote_addr = %remote_addr, packet = ?other, "First packet was not CONNECT");
                None
            }
            Ok(Ok(None)) => None,
            Ok(Err(e)) => {
                debug!(remote_addr = %remote_addr, error = %e, "Failed to read CONNECT");
                None
            }
            Err(_) => {
                debug!(remote_addr = %remote_addr, "Timed out waiting for CONNECT");
                None
            }
        },
    };
    let Some(connect) = first else {
        writer.shutdown().await;
        return;
    };

    let info = Arc::new(ConnectionInfo {
        id: client_id(&connect),
        remote_addr,
        listener,
    });

    let Some(hooks) = admit(&broker, &info, &connect, &mut writer).await else {
        writer.shutdown().await;
        return;
    };

    let registration = broker.register(info.clone());
    let key = registration.key;
    let mut session = Session {
        broker: broker.clone(),
        info: info.clone(),
        writer,
        next_pid: 0,
    };

    let result = async {
        session
            .send(Outgoing::Connack {
                session_present: false,
                code: ConnectReturnCode::Accepted,
            })
            .await?;
        debug!(client_id = %info.id, remote_addr = %remote_addr, listener = listener.as_str(), "Client connected");

        serve(&mut session, &hooks, &mut reader, &mut buf, registration, &mut shutdown, connect.keep_alive).await
    }
    .await;

    if let Err(e) = &result {
        hooks.client_error(&info, e);
    }

    broker.unregister(&info.id, key);
    hooks.client_disconnect(&info).await;
    session.writer.shutdown().await;
    debug!(client_id = %info.id, "Client disconnected");
}

/// Run the gate and authentication hooks, answering with CONNACK on refusal
async fn admit<W: FrameWriter>(
    broker: &LocalBroker,
    info: &ConnectionInfo,
    connect: &ParsedConnect,
    writer: &mut W,
) -> Option<Arc<dyn BrokerHooks>> {
    let refusal = match broker.hooks() {
        None => Some(ConnectReturnCode::ServerUnavailable),
        Some(hooks) => {
            if !hooks.pre_connect(info).await {
                debug!(client_id = %info.id, "Connection refused before authentication");
                Some(ConnectReturnCode::ServerUnavailable)
            } else {
                match hooks
                    .authenticate(info, connect.username.as_deref(), connect.password.as_deref())
                    .await
                {
                    Ok(()) => return Some(hooks),
                    Err(e) => {
                        info!(client_id = %info.id, error = %e, "Authentication failed");
                        Some(ConnectReturnCode::NotAuthorized)
                    }
                }
            }
        }
    };

    if let Some(code) = refusal {
        if let Ok(frame) = encode_packet(&Outgoing::Connack {
            session_present: false,
            code,
        }) {
            let _ = writer.write_frame(frame).await;
        }
    }
    None
}

async fn serve<R: FrameReader, W: FrameWriter>(
    session: &mut Session<W>,
    hooks: &Arc<dyn BrokerHooks>,
    reader: &mut R,
    buf: &mut BytesMut,
    registration: Registration,
    shutdown: &mut watch::Receiver<bool>,
    keep_alive: u16,
) -> Result<()> {
    let max_packet_size = session.broker.max_packet_size;
    let window = (keep_alive > 0).then(|| Duration::from_millis(u64::from(keep_alive) * 1500));
    let mut deadline = window.map(|w| Instant::now() + w);
    let Registration {
        outbound: mut rx,
        evict,
        ..
    } = registration;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                debug!(client_id = %session.info.id, "Connection closed by listener");
                return Ok(());
            }
            _ = evict.notified() => {
                return Err(GatewayError::Protocol("Outbound queue overflow".to_string()));
            }
            outgoing = rx.recv() => match outgoing {
                Some(packet) => session.send_routed(packet).await?,
                None => {
                    debug!(client_id = %session.info.id, "Session replaced");
                    return Ok(());
                }
            },
            _ = keep_alive_expired(deadline) => {
                return Err(GatewayError::Protocol("Keep-alive timeout".to_string()));
            }
            packet = next_packet(reader, buf, max_packet_size) => {
                let Some(packet) = packet? else {
                    return Ok(());
                };
                deadline = window.map(|w| Instant::now() + w);
                if let Flow::Close = session.handle(hooks, packet).await? {
                    return Ok(());
                }
            }
        }
    }
}

async fn keep_alive_expired(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at).await,
        None => std::future::pending().await,
    }
}
