//! Session channel transport
//!
//! A `Connector` yields a `ChannelHandle`: typed outbound events in, typed
//! inbound events and acknowledgments out. The websocket itself lives in a
//! pump task owned by the handle; dropping the handle tears it down.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use super::protocol::{decode_frame, encode_frame, Frame, Packet};
use crate::error::NodeError;

/// Buffered events per direction
const CHANNEL_CAPACITY: usize = 64;

/// An event to send, optionally requesting an acknowledgment
#[derive(Debug, Clone, PartialEq)]
pub struct Outbound {
    pub event: String,
    pub args: Vec<Value>,
    pub ack_id: Option<u64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound {
    Ack { id: u64, args: Vec<Value> },
    Event { name: String, args: Vec<Value> },
    /// The channel is gone; no further messages follow
    Closed(String),
}

/// A live session channel
pub struct ChannelHandle {
    outbound: mpsc::Sender<Outbound>,
    inbound: mpsc::Receiver<Inbound>,
    pump: Option<JoinHandle<()>>,
}

impl ChannelHandle {
    pub fn new(
        outbound: mpsc::Sender<Outbound>,
        inbound: mpsc::Receiver<Inbound>,
        pump: Option<JoinHandle<()>>,
    ) -> Self {
        Self {
            outbound,
            inbound,
            pump,
        }
    }

    pub async fn emit(
        &self,
        event: &str,
        args: Vec<Value>,
        ack_id: Option<u64>,
    ) -> Result<(), NodeError> {
        self.outbound
            .send(Outbound {
                event: event.to_string(),
                args,
                ack_id,
            })
            .await
            .map_err(|_| NodeError::Session("Channel closed".into()))
    }

    /// Next inbound message. Cancel-safe.
    pub async fn recv(&mut self) -> Inbound {
        self.inbound
            .recv()
            .await
            .unwrap_or_else(|| Inbound::Closed("Channel dropped".into()))
    }

    pub fn close(mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

impl Drop for ChannelHandle {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

/// Opens authenticated session channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, token: &str) -> Result<ChannelHandle, NodeError>;
}

/// Socket.IO over websocket
pub struct SocketIoConnector {
    url: String,
    handshake_timeout: Duration,
}

impl SocketIoConnector {
    pub fn new(url: impl Into<String>, handshake_timeout: Duration) -> Self {
        Self {
            url: url.into(),
            handshake_timeout,
        }
    }
}

#[async_trait]
impl Connector for SocketIoConnector {
    async fn connect(&self, token: &str) -> Result<ChannelHandle, NodeError> {
        debug!(url = %self.url, "Connecting session channel");

        let (ws, _) = tokio::time::timeout(self.handshake_timeout, connect_async(self.url.as_str()))
            .await
            .map_err(|_| NodeError::Timeout("Session connect".into()))?
            .map_err(|e| NodeError::Session(format!("WebSocket connect failed: {}", e)))?;
        let (mut sink, mut stream) = ws.split();

        tokio::time::timeout(self.handshake_timeout, handshake(&mut sink, &mut stream, token))
            .await
            .map_err(|_| NodeError::Timeout("Session handshake".into()))??;

        let (out_tx, out_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (in_tx, in_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let pump = tokio::spawn(pump(sink, stream, out_rx, in_tx));

        info!("Session channel connected");
        Ok(ChannelHandle::new(out_tx, in_rx, Some(pump)))
    }
}

type WsError = tokio_tungstenite::tungstenite::Error;

/// Engine.IO open, then namespace connect carrying the token
async fn handshake<K, S>(sink: &mut K, stream: &mut S, token: &str) -> Result<(), NodeError>
where
    K: futures_util::Sink<Message, Error = WsError> + Unpin,
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match decode_frame(&next_text(stream).await?)? {
            Frame::Open(info) => {
                debug!(sid = %info.sid, ping_interval = info.ping_interval, "Engine opened");
                break;
            }
            other => debug!(?other, "Ignoring frame before open"),
        }
    }

    let connect = Frame::Message(Packet::Connect(Some(json!({ "token": token }))));
    send_frame(sink, &connect).await?;

    loop {
        match decode_frame(&next_text(stream).await?)? {
            Frame::Message(Packet::Connect(_)) => return Ok(()),
            Frame::Message(Packet::ConnectError(data)) => {
                return Err(NodeError::Session(format!("Connect rejected: {}", data)))
            }
            Frame::Ping => send_frame(sink, &Frame::Pong).await?,
            Frame::Close => return Err(NodeError::Session("Closed during handshake".into())),
            other => debug!(?other, "Ignoring frame before connect"),
        }
    }
}

async fn send_frame<K>(sink: &mut K, frame: &Frame) -> Result<(), NodeError>
where
    K: futures_util::Sink<Message, Error = WsError> + Unpin,
{
    sink.send(Message::Text(encode_frame(frame).into()))
        .await
        .map_err(|e| NodeError::Session(format!("Send failed: {}", e)))
}

/// Next text message; other websocket messages are skipped
async fn next_text<S>(stream: &mut S) -> Result<String, NodeError>
where
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    loop {
        match stream.next().await {
            Some(Ok(Message::Text(text))) => return Ok(text.to_string()),
            Some(Ok(Message::Close(_))) | None => {
                return Err(NodeError::Session("Connection closed".into()))
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => return Err(NodeError::Session(format!("WebSocket error: {}", e))),
        }
    }
}

async fn pump<K, S>(
    mut sink: K,
    mut stream: S,
    mut outbound: mpsc::Receiver<Outbound>,
    inbound: mpsc::Sender<Inbound>,
) where
    K: futures_util::Sink<Message, Error = WsError> + Unpin,
    S: futures_util::Stream<Item = Result<Message, WsError>> + Unpin,
{
    let reason = loop {
        tokio::select! {
            text = next_text(&mut stream) => {
                let text = match text {
                    Ok(text) => text,
                    Err(e) => break e.to_string(),
                };
                let frame = match decode_frame(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(error = %e, "Dropping undecodable frame");
                        continue;
                    }
                };
                match frame {
                    Frame::Ping => {
                        if let Err(e) = send_frame(&mut sink, &Frame::Pong).await {
                            break e.to_string();
                        }
                    }
                    Frame::Message(Packet::Ack { id, args }) => {
                        if inbound.send(Inbound::Ack { id, args }).await.is_err() {
                            break "Receiver dropped".to_string();
                        }
                    }
                    Frame::Message(Packet::Event { name, args, .. }) => {
                        if inbound.send(Inbound::Event { name, args }).await.is_err() {
                            break "Receiver dropped".to_string();
                        }
                    }
                    Frame::Message(Packet::Disconnect) | Frame::Close => {
                        break "Coordinator closed the session".to_string();
                    }
                    other => debug!(?other, "Ignoring frame"),
                }
            }
            out = outbound.recv() => {
                let Some(out) = out else {
                    let _ = send_frame(&mut sink, &Frame::Close).await;
                    break "Handle dropped".to_string();
                };
                let packet = Packet::Event {
                    id: out.ack_id,
                    name: out.event,
                    args: out.args,
                };
                if let Err(e) = send_frame(&mut sink, &Frame::Message(packet)).await {
                    break e.to_string();
                }
            }
        }
    };

    debug!(reason = %reason, "Session pump stopped");
    let _ = inbound.send(Inbound::Closed(reason)).await;
}
