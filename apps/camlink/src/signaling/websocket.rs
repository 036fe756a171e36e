use super::{ChannelEvent, SignalingChannel, SignalingConnector, TransportError};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use std::borrow::Cow;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message, error::ProtocolError};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use url::Url;

const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Connects to the relay over `ws://` or `wss://`.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    disable_ssl: bool,
}

impl WebSocketConnector {
    pub fn new(disable_ssl: bool) -> Self {
        Self { disable_ssl }
    }

    fn tls_connector(&self, url: &Url) -> Result<Option<Connector>, TransportError> {
        if !self.disable_ssl || url.scheme() != "wss" {
            return Ok(None);
        }
        tracing::warn!(
            target: "camlink::signaling",
            url = %url,
            "--disable-ssl set: accepting any certificate from the signaling server; this connection is not authenticated"
        );
        let tls = native_tls::TlsConnector::builder()
            .danger_accept_invalid_certs(true)
            .danger_accept_invalid_hostnames(true)
            .build()
            .map_err(|err| TransportError::Tls(err.to_string()))?;
        Ok(Some(Connector::NativeTls(tls)))
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, url: &Url) -> Result<Box<dyn SignalingChannel>, TransportError> {
        let connector = self.tls_connector(url)?;
        let (stream, _) = connect_async_tls_with_config(url.as_str(), None, false, connector)
            .await
            .map_err(|err| TransportError::Connect(format!("{url}: {err}")))?;
        tracing::debug!(target: "camlink::signaling", url = %url, "signaling websocket connected");

        let (mut ws_write, mut ws_read) = stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<ChannelEvent>();

        let writer = tokio::spawn(async move {
            while let Some(message) = outbound_rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if ws_write.send(message).await.is_err() || closing {
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let event = match frame {
                    Ok(Message::Text(text)) => {
                        tracing::trace!(target: "camlink::signaling", event = "ws_in", len = text.len());
                        ChannelEvent::MessageReceived(text)
                    }
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => ChannelEvent::MessageReceived(text),
                        Err(_) => {
                            tracing::debug!(target: "camlink::signaling", "ignoring non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(frame)) => {
                        tracing::debug!(target: "camlink::signaling", ?frame, "relay closed signaling websocket");
                        let _ = inbound_tx.send(ChannelEvent::Closed);
                        return;
                    }
                    Ok(_) => continue,
                    Err(
                        WsError::ConnectionClosed
                        | WsError::AlreadyClosed
                        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake),
                    ) => {
                        let _ = inbound_tx.send(ChannelEvent::Closed);
                        return;
                    }
                    Err(err) => {
                        tracing::warn!(target: "camlink::signaling", "signaling websocket error: {err}");
                        let _ = inbound_tx.send(ChannelEvent::Error(err.to_string()));
                        return;
                    }
                };
                if inbound_tx.send(event).is_err() {
                    return;
                }
            }
            let _ = inbound_tx.send(ChannelEvent::Closed);
        });

        Ok(Box::new(WebSocketChannel {
            outbound: Some(outbound_tx),
            inbound: inbound_rx,
            writer: Some(writer),
            reader,
        }))
    }
}

struct WebSocketChannel {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    inbound: mpsc::UnboundedReceiver<ChannelEvent>,
    writer: Option<JoinHandle<()>>,
    reader: JoinHandle<()>,
}

#[async_trait]
impl SignalingChannel for WebSocketChannel {
    fn send(&mut self, text: String) {
        let Some(outbound) = self.outbound.as_ref() else {
            return;
        };
        tracing::trace!(target: "camlink::signaling", event = "ws_out", len = text.len());
        if outbound.send(Message::Text(text)).is_err() {
            self.outbound = None;
        }
    }

    async fn next_event(&mut self) -> ChannelEvent {
        let event = self.inbound.recv().await.unwrap_or(ChannelEvent::Closed);
        if matches!(event, ChannelEvent::Closed | ChannelEvent::Error(_)) {
            self.outbound = None;
        }
        event
    }

    fn is_open(&self) -> bool {
        self.outbound.is_some()
    }

    async fn close(&mut self) {
        if let Some(outbound) = self.outbound.take() {
            let _ = outbound.send(Message::Close(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: Cow::Borrowed("session closed"),
            })));
        }
        if let Some(mut writer) = self.writer.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut writer).await.is_err() {
                writer.abort();
            }
        }
        self.reader.abort();
        self.inbound.close();
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
        self.reader.abort();
    }
}
