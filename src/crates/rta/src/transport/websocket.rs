//! WebSocket transport over tokio-tungstenite

use super::{
    ClosedHandler, Principal, ReceivedHandler, TokenProvider, Transport, CLOSE_ABNORMAL,
};
use crate::error::TransportError;
use crate::logging::redact_token;
use async_trait::async_trait;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close frame arrived without a status code
const CLOSE_NO_STATUS: u16 = 1005;

struct Shared {
    outbound: Option<mpsc::UnboundedSender<Message>>,
    /// Bumped on every connect and local close; tasks of an older socket
    /// stop delivering callbacks once it moves on
    generation: u64,
    received: Option<ReceivedHandler>,
    closed: Option<ClosedHandler>,
}

/// [`Transport`] backed by a tokio-tungstenite client socket.
///
/// One reader task delivers inbound frames serially; one writer task
/// drains the outbound queue in order.
pub struct WebSocketTransport {
    token_provider: Arc<dyn TokenProvider>,
    shared: Arc<Mutex<Shared>>,
}

impl WebSocketTransport {
    pub fn new(token_provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            token_provider,
            shared: Arc::new(Mutex::new(Shared {
                outbound: None,
                generation: 0,
                received: None,
                closed: None,
            })),
        }
    }

    /// Check whether a socket is currently open
    pub fn is_connected(&self) -> bool {
        self.shared.lock().outbound.is_some()
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    async fn connect(
        &self,
        principal: &Principal,
        uri: &str,
        sub_protocol: &str,
    ) -> Result<(), TransportError> {
        let token = self.token_provider.bearer_token(principal, uri).await?;

        let mut request = uri
            .into_client_request()
            .map_err(|e| TransportError::InvalidUri(e.to_string()))?;
        let headers = request.headers_mut();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", token))
                .map_err(|e| TransportError::Auth(format!("unusable token: {}", e)))?,
        );
        headers.insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(sub_protocol)
                .map_err(|e| TransportError::Handshake(format!("invalid sub-protocol: {}", e)))?,
        );

        debug!(
            principal = %principal,
            uri = %uri,
            token = %redact_token(&token),
            "Opening websocket"
        );

        let (stream, _response) = connect_async(request).await.map_err(map_connect_error)?;
        let (write, read) = stream.split();
        let (tx, rx) = mpsc::unbounded_channel();

        let generation = {
            let mut shared = self.shared.lock();
            shared.generation += 1;
            if let Some(previous) = shared.outbound.replace(tx) {
                let _ = previous.send(normal_close());
            }
            shared.generation
        };

        tokio::spawn(write_loop(write, rx));
        tokio::spawn(read_loop(read, self.shared.clone(), generation));

        info!(principal = %principal, uri = %uri, "Websocket connected");
        Ok(())
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        let shared = self.shared.lock();
        match &shared.outbound {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|e| TransportError::Send(e.to_string())),
            None => Err(TransportError::NotConnected),
        }
    }

    fn close(&self) {
        let mut shared = self.shared.lock();
        shared.generation += 1;
        if let Some(tx) = shared.outbound.take() {
            debug!("Closing websocket");
            let _ = tx.send(normal_close());
        }
    }

    fn set_received_handler(&self, handler: Option<ReceivedHandler>) {
        self.shared.lock().received = handler;
    }

    fn set_closed_handler(&self, handler: Option<ClosedHandler>) {
        self.shared.lock().closed = handler;
    }
}

fn normal_close() -> Message {
    Message::Close(Some(CloseFrame {
        code: CloseCode::Normal,
        reason: "".into(),
    }))
}

fn map_connect_error(err: WsError) -> TransportError {
    match err {
        WsError::Http(response) if matches!(response.status().as_u16(), 401 | 403) => {
            TransportError::Auth(format!("handshake rejected with {}", response.status()))
        }
        WsError::Url(e) => TransportError::InvalidUri(e.to_string()),
        other => TransportError::Handshake(other.to_string()),
    }
}

async fn write_loop(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(message) = rx.recv().await {
        let closing = matches!(message, Message::Close(_));
        if let Err(e) = write.send(message).await {
            warn!(error = %e, "Websocket write failed");
            break;
        }
        if closing {
            break;
        }
    }
}

async fn read_loop(mut read: SplitStream<WsStream>, shared: Arc<Mutex<Shared>>, generation: u64) {
    let code = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let handler = {
                    let shared = shared.lock();
                    if shared.generation != generation {
                        return;
                    }
                    shared.received.clone()
                };
                if let Some(handler) = handler {
                    handler(text);
                }
            }
            Some(Ok(Message::Close(frame))) => {
                break frame.map(|f| u16::from(f.code)).unwrap_or(CLOSE_NO_STATUS);
            }
            Some(Ok(Message::Binary(data))) => {
                debug!(len = data.len(), "Ignoring binary frame");
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!(error = %e, "Websocket read failed");
                break CLOSE_ABNORMAL;
            }
            None => break CLOSE_ABNORMAL,
        }
    };

    let handler = {
        let mut shared = shared.lock();
        if shared.generation != generation {
            return;
        }
        shared.outbound = None;
        shared.closed.clone()
    };

    info!(code, "Websocket closed by peer");
    if let Some(handler) = handler {
        handler(code);
    }
}
