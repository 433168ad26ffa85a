//! Common test utilities and setup

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use rta::transport::{ClosedHandler, ReceivedHandler};
use rta::{
    ConnectionSupervisor, Principal, RealTimeActivityService, RtaConfig, Subscription,
    SubscriptionErrorKind, SubscriptionHandler, SubscriptionState, Transport, TransportError,
};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;

pub const PRINCIPAL: &str = "2533274790395904";

/// In-memory transport that records frames and lets tests play the server
#[derive(Default)]
pub struct MockTransport {
    connect_results: Mutex<VecDeque<Result<(), TransportError>>>,
    connect_attempts: AtomicUsize,
    closes: AtomicUsize,
    connected: AtomicBool,
    sent: Mutex<Vec<String>>,
    received: Mutex<Option<ReceivedHandler>>,
    closed: Mutex<Option<ClosedHandler>>,
}

impl MockTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make the next `count` connect attempts fail
    pub fn fail_next(&self, count: usize) {
        let mut results = self.connect_results.lock();
        for _ in 0..count {
            results.push_back(Err(TransportError::Handshake("connection refused".to_string())));
        }
    }

    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn sent_frames(&self) -> Vec<String> {
        self.sent.lock().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().clear();
    }

    /// `(seq, uri)` of every subscribe request sent so far
    pub fn subscribe_requests(&self) -> Vec<(u32, String)> {
        self.frames_of_type(1)
            .into_iter()
            .map(|frame| {
                (
                    frame[1].as_u64().unwrap() as u32,
                    frame[2].as_str().unwrap().to_string(),
                )
            })
            .collect()
    }

    /// `(seq, subscription id)` of every unsubscribe request sent so far
    pub fn unsubscribe_requests(&self) -> Vec<(u32, u32)> {
        self.frames_of_type(2)
            .into_iter()
            .map(|frame| {
                (
                    frame[1].as_u64().unwrap() as u32,
                    frame[2].as_u64().unwrap() as u32,
                )
            })
            .collect()
    }

    fn frames_of_type(&self, message_type: u64) -> Vec<Vec<Value>> {
        self.sent
            .lock()
            .iter()
            .map(|text| serde_json::from_str::<Vec<Value>>(text).unwrap())
            .filter(|frame| frame[0].as_u64() == Some(message_type))
            .collect()
    }

    /// Deliver an inbound text frame
    pub fn receive(&self, text: impl Into<String>) {
        let handler = self.received.lock().clone();
        if let Some(handler) = handler {
            handler(text.into());
        }
    }

    /// Simulate the peer closing the socket
    pub fn drop_connection(&self, code: u16) {
        self.connected.store(false, Ordering::SeqCst);
        let handler = self.closed.lock().clone();
        if let Some(handler) = handler {
            handler(code);
        }
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(
        &self,
        _principal: &Principal,
        _uri: &str,
        _sub_protocol: &str,
    ) -> Result<(), TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        let result = self.connect_results.lock().pop_front().unwrap_or(Ok(()));
        if result.is_ok() {
            self.connected.store(true, Ordering::SeqCst);
        }
        result
    }

    fn send(&self, text: String) -> Result<(), TransportError> {
        if !self.is_connected() {
            return Err(TransportError::NotConnected);
        }
        self.sent.lock().push(text);
        Ok(())
    }

    fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
        self.connected.store(false, Ordering::SeqCst);
    }

    fn set_received_handler(&self, handler: Option<ReceivedHandler>) {
        *self.received.lock() = handler;
    }

    fn set_closed_handler(&self, handler: Option<ClosedHandler>) {
        *self.closed.lock() = handler;
    }
}

/// Everything a subscription was told, in order
#[derive(Default)]
pub struct RecordingHandler {
    pub created: Mutex<Vec<(u32, Value)>>,
    pub events: Mutex<Vec<Value>>,
    pub states: Mutex<Vec<SubscriptionState>>,
    pub errors: Mutex<Vec<(SubscriptionErrorKind, String)>>,
}

impl SubscriptionHandler for RecordingHandler {
    fn on_created(&self, subscription_id: u32, data: &Value) {
        self.created.lock().push((subscription_id, data.clone()));
    }

    fn on_event(&self, data: &Value) {
        self.events.lock().push(data.clone());
    }

    fn on_state_changed(&self, state: SubscriptionState) {
        self.states.lock().push(state);
    }

    fn on_error(&self, error: SubscriptionErrorKind, message: &str) {
        self.errors.lock().push((error, message.to_string()));
    }
}

/// Subscription with a recording handler
pub fn recorded_subscription(uri: &str) -> (Arc<Subscription>, Arc<RecordingHandler>) {
    let handler = Arc::new(RecordingHandler::default());
    (Subscription::new(uri, handler.clone()), handler)
}

pub fn presence_uri(xuid: u64) -> String {
    format!("https://userpresence.xboxlive.com/users/xuid({})/devices", xuid)
}

/// Configuration without lifetime recycling, so paused clocks stay quiet
pub fn test_config() -> RtaConfig {
    RtaConfig::default()
        .with_endpoint("ws://127.0.0.1:9/connect")
        .with_max_connection_lifetime(None)
}

/// Let spawned connect tasks run
pub async fn settle() {
    for _ in 0..20 {
        tokio::task::yield_now().await;
    }
}

/// Registry attached to `transport`, not yet connected
pub fn activated_service(transport: Arc<MockTransport>, config: &RtaConfig) -> RealTimeActivityService {
    let service = RealTimeActivityService::new(Principal::new(PRINCIPAL));
    let connection = ConnectionSupervisor::new(Principal::new(PRINCIPAL), transport, config)
        .expect("Failed to create supervisor");
    service.activate_connection(connection);
    service
}

/// Registry attached to `transport` and connected
pub async fn connected_service(transport: Arc<MockTransport>) -> RealTimeActivityService {
    let service = activated_service(transport, &test_config());
    settle().await;
    assert_eq!(service.connection_state(), rta::ConnectionState::Connected);
    service
}

static NEXT_PROVIDER_ID: AtomicU32 = AtomicU32::new(1_000);

/// Acknowledge every subscribe request with a fresh provider id.
/// Responses for requests the registry no longer tracks are dropped by it.
pub fn ack_subscribes(transport: &MockTransport) {
    for (seq, _uri) in transport.subscribe_requests() {
        let id = NEXT_PROVIDER_ID.fetch_add(1, Ordering::SeqCst);
        transport.receive(format!("[1,{},0,{},{{}}]", seq, id));
    }
}

/// Acknowledge every unsubscribe request
pub fn ack_unsubscribes(transport: &MockTransport) {
    for (seq, _id) in transport.unsubscribe_requests() {
        transport.receive(format!("[2,{},0]", seq));
    }
}
