//! Registry behaviour against a scripted transport

mod common;

use common::*;
use parking_lot::Mutex;
use rta::{
    ConnectionState, Principal, RealTimeActivityService, RtaError, Subscription,
    SubscriptionErrorKind, SubscriptionHandler, SubscriptionState,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

#[tokio::test]
async fn test_add_before_activation_is_rejected() {
    let service = RealTimeActivityService::new(Principal::new(PRINCIPAL));
    let (sub, _handler) = recorded_subscription(&presence_uri(1));

    let result = service.add_subscription(&sub);

    assert!(matches!(result, Err(RtaError::NotActivated)));
    assert_eq!(sub.state(), SubscriptionState::Unknown);
    assert_eq!(service.subscription_count(), 0);
}

#[tokio::test]
async fn test_add_while_connecting_waits_for_connection() {
    let transport = MockTransport::new();
    let service = activated_service(transport.clone(), &test_config());
    let (sub, _handler) = recorded_subscription(&presence_uri(1));

    service.add_subscription(&sub).unwrap();
    assert_eq!(sub.state(), SubscriptionState::PendingSubscribe);
    assert!(transport.sent_frames().is_empty());

    settle().await;

    assert_eq!(service.connection_state(), ConnectionState::Connected);
    let requests = transport.subscribe_requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].1, presence_uri(1));
}

#[tokio::test]
async fn test_add_while_connected_sends_immediately() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _handler) = recorded_subscription(&presence_uri(1));

    service.add_subscription(&sub).unwrap();

    assert_eq!(transport.subscribe_requests().len(), 1);
    assert_eq!(service.subscription_count(), 1);
}

#[tokio::test]
async fn test_round_trip_delivers_to_originating_subscription_only() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (first, first_handler) = recorded_subscription(&presence_uri(1));
    let (second, second_handler) = recorded_subscription(&presence_uri(2));

    service.add_subscription(&first).unwrap();
    service.add_subscription(&second).unwrap();

    let requests = transport.subscribe_requests();
    let first_seq = requests
        .iter()
        .find(|(_, uri)| *uri == presence_uri(1))
        .map(|(seq, _)| *seq)
        .unwrap();
    transport.receive(format!(r#"[1,{},0,42,{{"devices":[]}}]"#, first_seq));

    assert_eq!(first.state(), SubscriptionState::Subscribed);
    assert_eq!(first.subscription_id(), Some(42));
    assert_eq!(*first_handler.created.lock(), vec![(42, json!({"devices": []}))]);

    transport.receive(r#"[3,42,{"devices":[{"type":"PC"}]}]"#);

    assert_eq!(
        *first_handler.events.lock(),
        vec![json!({"devices": [{"type": "PC"}]})]
    );
    assert!(second_handler.events.lock().is_empty());
    assert!(second_handler.created.lock().is_empty());
    assert_eq!(second.state(), SubscriptionState::PendingSubscribe);
}

#[tokio::test]
async fn test_change_event_for_unknown_id_is_dropped() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, handler) = recorded_subscription(&presence_uri(1));
    let errors = Arc::new(AtomicUsize::new(0));
    let counter = errors.clone();
    service.add_subscription_error_handler(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);

    transport.receive(r#"[3,99999,{"x":1}]"#);

    assert!(handler.events.lock().is_empty());
    assert_eq!(errors.load(Ordering::SeqCst), 0);
    assert_eq!(sub.state(), SubscriptionState::Subscribed);
}

#[tokio::test]
async fn test_malformed_frames_are_ignored() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;

    transport.receive("garbage");
    transport.receive("[]");
    transport.receive("[17,1,2]");
    transport.receive("[1,123456789,0,5,{}]");
    transport.receive("[2,123456789,0]");

    assert_eq!(service.connection_state(), ConnectionState::Connected);
    assert_eq!(service.subscription_count(), 0);
}

#[tokio::test]
async fn test_rejected_subscribe_reports_error() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, handler) = recorded_subscription(&presence_uri(1));
    let reported = Arc::new(Mutex::new(Vec::new()));
    let seen = reported.clone();
    service.add_subscription_error_handler(move |event| {
        seen.lock().push((event.subscription.guid(), event.error, event.message.clone()));
    });

    service.add_subscription(&sub).unwrap();
    let seq = transport.subscribe_requests()[0].0;
    transport.receive(format!(r#"[1,{},2,"Access to the resource is denied"]"#, seq));

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(
        *reported.lock(),
        vec![(
            sub.guid(),
            SubscriptionErrorKind::AccessDenied,
            "Access to the resource is denied".to_string()
        )]
    );
    assert_eq!(handler.errors.lock()[0].0, SubscriptionErrorKind::AccessDenied);
}

#[tokio::test]
async fn test_rejection_without_message_reports_raw_frame() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, handler) = recorded_subscription(&presence_uri(1));

    service.add_subscription(&sub).unwrap();
    let seq = transport.subscribe_requests()[0].0;
    let frame = format!("[1,{},1]", seq);
    transport.receive(frame.clone());

    let errors = handler.errors.lock();
    assert_eq!(errors[0].0, SubscriptionErrorKind::SubscriptionLimitReached);
    assert_eq!(errors[0].1, frame);
}

#[tokio::test]
async fn test_unsubscribe_round_trip() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, handler) = recorded_subscription(&presence_uri(1));

    service.add_subscription(&sub).unwrap();
    let seq = transport.subscribe_requests()[0].0;
    transport.receive(format!("[1,{},0,42,{{}}]", seq));

    service.remove_subscription(&sub).unwrap();

    assert_eq!(sub.state(), SubscriptionState::PendingUnsubscribe);
    let unsubscribes = transport.unsubscribe_requests();
    assert_eq!(unsubscribes.len(), 1);
    assert_eq!(unsubscribes[0].1, 42);

    // Events racing the unsubscribe no longer reach the handler
    transport.receive("[3,42,{}]");
    assert!(handler.events.lock().is_empty());

    // Removing again is a no-op
    service.remove_subscription(&sub).unwrap();
    assert_eq!(transport.unsubscribe_requests().len(), 1);

    transport.receive(format!("[2,{},0]", unsubscribes[0].0));
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(sub.subscription_id(), None);
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(
        *handler.states.lock(),
        vec![
            SubscriptionState::PendingSubscribe,
            SubscriptionState::Subscribed,
            SubscriptionState::PendingUnsubscribe,
            SubscriptionState::Closed
        ]
    );
}

#[tokio::test]
async fn test_failed_unsubscribe_still_closes() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _handler) = recorded_subscription(&presence_uri(1));

    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);
    service.remove_subscription(&sub).unwrap();

    let seq = transport.unsubscribe_requests()[0].0;
    transport.receive(format!("[2,{},5]", seq));

    assert_eq!(sub.state(), SubscriptionState::Closed);
}

#[tokio::test]
async fn test_remove_unacknowledged_subscription_sends_nothing() {
    let transport = MockTransport::new();
    let service = activated_service(transport.clone(), &test_config());
    let (queued, _) = recorded_subscription(&presence_uri(1));

    // Still queued, never sent
    service.add_subscription(&queued).unwrap();
    service.remove_subscription(&queued).unwrap();
    assert_eq!(queued.state(), SubscriptionState::Closed);

    settle().await;
    assert!(transport.subscribe_requests().is_empty());

    // Sent but not acknowledged
    let (in_flight, in_flight_handler) = recorded_subscription(&presence_uri(2));
    service.add_subscription(&in_flight).unwrap();
    let seq = transport.subscribe_requests()[0].0;
    service.remove_subscription(&in_flight).unwrap();

    assert_eq!(in_flight.state(), SubscriptionState::Closed);
    assert!(transport.unsubscribe_requests().is_empty());
    assert_eq!(service.subscription_count(), 0);

    // A late acknowledgement is dropped
    transport.receive(format!("[1,{},0,7,{{}}]", seq));
    assert!(in_flight_handler.created.lock().is_empty());
    assert_eq!(in_flight.state(), SubscriptionState::Closed);
}

#[tokio::test]
async fn test_subscription_cannot_be_added_twice() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _) = recorded_subscription(&presence_uri(1));

    service.add_subscription(&sub).unwrap();
    assert!(matches!(
        service.add_subscription(&sub),
        Err(RtaError::InvalidArgument(_))
    ));

    service.remove_subscription(&sub).unwrap();
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert!(matches!(
        service.add_subscription(&sub),
        Err(RtaError::InvalidArgument(_))
    ));
    assert_eq!(transport.subscribe_requests().len(), 1);
}

#[tokio::test]
async fn test_reconnect_replays_every_subscription() {
    const N: usize = 5;

    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let subs: Vec<_> = (0..N as u64)
        .map(|xuid| recorded_subscription(&presence_uri(xuid)))
        .collect();

    for (sub, _) in &subs {
        service.add_subscription(sub).unwrap();
    }
    ack_subscribes(&transport);
    let old_ids: Vec<_> = subs.iter().map(|(sub, _)| sub.subscription_id().unwrap()).collect();
    assert!(subs.iter().all(|(sub, _)| sub.state() == SubscriptionState::Subscribed));

    transport.clear_sent();
    transport.drop_connection(1006);

    assert_eq!(service.connection_state(), ConnectionState::Connecting);
    assert!(subs
        .iter()
        .all(|(sub, _)| sub.state() == SubscriptionState::PendingSubscribe));

    settle().await;

    assert_eq!(service.connection_state(), ConnectionState::Connected);
    assert_eq!(transport.connect_attempts(), 2);
    let replayed = transport.subscribe_requests();
    assert_eq!(replayed.len(), N);

    ack_subscribes(&transport);

    for ((sub, handler), old_id) in subs.iter().zip(old_ids) {
        assert_eq!(sub.state(), SubscriptionState::Subscribed);
        assert_ne!(sub.subscription_id(), Some(old_id));
        assert_eq!(handler.created.lock().len(), 2);
    }
    assert_eq!(service.subscription_count(), N);
}

#[tokio::test]
async fn test_reconnect_closes_pending_unsubscribes() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (leaving, _) = recorded_subscription(&presence_uri(1));
    let (staying, _) = recorded_subscription(&presence_uri(2));

    service.add_subscription(&leaving).unwrap();
    service.add_subscription(&staying).unwrap();
    ack_subscribes(&transport);
    service.remove_subscription(&leaving).unwrap();

    transport.drop_connection(1011);

    assert_eq!(leaving.state(), SubscriptionState::Closed);
    assert_eq!(staying.state(), SubscriptionState::PendingSubscribe);

    settle().await;
    assert_eq!(service.subscription_count(), 1);
}

#[tokio::test]
async fn test_normal_close_from_peer_closes_everything() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _) = recorded_subscription(&presence_uri(1));
    let (queued, _) = recorded_subscription(&presence_uri(2));

    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);
    service.add_subscription(&queued).unwrap();

    transport.drop_connection(1000);
    settle().await;

    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(queued.state(), SubscriptionState::Closed);
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(transport.connect_attempts(), 1);

    let (late, _) = recorded_subscription(&presence_uri(3));
    assert!(matches!(
        service.add_subscription(&late),
        Err(RtaError::NotActivated)
    ));
}

#[tokio::test]
async fn test_resync_notifies_handlers() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _) = recorded_subscription(&presence_uri(1));
    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let token = service.add_resync_handler(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    transport.receive("[4]");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(sub.state(), SubscriptionState::Subscribed);

    assert!(service.remove_resync_handler(token));
    transport.receive("[4]");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_new_state_handler_learns_current_state() {
    let transport = MockTransport::new();

    let idle = RealTimeActivityService::new(Principal::new(PRINCIPAL));
    let told = Arc::new(Mutex::new(Vec::new()));
    let seen = told.clone();
    idle.add_connection_state_change_handler(move |state| seen.lock().push(state));
    assert!(told.lock().is_empty());

    let service = connected_service(transport.clone()).await;
    let seen = told.clone();
    let token = service.add_connection_state_change_handler(move |state| seen.lock().push(state));
    assert_eq!(*told.lock(), vec![ConnectionState::Connected]);

    transport.drop_connection(1006);
    settle().await;
    assert_eq!(
        *told.lock(),
        vec![
            ConnectionState::Connected,
            ConnectionState::Connecting,
            ConnectionState::Connected
        ]
    );

    assert!(service.remove_connection_state_change_handler(token));
    assert!(!service.remove_connection_state_change_handler(token));
}

#[tokio::test]
async fn test_close_clears_state_but_keeps_resync_handlers() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _) = recorded_subscription(&presence_uri(1));
    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);

    let state_token = service.add_connection_state_change_handler(|_| {});
    let error_token = service.add_subscription_error_handler(|_| {});
    let resync_token = service.add_resync_handler(|| {});

    service.close();

    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(service.subscription_count(), 0);
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert!(!service.is_activated());
    assert!(!transport.is_connected());
    assert_eq!(transport.closes(), 1);

    assert!(!service.remove_connection_state_change_handler(state_token));
    assert!(!service.remove_subscription_error_handler(error_token));
    assert!(service.remove_resync_handler(resync_token));

    // Frames arriving after close go nowhere
    transport.receive("[3,1000,{}]");
    settle().await;
    assert_eq!(transport.connect_attempts(), 1);
}

#[tokio::test]
async fn test_close_from_connecting_handler_stays_closed() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (sub, _) = recorded_subscription(&presence_uri(1));
    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);

    let handle = service.clone();
    service.add_connection_state_change_handler(move |state| {
        if state == ConnectionState::Connecting {
            handle.close();
        }
    });

    transport.drop_connection(1006);
    settle().await;

    assert_eq!(transport.connect_attempts(), 1);
    assert!(!transport.is_connected());
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
    assert!(!service.is_activated());
    assert_eq!(sub.state(), SubscriptionState::Closed);
    assert_eq!(service.subscription_count(), 0);
}

#[tokio::test]
async fn test_close_before_reconnect_runs_stays_closed() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;

    // The reconnect loop is spawned but not yet polled when close lands
    transport.drop_connection(1006);
    service.close();
    settle().await;

    assert_eq!(transport.connect_attempts(), 1);
    assert!(!transport.is_connected());
    assert_eq!(service.connection_state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_subscriptions_snapshot() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let (first, _) = recorded_subscription(&presence_uri(1));
    let (second, _) = recorded_subscription(&presence_uri(2));

    service.add_subscription(&first).unwrap();
    ack_subscribes(&transport);
    service.add_subscription(&second).unwrap();

    let mut snapshot = service.subscriptions();
    snapshot.sort_by(|a, b| a.resource_uri.cmp(&b.resource_uri));

    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].guid, first.guid());
    assert_eq!(snapshot[0].state, SubscriptionState::Subscribed);
    assert!(snapshot[0].subscription_id.is_some());
    assert_eq!(snapshot[1].guid, second.guid());
    assert_eq!(snapshot[1].state, SubscriptionState::PendingSubscribe);
}

/// Unsubscribes itself as soon as it is created
struct OneShotHandler {
    target: Mutex<Option<(RealTimeActivityService, Arc<Subscription>)>>,
    created: AtomicUsize,
}

impl SubscriptionHandler for OneShotHandler {
    fn on_created(&self, _subscription_id: u32, _data: &Value) {
        self.created.fetch_add(1, Ordering::SeqCst);
        if let Some((service, subscription)) = self.target.lock().take() {
            service.remove_subscription(&subscription).unwrap();
        }
    }

    fn on_event(&self, _data: &Value) {}
}

#[tokio::test]
async fn test_callbacks_may_reenter_the_registry() {
    let transport = MockTransport::new();
    let service = connected_service(transport.clone()).await;
    let handler = Arc::new(OneShotHandler {
        target: Mutex::new(None),
        created: AtomicUsize::new(0),
    });
    let sub = Subscription::new(presence_uri(1), handler.clone());
    *handler.target.lock() = Some((service.clone(), sub.clone()));

    service.add_subscription(&sub).unwrap();
    ack_subscribes(&transport);

    assert_eq!(handler.created.load(Ordering::SeqCst), 1);
    assert_eq!(sub.state(), SubscriptionState::PendingUnsubscribe);
    assert_eq!(transport.unsubscribe_requests().len(), 1);

    ack_unsubscribes(&transport);
    assert_eq!(sub.state(), SubscriptionState::Closed);
}
