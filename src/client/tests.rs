use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::{Instant, sleep, timeout};

use super::reconnect::{Backoff, BackoffConfig, ConnectionState, ReconnectController};
use super::{Client, ClientHandle, ClientOptions};
use crate::dispatch::{HandlerResult, TopicFilter};
use crate::persistence::{MemoryBackend, SessionBackend};
use crate::publisher::WindowFullPolicy;
use crate::session::{ClientIdentity, DeliveryState, InFlightMessage, Session, SessionStore};
use crate::transport::{BrokerLink, MemoryAcceptor, MemoryConnector, Packet, Publish, QoS, TopicSubscription};
use crate::utils::error::{Error, Result};

const WAIT: Duration = Duration::from_secs(5);

fn ms(millis: u64) -> Duration {
    Duration::from_millis(millis)
}

fn options(id: &str) -> ClientOptions {
    let mut options = ClientOptions::new(ClientIdentity::new(id));
    options.reconnect = BackoffConfig {
        min: ms(10),
        max: ms(50),
        jitter: 0.0,
    };
    options.persist_retry = options.reconnect;
    options.connect_timeout = Duration::from_secs(2);
    options
}

fn publish(topic: &str, payload: &[u8], qos: QoS, packet_id: Option<u16>, dup: bool) -> Packet {
    Packet::Publish(Publish {
        topic: topic.to_string(),
        payload: payload.to_vec(),
        qos,
        packet_id,
        dup,
    })
}

async fn next(link: &mut BrokerLink) -> Packet {
    timeout(WAIT, link.recv())
        .await
        .expect("timed out waiting for a packet")
        .expect("client closed the link")
}

/// Accepts the next connection, returning the link and the CONNECT packet.
async fn accept(acceptor: &mut MemoryAcceptor, session_present: bool) -> (BrokerLink, Packet) {
    let mut link = timeout(WAIT, acceptor.accept())
        .await
        .expect("client never connected")
        .expect("connector dropped");
    let connect = next(&mut link).await;
    link.send(Packet::ConnAck { session_present }).unwrap();
    (link, connect)
}

async fn connected(handle: &ClientHandle) {
    timeout(WAIT, handle.wait_for_state(ConnectionState::Connected))
        .await
        .expect("client never reached Connected")
        .unwrap();
}

fn counting_handler(
    handle: &ClientHandle,
    filter: &str,
) -> (Arc<AtomicUsize>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let (tx, rx) = mpsc::unbounded_channel();
    let counter = Arc::clone(&calls);
    handle
        .register_handler(filter, move |_: &str, payload: &[u8], _: QoS| -> HandlerResult {
            counter.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(payload.to_vec());
            Ok(())
        })
        .unwrap();
    (calls, rx)
}

#[derive(Debug, Default)]
struct FlakyBackend {
    inner: MemoryBackend,
    broken: AtomicBool,
}

impl SessionBackend for FlakyBackend {
    fn load(&self, client_id: &str) -> Result<Option<Vec<u8>>> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("disk detached".into()));
        }
        self.inner.load(client_id)
    }

    fn store(&self, client_id: &str, record: &[u8]) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) {
            return Err(Error::StorageUnavailable("disk detached".into()));
        }
        self.inner.store(client_id, record)
    }

    fn remove(&self, client_id: &str) -> Result<()> {
        self.inner.remove(client_id)
    }
}

#[test]
fn test_backoff_doubles_up_to_max() {
    let mut backoff = Backoff::new(BackoffConfig {
        min: ms(100),
        max: ms(1000),
        jitter: 0.0,
    });

    let delays: Vec<_> = (0..6).map(|_| backoff.next_delay()).collect();
    assert_eq!(
        delays,
        vec![ms(100), ms(200), ms(400), ms(800), ms(1000), ms(1000)]
    );

    backoff.reset();
    assert_eq!(backoff.attempt(), 0);
    assert_eq!(backoff.next_delay(), ms(100));
}

#[test]
fn test_backoff_jitter_stays_proportional() {
    let mut backoff = Backoff::new(BackoffConfig {
        min: ms(100),
        max: ms(10_000),
        jitter: 0.5,
    });
    for _ in 0..50 {
        backoff.reset();
        let delay = backoff.next_delay();
        assert!(delay >= ms(50) && delay <= ms(150), "{delay:?}");
    }
}

#[test]
fn test_state_transitions() {
    use ConnectionState::*;
    assert!(Disconnected.can_transition_to(Connecting));
    assert!(Connecting.can_transition_to(Connected));
    assert!(Connected.can_transition_to(Reconnecting));
    assert!(Reconnecting.can_transition_to(Connecting));
    assert!(Connected.can_transition_to(Disconnected));
    assert!(!Disconnected.can_transition_to(Connected));
    assert!(!Reconnecting.can_transition_to(Connected));
}

#[tokio::test]
async fn test_controller_clean_start_and_grace_reset() {
    let config = BackoffConfig {
        min: ms(100),
        max: ms(1000),
        jitter: 0.0,
    };
    let (mut controller, state) = ReconnectController::new(true, config, Duration::from_secs(10));
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);

    assert!(controller.begin_connect());
    assert_eq!(controller.attempt_failed(), ms(100));
    assert_eq!(controller.state(), ConnectionState::Reconnecting);
    assert!(controller.begin_connect());
    assert_eq!(controller.attempt_failed(), ms(200));

    let t0 = Instant::now();
    assert!(controller.begin_connect());
    controller.connected(t0);
    assert_eq!(*state.borrow(), ConnectionState::Connected);

    // dropped before the grace period: keep growing
    assert_eq!(controller.link_lost(t0 + Duration::from_secs(1)), ms(400));
    assert!(!controller.begin_connect());

    let t1 = t0 + Duration::from_secs(2);
    controller.connected(t1);
    assert_eq!(controller.link_lost(t1 + Duration::from_secs(10)), ms(100));

    controller.shutdown();
    assert_eq!(*state.borrow(), ConnectionState::Disconnected);
}

#[test]
fn test_options_from_settings() {
    let mut settings = crate::config::Settings::default();
    settings.publisher.max_inflight = 4;
    settings.publisher.window_full = WindowFullPolicy::Queue;

    let options = ClientOptions::from_settings(&settings, ClientIdentity::new("publisher-x"));
    assert_eq!(options.client_id.as_str(), "publisher-x");
    assert_eq!(options.max_inflight, 4);
    assert_eq!(options.window_full, WindowFullPolicy::Queue);
    assert_eq!(options.reconnect.min, ms(500));

    settings.client.id = Some("fixed".to_string());
    let options = ClientOptions::from_settings(&settings, ClientIdentity::new("publisher-x"));
    assert_eq!(options.client_id.as_str(), "fixed");
}

#[tokio::test]
async fn test_connect_carries_identity_and_persistent_flag() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();

    let (mut link, connect) = accept(&mut acceptor, false).await;
    assert_eq!(
        connect,
        Packet::Connect {
            client_id: "consumer-1".to_string(),
            clean_start: false,
        }
    );
    connected(&handle).await;

    client.shutdown().await;
    assert_eq!(next(&mut link).await, Packet::Disconnect);
    assert_eq!(handle.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_shared_subscription_delivers_and_acknowledges() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, false).await;
    connected(&handle).await;

    let (_, mut received) = counting_handler(&handle, "$share/group1/device/+/data");
    handle
        .subscribe("$share/group1/device/+/data", QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(
        next(&mut link).await,
        Packet::Subscribe {
            packet_id: 1,
            subscriptions: vec![TopicSubscription {
                filter: "$share/group1/device/+/data".to_string(),
                qos: QoS::AtLeastOnce,
            }],
        }
    );
    link.send(Packet::SubAck {
        packet_id: 1,
        granted: vec![Some(QoS::AtLeastOnce)],
    })
    .unwrap();

    link.send(publish("device/7/data", b"{\"seq\":1}", QoS::AtLeastOnce, Some(3), false))
        .unwrap();
    let payload = timeout(WAIT, received.recv()).await.unwrap().unwrap();
    assert_eq!(payload, b"{\"seq\":1}".to_vec());
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });

    client.shutdown().await;
}

#[tokio::test]
async fn test_redelivered_duplicate_reaches_handler_once() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;
    let (calls, _received) = counting_handler(&handle, "device/+/data");

    link.send(publish("device/1/data", b"x", QoS::AtLeastOnce, Some(3), false))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });

    link.send(publish("device/1/data", b"x", QoS::AtLeastOnce, Some(3), true))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_new_message_redelivered_on_a_completed_id_reaches_handler() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;
    let (calls, mut received) = counting_handler(&handle, "device/+/data");

    link.send(publish("device/1/data", b"A", QoS::AtLeastOnce, Some(3), false))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });

    // the broker reused id 3 and lost the first send of the next message
    link.send(publish("device/1/data", b"B", QoS::AtLeastOnce, Some(3), true))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });

    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(received.recv().await.unwrap(), b"A".to_vec());
    assert_eq!(received.recv().await.unwrap(), b"B".to_vec());

    client.shutdown().await;
}

#[tokio::test]
async fn test_handler_failure_withholds_acknowledgment() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;

    handle
        .register_handler("device/+/data", |_: &str, payload: &[u8], _: QoS| -> HandlerResult {
            if payload == b"bad" {
                Err("rejected".into())
            } else {
                Ok(())
            }
        })
        .unwrap();

    link.send(publish("device/1/data", b"bad", QoS::AtLeastOnce, Some(3), false))
        .unwrap();
    link.send(publish("device/1/data", b"good", QoS::AtLeastOnce, Some(4), false))
        .unwrap();
    // same lane, so the failed message was settled before this ack
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 4 });
    assert!(link.try_recv().is_none());

    // the broker's redelivery goes through the handler again
    link.send(publish("device/1/data", b"good", QoS::AtLeastOnce, Some(3), true))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });

    client.shutdown().await;
}

#[tokio::test]
async fn test_unmatched_message_is_acknowledged() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;

    let id = handle
        .register_handler("device/#", |_: &str, _: &[u8], _: QoS| -> HandlerResult {
            Err("should not run".into())
        })
        .unwrap();
    assert!(handle.remove_handler(id));
    assert!(!handle.remove_handler(id));

    link.send(publish("device/1/data", b"x", QoS::AtLeastOnce, Some(8), false))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 8 });

    client.shutdown().await;
}

#[tokio::test]
async fn test_inbound_exactly_once_handshake() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;
    let (calls, _received) = counting_handler(&handle, "device/+/data");

    link.send(publish("device/2/data", b"x", QoS::ExactlyOnce, Some(5), false))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubRec { packet_id: 5 });
    link.send(publish("device/2/data", b"x", QoS::ExactlyOnce, Some(5), true))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubRec { packet_id: 5 });
    link.send(Packet::PubRel { packet_id: 5 }).unwrap();
    assert_eq!(next(&mut link).await, Packet::PubComp { packet_id: 5 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.shutdown().await;
}

#[tokio::test]
async fn test_inbound_exactly_once_resumes_at_release_after_restart() {
    let identity = ClientIdentity::new("consumer-2");
    let store = SessionStore::in_memory();

    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-2"), connector, store.clone());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, false).await;
    connected(&handle).await;
    let (calls, _received) = counting_handler(&handle, "device/+/data");

    link.send(publish("device/3/data", b"once", QoS::ExactlyOnce, Some(7), false))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubRec { packet_id: 7 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    client.shutdown().await;
    assert_eq!(next(&mut link).await, Packet::Disconnect);
    let persisted = store.restore(&identity, false);
    assert_eq!(
        persisted.pending_inbound[0].state,
        DeliveryState::AcknowledgedPartial
    );

    // process restart, PUBREL never arrived
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-2"), connector, store.clone());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;
    let (calls, _received) = counting_handler(&handle, "device/+/data");

    link.send(publish("device/3/data", b"once", QoS::ExactlyOnce, Some(7), true))
        .unwrap();
    assert_eq!(next(&mut link).await, Packet::PubRec { packet_id: 7 });
    link.send(Packet::PubRel { packet_id: 7 }).unwrap();
    assert_eq!(next(&mut link).await, Packet::PubComp { packet_id: 7 });
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    client.shutdown().await;
}

#[tokio::test]
async fn test_at_least_once_across_link_drop() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("publisher-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, false).await;
    connected(&handle).await;

    let submission = handle
        .publish("device/1/data", b"{\"seq\":1}".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(submission.packet_id(), Some(1));
    assert_eq!(
        next(&mut link).await,
        publish("device/1/data", b"{\"seq\":1}", QoS::AtLeastOnce, Some(1), false)
    );

    // the PUBACK never makes it back
    drop(link);

    let (mut link, connect) = accept(&mut acceptor, true).await;
    assert_eq!(
        connect,
        Packet::Connect {
            client_id: "publisher-1".to_string(),
            clean_start: false,
        }
    );
    assert_eq!(
        next(&mut link).await,
        publish("device/1/data", b"{\"seq\":1}", QoS::AtLeastOnce, Some(1), true)
    );
    link.send(Packet::PubAck { packet_id: 1 }).unwrap();

    timeout(WAIT, submission.acknowledged())
        .await
        .unwrap()
        .unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_offline_publishes_are_persisted_and_sent_in_order() {
    let (connector, mut acceptor) = MemoryConnector::new();
    connector.set_available(false);
    let identity = ClientIdentity::new("publisher-1");
    let store = SessionStore::in_memory();
    let client = Client::start(options("publisher-1"), connector.clone(), store.clone());
    let handle = client.handle().clone();

    for seq in 1..=3 {
        let payload = format!("{{\"seq\":{seq}}}").into_bytes();
        handle
            .publish("device/1/data", payload, QoS::AtLeastOnce)
            .await
            .unwrap();
    }
    assert_ne!(handle.state(), ConnectionState::Connected);
    assert_eq!(store.restore(&identity, false).pending_outbound.len(), 3);

    connector.set_available(true);
    let (mut link, _) = accept(&mut acceptor, true).await;
    for seq in 1..=3u16 {
        let payload = format!("{{\"seq\":{seq}}}");
        assert_eq!(
            next(&mut link).await,
            publish("device/1/data", payload.as_bytes(), QoS::AtLeastOnce, Some(seq), false)
        );
    }

    connected(&handle).await;
    handle
        .publish("device/1/data", b"{\"seq\":4}".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(
        next(&mut link).await,
        publish("device/1/data", b"{\"seq\":4}", QoS::AtLeastOnce, Some(4), false)
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_clean_start_discards_previous_session() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let identity = ClientIdentity::new("consumer-9");
    let store = SessionStore::in_memory();

    let mut previous = Session::new(identity.clone(), false);
    previous.add_subscription(TopicFilter::parse("device/#").unwrap(), QoS::AtLeastOnce);
    previous.pending_outbound.push(InFlightMessage::new(
        5,
        "device/1/data",
        b"old".to_vec(),
        QoS::AtLeastOnce,
        DeliveryState::Sent,
    ));
    store.persist(&previous).unwrap();

    let mut opts = options("consumer-9");
    opts.clean_start = true;
    let client = Client::start(opts, connector, store.clone());
    let handle = client.handle().clone();

    let (mut link, connect) = accept(&mut acceptor, false).await;
    assert_eq!(
        connect,
        Packet::Connect {
            client_id: "consumer-9".to_string(),
            clean_start: true,
        }
    );
    connected(&handle).await;

    handle
        .publish("device/2/data", b"new".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    // nothing from the old session is resubscribed or replayed first
    assert_eq!(
        next(&mut link).await,
        publish("device/2/data", b"new", QoS::AtLeastOnce, Some(1), false)
    );

    let persisted = store.restore(&identity, false);
    assert!(persisted.subscriptions.is_empty());
    assert_eq!(persisted.pending_outbound.len(), 1);

    // later reconnects resume the session instead of wiping it again
    drop(link);
    let (_link, connect) = accept(&mut acceptor, true).await;
    assert_eq!(
        connect,
        Packet::Connect {
            client_id: "consumer-9".to_string(),
            clean_start: false,
        }
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_subscriptions_restored_after_reconnect() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, false).await;
    connected(&handle).await;

    handle
        .subscribe("$share/group1/device/+/data", QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(matches!(next(&mut link).await, Packet::Subscribe { packet_id: 1, .. }));
    drop(link);

    let (mut link, _) = accept(&mut acceptor, true).await;
    match next(&mut link).await {
        Packet::Subscribe {
            packet_id,
            subscriptions,
        } => {
            assert_eq!(packet_id, 1);
            assert_eq!(subscriptions.len(), 1);
            assert_eq!(subscriptions[0].filter, "$share/group1/device/+/data");
        }
        other => panic!("expected SUBSCRIBE, got {other:?}"),
    }

    client.shutdown().await;
}

#[tokio::test]
async fn test_exactly_once_publish_resumes_at_release_after_restart() {
    let identity = ClientIdentity::new("publisher-2");
    let store = SessionStore::in_memory();

    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("publisher-2"), connector, store.clone());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, false).await;
    connected(&handle).await;

    let submission = handle
        .publish("device/1/data", b"once".to_vec(), QoS::ExactlyOnce)
        .await
        .unwrap();
    assert!(matches!(next(&mut link).await, Packet::Publish(_)));
    link.send(Packet::PubRec { packet_id: 1 }).unwrap();
    assert_eq!(next(&mut link).await, Packet::PubRel { packet_id: 1 });

    client.shutdown().await;
    assert_eq!(next(&mut link).await, Packet::Disconnect);
    assert_eq!(submission.acknowledged().await, Err(Error::Shutdown));

    let persisted = store.restore(&identity, false);
    assert_eq!(
        persisted.pending_outbound[0].state,
        DeliveryState::AcknowledgedPartial
    );

    // process restart
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("publisher-2"), connector, store.clone());
    let (mut link, _) = accept(&mut acceptor, true).await;
    assert_eq!(next(&mut link).await, Packet::PubRel { packet_id: 1 });
    link.send(Packet::PubComp { packet_id: 1 }).unwrap();

    timeout(WAIT, async {
        while !store.restore(&identity, false).pending_outbound.is_empty() {
            sleep(ms(10)).await;
        }
    })
    .await
    .expect("PUBCOMP never completed the flow");
    client.shutdown().await;
    assert_eq!(next(&mut link).await, Packet::Disconnect);
}

#[tokio::test]
async fn test_block_policy_suspends_publish_until_acknowledged() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let mut opts = options("publisher-1");
    opts.max_inflight = 1;
    opts.window_full = WindowFullPolicy::Block;
    let client = Client::start(opts, connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;

    let first = handle
        .publish("device/1/data", b"a".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(matches!(next(&mut link).await, Packet::Publish(p) if p.payload == b"a"));

    let blocked = handle.clone();
    let second = tokio::spawn(async move {
        blocked
            .publish("device/1/data", b"b".to_vec(), QoS::AtLeastOnce)
            .await
    });
    sleep(ms(100)).await;
    assert!(!second.is_finished());
    assert!(link.try_recv().is_none());

    link.send(Packet::PubAck { packet_id: 1 }).unwrap();
    timeout(WAIT, first.acknowledged()).await.unwrap().unwrap();
    let second = timeout(WAIT, second).await.unwrap().unwrap().unwrap();
    assert_eq!(second.packet_id(), Some(1));
    assert_eq!(
        next(&mut link).await,
        publish("device/1/data", b"b", QoS::AtLeastOnce, Some(1), false)
    );

    client.shutdown().await;
}

#[tokio::test]
async fn test_queue_policy_admits_and_holds_transmission() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let mut opts = options("publisher-1");
    opts.max_inflight = 1;
    opts.window_full = WindowFullPolicy::Queue;
    let client = Client::start(opts, connector, SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;

    let first = handle
        .publish("device/1/data", b"a".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    let second = handle
        .publish("device/1/data", b"b".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    assert_eq!(first.packet_id(), Some(1));
    assert_eq!(second.packet_id(), Some(2));

    assert!(matches!(next(&mut link).await, Packet::Publish(p) if p.packet_id == Some(1)));
    sleep(ms(50)).await;
    assert!(link.try_recv().is_none());

    link.send(Packet::PubAck { packet_id: 1 }).unwrap();
    assert!(matches!(next(&mut link).await, Packet::Publish(p) if p.packet_id == Some(2)));
    link.send(Packet::PubAck { packet_id: 2 }).unwrap();
    timeout(WAIT, second.acknowledged()).await.unwrap().unwrap();

    client.shutdown().await;
}

#[tokio::test]
async fn test_malformed_packets_do_not_drop_the_link() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let client = Client::start(options("consumer-1"), connector.clone(), SessionStore::in_memory());
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;
    let (calls, _received) = counting_handler(&handle, "device/#");

    link.send(publish("device/+/data", b"x", QoS::AtLeastOnce, Some(2), false))
        .unwrap();
    link.send(publish("device/1/data", b"x", QoS::AtLeastOnce, None, false))
        .unwrap();
    link.send(Packet::PubAck { packet_id: 99 }).unwrap();
    link.send(Packet::ConnAck {
        session_present: true,
    })
    .unwrap();
    link.send(publish("device/1/data", b"x", QoS::AtLeastOnce, Some(3), false))
        .unwrap();

    assert_eq!(next(&mut link).await, Packet::PubAck { packet_id: 3 });
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(connector.attempts(), 1);
    assert_eq!(handle.state(), ConnectionState::Connected);

    client.shutdown().await;
}

#[tokio::test]
async fn test_storage_outage_is_not_fatal() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let backend = Arc::new(FlakyBackend::default());
    backend.broken.store(true, Ordering::SeqCst);
    let client = Client::start(
        options("publisher-1"),
        connector,
        SessionStore::with_backend(backend.clone()),
    );
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;

    let submission = handle
        .publish("device/1/data", b"x".to_vec(), QoS::AtLeastOnce)
        .await
        .unwrap();
    assert!(matches!(next(&mut link).await, Packet::Publish(_)));
    assert_eq!(backend.inner.load("publisher-1").unwrap(), None);

    backend.broken.store(false, Ordering::SeqCst);
    let recovered = timeout(WAIT, async {
        loop {
            if let Some(record) = backend.inner.load("publisher-1").unwrap() {
                break serde_json::from_slice::<Session>(&record).unwrap();
            }
            sleep(ms(10)).await;
        }
    })
    .await
    .unwrap();
    assert_eq!(recovered.pending_outbound.len(), 1);

    link.send(Packet::PubAck { packet_id: 1 }).unwrap();
    timeout(WAIT, submission.acknowledged()).await.unwrap().unwrap();
    client.shutdown().await;
}

#[derive(Debug, Default)]
struct SlowBackend {
    inner: MemoryBackend,
}

impl SessionBackend for SlowBackend {
    fn load(&self, client_id: &str) -> Result<Option<Vec<u8>>> {
        self.inner.load(client_id)
    }

    fn store(&self, client_id: &str, record: &[u8]) -> Result<()> {
        std::thread::sleep(ms(300));
        self.inner.store(client_id, record)
    }

    fn remove(&self, client_id: &str) -> Result<()> {
        self.inner.remove(client_id)
    }
}

#[tokio::test]
async fn test_session_writes_do_not_stall_the_runtime() {
    let (connector, mut acceptor) = MemoryConnector::new();
    let backend = Arc::new(SlowBackend::default());
    let client = Client::start(
        options("publisher-1"),
        connector,
        SessionStore::with_backend(backend.clone()),
    );
    let handle = client.handle().clone();
    let (mut link, _) = accept(&mut acceptor, true).await;
    connected(&handle).await;

    let publisher = handle.clone();
    let pending = tokio::spawn(async move {
        publisher
            .publish("device/1/data", b"x".to_vec(), QoS::AtLeastOnce)
            .await
    });

    // a write is in flight; this single-threaded runtime still ticks
    sleep(ms(50)).await;
    let started = Instant::now();
    sleep(ms(20)).await;
    assert!(started.elapsed() < ms(200));

    let submission = timeout(WAIT, pending).await.unwrap().unwrap().unwrap();
    let record = backend.inner.load("publisher-1").unwrap().unwrap();
    let stored: Session = serde_json::from_slice(&record).unwrap();
    assert_eq!(stored.pending_outbound.len(), 1);

    assert!(matches!(next(&mut link).await, Packet::Publish(_)));
    link.send(Packet::PubAck { packet_id: 1 }).unwrap();
    timeout(WAIT, submission.acknowledged()).await.unwrap().unwrap();
    client.shutdown().await;
}

#[tokio::test]
async fn test_api_errors() {
    let (connector, _acceptor) = MemoryConnector::new();
    connector.set_available(false);
    let client = Client::start(options("publisher-1"), connector, SessionStore::in_memory());
    let handle = client.handle().clone();

    assert_eq!(
        handle
            .publish("device/1/data", b"x".to_vec(), QoS::AtMostOnce)
            .await
            .unwrap_err(),
        Error::NotConnected
    );
    assert!(matches!(
        handle
            .publish("device/+/data", b"x".to_vec(), QoS::AtLeastOnce)
            .await,
        Err(Error::InvalidTopicName(_))
    ));
    assert!(matches!(
        handle.subscribe("device/#/data", QoS::AtLeastOnce).await,
        Err(Error::InvalidTopicFilter(_))
    ));

    client.shutdown().await;
    assert_eq!(
        handle
            .publish("device/1/data", b"x".to_vec(), QoS::AtLeastOnce)
            .await
            .unwrap_err(),
        Error::Shutdown
    );
}
