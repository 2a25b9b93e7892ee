//! Client engine
//!
//! One task owns the broker link, the delivery tracker and the connection
//! state. Everything else reaches it through queues:
//! - `Command`s from any number of `ClientHandle`s,
//! - `HandlerCompletion`s from the dispatcher lanes,
//! - the result of the connect attempt running in its own task.
//!
//! The loop never waits on a handler, and backoff sleeps are just another
//! `select!` branch so commands are served while the link is down. Session
//! writes run on the blocking pool; the loop awaits them so state is stored
//! before the acknowledgment that depends on it goes out.

use std::collections::HashMap;
use std::future::pending;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::{oneshot, watch};
use tokio::task::{self, JoinError, JoinHandle};
use tokio::time::{Instant, sleep_until, timeout};
use tracing::{debug, error, info, warn};

use super::ClientOptions;
use super::handle::Command;
use super::reconnect::{Backoff, ReconnectController};
use crate::delivery::{DeliveryTracker, InboundAction};
use crate::dispatch::{Dispatcher, HandlerCompletion, TopicFilter};
use crate::publisher::{FlowController, PublishRequest, Submission};
use crate::session::{ClientIdentity, SessionStore};
use crate::transport::{Connection, Connector, Packet, Publish, QoS, TopicSubscription};
use crate::utils::error::{Error, Result};

type PublishReply = oneshot::Sender<Result<Submission>>;
type Attempt<T> = JoinHandle<Result<(T, bool)>>;

pub(crate) struct Engine<C: Connector> {
    options: ClientOptions,
    connector: Arc<C>,
    store: SessionStore,
    tracker: DeliveryTracker,
    dispatcher: Dispatcher,
    completions: UnboundedReceiver<HandlerCompletion>,
    commands: UnboundedReceiver<Command>,
    shutdown: watch::Receiver<bool>,
    stopped: watch::Sender<bool>,
    controller: ReconnectController,
    flow: FlowController<(PublishRequest, PublishReply)>,
    acks: HashMap<u16, oneshot::Sender<Result<()>>>,
    link: Option<C::Connection>,
    attempt: Option<Attempt<C::Connection>>,
    retry_at: Option<Instant>,
    persist_backoff: Backoff,
    persist_retry_at: Option<Instant>,
}

pub(crate) struct EngineParts<C: Connector> {
    pub options: ClientOptions,
    pub connector: C,
    pub store: SessionStore,
    pub tracker: DeliveryTracker,
    pub dispatcher: (Dispatcher, UnboundedReceiver<HandlerCompletion>),
    pub commands: UnboundedReceiver<Command>,
    pub shutdown: watch::Receiver<bool>,
    pub stopped: watch::Sender<bool>,
    pub controller: ReconnectController,
}

impl<C: Connector> Engine<C> {
    pub(crate) fn new(parts: EngineParts<C>) -> Self {
        let EngineParts {
            options,
            connector,
            store,
            tracker,
            dispatcher: (dispatcher, completions),
            commands,
            shutdown,
            stopped,
            controller,
        } = parts;

        Self {
            flow: FlowController::new(options.max_inflight, options.window_full),
            persist_backoff: Backoff::new(options.persist_retry),
            options,
            connector: Arc::new(connector),
            store,
            tracker,
            dispatcher,
            completions,
            commands,
            shutdown,
            stopped,
            controller,
            acks: HashMap::new(),
            link: None,
            attempt: None,
            retry_at: None,
            persist_retry_at: None,
        }
    }

    pub(crate) async fn run(mut self) {
        info!("Client '{}' starting", self.options.client_id);
        self.start_attempt();

        loop {
            tokio::select! {
                biased;

                changed = self.shutdown.changed() => {
                    if changed.is_err() || *self.shutdown.borrow() {
                        break;
                    }
                }
                received = next_packet(&mut self.link) => match received {
                    Ok(Some(packet)) => self.on_packet(packet).await,
                    Ok(None) => self.link_lost("broker closed the connection").await,
                    Err(Error::ProtocolViolation(reason)) => {
                        warn!("Discarding malformed packet: {reason}");
                    }
                    Err(e) => self.link_lost(&e.to_string()).await,
                },
                result = wait_attempt(&mut self.attempt) => {
                    self.attempt = None;
                    self.on_attempt(result).await;
                }
                _ = sleep_until_deadline(self.retry_at) => {
                    self.retry_at = None;
                    self.start_attempt();
                }
                command = self.commands.recv() => match command {
                    Some(command) => self.on_command(command).await,
                    None => break,
                },
                Some(completion) = self.completions.recv() => {
                    self.on_completion(completion).await;
                }
                _ = sleep_until_deadline(self.persist_retry_at) => {
                    self.persist_retry_at = None;
                    self.persist().await;
                }
            }
        }

        self.finish().await;
    }

    fn start_attempt(&mut self) {
        let clean_start = self.controller.begin_connect();
        let connector = Arc::clone(&self.connector);
        let client_id = self.options.client_id.clone();
        let limit = self.options.connect_timeout;

        debug!("Connecting as '{client_id}' (clean start: {clean_start})");
        self.attempt = Some(tokio::spawn(async move {
            match timeout(limit, handshake(connector, client_id, clean_start)).await {
                Ok(result) => result,
                Err(_) => Err(Error::Transport(format!(
                    "no CONNACK within {} ms",
                    limit.as_millis()
                ))),
            }
        }));
    }

    async fn on_attempt(
        &mut self,
        result: std::result::Result<Result<(C::Connection, bool)>, JoinError>,
    ) {
        match result {
            Ok(Ok((link, session_present))) => self.on_connected(link, session_present).await,
            Ok(Err(e)) => {
                let delay = self.controller.attempt_failed();
                warn!("Connect attempt failed: {e}; retrying in {delay:?}");
                self.retry_at = Some(Instant::now() + delay);
            }
            Err(e) => {
                let delay = self.controller.attempt_failed();
                error!("Connect task aborted: {e}; retrying in {delay:?}");
                self.retry_at = Some(Instant::now() + delay);
            }
        }
    }

    async fn on_connected(&mut self, link: C::Connection, session_present: bool) {
        self.controller.connected(Instant::now());
        self.link = Some(link);
        info!(
            "Connected as '{}' (session present: {session_present})",
            self.options.client_id
        );

        if !session_present {
            let forgotten = self.tracker.forget_inbound();
            if forgotten > 0 {
                info!("Broker has no session, forgot {forgotten} inbound records");
            }
        }

        let subscriptions = self.tracker.subscriptions();
        if !subscriptions.is_empty() {
            match self.tracker.allocate_control_id() {
                Ok(packet_id) => {
                    debug!("Restoring {} subscriptions", subscriptions.len());
                    let _ = self
                        .send(Packet::Subscribe {
                            packet_id,
                            subscriptions,
                        })
                        .await;
                }
                Err(e) => warn!("Cannot restore subscriptions: {e}"),
            }
        }

        for packet in self.tracker.replay() {
            if self.send(packet).await.is_err() {
                return;
            }
        }
        self.pump().await;
        self.persist().await;
    }

    async fn link_lost(&mut self, reason: &str) {
        let Some(mut link) = self.link.take() else {
            return;
        };
        let _ = link.close().await;
        self.tracker.release_control_ids();

        let delay = self.controller.link_lost(Instant::now());
        warn!("Connection lost: {reason}; reconnecting in {delay:?}");
        self.retry_at = Some(Instant::now() + delay);
    }

    /// Writes a packet on the current link. A write failure drops the link.
    async fn send(&mut self, packet: Packet) -> Result<()> {
        let Some(link) = self.link.as_mut() else {
            return Err(Error::NotConnected);
        };
        let kind = packet.kind();
        match link.send(packet).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.link_lost(&format!("failed to write {kind}: {e}")).await;
                Err(e)
            }
        }
    }

    async fn on_packet(&mut self, packet: Packet) {
        match packet {
            Packet::Publish(publish) => self.on_publish(publish).await,
            Packet::PubAck { packet_id } => {
                if let Some(packet_id) = self.tracker.on_puback(packet_id) {
                    self.complete_publish(packet_id).await;
                }
            }
            Packet::PubRec { packet_id } => {
                if let Some(release) = self.tracker.on_pubrec(packet_id) {
                    self.persist().await;
                    let _ = self.send(release).await;
                }
            }
            Packet::PubComp { packet_id } => {
                if let Some(packet_id) = self.tracker.on_pubcomp(packet_id) {
                    self.complete_publish(packet_id).await;
                }
            }
            Packet::PubRel { packet_id } => {
                let complete = self.tracker.on_pubrel(packet_id);
                self.persist().await;
                let _ = self.send(complete).await;
            }
            Packet::SubAck { packet_id, granted } => {
                if !self.tracker.release_control_id(packet_id) {
                    warn!("SUBACK for unknown packet {packet_id}, ignoring");
                }
                let refused = granted.iter().filter(|g| g.is_none()).count();
                if refused > 0 {
                    warn!("Broker refused {refused} subscription(s) in packet {packet_id}");
                }
            }
            Packet::UnsubAck { packet_id } => {
                if !self.tracker.release_control_id(packet_id) {
                    warn!("UNSUBACK for unknown packet {packet_id}, ignoring");
                }
            }
            Packet::Disconnect => self.link_lost("broker sent DISCONNECT").await,
            other => warn!(
                "{}",
                Error::ProtocolViolation(format!("unexpected {} from broker", other.kind()))
            ),
        }
    }

    async fn on_publish(&mut self, publish: Publish) {
        if let Err(e) = publish.validate() {
            warn!("Discarding PUBLISH: {e}");
            return;
        }
        if let Err(e) = crate::dispatch::filter::validate_topic_name(&publish.topic) {
            warn!("Discarding PUBLISH: {e}");
            return;
        }

        match self.tracker.on_publish(publish) {
            InboundAction::Deliver(delivery) => self.dispatcher.dispatch(delivery),
            InboundAction::Reply(packet) => {
                let _ = self.send(packet).await;
            }
            InboundAction::Ignore => {}
        }
    }

    async fn on_completion(&mut self, completion: HandlerCompletion) {
        let HandlerCompletion { delivery, outcome } = completion;
        let acknowledge = outcome.should_acknowledge();
        if !acknowledge {
            warn!(
                "{}; withholding acknowledgment",
                Error::HandlerFailure(format!("{outcome:?} on '{}'", delivery.topic))
            );
        }

        let Some(packet_id) = delivery.packet_id else {
            return;
        };
        if let Some(reply) = self.tracker.on_handler_outcome(packet_id, acknowledge) {
            self.persist().await;
            if let Err(e) = self.send(reply).await {
                debug!("Acknowledgment for {packet_id} not sent: {e}");
            }
        }
    }

    async fn on_command(&mut self, command: Command) {
        match command {
            Command::Publish { request, reply } => self.on_publish_request(request, reply).await,
            Command::Subscribe { filter, qos, reply } => {
                let _ = reply.send(self.subscribe(filter, qos).await);
            }
            Command::Unsubscribe { filter, reply } => {
                let _ = reply.send(self.unsubscribe(filter).await);
            }
        }
    }

    async fn on_publish_request(&mut self, request: PublishRequest, reply: PublishReply) {
        if !request.qos.is_tracked() {
            let packet = Packet::Publish(Publish {
                topic: request.topic,
                payload: request.payload,
                qos: QoS::AtMostOnce,
                packet_id: None,
                dup: false,
            });
            let result = self.send(packet).await.map(|()| Submission::completed());
            let _ = reply.send(result);
            return;
        }

        let admitted = self.tracker.outbound_len();
        match self.flow.admit(admitted, (request, reply)) {
            Some((request, reply)) => {
                self.accept_publish(request, reply).await;
                self.pump().await;
            }
            None => debug!(
                "In-flight window full, {} publish(es) waiting",
                self.flow.waiting()
            ),
        }
    }

    /// Appends the publish to the outbound queue and persists it before the
    /// caller gets its `Submission`.
    async fn accept_publish(&mut self, request: PublishRequest, reply: PublishReply) {
        let PublishRequest {
            topic,
            payload,
            qos,
        } = request;
        match self.tracker.enqueue(topic, payload, qos) {
            Ok(packet_id) => {
                self.persist().await;
                let (submission, done) = Submission::pending(packet_id);
                self.acks.insert(packet_id, done);
                if reply.send(Ok(submission)).is_err() {
                    debug!("Publisher of packet {packet_id} stopped waiting");
                }
            }
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    async fn complete_publish(&mut self, packet_id: u16) {
        if let Some(done) = self.acks.remove(&packet_id) {
            let _ = done.send(Ok(()));
        }
        self.persist().await;

        let admitted = self.tracker.outbound_len();
        for (request, reply) in self.flow.release(admitted) {
            if reply.is_closed() {
                debug!("Dropping publish to '{}', caller went away", request.topic);
                continue;
            }
            self.accept_publish(request, reply).await;
        }
        self.pump().await;
    }

    /// Transmits queued publishes while the window has room.
    async fn pump(&mut self) {
        if self.link.is_none() {
            return;
        }
        let packets = self.tracker.transmit_queued(self.options.max_inflight);
        if packets.is_empty() {
            return;
        }
        for packet in packets {
            if self.send(packet).await.is_err() {
                break;
            }
        }
        self.persist().await;
    }

    async fn subscribe(&mut self, filter: TopicFilter, qos: QoS) -> Result<()> {
        let changed = self
            .tracker
            .with_session(|session| session.add_subscription(filter.clone(), qos));
        if changed {
            self.persist().await;
        }
        if self.link.is_none() {
            debug!("Subscription to '{}' recorded, sent on connect", filter.as_str());
            return Ok(());
        }

        let packet_id = self.tracker.allocate_control_id()?;
        let subscription = TopicSubscription {
            filter: filter.as_str().to_string(),
            qos,
        };
        info!("Subscribing to '{}' at QoS {}", filter.as_str(), u8::from(qos));
        self.send(Packet::Subscribe {
            packet_id,
            subscriptions: vec![subscription],
        })
        .await
    }

    async fn unsubscribe(&mut self, filter: TopicFilter) -> Result<()> {
        let removed = self
            .tracker
            .with_session(|session| session.remove_subscription(&filter));
        if removed {
            self.persist().await;
        }
        if self.link.is_none() {
            return Ok(());
        }

        let packet_id = self.tracker.allocate_control_id()?;
        self.send(Packet::Unsubscribe {
            packet_id,
            filters: vec![filter.as_str().to_string()],
        })
        .await
    }

    /// Writes the session to storage on the blocking pool. The engine waits
    /// for the write, so nothing is acknowledged before it is durable, but
    /// the runtime keeps serving handler lanes and other clients meanwhile.
    /// Failures schedule a retry with backoff and the client keeps running
    /// from memory.
    async fn persist(&mut self) {
        let snapshot = self.tracker.snapshot();
        let store = self.store.clone();
        let written = task::spawn_blocking(move || store.persist(&snapshot))
            .await
            .unwrap_or_else(|e| {
                Err(Error::StorageUnavailable(format!("write task failed: {e}")))
            });
        match written {
            Ok(()) => {
                if self.persist_retry_at.take().is_some() {
                    info!("Session storage available again");
                }
                self.persist_backoff.reset();
            }
            Err(e) => {
                let delay = self.persist_backoff.next_delay();
                warn!("Could not persist session: {e}; retrying in {delay:?}");
                self.persist_retry_at = Some(Instant::now() + delay);
            }
        }
    }

    async fn finish(&mut self) {
        info!("Client '{}' shutting down", self.options.client_id);
        if let Some(attempt) = self.attempt.take() {
            attempt.abort();
        }
        self.retry_at = None;

        if let Some(mut link) = self.link.take() {
            let _ = link.send(Packet::Disconnect).await;
            let _ = link.close().await;
        }
        self.dispatcher.close();

        for (_, reply) in self.flow.drain() {
            let _ = reply.send(Err(Error::Shutdown));
        }
        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            command.reject(Error::Shutdown);
        }
        // dropping the senders resolves outstanding submissions with Shutdown
        self.acks.clear();

        self.persist().await;
        self.persist_retry_at = None;
        let unacknowledged = self.tracker.outbound_len();
        if unacknowledged > 0 {
            info!("{unacknowledged} unacknowledged publish(es) kept for the next start");
        }

        self.controller.shutdown();
        self.stopped.send_replace(true);
    }
}

async fn handshake<C: Connector>(
    connector: Arc<C>,
    client_id: ClientIdentity,
    clean_start: bool,
) -> Result<(C::Connection, bool)> {
    let mut link = connector.open().await?;
    link.send(Packet::Connect {
        client_id: client_id.to_string(),
        clean_start,
    })
    .await?;

    match link.recv().await? {
        Some(Packet::ConnAck { session_present }) => Ok((link, session_present)),
        Some(other) => Err(Error::ProtocolViolation(format!(
            "expected CONNACK, got {}",
            other.kind()
        ))),
        None => Err(Error::Transport(
            "connection closed before CONNACK".to_string(),
        )),
    }
}

async fn next_packet<T: Connection>(link: &mut Option<T>) -> Result<Option<Packet>> {
    match link {
        Some(link) => link.recv().await,
        None => pending().await,
    }
}

async fn wait_attempt<T>(attempt: &mut Option<JoinHandle<T>>) -> std::result::Result<T, JoinError> {
    match attempt {
        Some(handle) => handle.await,
        None => pending().await,
    }
}

async fn sleep_until_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => pending().await,
    }
}
