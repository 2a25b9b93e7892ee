//! Dispatcher engine
//!
//! Inbound messages that passed the delivery tracker are handed to every
//! local handler whose filter matches the topic. Each topic gets its own
//! lane: a task draining a FIFO queue, so handlers for one topic run in
//! broker delivery order while a slow handler on one topic never holds up
//! another. The outcome of every delivery is reported back to the client
//! engine over the completion channel; the engine decides whether to
//! acknowledge.
//!
//! Handlers are plain synchronous callbacks. They run on tokio's blocking
//! pool, so a slow handler never stalls the runtime that drives the link.
//! A lane with nothing to do for [`LANE_IDLE_TIMEOUT`] retires and leaves
//! the lane map; the next message for its topic opens a fresh one.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::{task, time};
use tracing::{debug, error, warn};

use super::filter::TopicFilter;
use crate::transport::QoS;

pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;
pub type HandlerResult = Result<(), HandlerError>;
pub type Handler = Arc<dyn Fn(&str, &[u8], QoS) -> HandlerResult + Send + Sync>;
pub type SharedRegistry = Arc<RwLock<HandlerRegistry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// A message ready for the application.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub packet_id: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// Every matching handler succeeded.
    Handled { handlers: usize },
    /// No handler matched; the message is dropped.
    Unmatched,
    /// At least one handler failed or panicked.
    Failed { handlers: usize, failures: usize },
}

impl DispatchOutcome {
    /// Unmatched messages are acknowledged too, otherwise the broker would
    /// redeliver them forever.
    pub fn should_acknowledge(&self) -> bool {
        !matches!(self, DispatchOutcome::Failed { .. })
    }
}

#[derive(Debug)]
pub struct HandlerCompletion {
    pub delivery: Delivery,
    pub outcome: DispatchOutcome,
}

struct Registered {
    id: HandlerId,
    filter: TopicFilter,
    handler: Handler,
}

#[derive(Default)]
pub struct HandlerRegistry {
    next_id: u64,
    entries: Vec<Registered>,
}

impl HandlerRegistry {
    pub fn register(&mut self, filter: TopicFilter, handler: Handler) -> HandlerId {
        self.next_id += 1;
        let id = HandlerId(self.next_id);
        debug!("Registered handler {:?} for {}", id, filter);
        self.entries.push(Registered {
            id,
            filter,
            handler,
        });
        id
    }

    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        before != self.entries.len()
    }

    /// Handlers whose filter matches `topic`, in registration order.
    pub fn matching(&self, topic: &str) -> Vec<Handler> {
        self.entries
            .iter()
            .filter(|entry| entry.filter.matches(topic))
            .map(|entry| Arc::clone(&entry.handler))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("handlers", &self.entries.len())
            .finish()
    }
}

/// Runs every matching handler for one delivery, in registration order.
pub fn invoke(registry: &RwLock<HandlerRegistry>, delivery: &Delivery) -> DispatchOutcome {
    let handlers = match registry.read() {
        Ok(guard) => guard.matching(&delivery.topic),
        Err(poisoned) => poisoned.into_inner().matching(&delivery.topic),
    };

    if handlers.is_empty() {
        warn!("No handler matches topic '{}', dropping message", delivery.topic);
        return DispatchOutcome::Unmatched;
    }

    let mut failures = 0;
    for handler in &handlers {
        let result = catch_unwind(AssertUnwindSafe(|| {
            handler(&delivery.topic, &delivery.payload, delivery.qos)
        }));
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                warn!("Handler failed for topic '{}': {}", delivery.topic, e);
                failures += 1;
            }
            Err(_) => {
                error!("Handler panicked for topic '{}'", delivery.topic);
                failures += 1;
            }
        }
    }

    if failures == 0 {
        DispatchOutcome::Handled {
            handlers: handlers.len(),
        }
    } else {
        DispatchOutcome::Failed {
            handlers: handlers.len(),
            failures,
        }
    }
}

/// How long an idle lane waits for another message before it retires.
pub const LANE_IDLE_TIMEOUT: Duration = Duration::from_secs(30);

struct Lane {
    id: u64,
    tx: UnboundedSender<Delivery>,
}

type LaneMap = Mutex<HashMap<String, Lane>>;

fn lock_lanes(lanes: &LaneMap) -> MutexGuard<'_, HashMap<String, Lane>> {
    lanes.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct Dispatcher {
    registry: SharedRegistry,
    lanes: Arc<LaneMap>,
    next_lane: u64,
    idle_timeout: Duration,
    completions: UnboundedSender<HandlerCompletion>,
}

impl Dispatcher {
    pub fn new(registry: SharedRegistry) -> (Self, UnboundedReceiver<HandlerCompletion>) {
        Self::with_idle_timeout(registry, LANE_IDLE_TIMEOUT)
    }

    pub fn with_idle_timeout(
        registry: SharedRegistry,
        idle_timeout: Duration,
    ) -> (Self, UnboundedReceiver<HandlerCompletion>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let dispatcher = Self {
            registry,
            lanes: Arc::new(Mutex::new(HashMap::new())),
            next_lane: 0,
            idle_timeout,
            completions: tx,
        };
        (dispatcher, rx)
    }

    /// Queues `delivery` on its topic's lane. Never waits for handlers.
    ///
    /// The lane map stays locked while sending, so a retiring lane either
    /// sees this delivery or has already left the map.
    pub fn dispatch(&mut self, delivery: Delivery) {
        let map = Arc::clone(&self.lanes);
        let mut lanes = lock_lanes(&map);
        let delivery = match lanes.get(&delivery.topic) {
            Some(lane) => match lane.tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => {
                    lanes.remove(&returned.topic);
                    returned
                }
            },
            None => delivery,
        };

        let topic = delivery.topic.clone();
        let lane = self.spawn_lane(topic.clone());
        if let Err(mpsc::error::SendError(lost)) = lane.tx.send(delivery) {
            error!("Lane for topic '{}' rejected a message", lost.topic);
            return;
        }
        lanes.insert(topic, lane);
    }

    /// Lanes currently open. Idle lanes drop out after the idle timeout.
    pub fn lane_count(&self) -> usize {
        lock_lanes(&self.lanes).len()
    }

    /// Stops all lanes once their queued deliveries are drained.
    pub fn close(&mut self) {
        lock_lanes(&self.lanes).clear();
    }

    fn spawn_lane(&mut self, topic: String) -> Lane {
        self.next_lane += 1;
        let id = self.next_lane;
        let (tx, mut rx) = mpsc::unbounded_channel::<Delivery>();
        let registry = Arc::clone(&self.registry);
        let completions = self.completions.clone();
        let lanes = Arc::clone(&self.lanes);
        let idle_timeout = self.idle_timeout;

        debug!("Opening dispatch lane for topic '{}'", topic);
        tokio::spawn(async move {
            loop {
                let next = match time::timeout(idle_timeout, rx.recv()).await {
                    Ok(next) => next,
                    Err(_) => retire(&lanes, &topic, id, &mut rx),
                };
                let Some(delivery) = next else {
                    break;
                };

                // Handlers are synchronous and may block.
                let registry = Arc::clone(&registry);
                let handled = task::spawn_blocking(move || {
                    let outcome = invoke(&registry, &delivery);
                    HandlerCompletion { delivery, outcome }
                })
                .await;
                let completion = match handled {
                    Ok(completion) => completion,
                    Err(e) => {
                        error!("Handler task for topic '{}' did not finish: {}", topic, e);
                        break;
                    }
                };
                if completions.send(completion).is_err() {
                    break;
                }
            }
            debug!("Closed dispatch lane for topic '{}'", topic);
        });

        Lane { id, tx }
    }
}

/// Removes an idle lane from the map unless a delivery arrived meanwhile,
/// in which case that delivery is returned and the lane keeps running.
fn retire(
    lanes: &LaneMap,
    topic: &str,
    id: u64,
    rx: &mut UnboundedReceiver<Delivery>,
) -> Option<Delivery> {
    let mut lanes = lock_lanes(lanes);
    if let Ok(delivery) = rx.try_recv() {
        return Some(delivery);
    }
    if lanes.get(topic).is_some_and(|lane| lane.id == id) {
        lanes.remove(topic);
    }
    None
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("lanes", &self.lane_count())
            .finish()
    }
}
