use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::debug;

use super::ClientOptions;
use super::engine::{Engine, EngineParts};
use super::reconnect::{ConnectionState, ReconnectController};
use crate::delivery::DeliveryTracker;
use crate::dispatch::filter::validate_topic_name;
use crate::dispatch::{Dispatcher, HandlerId, HandlerRegistry, HandlerResult, SharedRegistry, TopicFilter};
use crate::publisher::{PublishRequest, Submission};
use crate::session::{ClientIdentity, SessionStore};
use crate::transport::{Connector, QoS};
use crate::utils::error::{Error, Result};

pub(crate) enum Command {
    Publish {
        request: PublishRequest,
        reply: oneshot::Sender<Result<Submission>>,
    },
    Subscribe {
        filter: TopicFilter,
        qos: QoS,
        reply: oneshot::Sender<Result<()>>,
    },
    Unsubscribe {
        filter: TopicFilter,
        reply: oneshot::Sender<Result<()>>,
    },
}

impl Command {
    pub(crate) fn reject(self, error: Error) {
        match self {
            Command::Publish { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            Command::Subscribe { reply, .. } | Command::Unsubscribe { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

/// Cloneable access to a running client.
#[derive(Clone)]
pub struct ClientHandle {
    client_id: ClientIdentity,
    commands: UnboundedSender<Command>,
    registry: SharedRegistry,
    state: watch::Receiver<ConnectionState>,
    shutdown: Arc<watch::Sender<bool>>,
    stopped: watch::Receiver<bool>,
}

impl std::fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientHandle")
            .field("client_id", &self.client_id)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl ClientHandle {
    pub fn client_id(&self) -> &ClientIdentity {
        &self.client_id
    }

    /// Registers `handler` for messages whose topic matches `filter`. A
    /// shared filter matches on the part after its group name.
    pub fn register_handler<F>(&self, filter: &str, handler: F) -> Result<HandlerId>
    where
        F: Fn(&str, &[u8], QoS) -> HandlerResult + Send + Sync + 'static,
    {
        let filter = TopicFilter::parse(filter)?;
        let mut registry = match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(registry.register(filter, Arc::new(handler)))
    }

    /// Stops future invocations of a handler. Returns false for unknown ids.
    pub fn remove_handler(&self, id: HandlerId) -> bool {
        let mut registry = match self.registry.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        registry.remove(id)
    }

    /// Records the subscription in the session and sends it when connected.
    /// It is restored on every reconnect.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> Result<()> {
        let filter = TopicFilter::parse(filter)?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Subscribe { filter, qos, reply })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub async fn unsubscribe(&self, filter: &str) -> Result<()> {
        let filter = TopicFilter::parse(filter)?;
        let (reply, rx) = oneshot::channel();
        self.request(Command::Unsubscribe { filter, reply })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    /// Publishes a message. QoS 1 and 2 publishes are persisted before this
    /// returns and survive reconnects and restarts until acknowledged.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Vec<u8>>,
        qos: QoS,
    ) -> Result<Submission> {
        let topic = topic.into();
        validate_topic_name(&topic)?;

        let request = PublishRequest {
            topic,
            payload: payload.into(),
            qos,
        };
        let (reply, rx) = oneshot::channel();
        self.request(Command::Publish { request, reply })?;
        rx.await.map_err(|_| Error::Shutdown)?
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub async fn wait_for_state(&self, target: ConnectionState) -> Result<()> {
        let mut state = self.state.clone();
        state
            .wait_for(|current| *current == target)
            .await
            .map(|_| ())
            .map_err(|_| Error::Shutdown)
    }

    /// Stops the client and waits until the session has been persisted.
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);
        let mut stopped = self.stopped.clone();
        let _ = stopped.wait_for(|done| *done).await;
    }

    fn request(&self, command: Command) -> Result<()> {
        self.commands.send(command).map_err(|_| Error::Shutdown)
    }
}

/// A running client: the engine task plus a handle to it.
#[derive(Debug)]
pub struct Client {
    handle: ClientHandle,
    task: JoinHandle<()>,
}

impl Client {
    /// Restores the session for `options.client_id` from `store` and starts
    /// connecting through `connector`. Must be called inside a tokio runtime.
    pub fn start<C: Connector>(options: ClientOptions, connector: C, store: SessionStore) -> Self {
        let mut session = store.restore(&options.client_id, options.clean_start);
        let dropped = session.drop_unfinished_inbound();
        if dropped > 0 {
            debug!("Dropped {dropped} inbound message(s) whose handler never finished");
        }

        let registry: SharedRegistry = Arc::new(std::sync::RwLock::new(HandlerRegistry::default()));
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (stopped_tx, stopped_rx) = watch::channel(false);
        let (controller, state) =
            ReconnectController::new(options.clean_start, options.reconnect, options.stable_grace);

        let handle = ClientHandle {
            client_id: options.client_id.clone(),
            commands: commands_tx,
            registry: Arc::clone(&registry),
            state,
            shutdown: Arc::new(shutdown_tx),
            stopped: stopped_rx,
        };

        let engine = Engine::new(EngineParts {
            options,
            connector,
            store,
            tracker: DeliveryTracker::new(session.into_shared()),
            dispatcher: Dispatcher::new(registry),
            commands: commands_rx,
            shutdown: shutdown_rx,
            stopped: stopped_tx,
            controller,
        });
        let task = tokio::spawn(engine.run());

        Self { handle, task }
    }

    pub fn handle(&self) -> &ClientHandle {
        &self.handle
    }

    pub async fn shutdown(self) {
        self.handle.shutdown().await;
        if let Err(e) = self.task.await {
            tracing::error!("Client engine task failed: {e}");
        }
    }
}
