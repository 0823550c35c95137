//! Redis backbone for deployments with several server processes.
//!
//! ```text
//!  Backbone calls ──▶ command queue ──▶ supervisor task ──▶ PUBLISH / SET / GET / DEL
//!                                            │
//!  Subscription ◀── per-channel mpsc ◀───────┴──── pub/sub connection
//! ```
//!
//! The supervisor owns both Redis connections. When either drops, every
//! local subscription is closed and the backbone reports `Unavailable`
//! until the supervisor reconnects; rooms resubscribe on their next tick.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use ::redis::aio::{MultiplexedConnection, PubSubSink, PubSubStream};
use ::redis::{AsyncCommands, RedisResult};
use futures_util::future::{BoxFuture, FutureExt};
use futures_util::StreamExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};

use super::{Backbone, BackboneMessage, Subscription, SUBSCRIPTION_CAPACITY};
use crate::error::BackboneError;

/// Commands buffered for the supervisor before calls fail with `Backlogged`.
const COMMAND_CAPACITY: usize = 4096;
const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(10);

type SubscriberMap = HashMap<String, mpsc::Sender<Arc<Vec<u8>>>>;

#[derive(Debug)]
enum Command {
    Subscribe(String),
    Unsubscribe(String),
    Publish {
        channel: String,
        payload: Vec<u8>,
    },
    Set {
        key: String,
        value: String,
    },
    Get {
        key: String,
        reply: oneshot::Sender<Result<Option<String>, BackboneError>>,
    },
    Delete {
        key: String,
        reply: oneshot::Sender<Result<bool, BackboneError>>,
    },
}

impl Command {
    /// Answer a command that cannot reach Redis.
    fn reject(self) {
        match self {
            Command::Get { reply, .. } => {
                let _ = reply.send(Err(BackboneError::Unavailable));
            }
            Command::Delete { reply, .. } => {
                let _ = reply.send(Err(BackboneError::Unavailable));
            }
            _ => {}
        }
    }
}

#[derive(Debug)]
struct Shared {
    subscribers: Mutex<SubscriberMap>,
    available: watch::Sender<bool>,
}

impl Shared {
    fn subscribers(&self) -> MutexGuard<'_, SubscriberMap> {
        self.subscribers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn is_available(&self) -> bool {
        *self.available.borrow()
    }

    fn mark_available(&self) {
        self.available.send_replace(true);
        log::info!("Redis backbone connected");
    }

    /// Close every local subscription.
    fn mark_lost(&self) {
        let was_available = self.available.send_replace(false);
        self.subscribers().clear();
        if was_available {
            log::warn!("Redis backbone unavailable, subscriptions closed");
        }
    }

    fn deliver(&self, channel: &str, payload: &[u8]) {
        let mut subscribers = self.subscribers();
        let Some(sender) = subscribers.get(channel) else {
            return;
        };
        match sender.try_send(Arc::new(payload.to_vec())) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                log::warn!("Subscription to {} lagging, message dropped", channel);
            }
            Err(TrySendError::Closed(_)) => {
                subscribers.remove(channel);
            }
        }
    }
}

/// Backbone backed by a Redis server.
///
/// One instance per process; clones share the same connections.
#[derive(Debug, Clone)]
pub struct RedisBackbone {
    commands: mpsc::Sender<Command>,
    shared: Arc<Shared>,
}

impl RedisBackbone {
    /// Validate `url` and start the connection supervisor.
    ///
    /// Returns immediately; calls fail with `Unavailable` until the first
    /// connection succeeds. Must be called inside a tokio runtime.
    pub fn open(url: &str) -> Result<Self, BackboneError> {
        let client = ::redis::Client::open(url).map_err(|e| BackboneError::Service(e.to_string()))?;
        let (available, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            subscribers: Mutex::new(HashMap::new()),
            available,
        });
        let (commands, queue) = mpsc::channel(COMMAND_CAPACITY);
        tokio::spawn(supervise(client, shared.clone(), queue));
        Ok(Self { commands, shared })
    }

    /// [`RedisBackbone::open`], then wait up to `wait` for the first connection.
    ///
    /// An unreachable server is not an error: rooms keep serving local
    /// clients and pick up the backbone once it connects.
    pub async fn connect(url: &str, wait: Duration) -> Result<Self, BackboneError> {
        let backbone = Self::open(url)?;
        let mut available = backbone.shared.available.subscribe();
        let connected = tokio::time::timeout(wait, available.wait_for(|up| *up))
            .await
            .map(|result| result.is_ok())
            .unwrap_or(false);
        if !connected {
            log::warn!("Redis backbone not reachable within {:?}, retrying in the background", wait);
        }
        Ok(backbone)
    }

    pub fn is_available(&self) -> bool {
        self.shared.is_available()
    }

    fn check_available(&self) -> Result<(), BackboneError> {
        if self.shared.is_available() {
            Ok(())
        } else {
            Err(BackboneError::Unavailable)
        }
    }

    fn send(&self, command: Command) -> Result<(), BackboneError> {
        self.commands.try_send(command).map_err(|e| match e {
            TrySendError::Full(_) => BackboneError::Backlogged,
            TrySendError::Closed(_) => BackboneError::Unavailable,
        })
    }
}

impl Backbone for RedisBackbone {
    fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
        self.check_available()?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.send(Command::Subscribe(channel.to_string()))?;
        self.shared.subscribers().insert(channel.to_string(), sender);
        log::debug!("Subscribed to {} on Redis", channel);
        Ok(Subscription::new(channel.to_string(), receiver))
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError> {
        if self.shared.subscribers().remove(channel).is_none() {
            return Err(BackboneError::NotSubscribed(channel.to_string()));
        }
        // A lost connection already dropped the server-side subscription.
        if self.shared.is_available() {
            self.send(Command::Unsubscribe(channel.to_string()))?;
        }
        Ok(())
    }

    fn publish(&self, channel: &str, message: &BackboneMessage) -> Result<usize, BackboneError> {
        self.check_available()?;
        self.send(Command::Publish {
            channel: channel.to_string(),
            payload: message.encode()?,
        })?;
        Ok(0)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackboneError> {
        self.check_available()?;
        self.send(Command::Set {
            key: key.to_string(),
            value: value.to_string(),
        })
    }

    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>, BackboneError>> {
        let (reply, response) = oneshot::channel();
        let queued = self.check_available().and_then(|()| {
            self.send(Command::Get {
                key: key.to_string(),
                reply,
            })
        });
        async move {
            queued?;
            response.await.map_err(|_| BackboneError::Unavailable)?
        }
        .boxed()
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<bool, BackboneError>> {
        let (reply, response) = oneshot::channel();
        let queued = self.check_available().and_then(|()| {
            self.send(Command::Delete {
                key: key.to_string(),
                reply,
            })
        });
        async move {
            queued?;
            response.await.map_err(|_| BackboneError::Unavailable)?
        }
        .boxed()
    }
}

enum SessionEnd {
    /// Every `RedisBackbone` handle was dropped
    Shutdown,
    Lost(String),
}

/// Connect, serve commands until the connection drops, back off, repeat.
async fn supervise(client: ::redis::Client, shared: Arc<Shared>, mut commands: mpsc::Receiver<Command>) {
    let mut backoff = RECONNECT_MIN;
    loop {
        match Session::open(&client).await {
            Ok(session) => {
                backoff = RECONNECT_MIN;
                shared.mark_available();
                match session.run(&shared, &mut commands).await {
                    SessionEnd::Shutdown => {
                        shared.mark_lost();
                        log::debug!("Redis backbone supervisor stopped");
                        return;
                    }
                    SessionEnd::Lost(reason) => log::warn!("Redis backbone connection lost: {}", reason),
                }
            }
            Err(e) => log::warn!("Cannot connect to Redis backbone: {}", e),
        }
        shared.mark_lost();

        let retry = tokio::time::sleep(backoff);
        tokio::pin!(retry);
        loop {
            tokio::select! {
                _ = &mut retry => break,
                command = commands.recv() => match command {
                    Some(command) => command.reject(),
                    None => return,
                },
            }
        }
        backoff = (backoff * 2).min(RECONNECT_MAX);
    }
}

struct Session {
    connection: MultiplexedConnection,
    sink: PubSubSink,
    stream: PubSubStream,
}

impl Session {
    async fn open(client: &::redis::Client) -> RedisResult<Self> {
        let connection = client.get_multiplexed_async_connection().await?;
        let (sink, stream) = client.get_async_pubsub().await?.split();
        Ok(Self {
            connection,
            sink,
            stream,
        })
    }

    async fn run(mut self, shared: &Shared, commands: &mut mpsc::Receiver<Command>) -> SessionEnd {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        return SessionEnd::Shutdown;
                    };
                    if let Err(e) = self.execute(command).await {
                        if e.is_connection_dropped() || e.is_io_error() {
                            return SessionEnd::Lost(e.to_string());
                        }
                        log::warn!("Redis backbone command failed: {}", e);
                    }
                }
                message = self.stream.next() => match message {
                    Some(message) => shared.deliver(message.get_channel_name(), message.get_payload_bytes()),
                    None => return SessionEnd::Lost("pub/sub stream closed".to_string()),
                },
            }
        }
    }

    async fn execute(&mut self, command: Command) -> RedisResult<()> {
        match command {
            Command::Subscribe(channel) => self.sink.subscribe(channel.as_str()).await,
            Command::Unsubscribe(channel) => self.sink.unsubscribe(channel.as_str()).await,
            Command::Publish { channel, payload } => {
                log::trace!("PUBLISH {} ({} bytes)", channel, payload.len());
                self.connection
                    .publish::<_, _, i64>(channel.as_str(), payload)
                    .await
                    .map(drop)
            }
            Command::Set { key, value } => {
                self.connection
                    .set::<_, _, ()>(key.as_str(), value.as_str())
                    .await
            }
            Command::Get { key, reply } => {
                let result = self.connection.get::<_, Option<String>>(key.as_str()).await;
                let _ = reply.send(result.as_ref().cloned().map_err(service_error));
                result.map(drop)
            }
            Command::Delete { key, reply } => {
                let result = self.connection.del::<_, i64>(key.as_str()).await;
                let _ = reply.send(result.as_ref().map(|removed| *removed > 0).map_err(service_error));
                result.map(drop)
            }
        }
    }
}

fn service_error(e: &::redis::RedisError) -> BackboneError {
    BackboneError::Service(e.to_string())
}
