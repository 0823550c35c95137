//! In-process backbone: every endpoint of one [`LocalHub`] sees the others.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures_util::future::{self, BoxFuture, FutureExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use super::{Backbone, BackboneMessage, Subscription, SUBSCRIPTION_CAPACITY};
use crate::error::BackboneError;

type ChannelMap = HashMap<String, HashMap<Uuid, mpsc::Sender<Arc<Vec<u8>>>>>;

#[derive(Debug, Default)]
struct HubInner {
    channels: Mutex<ChannelMap>,
    kv: Mutex<HashMap<String, String>>,
    unavailable: AtomicBool,
}

impl HubInner {
    fn channels(&self) -> MutexGuard<'_, ChannelMap> {
        self.channels.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn kv(&self) -> MutexGuard<'_, HashMap<String, String>> {
        self.kv.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_available(&self) -> Result<(), BackboneError> {
        if self.unavailable.load(Ordering::Acquire) {
            Err(BackboneError::Unavailable)
        } else {
            Ok(())
        }
    }
}

/// In-process backbone shared by every instance of one process (or test).
#[derive(Debug, Clone, Default)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New endpoint, one per server instance.
    pub fn endpoint(&self) -> LocalBackbone {
        LocalBackbone {
            hub: self.inner.clone(),
            endpoint: Uuid::new_v4(),
        }
    }

    /// Simulate losing or regaining the service.
    ///
    /// Going unavailable closes every open subscription.
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Release);
        if !available {
            self.inner.channels().clear();
            log::warn!("Local backbone hub marked unavailable");
        } else {
            log::info!("Local backbone hub available");
        }
    }

    pub fn is_available(&self) -> bool {
        !self.inner.unavailable.load(Ordering::Acquire)
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.inner.channels().get(channel).map_or(0, |subs| subs.len())
    }
}

/// One instance's view of a [`LocalHub`].
#[derive(Debug, Clone)]
pub struct LocalBackbone {
    hub: Arc<HubInner>,
    endpoint: Uuid,
}

impl Backbone for LocalBackbone {
    fn subscribe(&self, channel: &str) -> Result<Subscription, BackboneError> {
        self.hub.check_available()?;
        let (sender, receiver) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        self.hub
            .channels()
            .entry(channel.to_string())
            .or_default()
            .insert(self.endpoint, sender);
        log::debug!("Endpoint {} subscribed to {}", self.endpoint, channel);
        Ok(Subscription::new(channel.to_string(), receiver))
    }

    fn unsubscribe(&self, channel: &str) -> Result<(), BackboneError> {
        let mut channels = self.hub.channels();
        let subscribers = channels
            .get_mut(channel)
            .ok_or_else(|| BackboneError::NotSubscribed(channel.to_string()))?;
        if subscribers.remove(&self.endpoint).is_none() {
            return Err(BackboneError::NotSubscribed(channel.to_string()));
        }
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        Ok(())
    }

    fn publish(&self, channel: &str, message: &BackboneMessage) -> Result<usize, BackboneError> {
        self.hub.check_available()?;
        let bytes = Arc::new(message.encode()?);

        let mut channels = self.hub.channels();
        let Some(subscribers) = channels.get_mut(channel) else {
            return Ok(0);
        };

        let mut delivered = 0;
        subscribers.retain(|endpoint, sender| match sender.try_send(bytes.clone()) {
            Ok(()) => {
                delivered += 1;
                true
            }
            Err(mpsc::error::TrySendError::Full(_)) => {
                log::warn!("Subscriber {} lagging on {}, message dropped", endpoint, channel);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
        if subscribers.is_empty() {
            channels.remove(channel);
        }
        Ok(delivered)
    }

    fn set(&self, key: &str, value: &str) -> Result<(), BackboneError> {
        self.hub.check_available()?;
        self.hub.kv().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn get(&self, key: &str) -> BoxFuture<'static, Result<Option<String>, BackboneError>> {
        let value = self.hub.check_available().map(|()| self.hub.kv().get(key).cloned());
        future::ready(value).boxed()
    }

    fn delete(&self, key: &str) -> BoxFuture<'static, Result<bool, BackboneError>> {
        let existed = self.hub.check_available().map(|()| self.hub.kv().remove(key).is_some());
        future::ready(existed).boxed()
    }
}
