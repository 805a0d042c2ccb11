//! Handler registry keyed by (message type, pattern)

use std::fmt;
use std::sync::Arc;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::MessageHandler;
use crate::message::{Message, MessagePattern, TenantId};

/// Handle returned by `subscribe`, used to unsubscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionId(Uuid);

impl SubscriptionId {
    fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error type for registry operations
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    /// Command and request-response types take exactly one handler
    #[error("a {pattern} handler is already registered for {message_type}")]
    DuplicateHandler {
        message_type: String,
        pattern: MessagePattern,
    },
}

/// Optional subscription settings
#[derive(Debug, Clone, Default)]
pub struct SubscribeOptions {
    /// Name recorded on dead letters; defaults to the subscription id
    pub name: Option<String>,
    /// Deliver only this tenant's messages
    pub tenant: Option<TenantId>,
}

impl SubscribeOptions {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            tenant: None,
        }
    }

    pub fn for_tenant(mut self, tenant: impl Into<TenantId>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }
}

/// A handler resolved for one delivery
#[derive(Clone)]
pub struct Subscription {
    pub id: SubscriptionId,
    pub name: String,
    pub tenant: Option<TenantId>,
    pub handler: Arc<dyn MessageHandler>,
}

impl Subscription {
    fn accepts(&self, tenant: &TenantId) -> bool {
        self.tenant.as_ref().map_or(true, |t| t == tenant)
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("tenant", &self.tenant)
            .finish_non_exhaustive()
    }
}

type RouteKey = (String, MessagePattern);

/// Concurrent map from (type, pattern) to subscribers
///
/// Registration and removal for one key are serialized by the map's
/// shard lock; lookups of different keys do not contend.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: DashMap<RouteKey, Vec<Subscription>>,
    index: DashMap<SubscriptionId, RouteKey>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        message_type: &str,
        pattern: MessagePattern,
        handler: Arc<dyn MessageHandler>,
        options: SubscribeOptions,
    ) -> Result<SubscriptionId, RegistryError> {
        let key = (message_type.to_string(), pattern);
        let id = SubscriptionId::new();

        let mut entry = self.routes.entry(key.clone()).or_default();
        if !pattern.allows_fan_out() && !entry.is_empty() {
            return Err(RegistryError::DuplicateHandler {
                message_type: message_type.to_string(),
                pattern,
            });
        }

        entry.push(Subscription {
            id,
            name: options.name.unwrap_or_else(|| id.to_string()),
            tenant: options.tenant,
            handler,
        });
        drop(entry);

        self.index.insert(id, key);
        Ok(id)
    }

    /// Remove a subscription; returns false if it was not registered
    pub fn unregister(&self, id: SubscriptionId) -> bool {
        let Some((_, key)) = self.index.remove(&id) else {
            return false;
        };

        let removed = self
            .routes
            .get_mut(&key)
            .map(|mut subs| {
                let before = subs.len();
                subs.retain(|s| s.id != id);
                subs.len() != before
            })
            .unwrap_or(false);
        self.routes.remove_if(&key, |_, subs| subs.is_empty());
        removed
    }

    /// Handlers that should receive `message`, in registration order
    pub fn handlers_for(&self, message: &Message) -> Vec<Subscription> {
        self.routes
            .get(&(message.message_type.clone(), message.pattern))
            .map(|subs| {
                subs.iter()
                    .filter(|s| s.accepts(&message.tenant_id))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn has_handler(&self, message_type: &str, pattern: MessagePattern, tenant: &TenantId) -> bool {
        self.routes
            .get(&(message_type.to_string(), pattern))
            .is_some_and(|subs| subs.iter().any(|s| s.accepts(tenant)))
    }

    /// Total number of subscriptions
    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}
