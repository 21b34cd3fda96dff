//! Mediated access to resources several agents need at once
//!
//! Every resource sits behind its own async `RwLock`: shared leases are read
//! guards, exclusive leases are write guards. State changes go out on a
//! broadcast channel so agents can react to each other's output.

use crate::error::{OrchestratorError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::{debug, warn};

const EVENT_CAPACITY: usize = 256;

/// How a lease may use its resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessMode {
    /// Any number of concurrent readers
    Shared,
    /// A single holder that may publish
    Exclusive,
}

/// A named piece of shared state
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: String,
    pub resource_type: String,
    pub data: Value,
    /// Bumped on every publish
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Change notification for subscribers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum EnvironmentEvent {
    Registered {
        resource_id: String,
        resource_type: String,
    },
    Acquired {
        resource_id: String,
        holder: String,
        mode: AccessMode,
    },
    Released {
        resource_id: String,
        holder: String,
        mode: AccessMode,
    },
    Published {
        resource_id: String,
        holder: String,
        version: u64,
    },
    Removed {
        resource_id: String,
    },
}

impl EnvironmentEvent {
    /// Resource the event is about
    pub fn resource_id(&self) -> &str {
        match self {
            Self::Registered { resource_id, .. }
            | Self::Acquired { resource_id, .. }
            | Self::Released { resource_id, .. }
            | Self::Published { resource_id, .. }
            | Self::Removed { resource_id } => resource_id,
        }
    }
}

enum LeaseGuard {
    Shared(OwnedRwLockReadGuard<Resource>),
    Exclusive(OwnedRwLockWriteGuard<Resource>),
}

/// Access to one resource; dropping it releases the resource
pub struct ResourceLease {
    resource_id: String,
    holder: String,
    mode: AccessMode,
    guard: Option<LeaseGuard>,
    events: broadcast::Sender<EnvironmentEvent>,
}

impl ResourceLease {
    pub fn resource_id(&self) -> &str {
        &self.resource_id
    }

    pub fn holder(&self) -> &str {
        &self.holder
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    fn resource(&self) -> Option<&Resource> {
        match self.guard.as_ref()? {
            LeaseGuard::Shared(guard) => Some(&**guard),
            LeaseGuard::Exclusive(guard) => Some(&**guard),
        }
    }

    /// Current payload
    pub fn data(&self) -> &Value {
        self.resource().map_or(&Value::Null, |r| &r.data)
    }

    /// Current version
    pub fn version(&self) -> u64 {
        self.resource().map_or(0, |r| r.version)
    }

    /// Replaces the payload; requires an exclusive lease
    pub fn publish(&mut self, data: Value) -> Result<u64> {
        let Some(LeaseGuard::Exclusive(guard)) = self.guard.as_mut() else {
            return Err(OrchestratorError::AccessDenied(format!(
                "{} holds {} with a shared lease",
                self.holder, self.resource_id
            )));
        };
        guard.data = data;
        guard.version += 1;
        guard.updated_at = Utc::now();
        let version = guard.version;
        let _ = self.events.send(EnvironmentEvent::Published {
            resource_id: self.resource_id.clone(),
            holder: self.holder.clone(),
            version,
        });
        debug!(resource = %self.resource_id, version, "published resource");
        Ok(version)
    }

    /// Releases the resource and wakes waiters
    pub fn release(self) {}
}

impl Drop for ResourceLease {
    fn drop(&mut self) {
        if self.guard.take().is_some() {
            let _ = self.events.send(EnvironmentEvent::Released {
                resource_id: self.resource_id.clone(),
                holder: self.holder.clone(),
                mode: self.mode,
            });
        }
    }
}

/// Event stream, optionally narrowed to one resource
pub struct EnvironmentSubscription {
    receiver: broadcast::Receiver<EnvironmentEvent>,
    resource_id: Option<String>,
}

impl EnvironmentSubscription {
    /// Next matching event; `None` once the environment is gone
    pub async fn recv(&mut self) -> Option<EnvironmentEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self
                        .resource_id
                        .as_deref()
                        .map_or(true, |id| id == event.resource_id())
                    {
                        return Some(event);
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "environment subscriber lagged");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Registry of shared resources
pub struct SharedEnvironment {
    resources: DashMap<String, Arc<RwLock<Resource>>>,
    events: broadcast::Sender<EnvironmentEvent>,
}

impl Default for SharedEnvironment {
    fn default() -> Self {
        Self::new()
    }
}

impl SharedEnvironment {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            resources: DashMap::new(),
            events,
        }
    }

    /// Registers a resource; returns false if the id is taken
    pub fn register_resource(
        &self,
        id: impl Into<String>,
        resource_type: impl Into<String>,
        data: Value,
    ) -> bool {
        let id = id.into();
        let resource_type = resource_type.into();
        let dashmap::mapref::entry::Entry::Vacant(slot) = self.resources.entry(id.clone()) else {
            return false;
        };
        slot.insert(Arc::new(RwLock::new(Resource {
            id: id.clone(),
            resource_type: resource_type.clone(),
            data,
            version: 0,
            updated_at: Utc::now(),
        })));
        let _ = self.events.send(EnvironmentEvent::Registered {
            resource_id: id,
            resource_type,
        });
        true
    }

    /// Unregisters a resource; outstanding leases stay valid until dropped
    pub fn remove_resource(&self, id: &str) -> bool {
        let removed = self.resources.remove(id).is_some();
        if removed {
            let _ = self.events.send(EnvironmentEvent::Removed {
                resource_id: id.to_string(),
            });
        }
        removed
    }

    /// Registered ids, sorted
    pub fn resource_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.resources.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    fn lock(&self, id: &str) -> Result<Arc<RwLock<Resource>>> {
        self.resources
            .get(id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| OrchestratorError::ResourceNotFound(id.to_string()))
    }

    fn lease(&self, id: &str, holder: &str, mode: AccessMode, guard: LeaseGuard) -> ResourceLease {
        let _ = self.events.send(EnvironmentEvent::Acquired {
            resource_id: id.to_string(),
            holder: holder.to_string(),
            mode,
        });
        debug!(resource = id, holder, ?mode, "resource acquired");
        ResourceLease {
            resource_id: id.to_string(),
            holder: holder.to_string(),
            mode,
            guard: Some(guard),
            events: self.events.clone(),
        }
    }

    /// Waits until `mode` can be granted on `id`
    pub async fn acquire(&self, id: &str, holder: &str, mode: AccessMode) -> Result<ResourceLease> {
        let lock = self.lock(id)?;
        let guard = match mode {
            AccessMode::Shared => LeaseGuard::Shared(lock.read_owned().await),
            AccessMode::Exclusive => LeaseGuard::Exclusive(lock.write_owned().await),
        };
        Ok(self.lease(id, holder, mode, guard))
    }

    /// Grants `mode` only if that is possible right now
    pub fn try_acquire(&self, id: &str, holder: &str, mode: AccessMode) -> Result<Option<ResourceLease>> {
        let lock = self.lock(id)?;
        let guard = match mode {
            AccessMode::Shared => lock.try_read_owned().ok().map(LeaseGuard::Shared),
            AccessMode::Exclusive => lock.try_write_owned().ok().map(LeaseGuard::Exclusive),
        };
        Ok(guard.map(|guard| self.lease(id, holder, mode, guard)))
    }

    /// Copy of a resource, waiting out any exclusive holder
    pub async fn snapshot(&self, id: &str) -> Result<Resource> {
        let lock = self.lock(id)?;
        let resource = lock.read().await.clone();
        Ok(resource)
    }

    /// Events for one resource, or for all of them
    pub fn subscribe(&self, resource_id: Option<&str>) -> EnvironmentSubscription {
        EnvironmentSubscription {
            receiver: self.events.subscribe(),
            resource_id: resource_id.map(str::to_string),
        }
    }

    /// Waits until `id` reaches at least `version` and returns its payload
    pub async fn await_version(&self, id: &str, version: u64) -> Result<Value> {
        let mut events = self.events.subscribe();
        loop {
            let current = self.snapshot(id).await?;
            if current.version >= version {
                return Ok(current.data);
            }
            // wait for a relevant event, then re-read the resource itself
            loop {
                match events.recv().await {
                    Ok(EnvironmentEvent::Published { resource_id, .. }) if resource_id == id => break,
                    Ok(EnvironmentEvent::Removed { resource_id }) if resource_id == id => {
                        return Err(OrchestratorError::ResourceNotFound(id.to_string()));
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(resource = id, skipped, "version waiter lagged, re-reading");
                        break;
                    }
                    Err(RecvError::Closed) => {
                        return Err(OrchestratorError::ResourceNotFound(id.to_string()));
                    }
                }
            }
        }
    }
}
