//! Host-framework capability layer.
//!
//! Apps never talk to the automation host or the message bus directly; each
//! one holds an `Arc<dyn HostServices>` covering the capabilities it needs:
//! state queries, predicated state subscriptions, wall-clock timers, service
//! calls, notifications, and feedback publishes. The production
//! implementation is [`bridge::HostBridge`]; tests substitute a recording
//! fake.

pub mod bridge;
pub mod hass;
pub mod mqtt;
pub mod scheduler;

#[cfg(test)]
pub mod testing;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use serde_json::Value;

/// Current state of one entity as reported by the host.
#[derive(Debug, Clone, PartialEq)]
pub struct EntityState {
    pub entity_id: String,
    pub state: String,
    pub attributes: Value,
}

impl EntityState {
    /// The domain part of the entity id (`sensor.foo` -> `sensor`).
    pub fn domain(&self) -> &str {
        self.entity_id.split('.').next().unwrap_or("")
    }

    /// A named attribute, with JSON `null` treated as absent.
    pub fn attribute(&self, name: &str) -> Option<&Value> {
        self.attributes.get(name).filter(|v| !v.is_null())
    }
}

/// A state transition received from the host.
#[derive(Debug, Clone)]
pub struct StateEvent {
    pub entity_id: String,
    pub old: Option<String>,
    pub new: Option<String>,
}

/// Handle identifying a state subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenHandle(pub(crate) u64);

/// Handle identifying a scheduled timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerHandle(pub(crate) u64);

/// Filter applied to a subscription's new state value before delivery.
pub type StatePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Events delivered to an app's queue.
///
/// Events for one app are processed serially in arrival order, so a handler
/// never overlaps another handler of the same app instance.
#[derive(Debug, Clone)]
pub enum AppEvent {
    /// A watched entity changed state.
    StateChange {
        handle: ListenHandle,
        entity_id: String,
        /// Tag the subscription was registered with.
        tag: String,
        old: Option<String>,
        new: Option<String>,
    },

    /// A timer fired.
    Timer {
        handle: TimerHandle,
        /// Tag the timer was scheduled with.
        tag: String,
        /// Payload given at scheduling time.
        payload: Value,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum HostError {
    #[error("not connected to the host")]
    NotConnected,

    #[error("transport error: {0}")]
    Transport(String),

    #[error("host rejected command: {0}")]
    Rejected(String),

    #[error("no app registered under '{0}'")]
    UnknownApp(String),

    #[error("timed out waiting for {entity_id} to reach '{target}'")]
    WaitTimeout { entity_id: String, target: String },

    #[error("host connection closed")]
    Closed,
}

/// Capability set the host framework provides to apps.
#[async_trait]
pub trait HostServices: Send + Sync {
    /// All entity states within a domain.
    async fn domain_states(&self, domain: &str) -> Result<Vec<EntityState>, HostError>;

    /// Current state of one entity, if the host knows it.
    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HostError>;

    /// One attribute of an entity; `None` for unknown entities, missing
    /// attributes, and JSON nulls.
    async fn get_attribute(
        &self,
        entity_id: &str,
        attribute: &str,
    ) -> Result<Option<Value>, HostError>;

    /// Subscribe to state changes of an entity. Matching events are
    /// delivered to `app`'s queue carrying `tag`; a predicate, when given,
    /// filters on the new state value.
    async fn listen_state(
        &self,
        app: &str,
        entity_id: &str,
        tag: &str,
        predicate: Option<StatePredicate>,
    ) -> Result<ListenHandle, HostError>;

    /// Drop a subscription. Unknown handles are a no-op.
    async fn cancel_listen(&self, handle: ListenHandle) -> Result<(), HostError>;

    /// One-shot timer after a delay.
    async fn run_in(
        &self,
        app: &str,
        tag: &str,
        delay: Duration,
        payload: Value,
    ) -> Result<TimerHandle, HostError>;

    /// One-shot timer at the next local occurrence of a wall-clock time.
    async fn run_once_at(
        &self,
        app: &str,
        tag: &str,
        at: NaiveTime,
        payload: Value,
    ) -> Result<TimerHandle, HostError>;

    /// Recurring daily timer at a local wall-clock time.
    async fn run_daily(&self, app: &str, tag: &str, at: NaiveTime)
        -> Result<TimerHandle, HostError>;

    /// Cancel a timer. Fired and unknown handles are a no-op.
    async fn cancel_timer(&self, handle: TimerHandle) -> Result<(), HostError>;

    /// Whether local time is currently inside the `[start_hour:00,
    /// end_hour:00]` window. Wraps across midnight when start > end.
    fn now_is_between(&self, start_hour: u32, end_hour: u32) -> bool;

    /// Invoke a host service.
    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError>;

    /// Send a user-facing notification through a notify service.
    async fn notify(&self, target: &str, title: &str, message: &str) -> Result<(), HostError>;

    /// Publish a payload to a message-bus topic.
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), HostError>;

    /// Wait for an entity to reach a target state, bounded by `timeout`.
    /// Returns [`HostError::WaitTimeout`] on expiry; never blocks forever.
    async fn wait_state(
        &self,
        entity_id: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), HostError>;
}
