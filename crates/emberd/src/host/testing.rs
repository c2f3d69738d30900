//! Recording [`HostServices`] fake for app unit tests.
//!
//! Tests construct apps against this fake, drive `on_event` by hand, and
//! assert on what the app asked the host to do. Subscriptions keep their
//! predicates so the threshold filters can be exercised directly.

use std::collections::VecDeque;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveTime;
use serde_json::Value;

use super::EntityState;
use super::HostError;
use super::HostServices;
use super::ListenHandle;
use super::StatePredicate;
use super::TimerHandle;

#[derive(Clone)]
pub struct FakeListen {
    pub handle: ListenHandle,
    pub app: String,
    pub entity_id: String,
    pub tag: String,
    pub predicate: Option<StatePredicate>,
}

#[derive(Clone, Debug)]
pub struct FakeTimer {
    pub handle: TimerHandle,
    pub app: String,
    pub tag: String,
    pub at: Option<NaiveTime>,
    pub delay: Option<Duration>,
    pub daily: bool,
    pub payload: Value,
}

#[derive(Default)]
pub struct FakeHost {
    pub in_window: Mutex<bool>,
    pub states: Mutex<Vec<EntityState>>,
    pub listens: Mutex<Vec<FakeListen>>,
    pub cancelled_listens: Mutex<Vec<ListenHandle>>,
    pub timers: Mutex<Vec<FakeTimer>>,
    pub cancelled_timers: Mutex<Vec<TimerHandle>>,
    /// (target, title, message)
    pub notifications: Mutex<Vec<(String, String, String)>>,
    /// (domain, service, data)
    pub service_calls: Mutex<Vec<(String, String, Value)>>,
    /// (topic, payload)
    pub published: Mutex<Vec<(String, String)>>,
    /// Scripted wait_state outcomes; defaults to success when empty
    pub wait_results: Mutex<VecDeque<Result<(), HostError>>>,
    next_handle: AtomicU64,
}

impl FakeHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in_window(&self, in_window: bool) {
        *self.in_window.lock().unwrap() = in_window;
    }

    pub fn add_state(&self, entity_id: &str, state: &str, attributes: Value) {
        self.states.lock().unwrap().push(EntityState {
            entity_id: entity_id.to_string(),
            state: state.to_string(),
            attributes,
        });
    }

    pub fn push_wait_result(&self, result: Result<(), HostError>) {
        self.wait_results.lock().unwrap().push_back(result);
    }

    pub fn listen_count(&self) -> usize {
        self.listens.lock().unwrap().len()
    }

    pub fn predicate_for(&self, entity_id: &str, tag: &str) -> Option<StatePredicate> {
        self.listens
            .lock()
            .unwrap()
            .iter()
            .find(|l| l.entity_id == entity_id && l.tag == tag)
            .and_then(|l| l.predicate.clone())
    }

    /// Timers scheduled and not yet cancelled.
    pub fn active_timers(&self) -> Vec<FakeTimer> {
        let cancelled = self.cancelled_timers.lock().unwrap();
        self.timers
            .lock()
            .unwrap()
            .iter()
            .filter(|t| !cancelled.contains(&t.handle))
            .cloned()
            .collect()
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn record_timer(&self, timer: FakeTimer) -> TimerHandle {
        let handle = timer.handle;
        self.timers.lock().unwrap().push(timer);
        handle
    }
}

#[async_trait]
impl HostServices for FakeHost {
    async fn domain_states(&self, domain: &str) -> Result<Vec<EntityState>, HostError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.domain() == domain)
            .cloned()
            .collect())
    }

    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HostError> {
        Ok(self
            .states
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.entity_id == entity_id)
            .cloned())
    }

    async fn get_attribute(
        &self,
        entity_id: &str,
        attribute: &str,
    ) -> Result<Option<Value>, HostError> {
        let state = self.get_state(entity_id).await?;
        Ok(state.and_then(|s| s.attribute(attribute).cloned()))
    }

    async fn listen_state(
        &self,
        app: &str,
        entity_id: &str,
        tag: &str,
        predicate: Option<StatePredicate>,
    ) -> Result<ListenHandle, HostError> {
        let handle = ListenHandle(self.next_handle());
        self.listens.lock().unwrap().push(FakeListen {
            handle,
            app: app.to_string(),
            entity_id: entity_id.to_string(),
            tag: tag.to_string(),
            predicate,
        });
        Ok(handle)
    }

    async fn cancel_listen(&self, handle: ListenHandle) -> Result<(), HostError> {
        self.cancelled_listens.lock().unwrap().push(handle);
        Ok(())
    }

    async fn run_in(
        &self,
        app: &str,
        tag: &str,
        delay: Duration,
        payload: Value,
    ) -> Result<TimerHandle, HostError> {
        Ok(self.record_timer(FakeTimer {
            handle: TimerHandle(self.next_handle()),
            app: app.to_string(),
            tag: tag.to_string(),
            at: None,
            delay: Some(delay),
            daily: false,
            payload,
        }))
    }

    async fn run_once_at(
        &self,
        app: &str,
        tag: &str,
        at: NaiveTime,
        payload: Value,
    ) -> Result<TimerHandle, HostError> {
        Ok(self.record_timer(FakeTimer {
            handle: TimerHandle(self.next_handle()),
            app: app.to_string(),
            tag: tag.to_string(),
            at: Some(at),
            delay: None,
            daily: false,
            payload,
        }))
    }

    async fn run_daily(
        &self,
        app: &str,
        tag: &str,
        at: NaiveTime,
    ) -> Result<TimerHandle, HostError> {
        Ok(self.record_timer(FakeTimer {
            handle: TimerHandle(self.next_handle()),
            app: app.to_string(),
            tag: tag.to_string(),
            at: Some(at),
            delay: None,
            daily: true,
            payload: Value::Null,
        }))
    }

    async fn cancel_timer(&self, handle: TimerHandle) -> Result<(), HostError> {
        self.cancelled_timers.lock().unwrap().push(handle);
        Ok(())
    }

    fn now_is_between(&self, _start_hour: u32, _end_hour: u32) -> bool {
        *self.in_window.lock().unwrap()
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError> {
        self.service_calls
            .lock()
            .unwrap()
            .push((domain.to_string(), service.to_string(), data));
        Ok(())
    }

    async fn notify(&self, target: &str, title: &str, message: &str) -> Result<(), HostError> {
        self.notifications.lock().unwrap().push((
            target.to_string(),
            title.to_string(),
            message.to_string(),
        ));
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), HostError> {
        self.published
            .lock()
            .unwrap()
            .push((topic.to_string(), payload.to_string()));
        Ok(())
    }

    async fn wait_state(
        &self,
        _entity_id: &str,
        _target: &str,
        _timeout: Duration,
    ) -> Result<(), HostError> {
        self.wait_results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Ok(()))
    }
}
