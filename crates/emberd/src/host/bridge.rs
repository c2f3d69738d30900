//! Production [`HostServices`] implementation.
//!
//! The bridge owns the host connection and the timer table, keeps the
//! subscription registry, and routes incoming state transitions onto the
//! per-app queues. Apps receive their events serially through those queues;
//! the bridge itself never calls into an app.

use std::collections::HashMap;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Local;
use chrono::NaiveTime;
use serde_json::json;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::info;
use tracing::warn;

use super::hass::HassClient;
use super::mqtt::MqttClient;
use super::scheduler::time_in_window;
use super::scheduler::Scheduler;
use super::AppEvent;
use super::EntityState;
use super::HostError;
use super::HostServices;
use super::ListenHandle;
use super::StateEvent;
use super::StatePredicate;
use super::TimerHandle;

/// Capacity of each app's event queue
const APP_CHANNEL_SIZE: usize = 64;

/// How long the event pump holds the connection lock per poll, so command
/// senders get a turn between polls
const EVENT_POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll interval for bounded state waits
const WAIT_STATE_POLL: Duration = Duration::from_secs(1);

struct Subscription {
    app: String,
    entity_id: String,
    tag: String,
    predicate: Option<StatePredicate>,
}

pub struct HostBridge {
    hass: tokio::sync::Mutex<Box<dyn HassClient>>,

    /// Direct broker connection; publishes fall back to the host's mqtt
    /// service when absent
    mqtt: Option<Box<dyn MqttClient>>,

    /// Per-app event queues, keyed by app name
    apps: Mutex<HashMap<String, mpsc::Sender<AppEvent>>>,

    /// Active state subscriptions
    subscriptions: Mutex<HashMap<u64, Subscription>>,

    scheduler: Scheduler,

    next_handle: AtomicU64,
}

impl HostBridge {
    pub fn new(hass: Box<dyn HassClient>, mqtt: Option<Box<dyn MqttClient>>) -> Self {
        Self {
            hass: tokio::sync::Mutex::new(hass),
            mqtt,
            apps: Mutex::new(HashMap::new()),
            subscriptions: Mutex::new(HashMap::new()),
            scheduler: Scheduler::new(),
            next_handle: AtomicU64::new(1),
        }
    }

    /// Create the event queue for an app. Called once per app at startup.
    pub fn register_app(&self, name: &str) -> mpsc::Receiver<AppEvent> {
        let (tx, rx) = mpsc::channel(APP_CHANNEL_SIZE);
        if let Ok(mut apps) = self.apps.lock() {
            apps.insert(name.to_string(), tx);
        }
        rx
    }

    /// Tear down routing: abort outstanding timers and drop every app queue
    /// sender so the app loops drain and terminate.
    pub fn close_apps(&self) {
        self.scheduler.cancel_all();
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.clear();
        }
        if let Ok(mut apps) = self.apps.lock() {
            apps.clear();
        }
    }

    /// Pump state transitions from the host into the app queues until the
    /// connection closes.
    pub async fn run(&self) {
        info!("host bridge running");
        loop {
            let event = {
                let mut hass = self.hass.lock().await;
                match tokio::time::timeout(EVENT_POLL_TIMEOUT, hass.poll_event()).await {
                    Ok(Some(event)) => Some(event),
                    Ok(None) => break,
                    // No event inside the window; release the lock so
                    // queued commands get a turn.
                    Err(_) => None,
                }
            };
            if let Some(event) = event {
                self.route(event).await;
            }
        }
        info!("host connection closed, bridge stopping");
    }

    async fn route(&self, event: StateEvent) {
        // Matching is done under the locks; the sends happen after, so a
        // slow app cannot stall other lock users.
        let deliveries: Vec<(mpsc::Sender<AppEvent>, AppEvent)> = {
            let Ok(subscriptions) = self.subscriptions.lock() else {
                return;
            };
            let Ok(apps) = self.apps.lock() else {
                return;
            };
            subscriptions
                .iter()
                .filter(|(_, sub)| sub.entity_id == event.entity_id)
                .filter(|(_, sub)| match (&sub.predicate, event.new.as_deref()) {
                    (Some(predicate), Some(new)) => predicate(new),
                    // Fail-safe: a predicated subscription never matches a
                    // removed state.
                    (Some(_), None) => false,
                    (None, _) => true,
                })
                .filter_map(|(id, sub)| {
                    apps.get(&sub.app).map(|tx| {
                        (
                            tx.clone(),
                            AppEvent::StateChange {
                                handle: ListenHandle(*id),
                                entity_id: event.entity_id.clone(),
                                tag: sub.tag.clone(),
                                old: event.old.clone(),
                                new: event.new.clone(),
                            },
                        )
                    })
                })
                .collect()
        };

        for (tx, delivery) in deliveries {
            if tx.send(delivery).await.is_err() {
                warn!("dropping event for a stopped app");
            }
        }
    }

    fn next_handle(&self) -> u64 {
        self.next_handle.fetch_add(1, Ordering::Relaxed)
    }

    fn app_sender(&self, app: &str) -> Result<mpsc::Sender<AppEvent>, HostError> {
        self.apps
            .lock()
            .ok()
            .and_then(|apps| apps.get(app).cloned())
            .ok_or_else(|| HostError::UnknownApp(app.to_string()))
    }
}

#[async_trait]
impl HostServices for HostBridge {
    async fn domain_states(&self, domain: &str) -> Result<Vec<EntityState>, HostError> {
        let states = {
            let hass = self.hass.lock().await;
            hass.get_states().await?
        };
        Ok(states
            .into_iter()
            .filter(|state| state.domain() == domain)
            .collect())
    }

    async fn get_state(&self, entity_id: &str) -> Result<Option<EntityState>, HostError> {
        let states = {
            let hass = self.hass.lock().await;
            hass.get_states().await?
        };
        Ok(states.into_iter().find(|s| s.entity_id == entity_id))
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
        let subscription = Subscription {
            app: app.to_string(),
            entity_id: entity_id.to_string(),
            tag: tag.to_string(),
            predicate,
        };
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.insert(handle.0, subscription);
        }
        Ok(handle)
    }

    async fn cancel_listen(&self, handle: ListenHandle) -> Result<(), HostError> {
        if let Ok(mut subscriptions) = self.subscriptions.lock() {
            subscriptions.remove(&handle.0);
        }
        Ok(())
    }

    async fn run_in(
        &self,
        app: &str,
        tag: &str,
        delay: Duration,
        payload: Value,
    ) -> Result<TimerHandle, HostError> {
        let tx = self.app_sender(app)?;
        let handle = TimerHandle(self.next_handle());
        self.scheduler
            .schedule_in(handle, delay, tx, tag.to_string(), payload);
        Ok(handle)
    }

    async fn run_once_at(
        &self,
        app: &str,
        tag: &str,
        at: NaiveTime,
        payload: Value,
    ) -> Result<TimerHandle, HostError> {
        let tx = self.app_sender(app)?;
        let handle = TimerHandle(self.next_handle());
        self.scheduler.schedule_at(
            handle,
            Local::now().naive_local(),
            at,
            tx,
            tag.to_string(),
            payload,
        );
        Ok(handle)
    }

    async fn run_daily(
        &self,
        app: &str,
        tag: &str,
        at: NaiveTime,
    ) -> Result<TimerHandle, HostError> {
        let tx = self.app_sender(app)?;
        let handle = TimerHandle(self.next_handle());
        self.scheduler
            .schedule_daily(handle, at, tx, tag.to_string());
        Ok(handle)
    }

    async fn cancel_timer(&self, handle: TimerHandle) -> Result<(), HostError> {
        self.scheduler.cancel(handle);
        Ok(())
    }

    fn now_is_between(&self, start_hour: u32, end_hour: u32) -> bool {
        time_in_window(Local::now().time(), start_hour, end_hour)
    }

    async fn call_service(
        &self,
        domain: &str,
        service: &str,
        data: Value,
    ) -> Result<(), HostError> {
        let hass = self.hass.lock().await;
        hass.call_service(domain, service, data).await
    }

    async fn notify(&self, target: &str, title: &str, message: &str) -> Result<(), HostError> {
        self.call_service(
            "notify",
            target,
            json!({"title": title, "message": message}),
        )
        .await
    }

    async fn publish(&self, topic: &str, payload: &str) -> Result<(), HostError> {
        match &self.mqtt {
            Some(client) => client.publish(topic, payload.as_bytes()).await,
            None => {
                self.call_service("mqtt", "publish", json!({"topic": topic, "payload": payload}))
                    .await
            }
        }
    }

    async fn wait_state(
        &self,
        entity_id: &str,
        target: &str,
        timeout: Duration,
    ) -> Result<(), HostError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let state = self.get_state(entity_id).await?;
            if state.map(|s| s.state == target).unwrap_or(false) {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(HostError::WaitTimeout {
                    entity_id: entity_id.to_string(),
                    target: target.to_string(),
                });
            }
            tokio::time::sleep(WAIT_STATE_POLL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::hass::MockHassClient;
    use crate::host::mqtt::MockMqttClient;
    use std::sync::Arc;

    fn battery_state(entity_id: &str, state: &str) -> EntityState {
        EntityState {
            entity_id: entity_id.to_string(),
            state: state.to_string(),
            attributes: json!({"device_class": "battery", "battery_type": "AA"}),
        }
    }

    #[tokio::test]
    async fn test_routes_matching_events_only() {
        let mock = Arc::new(MockHassClient::new());
        mock.push_event("sensor.a_battery", Some("30"), Some("15"));
        mock.push_event("sensor.a_battery", Some("15"), Some("80"));
        mock.push_event("sensor.unrelated", None, Some("15"));

        let bridge = HostBridge::new(Box::new(mock.clone()), None);
        let mut rx = bridge.register_app("battery_watch");

        let low: StatePredicate =
            Arc::new(|state: &str| state.parse::<i64>().map(|v| v < 20).unwrap_or(false));
        bridge
            .listen_state("battery_watch", "sensor.a_battery", "low", Some(low))
            .await
            .unwrap();

        // The mock yields None once drained, which stops the pump.
        bridge.run().await;

        match rx.recv().await {
            Some(AppEvent::StateChange { tag, new, entity_id, .. }) => {
                assert_eq!(tag, "low");
                assert_eq!(entity_id, "sensor.a_battery");
                assert_eq!(new.as_deref(), Some("15"));
            }
            other => panic!("expected state change, got {:?}", other),
        }

        bridge.close_apps();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unpredicated_subscription_gets_everything() {
        let mock = Arc::new(MockHassClient::new());
        mock.push_event("sensor.office_scene_state_scene_001", None, Some("2"));

        let bridge = HostBridge::new(Box::new(mock.clone()), None);
        let mut rx = bridge.register_app("scenes.office");
        bridge
            .listen_state(
                "scenes.office",
                "sensor.office_scene_state_scene_001",
                "up",
                None,
            )
            .await
            .unwrap();

        bridge.run().await;

        match rx.recv().await {
            Some(AppEvent::StateChange { tag, new, .. }) => {
                assert_eq!(tag, "up");
                assert_eq!(new.as_deref(), Some("2"));
            }
            other => panic!("expected state change, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_listen_stops_delivery() {
        let mock = Arc::new(MockHassClient::new());
        let bridge = HostBridge::new(Box::new(mock.clone()), None);
        let mut rx = bridge.register_app("app");

        let handle = bridge
            .listen_state("app", "sensor.a", "tag", None)
            .await
            .unwrap();
        bridge.cancel_listen(handle).await.unwrap();
        // Cancelling twice must not error.
        bridge.cancel_listen(handle).await.unwrap();

        mock.push_event("sensor.a", None, Some("on"));
        bridge.run().await;
        bridge.close_apps();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_publish_relays_via_service_without_broker() {
        let mock = Arc::new(MockHassClient::new());
        let bridge = HostBridge::new(Box::new(mock.clone()), None);

        bridge.publish("zwave/node/112/0/2/set", "3").await.unwrap();

        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "mqtt");
        assert_eq!(calls[0].1, "publish");
        assert_eq!(
            calls[0].2,
            json!({"topic": "zwave/node/112/0/2/set", "payload": "3"})
        );
    }

    #[tokio::test]
    async fn test_publish_prefers_direct_broker() {
        let hass = Arc::new(MockHassClient::new());
        let mqtt = Arc::new(MockMqttClient::default());
        let bridge = HostBridge::new(Box::new(hass.clone()), Some(Box::new(mqtt.clone())));

        bridge.publish("zwave/node/112/0/14/set", "1").await.unwrap();

        let published = mqtt.published.lock().unwrap();
        assert_eq!(
            published.as_slice(),
            &[("zwave/node/112/0/14/set".to_string(), "1".to_string())]
        );
        assert!(hass.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_notify_is_a_notify_service_call() {
        let mock = Arc::new(MockHassClient::new());
        let bridge = HostBridge::new(Box::new(mock.clone()), None);

        bridge
            .notify("mike_phone", "Sensor is low at 12%!", "Replace with AA.")
            .await
            .unwrap();

        let calls = mock.calls.lock().unwrap();
        assert_eq!(calls[0].0, "notify");
        assert_eq!(calls[0].1, "mike_phone");
        assert_eq!(
            calls[0].2,
            json!({"title": "Sensor is low at 12%!", "message": "Replace with AA."})
        );
    }

    #[tokio::test]
    async fn test_domain_states_filters() {
        let mock = Arc::new(MockHassClient::new());
        {
            let mut states = mock.states.lock().unwrap();
            states.push(battery_state("sensor.a_battery", "50"));
            states.push(EntityState {
                entity_id: "light.office".to_string(),
                state: "on".to_string(),
                attributes: Value::Null,
            });
        }
        let bridge = HostBridge::new(Box::new(mock.clone()), None);

        let sensors = bridge.domain_states("sensor").await.unwrap();
        assert_eq!(sensors.len(), 1);
        assert_eq!(sensors[0].entity_id, "sensor.a_battery");

        let attr = bridge
            .get_attribute("sensor.a_battery", "battery_type")
            .await
            .unwrap();
        assert_eq!(attr, Some(json!("AA")));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_state_resolves_and_times_out() {
        let mock = Arc::new(MockHassClient::new());
        mock.states
            .lock()
            .unwrap()
            .push(EntityState {
                entity_id: "cover.desk".to_string(),
                state: "open".to_string(),
                attributes: Value::Null,
            });
        let bridge = HostBridge::new(Box::new(mock.clone()), None);

        bridge
            .wait_state("cover.desk", "open", Duration::from_secs(30))
            .await
            .unwrap();

        let result = bridge
            .wait_state("cover.desk", "closed", Duration::from_secs(5))
            .await;
        assert!(matches!(result, Err(HostError::WaitTimeout { .. })));
    }

    #[tokio::test]
    async fn test_timer_requires_registered_app() {
        let mock = Arc::new(MockHassClient::new());
        let bridge = HostBridge::new(Box::new(mock.clone()), None);

        let result = bridge
            .run_in("ghost", "tag", Duration::from_secs(1), Value::Null)
            .await;
        assert!(matches!(result, Err(HostError::UnknownApp(_))));
    }
}
