//! Battery monitor app.
//!
//! Discovers battery-class sensors, watches their charge level against a
//! threshold, and notifies when one runs low. Outside the configured
//! notification window the notification is deferred to the window's start;
//! a recovery above the threshold cancels the deferred delivery.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use serde_json::json;
use serde_json::Value;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::App;
use super::AppContext;
use super::AppFactoryResult;
use super::REGISTRY;
use crate::config::BatteryWatchConfig;
use crate::host::scheduler::at_hour;
use crate::host::AppEvent;
use crate::host::HostServices;
use crate::host::ListenHandle;
use crate::host::StatePredicate;
use crate::host::TimerHandle;

/// Hour of the daily re-discovery pass
const DISCOVERY_HOUR: u32 = 12;

const TAG_LOW: &str = "low";
const TAG_RECOVERED: &str = "recovered";
const TAG_DISCOVER: &str = "discover";
const TAG_NOTIFY: &str = "notify";

#[distributed_slice(REGISTRY)]
fn init_battery_watch(ctx: &AppContext) -> AppFactoryResult {
    let Some(config) = ctx.config.apps.battery_watch.clone() else {
        return Ok(Vec::new());
    };
    Ok(vec![Box::new(BatteryWatch::new(
        "battery_watch",
        ctx.host.clone(),
        config,
    ))])
}

/// Parse a sensor state as a whole-percent charge level. Non-numeric states
/// ("unknown", "unavailable", ...) match no threshold.
fn parse_level(state: &str) -> Option<i64> {
    state.trim().parse().ok()
}

/// Validated configuration, present once initialize accepted it.
#[derive(Clone, Copy)]
struct Settings {
    threshold: i64,
    start_hour: u32,
    end_hour: u32,
}

pub struct BatteryWatch {
    name: String,
    host: Arc<dyn HostServices>,
    config: BatteryWatchConfig,
    settings: Option<Settings>,

    /// Watched sensors. Present iff discovered; the slot holds the deferred
    /// notification timer iff one is scheduled and has not fired. This is
    /// the only state touched from multiple handler paths, and those run
    /// serially per entity.
    registered: HashMap<String, Option<TimerHandle>>,

    listen_handles: Vec<ListenHandle>,
    discovery_timer: Option<TimerHandle>,
}

impl BatteryWatch {
    pub fn new(name: &str, host: Arc<dyn HostServices>, config: BatteryWatchConfig) -> Self {
        Self {
            name: name.to_string(),
            host,
            config,
            settings: None,
            registered: HashMap::new(),
            listen_handles: Vec::new(),
            discovery_timer: None,
        }
    }

    /// Find unwatched battery sensors and subscribe their threshold
    /// watchers. Safe to run repeatedly: already-registered sensors are
    /// skipped.
    async fn discover(&mut self) -> anyhow::Result<()> {
        let Some(settings) = self.settings else {
            return Ok(());
        };

        let sensors = self.host.domain_states("sensor").await?;
        for sensor in sensors {
            if sensor.attribute("device_class").and_then(Value::as_str) != Some("battery") {
                continue;
            }
            if sensor.attribute("battery_type").is_none() {
                continue;
            }
            if self.registered.contains_key(&sensor.entity_id) {
                continue;
            }

            info!("Registering battery sensor: {}", sensor.entity_id);
            self.registered.insert(sensor.entity_id.clone(), None);

            let threshold = settings.threshold;
            let low: StatePredicate = Arc::new(move |state: &str| {
                matches!(parse_level(state), Some(level) if level < threshold)
            });
            let handle = self
                .host
                .listen_state(&self.name, &sensor.entity_id, TAG_LOW, Some(low))
                .await?;
            self.listen_handles.push(handle);

            let recovered: StatePredicate = Arc::new(move |state: &str| {
                matches!(parse_level(state), Some(level) if level >= threshold)
            });
            let handle = self
                .host
                .listen_state(&self.name, &sensor.entity_id, TAG_RECOVERED, Some(recovered))
                .await?;
            self.listen_handles.push(handle);
        }

        Ok(())
    }

    async fn attribute_string(&self, entity_id: &str, attribute: &str) -> Option<String> {
        self.host
            .get_attribute(entity_id, attribute)
            .await
            .ok()
            .flatten()
            .and_then(|v| v.as_str().map(str::to_string))
    }

    /// Notify immediately when inside the window, otherwise (re)schedule
    /// the notification for the window's start.
    async fn on_low(&mut self, entity_id: &str, new: &str) {
        let Some(settings) = self.settings else {
            return;
        };
        info!("Notify for: {}", entity_id);

        let friendly_name = self
            .attribute_string(entity_id, "friendly_name")
            .await
            .unwrap_or_else(|| entity_id.to_string());
        let battery_type = self
            .attribute_string(entity_id, "battery_type")
            .await
            .unwrap_or_else(|| "unknown".to_string());

        let title = format!("{} is low at {}%!", friendly_name, new);
        let message = format!("Replace with {}.", battery_type);

        self.cancel_pending(entity_id).await;

        if self
            .host
            .now_is_between(settings.start_hour, settings.end_hour)
        {
            info!("Executing notification: {} {}", title, message);
            if let Err(e) = self
                .host
                .notify(&self.config.notify_target, &title, &message)
                .await
            {
                error!("failed to notify for {}: {}", entity_id, e);
            }
        } else {
            info!(
                "Scheduling notification for {}:00:00 - {} {}",
                settings.start_hour, title, message
            );
            let payload = json!({
                "entity_id": entity_id,
                "title": title,
                "message": message,
            });
            match self
                .host
                .run_once_at(&self.name, TAG_NOTIFY, at_hour(settings.start_hour), payload)
                .await
            {
                Ok(handle) => {
                    self.registered.insert(entity_id.to_string(), Some(handle));
                }
                Err(e) => error!("failed to schedule notification for {}: {}", entity_id, e),
            }
        }
    }

    /// Cancel a pending deferred notification, if any. No-op otherwise.
    async fn cancel_pending(&mut self, entity_id: &str) {
        let Some(slot) = self.registered.get_mut(entity_id) else {
            return;
        };
        if let Some(handle) = slot.take() {
            info!("Cancelling pending notification for {}", entity_id);
            if let Err(e) = self.host.cancel_timer(handle).await {
                warn!("failed to cancel notification timer: {}", e);
            }
        }
    }

    /// A deferred notification came due: clear the slot and deliver it.
    async fn deferred_notify(&mut self, payload: Value) {
        if let Some(entity_id) = payload.get("entity_id").and_then(Value::as_str) {
            if let Some(slot) = self.registered.get_mut(entity_id) {
                *slot = None;
            }
        }
        let title = payload
            .get("title")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let message = payload
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default();
        if let Err(e) = self
            .host
            .notify(&self.config.notify_target, title, message)
            .await
        {
            error!("failed to send deferred notification: {}", e);
        }
    }
}

#[async_trait]
impl App for BatteryWatch {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        let Some(threshold) = self.config.threshold else {
            anyhow::bail!("threshold not set, not setting up notifiers");
        };
        let Some(start_hour) = self.config.notify_hour_start_hour else {
            anyhow::bail!("notify_hour_start_hour not set, not setting up notifiers");
        };
        let Some(end_hour) = self.config.notify_hour_end_hour else {
            anyhow::bail!("notify_hour_end_hour not set, not setting up notifiers");
        };
        if start_hour > 23 || end_hour > 23 {
            anyhow::bail!("notify window hours must be within 0-23");
        }

        info!("threshold: {}", threshold);
        info!("notify window: {}:00 - {}:00", start_hour, end_hour);
        self.settings = Some(Settings {
            threshold,
            start_hour,
            end_hour,
        });

        self.discover().await?;

        let handle = self
            .host
            .run_daily(&self.name, TAG_DISCOVER, at_hour(DISCOVERY_HOUR))
            .await?;
        self.discovery_timer = Some(handle);

        Ok(())
    }

    async fn on_event(&mut self, event: AppEvent) {
        match event {
            AppEvent::StateChange {
                entity_id, tag, new, ..
            } => match tag.as_str() {
                TAG_LOW => {
                    if let Some(new) = new {
                        self.on_low(&entity_id, &new).await;
                    }
                }
                TAG_RECOVERED => self.cancel_pending(&entity_id).await,
                _ => {}
            },
            AppEvent::Timer { tag, payload, .. } => match tag.as_str() {
                TAG_DISCOVER => {
                    if let Err(e) = self.discover().await {
                        error!("battery discovery failed: {:#}", e);
                    }
                }
                TAG_NOTIFY => self.deferred_notify(payload).await,
                _ => {}
            },
        }
    }

    async fn terminate(&mut self) {
        for handle in self.listen_handles.drain(..) {
            if let Err(e) = self.host.cancel_listen(handle).await {
                warn!("failed to cancel subscription: {}", e);
            }
        }
        if let Some(handle) = self.discovery_timer.take() {
            if let Err(e) = self.host.cancel_timer(handle).await {
                warn!("failed to cancel discovery timer: {}", e);
            }
        }
        for slot in self.registered.values_mut() {
            if let Some(handle) = slot.take() {
                if let Err(e) = self.host.cancel_timer(handle).await {
                    warn!("failed to cancel notification timer: {}", e);
                }
            }
        }
    }
}
