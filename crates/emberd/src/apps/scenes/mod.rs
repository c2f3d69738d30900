//! Scene-controller dispatch app.
//!
//! A scene-capable dimmer reports paddle activity as numeric codes on two
//! sensor entities, one per direction. Each instance of this app decodes
//! those codes into labelled scenes, runs the action its profile binds to
//! the label, and brackets every dispatch with LED feedback publishes so
//! the switch shows when an action is in flight.

pub mod profiles;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use linkme::distributed_slice;
use serde_json::json;
use strum::Display;
use strum::EnumString;
use tracing::error;
use tracing::info;
use tracing::warn;

use super::App;
use super::AppContext;
use super::AppFactoryResult;
use super::REGISTRY;
use crate::config::SceneConfig;
use crate::host::AppEvent;
use crate::host::HostError;
use crate::host::HostServices;
use crate::host::ListenHandle;

pub const LED_WHITE: &str = "0";
pub const LED_BLUE: &str = "1";
pub const LED_GREEN: &str = "2";
pub const LED_RED: &str = "3";

/// Raw scene-state codes for 1..=5 presses, in reporting order
const PRESS_STATES: [&str; 5] = ["0", "3", "4", "5", "6"];
const HELD_STATE: &str = "2";
const RELEASED_STATE: &str = "1";

/// How long a cover or group gets to reach its target state
const CONFIRM_TIMEOUT: Duration = Duration::from_secs(30);

#[distributed_slice(REGISTRY)]
fn init_scenes(ctx: &AppContext) -> AppFactoryResult {
    Ok(ctx
        .config
        .apps
        .scenes
        .iter()
        .map(|(key, config)| {
            Box::new(SceneDispatcher::new(
                &format!("scenes.{}", key),
                ctx.host.clone(),
                config.clone(),
            )) as Box<dyn App>
        })
        .collect())
}

/// Paddle direction on the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString)]
#[strum(serialize_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// What the paddle reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScenePress {
    /// 1..=5 discrete presses
    Press(u8),
    Held,
    Released,
}

/// A decoded scene: direction plus press kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SceneLabel {
    pub direction: Direction,
    pub press: ScenePress,
}

impl SceneLabel {
    pub fn new(direction: Direction, press: ScenePress) -> Self {
        Self { direction, press }
    }
}

impl fmt::Display for SceneLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.press {
            ScenePress::Press(count) => write!(f, "scene_{}_{}", self.direction, count),
            ScenePress::Held => write!(f, "scene_{}_held", self.direction),
            ScenePress::Released => write!(f, "scene_{}_released", self.direction),
        }
    }
}

/// Map a raw scene-state code to its label, or nothing for unknown codes.
pub fn decode(direction: Direction, raw: &str) -> Option<SceneLabel> {
    if let Some(index) = PRESS_STATES.iter().position(|code| *code == raw) {
        return Some(SceneLabel::new(direction, ScenePress::Press(index as u8 + 1)));
    }
    match raw {
        HELD_STATE => Some(SceneLabel::new(direction, ScenePress::Held)),
        RELEASED_STATE => Some(SceneLabel::new(direction, ScenePress::Released)),
        _ => None,
    }
}

/// Action a profile binds to a scene label. Binding the same action under
/// several labels is how a profile aliases them.
#[derive(Debug, Clone, PartialEq)]
pub enum SceneAction {
    /// Drive a cover to a position and confirm it finished moving
    CoverPosition { cover: String, position: u8 },
    /// Turn a set of light groups on
    GroupsOn { groups: Vec<String> },
    /// Turn a set of light groups off
    GroupsOff { groups: Vec<String> },
    /// Turn a group off after a delay and confirm it went dark
    DeferredOff { group: String, delay_secs: u64 },
}

pub type SceneBindings = HashMap<SceneLabel, SceneAction>;

pub struct SceneDispatcher {
    name: String,
    host: Arc<dyn HostServices>,
    config: SceneConfig,
    bindings: SceneBindings,
    /// Whether the LED feedback hooks fire for this profile
    feedback: bool,
    led_color_before: String,
    led_color_after: String,
    /// Set once initialize validated the config
    node_name: Option<String>,
    listen_handles: Vec<ListenHandle>,
}

impl SceneDispatcher {
    pub fn new(name: &str, host: Arc<dyn HostServices>, config: SceneConfig) -> Self {
        let (bindings, feedback) = profiles::bindings(&config);
        let led_color_before = config
            .led_color_before
            .clone()
            .unwrap_or_else(|| LED_RED.to_string());
        let led_color_after = config
            .led_color_after
            .clone()
            .unwrap_or_else(|| LED_BLUE.to_string());
        Self {
            name: name.to_string(),
            host,
            config,
            bindings,
            feedback,
            led_color_before,
            led_color_after,
            node_name: None,
            listen_handles: Vec::new(),
        }
    }

    /// One full dispatch: decode, look up the binding, and run it between
    /// the feedback hooks. The after-hook runs even when the action fails.
    async fn dispatch(&self, entity_id: &str, direction: Direction, raw: &str) {
        let Some(label) = decode(direction, raw) else {
            error!(
                "unknown scene triggered: entity={}, state={}",
                entity_id, raw
            );
            return;
        };
        let Some(action) = self.bindings.get(&label).cloned() else {
            info!("{} not bound, skipping...", label);
            return;
        };

        info!("{} triggered on {}", label, entity_id);
        self.before_feedback().await;
        let result = self.run_action(action).await;
        self.after_feedback().await;
        if let Err(e) = result {
            error!("{} handler failed: {}", label, e);
        }
    }

    async fn before_feedback(&self) {
        self.send_feedback("3", &self.led_color_before).await;
    }

    async fn after_feedback(&self) {
        self.send_feedback("0", &self.led_color_after).await;
    }

    /// Publish the indicator flag and LED color for this instance's switch.
    async fn send_feedback(&self, indicator: &str, color: &str) {
        if !self.feedback {
            return;
        }
        let Some(node_name) = &self.node_name else {
            return;
        };
        let indicator_topic = format!("zwave/{}/112/0/2/set", node_name);
        if let Err(e) = self.host.publish(&indicator_topic, indicator).await {
            warn!("feedback publish failed: {}", e);
        }
        let color_topic = format!("zwave/{}/112/0/14/set", node_name);
        if let Err(e) = self.host.publish(&color_topic, color).await {
            warn!("feedback publish failed: {}", e);
        }
    }

    async fn run_action(&self, action: SceneAction) -> Result<(), HostError> {
        match action {
            SceneAction::CoverPosition { cover, position } => {
                self.host
                    .call_service(
                        "cover",
                        "set_cover_position",
                        json!({"entity_id": cover, "position": position}),
                    )
                    .await?;
                tokio::time::sleep(Duration::from_secs(2)).await;
                match self.host.wait_state(&cover, "open", CONFIRM_TIMEOUT).await {
                    Err(HostError::WaitTimeout { .. }) => {
                        error!("{} did not complete in time", cover);
                    }
                    other => other?,
                }
                Ok(())
            }
            SceneAction::GroupsOn { groups } => {
                for group in groups {
                    self.host
                        .call_service("homeassistant", "turn_on", json!({"entity_id": group}))
                        .await?;
                }
                Ok(())
            }
            SceneAction::GroupsOff { groups } => {
                for group in groups {
                    self.host
                        .call_service("homeassistant", "turn_off", json!({"entity_id": group}))
                        .await?;
                }
                Ok(())
            }
            SceneAction::DeferredOff { group, delay_secs } => {
                tokio::time::sleep(Duration::from_secs(delay_secs)).await;
                self.host
                    .call_service("homeassistant", "turn_off", json!({"entity_id": group}))
                    .await?;
                match self.host.wait_state(&group, "off", CONFIRM_TIMEOUT).await {
                    Err(HostError::WaitTimeout { .. }) => {
                        error!("timed out waiting for {} to turn off", group);
                    }
                    other => other?,
                }
                Ok(())
            }
        }
    }
}

#[async_trait]
impl App for SceneDispatcher {
    fn name(&self) -> &str {
        &self.name
    }

    async fn initialize(&mut self) -> anyhow::Result<()> {
        let Some(light) = self.config.light.clone() else {
            anyhow::bail!("light not set in scene");
        };
        let Some(node_name) = self.config.node_name.clone() else {
            anyhow::bail!("node_name not set in scene");
        };
        let Some(object_id) = light.split('.').nth(1) else {
            anyhow::bail!("light '{}' is not a full entity id", light);
        };

        let scene_up_entity_id = format!("sensor.{}_scene_state_scene_001", object_id);
        let scene_down_entity_id = format!("sensor.{}_scene_state_scene_002", object_id);

        info!("Setting up scene triggers for {}", light);
        let handle = self
            .host
            .listen_state(&self.name, &scene_up_entity_id, "up", None)
            .await?;
        self.listen_handles.push(handle);
        let handle = self
            .host
            .listen_state(&self.name, &scene_down_entity_id, "down", None)
            .await?;
        self.listen_handles.push(handle);

        self.node_name = Some(node_name);
        Ok(())
    }

    async fn on_event(&mut self, event: AppEvent) {
        let AppEvent::StateChange {
            entity_id, tag, new, ..
        } = event
        else {
            return;
        };
        // Cleared or empty scene states carry no press.
        let Some(new) = new.filter(|state| !state.is_empty()) else {
            return;
        };
        let Ok(direction) = tag.parse::<Direction>() else {
            return;
        };
        self.dispatch(&entity_id, direction, &new).await;
    }

    async fn terminate(&mut self) {
        for handle in self.listen_handles.drain(..) {
            if let Err(e) = self.host.cancel_listen(handle).await {
                warn!("failed to cancel scene subscription: {}", e);
            }
        }
    }
}
