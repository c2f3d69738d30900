//! Reactive apps hosted by the daemon.
//!
//! An app is a callback handler set over the host capability layer: it
//! registers subscriptions and timers during `initialize`, reacts to the
//! events they produce, and releases everything in `terminate`. Each app
//! instance runs on its own task and drains its queue serially, so no two
//! handlers of one instance ever overlap.

pub mod battery_watch;
pub mod scenes;

use std::sync::Arc;

use async_trait::async_trait;
use linkme::distributed_slice;
use tokio::sync::mpsc;
use tracing::error;

use crate::config::Config;
use crate::host::AppEvent;
use crate::host::HostServices;

/// Result type for app factory functions
pub type AppFactoryResult = anyhow::Result<Vec<Box<dyn App>>>;

pub struct AppContext<'a> {
    pub config: &'a Config,
    pub host: Arc<dyn HostServices>,
}

/// Factories contribute the app instances their config sections call for;
/// a factory whose section is absent contributes none.
#[distributed_slice]
pub static REGISTRY: [fn(&AppContext) -> AppFactoryResult];

#[async_trait]
pub trait App: Send + Sync {
    /// Instance name; also the routing key for its event queue
    fn name(&self) -> &str;

    /// Validate configuration and register subscriptions and timers
    ///
    /// An error aborts setup for this app only: nothing was registered and
    /// the instance stays idle.
    async fn initialize(&mut self) -> anyhow::Result<()>;

    /// Handle one event from the app's queue
    async fn on_event(&mut self, event: AppEvent);

    /// Release every subscription and timer obtained during setup
    async fn terminate(&mut self);
}

/// Drive one app instance to completion.
///
/// Runs until the bridge drops the queue sender, then tears the app down.
pub async fn run_app(mut app: Box<dyn App>, mut rx: mpsc::Receiver<AppEvent>) {
    if let Err(e) = app.initialize().await {
        error!("app '{}' setup failed: {:#}", app.name(), e);
    }

    while let Some(event) = rx.recv().await {
        app.on_event(event).await;
    }

    app.terminate().await;
}
