pub mod api;
pub mod apps;
pub mod config;
pub mod host;

pub use config::Config;
pub use config::ConfigError;
pub use config::LogLevel;
pub use host::bridge::HostBridge;
pub use host::AppEvent;
pub use host::EntityState;
pub use host::HostServices;
