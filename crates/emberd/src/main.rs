use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::filter::LevelFilter;

use emberd::api;
use emberd::apps;
use emberd::apps::AppContext;
use emberd::config::Config;
use emberd::host::bridge::HostBridge;
use emberd::host::hass::HassClient;
use emberd::host::hass::WsHassClient;
use emberd::host::mqtt::MqttClient;
use emberd::host::mqtt::RumqttcClient;
use emberd::host::HostServices;

#[derive(Parser)]
#[command(name = "emberd", about = "Reactive home-automation app daemon")]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, default_value = "emberd.toml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = Config::from_file(&args.config)?;

    tracing_subscriber::fmt()
        .with_max_level(LevelFilter::from(config.logging.level))
        .init();

    tracing::info!("emberd starting");
    tracing::info!("Loaded config from: {}", args.config.display());

    // Connect to the automation host.
    let mut hass = WsHassClient::new(&config.host.url, &config.host.token);
    hass.connect().await?;
    tracing::info!("Connected to host at {}", config.host.url);

    // Optional direct broker connection for feedback publishes.
    let mqtt: Option<Box<dyn MqttClient>> = match &config.host.mqtt {
        Some(mqtt_config) => {
            let mut client = RumqttcClient::new(mqtt_config);
            client.connect().await?;
            tracing::info!(
                "Connected to broker at {}:{}",
                mqtt_config.broker,
                mqtt_config.port
            );
            Some(Box::new(client))
        }
        None => None,
    };

    let bridge = Arc::new(HostBridge::new(Box::new(hass), mqtt));
    let host: Arc<dyn HostServices> = bridge.clone();

    // Start every app instance the config calls for.
    let ctx = AppContext {
        config: &config,
        host,
    };
    let mut app_names = Vec::new();
    let mut app_tasks = Vec::new();
    for factory in apps::REGISTRY {
        let instances = match factory(&ctx) {
            Ok(instances) => instances,
            Err(e) => {
                tracing::error!("failed to set up app: {:#}", e);
                continue;
            }
        };
        for app in instances {
            let name = app.name().to_string();
            tracing::info!("Starting app: {}", name);
            let rx = bridge.register_app(&name);
            app_names.push(name);
            app_tasks.push(tokio::spawn(apps::run_app(app, rx)));
        }
    }
    tracing::info!("{} app(s) registered", app_names.len());

    // Status API, when configured.
    let (api_shutdown_tx, api_shutdown_rx) = tokio::sync::oneshot::channel();
    let api_task = config.api.clone().map(|api_config| {
        tokio::spawn(api::serve(
            api_config.listen,
            api_config.port,
            app_names.clone(),
            api_shutdown_rx,
        ))
    });

    tokio::select! {
        _ = bridge.run() => {
            tracing::warn!("host connection closed");
        }
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => tracing::info!("Received shutdown signal"),
                Err(e) => tracing::error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    }

    // Orderly teardown: closing the queues lets each app drain and cancel
    // its own handles in terminate().
    bridge.close_apps();
    for task in app_tasks {
        if let Err(e) = task.await {
            tracing::warn!("app task ended abnormally: {}", e);
        }
    }

    let _ = api_shutdown_tx.send(());
    if let Some(task) = api_task {
        match task.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => tracing::warn!("API server error: {}", e),
            Err(e) => tracing::warn!("API task ended abnormally: {}", e),
        }
    }

    tracing::info!("emberd shutdown complete");

    Ok(())
}
