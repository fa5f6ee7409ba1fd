use std::path::PathBuf;

use anyhow::Context as _;
use clap::Parser;
use log::{debug, error, info};
use tokio_util::sync::CancellationToken;

mod config;
mod kismet;
mod manager;
mod messages;
mod mqtt;
mod notify;
mod presence;
mod tracker;

use notify::Notifier;

/// Watch Kismet for tracked devices and report when they leave or come back.
#[derive(Parser, Debug)]
#[command(version)]
struct Cli {
    /// Config file (TOML, or JSON when the extension is .json)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Kismet server URL, overrides the config file
    #[arg(long, env = "URL")]
    url: Option<String>,

    /// Kismet API key, overrides the config file
    #[arg(long, env = "API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, default_value = "info")]
    log_level: String,
}

fn init_logging(default_filter: &str) {
    let filter = std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.to_string());
    pretty_env_logger::formatted_timed_builder()
        .parse_filters(&filter)
        .init();
}

async fn shutdown_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                    () = cancel.cancelled() => return,
                }
            }
            Err(err) => {
                error!("Cannot listen for SIGTERM: {}", err);
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    () = cancel.cancelled() => return,
                }
            }
        }
    }
    #[cfg(not(unix))]
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        () = cancel.cancelled() => return,
    }

    info!("Shutting down");
    cancel.cancel();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config = config::AppConfig::load(&cli.config)?.with_overrides(cli.url, cli.api_key);
    config.validate().context("invalid configuration")?;

    debug!("Devices: {:?}", config.devices);

    let cancel = CancellationToken::new();
    let mut notifiers = Vec::new();
    if config.notify.console {
        notifiers.push(Notifier::Console);
    }
    if config.notify.desktop {
        notifiers.push(Notifier::Desktop);
    }
    let mqtt_link = config.mqtt.as_ref().map(|mqtt_config| {
        let (mqtt_client, mqtt_task) = mqtt::MqttClient::spawn(mqtt_config);
        notifiers.push(Notifier::Mqtt(mqtt_client.clone()));
        (mqtt_client, mqtt_task)
    });

    let fetcher = kismet::KismetClient::new(&config.kismet).context("building HTTP client")?;
    let core = manager::Manager::new(config, fetcher, notifiers);

    tokio::spawn(shutdown_signal(cancel.clone()));
    core.run_loop(cancel.clone()).await;
    cancel.cancel();

    // The event loop outlives the trackers so queued events and the
    // disconnect still reach the broker.
    if let Some((mqtt_client, mqtt_task)) = mqtt_link {
        mqtt_client.shutdown(mqtt_task).await;
    }
    info!("Exiting");

    Ok(())
}
