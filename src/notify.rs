//! Presence event sinks and the task that feeds them.

#[cfg(test)]
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, bail};
use chrono::{DateTime, Local};
use log::{debug, error};
use tokio::process::Command;
use tokio::sync::mpsc;

use crate::messages::{PresenceEvent, PresenceKind};
use crate::mqtt::MqttClient;

pub enum Notifier {
    Console,
    /// Desktop toast through `notify-send`, alerts only.
    Desktop,
    Mqtt(MqttClient),
    #[cfg(test)]
    Record(Arc<Mutex<Vec<PresenceEvent>>>),
}

impl Notifier {
    pub fn name(&self) -> &'static str {
        match self {
            Notifier::Console => "console",
            Notifier::Desktop => "desktop",
            Notifier::Mqtt(_) => "mqtt",
            #[cfg(test)]
            Notifier::Record(_) => "record",
        }
    }

    pub async fn notify(&self, event: &PresenceEvent) -> anyhow::Result<()> {
        match self {
            Notifier::Console => {
                println!("{}", console_line(event));
                Ok(())
            }
            Notifier::Desktop if event.is_alert() => desktop_notification(event).await,
            Notifier::Desktop => Ok(()),
            Notifier::Mqtt(client) => client.announce_device(event),
            #[cfg(test)]
            Notifier::Record(events) => {
                events.lock().unwrap().push(event.clone());
                Ok(())
            }
        }
    }
}

fn format_epoch(epoch: i64) -> String {
    DateTime::from_timestamp(epoch, 0)
        .map(|t| t.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| epoch.to_string())
}

pub fn console_line(event: &PresenceEvent) -> String {
    let seen = format_epoch(event.last_seen);
    let delta = event.delta.unwrap_or_default();
    match event.kind {
        PresenceKind::Initialized => format!("[{}] tracking, last seen {}", event.device, seen),
        PresenceKind::Updated => format!("[{}] last seen {} (+{}s)", event.device, seen, delta),
        PresenceKind::Gone => format!(
            "[{}] gone: silent for {}s (last seen {})",
            event.device, delta, seen
        ),
        PresenceKind::Back => format!("[{}] back after {}s", event.device, delta),
    }
}

fn desktop_summary(event: &PresenceEvent) -> String {
    match event.kind {
        PresenceKind::Back => format!("{} is back", event.device),
        _ => format!("{} is gone", event.device),
    }
}

async fn desktop_notification(event: &PresenceEvent) -> anyhow::Result<()> {
    let status = Command::new("notify-send")
        .arg("--app-name=kismet-presence")
        .arg(desktop_summary(event))
        .arg(console_line(event))
        .status()
        .await
        .context("running notify-send")?;
    if !status.success() {
        bail!("notify-send exited with {}", status);
    }
    Ok(())
}

/// Forwards every event to every sink until all senders are gone.
///
/// A failing sink is logged and skipped for that event; the others still
/// receive it.
pub struct Dispatcher {
    rx: mpsc::Receiver<PresenceEvent>,
    notifiers: Vec<Notifier>,
}

impl Dispatcher {
    pub fn new(rx: mpsc::Receiver<PresenceEvent>, notifiers: Vec<Notifier>) -> Self {
        Dispatcher { rx, notifiers }
    }

    pub async fn run(mut self) -> Vec<Notifier> {
        while let Some(event) = self.rx.recv().await {
            for notifier in &self.notifiers {
                if let Err(err) = notifier.notify(&event).await {
                    error!("{} notifier failed: {:#}", notifier.name(), err);
                }
            }
        }
        debug!("Event channel closed");
        self.notifiers
    }
}
