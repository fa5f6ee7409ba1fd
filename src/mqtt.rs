use std::time::Duration;

use chrono::Utc;
use log::{debug, error, info, warn};
use rumqttc::{MqttOptions, QoS};
use serde_derive::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::{config, messages::PresenceEvent};

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    publisher_id: String,
    topic_path: String,
}

/// How long a clean disconnect may take before the event loop is dropped.
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

/// The spawned event loop, stopped through [`MqttClient::shutdown`].
#[derive(Debug)]
pub struct MqttTask {
    handle: JoinHandle<()>,
    cancel: CancellationToken,
}

#[derive(Debug, Serialize)]
struct DeviceMqttMessage {
    name: String,
    #[serde(rename = "id")]
    mac_address: String,
    confidence: u8,
    retained: bool,
    last_seen: i64,
    timestamp: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .clone()
            .unwrap_or_else(|| "kismet-presence".to_string());

        let mut mqttoptions = MqttOptions::new(
            publisher_id.clone(),
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                publisher_id,
                topic_path: config
                    .topic_path
                    .clone()
                    .unwrap_or_else(|| "presence".to_string()),
            },
            eventloop,
        )
    }

    /// Creates the client and drives its event loop on a separate task.
    ///
    /// The loop has its own token so it keeps flushing publishes and the final
    /// disconnect after the trackers have been cancelled.
    pub fn spawn(config: &config::MqttConfig) -> (Self, MqttTask) {
        let (client, eventloop) = Self::new(config);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(Self::event_loop(eventloop, cancel.clone()));
        (client, MqttTask { handle, cancel })
    }

    /// Keeps the connection alive; rumqttc only makes progress while polled.
    async fn event_loop(mut eventloop: rumqttc::EventLoop, cancel: CancellationToken) {
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                notification = eventloop.poll() => match notification {
                    Ok(rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_))) => {
                        debug!("Connection acknowledged");
                    }
                    Ok(rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        debug!("Disconnect sent");
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error polling MQTT event loop: {:?}", e);
                        // rumqttc reconnects on the next poll
                        tokio::select! {
                            () = cancel.cancelled() => break,
                            () = tokio::time::sleep(Duration::from_secs(1)) => {}
                        }
                    }
                },
            }
        }
        debug!("MQTT event loop stopped");
    }

    pub fn topic_for(&self, name: &str) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            self.publisher_id,
            sanitize_name(name)
        )
    }

    /// Queues a presence message without waiting for room in the request
    /// queue; a full queue (broker unreachable) is reported as an error.
    pub fn announce_device(&self, event: &PresenceEvent) -> anyhow::Result<()> {
        let confidence = if event.is_present() { 100 } else { 0 };
        info!(
            "Announcing device {} (confidence: {}) on MQTT",
            event.device, confidence
        );
        let message = DeviceMqttMessage {
            name: event.device.clone(),
            mac_address: event.address.to_string(),
            confidence,
            retained: false,
            last_seen: event.last_seen,
            timestamp: Utc::now().to_rfc3339(),
        };
        self.client.try_publish(
            self.topic_for(&event.device),
            QoS::AtMostOnce,
            false,
            serde_json::to_string(&message)?,
        )?;
        Ok(())
    }

    /// Sends a disconnect and waits for the event loop to flush it, giving up
    /// after [`DISCONNECT_GRACE`].
    pub async fn shutdown(&self, task: MqttTask) {
        debug!("Disconnecting MQTT client");
        let MqttTask { mut handle, cancel } = task;
        if let Err(err) = self.client.try_disconnect() {
            error!("Error disconnecting MQTT client: {:?}", err);
            cancel.cancel();
        }

        let joined = match tokio::time::timeout(DISCONNECT_GRACE, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                warn!("MQTT disconnect timed out");
                cancel.cancel();
                handle.await
            }
        };
        if let Err(err) = joined {
            error!("MQTT task failed: {:?}", err);
        }
    }
}

fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}
