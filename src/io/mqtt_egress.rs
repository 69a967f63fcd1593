//! MQTT publisher for ride state
//!
//! Publishes to the park broker:
//! - `<state_topic>` - ride state snapshots (QoS 1, not retained)
//! - `<status_topic>` - `online` / `offline` liveness (QoS 1, retained)
//!
//! The broker publishes `offline` on the status topic through the last will
//! if the controller disappears without a clean shutdown.

use crate::infra::config::Config;
use crate::io::egress_channel::{ControllerStatus, EgressMessage};
use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// MQTT publisher actor
///
/// Receives messages from the egress channel and publishes to MQTT topics.
pub struct MqttPublisher {
    client: AsyncClient,
    rx: mpsc::Receiver<EgressMessage>,
    state_topic: String,
    status_topic: String,
}

impl MqttPublisher {
    /// Create a new MQTT publisher
    ///
    /// Connects to the broker at the configured MQTT host/port.
    pub fn new(config: &Config, rx: mpsc::Receiver<EgressMessage>) -> Self {
        let state_topic = config.mqtt_state_topic().to_string();
        let status_topic = config.mqtt_status_topic().to_string();

        let mut mqttoptions =
            MqttOptions::new(config.mqtt_client_id(), config.mqtt_host(), config.mqtt_port());
        mqttoptions.set_keep_alive(Duration::from_secs(config.mqtt_keep_alive_secs()));
        mqttoptions.set_clean_session(true);
        mqttoptions.set_last_will(LastWill::new(
            &status_topic,
            ControllerStatus::Offline.as_str(),
            QoS::AtLeastOnce,
            true,
        ));

        // Set credentials if configured
        if let (Some(username), Some(password)) = (config.mqtt_username(), config.mqtt_password()) {
            mqttoptions.set_credentials(username, password);
        }

        let (client, eventloop) = AsyncClient::new(mqttoptions, 100);

        // Spawn the eventloop handler
        let announce_client = client.clone();
        let announce_topic = status_topic.clone();
        tokio::spawn(async move {
            let mut eventloop = eventloop;
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("mqtt_egress_connected");
                        // Re-announce after every (re)connect; the retained will may have fired
                        if let Err(e) = announce_client.try_publish(
                            &announce_topic,
                            QoS::AtLeastOnce,
                            true,
                            ControllerStatus::Online.as_str(),
                        ) {
                            warn!(error = %e, "mqtt_egress_online_failed");
                        }
                    }
                    Ok(Event::Incoming(Packet::PubAck(_))) => {
                        // QoS 1 acknowledgement received
                        debug!("mqtt_egress_puback");
                    }
                    Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                        info!("mqtt_egress_disconnected");
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "mqtt_egress_error");
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Self { client, rx, state_topic, status_topic }
    }

    /// Run the publisher loop
    ///
    /// Publishes messages until every sender is dropped, then disconnects.
    pub async fn run(mut self) {
        info!(state = %self.state_topic, status = %self.status_topic, "mqtt_egress_started");

        while let Some(msg) = self.rx.recv().await {
            self.publish_message(msg).await;
        }

        if let Err(e) = self.client.disconnect().await {
            debug!(error = %e, "mqtt_egress_disconnect_failed");
        }
        info!("mqtt_egress_shutdown");
    }

    async fn publish_message(&self, msg: EgressMessage) {
        match msg {
            EgressMessage::RideState(payload) => {
                // QoS 1 for state: the aggregator must not miss a transition
                if let Ok(json) = serde_json::to_string(&payload) {
                    if let Err(e) = self
                        .client
                        .publish(&self.state_topic, QoS::AtLeastOnce, false, json.as_bytes())
                        .await
                    {
                        error!(error = %e, "mqtt_egress_state_failed");
                    }
                }
            }
            EgressMessage::Status(status) => {
                if let Err(e) = self
                    .client
                    .publish(&self.status_topic, QoS::AtLeastOnce, true, status.as_str())
                    .await
                {
                    error!(error = %e, status = %status.as_str(), "mqtt_egress_status_failed");
                }
            }
        }
    }
}
