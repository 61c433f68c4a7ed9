//! Optional MQTT mirror of each cycle's reading.
//!
//! There is no background task to keep the connection alive between cycles,
//! so the event loop is driven inline after each publish until the broker
//! acknowledges it (QoS 1) or the ack window passes. Failures are logged
//! and never reach the cycle. After any failure the client is rebuilt, so
//! unsent requests never pile up in its bounded queue.

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use serde::Serialize;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::MqttSection;

const ACK_WINDOW: Duration = Duration::from_secs(5);
const REQUEST_CAP: usize = 10;

#[derive(Debug, Serialize)]
pub struct ReadingMsg<'a> {
    pub ts: i64,
    pub zone: &'a str,
    pub temperature: i32,
    pub humidity: i32,
}

pub fn reading_topic(prefix: &str, zone: &str) -> String {
    format!("{prefix}/{zone}/reading")
}

pub struct MqttMirror {
    options: MqttOptions,
    client: AsyncClient,
    eventloop: EventLoop,
    prefix: String,
}

impl MqttMirror {
    pub fn new(mqtt: &MqttSection) -> Self {
        let mut options = MqttOptions::new(&mqtt.client_id, &mqtt.host, mqtt.port);
        options.set_keep_alive(Duration::from_secs(30));

        let (client, eventloop) = AsyncClient::new(options.clone(), REQUEST_CAP);
        info!(host = %mqtt.host, port = mqtt.port, prefix = %mqtt.topic_prefix, "mqtt mirror enabled");
        Self {
            options,
            client,
            eventloop,
            prefix: mqtt.topic_prefix.clone(),
        }
    }

    pub async fn publish_reading(&mut self, msg: &ReadingMsg<'_>) {
        let topic = reading_topic(&self.prefix, msg.zone);
        let payload = match serde_json::to_vec(msg) {
            Ok(p) => p,
            Err(e) => {
                warn!("cannot encode mirror payload: {e}");
                return;
            }
        };

        // Never blocks: a full or closed queue is an error, not a wait.
        if let Err(e) = self.client.try_publish(&topic, QoS::AtLeastOnce, false, payload) {
            warn!(%topic, "mirror publish error: {e}");
            self.reconnect();
            return;
        }

        match timeout(ACK_WINDOW, self.drive_until_acked()).await {
            Ok(Ok(())) => {
                info!(%topic, ts = msg.ts, "reading mirrored");
                return;
            }
            Ok(Err(e)) => warn!(%topic, "mqtt error: {e}"),
            Err(_) => warn!(%topic, "no PubAck within {}s", ACK_WINDOW.as_secs()),
        }
        self.reconnect();
    }

    /// Fresh client and event loop; whatever the old pair still held is dropped.
    fn reconnect(&mut self) {
        let (client, eventloop) = AsyncClient::new(self.options.clone(), REQUEST_CAP);
        self.client = client;
        self.eventloop = eventloop;
    }

    async fn drive_until_acked(&mut self) -> Result<(), rumqttc::ConnectionError> {
        loop {
            match self.eventloop.poll().await? {
                Event::Incoming(Packet::ConnAck(_)) => debug!("mirror connected to mqtt"),
                Event::Incoming(Packet::PubAck(_)) => return Ok(()),
                Event::Outgoing(Outgoing::Publish(pkid)) => debug!(pkid, "publish sent"),
                _ => {}
            }
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
