//! # MQTT Publisher
//!
//! [`BrokerPublisher`] on top of `rumqttc`. The publisher owns the client's
//! event loop and drives it inline, so a publish only returns once the
//! broker's acknowledgement (PUBACK for QoS 1, PUBCOMP for QoS 2) has been
//! seen.
//!
//! Connection handling: the publisher connects (and after a failure
//! reconnects) before it hands a message to the client, so nothing is ever
//! queued while the broker is unreachable. After any failure that happens
//! once a message was queued, the client and its event loop are rebuilt so a
//! stale copy of that message cannot be sent later alongside the retry.
//! Every connection-level failure is reported as transient so the forward
//! loop backs off instead of dropping data.

use std::collections::HashSet;
use std::time::Duration;

use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::time::Instant;

use crate::core::endpoints::BrokerPublisher;
use crate::core::errors::{PublishError, PublishResult};

/// Requests the client may queue. The publisher never has more than one
/// message in flight.
const REQUEST_CAPACITY: usize = 10;

/// Size on the wire of a QoS 1/2 PUBLISH packet: fixed header byte,
/// variable-length remaining length, topic length prefix, topic, packet id
/// and payload.
pub fn publish_packet_size(topic: &str, payload_len: usize) -> usize {
    let remaining = 2 + topic.len() + 2 + payload_len;
    let length_bytes = match remaining {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    };
    1 + length_bytes + remaining
}

/// # MQTT Publisher Options
#[derive(Debug, Clone)]
pub struct MqttPublisherOptions {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Delivery guarantee; QoS 0 cannot be acknowledged and is refused by the
    /// configuration layer.
    pub qos: QoS,
    pub keep_alive: Duration,
    /// Time allowed for connecting and, once the message is handed to the
    /// client, for seeing its acknowledgement.
    pub ack_timeout: Duration,
    /// Largest packet the broker accepts.
    pub max_packet_bytes: usize,
}

/// Parses the numeric QoS levels that can be acknowledged.
pub fn ack_qos(level: u8) -> Option<QoS> {
    match level {
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}

/// # MQTT Publisher
pub struct MqttPublisher {
    mqtt: MqttOptions,
    client: AsyncClient,
    eventloop: EventLoop,
    connected: bool,
    qos: QoS,
    ack_timeout: Duration,
    max_packet_bytes: usize,
}

impl MqttPublisher {
    /// Prepares the client. No network traffic happens until the first
    /// publish.
    pub fn new(options: MqttPublisherOptions) -> Self {
        let mut mqtt = MqttOptions::new(options.client_id, options.host, options.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(true);
        mqtt.set_max_packet_size(options.max_packet_bytes, options.max_packet_bytes);
        if let Some(username) = options.username {
            mqtt.set_credentials(username, options.password.unwrap_or_default());
        }

        let (client, eventloop) = AsyncClient::new(mqtt.clone(), REQUEST_CAPACITY);
        Self {
            mqtt,
            client,
            eventloop,
            connected: false,
            qos: options.qos,
            ack_timeout: options.ack_timeout,
            max_packet_bytes: options.max_packet_bytes,
        }
    }

    /// Whether the last connection attempt succeeded and has not failed since.
    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Sends DISCONNECT and gives the event loop a moment to flush it.
    pub async fn close(&mut self) {
        if !self.connected {
            return;
        }
        if let Err(e) = self.client.try_disconnect() {
            log::debug!("MQTT disconnect request failed: {}", e);
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Ok(Ok(Event::Outgoing(Outgoing::Disconnect))) => {
                    log::info!("Disconnected from MQTT broker");
                    break;
                }
                Ok(Ok(_)) => continue,
                Ok(Err(_)) | Err(_) => break,
            }
        }
        self.connected = false;
    }

    /// Drops the client, its request queue and the network connection.
    fn reset(&mut self) {
        let (client, eventloop) = AsyncClient::new(self.mqtt.clone(), REQUEST_CAPACITY);
        self.client = client;
        self.eventloop = eventloop;
        self.connected = false;
    }

    fn fail(&mut self, reason: String) -> PublishError {
        self.reset();
        PublishError::Transient(reason)
    }

    /// Polls the event loop until CONNACK. Nothing is queued at this point,
    /// so a failed attempt leaves the client reusable.
    async fn connect(&mut self, deadline: Instant) -> Result<(), PublishError> {
        while !self.connected {
            match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    return Err(PublishError::Transient(format!(
                        "no CONNACK from the broker within {:?}",
                        self.ack_timeout
                    )))
                }
                Ok(Err(e)) => return Err(PublishError::Transient(format!("MQTT connection error: {}", e))),
                Ok(Ok(Event::Incoming(Packet::ConnAck(ack)))) => {
                    log::info!("Connected to MQTT broker ({:?})", ack.code);
                    self.connected = true;
                }
                Ok(Ok(_)) => {}
            }
        }
        Ok(())
    }

    fn is_completion(&self, packet: &Packet) -> Option<u16> {
        match (self.qos, packet) {
            (QoS::AtLeastOnce, Packet::PubAck(ack)) => Some(ack.pkid),
            (QoS::ExactlyOnce, Packet::PubComp(comp)) => Some(comp.pkid),
            _ => None,
        }
    }
}

impl BrokerPublisher for MqttPublisher {
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> PublishResult {
        let size = publish_packet_size(topic, payload.len());
        if size > self.max_packet_bytes {
            return Err(PublishError::Permanent(format!(
                "message of {} bytes exceeds the {} byte packet limit",
                size, self.max_packet_bytes
            )));
        }

        let deadline = Instant::now() + self.ack_timeout;
        self.connect(deadline).await?;

        if let Err(e) = self.client.try_publish(topic, self.qos, false, payload.to_vec()) {
            return Err(self.fail(format!("MQTT client rejected the publish: {}", e)));
        }

        // Wait for every publish written since the request was queued.
        let deadline = Instant::now() + self.ack_timeout;
        let mut outstanding: HashSet<u16> = HashSet::new();
        let mut sent = false;

        loop {
            let event = match tokio::time::timeout_at(deadline, self.eventloop.poll()).await {
                Err(_) => {
                    return Err(self.fail(format!(
                        "no acknowledgement from the broker within {:?}",
                        self.ack_timeout
                    )))
                }
                Ok(Err(e)) => return Err(self.fail(format!("MQTT connection error: {}", e))),
                Ok(Ok(event)) => event,
            };

            match event {
                Event::Outgoing(Outgoing::Publish(pkid)) => {
                    outstanding.insert(pkid);
                    sent = true;
                }
                Event::Incoming(packet) => {
                    if let Some(pkid) = self.is_completion(&packet) {
                        outstanding.remove(&pkid);
                    }
                }
                Event::Outgoing(_) => {}
            }

            if sent && outstanding.is_empty() {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_acknowledged_qos_levels() {
        assert_eq!(ack_qos(0), None);
        assert_eq!(ack_qos(1), Some(QoS::AtLeastOnce));
        assert_eq!(ack_qos(2), Some(QoS::ExactlyOnce));
        assert_eq!(ack_qos(3), None);
    }

    #[tokio::test]
    async fn test_oversized_payload_is_permanent() {
        let mut publisher = MqttPublisher::new(MqttPublisherOptions {
            host: "127.0.0.1".to_string(),
            port: 1,
            client_id: "test".to_string(),
            username: None,
            password: None,
            qos: QoS::AtLeastOnce,
            keep_alive: Duration::from_secs(30),
            ack_timeout: Duration::from_millis(100),
            max_packet_bytes: 64,
        });

        let result = publisher.publish("Plant/Area", &[b'x'; 128]).await;
        assert!(matches!(result, Err(PublishError::Permanent(_))));
    }

    #[test]
    fn test_packet_size_counts_remaining_length_bytes() {
        // 2 + 5 + 2 + 100 = 109 remaining, one length byte.
        assert_eq!(publish_packet_size("Plant", 100), 1 + 1 + 109);
        // 16 384 remaining needs three length bytes.
        assert_eq!(publish_packet_size("Plant", 16_384 - 9), 1 + 3 + 16_384);
        // Past 2 MiB the length takes four bytes.
        let payload = 2_097_152;
        assert_eq!(publish_packet_size("Plant", payload), 1 + 4 + 2 + 5 + 2 + payload);
    }
}
