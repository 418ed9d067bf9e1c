//! MQTT publishing abstraction
//!
//! Session code talks to the broker through [`MqttPublish`] only, so it can
//! be exercised against a recording fake without a live broker.

use async_trait::async_trait;
use rumqttc::AsyncClient;

pub use rumqttc::QoS;

use crate::types::Result;

/// Outbound half of an MQTT connection
#[async_trait]
pub trait MqttPublish: Send + Sync {
    /// Publish a payload to `topic`
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()>;

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()>;

    /// Send a clean DISCONNECT to the broker
    async fn disconnect(&self) -> Result<()>;
}

#[async_trait]
impl MqttPublish for AsyncClient {
    async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> Result<()> {
        AsyncClient::publish(self, topic, qos, retain, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str, qos: QoS) -> Result<()> {
        AsyncClient::subscribe(self, topic, qos).await?;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        AsyncClient::disconnect(self).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Error;
    use rumqttc::MqttOptions;

    async fn publish_via_trait(client: &dyn MqttPublish) -> Result<()> {
        client
            .publish("homeassistant/light/icue2mqtt/Fan/state", b"{}".to_vec(), QoS::ExactlyOnce, true)
            .await
    }

    #[tokio::test]
    async fn test_async_client_queues_requests() {
        let (client, _eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        publish_via_trait(&client).await.unwrap();
        client.subscribe("homeassistant/light/icue2mqtt/Fan/set", QoS::AtLeastOnce).await.unwrap();
    }

    #[tokio::test]
    async fn test_async_client_fails_without_eventloop() {
        let (client, eventloop) = AsyncClient::new(MqttOptions::new("test", "localhost", 1883), 10);
        drop(eventloop);
        let err = publish_via_trait(&client).await.unwrap_err();
        assert!(matches!(err, Error::Client(_)));
    }
}
