/**
 * BRIDGE MQTT - Liaison entre le fulfillment et le bus appareils
 *
 * RÔLE :
 * Publie les commandes rendues vers les topics des appareils et maintient
 * un cache last-state alimenté par abonnement aux topics d'état.
 *
 * FONCTIONNEMENT :
 * - Client rumqttc partagé + event loop dans une task dédiée
 * - Souscription aux topics d'état à chaque (re)connexion
 * - Chaque message reçu est décodé (JSON si possible) et cache par topic
 * - publish/last_state bornés par timeout, jamais bloquants pour une requête
 */

use crate::state::{new_state, Shared};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use tokio::task;
use tokio::time::timeout;

use crate::config::MqttConf;

const OP_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("mqtt session unavailable: {0}")]
    Disconnected(String),
    #[error("bridge operation timed out")]
    Timeout,
}

/// Contrat consommé par le fulfillment ; un stub le remplace dans les tests
#[async_trait]
pub trait MessageBridge: Send + Sync {
    /// Publie une commande sur le topic d'un appareil
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError>;
    /// Dernier état observé sur un topic (None = jamais vu)
    async fn last_state(&self, topic: &str) -> Result<Option<Value>, BridgeError>;
}

pub type StateCache = HashMap<String, Value>;

#[derive(Clone)]
pub struct MqttBridge {
    client: AsyncClient,
    states: Shared<StateCache>,
}

impl MqttBridge {
    /// Crée le client, lance l'event loop et suit les topics d'état donnés
    pub fn connect(cfg: &MqttConf, state_topics: Vec<String>) -> Self {
        let client_id = cfg.client_id.clone().unwrap_or_else(|| "foyer-gateway".into());
        let mut opts = MqttOptions::new(client_id, &cfg.host, cfg.port);
        opts.set_keep_alive(Duration::from_secs(15));

        let (client, mut eventloop) = AsyncClient::new(opts, 10);
        let states: Shared<StateCache> = new_state(HashMap::new());

        let loop_client = client.clone();
        let loop_states = states.clone();
        task::spawn(async move {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                        log::info!("mqtt connected, subscribing to {} state topics", state_topics.len());
                        for topic in &state_topics {
                            if let Err(e) = loop_client.subscribe(topic.as_str(), QoS::AtLeastOnce).await {
                                log::error!("subscribe {topic} failed: {e:?}");
                            }
                        }
                    }
                    Ok(Event::Incoming(Incoming::Publish(p))) => {
                        record_state(&loop_states, &p.topic, &p.payload);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::error!("mqtt error: {e:?}");
                        tokio::time::sleep(Duration::from_secs(2)).await;
                    }
                }
            }
        });

        Self { client, states }
    }
}

#[async_trait]
impl MessageBridge for MqttBridge {
    async fn publish(&self, topic: &str, payload: &str) -> Result<(), BridgeError> {
        match timeout(OP_TIMEOUT, self.client.publish(topic, QoS::AtLeastOnce, false, payload)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BridgeError::Disconnected(e.to_string())),
            Err(_) => Err(BridgeError::Timeout),
        }
    }

    async fn last_state(&self, topic: &str) -> Result<Option<Value>, BridgeError> {
        Ok(self.states.lock().get(topic).cloned())
    }
}

/// Met en cache le dernier payload d'un topic, décodé en JSON si possible
fn record_state(states: &Shared<StateCache>, topic: &str, payload: &[u8]) {
    let txt = String::from_utf8_lossy(payload);
    let value = serde_json::from_str::<Value>(&txt).unwrap_or_else(|_| Value::String(txt.into_owned()));
    log::debug!("state update on {topic}: {value}");
    states.lock().insert(topic.to_string(), value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_state_parses_json_payloads() {
        let states = new_state(HashMap::new());
        record_state(&states, "home/plug", br#"{"on": true, "power": 12.5}"#);

        let cached = states.lock().get("home/plug").cloned().unwrap();
        assert_eq!(cached["on"], Value::Bool(true));
        assert_eq!(cached["power"], serde_json::json!(12.5));
    }

    #[test]
    fn record_state_keeps_raw_text_when_not_json() {
        let states = new_state(HashMap::new());
        record_state(&states, "home/door", b"OPEN");

        let cached = states.lock().get("home/door").cloned().unwrap();
        assert_eq!(cached, Value::String("OPEN".into()));
    }

    #[test]
    fn record_state_overwrites_previous_value() {
        let states = new_state(HashMap::new());
        record_state(&states, "home/plug", br#"{"on": true}"#);
        record_state(&states, "home/plug", br#"{"on": false}"#);

        let cached = states.lock().get("home/plug").cloned().unwrap();
        assert_eq!(cached["on"], Value::Bool(false));
    }
}
