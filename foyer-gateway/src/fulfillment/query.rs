use serde::Serialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio::time::timeout;

use super::{Fulfillment, QueryPayload};
use crate::mqtt::{BridgeError, MessageBridge};

/// Timeout indépendant par appareil : borne la latence totale du QUERY
/// quel que soit le nombre d'appareils demandés
const DEVICE_TIMEOUT: Duration = Duration::from_secs(3);

#[derive(Debug, Serialize)]
pub struct QueryResponsePayload {
    pub devices: HashMap<String, DeviceStateView>,
}

/// État d'un appareil tel que renvoyé au cloud : statut + état rapporté à plat
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceStateView {
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<&'static str>,
    #[serde(flatten)]
    pub state: Map<String, Value>,
}

impl DeviceStateView {
    fn success(reported: Value) -> Self {
        let state = match reported {
            Value::Object(map) => map,
            // payload non-objet (ex: "OPEN") rapporté sous une clé unique
            other => Map::from_iter([("state".to_string(), other)]),
        };
        Self { status: "SUCCESS", online: Some(true), error_code: None, state }
    }

    fn offline() -> Self {
        Self { status: "OFFLINE", online: Some(false), error_code: None, state: Map::new() }
    }

    fn error(code: &'static str) -> Self {
        Self { status: "ERROR", online: None, error_code: Some(code), state: Map::new() }
    }
}

impl Fulfillment {
    /// QUERY : last-state par appareil, lookups concurrents, échecs isolés.
    /// La réponse contient exactement les ids demandés, y compris les inconnus.
    pub(super) async fn query(&self, request_id: &str, payload: QueryPayload) -> QueryResponsePayload {
        log::info!("handle query request {request_id} ({} devices)", payload.devices.len());

        let mut devices: HashMap<String, DeviceStateView> = HashMap::new();
        let mut set = JoinSet::new();

        for device_ref in &payload.devices {
            let id = device_ref.id.clone();
            match self.registry.lookup(&id) {
                None => {
                    devices.insert(id, DeviceStateView::error("deviceNotFound"));
                }
                Some(device) => {
                    // résultat par défaut, écrasé quand la task aboutit
                    devices.insert(id.clone(), DeviceStateView::error("transientError"));
                    let bridge = self.bridge.clone();
                    let topic = device.state_topic.clone();
                    set.spawn(async move {
                        let view = query_device(bridge, &topic).await;
                        (id, view)
                    });
                }
            }
        }

        while let Some(joined) = set.join_next().await {
            if let Ok((id, view)) = joined {
                devices.insert(id, view);
            }
        }

        QueryResponsePayload { devices }
    }
}

async fn query_device(bridge: Arc<dyn MessageBridge>, topic: &str) -> DeviceStateView {
    match timeout(DEVICE_TIMEOUT, bridge.last_state(topic)).await {
        Err(_) | Ok(Err(BridgeError::Timeout)) => DeviceStateView::error("timeout"),
        Ok(Err(BridgeError::Disconnected(_))) => DeviceStateView::error("transientError"),
        Ok(Ok(None)) => DeviceStateView::offline(),
        Ok(Ok(Some(state))) => DeviceStateView::success(state),
    }
}
