/**
 * FULFILLMENT - Dispatcher d'intents Google Smart Home
 *
 * RÔLE :
 * Reçoit une requête de fulfillment (un intent par requête), la route vers
 * le handler correspondant et assemble la réponse protocolaire.
 *
 * FONCTIONNEMENT :
 * - Parse du corps brut en FulfillmentRequest (400 si illisible ou vide)
 * - Dispatch sur l'intent : SYNC / QUERY / EXECUTE / DISCONNECT
 * - Les handlers consultent le registre d'appareils et le bridge MQTT
 * - Les erreurs par appareil restent dans la réponse 200 (convention Google)
 *
 * UTILITÉ DANS FOYER :
 * 🎯 Point d'entrée unique du protocole : POST /smarthome/fulfillment
 * 🎯 Sans état entre requêtes : registre + bridge injectés à la construction
 */

use crate::mqtt::MessageBridge;
use crate::registry::DeviceRegistry;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

use crate::auth::Account;
use crate::http::AppState;

mod disconnect;
mod execute;
mod query;
mod sync;

pub use disconnect::DisconnectResponse;
pub use execute::{CommandResult, ExecuteResponsePayload};
pub use query::{DeviceStateView, QueryResponsePayload};
pub use sync::{DeviceName, SyncDevice, SyncPayload};

#[derive(Debug, thiserror::Error)]
pub enum FulfillmentError {
    #[error("malformed fulfillment request: {0}")]
    MalformedRequest(String),
    #[error("unsupported intent: {0}")]
    UnsupportedIntent(String),
    #[error("device registry unavailable")]
    RegistryUnavailable,
}

impl FulfillmentError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MalformedRequest(_) | Self::UnsupportedIntent(_) => StatusCode::BAD_REQUEST,
            Self::RegistryUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

// ============ MODÈLE WIRE (requêtes) ============

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentRequest {
    pub request_id: String,
    #[serde(default)]
    pub inputs: Vec<IntentInput>,
}

/// Intent tel que reçu : tag brut + payload encore non typé.
/// Le tag est matché avant de typer le payload, pour distinguer un intent
/// inconnu (UnsupportedIntent) d'un payload invalide (MalformedRequest).
#[derive(Debug, Deserialize)]
pub struct IntentInput {
    pub intent: String,
    #[serde(default)]
    pub payload: Value,
}

#[derive(Debug, Deserialize)]
pub struct QueryPayload {
    pub devices: Vec<DeviceRef>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceRef {
    pub id: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecutePayload {
    pub commands: Vec<CommandGroup>,
}

#[derive(Debug, Deserialize)]
pub struct CommandGroup {
    pub devices: Vec<DeviceRef>,
    pub execution: Vec<Command>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Command {
    #[serde(alias = "command")]
    pub name: String,
    #[serde(default)]
    pub params: serde_json::Map<String, Value>,
}

#[derive(Debug)]
pub enum Intent {
    Sync,
    Query(QueryPayload),
    Execute(ExecutePayload),
    Disconnect,
}

fn parse_intent(input: &IntentInput) -> Result<Intent, FulfillmentError> {
    match input.intent.as_str() {
        "action.devices.SYNC" => Ok(Intent::Sync),
        "action.devices.QUERY" => {
            let payload = serde_json::from_value(input.payload.clone())
                .map_err(|e| FulfillmentError::MalformedRequest(format!("bad QUERY payload: {e}")))?;
            Ok(Intent::Query(payload))
        }
        "action.devices.EXECUTE" => {
            let payload = serde_json::from_value(input.payload.clone())
                .map_err(|e| FulfillmentError::MalformedRequest(format!("bad EXECUTE payload: {e}")))?;
            Ok(Intent::Execute(payload))
        }
        "action.devices.DISCONNECT" => Ok(Intent::Disconnect),
        other => Err(FulfillmentError::UnsupportedIntent(other.to_string())),
    }
}

// ============ MODÈLE WIRE (réponses) ============

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FulfillmentResponse {
    pub request_id: String,
    pub payload: ResponsePayload,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum ResponsePayload {
    Sync(SyncPayload),
    Query(QueryResponsePayload),
    Execute(ExecuteResponsePayload),
    Disconnect(DisconnectResponse),
}

// ============ DISPATCHER ============

pub struct Fulfillment {
    registry: Arc<DeviceRegistry>,
    bridge: Arc<dyn MessageBridge>,
}

impl Fulfillment {
    pub fn new(bridge: Arc<dyn MessageBridge>, registry: Arc<DeviceRegistry>) -> Self {
        Self { registry, bridge }
    }

    /// Traite une requête de fulfillment complète pour un compte lié.
    /// Seul le premier intent est traité (un seul par requête dans le protocole observé).
    pub async fn handle(&self, account: &str, body: &str) -> Result<FulfillmentResponse, FulfillmentError> {
        let request: FulfillmentRequest =
            serde_json::from_str(body).map_err(|e| FulfillmentError::MalformedRequest(e.to_string()))?;

        let input = request
            .inputs
            .first()
            .ok_or_else(|| FulfillmentError::MalformedRequest("no inputs".into()))?;
        log::debug!("dispatch request {}: {} {}", request.request_id, input.intent, input.payload);

        let payload = match parse_intent(input)? {
            Intent::Sync => ResponsePayload::Sync(self.sync(&request.request_id, account)?),
            Intent::Query(p) => ResponsePayload::Query(self.query(&request.request_id, p).await),
            Intent::Execute(p) => ResponsePayload::Execute(self.execute(&request.request_id, p).await),
            Intent::Disconnect => ResponsePayload::Disconnect(self.disconnect(&request.request_id)),
        };

        Ok(FulfillmentResponse { request_id: request.request_id, payload })
    }
}

// ============ ENDPOINT ============

/// POST /smarthome/fulfillment - corps brut, compte injecté par le middleware token
pub async fn fulfillment_endpoint(
    State(app): State<AppState>,
    Extension(account): Extension<Account>,
    body: String,
) -> Response {
    match app.fulfillment.handle(&account.user, &body).await {
        Ok(response) => (StatusCode::OK, Json(response)).into_response(),
        Err(e) => {
            log::warn!("fulfillment rejected: {e}");
            (e.status(), Json(serde_json::json!({ "error": e.to_string() }))).into_response()
        }
    }
}

// ============ OUTILS DE TEST ============
