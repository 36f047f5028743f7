use serde::Serialize;

use super::Fulfillment;

#[derive(Debug, Serialize)]
pub struct DisconnectResponse {}

impl Fulfillment {
    /// DISCONNECT : signale le délien du compte. Aucune interaction appareil ;
    /// la révocation des tokens appartient à la couche auth, pas à ce handler.
    pub(super) fn disconnect(&self, request_id: &str) -> DisconnectResponse {
        log::info!("handle disconnect request {request_id}");
        DisconnectResponse {}
    }
}
