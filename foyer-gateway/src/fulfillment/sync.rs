use serde::Serialize;

use super::{Fulfillment, FulfillmentError};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    pub agent_user_id: String,
    pub devices: Vec<SyncDevice>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncDevice {
    pub id: String,
    #[serde(rename = "type")]
    pub device_type: String,
    pub traits: Vec<String>,
    pub name: DeviceName,
    pub will_report_state: bool,
}

#[derive(Debug, Serialize)]
pub struct DeviceName {
    pub name: String,
}

impl Fulfillment {
    /// SYNC : énumère les appareils du compte lié (mono-foyer : tout le registre)
    pub(super) fn sync(&self, request_id: &str, account: &str) -> Result<SyncPayload, FulfillmentError> {
        log::info!("handle sync request {request_id} for account {account}");

        let devices = self
            .registry
            .list_for_account(account)
            .into_iter()
            .map(|device| SyncDevice {
                id: device.id.clone(),
                device_type: device.device_type.clone(),
                traits: device.traits.clone(),
                name: DeviceName { name: device.name.clone() },
                // le gateway ne pousse pas d'états vers le cloud, il répond au QUERY
                will_report_state: false,
            })
            .collect();

        Ok(SyncPayload { agent_user_id: account.to_string(), devices })
    }
}
