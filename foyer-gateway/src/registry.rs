use crate::config::DeviceConf;
use std::collections::HashMap;

/// Appareil tel que vu par le fulfillment : métadonnées Google + topics MQTT
#[derive(Debug, Clone)]
pub struct Device {
    pub id: String,
    pub device_type: String,
    pub traits: Vec<String>,
    pub name: String,
    pub state_topic: String,
    pub command_topic: String,
    pub executions: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct DeviceRegistry {
    devices: HashMap<String, Device>, // "kitchen_light" -> Device
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self { devices: HashMap::new() }
    }

    /// Construit le registre depuis la section `devices` de la config
    pub fn from_config(devices: &HashMap<String, DeviceConf>) -> Self {
        let mut registry = Self::new();
        for (id, conf) in devices {
            let device = Device {
                id: id.clone(),
                device_type: conf.device_type.clone(),
                traits: conf.traits.clone(),
                name: conf.name.clone().unwrap_or_else(|| id.clone()),
                state_topic: conf.state_topic.clone(),
                command_topic: conf.command_topic.clone(),
                executions: conf.executions.clone(),
            };
            log::debug!("registered device {} ({})", device.id, device.device_type);
            registry.devices.insert(id.clone(), device);
        }
        registry
    }

    pub fn lookup(&self, device_id: &str) -> Option<&Device> {
        self.devices.get(device_id)
    }

    /// Appareils visibles par un compte lié. Le gateway est mono-foyer :
    /// tous les comptes voient tout le registre, trié par id.
    pub fn list_for_account(&self, _account: &str) -> Vec<&Device> {
        let mut list: Vec<&Device> = self.devices.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    /// Topics d'état à suivre côté MQTT (dédupliqués)
    pub fn state_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.devices.values().map(|d| d.state_topic.clone()).collect();
        topics.sort();
        topics.dedup();
        topics
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}
