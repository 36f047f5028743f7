use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::fs;

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct GatewayConfig {
    pub server: ServerConf,
    pub log: LogConf,
    pub mqtt: MqttConf,
    pub auth: AuthConf,
    pub devices: HashMap<String, DeviceConf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ServerConf {
    pub port: u16,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct LogConf {
    pub level: String,
    /// Dump complet des requêtes HTTP dans les logs (debug uniquement)
    pub dump_requests: bool,
}

impl Default for LogConf {
    fn default() -> Self {
        Self { level: "info".into(), dump_requests: false }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub client_id: Option<String>,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self { host: "localhost".into(), port: 1883, client_id: None }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct AuthConf {
    /// Clients OAuth2 autorisés (ex: le projet Actions on Google)
    pub clients: HashMap<String, ClientConf>,
    /// Comptes locaux pour la page de login
    pub users: HashMap<String, String>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct ClientConf {
    pub secret: String,
    pub redirect_uris: Vec<String>,
}

/// Déclaration d'un appareil : type/traits Google + topics MQTT + templates d'exécution
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct DeviceConf {
    #[serde(rename = "type")]
    pub device_type: String,
    #[serde(default)]
    pub traits: Vec<String>,
    /// Nom affiché dans l'app Google Home (par défaut : l'id)
    pub name: Option<String>,
    /// Topic où l'appareil publie son état
    pub state_topic: String,
    /// Topic où le gateway publie les commandes
    pub command_topic: String,
    /// Nom de commande -> template de payload, placeholders {param}
    #[serde(default)]
    pub executions: HashMap<String, String>,
}

pub fn parse_config(txt: &str) -> Result<GatewayConfig, serde_yaml::Error> {
    serde_yaml::from_str(txt)
}

pub async fn load_config() -> GatewayConfig {
    let path = std::env::var("FOYER_CONFIG").unwrap_or_else(|_| "foyer.yaml".into());
    if Path::new(&path).exists() {
        let txt = fs::read_to_string(&path).await.unwrap_or_default();
        if txt.trim().is_empty() {
            return GatewayConfig::default();
        }
        parse_config(&txt).unwrap_or_else(|e| {
            eprintln!("[gateway] config invalide: {e}");
            GatewayConfig::default()
        })
    } else {
        eprintln!("[gateway] pas de {path}, usage config par défaut");
        GatewayConfig::default()
    }
}

/// Init du logger global depuis le niveau configuré (RUST_LOG prioritaire)
pub fn init_logging(level: &str) {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .format_timestamp_secs()
        .init();
}
