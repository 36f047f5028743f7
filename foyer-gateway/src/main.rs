/**
 * FOYER GATEWAY - Point d'entrée du serveur
 *
 * RÔLE : Orchestration des modules : config, auth, MQTT, fulfillment, HTTP.
 * Bootstrap complet avec gestion d'erreurs et logging.
 *
 * ARCHITECTURE : Fulfillment Google Smart Home traduit vers un bus MQTT local,
 * account linking OAuth2 en façade. Registre d'appareils statique chargé au
 * démarrage, état des appareils suivi par abonnement MQTT.
 */

mod auth;
mod config;
mod fulfillment;
mod http;
mod mqtt;
mod registry;
mod state;

use crate::auth::AuthGateway;
use crate::fulfillment::Fulfillment;
use crate::mqtt::MqttBridge;
use crate::registry::DeviceRegistry;

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

#[tokio::main]
async fn main() {
    // Charger les variables d'environnement depuis .env (si présent)
    dotenvy::dotenv().ok(); // Ok si .env n'existe pas

    let cfg = config::load_config().await;
    config::init_logging(&cfg.log.level);

    let registry = Arc::new(DeviceRegistry::from_config(&cfg.devices));
    log::info!("loaded {} devices from config", registry.len());
    if registry.is_empty() {
        log::warn!("no devices configured, SYNC will expose an empty home");
    }

    let auth = Arc::new(AuthGateway::new(cfg.auth.clone()));

    // Bridge MQTT partagé : commandes sortantes + cache des états entrants
    let bridge = MqttBridge::connect(&cfg.mqtt, registry.state_topics());
    let fulfillment = Arc::new(Fulfillment::new(Arc::new(bridge), registry));

    // fabrique l'état unique pour Axum
    let app_state = http::AppState { fulfillment, auth, dump_requests: cfg.log.dump_requests };
    let app = http::build_router(app_state);

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.server.port));
    let listener = match TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            log::error!("failed to bind {addr}: {e}");
            std::process::exit(1);
        }
    };
    log::info!("started server on http://{addr}");
    if let Err(e) = axum::serve(listener, app).await {
        log::error!("failure during execution: {e}");
    }
}
