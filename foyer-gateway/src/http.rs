/**
 * HTTP - Routeur Axum du gateway
 *
 * RÔLE :
 * Assemble les routes : pages account linking, endpoints OAuth2 et
 * la route fulfillment protégée par le middleware bearer token.
 *
 * ROUTES :
 * - GET  /health               : liveness, jamais authentifié
 * - GET  /login, POST /confirm : pages de lien de compte
 * - GET  /oauth/authorize, POST /oauth/token
 * - POST /smarthome/fulfillment : token obligatoire (middleware auth)
 */

use axum::body::{to_bytes, Body};
use axum::extract::{Request, State};
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::routing::{get, post};
use axum::Router;
use std::sync::Arc;

use crate::auth::{self, SharedAuth};
use crate::fulfillment::{self, Fulfillment};

#[derive(Clone)]
pub struct AppState {
    pub fulfillment: Arc<Fulfillment>,
    pub auth: SharedAuth,
    pub dump_requests: bool,
}

pub fn build_router(app_state: AppState) -> Router {
    let smarthome = Router::new()
        .route("/fulfillment", post(fulfillment::fulfillment_endpoint))
        .layer(middleware::from_fn_with_state(app_state.clone(), auth::validate_token));

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/login", get(auth::login_page))
        .route("/confirm", post(auth::confirm))
        .route("/oauth/authorize", get(auth::authorize))
        .route("/oauth/token", post(auth::token))
        .nest("/smarthome", smarthome)
        .layer(middleware::from_fn_with_state(app_state.clone(), log_requests))
        .with_state(app_state)
}

/// Trace chaque requête ; avec log.dump_requests le corps complet part en log
/// (le corps est rebufferisé, réservé au debug)
async fn log_requests(State(app): State<AppState>, request: Request, next: Next) -> Response {
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let request = if app.dump_requests {
        let (parts, body) = request.into_parts();
        let bytes = to_bytes(body, usize::MAX).await.unwrap_or_default();
        log::info!("> {method} {path} {}", String::from_utf8_lossy(&bytes));
        Request::from_parts(parts, Body::from(bytes))
    } else {
        log::debug!("> {method} {path}");
        request
    };

    let response = next.run(request).await;
    log::debug!("< {} {method} {path}", response.status());
    response
}
