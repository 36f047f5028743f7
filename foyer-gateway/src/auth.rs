/**
 * AUTH - Account linking OAuth2 du gateway
 *
 * RÔLE :
 * Porte d'entrée du lien de compte Google Home : pages login/confirmation,
 * endpoints authorize/token, et validation du bearer token sur /smarthome.
 *
 * FONCTIONNEMENT :
 * - /oauth/authorize vérifie le client et redirige vers /login
 * - /confirm valide les identifiants et émet un code d'autorisation (10 min)
 * - /oauth/token échange code -> access token (1h) + refresh token
 * - Middleware : Authorization: Bearer <token> -> identité de compte injectée
 *
 * Stockage en mémoire process : re-lier le compte après redémarrage suffit
 * pour un usage foyer, pas de persistance des tokens.
 */

use axum::extract::{Query, Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::{Form, Json};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use uuid::Uuid;

use crate::config::{AuthConf, ClientConf};
use crate::http::AppState;
use crate::state::{new_state, Shared};

const CODE_TTL: Duration = Duration::minutes(10);
const TOKEN_TTL: Duration = Duration::hours(1);

/// Identité de compte lié, injectée dans la requête par le middleware token
#[derive(Debug, Clone)]
pub struct Account {
    pub user: String,
}

#[derive(Debug, Clone)]
struct PendingCode {
    user: String,
    client_id: String,
    expires: OffsetDateTime,
}

#[derive(Debug, Clone)]
struct IssuedToken {
    user: String,
    expires: OffsetDateTime,
}

pub struct AuthGateway {
    conf: AuthConf,
    codes: Shared<HashMap<String, PendingCode>>,
    access_tokens: Shared<HashMap<String, IssuedToken>>,
    refresh_tokens: Shared<HashMap<String, String>>, // refresh -> user
}

pub type SharedAuth = Arc<AuthGateway>;

impl AuthGateway {
    pub fn new(conf: AuthConf) -> Self {
        Self {
            conf,
            codes: new_state(HashMap::new()),
            access_tokens: new_state(HashMap::new()),
            refresh_tokens: new_state(HashMap::new()),
        }
    }

    fn client(&self, client_id: &str) -> Option<&ClientConf> {
        self.conf.clients.get(client_id)
    }

    fn redirect_allowed(&self, client_id: &str, redirect_uri: &str) -> bool {
        self.client(client_id)
            .map(|c| c.redirect_uris.iter().any(|uri| uri == redirect_uri))
            .unwrap_or(false)
    }

    fn check_user(&self, username: &str, password: &str) -> bool {
        self.conf.users.get(username).map(|p| p == password).unwrap_or(false)
    }

    /// Émet un code d'autorisation à usage unique lié au client
    fn mint_code(&self, user: &str, client_id: &str) -> String {
        let code = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        let mut codes = self.codes.lock();
        codes.retain(|_, pending| pending.expires > now); // purge opportuniste
        codes.insert(
            code.clone(),
            PendingCode { user: user.to_string(), client_id: client_id.to_string(), expires: now + CODE_TTL },
        );
        code
    }

    /// Consomme un code vivant pour le bon client et émet les tokens
    fn exchange_code(&self, code: &str, client_id: &str) -> Option<TokenResponse> {
        let pending = self.codes.lock().remove(code)?;
        if pending.client_id != client_id || pending.expires <= OffsetDateTime::now_utc() {
            return None;
        }
        Some(self.mint_tokens(&pending.user))
    }

    fn mint_tokens(&self, user: &str) -> TokenResponse {
        let access = Uuid::new_v4().to_string();
        let refresh = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        {
            let mut tokens = self.access_tokens.lock();
            tokens.retain(|_, token| token.expires > now);
            tokens.insert(access.clone(), IssuedToken { user: user.to_string(), expires: now + TOKEN_TTL });
        }
        self.refresh_tokens.lock().insert(refresh.clone(), user.to_string());
        TokenResponse {
            access_token: access,
            token_type: "Bearer",
            expires_in: TOKEN_TTL.whole_seconds() as u64,
            refresh_token: Some(refresh),
        }
    }

    /// Nouvel access token contre un refresh token connu (le refresh reste valide)
    fn refresh_access(&self, refresh_token: &str) -> Option<TokenResponse> {
        let user = self.refresh_tokens.lock().get(refresh_token).cloned()?;
        let access = Uuid::new_v4().to_string();
        let now = OffsetDateTime::now_utc();
        self.access_tokens
            .lock()
            .insert(access.clone(), IssuedToken { user, expires: now + TOKEN_TTL });
        Some(TokenResponse {
            access_token: access,
            token_type: "Bearer",
            expires_in: TOKEN_TTL.whole_seconds() as u64,
            refresh_token: None,
        })
    }

    /// Compte associé à un access token vivant
    pub fn account_for(&self, token: &str) -> Option<Account> {
        let tokens = self.access_tokens.lock();
        let issued = tokens.get(token)?;
        if issued.expires <= OffsetDateTime::now_utc() {
            return None;
        }
        Some(Account { user: issued.user.clone() })
    }
}

// ============ ENDPOINTS ============

#[derive(Debug, Deserialize)]
pub struct AuthorizeParams {
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    state: String,
    response_type: String,
}

/// GET /oauth/authorize - point d'entrée du lien de compte
pub async fn authorize(State(app): State<AppState>, Query(params): Query<AuthorizeParams>) -> Response {
    if params.response_type != "code" {
        return oauth_error(StatusCode::BAD_REQUEST, "unsupported_response_type");
    }
    if !app.auth.redirect_allowed(&params.client_id, &params.redirect_uri) {
        log::warn!("authorize rejected for client {}", params.client_id);
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client");
    }

    let target = format!(
        "/login?client_id={}&redirect_uri={}&state={}",
        urlencoding::encode(&params.client_id),
        urlencoding::encode(&params.redirect_uri),
        urlencoding::encode(&params.state),
    );
    Redirect::to(&target).into_response()
}

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    state: String,
}

/// GET /login - formulaire de connexion, reporte le contexte OAuth en champs cachés
pub async fn login_page(Query(params): Query<LoginParams>) -> Html<String> {
    let page = include_str!("../templates/login.html")
        .replace("{{client_id}}", &escape(&params.client_id))
        .replace("{{redirect_uri}}", &escape(&params.redirect_uri))
        .replace("{{state}}", &escape(&params.state));
    Html(page)
}

#[derive(Debug, Deserialize)]
pub struct ConfirmForm {
    username: String,
    password: String,
    client_id: String,
    redirect_uri: String,
    #[serde(default)]
    state: String,
}

/// POST /confirm - valide les identifiants puis propose le retour vers le client
pub async fn confirm(State(app): State<AppState>, Form(form): Form<ConfirmForm>) -> Response {
    if !app.auth.check_user(&form.username, &form.password) {
        log::warn!("login refused for user {}", form.username);
        return (StatusCode::UNAUTHORIZED, Html(include_str!("../templates/login_failed.html").to_string()))
            .into_response();
    }
    if !app.auth.redirect_allowed(&form.client_id, &form.redirect_uri) {
        return oauth_error(StatusCode::BAD_REQUEST, "invalid_client");
    }

    let code = app.auth.mint_code(&form.username, &form.client_id);
    log::info!("issued authorization code for user {}", form.username);

    let redirect_url =
        format!("{}?code={}&state={}", form.redirect_uri, code, urlencoding::encode(&form.state));
    let page = include_str!("../templates/auth.html")
        .replace("{{user}}", &escape(&form.username))
        .replace("{{client_id}}", &escape(&form.client_id))
        .replace("{{redirect_url}}", &escape(&redirect_url));
    Html(page).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TokenForm {
    grant_type: String,
    client_id: String,
    client_secret: String,
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: &'static str,
    pub expires_in: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
}

/// POST /oauth/token - échange code ou refresh token contre un access token
pub async fn token(State(app): State<AppState>, Form(form): Form<TokenForm>) -> Response {
    let valid_secret = app
        .auth
        .client(&form.client_id)
        .map(|c| c.secret == form.client_secret)
        .unwrap_or(false);
    if !valid_secret {
        log::warn!("token request with bad client credentials ({})", form.client_id);
        return oauth_error(StatusCode::UNAUTHORIZED, "invalid_client");
    }

    match form.grant_type.as_str() {
        "authorization_code" => {
            let granted = form.code.and_then(|code| app.auth.exchange_code(&code, &form.client_id));
            match granted {
                Some(tokens) => Json(tokens).into_response(),
                None => oauth_error(StatusCode::BAD_REQUEST, "invalid_grant"),
            }
        }
        "refresh_token" => {
            let granted = form.refresh_token.and_then(|token| app.auth.refresh_access(&token));
            match granted {
                Some(tokens) => Json(tokens).into_response(),
                None => oauth_error(StatusCode::BAD_REQUEST, "invalid_grant"),
            }
        }
        other => {
            log::warn!("unsupported grant_type {other}");
            oauth_error(StatusCode::BAD_REQUEST, "unsupported_grant_type")
        }
    }
}

/// Middleware /smarthome : bearer token obligatoire, identité injectée en extension
pub async fn validate_token(
    State(app): State<AppState>,
    mut request: Request,
    next: Next,
) -> Result<Response, StatusCode> {
    let token = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(StatusCode::UNAUTHORIZED)?;

    let account = app.auth.account_for(token).ok_or_else(|| {
        log::warn!("rejected smarthome call with unknown or expired token");
        StatusCode::UNAUTHORIZED
    })?;

    request.extensions_mut().insert(account);
    Ok(next.run(request).await)
}

fn oauth_error(status: StatusCode, code: &'static str) -> Response {
    (status, Json(serde_json::json!({ "error": code }))).into_response()
}

fn escape(value: &str) -> String {
    value
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConf;

    fn gateway() -> AuthGateway {
        let mut conf = AuthConf::default();
        conf.clients.insert(
            "google-actions".to_string(),
            ClientConf {
                secret: "s3cret".to_string(),
                redirect_uris: vec!["https://oauth-redirect.googleusercontent.com/r/foyer".to_string()],
            },
        );
        conf.users.insert("mark".to_string(), "hunter2".to_string());
        AuthGateway::new(conf)
    }

    #[test]
    fn redirect_uri_must_be_registered() {
        let auth = gateway();
        assert!(auth.redirect_allowed("google-actions", "https://oauth-redirect.googleusercontent.com/r/foyer"));
        assert!(!auth.redirect_allowed("google-actions", "https://evil.example/callback"));
        assert!(!auth.redirect_allowed("unknown-client", "https://oauth-redirect.googleusercontent.com/r/foyer"));
    }

    #[test]
    fn full_link_flow_yields_usable_token() {
        let auth = gateway();
        assert!(auth.check_user("mark", "hunter2"));

        let code = auth.mint_code("mark", "google-actions");
        let tokens = auth.exchange_code(&code, "google-actions").unwrap();
        assert_eq!(tokens.token_type, "Bearer");
        assert!(tokens.refresh_token.is_some());

        let account = auth.account_for(&tokens.access_token).unwrap();
        assert_eq!(account.user, "mark");
    }

    #[test]
    fn authorization_code_is_single_use() {
        let auth = gateway();
        let code = auth.mint_code("mark", "google-actions");

        assert!(auth.exchange_code(&code, "google-actions").is_some());
        assert!(auth.exchange_code(&code, "google-actions").is_none());
    }

    #[test]
    fn code_is_bound_to_its_client() {
        let auth = gateway();
        let code = auth.mint_code("mark", "google-actions");
        assert!(auth.exchange_code(&code, "other-client").is_none());
    }

    #[test]
    fn expired_code_is_rejected() {
        let auth = gateway();
        let code = auth.mint_code("mark", "google-actions");
        auth.codes.lock().get_mut(&code).unwrap().expires = OffsetDateTime::now_utc() - Duration::seconds(1);

        assert!(auth.exchange_code(&code, "google-actions").is_none());
    }

    #[test]
    fn expired_access_token_is_rejected() {
        let auth = gateway();
        let tokens = auth.mint_tokens("mark");
        auth.access_tokens.lock().get_mut(&tokens.access_token).unwrap().expires =
            OffsetDateTime::now_utc() - Duration::seconds(1);

        assert!(auth.account_for(&tokens.access_token).is_none());
    }

    #[test]
    fn refresh_token_grants_new_access_token() {
        let auth = gateway();
        let tokens = auth.mint_tokens("mark");
        let refresh = tokens.refresh_token.unwrap();

        let renewed = auth.refresh_access(&refresh).unwrap();
        assert_ne!(renewed.access_token, tokens.access_token);
        assert!(renewed.refresh_token.is_none());
        assert_eq!(auth.account_for(&renewed.access_token).unwrap().user, "mark");

        assert!(auth.refresh_access("not-a-refresh-token").is_none());
    }

    #[test]
    fn bad_credentials_are_refused() {
        let auth = gateway();
        assert!(!auth.check_user("mark", "wrong"));
        assert!(!auth.check_user("ghost", "hunter2"));
    }

    #[test]
    fn escape_neutralizes_markup() {
        assert_eq!(escape(r#"<b>"x"</b>"#), "&lt;b&gt;&quot;x&quot;&lt;/b&gt;");
    }
}
