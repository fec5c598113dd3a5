use std::io;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use fable_core::credential::{SessionAuthenticator, DEFAULT_CREDENTIAL_TTL};
use fable_core::directory::{PrimaryAuth, SessionDirectory};
use fable_core::errors::RejectReason;
use fable_core::generate::{PersonaRef, ReplyGenerator};
use fable_core::history::HistoryStore;
use fable_core::ids::SessionId;

use crate::binder::{BindPolicy, SessionBinder};
use crate::channel::{self, ChannelSettings};
use crate::turns::TurnPipeline;

/// Header carrying the machine-readable reason for a refused upgrade.
pub const REJECT_REASON_HEADER: &str = "x-reject-reason";

#[derive(Clone, Debug)]
pub struct ServerConfig {
    /// 0 asks the OS for a free port; `ServerHandle::port` has the answer.
    pub port: u16,
    pub bind_policy: BindPolicy,
    /// Events queued per channel before sends are dropped.
    pub send_queue: usize,
    pub heartbeat_interval: Duration,
    /// Inbound silence tolerated before a channel is dropped.
    pub liveness_timeout: Duration,
    /// Accepted turn ids remembered per session for retransmit detection.
    pub dedup_window: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 8787,
            bind_policy: BindPolicy::Displace,
            send_queue: 256,
            heartbeat_interval: Duration::from_secs(30),
            liveness_timeout: Duration::from_secs(90),
            dedup_window: 128,
        }
    }
}

impl ServerConfig {
    fn channel_settings(&self) -> ChannelSettings {
        ChannelSettings {
            queue_capacity: self.send_queue,
            heartbeat_interval: self.heartbeat_interval,
            liveness_timeout: self.liveness_timeout,
        }
    }
}

/// External collaborators the server is wired with at startup.
pub struct Collaborators {
    pub authenticator: Arc<SessionAuthenticator>,
    pub primary_auth: Arc<dyn PrimaryAuth>,
    pub directory: Arc<dyn SessionDirectory>,
    pub history: Arc<dyn HistoryStore>,
    pub generator: Arc<dyn ReplyGenerator>,
}

#[derive(Clone)]
pub struct AppState {
    authenticator: Arc<SessionAuthenticator>,
    primary_auth: Arc<dyn PrimaryAuth>,
    directory: Arc<dyn SessionDirectory>,
    binder: Arc<SessionBinder>,
    turns: Arc<TurnPipeline>,
    settings: ChannelSettings,
    policy: BindPolicy,
}

impl AppState {
    pub fn new(config: &ServerConfig, collaborators: Collaborators) -> Self {
        let binder = Arc::new(SessionBinder::new(config.bind_policy, config.dedup_window));
        let turns = Arc::new(TurnPipeline::new(
            collaborators.generator,
            collaborators.history,
            Arc::clone(&collaborators.directory),
            Arc::clone(&binder),
        ));
        Self {
            authenticator: collaborators.authenticator,
            primary_auth: collaborators.primary_auth,
            directory: collaborators.directory,
            binder,
            turns,
            settings: config.channel_settings(),
            policy: config.bind_policy,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .route("/sessions", post(create_session_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

#[derive(Deserialize)]
struct ChannelParams {
    session_id: String,
    token: String,
}

/// Channel upgrade. Credential and ownership checks run before the upgrade
/// so a refused client gets an HTTP status plus `x-reject-reason` instead of
/// a socket that closes immediately.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ChannelParams>,
    State(state): State<AppState>,
) -> Response {
    let session_id = SessionId::from_raw(params.session_id);

    let claims = match state.authenticator.authenticate(&params.token, &session_id) {
        Ok(claims) => claims,
        Err(e) => {
            info!(session_id = %session_id, error = %e, "refusing channel upgrade");
            return reject(e.reject_reason());
        }
    };

    let Some(record) = state.directory.lookup(&session_id).await else {
        info!(session_id = %session_id, "refusing channel for an unknown session");
        return reject(RejectReason::SessionMismatch);
    };
    if record.principal_id != claims.principal_id {
        warn!(session_id = %session_id, "credential principal does not own the session");
        return reject(RejectReason::SessionMismatch);
    }

    if state.policy == BindPolicy::Reject && state.binder.is_bound(&session_id) {
        info!(session_id = %session_id, "session already bound, refusing upgrade");
        return reject(RejectReason::AlreadyBound);
    }

    let binder = Arc::clone(&state.binder);
    let turns = Arc::clone(&state.turns);
    let settings = state.settings;
    ws.on_upgrade(move |socket| channel::serve_channel(socket, session_id, binder, turns, settings))
}

fn reject(reason: RejectReason) -> Response {
    let status = match reason {
        RejectReason::Expired => StatusCode::UNAUTHORIZED,
        RejectReason::Malformed => StatusCode::BAD_REQUEST,
        RejectReason::SessionMismatch => StatusCode::FORBIDDEN,
        RejectReason::AlreadyBound => StatusCode::CONFLICT,
    };
    (status, [(REJECT_REASON_HEADER, reason.as_str())]).into_response()
}

async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "channels": state.binder.live_channels(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[derive(Deserialize)]
struct CreateSessionRequest {
    persona_id: String,
    persona_name: String,
}

#[derive(Serialize)]
struct CreateSessionResponse {
    session_id: SessionId,
    persona: PersonaRef,
    credential: String,
    expires_in_secs: u64,
}

/// Demo session mint: primary credential in, directory record plus channel
/// credential out. Production deployments put their own surface in front of
/// the same collaborators.
async fn create_session_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(request): Json<CreateSessionRequest>,
) -> Response {
    let token = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let Some(token) = token else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(serde_json::json!({ "error": "missing bearer token" })),
        )
            .into_response();
    };

    let principal = match state.primary_auth.verify(token).await {
        Ok(principal) => principal,
        Err(e) => {
            info!(error = %e, "session creation refused");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response();
        }
    };

    let persona = PersonaRef::new(request.persona_id, request.persona_name);
    let record = state.directory.create(&principal, persona).await;
    let credential = match state
        .authenticator
        .mint(&record.session_id, &principal, DEFAULT_CREDENTIAL_TTL)
    {
        Ok(credential) => credential,
        Err(e) => {
            warn!(error = %e, "failed to mint a channel credential");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": "credential minting failed" })),
            )
                .into_response();
        }
    };

    info!(session_id = %record.session_id, principal_id = %principal, "session created");
    (
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            session_id: record.session_id,
            persona: record.persona,
            credential,
            expires_in_secs: DEFAULT_CREDENTIAL_TTL.as_secs(),
        }),
    )
        .into_response()
}

/// Handle to a running server. Dropping it leaves the server running; the
/// task is detached.
pub struct ServerHandle {
    pub port: u16,
    _server: JoinHandle<()>,
}

pub async fn start(config: ServerConfig, collaborators: Collaborators) -> io::Result<ServerHandle> {
    let state = AppState::new(&config, collaborators);
    let router = build_router(state);

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    let port = listener.local_addr()?.port();
    info!(port, "server listening");

    let server = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, router).await {
            warn!(error = %e, "server stopped");
        }
    });

    Ok(ServerHandle {
        port,
        _server: server,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use secrecy::SecretString;

    use fable_core::directory::{MemoryDirectory, StaticPrimaryAuth};
    use fable_core::history::MemoryHistory;
    use fable_core::ids::PrincipalId;
    use fable_llm::ScriptedGenerator;

    fn test_collaborators() -> (Collaborators, Arc<SessionAuthenticator>) {
        let authenticator = Arc::new(SessionAuthenticator::new(SecretString::from(
            "server-test-key",
        )));
        let collaborators = Collaborators {
            authenticator: Arc::clone(&authenticator),
            primary_auth: Arc::new(StaticPrimaryAuth::single("reader-token", PrincipalId::new())),
            directory: Arc::new(MemoryDirectory::new()),
            history: Arc::new(MemoryHistory::new()),
            generator: Arc::new(ScriptedGenerator::new(vec![])),
        };
        (collaborators, authenticator)
    }

    async fn boot() -> (ServerHandle, Arc<SessionAuthenticator>) {
        let (collaborators, authenticator) = test_collaborators();
        let server = start(
            ServerConfig {
                port: 0,
                ..ServerConfig::default()
            },
            collaborators,
        )
        .await
        .unwrap();
        (server, authenticator)
    }

    #[tokio::test]
    async fn health_endpoint_reports_no_channels() {
        let (server, _) = boot().await;

        let body: serde_json::Value =
            reqwest::get(format!("http://127.0.0.1:{}/health", server.port))
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["channels"], 0);
    }

    #[tokio::test]
    async fn create_session_mints_a_verifiable_credential() {
        let (server, authenticator) = boot().await;

        let response = reqwest::Client::new()
            .post(format!("http://127.0.0.1:{}/sessions", server.port))
            .bearer_auth("reader-token")
            .json(&serde_json::json!({
                "persona_id": "bk_moby_dick",
                "persona_name": "Ishmael",
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), reqwest::StatusCode::CREATED);

        let body: serde_json::Value = response.json().await.unwrap();
        let session_id = SessionId::from_raw(body["session_id"].as_str().unwrap());
        let credential = body["credential"].as_str().unwrap();
        assert_eq!(body["persona"]["name"], "Ishmael");

        let claims = authenticator.authenticate(credential, &session_id).unwrap();
        assert_eq!(claims.session_id, session_id);
    }

    #[tokio::test]
    async fn create_session_refuses_bad_primary_credentials() {
        let (server, _) = boot().await;
        let client = reqwest::Client::new();
        let url = format!("http://127.0.0.1:{}/sessions", server.port);
        let body = serde_json::json!({ "persona_id": "bk_1", "persona_name": "Someone" });

        let missing = client.post(&url).json(&body).send().await.unwrap();
        assert_eq!(missing.status(), reqwest::StatusCode::UNAUTHORIZED);

        let wrong = client
            .post(&url)
            .bearer_auth("not-the-token")
            .json(&body)
            .send()
            .await
            .unwrap();
        assert_eq!(wrong.status(), reqwest::StatusCode::UNAUTHORIZED);
    }
}
