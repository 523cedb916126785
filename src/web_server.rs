use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    serve, Json, Router,
};
use futures::{sink::SinkExt, stream::StreamExt};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::Deserialize;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tower::ServiceBuilder;
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::config::{ApiConfig, ApiConfigUpdate, ApiType};
use crate::conversation::{ConfirmOutcome, ConversationEvent, ConversationHandler};
use crate::evaluator::EvaluatorService;
use crate::llm::LlmClient;
use crate::locale::Locale;
use crate::session::SessionRef;
use crate::store::FileSessionStore;

const EVENT_BUFFER: usize = 256;
// How long queued events may take to reach a closing socket
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    store: FileSessionStore,
    evaluator: Arc<EvaluatorService>,
    locale: Arc<Locale>,
    default_config: ApiConfig,
    threshold: f32,
    active: ActiveSessions,
}

impl AppState {
    pub fn new(
        store: FileSessionStore,
        evaluator: Arc<EvaluatorService>,
        locale: Arc<Locale>,
        default_config: ApiConfig,
        threshold: f32,
    ) -> Self {
        Self {
            templates: Arc::new(create_minijinja_env()),
            store,
            evaluator,
            locale,
            default_config,
            threshold,
            active: ActiveSessions::default(),
        }
    }

    pub fn active_sessions(&self) -> usize {
        self.active.len()
    }
}

/// Sessions held open by connections. The same session may be resumed by
/// more than one connection, so each entry counts its holders.
#[derive(Clone, Default)]
struct ActiveSessions(Arc<Mutex<HashMap<SessionRef, usize>>>);

impl ActiveSessions {
    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<SessionRef, usize>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn acquire(&self, session: SessionRef) {
        *self.lock().entry(session).or_insert(0) += 1;
    }

    /// Returns true when the last holder let go.
    fn release(&self, session: &SessionRef) -> bool {
        let mut active = self.lock();
        match active.get_mut(session) {
            Some(holders) if *holders > 1 => {
                *holders -= 1;
                false
            }
            Some(_) => {
                active.remove(session);
                true
            }
            None => true,
        }
    }

    fn len(&self) -> usize {
        self.lock().len()
    }
}

// Page templates are read from disk and reloaded when they change
fn create_minijinja_env() -> AutoReloader {
    AutoReloader::new(|notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader("templates"));
        notifier.watch_path("templates", true);
        Ok(env)
    })
}

/// Messages a client may send, `{"type": ..., "payload": {...}}`.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    ApiConfig {
        #[serde(default)]
        payload: ApiConfigUpdate,
    },
    StartSession {
        #[serde(default)]
        payload: StartSession,
    },
    UserResponse {
        #[serde(default)]
        payload: UserResponse,
    },
    UserConfirmation {
        #[serde(default)]
        payload: UserConfirmation,
    },
}

#[derive(Debug, Default, Deserialize)]
struct StartSession {
    session_id: Option<String>,
    user_id: Option<String>,
    name: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct UserResponse {
    #[serde(default)]
    answer: String,
}

#[derive(Debug, Default, Deserialize)]
struct UserConfirmation {
    #[serde(default)]
    confirm: bool,
}

async fn index_handler(State(state): State<AppState>) -> Result<Html<String>, (StatusCode, Html<String>)> {
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                tmpl.render(minijinja::context! {
                    title => "Easy-Prompt",
                    welcome => state.locale.t("WELCOME"),
                    lang => state.locale.language().code(),
                })
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, Html(format!("Internal Server Error: {}", e)))
        })
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    let config = &state.default_config;
    let gemini_configured = match config.api_type {
        ApiType::Gemini => config.is_configured(),
        ApiType::OpenAi => std::env::var("GOOGLE_API_KEY").map_or(false, |k| !k.trim().is_empty()),
    };
    let openai_configured = config.api_type == ApiType::OpenAi && config.is_configured();
    let openai_config = if config.api_type == ApiType::OpenAi {
        serde_json::to_value(config.masked()).unwrap_or_default()
    } else {
        serde_json::json!({})
    };
    Json(serde_json::json!({
        "current_api_type": config.api_type,
        "gemini_configured": gemini_configured,
        "openai_configured": openai_configured,
        "openai_config": openai_config,
        "active_sessions": state.active_sessions(),
        "language": state.locale.language().code(),
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New WebSocket connection established");
    let (mut sender, mut receiver) = socket.split();
    let (events_tx, mut events_rx) = mpsc::channel::<ConversationEvent>(EVENT_BUFFER);

    let mut writer = tokio::spawn(async move {
        while let Some(event) = events_rx.recv().await {
            match serde_json::to_string(&event) {
                Ok(json) => {
                    if sender.send(Message::Text(json)).await.is_err() {
                        warn!("WebSocket client disconnected or send error");
                        break;
                    }
                }
                Err(e) => error!("Failed to serialize event: {}", e),
            }
        }
        let _ = sender.close().await;
    });

    let mut connection = Connection::new(state, events_tx);
    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => {
                info!("Client requested WebSocket close");
                break;
            }
            Ok(Message::Binary(_)) => {
                warn!("Received unexpected binary message from client");
                continue;
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket receive error: {}", e);
                break;
            }
        };

        let message = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed client message");
                connection.emit(ConversationEvent::error(format!("invalid message: {e}"))).await;
                continue;
            }
        };
        match connection.dispatch(message).await {
            Ok(Flow::Continue) => {}
            Ok(Flow::Close) => break,
            Err(e) => {
                error!("Connection error: {:?}", e);
                connection.emit(ConversationEvent::error(e.to_string())).await;
            }
        }
    }

    connection.close();
    drop(connection);
    // Evaluation tasks may still hold the event sender; give the writer a moment, then stop it
    if tokio::time::timeout(FLUSH_TIMEOUT, &mut writer).await.is_err() {
        writer.abort();
    }
    info!("WebSocket connection closed");
}

#[derive(Debug, PartialEq, Eq)]
enum Flow {
    Continue,
    Close,
}

/// State of one WebSocket connection. Each connection carries its own API
/// configuration, seeded from the server defaults.
struct Connection {
    state: AppState,
    events: mpsc::Sender<ConversationEvent>,
    config: ApiConfig,
    client: Option<LlmClient>,
    handler: Option<ConversationHandler>,
}

impl Connection {
    fn new(state: AppState, events: mpsc::Sender<ConversationEvent>) -> Self {
        let config = state.default_config.clone();
        Self {
            state,
            events,
            config,
            client: None,
            handler: None,
        }
    }

    async fn emit(&self, event: ConversationEvent) {
        if self.events.send(event).await.is_err() {
            debug!("Event writer stopped");
        }
    }

    fn locale(&self) -> Arc<Locale> {
        self.state.locale.clone()
    }

    async fn dispatch(&mut self, message: ClientMessage) -> Result<Flow> {
        match message {
            ClientMessage::ApiConfig { payload } => self.configure(payload).await,
            ClientMessage::StartSession { payload } => {
                if self.handler.is_some() {
                    warn!("Session already started, ignoring start_session");
                    return Ok(Flow::Continue);
                }
                if self.client.is_none() {
                    match LlmClient::from_config(&self.config) {
                        Ok(client) => self.client = Some(client),
                        Err(e) => {
                            let message = self
                                .locale()
                                .t_with("DEFAULT_API_FAILED", minijinja::context! { error => e.to_string() });
                            self.emit(ConversationEvent::error(message)).await;
                            return Ok(Flow::Close);
                        }
                    }
                }
                self.start_session(payload).await
            }
            ClientMessage::UserResponse { payload } => {
                let locale = self.locale();
                let events = self.events.clone();
                let Some(handler) = self.handler.as_mut() else {
                    emit_to(&events, ConversationEvent::error(locale.t("ERROR_LLM_NOT_CONFIGURED"))).await;
                    return Ok(Flow::Continue);
                };
                emit_to(&events, ConversationEvent::system(locale.t("YOU_PROMPT"))).await;
                handler
                    .handle_message(&payload.answer, &events)
                    .await
                    .context("Failed to handle user response")?;
                Ok(Flow::Continue)
            }
            ClientMessage::UserConfirmation { payload } => {
                let locale = self.locale();
                let events = self.events.clone();
                let Some(handler) = self.handler.as_mut() else {
                    emit_to(&events, ConversationEvent::error(locale.t("ERROR_LLM_NOT_CONFIGURED"))).await;
                    return Ok(Flow::Continue);
                };
                let prompt_key = if payload.confirm { "AI_PROMPT" } else { "YOU_PROMPT" };
                emit_to(&events, ConversationEvent::system(locale.t(prompt_key))).await;
                let outcome = handler
                    .confirm(payload.confirm, &events)
                    .await
                    .context("Failed to handle confirmation")?;
                Ok(match outcome {
                    ConfirmOutcome::Completed { .. } => Flow::Close,
                    ConfirmOutcome::Continue | ConfirmOutcome::WriterFailed => Flow::Continue,
                })
            }
        }
    }

    async fn configure(&mut self, update: ApiConfigUpdate) -> Result<Flow> {
        let locale = self.locale();
        let mut config = self.config.clone();
        config.apply(update);
        let client = match LlmClient::from_config(&config) {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "Rejected API configuration");
                self.emit(ConversationEvent::ApiConfigResult {
                    success: false,
                    message: locale.t_with("API_CONFIG_FAILED", minijinja::context! { error => e.to_string() }),
                })
                .await;
                return Ok(Flow::Continue);
            }
        };

        let key = if self.client.is_some() { "API_RECONFIGURED" } else { "API_CONFIGURED" };
        info!(api_type = config.api_type.as_str(), model = %config.model, "API configured for connection");
        self.emit(ConversationEvent::ApiConfigResult {
            success: true,
            message: locale.t_with(key, minijinja::context! { api_type => config.api_type.as_str() }),
        })
        .await;
        if config.nsfw_mode {
            for key in [
                "NSFW_MODE_ACTIVE_WARNING_HEADER",
                "NSFW_MODE_ACTIVE_WARNING_FILTERS",
                "NSFW_MODE_ACTIVE_WARNING_CONTENT",
            ] {
                self.emit(ConversationEvent::system(locale.t(key))).await;
            }
        }
        self.config = config;
        self.client = Some(client);

        // A new client means a new session
        self.close();
        self.start_session(StartSession::default()).await
    }

    async fn start_session(&mut self, request: StartSession) -> Result<Flow> {
        let locale = self.locale();
        let Some(client) = self.client.clone() else {
            self.emit(ConversationEvent::error(locale.t("ERROR_LLM_NOT_CONFIGURED"))).await;
            return Ok(Flow::Continue);
        };
        let state = &self.state;

        let (mut handler, resumed) = match request.session_id {
            Some(id) => {
                let session_ref = SessionRef::new(id.clone(), request.user_id);
                match ConversationHandler::resume(
                    &session_ref,
                    state.store.clone(),
                    client,
                    state.evaluator.clone(),
                    locale.clone(),
                    state.threshold,
                )
                .await
                {
                    Ok(handler) => (handler, true),
                    Err(e) => {
                        warn!(session_id = %id, error = %e, "Cannot resume session");
                        self.emit(ConversationEvent::error(
                            locale.t_with("SESSION_NOT_FOUND", minijinja::context! { id => id }),
                        ))
                        .await;
                        return Ok(Flow::Continue);
                    }
                }
            }
            None => {
                let handler = ConversationHandler::create(
                    request.name,
                    request.user_id,
                    state.store.clone(),
                    client,
                    state.evaluator.clone(),
                    locale.clone(),
                    state.threshold,
                )
                .await
                .context("Failed to create session")?;
                (handler, false)
            }
        };

        let session = handler.session();
        self.state.active.acquire(session.session_ref());
        self.emit(ConversationEvent::SessionStarted {
            session_id: session.id.clone(),
            name: session.name.clone(),
            resumed,
        })
        .await;

        if resumed {
            let message = locale.t_with("SESSION_RESUMED", minijinja::context! { name => &session.name });
            self.emit(ConversationEvent::system(message)).await;
        } else {
            self.emit(ConversationEvent::system(locale.t("AI_PROMPT"))).await;
            handler
                .greet(&self.events)
                .await
                .context("Failed to send the greeting")?;
        }
        self.handler = Some(handler);
        Ok(Flow::Continue)
    }

    /// Drop the current session from the active registry. Evaluator
    /// bookkeeping is released only when no other connection holds it.
    fn close(&mut self) {
        if let Some(handler) = self.handler.take() {
            let session_ref = handler.session_ref();
            if self.state.active.release(&session_ref) {
                handler.close();
                info!(session_id = %session_ref.id, "Cleaned up session");
            } else {
                debug!(session_id = %session_ref.id, "Session still open on another connection");
            }
        }
    }
}

async fn emit_to(events: &mpsc::Sender<ConversationEvent>, event: ConversationEvent) {
    if events.send(event).await.is_err() {
        debug!("Event writer stopped");
    }
}

/// Build the application router.
pub fn app(state: AppState) -> Router {
    let static_files_service = ServeDir::new("static");

    Router::new()
        .route("/", get(index_handler))
        .route("/api/status", get(status_handler))
        .route("/ws/prompt", get(ws_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
}

/// Serve until `shutdown` resolves.
pub async fn start_web_server(
    host: &str,
    port: u16,
    state: AppState,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .with_context(|| format!("Invalid listen address {host}:{port}"))?;
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app(state).into_make_service())
        .with_graceful_shutdown(shutdown)
        .await
        .context("Web server failed")?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_sessions_count_holders() {
        let active = ActiveSessions::default();
        let session = SessionRef::new("s1".to_string(), None);
        active.acquire(session.clone());
        active.acquire(session.clone());
        assert_eq!(active.len(), 1);

        assert!(!active.release(&session));
        assert_eq!(active.len(), 1);
        assert!(active.release(&session));
        assert_eq!(active.len(), 0);
    }

    #[test]
    fn test_client_message_shapes() {
        let message: ClientMessage =
            serde_json::from_str(r#"{"type": "start_session", "payload": {"session_id": "abc"}}"#).unwrap();
        assert!(matches!(message, ClientMessage::StartSession { payload } if payload.session_id.as_deref() == Some("abc")));

        let message: ClientMessage = serde_json::from_str(r#"{"type": "user_confirmation"}"#).unwrap();
        assert!(matches!(message, ClientMessage::UserConfirmation { payload } if !payload.confirm));
    }
}
