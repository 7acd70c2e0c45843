//! HTTP handlers for the Herald gateway.
//!
//! Publishers `POST /submit` a sealed batch of events; subscribers hold a
//! `GET /events` SSE stream opened with a sealed topic list. Tokens are
//! checked before anything is allocated for the request.

use crate::config::{Config, CorsConfig};
use crate::error::GatewayError;
use crate::metrics::{self, ConnectionMetricsGuard};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, DefaultBodyLimit, Query, State},
    http::{HeaderValue, Method, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Redirect,
    },
    routing::{get, post},
    Json, Router,
};
use futures_util::stream::{self, Stream};
use herald_core::{
    validate_topic_name, ConnectionHandle, ConnectionManager, DispatchReport, Event,
    EventDispatcher, TopicRegistry,
};
use herald_protocol::{Payload, TokenCodec};
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::collections::BTreeSet;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

/// Shared server state.
pub struct AppState {
    /// Live subscriber connections.
    pub connections: Arc<ConnectionManager>,
    /// Routes submitted events to subscriber queues.
    pub dispatcher: EventDispatcher,
    /// Seals and opens tokens.
    pub codec: TokenCodec,
    /// Server configuration.
    pub config: Config,
    /// Cancelled when the server shuts down; ends every open stream.
    pub shutdown: CancellationToken,
}

impl AppState {
    /// Create new app state.
    ///
    /// # Errors
    ///
    /// Returns an error if the configured token secret is unusable.
    pub fn new(config: Config, shutdown: CancellationToken) -> Result<Self> {
        let key = config.secret_key()?;
        let registry = Arc::new(TopicRegistry::new());
        let connections = Arc::new(ConnectionManager::with_config(
            Arc::clone(&registry),
            config.connection_config(),
        ));
        let dispatcher = EventDispatcher::new(registry, Arc::clone(&connections))
            .with_max_event_data_bytes(config.limits.max_event_data_bytes);

        Ok(Self {
            connections,
            dispatcher,
            codec: TokenCodec::new(key, config.token.ttl_secs),
            config,
            shutdown,
        })
    }

    fn topic_count(&self) -> usize {
        self.connections.registry().stats().topic_count
    }
}

/// Build the gateway router.
pub fn build_router(state: Arc<AppState>) -> Router {
    let body_limit = state.config.limits.max_submission_bytes;
    let cors = cors_layer(&state.config.cors);

    Router::new()
        .route("/submit", post(submit_handler))
        .route("/events", get(events_handler))
        .route("/token", get(token_handler))
        .route("/subscribe", get(subscribe_handler))
        .route("/ping", get(ping_handler))
        .route("/health", get(health_handler))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(config: &CorsConfig) -> CorsLayer {
    let layer = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers(Any);

    if config.allowed_origins.iter().any(|origin| origin == "*") {
        return layer.allow_origin(Any);
    }

    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|origin| match origin.parse() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();

    layer.allow_origin(AllowOrigin::list(origins))
}

/// Run the HTTP server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    let shutdown = CancellationToken::new();
    let state = Arc::new(AppState::new(config.clone(), shutdown.clone())?);

    // Start metrics server if enabled
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let app = build_router(Arc::clone(&state));

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!("Herald listening on {}", addr);
    info!("Event stream endpoint: {}/events", config.public_url());

    tokio::spawn(shutdown_signal(shutdown.clone()));

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    debug!(topics = ?state.connections.registry().topic_names(), "Closing remaining streams");
    let closed = state.connections.close_all();
    info!(closed, "Herald stopped");
    Ok(())
}

/// Cancel `token` on SIGINT or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }

    info!("Shutdown signal received, closing streams");
    token.cancel();
}

/// Liveness probe.
async fn ping_handler() -> StatusCode {
    StatusCode::OK
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "connections": state.connections.connection_count(),
        "topics": state.topic_count(),
    }))
}

/// Response body for an accepted submission.
#[derive(Debug, Serialize)]
struct SubmitResponse {
    accepted: usize,
    rejected: Vec<RejectedResponse>,
    deliveries: usize,
}

#[derive(Debug, Serialize)]
struct RejectedResponse {
    index: usize,
    reason: String,
}

impl From<DispatchReport> for SubmitResponse {
    fn from(report: DispatchReport) -> Self {
        Self {
            accepted: report.accepted,
            rejected: report
                .rejected
                .into_iter()
                .map(|r| RejectedResponse {
                    index: r.index,
                    reason: r.reason.to_string(),
                })
                .collect(),
            deliveries: report.deliveries,
        }
    }
}

/// `POST /submit`: the body is a submit token.
async fn submit_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Json<SubmitResponse>, GatewayError> {
    let token = std::str::from_utf8(&body).map_err(|_| GatewayError::InvalidToken)?;
    let submission = state.codec.decode_submit(token)?;

    let max = state.config.limits.max_events_per_submission;
    if submission.events.len() > max {
        return Err(GatewayError::TooManyEvents {
            count: submission.events.len(),
            max,
        });
    }

    let start = Instant::now();
    let report = state.dispatcher.dispatch(submission.events);
    metrics::record_dispatch(&report, start.elapsed().as_secs_f64());
    metrics::set_active_topics(state.topic_count());

    debug!(
        accepted = report.accepted,
        rejected = report.rejected.len(),
        deliveries = report.deliveries,
        dropped = report.dropped,
        "Dispatched submission"
    );

    Ok(Json(report.into()))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    token: Option<String>,
}

/// `GET /events?token=...`: open an SSE stream for the token's topics.
async fn events_handler(
    State(state): State<Arc<AppState>>,
    query: Result<Query<EventsQuery>, QueryRejection>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, GatewayError> {
    // Nothing about a malformed query is reported beyond "invalid".
    let Ok(Query(query)) = query else {
        return Err(GatewayError::InvalidToken);
    };
    let token = query.token.ok_or(GatewayError::InvalidToken)?;
    let subscription = state.codec.decode_subscribe(&token)?;

    let handle = state.connections.accept(subscription.topics)?;
    metrics::set_active_topics(state.topic_count());
    info!(
        connection = %handle.id(),
        topics = ?handle.topics(),
        "Event stream opened"
    );

    let stream = event_stream(handle, state.shutdown.clone(), ConnectionMetricsGuard::new());
    Ok(Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(state.config.keepalive())
            .text("keep-alive"),
    ))
}

/// Drain a connection's queue as SSE events until it closes or the server stops.
///
/// Dropping the stream drops the handle, which closes the connection.
fn event_stream(
    handle: ConnectionHandle,
    shutdown: CancellationToken,
    guard: ConnectionMetricsGuard,
) -> impl Stream<Item = Result<SseEvent, Infallible>> {
    stream::unfold(
        (handle, shutdown, guard),
        |(handle, shutdown, guard)| async move {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => None,
                event = handle.recv() => event,
            };

            match next {
                Some(event) => Some((Ok(to_sse_event(&event)), (handle, shutdown, guard))),
                None => {
                    debug!(
                        connection = %handle.id(),
                        age_ms = u64::try_from(handle.age().as_millis()).unwrap_or(u64::MAX),
                        dropped = handle.dropped(),
                        "Event stream ended"
                    );
                    None
                }
            }
        },
    )
}

fn to_sse_event(event: &Event) -> SseEvent {
    SseEvent::default()
        .event(&event.event)
        .data(normalize_newlines(&event.data))
}

/// SSE lines end at CR, LF or CRLF; only LF survives into `data:` lines.
fn normalize_newlines(data: &str) -> Cow<'_, str> {
    if data.contains('\r') {
        Cow::Owned(data.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(data)
    }
}

#[derive(Debug, Deserialize)]
struct TopicsQuery {
    topics: Option<String>,
}

/// A freshly issued subscribe token.
#[derive(Debug, Serialize)]
struct IssuedToken {
    token: String,
    url: String,
    expires_in: u32,
}

fn issue_token(state: &AppState, query: TopicsQuery) -> Result<IssuedToken, GatewayError> {
    let issuer = &state.config.issuer;
    if !issuer.enabled {
        return Err(GatewayError::IssuerDisabled);
    }

    let topics: BTreeSet<String> = query
        .topics
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|topic| !topic.is_empty())
        .map(str::to_string)
        .collect();

    if topics.is_empty() {
        return Err(GatewayError::BadTopics("no topics requested".to_string()));
    }
    let max = state.config.limits.max_topics_per_subscription;
    if topics.len() > max {
        return Err(GatewayError::BadTopics(format!(
            "{} topics requested (max {max})",
            topics.len()
        )));
    }
    for topic in &topics {
        validate_topic_name(topic)
            .map_err(|reason| GatewayError::BadTopics(format!("{topic}: {reason}")))?;
        if !issuer.allowed_topics.is_empty() && !issuer.allowed_topics.contains(topic) {
            return Err(GatewayError::TopicNotAllowed(topic.clone()));
        }
    }

    let token = state.codec.encode(&Payload::subscribe(topics))?;
    let url = format!("{}/events?token={}", state.config.public_url(), token);

    Ok(IssuedToken {
        token,
        url,
        expires_in: state.codec.ttl_secs(),
    })
}

/// `GET /token?topics=a,b`: issue a subscribe token.
async fn token_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopicsQuery>,
) -> Result<Json<IssuedToken>, GatewayError> {
    issue_token(&state, query).map(Json)
}

/// `GET /subscribe?topics=a,b`: redirect to a ready-made stream URL.
async fn subscribe_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TopicsQuery>,
) -> Result<Redirect, GatewayError> {
    let issued = issue_token(&state, query)?;
    Ok(Redirect::temporary(&issued.url))
}
