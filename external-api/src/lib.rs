//! # Healthcheck, discovery & registration API
//!
//! This crate provides http api's for healthcheck, metrics, discovery and
//! server-side registration. It exposes the following endpoints:
//!
//! /health
//! /ping
//! /metrics
//! /metrics-text
//! /servers
//! /channels
//! /discovery/new-channel
//! /discovery/channels/:id
//! /load
//! /channels/:id
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::{Result, bail};
use axum::{Router, extract::Extension, routing};
use discovery_core::Registry;
use tokio::{net::TcpListener, sync::mpsc, task::JoinHandle};
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::{error, info, trace};

pub use crate::models::{ApiError, ErrorBody, Health, State};

/// Requests taking longer than this are answered with 408
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// The task runner for the [`ExternalApi`]
///
/// [`ExternalAPI`]: crate::ExternalApi
#[derive(Debug)]
pub struct ExternalApiGuard {
    task_handle: JoinHandle<()>,
}

impl Drop for ExternalApiGuard {
    fn drop(&mut self) {
        trace!("ExternalApiRunner drop called");
        self.task_handle.abort();
    }
}

/// Listens to relevant channels to gather information about
/// the running system and reports this data in an HTTP API
#[derive(Debug)]
pub struct ExternalApi {
    tx: mpsc::Sender<Health>,
    rx: mpsc::Receiver<Health>,
    addr: SocketAddr,
    state: State,
    registry: Arc<Registry>,
}

impl ExternalApi {
    /// Create a new ExternalApi instance
    pub fn new(addr: SocketAddr, registry: Arc<Registry>) -> Self {
        trace!("starting external api");
        let (tx, rx) = mpsc::channel(10);
        let state = models::blank_health();
        Self {
            tx,
            rx,
            addr,
            state,
            registry,
        }
    }

    /// clone the health sender channel
    pub fn sender(&self) -> mpsc::Sender<Health> {
        self.tx.clone()
    }

    /// Set the health
    pub async fn set_health(&self, health: Health) {
        *self.state.lock() = health;
    }

    /// Listen to Health changes over the channel
    async fn listen_status(&mut self) -> Result<()> {
        while let Some(health) = self.rx.recv().await {
            let mut guard = self.state.lock();
            if *guard != health {
                info!(%health, "health changed");
                *guard = health;
            }
        }
        info!("listen health exited-- nothing listening");
        Ok(())
    }

    /// Build the router serving every endpoint
    pub fn router(state: State, registry: Arc<Registry>) -> Router {
        Router::new()
            .route("/health", routing::get(handlers::ok))
            .route("/ping", routing::get(handlers::ping))
            .route("/metrics", routing::get(handlers::metrics))
            .route("/metrics-text", routing::get(handlers::metrics_text))
            .route("/servers", routing::get(handlers::servers))
            .route("/channels", routing::get(handlers::channels))
            .route(
                "/discovery/new-channel",
                routing::get(handlers::server_for_new_channel),
            )
            .route(
                "/discovery/channels/:id",
                routing::get(handlers::server_for_channel),
            )
            .route("/load", routing::put(handlers::update_load))
            .route(
                "/channels/:id",
                routing::post(handlers::create_channel)
                    .put(handlers::update_channel)
                    .delete(handlers::remove_channel),
            )
            .layer(Extension(state))
            .layer(Extension(registry))
            .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
            .layer(TraceLayer::new_for_http())
    }

    /// serve the HTTP external api
    async fn run(addr: SocketAddr, state: State, registry: Arc<Registry>) -> Result<()> {
        let tcp = TcpListener::bind(&addr).await?;
        let app = Self::router(state, registry);

        tracing::debug!("external API listening on {}", addr);

        axum::serve(tcp, app).await?;
        bail!("external API returned-- should not happen")
    }

    /// Kick off the HTTP service and start listening on all channels for
    /// changes
    pub fn start(mut self) -> JoinHandle<()> {
        let state = self.state.clone();
        let addr = self.addr;
        let registry = self.registry.clone();
        // if tx is not cloned, health listen will never update since ExternalApi is owner

        tokio::spawn(async move {
            if let Err(err) = tokio::try_join!(
                ExternalApi::run(addr, state, registry),
                self.listen_status()
            ) {
                error!(?err, "health task returning, this should not happen")
            }
        })
    }

    /// Start the `ExternalApiRunner`
    pub fn serve(self) -> ExternalApiGuard {
        ExternalApiGuard {
            task_handle: self.start(),
        }
    }
}

mod handlers {

    use std::sync::Arc;

    use axum::{
        Json,
        body::Body,
        extract::{Extension, Path},
        http::header,
        http::{Response, StatusCode},
        response::IntoResponse,
    };
    use discovery_core::{
        LoadUpdate, Registry, RegistryState, ServerDescriptor,
        metrics::{START_TIME, UPTIME},
    };
    use prometheus::{Encoder, ProtobufEncoder, TextEncoder};
    use tracing::{debug, error};

    use crate::models::{ApiResult, ChannelView, Health, ServerResult, State};

    pub(crate) async fn ok(
        Extension(state): Extension<State>,
        Extension(registry): Extension<Arc<Registry>>,
    ) -> ServerResult<impl IntoResponse> {
        let health = *state.lock();
        Ok(match (health, registry.state()) {
            (Health::Good, RegistryState::Active) => StatusCode::OK,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        })
    }

    pub(crate) async fn servers(
        Extension(registry): Extension<Arc<Registry>>,
    ) -> Json<Vec<ServerDescriptor>> {
        let servers = registry.cache().servers();
        Json(servers.iter().map(|s| ServerDescriptor::from(s.as_ref())).collect())
    }

    pub(crate) async fn channels(
        Extension(registry): Extension<Arc<Registry>>,
    ) -> Json<Vec<ChannelView>> {
        let channels = registry.cache().channels();
        Json(channels.iter().map(|c| ChannelView::from(c.as_ref())).collect())
    }

    pub(crate) async fn server_for_new_channel(
        Extension(registry): Extension<Arc<Registry>>,
    ) -> ApiResult<Json<ServerDescriptor>> {
        Ok(Json(registry.get_server_for_new_channel()?))
    }

    pub(crate) async fn server_for_channel(
        Extension(registry): Extension<Arc<Registry>>,
        Path(channel_id): Path<String>,
    ) -> ApiResult<Json<ServerDescriptor>> {
        Ok(Json(registry.get_server_for_channel(&channel_id).await?))
    }

    pub(crate) async fn update_load(
        Extension(registry): Extension<Arc<Registry>>,
        Json(load): Json<LoadUpdate>,
    ) -> ApiResult<StatusCode> {
        registry.update_load(load).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn create_channel(
        Extension(registry): Extension<Arc<Registry>>,
        Path(channel_id): Path<String>,
    ) -> ApiResult<impl IntoResponse> {
        registry.create_channel(&channel_id).await?;
        debug!(channel_id, "channel created over api");
        let view = ChannelView {
            channel_id,
            owner: registry.host().to_owned(),
            connections: 0,
            queued_connections: 0,
        };
        Ok((StatusCode::CREATED, Json(view)))
    }

    pub(crate) async fn update_channel(
        Extension(registry): Extension<Arc<Registry>>,
        Path(channel_id): Path<String>,
        Json(load): Json<LoadUpdate>,
    ) -> ApiResult<StatusCode> {
        registry.update_channel(&channel_id, load).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn remove_channel(
        Extension(registry): Extension<Arc<Registry>>,
        Path(channel_id): Path<String>,
    ) -> ApiResult<StatusCode> {
        registry.remove_channel(&channel_id).await?;
        Ok(StatusCode::NO_CONTENT)
    }

    pub(crate) async fn metrics() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = ProtobufEncoder::new();
        let mut buf = Vec::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error protobuf encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn metrics_text() -> ServerResult<impl IntoResponse> {
        UPTIME.set(START_TIME.elapsed().as_secs() as i64);
        let encoder = TextEncoder::new();
        let mut buf = String::new();
        let mf = prometheus::gather();
        let resp = Response::builder().header(header::CONTENT_TYPE, encoder.format_type());

        match encoder.encode_utf8(&mf, &mut buf) {
            Err(err) => {
                error!(?err, "error text encoding prometheus metrics");
                Ok(resp
                    .status(StatusCode::INTERNAL_SERVER_ERROR)
                    .body(Body::empty())?)
            }
            Ok(_) => Ok(resp.status(StatusCode::OK).body(Body::from(buf))?),
        }
    }

    pub(crate) async fn ping() -> impl IntoResponse {
        StatusCode::OK
    }
}

/// Various models for API responses
pub mod models {
    use axum::{
        Json,
        http::{HeaderValue, StatusCode, header},
        response::IntoResponse,
    };
    use discovery_core::{ChannelRecord, DiscoveryError};
    use parking_lot::Mutex;
    use serde::{Deserialize, Serialize};
    use std::{fmt, sync::Arc};

    /// Seconds a client is told to wait after a `RetryLater`
    pub const RETRY_AFTER_SECS: u64 = 1;

    /// The overall health of the system
    pub type State = Arc<Mutex<Health>>;
    /// Health is binary Good/Bad at the moment
    #[derive(Serialize, Deserialize, Debug, PartialEq, Copy, Clone, Eq)]
    #[serde(rename_all = "UPPERCASE")]
    pub enum Health {
        /// Report good health
        Good,
        /// Report bad health
        Bad,
    }

    impl fmt::Display for Health {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(
                f,
                "{}",
                match *self {
                    Health::Good => "GOOD",
                    Health::Bad => "BAD",
                }
            )
        }
    }

    pub(crate) fn blank_health() -> State {
        Arc::new(Mutex::new(Health::Bad))
    }

    /// Channel as reported by `/channels`
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct ChannelView {
        /// channel id
        pub channel_id: String,
        /// owning server host
        pub owner: String,
        /// current connections
        pub connections: u64,
        /// current queued connections
        pub queued_connections: u64,
    }

    impl From<&ChannelRecord> for ChannelView {
        fn from(record: &ChannelRecord) -> Self {
            Self {
                channel_id: record.channel_id.clone(),
                owner: record.owner.clone(),
                connections: record.connections,
                queued_connections: record.queued,
            }
        }
    }

    /// JSON body of every error response
    #[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
    pub struct ErrorBody {
        /// machine readable error kind
        pub error: String,
        /// human readable description
        pub message: String,
    }

    /// Discovery error rendered as an HTTP response
    #[derive(Debug)]
    pub struct ApiError(pub DiscoveryError);
    /// return discovery result
    pub type ApiResult<T> = Result<T, ApiError>;

    impl From<DiscoveryError> for ApiError {
        fn from(err: DiscoveryError) -> Self {
            Self(err)
        }
    }

    impl ApiError {
        /// status code and error kind for the wrapped error
        pub fn classify(&self) -> (StatusCode, &'static str) {
            match &self.0 {
                DiscoveryError::NoServersAvailable => {
                    (StatusCode::SERVICE_UNAVAILABLE, "no_servers_available")
                }
                DiscoveryError::RetryLater { .. } => (StatusCode::SERVICE_UNAVAILABLE, "retry_later"),
                DiscoveryError::OwnerUnavailable { .. } => (StatusCode::GONE, "owner_unavailable"),
                DiscoveryError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found"),
                DiscoveryError::AlreadyRegistered(_) => (StatusCode::CONFLICT, "already_registered"),
                DiscoveryError::AlreadyExists(_) => (StatusCode::CONFLICT, "already_exists"),
                DiscoveryError::NotOwner { .. } => (StatusCode::FORBIDDEN, "not_owner"),
                err if err.is_invalid_name() => (StatusCode::BAD_REQUEST, "invalid_name"),
                err if err.is_retryable() => (StatusCode::SERVICE_UNAVAILABLE, "unavailable"),
                DiscoveryError::CorruptRecord { .. } => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "corrupt_record")
                }
                DiscoveryError::Expired => (StatusCode::INTERNAL_SERVER_ERROR, "expired"),
                DiscoveryError::Coordination(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "coordination")
                }
            }
        }
    }

    impl IntoResponse for ApiError {
        fn into_response(self) -> axum::response::Response {
            let (status, kind) = self.classify();
            let body = ErrorBody {
                error: kind.to_owned(),
                message: self.0.to_string(),
            };
            let mut resp = (status, Json(body)).into_response();
            if matches!(self.0, DiscoveryError::RetryLater { .. }) {
                resp.headers_mut()
                    .insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
            }
            resp
        }
    }

    // error type
    /// Make our own error that wraps `anyhow::Error`.
    #[derive(Debug)]
    pub struct ServerError(anyhow::Error);
    /// return error result
    pub type ServerResult<T> = Result<T, ServerError>;

    impl IntoResponse for ServerError {
        fn into_response(self) -> axum::response::Response {
            (
                axum::http::StatusCode::INTERNAL_SERVER_ERROR,
                format!("{}", self.0),
            )
                .into_response()
        }
    }

    impl<E> From<E> for ServerError
    where
        E: Into<anyhow::Error>,
    {
        fn from(err: E) -> Self {
            Self(err.into())
        }
    }

}
