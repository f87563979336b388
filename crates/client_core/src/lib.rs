//! Client-side core for the dispatch monitor.
//!
//! Owns the live view of active trips: one authoritative snapshot fetched
//! over HTTP, then incremental updates streamed over the push channel, both
//! funneled into the [`TripStateReconciler`]. Rendering front-ends observe
//! the result through [`DispatchMonitor::snapshot`] and the broadcast event
//! channel; they never touch the reconciler directly.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{Trip, TripId},
    error::{ApiError, ApiException},
    protocol::{DispatchEvent, SnapshotResponse, TripRecord},
};
use tokio::{
    sync::{broadcast, Mutex, RwLock},
    task::JoinHandle,
};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

pub mod reconciler;

pub use reconciler::{ApplyOutcome, SnapshotError, TripStateReconciler};

/// Notifications emitted to observers as the in-memory state evolves.
#[derive(Debug, Clone)]
pub enum MonitorEvent {
    /// A full snapshot replaced the mapping.
    SnapshotLoaded { trips: usize },
    /// A push event mutated the mapping.
    Updated(DispatchEvent),
    /// A push event referenced something outside the loaded window.
    Ignored(DispatchEvent),
    /// The push channel closed; the caller decides whether to reconnect.
    Disconnected,
    Error(String),
}

/// Source of full trip snapshots. Implemented by [`HttpApi`] in production
/// and by in-process fakes in tests.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn fetch_active_trips(&self) -> Result<Vec<TripRecord>>;
}

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    usuario: &'a str,
    clave: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    token: String,
}

/// HTTP face of the dispatch API: login and the active-trips snapshot.
pub struct HttpApi {
    http: Client,
    server_url: String,
    token: RwLock<Option<String>>,
}

impl HttpApi {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
            token: RwLock::new(None),
        }
    }

    /// Authenticates against `POST /login` and stores the bearer token for
    /// subsequent requests.
    pub async fn login(&self, usuario: &str, clave: &str) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/login", self.server_url))
            .json(&LoginRequest { usuario, clave })
            .send()
            .await
            .context("login request failed")?;

        if !response.status().is_success() {
            if let Ok(api_error) = response.json::<ApiError>().await {
                return Err(ApiException::from(api_error).into());
            }
            return Err(anyhow!("login rejected by server"));
        }

        let body: LoginResponse = response.json().await.context("malformed login response")?;
        *self.token.write().await = Some(body.token);
        info!(usuario, "logged in to dispatch server");
        Ok(())
    }

    /// Push-channel URL derived from the HTTP base, carrying the session
    /// token as a query parameter.
    pub async fn websocket_url(&self) -> Result<String> {
        let ws_base = if self.server_url.starts_with("https://") {
            self.server_url.replacen("https://", "wss://", 1)
        } else if self.server_url.starts_with("http://") {
            self.server_url.replacen("http://", "ws://", 1)
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        match self.token.read().await.as_deref() {
            Some(token) => Ok(format!("{ws_base}/ws?token={token}")),
            None => Ok(format!("{ws_base}/ws")),
        }
    }

    pub fn server_url(&self) -> &str {
        &self.server_url
    }
}

#[async_trait]
impl SnapshotSource for HttpApi {
    async fn fetch_active_trips(&self) -> Result<Vec<TripRecord>> {
        let mut request = self.http.get(format!("{}/viajes/activos", self.server_url));
        if let Some(token) = self.token.read().await.as_deref() {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .context("snapshot request failed")?
            .error_for_status()
            .context("snapshot request rejected")?;

        let body: SnapshotResponse = response
            .json()
            .await
            .context("malformed snapshot response")?;
        Ok(body.into_records())
    }
}

/// Live trip monitor: one reconciler instance per active view, created on
/// view-enter and shut down on view-exit.
pub struct DispatchMonitor {
    source: Arc<dyn SnapshotSource>,
    reconciler: Mutex<TripStateReconciler>,
    events: broadcast::Sender<MonitorEvent>,
    ws_task: Mutex<Option<JoinHandle<()>>>,
}

impl DispatchMonitor {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Arc<Self> {
        let (events, _) = broadcast::channel(1024);
        Arc::new(Self {
            source,
            reconciler: Mutex::new(TripStateReconciler::new()),
            events,
            ws_task: Mutex::new(None),
        })
    }

    /// Fetches a full snapshot and replaces the mapping wholesale. This is
    /// the drift-correction primitive: any failure (transport, malformed
    /// body, duplicate ids) propagates without touching the prior state.
    pub async fn refresh(&self) -> Result<usize> {
        let records = self.source.fetch_active_trips().await?;
        let trips: Vec<Trip> = records.into_iter().map(Trip::from).collect();
        let count = trips.len();

        self.reconciler
            .lock()
            .await
            .load_snapshot(trips)
            .context("rejected snapshot")?;

        info!(trips = count, "loaded trip snapshot");
        let _ = self.events.send(MonitorEvent::SnapshotLoaded { trips: count });
        Ok(count)
    }

    /// Connects the push channel and spawns the read loop. Frames are
    /// narrowed to [`DispatchEvent`] here, at the boundary; anything that
    /// fails to decode is reported and dropped.
    pub async fn connect_events(self: &Arc<Self>, ws_url: &str) -> Result<()> {
        let mut task_guard = self.ws_task.lock().await;
        if task_guard.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }

        let (ws_stream, _) = connect_async(ws_url)
            .await
            .with_context(|| format!("failed to connect websocket: {ws_url}"))?;
        let (_, mut ws_reader) = ws_stream.split();

        let monitor = Arc::clone(self);
        *task_guard = Some(tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Text(text)) => match serde_json::from_str::<DispatchEvent>(&text) {
                        Ok(event) => {
                            monitor.apply_event(event).await;
                        }
                        Err(err) => {
                            warn!(%err, "dropping undecodable push frame");
                            let _ = monitor
                                .events
                                .send(MonitorEvent::Error(format!("invalid dispatch event: {err}")));
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(err) => {
                        let _ = monitor
                            .events
                            .send(MonitorEvent::Error(format!("websocket receive failed: {err}")));
                        break;
                    }
                }
            }
            let _ = monitor.events.send(MonitorEvent::Disconnected);
        }));

        Ok(())
    }

    /// Applies one already-validated event and notifies observers of the
    /// outcome. Total: stale references are ignored, never an error.
    pub async fn apply_event(&self, event: DispatchEvent) -> ApplyOutcome {
        let outcome = self.reconciler.lock().await.apply(&event);
        match outcome {
            ApplyOutcome::Applied => {
                let _ = self.events.send(MonitorEvent::Updated(event));
            }
            ApplyOutcome::Ignored => {
                debug!(?event, "event ignored as stale reference");
                let _ = self.events.send(MonitorEvent::Ignored(event));
            }
        }
        outcome
    }

    /// Current trips in last-snapshot order, cloned out for rendering.
    pub async fn snapshot(&self) -> Vec<Trip> {
        self.reconciler.lock().await.snapshot().to_vec()
    }

    pub async fn trip(&self, trip_id: TripId) -> Option<Trip> {
        self.reconciler.lock().await.trip(trip_id).cloned()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<MonitorEvent> {
        self.events.subscribe()
    }

    /// Releases the push-channel subscription. The in-memory mapping is
    /// simply dropped with the monitor; nothing is persisted.
    pub async fn shutdown(&self) {
        if let Some(task) = self.ws_task.lock().await.take() {
            task.abort();
        }
    }
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
