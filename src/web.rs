use crate::api::{
    DeleteResponse, HistoryEntry, HistoryResponse, LatestData, PushMessage, SampleList,
    SaveSampleRequest, SaveSampleResponse, SendAck,
};
use crate::metrics::TimeRange;
use crate::reconcile::coerce_value;
use crate::storage::TelemetryStore;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, error, info, warn};

/// Entries returned by `/data`
const LATEST_WINDOW: usize = 5;
const PUSH_BUFFER: usize = 64;

#[derive(Clone)]
pub struct AppState {
    store: Arc<TelemetryStore>,
    updates: broadcast::Sender<PushMessage>,
}

impl AppState {
    pub fn new(store: Arc<TelemetryStore>) -> Self {
        let (updates, _) = broadcast::channel(PUSH_BUFFER);
        Self { store, updates }
    }
}

pub fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/data", get(latest_handler))
        .route("/send", post(send_handler))
        .route("/history", get(history_handler))
        .route("/samples/save", post(save_sample_handler))
        .route("/samples/list", get(list_samples_handler))
        .route("/samples/:id", get(load_sample_handler).delete(delete_sample_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn start_web_server(store: Arc<TelemetryStore>, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("0.0.0.0:{}", port)).await?;
    info!("Telemetry server listening on port {}", port);
    serve(listener, AppState::new(store)).await
}

pub async fn serve(listener: TcpListener, state: AppState) -> anyhow::Result<()> {
    axum::serve(listener, router(state)).await?;
    Ok(())
}

fn internal_error(e: anyhow::Error) -> Response {
    error!(error = %e, "Storage error");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(serde_json::json!({
            "success": false,
            "error": e.to_string()
        })),
    )
        .into_response()
}

fn not_found(id: &str) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({
            "success": false,
            "error": format!("Sample {} not found", id)
        })),
    )
        .into_response()
}

async fn latest_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.latest_values(LATEST_WINDOW as u32) {
        Ok(mut values) => {
            values.resize(LATEST_WINDOW, 0.0);
            Json(LatestData {
                valores: values.into_iter().map(Value::from).collect(),
                estado: Some("OK".to_string()),
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn send_handler(State(state): State<AppState>, Json(raw): Json<Value>) -> impl IntoResponse {
    let Some(value) = coerce_value(&raw) else {
        warn!(received = %raw, "Rejected non-numeric value");
        return Json(SendAck {
            success: false,
            recibido: Some(raw),
        })
        .into_response();
    };

    if let Err(e) = state.store.insert_reading(value, None) {
        return internal_error(e);
    }
    info!(value, "Received value");

    // No subscribers is fine
    let _ = state.updates.send(PushMessage::Update {
        valores: vec![Value::from(value)],
    });

    Json(SendAck {
        success: true,
        recibido: Some(raw),
    })
    .into_response()
}

#[derive(Deserialize)]
struct HistoryQuery {
    #[serde(rename = "timeRange", default)]
    time_range: TimeRange,
}

async fn history_handler(
    State(state): State<AppState>,
    Query(params): Query<HistoryQuery>,
) -> impl IntoResponse {
    let since = Utc::now() - params.time_range.duration();
    match state.store.readings_since(since) {
        Ok(readings) => Json(HistoryResponse {
            data: readings
                .into_iter()
                .map(|r| HistoryEntry {
                    timestamp: Value::from(r.timestamp.to_rfc3339()),
                    value: Value::from(r.value),
                    server: r.server,
                })
                .collect(),
        })
        .into_response(),
        Err(e) => internal_error(e),
    }
}

async fn save_sample_handler(
    State(state): State<AppState>,
    Json(request): Json<SaveSampleRequest>,
) -> impl IntoResponse {
    let name = request.name.trim();
    if name.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({
                "success": false,
                "error": "Sample name is required"
            })),
        )
            .into_response();
    }

    match state.store.save_sample(name, &request.data, request.timestamp) {
        Ok(meta) => {
            info!(id = %meta.id, name = %meta.name, points = meta.data_points, "Sample saved");
            let _ = state.updates.send(PushMessage::Notification {
                message: format!("Sample \"{}\" saved", meta.name),
                notification_type: Some("info".to_string()),
            });
            Json(SaveSampleResponse {
                success: true,
                id: Some(meta.id),
                name: Some(meta.name),
            })
            .into_response()
        }
        Err(e) => internal_error(e),
    }
}

async fn list_samples_handler(State(state): State<AppState>) -> impl IntoResponse {
    match state.store.list_samples() {
        Ok(samples) => Json(SampleList { samples }).into_response(),
        Err(e) => internal_error(e),
    }
}

async fn load_sample_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.get_sample(&id) {
        Ok(Some(sample)) => Json(sample).into_response(),
        Ok(None) => not_found(&id),
        Err(e) => internal_error(e),
    }
}

async fn delete_sample_handler(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.store.delete_sample(&id) {
        Ok(true) => {
            info!(%id, "Sample deleted");
            Json(DeleteResponse { success: true }).into_response()
        }
        Ok(false) => not_found(&id),
        Err(e) => internal_error(e),
    }
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    // Subscribe before the handshake completes so nothing sent after it is missed
    let updates = state.updates.subscribe();
    ws.on_upgrade(move |socket| push_session(socket, updates))
}

async fn push_session(mut socket: WebSocket, mut updates: broadcast::Receiver<PushMessage>) {
    debug!("Push client connected");
    loop {
        tokio::select! {
            update = updates.recv() => match update {
                Ok(message) => {
                    let text = match serde_json::to_string(&message) {
                        Ok(text) => text,
                        Err(e) => {
                            error!(error = %e, "Could not encode push message");
                            continue;
                        }
                    };
                    if socket.send(Message::Text(text)).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Push client lagging, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("Push client disconnected");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{HttpTelemetryClient, PushConnector, TelemetryApi, WsPushConnector};
    use crate::config::DashboardConfig;
    use crate::dashboard::Dashboard;
    use crate::error::DashboardError;
    use crate::metrics::SamplePoint;
    use crate::notify::recording::RecordingNotifier;
    use futures::StreamExt;
    use std::net::SocketAddr;
    use std::time::Duration;
    use tempfile::TempDir;

    async fn spawn_server() -> (TempDir, Arc<TelemetryStore>, SocketAddr) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(TelemetryStore::new(dir.path().join("server.db")).unwrap());
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = AppState::new(store.clone());
        tokio::spawn(async move {
            serve(listener, state).await.unwrap();
        });
        (dir, store, addr)
    }

    fn client(addr: SocketAddr) -> HttpTelemetryClient {
        HttpTelemetryClient::new(format!("http://{}", addr)).unwrap()
    }

    #[tokio::test]
    async fn latest_is_padded_newest_first() {
        let (_dir, _store, addr) = spawn_server().await;
        let api = client(addr);

        assert!(api.send_value("12.5").await.unwrap().success);
        assert!(api.send_value("40").await.unwrap().success);

        let latest = api.fetch_latest().await.unwrap();
        assert_eq!(latest.estado.as_deref(), Some("OK"));
        let values: Vec<f64> = latest.valores.iter().filter_map(|v| v.as_f64()).collect();
        assert_eq!(values, vec![40.0, 12.5, 0.0, 0.0, 0.0]);
    }

    #[tokio::test]
    async fn non_numeric_send_is_acknowledged_as_failure() {
        let (_dir, store, addr) = spawn_server().await;

        let ack = client(addr).send_value("fast").await.unwrap();
        assert!(!ack.success);
        assert!(store.latest_values(5).unwrap().is_empty());
    }

    #[tokio::test]
    async fn sample_round_trip_and_missing_id() {
        let (_dir, _store, addr) = spawn_server().await;
        let api = client(addr);

        let saved = api
            .save_sample(&SaveSampleRequest {
                name: "evening".to_string(),
                data: vec![SamplePoint::new("20:00", 88.0)],
                timestamp: Utc::now(),
            })
            .await
            .unwrap();
        let id = saved.id.unwrap();

        let list = api.list_samples().await.unwrap();
        assert_eq!(list.samples.len(), 1);
        assert_eq!(list.samples[0].data_points, 1);

        let sample = api.load_sample(&id).await.unwrap();
        assert_eq!(sample.name, "evening");

        assert!(api.delete_sample(&id).await.unwrap().success);
        assert!(matches!(api.load_sample(&id).await, Err(DashboardError::NotFound(_))));
        assert!(matches!(api.delete_sample(&id).await, Err(DashboardError::NotFound(_))));
    }

    #[tokio::test]
    async fn history_window_excludes_old_readings() {
        let (_dir, store, addr) = spawn_server().await;
        store
            .insert_reading_at(Utc::now() - chrono::Duration::hours(3), 5.0, Some("edge-1"))
            .unwrap();
        store.insert_reading_at(Utc::now(), 7.0, Some("edge-1")).unwrap();

        let api = client(addr);
        let hour = api.history(TimeRange::LastHour).await.unwrap();
        assert_eq!(hour.data.len(), 1);
        assert_eq!(hour.data[0].value.as_f64(), Some(7.0));

        let day = api.history(TimeRange::LastDay).await.unwrap();
        assert_eq!(day.data.len(), 2);
    }

    #[tokio::test]
    async fn sent_values_are_pushed_to_ws_clients() {
        let (_dir, _store, addr) = spawn_server().await;
        let mut stream = WsPushConnector::new(format!("ws://{}/ws", addr))
            .connect()
            .await
            .unwrap();

        client(addr).send_value("64").await.unwrap();

        let message = tokio::time::timeout(Duration::from_secs(5), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(
            message,
            PushMessage::Update {
                valores: vec![Value::from(64.0)]
            }
        );
    }

    #[tokio::test]
    async fn dashboard_against_live_server() {
        let (_dir, _store, addr) = spawn_server().await;
        let config = DashboardConfig::default().with_endpoint(&addr.ip().to_string(), addr.port());
        let notifier = Arc::new(RecordingNotifier::default());
        let mut dashboard = Dashboard::connect(config, notifier).unwrap();

        dashboard.send_value("30").await.unwrap();
        dashboard.send_value("50").await.unwrap();
        dashboard.fetch_now().await.unwrap();

        let stats = dashboard.statistics();
        assert_eq!(stats.current, 0.0);
        assert_eq!(stats.peak, 50.0);
        assert_eq!(stats.average, 16.0);

        let id = dashboard.save_sample("baseline").await.unwrap();
        assert!(dashboard.view().points.is_empty());
        dashboard.load_sample(&id).await.unwrap();
        assert_eq!(dashboard.view().points.len(), LATEST_WINDOW);

        let records = dashboard.query_history(TimeRange::LastHour).await.unwrap();
        assert_eq!(records.len(), 2);
    }
}
