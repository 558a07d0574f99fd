//! Boundary to the remote telemetry server.
//!
//! Every endpoint is decoded into an explicit schema exactly once here;
//! the rest of the crate never touches raw JSON except the value batches,
//! which the reconciler coerces.

use crate::error::{DashboardError, Result};
use crate::metrics::{HistoricalRecord, Sample, SampleMeta, SamplePoint, TimeRange};
use crate::reconcile::coerce_value;
use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Response of `GET /data`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LatestData {
    #[serde(default)]
    pub valores: Vec<Value>,
    #[serde(default)]
    pub estado: Option<String>,
}

/// Response of `POST /send`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendAck {
    pub success: bool,
    #[serde(default)]
    pub recibido: Option<Value>,
}

/// One raw `/history` row. Fields stay untyped so that a bad row is
/// skipped on its own instead of failing the whole response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    #[serde(default)]
    pub timestamp: Value,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub server: Option<String>,
}

/// Response of `GET /history`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HistoryResponse {
    #[serde(default)]
    pub data: Vec<HistoryEntry>,
}

/// Body of `POST /samples/save`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSampleRequest {
    pub name: String,
    pub data: Vec<SamplePoint>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveSampleResponse {
    pub success: bool,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SampleList {
    #[serde(default)]
    pub samples: Vec<SampleMeta>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub success: bool,
}

/// Messages arriving over the push channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum PushMessage {
    Update {
        valores: Vec<Value>,
    },
    Notification {
        message: String,
        #[serde(rename = "notificationType", default, skip_serializing_if = "Option::is_none")]
        notification_type: Option<String>,
    },
}

impl PushMessage {
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| DashboardError::Parse(format!("push message: {}", e)))
    }
}

/// Stream of decoded push messages. Ends when the channel closes.
pub type PushStream = BoxStream<'static, Result<PushMessage>>;

/// Request/response operations of the telemetry server
#[async_trait]
pub trait TelemetryApi: Send + Sync {
    async fn fetch_latest(&self) -> Result<LatestData>;
    async fn send_value(&self, value: &str) -> Result<SendAck>;
    async fn history(&self, range: TimeRange) -> Result<HistoryResponse>;
    async fn save_sample(&self, request: &SaveSampleRequest) -> Result<SaveSampleResponse>;
    async fn list_samples(&self) -> Result<SampleList>;
    async fn load_sample(&self, id: &str) -> Result<Sample>;
    async fn delete_sample(&self, id: &str) -> Result<DeleteResponse>;
}

/// Opens the push channel
#[async_trait]
pub trait PushConnector: Send + Sync {
    async fn connect(&self) -> Result<PushStream>;
}

/// reqwest-backed implementation of [`TelemetryApi`]
#[derive(Debug, Clone)]
pub struct HttpTelemetryClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpTelemetryClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn decode<T: serde::de::DeserializeOwned>(response: reqwest::Response) -> Result<T> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(DashboardError::NotFound(response.url().path().to_string()));
        }
        if !status.is_success() {
            return Err(DashboardError::Network(format!("HTTP error! Status: {}", status.as_u16())));
        }
        let body = response.bytes().await?;
        Ok(serde_json::from_slice(&body)?)
    }
}

#[async_trait]
impl TelemetryApi for HttpTelemetryClient {
    async fn fetch_latest(&self) -> Result<LatestData> {
        let response = self.client.get(self.url("/data")).send().await?;
        let data: LatestData = Self::decode(response).await?;
        debug!(values = data.valores.len(), estado = ?data.estado, "Fetched latest data");
        Ok(data)
    }

    async fn send_value(&self, value: &str) -> Result<SendAck> {
        let response = self.client.post(self.url("/send")).json(&value).send().await?;
        Self::decode(response).await
    }

    async fn history(&self, range: TimeRange) -> Result<HistoryResponse> {
        let response = self
            .client
            .get(self.url("/history"))
            .query(&[("timeRange", range.as_str())])
            .send()
            .await?;
        Self::decode(response).await
    }

    async fn save_sample(&self, request: &SaveSampleRequest) -> Result<SaveSampleResponse> {
        let response = self.client.post(self.url("/samples/save")).json(request).send().await?;
        Self::decode(response).await
    }

    async fn list_samples(&self) -> Result<SampleList> {
        let response = self.client.get(self.url("/samples/list")).send().await?;
        Self::decode(response).await
    }

    async fn load_sample(&self, id: &str) -> Result<Sample> {
        let response = self.client.get(self.url(&format!("/samples/{}", id))).send().await?;
        Self::decode(response).await
    }

    async fn delete_sample(&self, id: &str) -> Result<DeleteResponse> {
        let response = self.client.delete(self.url(&format!("/samples/{}", id))).send().await?;
        Self::decode(response).await
    }
}

/// WebSocket implementation of [`PushConnector`]
#[derive(Debug, Clone)]
pub struct WsPushConnector {
    url: String,
}

impl WsPushConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl PushConnector for WsPushConnector {
    async fn connect(&self) -> Result<PushStream> {
        info!(url = %self.url, "Connecting to push channel");
        let (ws_stream, _) = connect_async(self.url.as_str()).await?;
        let (_write, read) = ws_stream.split();

        let stream = read
            .take_while(|msg| futures::future::ready(!matches!(msg, Ok(Message::Close(_)))))
            .filter_map(|msg| async move {
                match msg {
                    Ok(Message::Text(text)) => Some(PushMessage::parse(&text)),
                    Ok(_) => None,
                    Err(e) => {
                        warn!(error = %e, "Push channel error");
                        Some(Err(DashboardError::from(e)))
                    }
                }
            });
        Ok(stream.boxed())
    }
}

/// Parses a server timestamp: RFC 3339, or a naive ISO datetime taken as UTC
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

impl HistoryEntry {
    /// Decodes the entry into a record; `None` if the timestamp or the
    /// value is unreadable. Timestamps may be strings or epoch milliseconds.
    pub fn into_record(self) -> Option<HistoricalRecord> {
        let timestamp = match &self.timestamp {
            Value::String(raw) => parse_timestamp(raw)?,
            Value::Number(millis) => DateTime::<Utc>::from_timestamp_millis(millis.as_i64()?)?,
            _ => return None,
        };
        let value = coerce_value(&self.value)?;
        Some(HistoricalRecord {
            timestamp,
            value,
            server: self.server,
            formatted_time: timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S").to_string(),
        })
    }
}
