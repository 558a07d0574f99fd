use crate::api::TelemetryApi;
use crate::error::{DashboardError, Result};
use crate::metrics::{HistoricalRecord, Notification, TimeRange};
use crate::notify::Notifier;
use chrono::{NaiveDate, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

const CSV_HEADER: &str = "Timestamp,Value (Mbps),Server";

/// Receives a finished export, e.g. by writing it to disk
pub trait DownloadSink {
    fn deliver(&self, filename: &str, content: &str) -> Result<PathBuf>;
}

/// Writes exports into a directory
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dir: PathBuf,
}

impl DirectorySink {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

impl DownloadSink for DirectorySink {
    fn deliver(&self, filename: &str, content: &str) -> Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(filename);
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Range queries against the history endpoint. The records it holds are
/// never merged into the live series.
pub struct HistoryClient {
    api: Arc<dyn TelemetryApi>,
    notifier: Arc<dyn Notifier>,
    range: TimeRange,
    records: Vec<HistoricalRecord>,
}

impl HistoryClient {
    pub fn new(api: Arc<dyn TelemetryApi>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            api,
            notifier,
            range: TimeRange::default(),
            records: Vec::new(),
        }
    }

    pub fn set_api(&mut self, api: Arc<dyn TelemetryApi>) {
        self.api = api;
    }

    pub fn range(&self) -> TimeRange {
        self.range
    }

    pub fn records(&self) -> &[HistoricalRecord] {
        &self.records
    }

    /// Fetches `range`, oldest first. An empty window is a valid answer.
    pub async fn query(&mut self, range: TimeRange) -> Result<&[HistoricalRecord]> {
        self.range = range;
        self.notifier
            .notify(Notification::info("Fetching historical data from database..."));

        let response = match self.api.history(range).await {
            Ok(response) => response,
            Err(e) => {
                error!(error = %e, %range, "Historical query failed");
                self.notifier
                    .notify(Notification::error(format!("Error fetching historical data: {}", e)));
                return Err(e);
            }
        };

        let total = response.data.len();
        let mut records: Vec<HistoricalRecord> =
            response.data.into_iter().filter_map(|entry| entry.into_record()).collect();
        if records.len() < total {
            warn!(skipped = total - records.len(), "Skipped unreadable historical records");
        }
        records.sort_by_key(|r| r.timestamp);

        info!(%range, count = records.len(), "Historical data loaded");
        if records.is_empty() {
            self.notifier
                .notify(Notification::info("No historical data found for selected period"));
        } else {
            self.notifier.notify(Notification::success(format!(
                "Loaded {} historical records",
                records.len()
            )));
        }

        self.records = records;
        Ok(&self.records)
    }

    /// Exports the last query result through `sink`
    pub fn export(&self, sink: &dyn DownloadSink) -> Result<PathBuf> {
        let result = export_csv(&self.records, Utc::now().date_naive())
            .and_then(|export| sink.deliver(&export.filename, &export.content));
        match &result {
            Ok(path) => self
                .notifier
                .notify(Notification::success(format!("Data exported to {}", path.display()))),
            Err(DashboardError::NoData) => self.notifier.notify(Notification::error("No data to export")),
            Err(e) => self
                .notifier
                .notify(Notification::error(format!("Error exporting data: {}", e))),
        }
        result
    }
}

/// A rendered CSV export
#[derive(Debug, Clone, PartialEq)]
pub struct CsvExport {
    pub filename: String,
    pub content: String,
}

/// Renders records as CSV. Fails with `NoData` on an empty slice.
pub fn export_csv(records: &[HistoricalRecord], date: NaiveDate) -> Result<CsvExport> {
    if records.is_empty() {
        return Err(DashboardError::NoData);
    }

    let mut lines = Vec::with_capacity(records.len() + 1);
    lines.push(CSV_HEADER.to_string());
    for record in records {
        lines.push(format!(
            "{},{},{}",
            csv_field(&record.formatted_time),
            record.value,
            csv_field(record.server.as_deref().unwrap_or("Unknown"))
        ));
    }

    Ok(CsvExport {
        filename: export_filename(date),
        content: lines.join("\n"),
    })
}

pub fn export_filename(date: NaiveDate) -> String {
    format!("network-data-{}.csv", date.format("%Y-%m-%d"))
}

fn csv_field(raw: &str) -> String {
    if raw.contains([',', '"', '\n']) {
        format!("\"{}\"", raw.replace('"', "\"\""))
    } else {
        raw.to_string()
    }
}
