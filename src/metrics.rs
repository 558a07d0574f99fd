use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A single point of the live series as shown on the chart
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SamplePoint {
    pub time: String,
    pub value: f64,
}

impl SamplePoint {
    pub fn new(time: impl Into<String>, value: f64) -> Self {
        Self {
            time: time.into(),
            value,
        }
    }
}

/// Derived figures for the live series. Never mutated on its own, always
/// recomputed from the points it describes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Statistics {
    pub current: f64,
    pub peak: f64,
    pub average: f64,
    /// `None` means the series has never held data (or was cleared)
    pub last_updated: Option<DateTime<Local>>,
}

impl Statistics {
    pub const EMPTY: Statistics = Statistics {
        current: 0.0,
        peak: 0.0,
        average: 0.0,
        last_updated: None,
    };

    pub fn is_empty(&self) -> bool {
        self.last_updated.is_none()
    }

    pub fn last_updated_label(&self) -> String {
        match self.last_updated {
            Some(at) => at.format("%H:%M:%S").to_string(),
            None => "Never".to_string(),
        }
    }
}

impl Default for Statistics {
    fn default() -> Self {
        Self::EMPTY
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MonitoringState {
    Active,
    Inactive,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringStatus {
    pub state: MonitoringState,
    pub message: String,
}

impl MonitoringStatus {
    pub fn active(message: impl Into<String>) -> Self {
        Self {
            state: MonitoringState::Active,
            message: message.into(),
        }
    }

    pub fn inactive(message: impl Into<String>) -> Self {
        Self {
            state: MonitoringState::Inactive,
            message: message.into(),
        }
    }
}

impl Default for MonitoringStatus {
    fn default() -> Self {
        Self::inactive("Stopped")
    }
}

/// Listing entry for a saved sample (no series data)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleMeta {
    pub id: String,
    pub name: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data_points: usize,
}

/// A named snapshot of a past series
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub id: String,
    pub name: String,
    pub data: Vec<SamplePoint>,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn meta(&self) -> SampleMeta {
        SampleMeta {
            id: self.id.clone(),
            name: self.name.clone(),
            timestamp: self.timestamp,
            data_points: self.data.len(),
        }
    }
}

/// Window for historical queries
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeRange {
    #[serde(rename = "1h")]
    LastHour,
    #[serde(rename = "6h")]
    LastSixHours,
    #[serde(rename = "24h")]
    #[default]
    LastDay,
    #[serde(rename = "7d")]
    LastWeek,
    #[serde(rename = "30d")]
    LastMonth,
}

impl TimeRange {
    pub const ALL: [TimeRange; 5] = [
        TimeRange::LastHour,
        TimeRange::LastSixHours,
        TimeRange::LastDay,
        TimeRange::LastWeek,
        TimeRange::LastMonth,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeRange::LastHour => "1h",
            TimeRange::LastSixHours => "6h",
            TimeRange::LastDay => "24h",
            TimeRange::LastWeek => "7d",
            TimeRange::LastMonth => "30d",
        }
    }

    pub fn duration(&self) -> chrono::Duration {
        match self {
            TimeRange::LastHour => chrono::Duration::hours(1),
            TimeRange::LastSixHours => chrono::Duration::hours(6),
            TimeRange::LastDay => chrono::Duration::hours(24),
            TimeRange::LastWeek => chrono::Duration::days(7),
            TimeRange::LastMonth => chrono::Duration::days(30),
        }
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeRange {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        TimeRange::ALL
            .into_iter()
            .find(|range| range.as_str() == s)
            .ok_or_else(|| format!("unknown time range '{}' (expected 1h, 6h, 24h, 7d or 30d)", s))
    }
}

/// One row of a historical query, independent of the live series
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HistoricalRecord {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub server: Option<String>,
    pub formatted_time: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationKind {
    Info,
    Success,
    Error,
}

impl FromStr for NotificationKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "success" => NotificationKind::Success,
            "error" => NotificationKind::Error,
            _ => NotificationKind::Info,
        })
    }
}

/// Transient user-facing message
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub message: String,
    pub kind: NotificationKind,
}

impl Notification {
    pub fn new(kind: NotificationKind, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind,
        }
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Info, message)
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Success, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(NotificationKind::Error, message)
    }
}
