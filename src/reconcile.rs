use crate::metrics::SamplePoint;
use crate::series::SeriesStore;
use chrono::{DateTime, Local};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Label format for live points
const TIME_LABEL: &str = "%H:%M";

/// How an incoming batch lands in the series
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BatchPolicy {
    /// Continuous updates: points go after the existing ones
    Append,
    /// Bulk loads without per-point timestamps: the batch replaces the
    /// series, spaced evenly and ending at now
    ReplaceSpaced(chrono::Duration),
}

/// Generation observed when an asynchronous request was issued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation(u64);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileOutcome {
    pub accepted: usize,
    pub dropped: usize,
}

/// Coerces a raw wire value to a finite number. Numeric strings are
/// accepted, anything else is rejected.
pub fn coerce_value(raw: &Value) -> Option<f64> {
    let value = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        _ => return None,
    };
    value.is_finite().then_some(value)
}

/// Splits a raw batch into accepted values and a dropped count
pub fn normalize(batch: &[Value]) -> (Vec<f64>, usize) {
    let values: Vec<f64> = batch.iter().filter_map(coerce_value).collect();
    let dropped = batch.len() - values.len();
    (values, dropped)
}

/// Single entry point for every series mutation driven by incoming data
#[derive(Debug, Clone)]
pub struct Reconciler {
    series: SeriesStore,
    generation: Arc<AtomicU64>,
}

impl Reconciler {
    pub fn new(series: SeriesStore) -> Self {
        Self {
            series,
            generation: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn series(&self) -> &SeriesStore {
        &self.series
    }

    pub fn current_generation(&self) -> Generation {
        Generation(self.generation.load(Ordering::SeqCst))
    }

    /// Invalidates every request issued before this call
    pub fn advance_generation(&self) -> Generation {
        Generation(self.generation.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn is_current(&self, generation: Generation) -> bool {
        self.current_generation() == generation
    }

    /// Applies a batch now, regardless of generation
    pub fn apply(&self, batch: &[Value], policy: BatchPolicy) -> ReconcileOutcome {
        self.apply_at(batch, policy, Local::now())
    }

    /// Applies a batch only if no stop/start happened since `issued`.
    /// Returns `None` when the result was discarded as tardy.
    pub fn apply_if_current(
        &self,
        issued: Generation,
        batch: &[Value],
        policy: BatchPolicy,
    ) -> Option<ReconcileOutcome> {
        if !self.is_current(issued) {
            debug!(
                issued = issued.0,
                current = self.current_generation().0,
                "Discarding tardy batch"
            );
            return None;
        }
        Some(self.apply(batch, policy))
    }

    fn apply_at(&self, batch: &[Value], policy: BatchPolicy, now: DateTime<Local>) -> ReconcileOutcome {
        if batch.is_empty() {
            return ReconcileOutcome::default();
        }

        let (values, dropped) = normalize(batch);
        if dropped > 0 {
            warn!(dropped, total = batch.len(), "Dropped non-numeric values from batch");
        }

        match policy {
            BatchPolicy::Append => {
                let label = now.format(TIME_LABEL).to_string();
                let points = values
                    .iter()
                    .map(|&value| SamplePoint::new(label.clone(), value))
                    .collect();
                self.series.append(points);
            }
            BatchPolicy::ReplaceSpaced(spacing) => {
                if values.is_empty() {
                    return ReconcileOutcome { accepted: 0, dropped };
                }
                self.series.replace(spaced_points(&values, spacing, now));
            }
        }

        ReconcileOutcome {
            accepted: values.len(),
            dropped,
        }
    }

    /// Installs already-labelled points, e.g. the contents of a saved sample
    pub fn install(&self, points: Vec<SamplePoint>) {
        let points: Vec<SamplePoint> = points.into_iter().filter(|p| p.value.is_finite()).collect();
        self.series.replace(points);
    }

    pub fn clear(&self) {
        self.series.clear();
    }
}

fn spaced_points(values: &[f64], spacing: chrono::Duration, now: DateTime<Local>) -> Vec<SamplePoint> {
    let last = values.len() as i32 - 1;
    values
        .iter()
        .enumerate()
        .map(|(index, &value)| {
            // Out-of-range offsets collapse onto now
            let at = spacing
                .checked_mul(last - index as i32)
                .and_then(|offset| now.checked_sub_signed(offset))
                .unwrap_or(now);
            SamplePoint::new(at.format(TIME_LABEL).to_string(), value)
        })
        .collect()
}
