use crate::api::{SaveSampleRequest, TelemetryApi};
use crate::error::{DashboardError, Result};
use crate::metrics::{Notification, Sample, SampleMeta, SamplePoint, Statistics};
use crate::notify::Notifier;
use crate::reconcile::Reconciler;
use crate::series;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info};

/// Samples that can be overlaid at once in compare mode
pub const MAX_COMPARED: usize = 3;

/// Line colours for the compared samples, by selection slot
const OVERLAY_COLORS: [&str; MAX_COMPARED] = ["#3b82f6", "#10b981", "#8b5cf6"];

/// Asks the user to confirm a destructive action
pub trait Confirm {
    fn confirm(&self, prompt: &str) -> bool;
}

impl<F: Fn(&str) -> bool> Confirm for F {
    fn confirm(&self, prompt: &str) -> bool {
        self(prompt)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    /// Normal mode: the sample now drives the live view
    Activated,
    /// Compare mode: added to the selection
    Selected,
    AlreadySelected,
    /// Compare mode: selection already holds the maximum
    SelectionFull,
}

#[derive(Debug, Clone, Serialize)]
pub struct OverlayDataset {
    pub id: String,
    pub name: String,
    pub color: &'static str,
    pub values: Vec<f64>,
    pub statistics: Statistics,
}

/// What the compare chart renders
#[derive(Debug, Clone, Default, Serialize)]
pub struct ComparisonView {
    /// Time labels of the first selected sample
    pub labels: Vec<String>,
    pub datasets: Vec<OverlayDataset>,
}

/// Client side of the remote sample store
pub struct SampleManager {
    api: Arc<dyn TelemetryApi>,
    reconciler: Reconciler,
    notifier: Arc<dyn Notifier>,
    samples: Vec<SampleMeta>,
    active_sample: Option<Sample>,
    selected_samples: Vec<Sample>,
    compare_mode: bool,
}

impl SampleManager {
    pub fn new(api: Arc<dyn TelemetryApi>, reconciler: Reconciler, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            api,
            reconciler,
            notifier,
            samples: Vec::new(),
            active_sample: None,
            selected_samples: Vec::new(),
            compare_mode: false,
        }
    }

    pub fn set_api(&mut self, api: Arc<dyn TelemetryApi>) {
        self.api = api;
    }

    pub fn samples(&self) -> &[SampleMeta] {
        &self.samples
    }

    pub fn active_sample(&self) -> Option<&Sample> {
        self.active_sample.as_ref()
    }

    pub fn selected_samples(&self) -> &[Sample] {
        &self.selected_samples
    }

    pub fn compare_mode(&self) -> bool {
        self.compare_mode
    }

    /// Leaving compare mode drops the selection
    pub fn set_compare_mode(&mut self, enabled: bool) {
        self.compare_mode = enabled;
        if !enabled {
            self.selected_samples.clear();
        }
    }

    pub fn toggle_compare_mode(&mut self) -> bool {
        self.set_compare_mode(!self.compare_mode);
        self.compare_mode
    }

    /// Saves `series` under `name` and returns the id assigned by the
    /// store. Clearing the live view afterwards is up to the caller.
    pub async fn save(&mut self, name: &str, series: &[SamplePoint]) -> Result<String> {
        let name = name.trim();
        if name.is_empty() {
            self.notifier.notify(Notification::error("Please enter a name for the sample"));
            return Err(DashboardError::Validation("sample name must not be empty".to_string()));
        }

        self.notifier
            .notify(Notification::info("Saving current sample and starting new..."));
        let request = SaveSampleRequest {
            name: name.to_string(),
            data: series.to_vec(),
            timestamp: Utc::now(),
        };

        let response = self
            .api
            .save_sample(&request)
            .await
            .map_err(|e| self.report("Error saving sample", e))?;

        match (response.success, response.id) {
            (true, Some(id)) => {
                info!(%id, name, points = series.len(), "Sample saved");
                self.notifier
                    .notify(Notification::success(format!("Sample \"{}\" saved successfully!", name)));
                Ok(id)
            }
            (true, None) => Err(self.report(
                "Error saving sample",
                DashboardError::Parse("save response carried no id".to_string()),
            )),
            (false, _) => {
                self.notifier.notify(Notification::error("Failed to save sample"));
                Err(DashboardError::Network("server reported failure saving sample".to_string()))
            }
        }
    }

    /// Refreshes the cached listing
    pub async fn list(&mut self) -> Result<&[SampleMeta]> {
        let list = self
            .api
            .list_samples()
            .await
            .map_err(|e| self.report("Error loading samples", e))?;

        self.samples = list.samples;
        if self.samples.is_empty() {
            self.notifier.notify(Notification::info("No samples available"));
        } else {
            self.notifier
                .notify(Notification::success(format!("{} samples loaded", self.samples.len())));
        }
        Ok(&self.samples)
    }

    pub async fn load(&mut self, id: &str) -> Result<LoadOutcome> {
        self.load_with(id, || {}).await
    }

    /// Like [`load`](Self::load), but runs `before_install` once the sample
    /// has arrived and is about to replace the live series. Not called in
    /// compare mode or when the request fails.
    pub async fn load_with(&mut self, id: &str, before_install: impl FnOnce()) -> Result<LoadOutcome> {
        if self.compare_mode {
            if self.selected_samples.iter().any(|s| s.id == id) {
                return Ok(LoadOutcome::AlreadySelected);
            }
            if self.selected_samples.len() >= MAX_COMPARED {
                return Ok(LoadOutcome::SelectionFull);
            }
        }

        let sample = self
            .api
            .load_sample(id)
            .await
            .map_err(|e| self.report("Error loading sample", e))?;

        if self.compare_mode {
            // The selection may have changed while the request was in flight
            if self.selected_samples.iter().any(|s| s.id == sample.id) {
                return Ok(LoadOutcome::AlreadySelected);
            }
            if self.selected_samples.len() >= MAX_COMPARED {
                return Ok(LoadOutcome::SelectionFull);
            }
            self.selected_samples.push(sample);
            return Ok(LoadOutcome::Selected);
        }

        before_install();
        self.reconciler.install(sample.data.clone());
        self.notifier.notify(Notification::success(format!(
            "Sample \"{}\" loaded successfully!",
            sample.name
        )));
        self.active_sample = Some(sample);
        Ok(LoadOutcome::Activated)
    }

    /// Deletes a sample after confirmation. `Ok(false)` when the user
    /// declined.
    pub async fn delete(&mut self, id: &str, confirm: &dyn Confirm) -> Result<bool> {
        if !confirm.confirm("Are you sure you want to delete this sample?") {
            return Ok(false);
        }

        let response = self
            .api
            .delete_sample(id)
            .await
            .map_err(|e| self.report("Error deleting sample", e))?;
        if !response.success {
            self.notifier.notify(Notification::error("Failed to delete sample"));
            return Err(DashboardError::Network(format!("server refused to delete sample {}", id)));
        }

        self.samples.retain(|s| s.id != id);
        self.selected_samples.retain(|s| s.id != id);
        if self.active_sample.as_ref().is_some_and(|s| s.id == id) {
            self.active_sample = None;
            self.reconciler.clear();
        }

        info!(%id, "Sample deleted");
        self.notifier.notify(Notification::success("Sample deleted successfully!"));
        Ok(true)
    }

    /// Overlay of the compared samples, one dataset per selection slot
    pub fn comparison(&self) -> ComparisonView {
        let labels = self
            .selected_samples
            .first()
            .map(|s| s.data.iter().map(|p| p.time.clone()).collect())
            .unwrap_or_default();

        let datasets = self
            .selected_samples
            .iter()
            .zip(OVERLAY_COLORS)
            .map(|(sample, color)| OverlayDataset {
                id: sample.id.clone(),
                name: sample.name.clone(),
                color,
                values: sample.data.iter().map(|p| p.value).collect(),
                statistics: series::statistics(&sample.data),
            })
            .collect();

        ComparisonView { labels, datasets }
    }

    fn report(&self, context: &str, err: DashboardError) -> DashboardError {
        error!(error = %err, "{}", context);
        self.notifier
            .notify(Notification::error(format!("{}: {}", context, err)));
        err
    }
}
