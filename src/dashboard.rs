use crate::config::DashboardConfig;
use crate::error::{DashboardError, Result};
use crate::history::{DownloadSink, HistoryClient};
use crate::metrics::{HistoricalRecord, MonitoringStatus, Notification, SampleMeta, Statistics, TimeRange};
use crate::monitor::{Endpoints, MonitoringController};
use crate::notify::Notifier;
use crate::reconcile::{ReconcileOutcome, Reconciler};
use crate::samples::{ComparisonView, Confirm, LoadOutcome, SampleManager};
use crate::series::{SeriesStore, SeriesView};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn};

/// The dashboard's client-side state: live series, monitoring loop,
/// saved samples and history, wired to one telemetry server.
pub struct Dashboard {
    series: SeriesStore,
    controller: MonitoringController,
    samples: SampleManager,
    history: HistoryClient,
    notifier: Arc<dyn Notifier>,
}

impl Dashboard {
    pub fn new(config: DashboardConfig, endpoints: Endpoints, notifier: Arc<dyn Notifier>) -> Self {
        let series = SeriesStore::new();
        let reconciler = Reconciler::new(series.clone());
        let samples = SampleManager::new(endpoints.api.clone(), reconciler.clone(), notifier.clone());
        let history = HistoryClient::new(endpoints.api.clone(), notifier.clone());
        let controller = MonitoringController::new(config, endpoints, reconciler, notifier.clone());

        Self {
            series,
            controller,
            samples,
            history,
            notifier,
        }
    }

    /// Dashboard talking HTTP/WebSocket to the configured server
    pub fn connect(config: DashboardConfig, notifier: Arc<dyn Notifier>) -> Result<Self> {
        let endpoints = Endpoints::http(&config)?;
        Ok(Self::new(config, endpoints, notifier))
    }

    pub fn view(&self) -> SeriesView {
        self.series.snapshot()
    }

    pub fn statistics(&self) -> Statistics {
        self.series.statistics()
    }

    pub fn subscribe(&self) -> watch::Receiver<SeriesView> {
        self.series.subscribe()
    }

    pub fn status(&self) -> MonitoringStatus {
        self.controller.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MonitoringStatus> {
        self.controller.subscribe_status()
    }

    pub fn config(&self) -> DashboardConfig {
        self.controller.config()
    }

    pub fn is_monitoring(&self) -> bool {
        self.controller.is_running()
    }

    pub fn start_monitoring(&self) {
        self.controller.start();
    }

    pub fn stop_monitoring(&self) {
        self.controller.stop();
    }

    pub fn set_interval(&self, secs: u64) {
        self.controller.set_interval(secs);
    }

    /// Points the dashboard at another server
    pub fn set_endpoint(&mut self, host: &str, port: u16) -> Result<()> {
        let config = self.config().with_endpoint(host, port);
        let endpoints = Endpoints::http(&config)?;
        self.switch_endpoints(config, endpoints);
        Ok(())
    }

    pub fn switch_endpoints(&mut self, config: DashboardConfig, endpoints: Endpoints) {
        info!(url = %config.api_base_url(), "Switching telemetry endpoint");
        self.samples.set_api(endpoints.api.clone());
        self.history.set_api(endpoints.api.clone());
        self.controller.reconfigure(config, Some(endpoints));
    }

    pub async fn fetch_now(&self) -> Result<Option<ReconcileOutcome>> {
        self.controller.fetch_now().await
    }

    /// Sends one raw value to the server
    pub async fn send_value(&self, raw: &str) -> Result<()> {
        let raw = raw.trim();
        if raw.is_empty() {
            self.notifier.notify(Notification::error("Please enter a value to send"));
            return Err(DashboardError::Validation("value must not be empty".to_string()));
        }

        self.notifier.notify(Notification::info("Sending data to server..."));
        match self.controller.api().send_value(raw).await {
            Ok(ack) if ack.success => {
                self.notifier.notify(Notification::success("Data sent successfully!"));
                Ok(())
            }
            Ok(_) => {
                self.notifier.notify(Notification::error(
                    "Server received message but reported failure",
                ));
                Err(DashboardError::Network("server rejected the value".to_string()))
            }
            Err(e) => {
                warn!(error = %e, "Send failed");
                self.notifier
                    .notify(Notification::error(format!("Error sending data: {}", e)));
                Err(e)
            }
        }
    }

    pub fn clear_data(&self) {
        self.series.clear();
        self.notifier.notify(Notification::info("Data cleared"));
    }

    /// Saves the live series as a sample, then starts over with an empty
    /// series and a refreshed listing
    pub async fn save_sample(&mut self, name: &str) -> Result<String> {
        let id = self.samples.save(name, &self.series.points()).await?;
        self.clear_data();
        if let Err(e) = self.samples.list().await {
            warn!(error = %e, "Could not refresh sample list after save");
        }
        Ok(id)
    }

    pub async fn list_samples(&mut self) -> Result<&[SampleMeta]> {
        self.samples.list().await
    }

    /// In normal mode the sample takes over the live view, so monitoring
    /// stops once the sample has arrived. A failed load leaves it running.
    pub async fn load_sample(&mut self, id: &str) -> Result<LoadOutcome> {
        let controller = &self.controller;
        self.samples
            .load_with(id, || {
                if controller.is_running() {
                    controller.stop();
                }
            })
            .await
    }

    pub async fn delete_sample(&mut self, id: &str, confirm: &dyn Confirm) -> Result<bool> {
        self.samples.delete(id, confirm).await
    }

    pub fn set_compare_mode(&mut self, enabled: bool) {
        self.samples.set_compare_mode(enabled);
    }

    pub fn samples(&self) -> &SampleManager {
        &self.samples
    }

    pub fn comparison(&self) -> ComparisonView {
        self.samples.comparison()
    }

    pub async fn query_history(&mut self, range: TimeRange) -> Result<&[HistoricalRecord]> {
        self.history.query(range).await
    }

    pub fn export_history(&self, sink: &dyn DownloadSink) -> Result<PathBuf> {
        self.history.export(sink)
    }
}

impl Drop for Dashboard {
    fn drop(&mut self) {
        self.controller.stop();
    }
}
