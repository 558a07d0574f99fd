use crate::api::{PushConnector, PushMessage, TelemetryApi};
use crate::config::DashboardConfig;
use crate::error::{DashboardError, Result};
use crate::metrics::{MonitoringStatus, Notification, NotificationKind};
use crate::notify::Notifier;
use crate::reconcile::{BatchPolicy, Generation, ReconcileOutcome, Reconciler};
use futures::StreamExt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

/// Remote collaborators for one server endpoint
#[derive(Clone)]
pub struct Endpoints {
    pub api: Arc<dyn TelemetryApi>,
    pub push: Option<Arc<dyn PushConnector>>,
}

impl Endpoints {
    pub fn new(api: Arc<dyn TelemetryApi>) -> Self {
        Self { api, push: None }
    }

    pub fn with_push(mut self, push: Arc<dyn PushConnector>) -> Self {
        self.push = Some(push);
        self
    }

    /// HTTP client plus WebSocket push channel for the configured server
    pub fn http(config: &DashboardConfig) -> Result<Self> {
        let api = crate::api::HttpTelemetryClient::new(config.api_base_url())?;
        let push = crate::api::WsPushConnector::new(config.ws_url());
        Ok(Self::new(Arc::new(api)).with_push(Arc::new(push)))
    }
}

/// Handles of the update sources owned by a running controller
struct ActiveSources {
    poll: JoinHandle<()>,
    push: Option<JoinHandle<()>>,
}

impl ActiveSources {
    fn abort(self) {
        self.poll.abort();
        if let Some(push) = self.push {
            push.abort();
        }
    }
}

struct Inner {
    reconciler: Reconciler,
    notifier: Arc<dyn Notifier>,
    status: Arc<watch::Sender<MonitoringStatus>>,
    config: Mutex<DashboardConfig>,
    endpoints: Mutex<Endpoints>,
    sources: Mutex<Option<ActiveSources>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(sources) = lock(&self.sources).take() {
            sources.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Governs the live update loop: one poll timer and at most one push
/// channel while running, nothing while idle.
///
/// Cloning yields another handle onto the same controller.
#[derive(Clone)]
pub struct MonitoringController {
    inner: Arc<Inner>,
}

/// Everything a spawned update source needs, tagged with the generation
/// it was started under
#[derive(Clone)]
struct SourceContext {
    reconciler: Reconciler,
    notifier: Arc<dyn Notifier>,
    status: Arc<watch::Sender<MonitoringStatus>>,
    generation: Generation,
}

impl SourceContext {
    fn is_current(&self) -> bool {
        self.reconciler.is_current(self.generation)
    }

    fn set_status(&self, status: MonitoringStatus) {
        if self.is_current() {
            self.status.send_replace(status);
        }
    }

    fn notify(&self, notification: Notification) {
        if self.is_current() {
            self.notifier.notify(notification);
        }
    }
}

impl MonitoringController {
    pub fn new(
        config: DashboardConfig,
        endpoints: Endpoints,
        reconciler: Reconciler,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        let (status, _rx) = watch::channel(MonitoringStatus::default());
        Self {
            inner: Arc::new(Inner {
                reconciler,
                notifier,
                status: Arc::new(status),
                config: Mutex::new(config.normalized()),
                endpoints: Mutex::new(endpoints),
                sources: Mutex::new(None),
            }),
        }
    }

    pub fn is_running(&self) -> bool {
        lock(&self.inner.sources).is_some()
    }

    pub fn status(&self) -> MonitoringStatus {
        self.inner.status.borrow().clone()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<MonitoringStatus> {
        self.inner.status.subscribe()
    }

    pub fn config(&self) -> DashboardConfig {
        lock(&self.inner.config).clone()
    }

    pub fn api(&self) -> Arc<dyn TelemetryApi> {
        lock(&self.inner.endpoints).api.clone()
    }

    /// Starts polling (and the push channel, when enabled). No-op when
    /// already running. Must be called from within a tokio runtime.
    pub fn start(&self) {
        let mut sources = lock(&self.inner.sources);
        if sources.is_some() {
            debug!("Monitoring already running, ignoring start");
            return;
        }

        let config = self.config();
        let endpoints = lock(&self.inner.endpoints).clone();
        let generation = self.inner.reconciler.advance_generation();
        let ctx = SourceContext {
            reconciler: self.inner.reconciler.clone(),
            notifier: self.inner.notifier.clone(),
            status: self.inner.status.clone(),
            generation,
        };

        let interval = config.interval();
        info!(
            interval_secs = interval.as_secs(),
            push = config.push_enabled && endpoints.push.is_some(),
            "Starting monitoring"
        );

        ctx.set_status(MonitoringStatus::active("Monitoring"));
        ctx.notify(Notification::success(format!(
            "Real-time monitoring started (updates every {}s)",
            interval.as_secs()
        )));

        let poll = tokio::spawn(poll_loop(ctx.clone(), endpoints.api.clone(), interval));
        let push = match (config.push_enabled, endpoints.push) {
            (true, Some(connector)) => Some(tokio::spawn(push_loop(ctx, connector))),
            _ => None,
        };
        *sources = Some(ActiveSources { poll, push });
    }

    /// Stops every update source. Safe to call any number of times.
    /// Results of requests issued before this call are discarded.
    pub fn stop(&self) {
        let sources = lock(&self.inner.sources).take();
        self.inner.reconciler.advance_generation();
        self.inner.status.send_replace(MonitoringStatus::inactive("Stopped"));

        if let Some(sources) = sources {
            sources.abort();
            info!("Monitoring stopped");
            self.inner.notifier.notify(Notification::info("Monitoring stopped"));
        }
    }

    /// Installs a new endpoint/interval. A running controller is fully torn
    /// down before the new sources are created.
    pub fn reconfigure(&self, config: DashboardConfig, endpoints: Option<Endpoints>) {
        let was_running = self.is_running();
        if was_running {
            self.stop();
        }

        *lock(&self.inner.config) = config.normalized();
        if let Some(endpoints) = endpoints {
            *lock(&self.inner.endpoints) = endpoints;
        }

        if was_running {
            self.start();
        }
    }

    /// Changes only the poll interval
    pub fn set_interval(&self, secs: u64) {
        let config = self.config().with_interval_secs(secs);
        self.reconfigure(config, None);
    }

    /// One manual fetch. The batch replaces the series with synthesized
    /// spacing. `Ok(None)` when the result arrived after a stop/start.
    pub async fn fetch_now(&self) -> Result<Option<ReconcileOutcome>> {
        let issued = self.inner.reconciler.current_generation();
        let api = self.api();
        let spacing = self.config().batch_spacing();
        let notifier = &self.inner.notifier;

        notifier.notify(Notification::info("Fetching data from server..."));
        let data = match api.fetch_latest().await {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "Manual fetch failed");
                if self.inner.reconciler.is_current(issued) {
                    self.set_message("Error");
                    notifier.notify(Notification::error(format!("Error fetching data: {}", e)));
                }
                return Err(e);
            }
        };

        if data.valores.is_empty() {
            notifier.notify(Notification::info("No data returned from server"));
            return Ok(Some(ReconcileOutcome::default()));
        }

        let outcome = self.inner.reconciler.apply_if_current(
            issued,
            &data.valores,
            BatchPolicy::ReplaceSpaced(spacing),
        );
        if outcome.is_some() {
            self.set_message(data.estado.as_deref().unwrap_or("Online"));
            notifier.notify(Notification::success("Data fetched successfully!"));
        }
        Ok(outcome)
    }

    /// Keeps the active/inactive state, which only start/stop may change
    fn set_message(&self, message: &str) {
        let running = self.is_running();
        self.inner.status.send_replace(if running {
            MonitoringStatus::active(message)
        } else {
            MonitoringStatus::inactive(message)
        });
    }
}

async fn poll_loop(ctx: SourceContext, api: Arc<dyn TelemetryApi>, period: Duration) {
    let mut interval = time::interval_at(Instant::now() + period, period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        interval.tick().await;
        if !ctx.is_current() {
            break;
        }
        poll_once(&ctx, api.as_ref()).await;
    }
}

async fn poll_once(ctx: &SourceContext, api: &dyn TelemetryApi) {
    match api.fetch_latest().await {
        Ok(data) if data.valores.is_empty() => {
            debug!("Poll returned no values");
        }
        Ok(data) => {
            match ctx
                .reconciler
                .apply_if_current(ctx.generation, &data.valores, BatchPolicy::Append)
            {
                Some(outcome) => {
                    debug!(accepted = outcome.accepted, dropped = outcome.dropped, "Poll applied");
                    ctx.set_status(MonitoringStatus::active(
                        data.estado.unwrap_or_else(|| "Online".to_string()),
                    ));
                }
                None => debug!("Poll result arrived after stop"),
            }
        }
        Err(e) => {
            // The timer keeps running; the next tick retries
            warn!(error = %e, "Poll failed");
            ctx.set_status(MonitoringStatus::active("Error"));
            ctx.notify(Notification::error(format!("Error fetching data: {}", e)));
        }
    }
}

async fn push_loop(ctx: SourceContext, connector: Arc<dyn PushConnector>) {
    let mut stream = match connector.connect().await {
        Ok(stream) => stream,
        Err(e) => {
            warn!(error = %e, "Push channel unavailable, polling only");
            ctx.notify(Notification::error(
                "Could not establish real-time connection. Using polling instead.",
            ));
            return;
        }
    };

    info!("Push channel connected");
    ctx.set_status(MonitoringStatus::active("Connected (Real-time)"));
    ctx.notify(Notification::success("Real-time updates connected!"));

    while let Some(message) = stream.next().await {
        if !ctx.is_current() {
            return;
        }
        match message {
            Ok(PushMessage::Update { valores }) => {
                if let Some(outcome) =
                    ctx.reconciler
                        .apply_if_current(ctx.generation, &valores, BatchPolicy::Append)
                {
                    ctx.set_status(MonitoringStatus::active(format!(
                        "Updated with {} values (Real-time)",
                        outcome.accepted
                    )));
                }
            }
            Ok(PushMessage::Notification {
                message,
                notification_type,
            }) => {
                let kind = notification_type
                    .as_deref()
                    .and_then(|t| t.parse::<NotificationKind>().ok())
                    .unwrap_or(NotificationKind::Info);
                ctx.notify(Notification::new(kind, message));
            }
            Err(DashboardError::Parse(reason)) => {
                warn!(%reason, "Skipping malformed push message");
            }
            Err(e) => {
                warn!(error = %e, "Push channel failed");
                break;
            }
        }
    }

    info!("Push channel closed, falling back to polling");
    ctx.notify(Notification::info("Real-time channel closed. Falling back to polling."));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::mock::{MockApi, MockPush};
    use crate::metrics::MonitoringState;
    use crate::notify::recording::RecordingNotifier;
    use crate::series::SeriesStore;
    use serde_json::json;

    struct Harness {
        api: Arc<MockApi>,
        push: Arc<MockPush>,
        notifier: Arc<RecordingNotifier>,
        series: SeriesStore,
        controller: MonitoringController,
    }

    fn harness(api: MockApi, with_push: bool) -> Harness {
        let api = Arc::new(api);
        let push = Arc::new(MockPush::default());
        let notifier = Arc::new(RecordingNotifier::default());
        let series = SeriesStore::new();

        let mut endpoints = Endpoints::new(api.clone());
        if with_push {
            endpoints = endpoints.with_push(push.clone());
        }
        let config = DashboardConfig::default().with_interval_secs(5);
        let controller = MonitoringController::new(
            config,
            endpoints,
            Reconciler::new(series.clone()),
            notifier.clone(),
        );

        Harness {
            api,
            push,
            notifier,
            series,
            controller,
        }
    }

    fn values(series: &SeriesStore) -> Vec<f64> {
        series.points().iter().map(|p| p.value).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn double_start_keeps_a_single_timer() {
        let h = harness(MockApi::with_latest(vec![json!(50)]), false);

        h.controller.start();
        h.controller.start();
        time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(h.api.fetches(), 1);
        assert_eq!(values(&h.series), vec![50.0]);
        assert_eq!(h.controller.status().state, MonitoringState::Active);
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_append_in_order() {
        let api = MockApi::default();
        api.push_latest(vec![json!(1), json!(2)]);
        api.push_latest(vec![json!(3)]);
        let h = harness(api, false);

        h.controller.start();
        time::sleep(Duration::from_millis(10_100)).await;

        assert_eq!(h.api.fetches(), 2);
        assert_eq!(values(&h.series), vec![1.0, 2.0, 3.0]);
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn failed_tick_does_not_cancel_timer() {
        let api = MockApi::default();
        api.push_failure();
        api.push_latest(vec![json!(42)]);
        let h = harness(api, false);

        h.controller.start();
        time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(h.controller.status().message, "Error");
        assert!(h.controller.is_running());

        time::sleep(Duration::from_secs(5)).await;
        assert_eq!(h.api.fetches(), 2);
        assert_eq!(values(&h.series), vec![42.0]);
        assert!(h.notifier.kinds().contains(&NotificationKind::Error));
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent() {
        let h = harness(MockApi::default(), false);

        h.controller.stop();
        h.controller.stop();
        assert!(!h.controller.is_running());
        assert_eq!(h.controller.status(), MonitoringStatus::inactive("Stopped"));

        h.controller.start();
        h.controller.stop();
        h.controller.stop();
        assert!(!h.controller.is_running());

        time::sleep(Duration::from_secs(20)).await;
        assert_eq!(h.api.fetches(), 0);
    }

    #[tokio::test]
    async fn tardy_manual_fetch_is_discarded() {
        let h = harness(MockApi::with_latest(vec![json!(10), json!(20)]), false);
        h.series.append(vec![crate::metrics::SamplePoint::new("08:00", 1.0)]);
        let release = h.api.hold_next_fetch();

        let controller = h.controller.clone();
        let pending = tokio::spawn(async move { controller.fetch_now().await });
        while h.api.fetches() == 0 {
            tokio::task::yield_now().await;
        }

        h.controller.stop();
        release.send(()).unwrap();
        let outcome = pending.await.unwrap().unwrap();

        assert!(outcome.is_none());
        assert_eq!(values(&h.series), vec![1.0]);
    }

    #[tokio::test]
    async fn manual_fetch_replaces_with_spacing() {
        let h = harness(MockApi::with_latest(vec![json!(10), json!("x"), json!(30)]), false);
        h.series.append(vec![crate::metrics::SamplePoint::new("08:00", 1.0)]);

        let outcome = h.controller.fetch_now().await.unwrap().unwrap();

        assert_eq!(outcome, ReconcileOutcome { accepted: 2, dropped: 1 });
        assert_eq!(values(&h.series), vec![10.0, 30.0]);
        assert_eq!(h.controller.status(), MonitoringStatus::inactive("OK"));
        assert!(h.notifier.messages().contains(&"Data fetched successfully!".to_string()));
    }

    #[tokio::test]
    async fn manual_fetch_failure_is_reported() {
        let api = MockApi::default();
        api.push_failure();
        let h = harness(api, false);

        let err = h.controller.fetch_now().await.unwrap_err();
        assert!(matches!(err, DashboardError::Network(_)));
        assert_eq!(h.controller.status().message, "Error");
        assert_eq!(h.notifier.kinds().last(), Some(&NotificationKind::Error));
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_tears_down_before_restart() {
        let h = harness(MockApi::with_latest(vec![json!(7)]), false);

        h.controller.start();
        h.controller.set_interval(2);
        h.controller.set_interval(3);
        assert!(h.controller.is_running());
        assert_eq!(h.controller.config().interval_secs, 3);

        time::sleep(Duration::from_millis(3_100)).await;
        assert_eq!(h.api.fetches(), 1);
        assert_eq!(values(&h.series), vec![7.0]);
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn reconfigure_while_idle_does_not_start() {
        let h = harness(MockApi::with_latest(vec![json!(7)]), false);

        h.controller.set_interval(1);
        time::sleep(Duration::from_secs(3)).await;
        assert!(!h.controller.is_running());
        assert_eq!(h.api.fetches(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn push_updates_append_and_notifications_do_not_touch_series() {
        let h = harness(MockApi::default(), true);
        let tx = h.push.channel();

        h.controller.start();
        tx.unbounded_send(Ok(PushMessage::Update {
            valores: vec![json!(12), json!("13")],
        }))
        .unwrap();
        tx.unbounded_send(Ok(PushMessage::Notification {
            message: "Gateway restarted".to_string(),
            notification_type: Some("error".to_string()),
        }))
        .unwrap();
        tx.unbounded_send(Err(DashboardError::Parse("bad frame".to_string())))
            .unwrap();
        tx.unbounded_send(Ok(PushMessage::Update { valores: vec![json!(14)] }))
            .unwrap();
        time::sleep(Duration::from_millis(100)).await;

        assert_eq!(h.push.connections(), 1);
        assert_eq!(values(&h.series), vec![12.0, 13.0, 14.0]);
        assert_eq!(h.controller.status().message, "Updated with 1 values (Real-time)");
        assert!(h.notifier.messages().contains(&"Gateway restarted".to_string()));
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn push_update_after_stop_leaves_series_alone() {
        let h = harness(MockApi::default(), true);
        let tx = h.push.channel();

        h.controller.start();
        tx.unbounded_send(Ok(PushMessage::Update { valores: vec![json!(21)] }))
            .unwrap();
        time::sleep(Duration::from_millis(100)).await;
        assert_eq!(values(&h.series), vec![21.0]);

        h.controller.stop();
        // The receiver may already be gone with the aborted task
        let _ = tx.unbounded_send(Ok(PushMessage::Update { valores: vec![json!(99)] }));
        time::sleep(Duration::from_secs(10)).await;

        assert_eq!(values(&h.series), vec![21.0]);
        assert_eq!(h.controller.status(), MonitoringStatus::inactive("Stopped"));
    }

    #[tokio::test(start_paused = true)]
    async fn late_push_update_from_previous_run_is_discarded() {
        let h = harness(MockApi::default(), true);
        let first = h.push.channel();
        let ctx = SourceContext {
            reconciler: h.controller.inner.reconciler.clone(),
            notifier: h.notifier.clone(),
            status: h.controller.inner.status.clone(),
            generation: h.controller.inner.reconciler.advance_generation(),
        };
        // A push task from a run that has since been stopped, still draining
        let stale = tokio::spawn(push_loop(ctx, h.push.clone()));
        time::sleep(Duration::from_millis(10)).await;

        h.controller.stop();
        first
            .unbounded_send(Ok(PushMessage::Update { valores: vec![json!(99)] }))
            .unwrap();
        time::sleep(Duration::from_millis(100)).await;

        assert!(values(&h.series).is_empty());
        assert_eq!(h.controller.status(), MonitoringStatus::inactive("Stopped"));
        stale.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn closed_push_channel_falls_back_to_polling() {
        let h = harness(MockApi::with_latest(vec![json!(5)]), true);
        let tx = h.push.channel();

        h.controller.start();
        drop(tx);
        time::sleep(Duration::from_millis(5_100)).await;

        assert!(h.controller.is_running());
        assert_eq!(values(&h.series), vec![5.0]);
        assert!(h
            .notifier
            .messages()
            .contains(&"Real-time channel closed. Falling back to polling.".to_string()));
        h.controller.stop();
    }

    #[tokio::test(start_paused = true)]
    async fn refused_push_channel_keeps_polling() {
        let h = harness(MockApi::with_latest(vec![json!(8)]), true);

        h.controller.start();
        time::sleep(Duration::from_millis(5_100)).await;

        assert_eq!(h.push.connections(), 1);
        assert!(h.controller.is_running());
        assert_eq!(values(&h.series), vec![8.0]);
        h.controller.stop();
    }
}
