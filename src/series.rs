use crate::metrics::{SamplePoint, Statistics};
use chrono::Local;
use statrs::statistics::Statistics as Stats;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// What observers see: the series and the statistics computed from it,
/// always published together.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SeriesView {
    pub points: Vec<SamplePoint>,
    pub statistics: Statistics,
}

/// Owner of the live series. Cloning yields another handle onto the same
/// store.
#[derive(Debug, Clone)]
pub struct SeriesStore {
    tx: Arc<watch::Sender<SeriesView>>,
}

impl Default for SeriesStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SeriesStore {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(SeriesView::default());
        Self { tx: Arc::new(tx) }
    }

    pub fn append(&self, points: Vec<SamplePoint>) {
        if points.is_empty() {
            return;
        }
        self.tx.send_modify(|view| {
            view.points.extend(points);
            view.statistics = statistics(&view.points);
            debug!(len = view.points.len(), "Series appended");
        });
    }

    pub fn replace(&self, points: Vec<SamplePoint>) {
        self.tx.send_modify(|view| {
            view.points = points;
            view.statistics = statistics(&view.points);
            debug!(len = view.points.len(), "Series replaced");
        });
    }

    pub fn clear(&self) {
        self.tx.send_modify(|view| {
            view.points.clear();
            view.statistics = Statistics::EMPTY;
        });
    }

    pub fn snapshot(&self) -> SeriesView {
        self.tx.borrow().clone()
    }

    pub fn points(&self) -> Vec<SamplePoint> {
        self.tx.borrow().points.clone()
    }

    pub fn statistics(&self) -> Statistics {
        self.tx.borrow().statistics.clone()
    }

    pub fn len(&self) -> usize {
        self.tx.borrow().points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn subscribe(&self) -> watch::Receiver<SeriesView> {
        self.tx.subscribe()
    }
}

/// Current, peak and one-decimal average of a series; the zero sentinel
/// for an empty one.
pub fn statistics(points: &[SamplePoint]) -> Statistics {
    let Some(last) = points.last() else {
        return Statistics::EMPTY;
    };

    let values = points.iter().map(|p| p.value);
    let peak = Stats::max(values.clone());
    let mean = Stats::mean(values);

    Statistics {
        current: last.value,
        peak,
        average: round_one_decimal(mean),
        last_updated: Some(Local::now()),
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn points(values: &[f64]) -> Vec<SamplePoint> {
        values.iter().map(|&v| SamplePoint::new("12:00", v)).collect()
    }

    fn values(store: &SeriesStore) -> Vec<f64> {
        store.points().iter().map(|p| p.value).collect()
    }

    #[test]
    fn statistics_track_last_max_and_mean() {
        let stats = statistics(&points(&[42.0, 47.0, 53.0, 49.0, 58.0]));
        assert_eq!(stats.current, 58.0);
        assert_eq!(stats.peak, 58.0);
        assert_eq!(stats.average, 49.8);
        assert!(stats.last_updated.is_some());

        let stats = statistics(&points(&[1.0, 2.0, 2.0]));
        assert_eq!(stats.average, 1.7);
        assert_eq!(stats.current, 2.0);
    }

    #[test]
    fn statistics_of_nothing_is_the_sentinel() {
        assert_eq!(statistics(&[]), Statistics::EMPTY);
    }

    #[test]
    fn append_keeps_order_and_replace_discards() {
        let store = SeriesStore::new();
        store.append(points(&[1.0, 2.0]));
        store.append(points(&[3.0]));
        assert_eq!(values(&store), vec![1.0, 2.0, 3.0]);

        store.replace(points(&[9.0]));
        assert_eq!(values(&store), vec![9.0]);
        assert_eq!(store.statistics().current, 9.0);
    }

    #[test]
    fn empty_append_is_a_no_op() {
        let store = SeriesStore::new();
        let mut rx = store.subscribe();
        store.append(Vec::new());
        assert!(!rx.has_changed().unwrap());
        assert!(store.is_empty());
    }

    #[test]
    fn clear_resets_to_sentinel() {
        let store = SeriesStore::new();
        store.append(points(&[10.0, 20.0]));
        store.clear();
        assert!(store.is_empty());
        assert_eq!(store.statistics(), Statistics::EMPTY);
        assert!(!store.statistics().average.is_nan());
    }

    #[test]
    fn observers_see_statistics_matching_points() {
        let store = SeriesStore::new();
        let mut rx = store.subscribe();
        store.append(points(&[5.0, 15.0]));

        assert!(rx.has_changed().unwrap());
        let view = rx.borrow_and_update().clone();
        assert_eq!(view.points.len(), 2);
        assert_eq!(view.statistics.current, 15.0);
        assert_eq!(view.statistics.peak, 15.0);
        assert_eq!(view.statistics.average, 10.0);
    }
}
