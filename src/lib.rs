//! Client data layer for a live network speed dashboard, plus the
//! companion telemetry server it talks to.

pub mod api;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod history;
pub mod metrics;
pub mod monitor;
pub mod notify;
pub mod reconcile;
pub mod samples;
pub mod series;
pub mod storage;
pub mod web;
