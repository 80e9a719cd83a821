//! Anomaly detection agent
//!
//! Wires the detector to newline-delimited JSON on stdin, emits anomalies as
//! JSON lines and serves health, stats and metrics over HTTP.

pub mod api;
pub mod config;
pub mod ingest;
pub mod output;
