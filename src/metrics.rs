//! Monitoring metrics.
//!
//! A [`Metrics`] value is assembled over the course of one scheduler tick
//! (potentially covering several trust anchors) and handed to the
//! [`MetricsListener`][crate::fetch::notify::MetricsListener] as fetch
//! events come in. It is deliberately a plain data snapshot rather than
//! something with live counters so it can be handed off to a reporting
//! sink without further synchronization.

use std::collections::HashMap;
use std::time::Duration;
use chrono::{DateTime, Utc};
use rpki::uri;


//------------ Metrics ---------------------------------------------------------

/// A snapshot of the metrics collected during one or more validation runs.
#[derive(Clone, Debug)]
pub struct Metrics {
    /// When these metrics were collected.
    time: DateTime<Utc>,

    /// Per-TAL metrics, keyed by the TAL's name.
    tals: HashMap<String, TalMetrics>,

    /// Per-rsync-module fetch metrics.
    rsync: Vec<RsyncFetchMetrics>,
}

impl Metrics {
    /// Creates a new, empty metrics snapshot.
    pub fn new() -> Self {
        Metrics { time: Utc::now(), tals: HashMap::new(), rsync: Vec::new() }
    }

    /// Returns the mutable per-TAL metrics, creating an entry if needed.
    pub fn tal_mut(&mut self, name: &str) -> &mut TalMetrics {
        self.tals.entry(name.to_string())
            .or_insert_with(|| TalMetrics::new(name.to_string()))
    }

    /// Records an rsync fetch outcome.
    pub fn push_rsync(&mut self, metrics: RsyncFetchMetrics) {
        self.rsync.push(metrics)
    }

    /// Returns the time these metrics were collected.
    pub fn time(&self) -> DateTime<Utc> {
        self.time
    }

    /// Returns the per-TAL metrics.
    pub fn tals(&self) -> impl Iterator<Item = &TalMetrics> {
        self.tals.values()
    }

    /// Returns the rsync fetch metrics.
    pub fn rsync(&self) -> &[RsyncFetchMetrics] {
        &self.rsync
    }

    /// Logs a human-readable summary at info level.
    pub fn log(&self) {
        log::info!("Validation summary:");
        for tal in self.tals.values() {
            log::info!(
                "{}: {} valid objects, {} invalid, {} repositories \
                 inconsistent",
                tal.name, tal.valid_objects, tal.invalid_objects,
                tal.repositories_inconsistent,
            )
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}


//------------ TalMetrics -------------------------------------------------------

/// Metrics collected for a single trust anchor during a run.
#[derive(Clone, Debug)]
pub struct TalMetrics {
    /// The TAL's name.
    pub name: String,

    /// Time spent extracting (fetching + validating) the TA certificate.
    pub extracted_elapsed: Option<Duration>,

    /// Time spent on the full top-down walk.
    pub validation_elapsed: Option<Duration>,

    /// Total number of repositories (publication points) visited.
    pub repositories_total: u32,

    /// Number of repositories whose fetched file set was incomplete or
    /// inconsistent with the manifest.
    pub repositories_inconsistent: u32,

    /// Number of objects that validated successfully.
    pub valid_objects: u32,

    /// Number of objects that failed validation.
    pub invalid_objects: u32,
}

impl TalMetrics {
    pub(crate) fn new(name: String) -> Self {
        TalMetrics {
            name,
            extracted_elapsed: None,
            validation_elapsed: None,
            repositories_total: 0,
            repositories_inconsistent: 0,
            valid_objects: 0,
            invalid_objects: 0,
        }
    }
}


//------------ RsyncFetchMetrics -------------------------------------------------

/// Metrics for a single rsync invocation.
#[derive(Clone, Debug)]
pub struct RsyncFetchMetrics {
    /// The module (host + module name) that was fetched.
    pub module: uri::Rsync,

    /// Whether the fetch succeeded.
    pub success: bool,

    /// How long the invocation took.
    pub duration: Duration,
}
