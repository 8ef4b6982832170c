//! The notifying fetcher: dispatches lifecycle events to a set of
//! registered listeners after each fetch attempt, without letting a
//! misbehaving listener take down the validation run.
//!
//! Grounded on the component design's event-bus replacement for the
//! original's stackable-trait design: listeners are independent observers,
//! not further links in the chain, so adding one (say, a ROA collector)
//! never changes fetch semantics.

use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Mutex;
use rpki::uri;
use crate::object::{FetchSpec, StoredRepositoryObject, ValidatedObject};
use crate::validation::{ValidationCheck, ValidationResult};
use super::Fetcher;

/// An observer of fetch and validation outcomes.
///
/// All six hooks have empty default bodies so a listener only needs to
/// implement the ones it cares about. The `after_validate_*` pair is the
/// "validated-objects-ready" event the notification design calls for: the
/// walker drives these directly (it's the one component that ever holds a
/// fully validated object), rather than routing them through
/// [`NotifyingFetcher`], which only ever sees raw bytes.
pub trait FetchListener: Send + Sync {
    fn after_fetch_success(&self, _uri: &uri::Rsync, _object: &StoredRepositoryObject) { }
    fn after_fetch_failure(&self, _uri: &uri::Rsync) { }
    fn after_prefetch_success(&self, _uri: &uri::Rsync) { }
    fn after_prefetch_failure(&self, _uri: &uri::Rsync) { }
    fn after_validate_success(&self, _validated: &ValidatedObject) { }
    fn after_validate_failure(&self, _uri: &uri::Rsync, _checks: &[ValidationCheck]) { }
}

/// Wraps an inner fetcher, broadcasting lifecycle events to every
/// registered listener.
pub struct NotifyingFetcher {
    inner: Box<dyn Fetcher>,
    listeners: Vec<Box<dyn FetchListener>>,
}

impl NotifyingFetcher {
    pub fn new(inner: Box<dyn Fetcher>, listeners: Vec<Box<dyn FetchListener>>) -> Self {
        NotifyingFetcher { inner, listeners }
    }

    fn notify(&self, f: impl Fn(&dyn FetchListener)) {
        for listener in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| f(listener.as_ref()))).is_err() {
                log::error!("A fetch listener panicked; continuing without it.");
            }
        }
    }
}

impl Fetcher for NotifyingFetcher {
    fn prefetch(&self, uris: &[uri::Rsync], result: &mut ValidationResult) {
        self.inner.prefetch(uris, result);
        for uri in uris {
            if result.checks_at(uri).iter().any(|c| c.status == crate::validation::CheckStatus::Failed) {
                self.notify(|l| l.after_prefetch_failure(uri));
            } else {
                self.notify(|l| l.after_prefetch_success(uri));
            }
        }
    }

    fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        result: &mut ValidationResult,
    ) -> Option<StoredRepositoryObject> {
        match self.inner.fetch(uri, spec, result) {
            Some(object) => {
                self.notify(|l| l.after_fetch_success(uri, &object));
                Some(object)
            }
            None => {
                self.notify(|l| l.after_fetch_failure(uri));
                None
            }
        }
    }

    fn fetch_consistent_set(
        &self,
        base: &uri::Rsync,
        entries: &[(String, FetchSpec)],
        result: &mut ValidationResult,
    ) -> Option<Vec<(String, StoredRepositoryObject)>> {
        self.inner.fetch_consistent_set(base, entries, result)
    }
}


//------------ built-in listeners -------------------------------------------------

/// Logs every fetch outcome at debug level.
pub struct LoggingListener;

impl FetchListener for LoggingListener {
    fn after_fetch_success(&self, uri: &uri::Rsync, _object: &StoredRepositoryObject) {
        log::debug!("Fetched {}", uri);
    }

    fn after_fetch_failure(&self, uri: &uri::Rsync) {
        log::debug!("Failed to fetch {}", uri);
    }

    fn after_prefetch_success(&self, uri: &uri::Rsync) {
        log::debug!("Prefetched {}", uri);
    }

    fn after_prefetch_failure(&self, uri: &uri::Rsync) {
        log::debug!("Failed to prefetch {}", uri);
    }
}

/// Counts fetch outcomes per trust anchor directory, for the object-count
/// fields of [`TalMetrics`][crate::metrics::TalMetrics].
///
/// The engine reads these counters back out after a walk completes and
/// folds them into the run's [`Metrics`] snapshot; the listener itself
/// stays oblivious to which TAL it's counting for, since a fresh one is
/// built per walk.
pub struct MetricsListener {
    valid: std::sync::atomic::AtomicU32,
    invalid: std::sync::atomic::AtomicU32,
}

impl MetricsListener {
    pub fn new() -> Self {
        MetricsListener {
            valid: std::sync::atomic::AtomicU32::new(0),
            invalid: std::sync::atomic::AtomicU32::new(0),
        }
    }

    pub fn valid_count(&self) -> u32 {
        self.valid.load(std::sync::atomic::Ordering::Relaxed)
    }

    pub fn invalid_count(&self) -> u32 {
        self.invalid.load(std::sync::atomic::Ordering::Relaxed)
    }
}

impl Default for MetricsListener {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchListener for MetricsListener {
    fn after_fetch_success(&self, _uri: &uri::Rsync, _object: &StoredRepositoryObject) {
        self.valid.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }

    fn after_fetch_failure(&self, _uri: &uri::Rsync) {
        self.invalid.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

/// Collects every object the walker has validated (or failed to) into a
/// flat map, keyed by URI.
///
/// This is what the top-down walker's own code used to do directly, in
/// violation of the notification design: the walker drives this listener's
/// `after_validate_*` hooks as it goes, and the engine reads the finished
/// map back out with [`snapshot`][Self::snapshot] once the walk completes.
/// Named for the object kind the design calls out explicitly (the ROA
/// collector), though it accumulates every validated kind the walker
/// visits, not ROAs alone.
pub struct RoaCollectorListener {
    objects: Mutex<HashMap<uri::Rsync, ValidatedObject>>,
}

impl RoaCollectorListener {
    pub fn new() -> Self {
        RoaCollectorListener { objects: Mutex::new(HashMap::new()) }
    }

    /// Returns a copy of everything collected so far.
    pub fn snapshot(&self) -> HashMap<uri::Rsync, ValidatedObject> {
        self.objects.lock().unwrap().clone()
    }
}

impl Default for RoaCollectorListener {
    fn default() -> Self {
        Self::new()
    }
}

impl FetchListener for RoaCollectorListener {
    fn after_validate_success(&self, validated: &ValidatedObject) {
        self.objects.lock().unwrap().insert(validated.uri().clone(), validated.clone());
    }

    fn after_validate_failure(&self, uri: &uri::Rsync, checks: &[ValidationCheck]) {
        self.objects.lock().unwrap().insert(uri.clone(), ValidatedObject::Invalid {
            uri: uri.clone(), checks: checks.to_vec(),
        });
    }
}
