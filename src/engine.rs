//! Wires the fetcher chain together and drives one end-to-end validation
//! run across every due trust anchor.

use std::sync::Arc;
use std::time::SystemTime;
use crate::config::Config;
use crate::error::Failed;
use crate::fetch::caching::CachingFetcher;
use crate::fetch::consistent::ConsistentFetcher;
use crate::fetch::notify::{
    FetchListener, LoggingListener, MetricsListener, NotifyingFetcher, RoaCollectorListener,
};
use crate::fetch::remote::{ProcessRsyncExecutor, RemoteFetcher};
use crate::fetch::validating::ValidatingFetcher;
use crate::fetch::Fetcher;
use crate::metrics::Metrics;
use crate::scheduler::TrustAnchorScheduler;
use crate::store::{ObjectStore, SledObjectStore};
use crate::tal::Tal;
use crate::trust_anchor::{TrustAnchor, TrustAnchors};
use crate::walker::TopDownWalker;

/// Builds one fully-wired fetcher chain, injecting the validating layer's
/// back-reference to the outermost link once everything exists.
///
/// Grounded on the component design's note that the chain has to be
/// assembled bottom-up but the validating layer needs a reference to the
/// *top*: we build every layer as an owned value first, hand the
/// validating layer a raw pointer's worth of indirection (a `Weak`) once
/// the final `Arc` exists, and return that `Arc` as the thing callers
/// actually drive.
pub struct EngineBuilder {
    store: Arc<dyn ObjectStore>,
    config: Config,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Result<Self, Failed> {
        std::fs::create_dir_all(&config.store_dir).map_err(|err| {
            log::error!("Failed to create store directory: {}", err);
            Failed
        })?;
        let store = Arc::new(SledObjectStore::open(&config.store_dir)?);
        Ok(EngineBuilder { store, config })
    }

    /// Assembles one chain for a single trust-anchor walk, along with the
    /// listeners that will observe it.
    fn build_chain(&self) -> (Arc<ValidatingFetcherHandle>, Arc<MetricsListener>, Arc<RoaCollectorListener>) {
        let remote = Box::new(RemoteFetcher::new(
            Box::new(ProcessRsyncExecutor::new(&self.config)), &self.config,
        ));
        let consistent = Box::new(ConsistentFetcher::new(remote, self.store.clone()));
        let validating = Arc::new(ValidatingFetcher::new(
            consistent, self.config.strict, self.config.stale,
        ));

        let metrics_listener = Arc::new(MetricsListener::new());
        let roa_listener = Arc::new(RoaCollectorListener::new());
        let listeners: Vec<Box<dyn FetchListener>> = vec![
            Box::new(LoggingListener),
            Box::new(ArcListener(metrics_listener.clone())),
            Box::new(ArcListener(roa_listener.clone())),
        ];

        let validating_as_fetcher = Box::new(DelegatingFetcher(validating.clone()));
        let notifying = Box::new(NotifyingFetcher::new(validating_as_fetcher, listeners));
        let caching: Arc<dyn Fetcher> = Arc::new(CachingFetcher::new(notifying));

        validating.set_outermost(Arc::downgrade(&caching));

        // The validating layer only holds a `Weak` reference to `caching`
        // (see `set_outermost`'s doc comment for why); the handle below
        // keeps the one strong `Arc` alive for the lifetime of the walk
        // that uses it.
        (Arc::new(ValidatingFetcherHandle(validating, caching)), metrics_listener, roa_listener)
    }

    /// Runs a single validation pass over every trust anchor the scheduler
    /// reports as due, one after another on the calling thread.
    ///
    /// Used directly by tests and by the `vrps` subcommand, which don't
    /// need the concurrency [`run_due_concurrently`][Self::run_due_concurrently]
    /// provides.
    pub fn run_due(&self, scheduler: &TrustAnchorScheduler) -> Metrics {
        let mut metrics = Metrics::new();
        let now = SystemTime::now();
        for (index, name) in scheduler.due_anchors(now).into_iter().enumerate() {
            if let Some(tal_metrics) = self.run_one(scheduler, &name, index, now) {
                *metrics.tal_mut(&name) = tal_metrics;
            }
        }
        metrics.log();
        metrics
    }

    /// Runs every due trust anchor concurrently, at most `max_concurrency`
    /// at a time, each on its own blocking thread.
    ///
    /// This is the concurrency model the validator actually runs under:
    /// one task per enabled trust anchor per scheduler tick, rather than
    /// per individual object -- a single walk is inherently sequential
    /// (each object's location depends on the manifest above it), so there
    /// is nothing smaller to parallelize within one anchor's tree.
    pub async fn run_due_concurrently(
        self: Arc<Self>,
        scheduler: Arc<TrustAnchorScheduler>,
        max_concurrency: usize,
    ) -> Metrics {
        let now = SystemTime::now();
        let due = scheduler.due_anchors(now);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(max_concurrency.max(1)));

        let mut tasks = Vec::with_capacity(due.len());
        for (index, name) in due.into_iter().enumerate() {
            let engine = self.clone();
            let scheduler = scheduler.clone();
            let semaphore = semaphore.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok()?;
                tokio::task::spawn_blocking(move || {
                    engine.run_one(&scheduler, &name, index, now).map(|m| (name, m))
                }).await.ok()?
            }));
        }

        let mut metrics = Metrics::new();
        for task in tasks {
            if let Ok(Some((name, tal_metrics))) = task.await {
                *metrics.tal_mut(&name) = tal_metrics;
            }
        }
        metrics.log();
        metrics
    }

    /// Validates a single trust anchor end to end: claims it on the
    /// scheduler, walks its hierarchy, and records the outcome.
    ///
    /// Returns `None` if the anchor could not be claimed (already
    /// running, disabled, or removed since `due_anchors` was computed) or
    /// is no longer known to the scheduler.
    fn run_one(
        &self,
        scheduler: &TrustAnchorScheduler,
        name: &str,
        index: usize,
        now: SystemTime,
    ) -> Option<crate::metrics::TalMetrics> {
        if scheduler.start_processing(name, now).is_err() {
            return None
        }
        let tal = scheduler.snapshot().trust_anchors.get(name)?.tal.clone();

        let (fetcher, metrics_listener, roa_listener) = self.build_chain();
        let started = std::time::Instant::now();
        let walker = TopDownWalker::new(&fetcher.0, &roa_listener, &self.config);
        let result = walker.run(&tal, index);
        let elapsed = started.elapsed();
        let objects = roa_listener.snapshot();

        let public_key_mismatch = result.all_checks().any(|(_, check)| {
            check.key == crate::validation::keys::TRUST_ANCHOR_PUBLIC_KEY_MATCH
                && check.status == crate::validation::CheckStatus::Failed
        });
        // A public-key mismatch is a completed run that found nothing
        // valid, not a failed one: its one-entry `InvalidObject` map is
        // still published, with `None` error, on the normal refresh
        // interval rather than the shorter retry one.
        let succeeded = !result.has_failures() || public_key_mismatch;

        let mut tal_metrics = crate::metrics::TalMetrics::new(name.to_string());
        tal_metrics.validation_elapsed = Some(elapsed);
        tal_metrics.valid_objects = metrics_listener.valid_count();
        tal_metrics.invalid_objects = metrics_listener.invalid_count();

        let error = if succeeded {
            None
        } else {
            let failing_checks = result.all_checks()
                .filter(|(_, c)| c.status == crate::validation::CheckStatus::Failed)
                .count();
            Some(crate::error::RunFailed::message(format!(
                "{} object(s) failed validation", failing_checks
            )))
        };

        scheduler.finish_processing(name, now, succeeded, public_key_mismatch, error, objects);
        Some(tal_metrics)
    }
}

/// Reads the currently enabled trust anchors out of the configured TAL
/// directory, building an initial [`TrustAnchors`] collection for the
/// scheduler.
pub fn load_trust_anchors(config: &Config) -> Result<TrustAnchors, Failed> {
    let tals = Tal::read_dir(&config.tal_dir).map_err(|err| {
        log::error!("Failed to read TAL directory {}: {}", config.tal_dir.display(), err);
        Failed
    })?;
    Ok(TrustAnchors::new(tals.into_iter().map(TrustAnchor::new).collect()))
}

/// A thin handle so `run_due` can hold the validating layer and the
/// strong reference that keeps the rest of the chain alive, without
/// exposing either to callers outside this module.
struct ValidatingFetcherHandle(Arc<ValidatingFetcher>, #[allow(dead_code)] Arc<dyn Fetcher>);

/// Adapts an `Arc<ValidatingFetcher>` to `Box<dyn Fetcher>` for the layers
/// above it, delegating every call straight through.
struct DelegatingFetcher(Arc<ValidatingFetcher>);

impl Fetcher for DelegatingFetcher {
    fn prefetch(&self, uris: &[rpki::uri::Rsync], result: &mut crate::validation::ValidationResult) {
        self.0.prefetch(uris, result)
    }

    fn fetch(
        &self,
        uri: &rpki::uri::Rsync,
        spec: &crate::object::FetchSpec,
        result: &mut crate::validation::ValidationResult,
    ) -> Option<crate::object::StoredRepositoryObject> {
        self.0.fetch(uri, spec, result)
    }
}

/// Adapts an `Arc<T: FetchListener>` so the same listener instance can be
/// shared between the notifying fetcher and the code that reads its
/// counters back out afterwards.
struct ArcListener<T>(Arc<T>);

impl<T: FetchListener> FetchListener for ArcListener<T> {
    fn after_fetch_success(&self, uri: &rpki::uri::Rsync, object: &crate::object::StoredRepositoryObject) {
        self.0.after_fetch_success(uri, object)
    }
    fn after_fetch_failure(&self, uri: &rpki::uri::Rsync) {
        self.0.after_fetch_failure(uri)
    }
    fn after_prefetch_success(&self, uri: &rpki::uri::Rsync) {
        self.0.after_prefetch_success(uri)
    }
    fn after_prefetch_failure(&self, uri: &rpki::uri::Rsync) {
        self.0.after_prefetch_failure(uri)
    }
}
