//! The trust-anchor scheduler.
//!
//! Decides which trust anchors are due for another validation run, keeps
//! at most one run per anchor in flight, and publishes the most recent
//! validated-object map for each. There's no async-STM crate in this
//! ecosystem worth pulling in for what is, in practice, a handful of
//! compare-and-swap style updates a few times an hour; a mutex guarding an
//! `Arc` and copy-on-write updates gets the same semantics.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use rpki::uri;
use crate::error::Failed;
use crate::object::{ValidObjectData, ValidatedObject, ValidationContext};
use crate::tal::Tal;
use crate::trust_anchor::{
    CrlSummary, ManifestSummary, RunOutcome, TrustAnchor, TrustAnchorStatus, TrustAnchors,
};

/// A snapshot of everything the scheduler currently knows: the trust
/// anchors and their state, and the most recently published validated
/// object map per anchor.
#[derive(Clone, Debug, Default)]
pub struct MemoryImage {
    pub trust_anchors: TrustAnchors,
    pub validated_objects: HashMap<String, Arc<HashMap<uri::Rsync, ValidatedObject>>>,
}

/// A shared, swappable handle to the current [`MemoryImage`].
///
/// This is the "poor man's STM": readers clone the `Arc<MemoryImage>` out
/// from under the mutex (a pointer copy) and never hold the lock while
/// doing real work; writers take the lock only long enough to compute and
/// install a new `Arc<MemoryImage>`.
pub type Ref<T> = Arc<Mutex<Arc<T>>>;

/// Schedules and tracks trust anchor validation runs.
pub struct TrustAnchorScheduler {
    image: Ref<MemoryImage>,
    refresh: Duration,
    retry: Duration,
}

impl TrustAnchorScheduler {
    pub fn new(trust_anchors: TrustAnchors, refresh: Duration, retry: Duration) -> Self {
        let image = MemoryImage { trust_anchors, validated_objects: HashMap::new() };
        TrustAnchorScheduler {
            image: Arc::new(Mutex::new(Arc::new(image))),
            refresh, retry,
        }
    }

    /// Returns a cheap snapshot of the current state.
    pub fn snapshot(&self) -> Arc<MemoryImage> {
        self.image.lock().unwrap().clone()
    }

    /// Returns the names of every enabled trust anchor that is currently
    /// idle and due (its last run's `next_run_at` has passed, or it has
    /// never run).
    pub fn due_anchors(&self, now: SystemTime) -> Vec<String> {
        self.snapshot().trust_anchors.iter()
            .filter(|a| a.enabled)
            .filter(|a| match &a.status {
                TrustAnchorStatus::Idle { last_run: None } => true,
                TrustAnchorStatus::Idle { last_run: Some(run) } => run.next_run_at <= now,
                TrustAnchorStatus::Running { .. } => false,
            })
            .map(|a| a.name().to_string())
            .collect()
    }

    /// Atomically transitions `name` from idle to running.
    ///
    /// Returns `Err(Failed)` if the anchor is unknown, disabled, or
    /// already running -- the scheduler's mutual-exclusion guarantee: at
    /// most one run per trust anchor is ever in flight.
    pub fn start_processing(&self, name: &str, now: SystemTime) -> Result<(), Failed> {
        let mut guard = self.image.lock().unwrap();
        let current = guard.trust_anchors.get(name).ok_or(Failed)?;
        if !current.enabled {
            return Err(Failed)
        }
        if matches!(current.status, TrustAnchorStatus::Running { .. }) {
            return Err(Failed)
        }
        let updated = guard.trust_anchors.with_updated(name, |a| {
            let mut a = a.clone();
            a.status = TrustAnchorStatus::Running { started_at: now };
            a
        });
        *guard = Arc::new(MemoryImage {
            trust_anchors: updated,
            validated_objects: guard.validated_objects.clone(),
        });
        Ok(())
    }

    /// Atomically records the outcome of a completed run and schedules the
    /// next one.
    ///
    /// A validation run that fails only because the trust anchor's
    /// certificate no longer matches the TAL's declared public key is
    /// scheduled for retry on the same `refresh` interval as success,
    /// rather than the shorter `retry` interval -- that behavior is
    /// preserved here unchanged; see `DESIGN.md` for why.
    pub fn finish_processing(
        &self,
        name: &str,
        now: SystemTime,
        succeeded: bool,
        public_key_mismatch: bool,
        error: Option<crate::error::RunFailed>,
        objects: HashMap<uri::Rsync, ValidatedObject>,
    ) {
        let mut guard = self.image.lock().unwrap();
        let interval = if succeeded || public_key_mismatch { self.refresh } else { self.retry };
        let outcome = RunOutcome {
            finished_at: now,
            succeeded,
            error: error.map(|e| e.as_str().to_string()),
            next_run_at: now + interval,
        };

        // Extract the anchor cert, its top manifest, and its CRL out of the
        // freshly validated map before it's moved into `validated_objects`
        // below -- the component design's Success-path extraction chain.
        let mut extraction = if succeeded {
            guard.trust_anchors.get(name).map(|a| extract_ta_state(&a.tal, &objects))
        } else {
            None
        };

        let updated = guard.trust_anchors.with_updated(name, |a| {
            let mut a = a.clone();
            a.status = TrustAnchorStatus::Idle { last_run: Some(outcome.clone()) };
            if let Some((certificate, manifest, crl)) = extraction.take() {
                a.certificate = certificate;
                a.manifest = manifest;
                a.crl = crl;
            }
            a
        });
        let mut validated_objects = guard.validated_objects.clone();
        if succeeded {
            validated_objects.insert(name.to_string(), Arc::new(objects));
        }
        *guard = Arc::new(MemoryImage { trust_anchors: updated, validated_objects });
    }
}

/// Extracts the trust anchor certificate, its top manifest, and its CRL
/// out of a freshly validated object map, per the Success-path extraction
/// chain: `map[tal.certificateLocation]` -> cert -> `map[cert.manifestUri]`
/// -> manifest -> `map[manifest.crlUri]` -> CRL.
///
/// Each step is best-effort: a map missing one of these (e.g. the
/// public-key-mismatch scenario, whose map holds only a single
/// `InvalidObject` entry) simply yields `None` for that and the steps
/// depending on it, not an error.
fn extract_ta_state(
    tal: &Tal,
    objects: &HashMap<uri::Rsync, ValidatedObject>,
) -> (Option<Arc<ValidationContext>>, Option<ManifestSummary>, Option<CrlSummary>) {
    let certificate = tal.certificate_locations().iter().find_map(|uri| {
        match objects.get(uri) {
            Some(ValidatedObject::Valid { object, .. }) => match object.as_ref() {
                ValidObjectData::Cert(ctx) => Some(ctx.clone()),
                _ => None,
            },
            _ => None,
        }
    });

    let manifest = certificate.as_ref().and_then(|ctx| {
        match objects.get(ctx.rpki_manifest()) {
            Some(ValidatedObject::Valid { object, .. }) => match object.as_ref() {
                ValidObjectData::Manifest { file_names, crl_uri, next_update_time, .. } => {
                    Some(ManifestSummary {
                        file_names: file_names.clone(),
                        crl_uri: crl_uri.clone(),
                        next_update_time: *next_update_time,
                    })
                }
                _ => None,
            },
            _ => None,
        }
    });

    let crl = manifest.as_ref().and_then(|m| {
        match objects.get(&m.crl_uri) {
            Some(ValidatedObject::Valid { object, .. }) => match object.as_ref() {
                ValidObjectData::Crl { next_update_time } => {
                    Some(CrlSummary { next_update_time: *next_update_time })
                }
                _ => None,
            },
            _ => None,
        }
    });

    (certificate, manifest, crl)
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::tal::Tal;

    fn test_tal(name: &str) -> Tal {
        let content = format!(
            "rsync://example.org/{}/ta.cer\n\n{}\n", name, base64::encode([0u8; 32])
        );
        Tal::read_named(name.into(), &mut content.as_bytes()).unwrap()
    }

    #[test]
    fn start_processing_is_mutually_exclusive() {
        let anchors = TrustAnchors::new(vec![TrustAnchor::new(test_tal("a"))]);
        let scheduler = TrustAnchorScheduler::new(
            anchors, Duration::from_secs(4 * 3600), Duration::from_secs(3600),
        );
        let now = SystemTime::now();
        scheduler.start_processing("a", now).unwrap();
        assert!(scheduler.start_processing("a", now).is_err());
    }

    #[test]
    fn finish_processing_reschedules_and_publishes() {
        let anchors = TrustAnchors::new(vec![TrustAnchor::new(test_tal("a"))]);
        let scheduler = TrustAnchorScheduler::new(
            anchors, Duration::from_secs(4 * 3600), Duration::from_secs(3600),
        );
        let now = SystemTime::now();
        scheduler.start_processing("a", now).unwrap();
        scheduler.finish_processing("a", now, true, false, None, HashMap::new());

        let snapshot = scheduler.snapshot();
        let anchor = snapshot.trust_anchors.get("a").unwrap();
        assert!(matches!(anchor.status, TrustAnchorStatus::Idle { .. }));
        assert!(snapshot.validated_objects.contains_key("a"));
        assert!(scheduler.due_anchors(now).is_empty());
    }

    #[test]
    fn public_key_mismatch_reschedules_on_refresh_interval() {
        let anchors = TrustAnchors::new(vec![TrustAnchor::new(test_tal("a"))]);
        let scheduler = TrustAnchorScheduler::new(
            anchors, Duration::from_secs(4 * 3600), Duration::from_secs(60),
        );
        let now = SystemTime::now();
        scheduler.start_processing("a", now).unwrap();
        scheduler.finish_processing(
            "a", now, false, true,
            Some(crate::error::RunFailed::message("public key mismatch")),
            HashMap::new(),
        );

        let snapshot = scheduler.snapshot();
        let run = match &snapshot.trust_anchors.get("a").unwrap().status {
            TrustAnchorStatus::Idle { last_run: Some(run) } => run.clone(),
            _ => panic!("expected an idle anchor with a recorded run"),
        };
        assert_eq!(run.next_run_at, now + Duration::from_secs(4 * 3600));
    }
}
