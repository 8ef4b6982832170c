//! Trust anchor state.
//!
//! A [`TrustAnchor`] pairs an immutable [`Tal`] with the mutable state the
//! scheduler tracks across runs: whether it is currently being validated,
//! when it was last run, and the outcome of that run. Values here are
//! plain, cheaply-cloned data -- the mutual-exclusion and persistence
//! concerns live in [`crate::scheduler`].

use std::sync::Arc;
use std::time::SystemTime;
use rpki::repository::x509::Time;
use rpki::uri;
use crate::object::ValidationContext;
use crate::tal::Tal;

/// One trust anchor and everything the scheduler knows about it.
#[derive(Clone, Debug)]
pub struct TrustAnchor {
    pub tal: Tal,
    pub enabled: bool,
    pub status: TrustAnchorStatus,

    /// The most recently validated anchor certificate, if the last
    /// successful run's map had one at any of the TAL's certificate
    /// locations.
    pub certificate: Option<Arc<ValidationContext>>,
    /// The anchor's top manifest, as of the last successful run.
    pub manifest: Option<ManifestSummary>,
    /// The anchor's CRL, as of the last successful run.
    pub crl: Option<CrlSummary>,
}

impl TrustAnchor {
    pub fn new(tal: Tal) -> Self {
        TrustAnchor {
            tal, enabled: true, status: TrustAnchorStatus::Idle { last_run: None },
            certificate: None, manifest: None, crl: None,
        }
    }

    pub fn disabled(tal: Tal) -> Self {
        TrustAnchor {
            tal, enabled: false, status: TrustAnchorStatus::Idle { last_run: None },
            certificate: None, manifest: None, crl: None,
        }
    }

    pub fn name(&self) -> &str {
        self.tal.name()
    }
}

/// A summary of a trust anchor's most recently validated manifest, kept
/// alongside the [`TrustAnchor`] record rather than the full parsed object.
#[derive(Clone, Debug)]
pub struct ManifestSummary {
    pub file_names: Vec<String>,
    pub crl_uri: uri::Rsync,
    pub next_update_time: Time,
}

/// A summary of a trust anchor's most recently validated CRL.
#[derive(Clone, Debug)]
pub struct CrlSummary {
    pub next_update_time: Time,
}

/// The lifecycle state of a trust anchor: either idle (with an optional
/// record of its last completed run) or running (recording when the
/// current run started, so a stuck run can eventually be noticed).
#[derive(Clone, Debug)]
pub enum TrustAnchorStatus {
    Idle { last_run: Option<RunOutcome> },
    Running { started_at: SystemTime },
}

/// The outcome of one completed validation run.
#[derive(Clone, Debug)]
pub struct RunOutcome {
    pub finished_at: SystemTime,
    pub succeeded: bool,
    /// The message from the [`RunFailed`][crate::error::RunFailed] that
    /// ended the run, if it didn't succeed.
    pub error: Option<String>,
    pub next_run_at: SystemTime,
}

/// An ordered, named collection of trust anchors.
///
/// Value semantics throughout: a schedule step reads the current
/// collection, decides what to do, and produces a new collection rather
/// than mutating one in place. This mirrors the "poor man's STM" pattern
/// the scheduler wraps around it.
#[derive(Clone, Debug, Default)]
pub struct TrustAnchors {
    anchors: Vec<TrustAnchor>,
}

impl TrustAnchors {
    pub fn new(anchors: Vec<TrustAnchor>) -> Self {
        TrustAnchors { anchors }
    }

    pub fn iter(&self) -> impl Iterator<Item = &TrustAnchor> {
        self.anchors.iter()
    }

    pub fn get(&self, name: &str) -> Option<&TrustAnchor> {
        self.anchors.iter().find(|a| a.name() == name)
    }

    /// Returns a copy of this collection with `name`'s entry replaced by
    /// whatever `update` returns.
    ///
    /// `update` is only ever actually invoked once (there is at most one
    /// anchor with a given name), but it has to be `FnMut` rather than
    /// `FnOnce`: it sits behind a `Iterator::map` closure that the compiler
    /// can't statically see is only taken on one branch.
    pub fn with_updated(&self, name: &str, mut update: impl FnMut(&TrustAnchor) -> TrustAnchor) -> Self {
        let anchors = self.anchors.iter().map(|a| {
            if a.name() == name { update(a) } else { a.clone() }
        }).collect();
        TrustAnchors { anchors }
    }

    pub fn len(&self) -> usize {
        self.anchors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.anchors.is_empty()
    }
}
