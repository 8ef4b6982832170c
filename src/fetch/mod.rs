//! The layered fetcher chain.
//!
//! Each layer implements the same [`Fetcher`] trait and wraps the next one
//! down, so the walker only ever talks to the outermost layer and has no
//! idea whether what it asked for came off the network, out of the
//! in-memory walk cache, or out of the durable store. Bottom to top:
//!
//! remote -> consistent -> validating -> notifying -> caching
//!
//! [`EngineBuilder`][crate::engine::EngineBuilder] wires them together.

pub mod remote;
pub mod consistent;
pub mod validating;
pub mod notify;
pub mod caching;

use rpki::uri;
use crate::object::{FetchSpec, StoredRepositoryObject};
use crate::validation::ValidationResult;

/// Something that can retrieve repository objects, validating and caching
/// along the way depending on which layer of the chain you are holding.
///
/// Each trust anchor gets its own chain instance, owned for the duration
/// of one walk and moved into the `spawn_blocking` task that runs it
/// (hence `Send`); nothing about the chain is shared *between* walks
/// running concurrently, so layers like the caching fetcher can use a
/// `RefCell` instead of paying for synchronization they'll never need.
pub trait Fetcher: Send {
    /// Warms up the cache for a set of hint URIs. Failures are recorded as
    /// checks but never fail the caller; prefetching is strictly an
    /// optimization.
    fn prefetch(&self, uris: &[uri::Rsync], result: &mut ValidationResult);

    /// Fetches the object at `uri`, matching `spec`'s hash commitment if
    /// any. Returns `None` (with failures recorded on `result`) if the
    /// object could not be retrieved or did not match its commitment.
    fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        result: &mut ValidationResult,
    ) -> Option<StoredRepositoryObject>;

    /// Fetches and stores every file a manifest lists, failing the whole
    /// set atomically if any one of them fails.
    ///
    /// Grounded on the consistent fetcher's `fetchAndStoreConsistentObjectSet`
    /// contract: either every file in `entries` lands in the store, or none
    /// of the new entries are committed and the previous generation's files
    /// remain the latest-by-URI answer.
    fn fetch_consistent_set(
        &self,
        base: &uri::Rsync,
        entries: &[(String, FetchSpec)],
        result: &mut ValidationResult,
    ) -> Option<Vec<(String, StoredRepositoryObject)>> {
        let mut fetched = Vec::with_capacity(entries.len());
        let mut nested = ValidationResult::nested(base.clone());
        for (name, spec) in entries {
            let uri = match resolve_entry(base, name) {
                Some(uri) => uri,
                None => {
                    nested.record(crate::validation::ValidationCheck::failed(
                        crate::validation::keys::MANIFEST_DOES_NOT_CONTAIN_FILE,
                        vec![name.clone()],
                    ));
                    continue
                }
            };
            nested.push(uri.clone());
            match self.fetch(&uri, spec, &mut nested) {
                Some(object) => fetched.push((name.clone(), object)),
                None => { }
            }
            nested.pop();
        }
        if nested.has_failures() {
            result.absorb_as_warnings(&nested, base);
            None
        }
        else {
            Some(fetched)
        }
    }
}

/// Resolves a manifest-listed file name, relative to the directory `base`
/// points into, to a full URI.
fn resolve_entry(base: &uri::Rsync, name: &str) -> Option<uri::Rsync> {
    use std::str::FromStr;
    let mut s = base.to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s.push_str(name);
    uri::Rsync::from_str(&s).ok()
}
