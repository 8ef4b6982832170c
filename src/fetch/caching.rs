//! The caching fetcher: outermost layer, memoizing fetches within a single
//! top-down walk so a publication point referenced from two places (a
//! prefetch hint and a manifest entry, say) is only fetched once.
//!
//! A walk runs single-threaded (see the concurrency model: one task per
//! trust anchor, not per object), so a `RefCell` is enough; no locking
//! needed.

use std::cell::RefCell;
use std::collections::HashMap;
use rpki::uri;
use crate::object::{FetchSpec, ObjectHash, StoredRepositoryObject};
use crate::validation::ValidationResult;
use super::Fetcher;

/// The key a cached fetch is memoized under: the URI plus, if the request
/// carried a hash commitment, that hash. Two requests for the same URI
/// with different hash commitments (a manifest superseded mid-walk, in
/// principle) are treated as distinct.
type CacheKey = (uri::Rsync, Option<ObjectHash>);

pub struct CachingFetcher {
    inner: Box<dyn Fetcher>,
    cache: RefCell<HashMap<CacheKey, Option<StoredRepositoryObject>>>,
}

impl CachingFetcher {
    pub fn new(inner: Box<dyn Fetcher>) -> Self {
        CachingFetcher { inner, cache: RefCell::new(HashMap::new()) }
    }
}

impl Fetcher for CachingFetcher {
    fn prefetch(&self, uris: &[uri::Rsync], result: &mut ValidationResult) {
        self.inner.prefetch(uris, result)
    }

    fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        result: &mut ValidationResult,
    ) -> Option<StoredRepositoryObject> {
        let key = (uri.clone(), spec.hash());
        if let Some(cached) = self.cache.borrow().get(&key) {
            return cached.clone()
        }
        let fetched = self.inner.fetch(uri, spec, result);
        self.cache.borrow_mut().insert(key, fetched.clone());
        fetched
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
