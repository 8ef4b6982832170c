//! The consistent fetcher: turns "try the network, fall back to the last
//! good copy" into a single operation, and makes a manifest's file set an
//! all-or-nothing unit.
//!
//! Wraps [`RemoteFetcher`][super::remote::RemoteFetcher] and adds the
//! durable [`ObjectStore`][crate::store::ObjectStore].
//!
//! Grounded directly on the component design's `fetchAndStoreObject` /
//! `fetchAndStoreConsistentObjectSet` pair (§4.C): fetching a manifest URI
//! transparently pulls down and commits its whole file set as one batch, so
//! by the time the walker asks for an individual listed file by its
//! manifest-committed hash, that file (if the set was complete) is already
//! sitting in the store under that exact hash.

use bytes::Bytes;
use rpki::uri;
use crate::object::{self, FetchSpec, ObjectHash, StoredRepositoryObject};
use crate::store::SharedObjectStore;
use crate::validation::{keys, ValidationCheck, ValidationResult};
use super::Fetcher;

/// Wraps an inner fetcher with the durable store's cache-aside behavior.
pub struct ConsistentFetcher {
    inner: Box<dyn Fetcher>,
    store: SharedObjectStore,
}

impl ConsistentFetcher {
    pub fn new(inner: Box<dyn Fetcher>, store: SharedObjectStore) -> Self {
        ConsistentFetcher { inner, store }
    }
}

impl Fetcher for ConsistentFetcher {
    fn prefetch(&self, uris: &[uri::Rsync], result: &mut ValidationResult) {
        self.inner.prefetch(uris, result)
    }

    /// `fetch(uri, spec, result)` from the component design: a hash-bound
    /// request is satisfied straight out of the store when possible (the
    /// manifest already cryptographically bound us to this exact hash, so
    /// there is nothing to refetch); anything else always goes through
    /// [`fetch_and_store_object`][Self::fetch_and_store_object] and is then
    /// read back by URI.
    fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        result: &mut ValidationResult,
    ) -> Option<StoredRepositoryObject> {
        if let FetchSpec::Hash(hash) = spec {
            if let Ok(Some(object)) = self.store.get_by_hash(*hash) {
                return Some(object)
            }
        }

        self.fetch_and_store_object(uri, result);

        match self.store.get_latest_by_uri(uri) {
            Ok(Some(object)) => {
                if let FetchSpec::Hash(expected) = spec {
                    if object.hash != *expected {
                        result.record(ValidationCheck::failed(
                            keys::FILE_CONTENT, vec![uri.to_string()],
                        ));
                        return None
                    }
                }
                Some(object)
            }
            _ => {
                result.record(ValidationCheck::failed(
                    keys::REPOSITORY_OBJECT_NOT_IN_CACHE, vec![uri.to_string()],
                ));
                None
            }
        }
    }

    /// Not used on this layer's own path -- manifests are expanded into
    /// their full consistent set inside [`fetch`][Self::fetch] itself, so
    /// by the time anything above this layer asks for the individual
    /// files, each one is answered by a hash lookup rather than a fresh
    /// remote round trip. Kept for trait completeness and for callers that
    /// want to fetch an arbitrary, non-manifest-rooted set of files as one
    /// atomic unit.
    fn fetch_consistent_set(
        &self,
        base: &uri::Rsync,
        entries: &[(String, FetchSpec)],
        result: &mut ValidationResult,
    ) -> Option<Vec<(String, StoredRepositoryObject)>> {
        self.inner.fetch_consistent_set(base, entries, result)
    }
}

impl ConsistentFetcher {
    /// `fetchAndStoreObject(uri, spec, result)`: fetches `uri` from the
    /// inner (remote) fetcher into a result scoped to this call, so remote
    /// failures never become failures of the caller's `result` -- only
    /// warnings (the error handling design's mapping table, applied by
    /// [`ValidationResult::absorb_as_warnings`]).
    ///
    /// A manifest is expanded into its whole file set and committed
    /// atomically; anything else is stored directly.
    fn fetch_and_store_object(&self, uri: &uri::Rsync, result: &mut ValidationResult) {
        let mut fresh = ValidationResult::nested(uri.clone());
        let fetched = self.inner.fetch(uri, &FetchSpec::Uri, &mut fresh);
        result.absorb_as_warnings(&fresh, uri);

        let object = match fetched {
            Some(object) => object,
            None => return,
        };

        if uri.path().ends_with(".mft") {
            self.fetch_and_store_consistent_set(uri, object.bytes, result);
        }
        else if let Err(err) = self.store.put_batch(&[object]) {
            log::warn!("Failed to store {}: {:?}", uri, err);
        }
    }

    /// `fetchAndStoreConsistentObjectSet(manifestUri, mft)`: fetches every
    /// file the manifest lists and, only if every single one of them
    /// succeeded, commits the manifest together with all of its files in
    /// one atomic batch. If any file failed, nothing new is written at
    /// all -- whatever generation the store already held for this
    /// manifest (and its files) remains the latest-by-URI answer.
    fn fetch_and_store_consistent_set(
        &self,
        manifest_uri: &uri::Rsync,
        bytes: Bytes,
        result: &mut ValidationResult,
    ) {
        let manifest_hash = ObjectHash::digest(&bytes);
        if matches!(self.store.get_by_hash(manifest_hash), Ok(Some(_))) {
            // We already committed this exact manifest generation (and,
            // transitively, its file set) in a prior run; nothing to do.
            return
        }

        let entries = match object::decode_manifest_file_hashes(bytes.clone()) {
            Some(entries) => entries,
            None => {
                // Malformed manifest: store it anyway so the validating
                // layer, which decodes strictly, gets a chance to record
                // the proper diagnostic. There is no file set to be
                // consistent about if we can't even read the listing.
                if let Err(err) = self.store.put_batch(
                    &[StoredRepositoryObject::new(manifest_uri.clone(), bytes)]
                ) {
                    log::warn!("Failed to store {}: {:?}", manifest_uri, err);
                }
                return
            }
        };

        let mut nested = ValidationResult::nested(manifest_uri.clone());
        let mut batch = Vec::with_capacity(entries.len() + 1);
        batch.push(StoredRepositoryObject::new(manifest_uri.clone(), bytes));

        let mut child_uris = Vec::with_capacity(entries.len());
        for (name, hash) in &entries {
            let child_uri = match resolve_sibling(manifest_uri, name) {
                Some(uri) => uri,
                None => {
                    nested.record(ValidationCheck::failed(
                        keys::MANIFEST_DOES_NOT_CONTAIN_FILE, vec![name.clone()],
                    ));
                    continue
                }
            };
            nested.push(child_uri.clone());
            if let Some(object) = self.inner.fetch(&child_uri, &FetchSpec::Hash(*hash), &mut nested) {
                batch.push(object);
            }
            nested.pop();
            child_uris.push(child_uri);
        }

        if nested.has_failures() {
            result.absorb_as_warnings(&nested, manifest_uri);
            for child_uri in &child_uris {
                result.absorb_as_warnings(&nested, child_uri);
            }
            // Atomicity rule: the set fetch as a whole failed, so none of
            // `batch` is written. A prior consistent generation, if any,
            // is left untouched and remains what `getLatestByUrl` answers.
        }
        else if let Err(err) = self.store.put_batch(&batch) {
            log::warn!("Failed to store consistent set for {}: {:?}", manifest_uri, err);
        }
    }
}

/// Resolves a manifest-listed file name relative to the manifest's own
/// directory: RFC 6486bis requires every listed file to live alongside the
/// manifest itself, so this is a plain "drop the last path segment, append
/// the name" resolution rather than anything the walker's certificate
/// context is needed for.
fn resolve_sibling(manifest_uri: &uri::Rsync, name: &str) -> Option<uri::Rsync> {
    use std::str::FromStr;
    let path = manifest_uri.path();
    let dir = match path.rfind('/') {
        Some(idx) => &path[..=idx],
        None => "",
    };
    let full = format!(
        "rsync://{}/{}/{}{}",
        manifest_uri.module().authority(),
        manifest_uri.module().module(),
        dir,
        name,
    );
    uri::Rsync::from_str(&full).ok()
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;
    use std::str::FromStr;
    use crate::store::{ObjectStore, SledObjectStore};

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    /// A fake remote fetcher whose answers per URI are configured up front
    /// and whose call count is observable, so tests can assert the
    /// hash-hit-never-refetches property without touching a real network.
    struct FakeRemote {
        answers: RefCell<HashMap<uri::Rsync, Bytes>>,
        calls: RefCell<Vec<uri::Rsync>>,
    }

    impl FakeRemote {
        fn new(answers: Vec<(uri::Rsync, Bytes)>) -> Self {
            FakeRemote {
                answers: RefCell::new(answers.into_iter().collect()),
                calls: RefCell::new(Vec::new()),
            }
        }
    }

    impl Fetcher for FakeRemote {
        fn prefetch(&self, _uris: &[uri::Rsync], _result: &mut ValidationResult) { }

        fn fetch(
            &self,
            uri: &uri::Rsync,
            spec: &FetchSpec,
            result: &mut ValidationResult,
        ) -> Option<StoredRepositoryObject> {
            self.calls.borrow_mut().push(uri.clone());
            match self.answers.borrow().get(uri) {
                Some(bytes) => {
                    let object = StoredRepositoryObject::new(uri.clone(), bytes.clone());
                    if let FetchSpec::Hash(expected) = spec {
                        if object.hash != *expected {
                            result.record(ValidationCheck::failed(keys::FILE_CONTENT, vec![]));
                            return None
                        }
                    }
                    Some(object)
                }
                None => {
                    result.record(ValidationCheck::failed(keys::RSYNC_COMMAND, vec![uri.to_string()]));
                    None
                }
            }
        }
    }

    #[test]
    fn non_manifest_roundtrips_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedObjectStore = std::sync::Arc::new(SledObjectStore::open(dir.path()).unwrap());
        let u = uri("rsync://example.org/repo/a.roa");
        let remote = FakeRemote::new(vec![(u.clone(), Bytes::from_static(b"roa bytes"))]);
        let fetcher = ConsistentFetcher::new(Box::new(remote), store.clone());

        let mut result = ValidationResult::new(u.clone());
        let object = fetcher.fetch(&u, &FetchSpec::Uri, &mut result).unwrap();
        assert_eq!(object.bytes, Bytes::from_static(b"roa bytes"));
        assert!(store.get_latest_by_uri(&u).unwrap().is_some());
    }

    #[test]
    fn hash_hit_never_consults_the_remote_fetcher() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedObjectStore = std::sync::Arc::new(SledObjectStore::open(dir.path()).unwrap());
        let u = uri("rsync://example.org/repo/a.roa");
        let object = StoredRepositoryObject::new(u.clone(), Bytes::from_static(b"cached"));
        store.put_batch(&[object.clone()]).unwrap();

        let remote = FakeRemote::new(vec![]);
        let fetcher = ConsistentFetcher::new(Box::new(remote), store);
        let mut result = ValidationResult::new(u.clone());
        let fetched = fetcher.fetch(&u, &FetchSpec::Hash(object.hash), &mut result).unwrap();
        assert_eq!(fetched.bytes, object.bytes);
    }

    #[test]
    fn unchanged_manifest_generation_is_not_refetched_or_recommitted() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedObjectStore = std::sync::Arc::new(SledObjectStore::open(dir.path()).unwrap());
        let mft_uri = uri("rsync://example.org/repo/mft.mft");
        let bytes = Bytes::from_static(b"same generation every time");
        store.put_batch(
            &[StoredRepositoryObject::new(mft_uri.clone(), bytes.clone())]
        ).unwrap();

        // The remote fetcher would answer with the exact same generation
        // again; since its hash already matches what's stored, rule 1 of
        // `fetchAndStoreConsistentObjectSet` says this is a no-op -- in
        // particular, it must not try to resolve or fetch any children.
        let remote = FakeRemote::new(vec![(mft_uri.clone(), bytes.clone())]);
        let fetcher = ConsistentFetcher::new(Box::new(remote), store.clone());

        let mut result = ValidationResult::new(mft_uri.clone());
        let fetched = fetcher.fetch(&mft_uri, &FetchSpec::Uri, &mut result);
        assert!(fetched.is_some());
        assert!(!result.has_failures());
    }

    #[test]
    fn malformed_manifest_bytes_store_directly() {
        let dir = tempfile::tempdir().unwrap();
        let store: SharedObjectStore = std::sync::Arc::new(SledObjectStore::open(dir.path()).unwrap());
        let mft_uri = uri("rsync://example.org/repo/mft.mft");
        let remote = FakeRemote::new(vec![(mft_uri.clone(), Bytes::from_static(b"garbage"))]);
        let fetcher = ConsistentFetcher::new(Box::new(remote), store.clone());

        let mut result = ValidationResult::new(mft_uri.clone());
        let fetched = fetcher.fetch(&mft_uri, &FetchSpec::Uri, &mut result);
        assert!(fetched.is_some());
        assert!(store.get_latest_by_uri(&mft_uri).unwrap().is_some());
    }
}
