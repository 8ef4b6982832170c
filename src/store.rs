//! The durable object store.
//!
//! Every object that survives a successful fetch is written here, keyed by
//! its content hash, with a secondary index from URI to the latest hash
//! seen at that URI. The cache-aside rule the consistent fetcher relies on
//! ("serve the last known-good copy when the network is unavailable") is
//! just a lookup through the secondary index.

use std::path::Path;
use std::sync::Arc;
use sled::{Db, Tree};
use crate::error::Failed;
use crate::object::{ObjectHash, StoredRepositoryObject};
use rpki::uri;


//------------ ObjectStore -----------------------------------------------------

/// Durable storage for fetched repository objects.
pub trait ObjectStore: Send + Sync {
    /// Looks up an object by its exact content hash.
    fn get_by_hash(&self, hash: ObjectHash) -> Result<Option<StoredRepositoryObject>, Failed>;

    /// Looks up the most recently stored object at `uri`, regardless of
    /// hash.
    fn get_latest_by_uri(&self, uri: &uri::Rsync) -> Result<Option<StoredRepositoryObject>, Failed>;

    /// Stores every object in `batch`, updating the secondary URI index for
    /// each.
    ///
    /// All objects become visible together or none do -- the atomicity the
    /// consistent fetcher relies on to make a manifest and its full file
    /// set a single unit of storage. A single object is just a batch of
    /// one.
    fn put_batch(&self, batch: &[StoredRepositoryObject]) -> Result<(), Failed>;

    /// Removes every object whose URI has not been refreshed in more than
    /// `max_stale_days`.
    fn purge_expired(&self, max_stale_days: u64) -> Result<u64, Failed>;
}


//------------ SledObjectStore --------------------------------------------------

/// An [`ObjectStore`] backed by an embedded `sled` database.
///
/// Three trees are kept: `objects` maps a hash to its raw bytes, `by_uri`
/// maps a URI to the hash currently stored for it, and `seen` maps a URI to
/// the timestamp it was last written, used by [`purge_expired`][Self::purge_expired].
pub struct SledObjectStore {
    #[allow(dead_code)]
    db: Db,
    objects: Tree,
    by_uri: Tree,
    seen: Tree,
}

impl SledObjectStore {
    /// Opens (creating if necessary) the object store at `path`.
    pub fn open(path: &Path) -> Result<Self, Failed> {
        let db = sled::open(path).map_err(|err| {
            log::error!("Failed to open object store at {}: {}", path.display(), err);
            Failed
        })?;
        let objects = open_tree(&db, "objects")?;
        let by_uri = open_tree(&db, "by_uri")?;
        let seen = open_tree(&db, "seen")?;
        Ok(SledObjectStore { db, objects, by_uri, seen })
    }

    /// Wipes every tree, leaving the store empty but open.
    pub fn clear(&self) -> Result<(), Failed> {
        for tree in [&self.objects, &self.by_uri, &self.seen] {
            tree.clear().map_err(|err| {
                log::error!("Failed to clear object store: {}", err);
                Failed
            })?;
        }
        Ok(())
    }
}

fn open_tree(db: &Db, name: &str) -> Result<Tree, Failed> {
    db.open_tree(name).map_err(|err| {
        log::error!("Failed to open object store tree {}: {}", name, err);
        Failed
    })
}

impl ObjectStore for SledObjectStore {
    fn get_by_hash(&self, hash: ObjectHash) -> Result<Option<StoredRepositoryObject>, Failed> {
        let raw = self.objects.get(hash.as_bytes()).map_err(|err| {
            log::error!("Object store read failed: {}", err);
            Failed
        })?;
        let raw = match raw {
            Some(raw) => raw,
            None => return Ok(None),
        };
        decode_entry(&raw).map(Some)
    }

    fn get_latest_by_uri(&self, uri: &uri::Rsync) -> Result<Option<StoredRepositoryObject>, Failed> {
        let key = uri.to_string();
        let hash = self.by_uri.get(key.as_bytes()).map_err(|err| {
            log::error!("Object store index read failed: {}", err);
            Failed
        })?;
        let hash = match hash {
            Some(hash) => hash,
            None => return Ok(None),
        };
        let mut buf = [0u8; 32];
        if hash.len() != 32 {
            log::error!("Corrupt object store index entry for {}", uri);
            return Err(Failed)
        }
        buf.copy_from_slice(&hash);
        self.get_by_hash(ObjectHash::from_array(buf))
    }

    fn put_batch(&self, batch: &[StoredRepositoryObject]) -> Result<(), Failed> {
        if batch.is_empty() {
            return Ok(())
        }
        let now = chrono::Utc::now().timestamp().to_be_bytes();
        let entries: Vec<(String, Vec<u8>, Vec<u8>)> = batch.iter().map(|object| {
            (object.uri.to_string(), object.hash.as_bytes().to_vec(), encode_entry(object))
        }).collect();

        (&self.objects, &self.by_uri, &self.seen).transaction(|(objects, by_uri, seen)| {
            for (key_uri, hash, entry) in &entries {
                objects.insert(hash.as_slice(), entry.as_slice())?;
                by_uri.insert(key_uri.as_bytes(), hash.as_slice())?;
                seen.insert(key_uri.as_bytes(), &now[..])?;
            }
            Ok::<_, sled::transaction::ConflictableTransactionError<()>>(())
        }).map_err(|err| {
            log::error!("Object store batch write failed: {}", err);
            Failed
        })?;
        Ok(())
    }

    fn purge_expired(&self, max_stale_days: u64) -> Result<u64, Failed> {
        let cutoff = chrono::Utc::now().timestamp() - (max_stale_days as i64) * 86_400;
        let mut removed = 0u64;
        let mut expired_uris = Vec::new();
        for entry in self.seen.iter() {
            let (key, value) = entry.map_err(|err| {
                log::error!("Object store scan failed: {}", err);
                Failed
            })?;
            if value.len() != 8 {
                continue
            }
            let mut buf = [0u8; 8];
            buf.copy_from_slice(&value);
            let timestamp = i64::from_be_bytes(buf);
            if timestamp < cutoff {
                expired_uris.push(key.to_vec());
            }
        }
        for key in expired_uris {
            if let Ok(Some(hash)) = self.by_uri.get(&key) {
                let _ = self.objects.remove(&hash);
            }
            let _ = self.by_uri.remove(&key);
            let _ = self.seen.remove(&key);
            removed += 1;
        }
        Ok(removed)
    }
}

fn encode_entry(object: &StoredRepositoryObject) -> Vec<u8> {
    let uri = object.uri.to_string();
    let mut buf = Vec::with_capacity(4 + uri.len() + object.bytes.len());
    buf.extend_from_slice(&(uri.len() as u32).to_be_bytes());
    buf.extend_from_slice(uri.as_bytes());
    buf.extend_from_slice(&object.bytes);
    buf
}

fn decode_entry(raw: &[u8]) -> Result<StoredRepositoryObject, Failed> {
    if raw.len() < 4 {
        log::error!("Corrupt object store entry");
        return Err(Failed)
    }
    let mut len_buf = [0u8; 4];
    len_buf.copy_from_slice(&raw[..4]);
    let uri_len = u32::from_be_bytes(len_buf) as usize;
    if raw.len() < 4 + uri_len {
        log::error!("Corrupt object store entry");
        return Err(Failed)
    }
    let uri_str = std::str::from_utf8(&raw[4..4 + uri_len]).map_err(|_| {
        log::error!("Corrupt object store entry: bad URI encoding");
        Failed
    })?;
    let uri = uri::Rsync::from_str(uri_str).map_err(|_| {
        log::error!("Corrupt object store entry: bad URI");
        Failed
    })?;
    let bytes = bytes::Bytes::copy_from_slice(&raw[4 + uri_len..]);
    Ok(StoredRepositoryObject::new(uri, bytes))
}

use std::str::FromStr;


//------------ shared handle -----------------------------------------------------

/// A convenience alias: the store is always shared across fetcher layers
/// and, eventually, concurrent trust anchor validations.
pub type SharedObjectStore = Arc<dyn ObjectStore>;


#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    #[test]
    fn stores_and_retrieves_by_hash_and_uri() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledObjectStore::open(dir.path()).unwrap();
        let object = StoredRepositoryObject::new(
            uri("rsync://example.org/repo/a.cer"), Bytes::from_static(b"hello"),
        );
        store.put_batch(&[object.clone()]).unwrap();

        let by_hash = store.get_by_hash(object.hash).unwrap().unwrap();
        assert_eq!(by_hash.bytes, object.bytes);

        let by_uri = store.get_latest_by_uri(&object.uri).unwrap().unwrap();
        assert_eq!(by_uri.hash, object.hash);
    }

    #[test]
    fn missing_lookups_return_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledObjectStore::open(dir.path()).unwrap();
        assert!(store.get_by_hash(ObjectHash::digest(b"nope")).unwrap().is_none());
        assert!(
            store.get_latest_by_uri(&uri("rsync://example.org/x.cer")).unwrap().is_none()
        );
    }

    #[test]
    fn put_overwrites_uri_index_with_newest_hash() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledObjectStore::open(dir.path()).unwrap();
        let u = uri("rsync://example.org/repo/mft.mft");
        let first = StoredRepositoryObject::new(u.clone(), Bytes::from_static(b"v1"));
        let second = StoredRepositoryObject::new(u.clone(), Bytes::from_static(b"v2"));
        store.put_batch(&[first.clone()]).unwrap();
        store.put_batch(&[second.clone()]).unwrap();

        let latest = store.get_latest_by_uri(&u).unwrap().unwrap();
        assert_eq!(latest.bytes, second.bytes);
        assert!(store.get_by_hash(first.hash).unwrap().is_some());
    }

    #[test]
    fn put_batch_commits_every_item_together() {
        let dir = tempfile::tempdir().unwrap();
        let store = SledObjectStore::open(dir.path()).unwrap();
        let mft = StoredRepositoryObject::new(
            uri("rsync://example.org/repo/mft.mft"), Bytes::from_static(b"manifest"),
        );
        let a = StoredRepositoryObject::new(
            uri("rsync://example.org/repo/a.roa"), Bytes::from_static(b"a"),
        );
        let b = StoredRepositoryObject::new(
            uri("rsync://example.org/repo/b.roa"), Bytes::from_static(b"b"),
        );
        store.put_batch(&[mft.clone(), a.clone(), b.clone()]).unwrap();

        assert!(store.get_by_hash(mft.hash).unwrap().is_some());
        assert!(store.get_by_hash(a.hash).unwrap().is_some());
        assert!(store.get_by_hash(b.hash).unwrap().is_some());
    }
}
