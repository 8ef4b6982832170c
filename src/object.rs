//! Repository objects and the trust-anchor-rooted context they are
//! validated against.
//!
//! This module is the boundary to the "crypto oracle": actual X.509/CMS
//! parsing and signature verification is delegated to the `rpki` crate.
//! What lives here is the thin adaptation layer that turns `rpki`'s
//! `Result`-returning validation calls into entries on a shared
//! [`ValidationResult`], and the handful of fields the rest of the pipeline
//! (the fetchers, the walker) needs out of a parsed object without caring
//! about its concrete type.

use std::sync::Arc;
use bytes::Bytes;
use rpki::crypto::DigestAlgorithm;
use rpki::repository::cert::{Cert, KeyUsage, ResourceCert};
use rpki::repository::crl::Crl;
use rpki::repository::manifest::{Manifest, ManifestContent, ManifestHash};
use rpki::repository::roa::Roa;
use rpki::repository::x509::{Time, Validity, ValidationError};
use rpki::uri;
use crate::error::Failed;
use crate::validation::{keys, ValidationCheck, ValidationResult};


//------------ ObjectHash --------------------------------------------------------

/// A SHA-256 digest of an object's bytes, used both as the store's key and
/// as the hash a manifest commits its listed files to.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Ord, PartialOrd)]
pub struct ObjectHash([u8; 32]);

impl ObjectHash {
    /// Computes the hash of `data`.
    pub fn digest(data: &[u8]) -> Self {
        let digest = DigestAlgorithm::sha256().digest(data);
        let mut buf = [0u8; 32];
        buf.copy_from_slice(digest.as_ref());
        ObjectHash(buf)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Reconstructs a hash from its raw bytes, e.g. when reading one back
    /// out of the object store's secondary index.
    pub fn from_array(bytes: [u8; 32]) -> Self {
        ObjectHash(bytes)
    }
}

impl std::fmt::Display for ObjectHash {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}


//------------ FetchSpec ----------------------------------------------------------

/// What the consistent fetcher was asked to retrieve.
///
/// A manifest entry pins a child file to a specific hash; fetching the
/// trust anchor certificate or a manifest itself has no such binding and
/// must always go out to the network (or fail back to the store's latest
/// copy).
#[derive(Clone, Debug)]
pub enum FetchSpec {
    /// An arbitrary URI with no hash commitment.
    Uri,
    /// A URI bound to a specific content hash by a manifest entry.
    Hash(ObjectHash),
}

impl FetchSpec {
    pub fn hash(&self) -> Option<ObjectHash> {
        match self {
            FetchSpec::Uri => None,
            FetchSpec::Hash(hash) => Some(*hash),
        }
    }
}


//------------ StoredRepositoryObject ---------------------------------------------

/// Raw bytes plus their content hash, as kept in the durable object store.
#[derive(Clone, Debug)]
pub struct StoredRepositoryObject {
    pub uri: uri::Rsync,
    pub bytes: Bytes,
    pub hash: ObjectHash,
}

impl StoredRepositoryObject {
    pub fn new(uri: uri::Rsync, bytes: Bytes) -> Self {
        let hash = ObjectHash::digest(&bytes);
        StoredRepositoryObject { uri, bytes, hash }
    }
}


//------------ ValidationContext --------------------------------------------------

/// The validation context a CA hands down to the objects it issues:
/// its own validated certificate, its repository and manifest locations,
/// and the chain of ancestors needed for loop detection.
///
/// Grounded directly on the teacher's `engine::CaCert`.
#[derive(Debug)]
pub struct ValidationContext {
    /// The validated certificate of this CA (the trust anchor cert, for a
    /// root context).
    cert: ResourceCert,

    /// Where this CA's objects are published.
    ca_repository: uri::Rsync,

    /// Where this CA's manifest is published.
    rpki_manifest: uri::Rsync,

    /// The issuing context, or `None` for a trust anchor.
    parent: Option<Arc<ValidationContext>>,

    /// Index of the originating TAL, carried through for metrics.
    pub tal_index: usize,

    /// The combined validity window of this certificate and all its
    /// ancestors.
    combined_validity: Validity,

    /// Depth of this context below its trust anchor (0 for the anchor
    /// itself). Used for the walker's depth bound.
    depth: usize,
}

impl ValidationContext {
    /// Creates a root context for a validated trust anchor certificate.
    pub fn root(cert: ResourceCert, tal_index: usize) -> Result<Arc<Self>, Failed> {
        Self::new(cert, None, tal_index, 0)
    }

    /// Creates a child context for a validated CA certificate issued by
    /// `issuer`.
    pub fn chain(
        issuer: &Arc<Self>, cert: ResourceCert
    ) -> Result<Arc<Self>, Failed> {
        Self::new(cert, Some(issuer.clone()), issuer.tal_index, issuer.depth + 1)
    }

    fn new(
        cert: ResourceCert,
        parent: Option<Arc<Self>>,
        tal_index: usize,
        depth: usize,
    ) -> Result<Arc<Self>, Failed> {
        let combined_validity = match parent.as_ref() {
            Some(ca) => cert.validity().trim(ca.combined_validity),
            None => cert.validity(),
        };
        let ca_repository = cert.ca_repository().ok_or_else(|| {
            log::error!("CA cert has no repository URI.");
            Failed
        })?.clone();
        let rpki_manifest = cert.rpki_manifest().ok_or_else(|| {
            log::error!("CA cert has no manifest URI.");
            Failed
        })?.clone();
        Ok(Arc::new(ValidationContext {
            cert, ca_repository, rpki_manifest, parent, tal_index,
            combined_validity, depth,
        }))
    }

    /// Checks that `cert`'s subject key has not already appeared as an
    /// ancestor, defending the walk against certificate cycles.
    pub fn check_loop(&self, cert: &Cert) -> Result<(), Failed> {
        self.check_loop_inner(cert.subject_key_identifier())
    }

    fn check_loop_inner(
        &self, key_id: rpki::repository::crypto::keys::KeyIdentifier
    ) -> Result<(), Failed> {
        if self.cert.subject_key_identifier() == key_id {
            Err(Failed)
        }
        else if let Some(parent) = &self.parent {
            parent.check_loop_inner(key_id)
        }
        else {
            Ok(())
        }
    }

    pub fn cert(&self) -> &ResourceCert {
        &self.cert
    }

    pub fn ca_repository(&self) -> &uri::Rsync {
        &self.ca_repository
    }

    pub fn rpki_manifest(&self) -> &uri::Rsync {
        &self.rpki_manifest
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn combined_validity(&self) -> Validity {
        self.combined_validity
    }
}


//------------ RepositoryObject ---------------------------------------------------

/// A parsed (but not yet validated) repository object of one of the four
/// kinds the walker cares about.
pub enum RepositoryObject {
    Cert(Cert),
    Manifest(ManifestContent, Bytes),
    Crl(Crl),
    Roa(Roa),
}

impl RepositoryObject {
    /// Decodes `bytes` retrieved from `uri` into the object kind its file
    /// extension indicates, per RFC 6481's naming convention.
    pub fn decode(uri: &uri::Rsync, bytes: Bytes, strict: bool) -> Result<Self, DecodeError> {
        let path = uri.path();
        if path.ends_with(".cer") {
            Cert::decode(bytes).map(RepositoryObject::Cert)
                .map_err(|_| DecodeError)
        }
        else if path.ends_with(".mft") {
            let manifest = Manifest::decode(bytes.clone(), strict)
                .map_err(|_| DecodeError)?;
            Ok(RepositoryObject::Manifest(manifest.into_content(), bytes))
        }
        else if path.ends_with(".crl") {
            Crl::decode(bytes).map(RepositoryObject::Crl)
                .map_err(|_| DecodeError)
        }
        else if path.ends_with(".roa") {
            Roa::decode(bytes, strict).map(RepositoryObject::Roa)
                .map_err(|_| DecodeError)
        }
        else {
            Err(DecodeError)
        }
    }

    /// Whether this object, if validated, would become a new CA context to
    /// recurse into.
    pub fn is_ca_certificate(&self) -> bool {
        matches!(self, RepositoryObject::Cert(cert) if cert.key_usage() == KeyUsage::Ca)
    }
}

#[derive(Clone, Copy, Debug)]
pub struct DecodeError;

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.write_str("failed to decode repository object")
    }
}


//------------ ValidatedObject ----------------------------------------------------

/// The outcome of validating one repository object at one URI.
#[derive(Clone)]
pub enum ValidatedObject {
    /// The object validated, possibly with warnings.
    Valid {
        uri: uri::Rsync,
        checks: Vec<ValidationCheck>,
        object: Box<ValidObjectData>,
    },
    /// The object failed at least one check.
    Invalid {
        uri: uri::Rsync,
        checks: Vec<ValidationCheck>,
    },
}

impl ValidatedObject {
    pub fn uri(&self) -> &uri::Rsync {
        match self {
            ValidatedObject::Valid { uri, .. } => uri,
            ValidatedObject::Invalid { uri, .. } => uri,
        }
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, ValidatedObject::Valid { .. })
    }
}

/// The validated form of an object, retaining what the walker and
/// scheduler need without exposing the raw `rpki` types everywhere.
#[derive(Clone)]
pub enum ValidObjectData {
    Cert(Arc<ValidationContext>),
    Manifest {
        file_names: Vec<String>,
        file_hashes: std::collections::HashMap<String, ObjectHash>,
        crl_uri: uri::Rsync,
        next_update_time: Time,
    },
    Crl {
        next_update_time: Time,
    },
    Roa,
}


//------------ Validation entry points --------------------------------------------

/// Validates a parsed certificate as a CA issued by `parent`, recording
/// checks on `result`.
pub fn validate_ca(
    cert: Cert,
    parent: &Arc<ValidationContext>,
    strict: bool,
    result: &mut ValidationResult,
) -> Option<Arc<ValidationContext>> {
    if parent.check_loop(&cert).is_err() {
        result.record(ValidationCheck::failed(
            keys::OBJECT_VALIDATION,
            vec!["certificate cycle detected".into()],
        ));
        return None
    }
    match cert.validate_ca(parent.cert(), strict) {
        Ok(resource_cert) => {
            result.record(ValidationCheck::passed(keys::OBJECT_VALIDATION));
            ValidationContext::chain(parent, resource_cert).ok()
        }
        Err(err) => {
            result.record(ValidationCheck::failed(
                keys::OBJECT_VALIDATION, vec![err.to_string()],
            ));
            None
        }
    }
}

/// Validates a parsed manifest issued by `ctx`, recording checks on
/// `result`. On success returns the manifest's file listing and CRL URI so
/// the walker can fetch them.
pub fn validate_manifest(
    content: ManifestContent,
    bytes: &Bytes,
    ctx: &Arc<ValidationContext>,
    stale: crate::config::FilterPolicy,
    result: &mut ValidationResult,
) -> Option<ValidObjectData> {
    if content.is_stale() {
        match stale {
            crate::config::FilterPolicy::Reject => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_STALE, vec!["manifest".into()],
                ));
                return None
            }
            crate::config::FilterPolicy::Warn => {
                result.record(ValidationCheck::warning(
                    keys::OBJECT_STALE, vec!["manifest".into()],
                ));
            }
            crate::config::FilterPolicy::Accept => { }
        }
    }

    let crl_uri = match ctx.cert().crl_uri() {
        Some(uri) if uri.path().ends_with(".crl") => uri.clone(),
        _ => {
            result.record(ValidationCheck::failed(
                keys::OBJECT_VALIDATION, vec!["invalid CRL URI".into()],
            ));
            return None
        }
    };

    let mut file_names = Vec::new();
    let mut file_hashes = std::collections::HashMap::new();
    let mut seen = std::collections::HashSet::new();
    for item in content.iter() {
        let (file, hash) = item.into_pair();
        let name = String::from_utf8_lossy(&file).into_owned();
        if !seen.insert(name.clone()) {
            result.record(ValidationCheck::failed(
                keys::MANIFEST_DOES_NOT_CONTAIN_FILE,
                vec![format!("duplicate entry {}", name)],
            ));
            return None
        }
        let digest = match object_hash_from_digest(&hash) {
            Some(digest) => digest,
            None => {
                result.record(ValidationCheck::failed(
                    keys::MANIFEST_DOES_NOT_CONTAIN_FILE,
                    vec![format!("unsupported hash algorithm for {}", name)],
                ));
                return None
            }
        };
        file_hashes.insert(name.clone(), digest);
        file_names.push(name);
    }

    result.record(ValidationCheck::passed(keys::OBJECT_VALIDATION));
    let _ = bytes;
    Some(ValidObjectData::Manifest {
        file_names, file_hashes, crl_uri,
        next_update_time: content.next_update(),
    })
}

/// Parses `bytes` just far enough to learn a manifest's file listing and
/// committed hashes, without validating its signature.
///
/// Grounded on the component design's note that `fetchAndStoreConsistentObjectSet`
/// needs `mft.fileNames` and `mft.fileContentSpec(name)` before the object
/// has gone through the validating layer at all -- the consistent fetcher
/// sits below validation in the chain. Duplicate entries are silently
/// collapsed to their last occurrence here; the validating layer's
/// [`validate_manifest`] is what actually rejects a manifest for that.
pub fn decode_manifest_file_hashes(bytes: Bytes) -> Option<Vec<(String, ObjectHash)>> {
    let manifest = Manifest::decode(bytes, false).ok()?;
    let content = manifest.into_content();
    let mut out = Vec::new();
    for item in content.iter() {
        let (file, hash) = item.into_pair();
        let name = String::from_utf8_lossy(&file).into_owned();
        let hash = object_hash_from_digest(&hash)?;
        out.push((name, hash));
    }
    Some(out)
}

/// Turns a manifest entry's raw digest bytes into an [`ObjectHash`].
///
/// `into_pair()` already hands back the digest itself, not a wrapped
/// `ManifestHash` -- no re-digesting needed, just a length check against
/// the only algorithm RFC 6486bis permits.
fn object_hash_from_digest(bytes: &Bytes) -> Option<ObjectHash> {
    if bytes.len() != 32 {
        return None
    }
    let mut buf = [0u8; 32];
    buf.copy_from_slice(bytes);
    Some(ObjectHash::from_array(buf))
}

/// Validates a parsed CRL issued by `ctx`, ignoring the manifest-declared
/// hash (that check happens separately once the manifest is available,
/// per the three-step CRL dance in the component design).
pub fn validate_crl(
    crl: &mut Crl,
    ctx: &Arc<ValidationContext>,
    stale: crate::config::FilterPolicy,
    result: &mut ValidationResult,
) -> bool {
    if crl.validate(ctx.cert().subject_public_key_info()).is_err() {
        result.record(ValidationCheck::failed(
            keys::OBJECT_VALIDATION, vec!["CRL signature invalid".into()],
        ));
        return false
    }
    if crl.is_stale() {
        match stale {
            crate::config::FilterPolicy::Reject => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_STALE, vec!["crl".into()],
                ));
                return false
            }
            crate::config::FilterPolicy::Warn => {
                result.record(ValidationCheck::warning(
                    keys::OBJECT_STALE, vec!["crl".into()],
                ));
            }
            crate::config::FilterPolicy::Accept => { }
        }
    }
    result.record(ValidationCheck::passed(keys::OBJECT_VALIDATION));
    true
}

/// Cross-checks the CRL against its manifest entry: hash and file-name
/// membership. This is the third step of the three-step CRL dance.
pub fn cross_check_crl_hash(
    crl_bytes: &[u8],
    crl_uri: &uri::Rsync,
    file_hashes: &std::collections::HashMap<String, ObjectHash>,
    ca_repository: &uri::Rsync,
    result: &mut ValidationResult,
) -> bool {
    let name = match crl_uri.relative_to(ca_repository) {
        Some(name) => String::from_utf8_lossy(name.as_ref()).into_owned(),
        None => {
            result.record(ValidationCheck::failed(
                keys::OBJECT_VALIDATION,
                vec!["CRL URI outside repository directory".into()],
            ));
            return false
        }
    };
    match file_hashes.get(&name) {
        Some(expected) => {
            let hash = ManifestHash::new(
                Bytes::copy_from_slice(expected.as_bytes()), DigestAlgorithm::sha256(),
            );
            if hash.verify(crl_bytes).is_ok() {
                result.record(ValidationCheck::passed(keys::FILE_CONTENT));
                true
            }
            else {
                result.record(ValidationCheck::failed(
                    keys::FILE_CONTENT, vec![name],
                ));
                false
            }
        }
        None => {
            result.record(ValidationCheck::failed(
                keys::MANIFEST_DOES_NOT_CONTAIN_FILE, vec![name],
            ));
            false
        }
    }
}

/// Validates a ROA against its issuing CA, recording checks on `result`.
///
/// Revocation is checked against `crl` by the EE certificate's serial
/// number, inside the callback `process` invokes once it has extracted
/// that certificate -- the same `roa.process(cert, strict, |cert| ...)`
/// shape the teacher uses for both ROAs and Ghostbuster records.
pub fn validate_roa(
    roa: &Roa,
    ctx: &Arc<ValidationContext>,
    crl: &Crl,
    strict: bool,
    result: &mut ValidationResult,
) -> bool {
    match roa.clone().process(ctx.cert(), strict, |cert| check_crl(crl, &cert)) {
        Ok(_) => {
            result.record(ValidationCheck::passed(keys::OBJECT_VALIDATION));
            true
        }
        Err(err) => {
            result.record(ValidationCheck::failed(
                keys::OBJECT_VALIDATION, vec![err.to_string()],
            ));
            false
        }
    }
}

/// Checks an EE certificate against its issuer's CRL by serial number.
fn check_crl(crl: &Crl, cert: &Cert) -> Result<(), ValidationError> {
    if crl.contains(cert.serial_number()) {
        Err(ValidationError)
    }
    else {
        Ok(())
    }
}

/// Checks the trust anchor's fetched certificate against the TAL's
/// declared public key, per the `trust.anchor.public.key.match` check.
pub fn check_public_key_match(
    cert: &Cert,
    expected_key_info: &Bytes,
    result: &mut ValidationResult,
) -> bool {
    let actual = cert.subject_public_key_info().to_info_bytes();
    if actual.as_ref() == expected_key_info.as_ref() {
        result.record(ValidationCheck::passed(keys::TRUST_ANCHOR_PUBLIC_KEY_MATCH));
        true
    }
    else {
        result.record(ValidationCheck::failed(
            keys::TRUST_ANCHOR_PUBLIC_KEY_MATCH, vec![],
        ));
        false
    }
}
