//! The validating fetcher: decodes and validates each object against its
//! issuing context before handing it onward.
//!
//! This is the layer that actually calls into the `rpki` crate. It needs a
//! back-reference to the outermost fetcher (through the notifying and
//! caching layers) so that validating a manifest can recursively fetch its
//! CRL through the full chain rather than going straight to the remote
//! layer underneath it -- otherwise the CRL would bypass the cache and the
//! event notifications both.

use std::sync::{Arc, Mutex, Weak};
use rpki::repository::crl::Crl;
use rpki::uri;
use crate::config::FilterPolicy;
use crate::object::{
    self, FetchSpec, ObjectHash, RepositoryObject, StoredRepositoryObject,
    ValidObjectData, ValidatedObject, ValidationContext,
};
use crate::validation::{keys, ValidationCheck, ValidationResult};
use super::Fetcher;

/// Wraps an inner fetcher, decoding and validating whatever it returns.
///
/// `outermost` is filled in after construction (see
/// [`EngineBuilder`][crate::engine::EngineBuilder]) once the full chain
/// exists, since the validating layer sits in the middle of it.
pub struct ValidatingFetcher {
    inner: Box<dyn Fetcher>,
    strict: bool,
    stale: FilterPolicy,
    outermost: Mutex<Option<Weak<dyn Fetcher>>>,
}

impl ValidatingFetcher {
    pub fn new(inner: Box<dyn Fetcher>, strict: bool, stale: FilterPolicy) -> Self {
        ValidatingFetcher {
            inner, strict, stale,
            outermost: Mutex::new(None),
        }
    }

    /// Sets the back-reference to the outermost layer of the chain.
    ///
    /// Called once by the engine builder after the full chain is
    /// assembled.
    pub fn set_outermost(&self, outermost: Weak<dyn Fetcher>) {
        *self.outermost.lock().unwrap() = Some(outermost);
    }

    fn outermost(&self) -> Option<Arc<dyn Fetcher>> {
        self.outermost.lock().unwrap().as_ref()?.upgrade()
    }

    /// Fetches, validates and returns a manifest's CRL, cross-checking it
    /// against the manifest's own hash commitment for that file.
    ///
    /// Grounded on the component design's three-step CRL dance: fetch the
    /// CRL by URI (no hash yet, since we don't have the manifest's
    /// commitment until we've parsed it); validate the CRL's signature
    /// against the issuing CA; cross-check the fetched bytes against the
    /// manifest's declared hash for that file name.
    fn fetch_and_validate_crl(
        &self,
        ctx: &Arc<ValidationContext>,
        crl_uri: &uri::Rsync,
        file_hashes: &std::collections::HashMap<String, ObjectHash>,
        result: &mut ValidationResult,
    ) -> Option<Crl> {
        let chain = self.outermost()?;
        result.push(crl_uri.clone());
        let stored = chain.fetch(crl_uri, &FetchSpec::Uri, result);
        let stored = match stored {
            Some(stored) => stored,
            None => { result.pop(); return None }
        };

        let name_ok = object::cross_check_crl_hash(
            &stored.bytes, crl_uri, file_hashes, ctx.ca_repository(), result,
        );
        if !name_ok {
            result.pop();
            return None
        }

        let mut crl = match Crl::decode(stored.bytes.clone()) {
            Ok(crl) => crl,
            Err(_) => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_VALIDATION, vec!["malformed CRL".into()],
                ));
                result.pop();
                return None
            }
        };
        let ok = object::validate_crl(&mut crl, ctx, self.stale, result);
        result.pop();
        if ok { Some(crl) } else { None }
    }
}

impl Fetcher for ValidatingFetcher {
    fn prefetch(&self, uris: &[uri::Rsync], result: &mut ValidationResult) {
        self.inner.prefetch(uris, result)
    }

    fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        result: &mut ValidationResult,
    ) -> Option<StoredRepositoryObject> {
        // This layer only validates objects it is asked to *interpret*
        // (certificates, manifests, CRLs, ROAs are validated by the walker
        // calling the dedicated entry points below); a bare `fetch` simply
        // passes through, since callers that need raw bytes (e.g. the
        // consistent-set collector) don't want them pre-parsed.
        self.inner.fetch(uri, spec, result)
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

/// The validation operations the walker drives, one per object kind. These
/// live on the fetcher (rather than as free functions over
/// [`crate::object`]) because validating a manifest needs to recurse back
/// through the full fetcher chain to retrieve its CRL.
impl ValidatingFetcher {
    /// Fetches and validates the trust anchor certificate at `uri`,
    /// checking it against the TAL's declared public key.
    pub fn fetch_anchor(
        &self,
        uri: &uri::Rsync,
        key_info: &bytes::Bytes,
        tal_info: Arc<rpki::repository::tal::TalInfo>,
        tal_index: usize,
        result: &mut ValidationResult,
    ) -> Option<Arc<ValidationContext>> {
        let stored = self.outermost()?.fetch(uri, &FetchSpec::Uri, result)?;
        let cert = match rpki::repository::cert::Cert::decode(stored.bytes.clone()) {
            Ok(cert) => cert,
            Err(_) => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_VALIDATION, vec!["malformed certificate".into()],
                ));
                return None
            }
        };
        if !object::check_public_key_match(&cert, key_info, result) {
            return None
        }
        let resource_cert = match cert.validate_ta(tal_info, self.strict) {
            Ok(cert) => cert,
            Err(err) => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_VALIDATION, vec![err.to_string()],
                ));
                return None
            }
        };
        result.record(ValidationCheck::passed(keys::OBJECT_VALIDATION));
        ValidationContext::root(resource_cert, tal_index).ok()
    }

    /// Fetches and validates a CA certificate issued by `ctx`.
    pub fn fetch_ca_cert(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        ctx: &Arc<ValidationContext>,
        result: &mut ValidationResult,
    ) -> Option<Arc<ValidationContext>> {
        let stored = self.outermost()?.fetch(uri, spec, result)?;
        let cert = match rpki::repository::cert::Cert::decode(stored.bytes) {
            Ok(cert) => cert,
            Err(_) => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_VALIDATION, vec!["malformed certificate".into()],
                ));
                return None
            }
        };
        object::validate_ca(cert, ctx, self.strict, result)
    }

    /// Fetches, validates and returns a CA's manifest, along with its
    /// cross-checked CRL.
    pub fn fetch_manifest(
        &self,
        ctx: &Arc<ValidationContext>,
        result: &mut ValidationResult,
    ) -> Option<(ValidObjectData, Crl)> {
        let manifest_uri = ctx.rpki_manifest().clone();
        let stored = self.outermost()?.fetch(&manifest_uri, &FetchSpec::Uri, result)?;
        let object = RepositoryObject::decode(&manifest_uri, stored.bytes.clone(), self.strict).ok()?;
        let (content, raw) = match object {
            RepositoryObject::Manifest(content, raw) => (content, raw),
            _ => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_VALIDATION, vec!["not a manifest".into()],
                ));
                return None
            }
        };
        let data = object::validate_manifest(content, &raw, ctx, self.stale, result)?;
        let (file_names, file_hashes, crl_uri) = match &data {
            ValidObjectData::Manifest { file_names, file_hashes, crl_uri, .. } => {
                (file_names.clone(), file_hashes.clone(), crl_uri.clone())
            }
            _ => unreachable!(),
        };
        let _ = file_names;
        let crl = self.fetch_and_validate_crl(ctx, &crl_uri, &file_hashes, result)?;
        Some((data, crl))
    }

    /// Fetches and validates a ROA listed on a manifest.
    pub fn fetch_roa(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        ctx: &Arc<ValidationContext>,
        crl: &Crl,
        result: &mut ValidationResult,
    ) -> Option<ValidatedObject> {
        let stored = self.outermost()?.fetch(uri, spec, result)?;
        let roa = match rpki::repository::roa::Roa::decode(stored.bytes, self.strict) {
            Ok(roa) => roa,
            Err(_) => {
                result.record(ValidationCheck::failed(
                    keys::OBJECT_VALIDATION, vec!["malformed ROA".into()],
                ));
                return Some(ValidatedObject::Invalid { uri: uri.clone(), checks: Vec::new() })
            }
        };
        let valid = object::validate_roa(&roa, ctx, crl, self.strict, result);
        Some(if valid {
            ValidatedObject::Valid {
                uri: uri.clone(), checks: Vec::new(),
                object: Box::new(ValidObjectData::Roa),
            }
        } else {
            ValidatedObject::Invalid { uri: uri.clone(), checks: Vec::new() }
        })
    }
}
