//! The recursive top-down validation walk.
//!
//! Starting from a validated trust anchor certificate, the walker follows
//! manifests and certificates down through the CA hierarchy, producing a
//! flat map from URI to validated (or invalid) object. It is the one piece
//! of the pipeline that knows about the *shape* of the RPKI repository
//! tree; everything below it (the fetcher chain) only knows about
//! individual URIs.

use std::collections::HashSet;
use std::sync::Arc;
use rpki::repository::crl::Crl;
use rpki::uri;
use crate::config::{Config, FilterPolicy};
use crate::fetch::notify::RoaCollectorListener;
use crate::fetch::validating::ValidatingFetcher;
use crate::object::{FetchSpec, ValidObjectData, ValidatedObject, ValidationContext};
use crate::tal::Tal;
use crate::validation::{keys, ValidationCheck, ValidationResult};

/// Drives one full walk of a single trust anchor's hierarchy.
///
/// The walker itself never populates the result map -- it reports every
/// validated or failed object to `collector` as it goes, the same
/// notification-driven collection the rest of the fetch chain uses. The
/// engine reads the finished map back out of the collector once the walk
/// returns.
pub struct TopDownWalker<'a> {
    fetcher: &'a ValidatingFetcher,
    collector: &'a RoaCollectorListener,
    max_depth: usize,
    stale: FilterPolicy,
}

impl<'a> TopDownWalker<'a> {
    pub fn new(
        fetcher: &'a ValidatingFetcher, collector: &'a RoaCollectorListener, config: &Config,
    ) -> Self {
        TopDownWalker {
            fetcher,
            collector,
            max_depth: config.max_depth,
            stale: config.stale,
        }
    }

    /// Validates the trust anchor described by `tal` end to end, trying
    /// each certificate location in turn until one both fetches and
    /// matches the TAL's declared key.
    ///
    /// Returns the top-level [`ValidationResult`]; the validated object map
    /// is collected as a side effect and read back out of the collector
    /// passed to [`Self::new`].
    pub fn run(mut self, tal: &Tal, tal_index: usize) -> ValidationResult {
        let tal_info = rpki::repository::tal::TalInfo::from_name(
            tal.name().to_string()
        ).into_arc();

        if !tal.prefetch_uris().is_empty() {
            let mut prefetch_result = ValidationResult::new(
                tal.certificate_locations()[0].clone()
            );
            self.fetcher.prefetch(tal.prefetch_uris(), &mut prefetch_result);
        }

        let mut result = ValidationResult::new(tal.certificate_locations()[0].clone());
        let mut root = None;
        let mut root_uri = tal.certificate_locations()[0].clone();
        for uri in tal.certificate_locations() {
            result.push(uri.clone());
            root = self.fetcher.fetch_anchor(
                uri, tal.key_info(), tal_info.clone(), tal_index, &mut result,
            );
            result.pop();
            if root.is_some() {
                root_uri = uri.clone();
                break
            }
        }

        let root = match root {
            Some(root) => root,
            None => {
                result.record(ValidationCheck::failed(
                    keys::TRUST_ANCHOR_PUBLIC_KEY_MATCH,
                    vec!["no certificate location produced a matching certificate".into()],
                ));
                self.collector.after_validate_failure(
                    &tal.certificate_locations()[0],
                    result.checks_at(&tal.certificate_locations()[0]),
                );
                return result
            }
        };

        self.collector.after_validate_success(&ValidatedObject::Valid {
            uri: root_uri,
            checks: Vec::new(),
            object: Box::new(ValidObjectData::Cert(root.clone())),
        });

        let mut visited_manifests = HashSet::new();
        self.walk(&root, &mut visited_manifests, &mut result);
        result
    }

    /// Validates one CA's manifest, its listed files, and recurses into any
    /// child CA certificates among them.
    ///
    /// `visited_manifests` defends against two publication points
    /// referencing each other's manifest URI, which the certificate-cycle
    /// check in [`ValidationContext::check_loop`] alone would not catch
    /// since it keys on subject key identifiers, not manifest URIs.
    fn walk(
        &mut self,
        ctx: &Arc<ValidationContext>,
        visited_manifests: &mut HashSet<uri::Rsync>,
        result: &mut ValidationResult,
    ) {
        if ctx.depth() > self.max_depth {
            result.record_at(ctx.rpki_manifest().clone(), ValidationCheck::failed(
                keys::OBJECT_VALIDATION, vec!["maximum walk depth exceeded".into()],
            ));
            return
        }
        if !visited_manifests.insert(ctx.rpki_manifest().clone()) {
            result.record_at(ctx.rpki_manifest().clone(), ValidationCheck::failed(
                keys::OBJECT_VALIDATION, vec!["manifest URI already visited".into()],
            ));
            return
        }

        result.push(ctx.rpki_manifest().clone());
        let outcome = self.fetcher.fetch_manifest(ctx, result);
        let (manifest, crl) = match outcome {
            Some(outcome) => outcome,
            None => {
                result.pop();
                return
            }
        };
        result.pop();

        let (file_names, file_hashes, crl_uri) = match manifest {
            ValidObjectData::Manifest { file_names, file_hashes, crl_uri, .. } => {
                (file_names, file_hashes, crl_uri)
            }
            _ => unreachable!("fetch_manifest always returns Manifest data"),
        };

        self.collector.after_validate_success(&ValidatedObject::Valid {
            uri: crl_uri.clone(),
            checks: Vec::new(),
            object: Box::new(ValidObjectData::Crl { next_update_time: crl.next_update() }),
        });

        for name in &file_names {
            let hash = file_hashes.get(name).copied();
            let uri = match resolve(ctx.ca_repository(), name) {
                Some(uri) => uri,
                None => continue,
            };
            let spec = match hash {
                Some(hash) => FetchSpec::Hash(hash),
                None => FetchSpec::Uri,
            };
            self.visit_entry(&uri, &spec, ctx, &crl, visited_manifests, result);
        }
    }

    fn visit_entry(
        &mut self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        ctx: &Arc<ValidationContext>,
        crl: &Crl,
        visited_manifests: &mut HashSet<uri::Rsync>,
        result: &mut ValidationResult,
    ) {
        result.push(uri.clone());
        if uri.path().ends_with(".cer") {
            if let Some(child) = self.fetcher.fetch_ca_cert(uri, spec, ctx, result) {
                self.collector.after_validate_success(&ValidatedObject::Valid {
                    uri: uri.clone(),
                    checks: Vec::new(),
                    object: Box::new(ValidObjectData::Cert(child.clone())),
                });
                result.pop();
                self.walk(&child, visited_manifests, result);
                return
            }
            self.collector.after_validate_failure(uri, result.checks_at(uri));
        }
        else if uri.path().ends_with(".roa") {
            if let Some(validated) = self.fetcher.fetch_roa(uri, spec, ctx, crl, result) {
                match &validated {
                    ValidatedObject::Valid { .. } => self.collector.after_validate_success(&validated),
                    ValidatedObject::Invalid { checks, .. } => {
                        self.collector.after_validate_failure(uri, checks);
                    }
                }
            }
        }
        else {
            result.record(ValidationCheck::warning(
                keys::OBJECT_VALIDATION, vec!["unrecognized manifest entry".into()],
            ));
        }
        result.pop();
    }
}

fn resolve(base: &uri::Rsync, name: &str) -> Option<uri::Rsync> {
    use std::str::FromStr;
    let mut s = base.to_string();
    if !s.ends_with('/') {
        s.push('/');
    }
    s.push_str(name);
    uri::Rsync::from_str(&s).ok()
}
