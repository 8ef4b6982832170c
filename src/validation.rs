//! Validation checks and the mutable result accumulator they are recorded
//! into.
//!
//! The crypto oracle's API (and RFC 6488/6481 validation generally) is
//! naturally expressed as "mutate a shared result as you go," not as a
//! chain of `Result`-returning calls -- a single object can fail five
//! different checks and we want to see all five, not just the first. We
//! keep that shape here since it is an FFI-shaped contract at the oracle
//! boundary ([`crate::object`]), and build a small, typed vocabulary of
//! check keys on top of it rather than accepting arbitrary strings
//! everywhere.

use std::collections::HashMap;
use std::fmt;
use chrono::{DateTime, Utc};
use rpki::uri;


//------------ Check keys -------------------------------------------------------

/// The closed vocabulary of check keys this crate records.
///
/// The crypto oracle (the `rpki` crate's own validation routines)
/// contributes additional keys of its own; these are the ones the
/// repository-fetching layers add on top, per the external interfaces
/// contract.
pub mod keys {
    pub const TRUST_ANCHOR_PUBLIC_KEY_MATCH: &str =
        "trust.anchor.public.key.match";
    pub const REPOSITORY_OBJECT_NOT_IN_CACHE: &str =
        "validator.repository.object.not.in.cache";
    pub const REPOSITORY_INCOMPLETE: &str =
        "validator.repository.incomplete";
    pub const REPOSITORY_INCONSISTENT: &str =
        "validator.repository.inconsistent";
    pub const RSYNC_COMMAND: &str =
        "validator.rsync.command";
    pub const REPOSITORY_UNKNOWN: &str =
        "validator.repository.unknown";
    pub const MANIFEST_DOES_NOT_CONTAIN_FILE: &str =
        "validator.manifest.does.not.contain.file";
    pub const FILE_CONTENT: &str =
        "validator.file.content";
    pub const READ_FILE: &str =
        "validator.read.file";
    pub const OBJECT_VALIDATION: &str =
        "validator.object.validation";
    pub const OBJECT_STALE: &str =
        "validator.object.stale";
}


//------------ CheckStatus -------------------------------------------------------

/// The verdict of a single validation check.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CheckStatus {
    Passed,
    Warning,
    Failed,
}


//------------ ValidationCheck ---------------------------------------------------

/// A single named check, its verdict, and any parameters describing it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ValidationCheck {
    pub key: String,
    pub status: CheckStatus,
    pub params: Vec<String>,
}

impl ValidationCheck {
    pub fn new(
        key: impl Into<String>, status: CheckStatus, params: Vec<String>
    ) -> Self {
        ValidationCheck { key: key.into(), status, params }
    }

    pub fn passed(key: impl Into<String>) -> Self {
        Self::new(key, CheckStatus::Passed, Vec::new())
    }

    pub fn warning(key: impl Into<String>, params: Vec<String>) -> Self {
        Self::new(key, CheckStatus::Warning, params)
    }

    pub fn failed(key: impl Into<String>, params: Vec<String>) -> Self {
        Self::new(key, CheckStatus::Failed, params)
    }
}

impl fmt::Display for ValidationCheck {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} [{:?}]", self.key, self.status)?;
        if !self.params.is_empty() {
            write!(f, " ({})", self.params.join(", "))?;
        }
        Ok(())
    }
}


//------------ ValidationResult --------------------------------------------------

/// A mutable accumulator of checks and metrics, scoped by a stack of
/// locations.
///
/// Validation of an object may recurse into validation of the objects it
/// depends on (a manifest's CRL, say); `push`/`pop` track which location a
/// [`record`][Self::record] call applies to without every caller having to
/// pass the URI around explicitly.
#[derive(Clone, Debug, Default)]
pub struct ValidationResult {
    location_stack: Vec<uri::Rsync>,
    checks: HashMap<uri::Rsync, Vec<ValidationCheck>>,
    metrics: HashMap<uri::Rsync, Vec<(String, String, DateTime<Utc>)>>,
}

impl ValidationResult {
    /// Creates a new, empty result scoped initially at `location`.
    pub fn new(location: uri::Rsync) -> Self {
        let mut res = ValidationResult::default();
        res.location_stack.push(location);
        res
    }

    /// Creates a fresh, independently-scoped result for `location`.
    ///
    /// Used where the consistent fetcher needs a result object whose
    /// failures are private to one fetch attempt before being folded into
    /// an outer result as warnings.
    pub fn nested(location: uri::Rsync) -> Self {
        Self::new(location)
    }

    /// Pushes a new current location, returning to the previous one on
    /// [`pop`][Self::pop].
    pub fn push(&mut self, location: uri::Rsync) {
        self.location_stack.push(location)
    }

    /// Pops the current location, restoring the previous one.
    pub fn pop(&mut self) {
        if self.location_stack.len() > 1 {
            self.location_stack.pop();
        }
    }

    /// Returns the current location.
    pub fn location(&self) -> &uri::Rsync {
        self.location_stack.last().expect("location stack is never empty")
    }

    /// Records a check against the current location.
    pub fn record(&mut self, check: ValidationCheck) {
        let location = self.location().clone();
        self.checks.entry(location).or_default().push(check);
    }

    /// Records a check against an explicit location, regardless of the
    /// current stack top.
    pub fn record_at(&mut self, location: uri::Rsync, check: ValidationCheck) {
        self.checks.entry(location).or_default().push(check);
    }

    /// Records a free-form metric against the current location.
    pub fn record_metric(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let location = self.location().clone();
        self.metrics.entry(location).or_default().push(
            (name.into(), value.into(), Utc::now())
        );
    }

    /// Whether the current location has at least one failed check.
    pub fn has_failure_for_current_location(&self) -> bool {
        let location = self.location();
        self.checks.get(location).map_or(false, |checks| {
            checks.iter().any(|c| c.status == CheckStatus::Failed)
        })
    }

    /// Whether any location in this result has at least one failed check.
    ///
    /// This is the `hasFailures` test the consistent fetcher's atomicity
    /// rule relies on: a set fetch is only committed if nothing in the
    /// whole scoped result failed.
    pub fn has_failures(&self) -> bool {
        self.checks.values().any(|checks| {
            checks.iter().any(|c| c.status == CheckStatus::Failed)
        })
    }

    /// Returns all checks recorded for `location`.
    pub fn checks_at(&self, location: &uri::Rsync) -> &[ValidationCheck] {
        self.checks.get(location).map_or(&[], |v| v.as_slice())
    }

    /// Returns every check recorded in this result, across all locations.
    pub fn all_checks(&self) -> impl Iterator<Item = (&uri::Rsync, &ValidationCheck)> {
        self.checks.iter().flat_map(|(uri, checks)| {
            checks.iter().map(move |c| (uri, c))
        })
    }

    /// Merges the checks recorded for `from_location` in `other` into
    /// `self` at the current location, downgrading failures to warnings.
    ///
    /// This implements the "remote failures never propagate as errors in
    /// the outer result" rule: a nested fetch's failures become warnings
    /// once copied into the enclosing scope, mapped through the table in
    /// the error handling design.
    pub fn absorb_as_warnings(
        &mut self, other: &ValidationResult, from_location: &uri::Rsync,
    ) {
        for check in other.checks_at(from_location) {
            if check.status != CheckStatus::Failed {
                continue
            }
            let (key, params) = map_remote_failure(&check.key, &check.params);
            self.record(ValidationCheck::warning(key, params));
            self.record_metric("repository.incomplete.or.inconsistent", &check.key);
        }
    }
}

/// Maps a remote-fetch failure key onto the outer warning key it becomes,
/// per the error handling design's mapping table.
fn map_remote_failure(key: &str, params: &[String]) -> (&'static str, Vec<String>) {
    use keys::*;
    match key {
        RSYNC_COMMAND => (RSYNC_COMMAND, params.to_vec()),
        READ_FILE => (REPOSITORY_INCOMPLETE, params.to_vec()),
        FILE_CONTENT => (REPOSITORY_INCONSISTENT, params.to_vec()),
        _ => (REPOSITORY_UNKNOWN, params.to_vec()),
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn uri(s: &str) -> uri::Rsync {
        uri::Rsync::from_str(s).unwrap()
    }

    #[test]
    fn records_and_finds_failure_at_current_location() {
        let mut result = ValidationResult::new(uri("rsync://a/b.cer"));
        assert!(!result.has_failure_for_current_location());
        result.record(ValidationCheck::failed(keys::FILE_CONTENT, vec![]));
        assert!(result.has_failure_for_current_location());
        assert!(result.has_failures());
    }

    #[test]
    fn push_pop_scopes_records_to_the_right_location() {
        let mut result = ValidationResult::new(uri("rsync://a/mft.mft"));
        result.push(uri("rsync://a/child.roa"));
        result.record(ValidationCheck::failed(keys::OBJECT_VALIDATION, vec![]));
        result.pop();
        assert!(!result.has_failure_for_current_location());
        assert!(result.has_failures());
    }

    #[test]
    fn remote_failures_absorb_as_warnings_never_as_failures() {
        let mut inner = ValidationResult::new(uri("rsync://a/b.roa"));
        inner.record(ValidationCheck::failed(keys::RSYNC_COMMAND, vec!["timeout".into()]));

        let mut outer = ValidationResult::new(uri("rsync://a/mft.mft"));
        outer.absorb_as_warnings(&inner, &uri("rsync://a/b.roa"));
        assert!(!outer.has_failures());
        let checks = outer.checks_at(&uri("rsync://a/mft.mft"));
        assert_eq!(checks.len(), 1);
        assert_eq!(checks[0].status, CheckStatus::Warning);
        assert_eq!(checks[0].key, keys::RSYNC_COMMAND);
    }
}
