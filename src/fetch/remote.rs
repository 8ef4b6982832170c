//! The remote fetcher: invokes rsync and hands back whatever landed on
//! disk, without validating or even parsing it.
//!
//! Grounded on the teacher's `collector::rsync` module: a dedicated
//! `tokio::process::Command` invocation per module, a `--contimeout` and a
//! wall-clock timeout via `tokio::time::timeout`, and a working directory
//! laid out per TAL so two anchors sharing a publication point don't race
//! on the same files.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use bytes::Bytes;
use rpki::uri;
use tokio::process::Command;
use crate::config::Config;
use crate::metrics::RsyncFetchMetrics;
use crate::object::{FetchSpec, StoredRepositoryObject};
use crate::validation::{keys, ValidationCheck, ValidationResult};
use super::Fetcher;


//------------ RsyncExecutor ------------------------------------------------------

/// The collaborator that actually runs rsync.
///
/// Pulled out as a trait so tests can substitute a fake that never touches
/// the network or the filesystem.
#[async_trait::async_trait]
pub trait RsyncExecutor: Send + Sync {
    /// Runs `rsync` to mirror `source` into `dest_dir`, returning once the
    /// process exits or the configured timeout elapses.
    async fn run(
        &self, source: &uri::Rsync, dest_dir: &Path,
    ) -> Result<(), RsyncError>;
}

/// What can go wrong invoking rsync.
#[derive(Debug)]
pub enum RsyncError {
    /// The process could not even be spawned.
    Spawn(std::io::Error),
    /// The process ran but exited with a non-zero status.
    ExitStatus(i32),
    /// The process did not finish within the configured timeout.
    Timeout,
}

impl std::fmt::Display for RsyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            RsyncError::Spawn(err) => write!(f, "failed to run rsync: {}", err),
            RsyncError::ExitStatus(code) => write!(f, "rsync exited with status {}", code),
            RsyncError::Timeout => write!(f, "rsync timed out"),
        }
    }
}

/// The default [`RsyncExecutor`], shelling out to the system `rsync`
/// binary.
pub struct ProcessRsyncExecutor {
    command: String,
    args: Vec<String>,
    timeout: Duration,
}

impl ProcessRsyncExecutor {
    pub fn new(config: &Config) -> Self {
        let args = config.rsync_args.clone().unwrap_or_else(|| {
            vec!["-az".into(), "--delete".into(), "--contimeout=10".into()]
        });
        ProcessRsyncExecutor {
            command: config.rsync_command.clone(),
            args,
            timeout: config.rsync_timeout,
        }
    }
}

#[async_trait::async_trait]
impl RsyncExecutor for ProcessRsyncExecutor {
    async fn run(
        &self, source: &uri::Rsync, dest_dir: &Path,
    ) -> Result<(), RsyncError> {
        let mut command = Command::new(&self.command);
        command.args(&self.args)
            .arg(source.to_string())
            .arg(dest_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command.spawn().map_err(RsyncError::Spawn)?;
        let output = tokio::time::timeout(self.timeout, child.wait_with_output()).await
            .map_err(|_| RsyncError::Timeout)?
            .map_err(RsyncError::Spawn)?;

        if !output.status.success() {
            return Err(RsyncError::ExitStatus(output.status.code().unwrap_or(-1)))
        }
        Ok(())
    }
}


//------------ RemoteFetcher -------------------------------------------------------

/// Innermost layer: fetches a module's whole directory tree via rsync into
/// a per-TAL working directory, then serves individual files out of it.
///
/// rsync has no notion of fetching a single file cheaply; mirroring the
/// module once per scheduler tick and reading files back out of the local
/// mirror is both the simplest and the fastest approach, and is what the
/// teacher's collector does.
pub struct RemoteFetcher {
    executor: Box<dyn RsyncExecutor>,
    cache_dir: PathBuf,
    max_object_size: Option<u64>,
}

impl RemoteFetcher {
    pub fn new(
        executor: Box<dyn RsyncExecutor>, config: &Config,
    ) -> Self {
        RemoteFetcher {
            executor,
            cache_dir: config.cache_dir.clone(),
            max_object_size: config.max_object_size,
        }
    }

    /// The local directory a module's mirror lives in.
    fn module_dir(&self, uri: &uri::Rsync) -> PathBuf {
        self.cache_dir.join(uri.module().authority()).join(uri.module().module())
    }

    fn local_path(&self, uri: &uri::Rsync) -> PathBuf {
        self.module_dir(uri).join(uri.path())
    }

    /// Mirrors the module `uri` belongs to, synchronously from the caller's
    /// point of view (a dedicated current-thread runtime drives the
    /// `async` rsync invocation, per the teacher's `RsyncCommand::run`
    /// pattern of giving each invocation its own small runtime rather than
    /// assuming one is already running).
    fn sync_module(&self, uri: &uri::Rsync) -> (bool, Duration) {
        let dir = self.module_dir(uri);
        if let Err(err) = std::fs::create_dir_all(&dir) {
            log::warn!("Failed to create rsync working directory {}: {}", dir.display(), err);
            return (false, Duration::ZERO)
        }
        let started = Instant::now();
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all().build()
        {
            Ok(runtime) => runtime,
            Err(err) => {
                log::error!("Failed to start rsync runtime: {}", err);
                return (false, started.elapsed())
            }
        };
        let result = runtime.block_on(self.executor.run(uri, &dir));
        let elapsed = started.elapsed();
        match result {
            Ok(()) => (true, elapsed),
            Err(err) => {
                log::warn!("rsync fetch of {} failed: {}", uri, err);
                (false, elapsed)
            }
        }
    }
}

impl Fetcher for RemoteFetcher {
    fn prefetch(&self, uris: &[uri::Rsync], result: &mut ValidationResult) {
        for uri in uris {
            let (success, duration) = self.sync_module(uri);
            result.record_metric("rsync.prefetch", uri.to_string());
            let _ = duration;
            if !success {
                result.record(ValidationCheck::warning(
                    keys::RSYNC_COMMAND, vec![uri.to_string()],
                ));
            }
        }
    }

    fn fetch(
        &self,
        uri: &uri::Rsync,
        spec: &FetchSpec,
        result: &mut ValidationResult,
    ) -> Option<StoredRepositoryObject> {
        let (success, _duration) = self.sync_module(uri);
        if !success {
            result.record(ValidationCheck::failed(
                keys::RSYNC_COMMAND, vec![uri.to_string()],
            ));
            return None
        }

        let path = self.local_path(uri);
        let bytes = match std::fs::read(&path) {
            Ok(bytes) => bytes,
            Err(err) => {
                result.record(ValidationCheck::failed(
                    keys::READ_FILE, vec![uri.to_string(), err.to_string()],
                ));
                return None
            }
        };
        if let Some(max) = self.max_object_size {
            if bytes.len() as u64 > max {
                result.record(ValidationCheck::failed(
                    keys::FILE_CONTENT, vec![format!("{} exceeds max object size", uri)],
                ));
                return None
            }
        }
        let object = StoredRepositoryObject::new(uri.clone(), Bytes::from(bytes));
        if let FetchSpec::Hash(expected) = spec {
            if object.hash != *expected {
                result.record(ValidationCheck::failed(
                    keys::FILE_CONTENT, vec![uri.to_string()],
                ));
                return None
            }
        }
        result.record(ValidationCheck::passed(keys::READ_FILE));
        Some(object)
    }
}

/// Builds the metrics entry for one completed rsync fetch, for the caller
/// to push onto the run's [`Metrics`][crate::metrics::Metrics].
pub fn rsync_metrics(module: uri::Rsync, success: bool, duration: Duration) -> RsyncFetchMetrics {
    RsyncFetchMetrics { module, success, duration }
}
