//! Configuration.
//!
//! Configuration comes from the command line, optionally layered over a
//! TOML file. Command line flags always win. This mirrors the way the
//! teacher project resolves its own configuration: a `--base-dir` anchors a
//! handful of derived paths, everything else has a sane default that can be
//! overridden either in the file or on the command line.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use clap::{Parser, Subcommand, ValueEnum};
use log::LevelFilter;
use serde::Deserialize;
use crate::error::Fatal;


//------------ Config ---------------------------------------------------------

/// The fully resolved configuration for a run of the validator.
#[derive(Clone, Debug)]
pub struct Config {
    /// Directory the rsync collector uses as its working directory.
    ///
    /// Per TAL, this contains a subdirectory named after the TAL file
    /// (`tmp/cache/<tal-filename>/`, per the filesystem layout contract).
    pub cache_dir: PathBuf,

    /// Directory the durable object store lives under.
    pub store_dir: PathBuf,

    /// Directory TAL files are read from.
    pub tal_dir: PathBuf,

    /// The command used to invoke rsync.
    pub rsync_command: String,

    /// Extra arguments passed to rsync, if overridden.
    pub rsync_args: Option<Vec<String>>,

    /// Timeout for a single rsync invocation.
    pub rsync_timeout: Duration,

    /// Upper bound on the size of a single fetched object, if any.
    pub max_object_size: Option<u64>,

    /// Whether to validate RPKI data in strict mode.
    pub strict: bool,

    /// How to treat objects whose validity period has lapsed within the
    /// configured grace window.
    pub stale: FilterPolicy,

    /// Number of days past `nextUpdate`/`notAfter` still considered a
    /// recoverable warning rather than an outright failure.
    pub max_stale_days: i64,

    /// Number of trust anchors validated concurrently.
    pub validation_threads: usize,

    /// Interval after a successful run before a TA is scheduled again.
    pub refresh: Duration,

    /// Interval after a failed run before a TA is scheduled again.
    pub retry: Duration,

    /// Maximum age of an object-store entry before `purge_expired` reaps it.
    pub store_max_stale_days: u64,

    /// Maximum recursion depth of the top-down walk.
    pub max_depth: usize,

    /// Whether to wipe the rsync disk cache and store before starting.
    pub fresh: bool,

    /// The level to filter log messages at.
    pub verbose: LevelFilter,

    /// Where to send log output.
    pub log_target: LogTarget,

    /// The subcommand to run.
    pub command: Command,
}

impl Config {
    /// Parses the command line (and an optional config file) into a
    /// [`Config`].
    pub fn from_args() -> Result<Self, Fatal> {
        let args = Args::parse();
        Self::from_parsed(args)
    }

    fn from_parsed(args: Args) -> Result<Self, Fatal> {
        let file = match args.config.as_ref() {
            Some(path) => Some(ConfigFile::read(path)?),
            None => None,
        };
        let base_dir = args.base_dir.clone().unwrap_or_else(|| {
            dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".rpki-cache")
        });

        let file = file.unwrap_or_default();

        Ok(Config {
            cache_dir: args.cache_dir.clone()
                .or_else(|| file.cache_dir.clone().map(PathBuf::from))
                .unwrap_or_else(|| base_dir.join("repository")),
            store_dir: base_dir.join("stored"),
            tal_dir: args.tal_dir.clone()
                .or_else(|| file.tal_dir.clone().map(PathBuf::from))
                .unwrap_or_else(|| base_dir.join("tals")),
            rsync_command: file.rsync_command
                .clone()
                .unwrap_or_else(|| "rsync".into()),
            rsync_args: file.rsync_args.clone(),
            rsync_timeout: Duration::from_secs(
                args.rsync_timeout.or(file.rsync_timeout).unwrap_or(300)
            ),
            max_object_size: file.max_object_size,
            strict: args.strict || file.strict.unwrap_or(false),
            stale: file.stale.unwrap_or(FilterPolicy::Warn),
            max_stale_days: file.max_stale_days.unwrap_or(0),
            validation_threads: args.validation_threads
                .or(file.validation_threads)
                .unwrap_or_else(|| num_cpus::get().max(1)),
            refresh: Duration::from_secs(
                args.refresh.or(file.refresh).unwrap_or(4 * 3600)
            ),
            retry: Duration::from_secs(
                args.retry.or(file.retry).unwrap_or(3600)
            ),
            store_max_stale_days: file.store_max_stale_days.unwrap_or(14),
            max_depth: file.max_depth.unwrap_or(255),
            fresh: args.fresh,
            verbose: match args.verbose {
                0 => LevelFilter::Warn,
                1 => LevelFilter::Info,
                _ => LevelFilter::Debug,
            },
            log_target: match (&args.log_file, args.syslog) {
                (Some(path), _) => LogTarget::File(path.clone()),
                (None, true) => LogTarget::Syslog,
                (None, false) => LogTarget::Stderr,
            },
            command: args.command,
        })
    }
}


//------------ FilterPolicy ---------------------------------------------------

/// How to treat a recoverable-but-suspicious condition.
#[derive(Clone, Copy, Debug, Eq, PartialEq, ValueEnum, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterPolicy {
    /// Treat the condition as a hard failure.
    Reject,
    /// Accept the object but record a warning check.
    Warn,
    /// Silently accept the object.
    Accept,
}


//------------ LogTarget -------------------------------------------------------

/// Where log output should go.
#[derive(Clone, Debug)]
pub enum LogTarget {
    /// Write to standard error.
    Stderr,
    /// Write to the given file.
    File(PathBuf),
    /// Write to syslog.
    Syslog,
}


//------------ Command ----------------------------------------------------------

/// The subcommand selected on the command line.
#[derive(Clone, Copy, Debug, Subcommand)]
pub enum Command {
    /// Creates the TAL and cache directories.
    Init,
    /// Performs one validation pass over all enabled trust anchors.
    Validate,
    /// Prints the validated objects currently known for each trust anchor.
    Vrps,
}


//------------ Args -------------------------------------------------------------

/// Command line arguments, parsed by `clap`.
#[derive(Parser, Debug)]
#[command(name = "rpki-ta-validator", about = "RPKI trust-anchor validator")]
struct Args {
    /// Base directory holding the cache, store and TAL directories.
    #[arg(short = 'b', long = "base-dir", value_name = "DIR")]
    base_dir: Option<PathBuf>,

    /// Directory the rsync collector and object store use.
    #[arg(short = 'c', long = "cache-dir", value_name = "DIR")]
    cache_dir: Option<PathBuf>,

    /// Directory TAL files are read from.
    #[arg(short = 't', long = "tal-dir", value_name = "DIR")]
    tal_dir: Option<PathBuf>,

    /// Optional TOML configuration file layered underneath these flags.
    #[arg(long = "config", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Parse RPKI data in strict mode.
    #[arg(long = "strict")]
    strict: bool,

    /// Wipe the rsync cache and object store before starting.
    #[arg(long = "fresh")]
    fresh: bool,

    /// Timeout for a single rsync invocation, in seconds.
    #[arg(long = "rsync-timeout", value_name = "SECONDS")]
    rsync_timeout: Option<u64>,

    /// Interval after success before a TA is revalidated, in seconds.
    #[arg(long = "refresh", value_name = "SECONDS")]
    refresh: Option<u64>,

    /// Interval after failure before a TA is retried, in seconds.
    #[arg(long = "retry", value_name = "SECONDS")]
    retry: Option<u64>,

    /// Number of trust anchors validated concurrently.
    #[arg(long = "validation-threads", value_name = "COUNT")]
    validation_threads: Option<usize>,

    /// Print more (and more) log output.
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    verbose: u8,

    /// Write log output to this file instead of stderr.
    #[arg(long = "log-file", value_name = "FILE")]
    log_file: Option<PathBuf>,

    /// Write log output to syslog instead of stderr.
    #[arg(long = "syslog")]
    syslog: bool,

    #[command(subcommand)]
    command: Command,
}


//------------ ConfigFile -------------------------------------------------------

/// The subset of [`Config`] that can come from a TOML file.
#[derive(Clone, Debug, Default, Deserialize)]
struct ConfigFile {
    cache_dir: Option<String>,
    tal_dir: Option<String>,
    rsync_command: Option<String>,
    rsync_args: Option<Vec<String>>,
    rsync_timeout: Option<u64>,
    max_object_size: Option<u64>,
    strict: Option<bool>,
    stale: Option<FilterPolicy>,
    max_stale_days: Option<i64>,
    validation_threads: Option<usize>,
    refresh: Option<u64>,
    retry: Option<u64>,
    store_max_stale_days: Option<u64>,
    max_depth: Option<usize>,
}

impl ConfigFile {
    fn read(path: &Path) -> Result<Self, Fatal> {
        let content = fs::read_to_string(path).map_err(|err| {
            log::error!(
                "Failed to read config file {}: {}", path.display(), err
            );
            Fatal
        })?;
        toml::from_str(&content).map_err(|err| {
            log::error!(
                "Failed to parse config file {}: {}", path.display(), err
            );
            Fatal
        })
    }
}
