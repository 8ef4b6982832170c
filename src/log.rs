//! Logging setup.
//!
//! We use the standard `log` facade throughout the crate and only need to
//! pick a backend once at start up, driven by [`Config`]. `fern` gives us a
//! leveled dispatcher; on Unix we can additionally send everything to
//! syslog.

use fern::Dispatch;
use log::LevelFilter;
use crate::config::{Config, LogTarget};
use crate::error::Fatal;


/// Initializes logging according to `config`.
///
/// Must be called exactly once, before any other part of the crate logs
/// anything.
pub fn init(config: &Config) -> Result<(), Fatal> {
    let dispatch = Dispatch::new()
        .format(|out, message, record| {
            out.finish(format_args!(
                "[{} {}] {}",
                chrono::Utc::now().format("%Y-%m-%d %H:%M:%S"),
                record.level(),
                message
            ))
        })
        .level(config.verbose);

    let dispatch = match &config.log_target {
        LogTarget::Stderr => dispatch.chain(std::io::stderr()),
        LogTarget::File(path) => {
            let file = fern::log_file(path).map_err(|err| {
                eprintln!(
                    "Failed to open log file {}: {}", path.display(), err
                );
                Fatal
            })?;
            dispatch.chain(file)
        }
        LogTarget::Syslog => {
            dispatch.chain(syslog_chain()?)
        }
    };

    dispatch.apply().map_err(|err| {
        eprintln!("Failed to initialize logging: {}", err);
        Fatal
    })
}

#[cfg(unix)]
fn syslog_chain() -> Result<fern::Output, Fatal> {
    let formatter = syslog::Formatter3164 {
        facility: syslog::Facility::LOG_DAEMON,
        hostname: None,
        process: "rpki-ta-validator".into(),
        pid: std::process::id(),
    };
    let logger = syslog::unix(formatter).map_err(|err| {
        eprintln!("Failed to connect to syslog: {}", err);
        Fatal
    })?;
    Ok(fern::Output::writer(
        Box::new(syslog::BasicLogger::new(logger)), "\n"
    ))
}

#[cfg(not(unix))]
fn syslog_chain() -> Result<fern::Output, Fatal> {
    eprintln!("Syslog logging is only available on Unix.");
    Err(Fatal)
}

/// Returns the minimal level filter any dispatcher should apply globally.
///
/// Kept separate from `Config::verbose` so library consumers embedding this
/// crate can cap verbosity independently of the CLI's own flag.
pub fn max_level() -> LevelFilter {
    log::max_level()
}
