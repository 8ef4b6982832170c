//! Command line entry point.

use std::process::ExitCode;
use std::sync::Arc;
use rpki_ta_validator::config::{Command, Config};
use rpki_ta_validator::engine::{load_trust_anchors, EngineBuilder};
use rpki_ta_validator::error::Fatal;
use rpki_ta_validator::scheduler::TrustAnchorScheduler;
use rpki_ta_validator::{log as validator_log, store};

fn main() -> ExitCode {
    let config = match Config::from_args() {
        Ok(config) => config,
        Err(Fatal) => return ExitCode::FAILURE,
    };
    if let Err(Fatal) = validator_log::init(&config) {
        return ExitCode::FAILURE
    }

    let result = match config.command {
        Command::Init => init(&config),
        Command::Validate => run_validate(config),
        Command::Vrps => run_vrps(config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(Fatal) => ExitCode::FAILURE,
    }
}

fn init(config: &Config) -> Result<(), Fatal> {
    rpki_ta_validator::utils::fatal::create_dir_all(&config.cache_dir)?;
    rpki_ta_validator::utils::fatal::create_dir_all(&config.store_dir)?;
    rpki_ta_validator::utils::fatal::create_dir_all(&config.tal_dir)?;
    log::info!(
        "Created {}, {} and {}.",
        config.cache_dir.display(), config.store_dir.display(), config.tal_dir.display(),
    );
    Ok(())
}

fn run_validate(config: Config) -> Result<(), Fatal> {
    if config.fresh {
        wipe_caches(&config)?;
    }
    let trust_anchors = load_trust_anchors(&config)?;
    if trust_anchors.is_empty() {
        log::warn!("No trust anchors configured; nothing to validate.");
    }
    let threads = config.validation_threads;
    let scheduler = Arc::new(TrustAnchorScheduler::new(trust_anchors, config.refresh, config.retry));
    let engine = Arc::new(EngineBuilder::new(config)?);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| {
            log::error!("Failed to start runtime: {}", err);
            Fatal
        })?;
    let metrics = runtime.block_on(engine.run_due_concurrently(scheduler, threads));
    if metrics.tals().any(|t| t.invalid_objects > 0 || t.repositories_inconsistent > 0) {
        log::warn!("Validation completed with warnings.");
    }
    Ok(())
}

fn run_vrps(config: Config) -> Result<(), Fatal> {
    let trust_anchors = load_trust_anchors(&config)?;
    let scheduler = TrustAnchorScheduler::new(trust_anchors, config.refresh, config.retry);
    let engine = EngineBuilder::new(config)?;
    engine.run_due(&scheduler);

    let snapshot = scheduler.snapshot();
    for (name, objects) in snapshot.validated_objects.iter() {
        for object in objects.values() {
            if object.is_valid() {
                println!("{}\t{}", name, object.uri());
            }
        }
    }
    Ok(())
}

fn wipe_caches(config: &Config) -> Result<(), Fatal> {
    rpki_ta_validator::utils::fatal::remove_dir_all(&config.cache_dir)?;
    let store = store::SledObjectStore::open(&config.store_dir).map_err(|_| Fatal)?;
    store.clear().map_err(|_| Fatal)
}
