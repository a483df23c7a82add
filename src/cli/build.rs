//! `kiln build`: one scan, one build of everything, then exit.

use std::time::Instant;

use anyhow::Result;

use crate::config::EngineConfig;
use crate::engine::{BuildRun, Engine};
use crate::log;
use crate::utils::plural::plural_count;

/// Build every component once. Returns `false` when any build failed.
pub fn build_components(config: EngineConfig) -> Result<bool> {
    let started = Instant::now();
    let engine = Engine::new(config)?;
    let run = engine.build_all();
    engine.shutdown();

    log_run(&run, started.elapsed().as_millis());
    Ok(run.is_success())
}

fn log_run(run: &BuildRun, elapsed_ms: u128) {
    for summary in run.failed() {
        log!("error"; "{} failed", summary.component);
        for error in &summary.errors {
            log!("error"; "  {}", error);
        }
    }

    let failed = run.failed().count();
    let cached = run.results.iter().filter(|r| r.cache_hit).count();
    if failed == 0 {
        log!(
            "build";
            "{} built in {}ms ({} cached)",
            plural_count(run.results.len(), "component"),
            elapsed_ms,
            cached
        );
    } else {
        log!(
            "build";
            "{} of {} failed",
            failed,
            plural_count(run.results.len(), "component")
        );
    }
}
