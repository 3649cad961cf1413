//! Run command implementation

use crate::backend::Collaborators;
use crate::cli::args::RunArgs;
use crate::cli::logging::log;
use crate::cli::LogLevel;
use crate::config::Config;
use crate::notify::Notifier;
use crate::runner::{RunResult, Runner, RunnerOptions};
use crate::Error;

pub fn run_batch(args: RunArgs, level: LogLevel) -> Result<(), String> {
    let config = Config::from_path(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let descriptors = config
        .descriptors()
        .map_err(|e| format!("Config error: {e}"))?;

    log(
        level,
        LogLevel::Normal,
        &format!(
            "Loaded {} experiment(s) from {}",
            descriptors.len(),
            args.config.display()
        ),
    );

    if args.dry_run {
        for desc in &descriptors {
            log(level, LogLevel::Normal, &format!("  {}", desc.name()));
        }
        log(level, LogLevel::Normal, "Dry run: nothing executed");
        return Ok(());
    }

    let root = args.root.unwrap_or_else(|| config.root());
    let mut options = RunnerOptions::new(root);
    if let Some(batch_size) = args.batch_size {
        options = options.with_batch_size(batch_size);
    }

    let notifier = Notifier::from_email_config(&config.email);
    let mut runner = Runner::new(options, Collaborators::reference(args.seed), notifier);

    match runner.run(&descriptors) {
        Ok(results) => {
            report(&results, level);
            Ok(())
        }
        Err(Error::Aborted { results, cause }) => {
            report(&results, level);
            Err(format!("Batch aborted: {cause}"))
        }
        Err(e) => Err(format!("Run failed: {e}")),
    }
}

fn report(results: &[RunResult], level: LogLevel) {
    for result in results {
        log(
            level,
            LogLevel::Normal,
            &format!("{}: {}", result.descriptor, result.summary()),
        );
        if !result.resumed.is_empty() {
            let stages: Vec<&str> = result.resumed.iter().map(|s| s.name()).collect();
            log(
                level,
                LogLevel::Verbose,
                &format!("  resumed past: {}", stages.join(", ")),
            );
        }
    }
    let succeeded = results.iter().filter(|r| r.status.is_success()).count();
    log(
        level,
        LogLevel::Normal,
        &format!("{succeeded}/{} experiment(s) completed", results.len()),
    );
}
