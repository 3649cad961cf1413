//! Validate command implementation

use crate::cli::args::ValidateArgs;
use crate::cli::logging::log;
use crate::cli::LogLevel;
use crate::config::Config;
use crate::experiment::ExperimentDescriptor;

/// Format one expanded experiment as an indented block
pub fn format_descriptor(desc: &ExperimentDescriptor) -> String {
    let mut lines = vec![
        format!("  {}", desc.name()),
        format!("    Model: {} on {}", desc.model_type, desc.dataset),
    ];
    match desc.prune_method {
        Some(method) => lines.push(format!(
            "    Prune: {} to {}x, {} finetune epoch(s)",
            method, desc.prune_compression, desc.finetune_epochs
        )),
        None => lines.push("    Prune: disabled".to_string()),
    }
    if let Some(modulus) = desc.quantization {
        lines.push(format!("    Quantize: modulus {modulus}"));
    }
    if let Some(method) = desc.attack_method {
        lines.push(format!(
            "    Attack: {method} eps={} nb_iter={}",
            desc.attack_kwargs.eps, desc.attack_kwargs.nb_iter
        ));
    }
    if let Some(metric) = desc.best_model_metric {
        lines.push(format!("    Best epoch by: {metric}"));
    }
    if let Some(path) = &desc.model_path {
        lines.push(format!("    Pretrained: {}", path.display()));
    }
    if let Some(batches) = desc.debug {
        lines.push(format!("    Debug: 1 epoch, {batches} batch(es)"));
    }
    lines.join("\n")
}

pub fn run_validate(args: ValidateArgs, level: LogLevel) -> Result<(), String> {
    log(
        level,
        LogLevel::Normal,
        &format!("Validating config: {}", args.config.display()),
    );

    let config = Config::from_path(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let descriptors = config
        .descriptors()
        .map_err(|e| format!("Validation failed: {e}"))?;

    log(
        level,
        LogLevel::Normal,
        &format!("Configuration is valid: {} experiment(s)", descriptors.len()),
    );

    if args.detailed {
        for desc in &descriptors {
            println!("{}", format_descriptor(desc));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::experiment::{
        AttackKwargs, AttackMethod, BestMetric, Dataset, ModelType, PruneMethod,
    };

    fn make_descriptor() -> ExperimentDescriptor {
        ExperimentDescriptor {
            experiment_number: 1,
            model_type: ModelType::Resnet20,
            dataset: Dataset::Cifar10,
            prune_method: Some(PruneMethod::random()),
            prune_compression: 2.0,
            finetune_epochs: 40,
            quantization: Some(128),
            model_path: None,
            debug: Some(3),
            best_model_metric: None,
            attack_method: Some(AttackMethod::Pgd),
            attack_kwargs: AttackKwargs::default(),
            email_verbose: false,
            save_one_checkpoint: false,
            seed: 42,
        }
    }

    #[test]
    fn test_format_descriptor_lists_stages() {
        let mut desc = make_descriptor();
        desc.best_model_metric = Some(BestMetric::Accuracy);
        let info = format_descriptor(&desc);
        assert!(info.contains("resnet20 on CIFAR10"));
        assert!(info.contains("RandomPruning"));
        assert!(info.contains("40 finetune epoch(s)"));
        assert!(info.contains("modulus 128"));
        assert!(info.contains("pgd"));
        assert!(info.contains("3 batch(es)"));
        assert!(info.contains("Best epoch by: accuracy"));
    }

    #[test]
    fn test_format_descriptor_without_pruning() {
        let mut desc = make_descriptor();
        desc.prune_method = None;
        desc.prune_compression = 1.0;
        desc.finetune_epochs = 0;
        let info = format_descriptor(&desc);
        assert!(info.contains("Prune: disabled"));
    }
}
