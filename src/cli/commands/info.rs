//! Info command implementation

use crate::cli::args::{InfoArgs, OutputFormat};
use crate::cli::commands::validate::format_descriptor;
use crate::cli::LogLevel;
use crate::config::Config;

pub fn run_info(args: InfoArgs, _level: LogLevel) -> Result<(), String> {
    let config = Config::from_path(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let descriptors = config
        .descriptors()
        .map_err(|e| format!("Config error: {e}"))?;

    match args.format {
        OutputFormat::Text => {
            println!("Batch of {} experiment(s)", descriptors.len());
            println!("Checkpoint root: {}", config.root().display());
            println!(
                "Email notifications: {}",
                if config.email.can_send() { "enabled" } else { "disabled" }
            );
            for desc in &descriptors {
                println!("{}", format_descriptor(desc));
            }
        }
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(&descriptors)
                .map_err(|e| format!("Serialization error: {e}"))?;
            println!("{json}");
        }
        OutputFormat::Yaml => {
            let yaml = serde_yaml::to_string(&descriptors)
                .map_err(|e| format!("Serialization error: {e}"))?;
            println!("{yaml}");
        }
    }

    Ok(())
}
