use clap::{Args, Subcommand, ValueEnum};

use crate::config::Config;

#[derive(Clone, Copy, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args)]
pub struct ConfigCommand {
    #[command(subcommand)]
    pub command: ConfigSubcommand,
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Show current configuration values
    Show {
        /// Output format
        #[arg(long, short, value_enum, default_value = "text")]
        format: OutputFormat,
    },
}

impl ConfigCommand {
    pub fn run(&self, config: &Config) -> Result<(), Box<dyn std::error::Error>> {
        match &self.command {
            ConfigSubcommand::Show { format } => {
                match format {
                    OutputFormat::Json => {
                        println!("{}", serde_json::to_string_pretty(config)?);
                    }
                    OutputFormat::Text => {
                        println!("Configuration");
                        println!("=============\n");

                        if let Some(path) = &config.config_file {
                            println!("Config file: {}", path.display());
                        } else {
                            println!(
                                "Config file: {} (not found)",
                                Config::default_config_path().display()
                            );
                        }
                        println!();

                        println!("username: {}", config.username.value);
                        println!("  source: {}", config.username.source);
                        println!();

                        println!("devices: {}", config.devices.value);
                        println!("  source: {}", config.devices.source);
                        println!();

                        println!("sync_period_ms: {}", config.sync_period_ms.value);
                        println!("  source: {}", config.sync_period_ms.source);
                        println!();

                        println!("heartbeat_period_ms: {}", config.engine.heartbeat_period_ms);
                        println!(
                            "device_seen_recently_ms: {}",
                            config.engine.device_seen_recently_ms
                        );
                        println!("tie_break: {:?}", config.engine.tie_break);
                    }
                }
                Ok(())
            }
        }
    }
}
