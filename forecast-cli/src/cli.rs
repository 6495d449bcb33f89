use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, bail};
use chrono::Utc;
use clap::{Parser, Subcommand, ValueEnum};
use forecast_core::{
    Config, Delivery, FileSettingsStore, ForecastService, Pipeline, ProviderId, RunFailure,
    AdminCommands, service::HELP_TEXT,
};

/// Top-level CLI struct.
#[derive(Debug, Parser)]
#[command(name = "forecast", version, about = "Two-provider forecast comparison")]
pub struct Cli {
    /// Settings file to use instead of the platform default.
    #[arg(long, global = true)]
    pub settings: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Toggle {
    On,
    Off,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Configure credentials for a specific provider.
    Configure {
        /// Provider short name, e.g. "metno" or "openweather".
        provider: String,
    },

    /// Assign the bot admin.
    SetAdmin {
        #[arg(long)]
        chat: i64,
        /// User issuing the command.
        #[arg(long)]
        user: i64,
        /// New admin id; defaults to the caller.
        target: Option<i64>,
    },

    /// Set coordinates for a chat (admin only).
    SetCoords {
        #[arg(long)]
        chat: i64,
        #[arg(long)]
        user: i64,
        #[arg(allow_hyphen_values = true)]
        lat: f64,
        #[arg(allow_hyphen_values = true)]
        lon: f64,
        /// Place name shown on the chart; asked for interactively if absent.
        #[arg(long)]
        name: Option<String>,
    },

    /// Enable or disable scheduled delivery for a chat (admin only).
    Schedule {
        #[arg(long)]
        chat: i64,
        #[arg(long)]
        user: i64,
        state: Toggle,
    },

    /// Produce a fresh comparison for a chat and write it as PNG.
    Forecast {
        #[arg(long)]
        chat: i64,
        #[arg(long, default_value = "forecast.png")]
        out: PathBuf,
    },

    /// One scheduled round over every enabled chat; meant to be run by cron.
    Tick {
        #[arg(long, default_value = ".")]
        out_dir: PathBuf,
    },

    /// Print the chat command reference.
    HelpText,
}

impl Cli {
    pub async fn run(self) -> anyhow::Result<()> {
        match self.command {
            Command::Configure { provider } => configure(&provider),
            Command::HelpText => {
                println!("{HELP_TEXT}");
                Ok(())
            }
            Command::SetAdmin { chat, user, target } => {
                let admin = admin_commands(self.settings)?;
                match admin.set_admin(chat, user, target) {
                    Ok(admin) => println!("Admin assigned: {admin}"),
                    Err(e) => println!("{}", e.user_message()),
                }
                Ok(())
            }
            Command::SetCoords { chat, user, lat, lon, name } => {
                let admin = admin_commands(self.settings)?;
                let name = match name {
                    Some(name) => name,
                    None => inquire::Text::new("Place name (shown on the forecast card):")
                        .prompt()
                        .context("Failed to read place name")?,
                };
                match admin.update_coordinate(chat, user, lat, lon, &name) {
                    Ok(c) => println!(
                        "Saved for this chat: {}, {} ({})",
                        c.latitude, c.longitude, c.place_name
                    ),
                    Err(e) => println!("{}", e.user_message()),
                }
                Ok(())
            }
            Command::Schedule { chat, user, state } => {
                let admin = admin_commands(self.settings)?;
                let enabled = matches!(state, Toggle::On);
                match admin.set_schedule(chat, user, enabled) {
                    Ok(()) if enabled => println!("Scheduled delivery enabled for this chat."),
                    Ok(()) => println!("Scheduled delivery stopped for this chat."),
                    Err(e) => println!("{}", e.user_message()),
                }
                Ok(())
            }
            Command::Forecast { chat, out } => {
                let service = build_service(self.settings)?;
                match service.run_comparison(chat, Utc::now()).await {
                    Ok(delivery) => deliver(&delivery, &out),
                    Err(e) => {
                        tracing::debug!(error = %e, "comparison failed");
                        println!("{}", e.user_message());
                        Ok(())
                    }
                }
            }
            Command::Tick { out_dir } => {
                let service = build_service(self.settings)?;
                for (chat, outcome) in service.scheduled_tick(Utc::now()).await? {
                    match outcome {
                        Ok(delivery) => {
                            deliver(&delivery, &out_dir.join(format!("forecast-{chat}.png")))?
                        }
                        Err(RunFailure::AlreadyRunning) => {}
                        Err(e) => println!("[{chat}] {}", e.user_message()),
                    }
                }
                Ok(())
            }
        }
    }
}

fn open_store(settings: Option<PathBuf>) -> anyhow::Result<Arc<FileSettingsStore>> {
    let store = match settings {
        Some(path) => FileSettingsStore::new(path),
        None => FileSettingsStore::open_default()?,
    };
    tracing::debug!(path = %store.path().display(), "using settings file");
    Ok(Arc::new(store))
}

/// Settings-only commands don't need provider credentials.
fn admin_commands(settings: Option<PathBuf>) -> anyhow::Result<AdminCommands> {
    Ok(AdminCommands::new(open_store(settings)?))
}

fn build_service(settings: Option<PathBuf>) -> anyhow::Result<ForecastService> {
    let config = Config::load()?;
    let pipeline = Pipeline::from_config(&config)?;
    Ok(ForecastService::new(open_store(settings)?, pipeline))
}

fn deliver(delivery: &Delivery, out: &Path) -> anyhow::Result<()> {
    if let Some(parent) = out.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create output directory: {}", parent.display()))?;
    }
    std::fs::write(out, &delivery.image)
        .with_context(|| format!("Failed to write image: {}", out.display()))?;
    println!("{}", delivery.caption);
    println!("Image written to {}", out.display());
    Ok(())
}

fn configure(provider: &str) -> anyhow::Result<()> {
    let id = ProviderId::try_from(provider)?;
    let mut config = Config::load()?;

    match id {
        ProviderId::OpenWeather => {
            let key = inquire::Password::new("OpenWeather API key:")
                .without_confirmation()
                .prompt()
                .context("Failed to read API key")?;
            if key.trim().is_empty() {
                bail!("API key must not be empty");
            }
            config.set_api_key(id, key.trim().to_string());
        }
        ProviderId::MetNo => {
            let agent = inquire::Text::new("User-Agent for MET Norway (app name and contact):")
                .with_placeholder("my-forecast-bot/1.0 (me@example.com)")
                .prompt()
                .context("Failed to read User-Agent")?;
            if agent.trim().is_empty() {
                bail!("User-Agent must not be empty");
            }
            config.set_user_agent(id, agent.trim().to_string());
        }
    }

    config.save()?;
    println!("Saved {} settings to {}", id.display_name(), Config::config_file_path()?.display());
    Ok(())
}
