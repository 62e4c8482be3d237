use anyhow::{Context as _, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use resumable_workflows::clock::{Clock, SystemClock};
use resumable_workflows::config::{init_config, WorkflowConfig};
use resumable_workflows::platform::HeadlessBrowser;
use resumable_workflows::telemetry::{init_telemetry, shutdown_telemetry};
use resumable_workflows::workflows::disposition::{delivery_eligibility, resolve_consign_price, AssetItem, ItemFlags};
use resumable_workflows::workflows::identity::{provider_error_message, RedirectCallback};

#[derive(Parser)]
#[command(name = "workflowctl")]
#[command(about = "Inspect and operate resumable workflow state")]
#[command(long_about = "workflowctl evaluates the time gates, callback parsing and pricing rules used by the \
                       workflow controllers, and manages the pending verification callback kept in session storage.")]
struct Cli {
    /// Emit JSON log lines
    #[arg(long, global = true)]
    json_logs: bool,

    /// Enable debug logging
    #[arg(long, short = 'v', global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check whether an item purchased at the given time may be delivered
    DeliveryCheck {
        /// Purchase time (RFC 3339)
        #[arg(long)]
        purchased_at: DateTime<Utc>,
        /// Evaluate at this time instead of now (RFC 3339)
        #[arg(long)]
        now: Option<DateTime<Utc>>,
        /// Override the configured holding window
        #[arg(long)]
        holding_hours: Option<u32>,
    },
    /// Parse the parameters a verification provider appended to a return URL
    ParseCallback {
        /// Full return URL including its query string
        url: String,
    },
    /// Compute the consignment price for an item
    ConsignPrice {
        #[arg(long)]
        buy_price: f64,
        #[arg(long, default_value = "0")]
        rate: f64,
        /// Market reference price, preferred when usable
        #[arg(long)]
        reference_price: Option<f64>,
    },
    /// Inspect or discard the pending verification callback
    PendingCallback {
        #[command(subcommand)]
        action: PendingAction,
        /// Session file to use instead of the configured one
        #[arg(long, global = true)]
        file: Option<PathBuf>,
    },
    /// Show or write the effective configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum PendingAction {
    /// Print the record if present and not expired
    Show,
    /// Delete the record
    Clear,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Print the effective configuration as TOML
    Show,
    /// Write the effective configuration to workflows.toml
    Init {
        #[arg(long, help = "Overwrite an existing workflows.toml")]
        force: bool,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = init_config()?.clone();
    if cli.verbose {
        config.observability.log_level = "debug".to_string();
    }
    init_telemetry(cli.json_logs || config.observability.json_logs, &config.observability.log_level)?;

    let result = match cli.command {
        Commands::DeliveryCheck {
            purchased_at,
            now,
            holding_hours,
        } => delivery_check_command(&config, purchased_at, now, holding_hours),
        Commands::ParseCallback { url } => parse_callback_command(&url),
        Commands::ConsignPrice {
            buy_price,
            rate,
            reference_price,
        } => consign_price_command(buy_price, rate, reference_price),
        Commands::PendingCallback { action, file } => pending_callback_command(config, action, file),
        Commands::Config { action } => config_command(&config, action),
    };

    shutdown_telemetry();
    result
}

fn delivery_check_command(
    config: &WorkflowConfig,
    purchased_at: DateTime<Utc>,
    now: Option<DateTime<Utc>>,
    holding_hours: Option<u32>,
) -> Result<()> {
    let holding_hours = holding_hours.unwrap_or(config.disposition.holding_hours);
    let now = now.unwrap_or_else(|| SystemClock.now());
    let eligibility = delivery_eligibility(purchased_at.timestamp_millis(), now.timestamp_millis(), holding_hours);

    println!("📦 Held for {:.2} hours (window: {} hours)", eligibility.hours_elapsed, holding_hours);
    if eligibility.passed {
        println!("✅ Delivery allowed");
    } else {
        println!("⏳ Delivery locked, about {} hours left", eligibility.hours_left);
    }
    Ok(())
}

fn parse_callback_command(url: &str) -> Result<()> {
    let browser = HeadlessBrowser::new(url).with_context(|| format!("Invalid URL: {url}"))?;

    let Some(callback) = RedirectCallback::from_navigator(&browser) else {
        println!("📭 No verification callback parameters in this URL");
        return Ok(());
    };

    let failure = callback
        .code
        .as_deref()
        .map(str::trim)
        .filter(|code| !code.is_empty() && *code != "0")
        .map(provider_error_message);

    let summary = serde_json::json!({
        "authToken": callback.auth_token,
        "code": callback.code,
        "success": callback.success,
        "failure": failure,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    Ok(())
}

fn consign_price_command(buy_price: f64, rate: f64, reference_price: Option<f64>) -> Result<()> {
    let item = AssetItem {
        id: "cli".to_string(),
        purchased_at: 0,
        buy_price,
        appreciation_rate: rate,
        reference_price,
        flags: ItemFlags::default(),
    };
    match resolve_consign_price(&item) {
        Ok(price) => println!("💰 Consignment price: {price:.2}"),
        Err(e) => println!("❌ {e}"),
    }
    Ok(())
}

fn pending_callback_command(mut config: WorkflowConfig, action: PendingAction, file: Option<PathBuf>) -> Result<()> {
    if file.is_some() {
        config.storage.file_path = file;
    }
    if config.storage.file_path.is_none() {
        println!("⚠️  No session file configured; set storage.file_path or pass --file");
        return Ok(());
    }
    let store = config.storage.callback_store();

    match action {
        PendingAction::Show => match store.read() {
            Some(record) => println!("{}", serde_json::to_string_pretty(&record)?),
            None => println!("📭 No pending callback"),
        },
        PendingAction::Clear => {
            store.clear();
            println!("🧹 Pending callback cleared");
        }
    }
    Ok(())
}

fn config_command(config: &WorkflowConfig, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show => println!("{}", toml::to_string_pretty(config)?),
        ConfigAction::Init { force } => {
            let path = PathBuf::from("workflows.toml");
            if path.exists() && !force {
                println!("⚠️  workflows.toml already exists (use --force to overwrite)");
                return Ok(());
            }
            config.save_to_file(&path)?;
            println!("✅ Wrote {}", path.display());
        }
    }
    Ok(())
}
