//! CLI for pubsim
//!
//! Subcommands:
//! - `serve`: provision the configured topics and keep the broker running
//! - `check`: provision into a scratch broker and print the result

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use pubsim::Broker;
use pubsim::config::{self, ProvisionReport, Settings, provision};
use pubsim::protocol::{ListSubscriptionsRequest, ListTopicsRequest};
use pubsim::utils::logging;
use serde_json::json;
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "pubsim", version, about = "In-memory Pub/Sub broker simulator")]
struct Cli {
    /// Configuration file. Defaults to `config/default.*` when present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Provision the configured topics and run until Ctrl-C
    Serve,
    /// Validate the configuration and print what it provisions
    Check,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let settings = match cli.config.as_deref() {
        Some(path) => config::load_config_from(path),
        None => config::load_config(),
    };
    let settings = match settings {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };
    logging::init(&settings.logging.level);

    let outcome = match cli.command {
        Command::Serve => run_server(&settings).await,
        Command::Check => run_check(&settings),
    };
    if let Err(e) = outcome {
        error!("pubsim failed: {}", e);
        std::process::exit(1);
    }
}

fn start(settings: &Settings) -> pubsim::Result<(Broker, ProvisionReport)> {
    let broker = Broker::from_settings(&settings.broker)?;
    let report = provision(&broker, &settings.topics);
    Ok((broker, report))
}

async fn run_server(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let (broker, report) = start(settings)?;
    info!(
        topics = report.topics_created,
        subscriptions = report.subscriptions_created,
        "broker ready"
    );

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received. Exiting gracefully.");
    broker.close();
    broker.wait().await;
    Ok(())
}

fn run_check(settings: &Settings) -> Result<(), Box<dyn std::error::Error>> {
    let (broker, report) = start(settings)?;
    let topics = broker.list_topics(ListTopicsRequest::default())?.topics;
    let subscriptions = broker
        .list_subscriptions(ListSubscriptionsRequest::default())?
        .subscriptions;
    broker.close();

    let out = json!({
        "report": report,
        "topics": topics,
        "subscriptions": subscriptions,
    });
    println!("{}", serde_json::to_string_pretty(&out)?);
    if report.failed > 0 {
        return Err(format!("{} definitions failed to provision", report.failed).into());
    }
    Ok(())
}
