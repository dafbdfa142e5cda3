//! Azure cost report CLI - fetch subscription usage and mail a daily cost summary.

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use azure_cost_report::config::{AppConfig, AuthMode};
use azure_cost_report::services::auth::AzureTokenProvider;
use azure_cost_report::services::billing::ConsumptionClient;
use azure_cost_report::services::mailer::SmtpNotifier;
use azure_cost_report::{Pipeline, RunSettings, RunState};

/// Fetch Azure subscription costs and email them as a plain-text report.
#[derive(Parser)]
#[command(name = "azure-cost-report")]
#[command(version)]
struct Cli {
    /// Config file (defaults to ~/.azure-cost-report/config.json)
    #[arg(long, env = "AZURE_COST_REPORT_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    /// Override the configured sign-in mode
    #[arg(long, value_enum)]
    auth_mode: Option<AuthMode>,

    /// Override the primary recipient
    #[arg(long)]
    to: Option<String>,

    /// Carbon-copy recipient, repeatable. Replaces the configured list.
    #[arg(long)]
    cc: Vec<String>,
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("azure_cost_report=debug,info")
        } else {
            EnvFilter::new("azure_cost_report=info,warn")
        }
    });

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();
}

fn load_config(cli: &Cli) -> Result<AppConfig> {
    let mut config = AppConfig::load(cli.config.as_deref())?;
    config.apply_env();

    if let Some(mode) = cli.auth_mode {
        config.auth.mode = mode;
    }
    if let Some(to) = &cli.to {
        config.mail.to.clone_from(to);
    }
    if !cli.cc.is_empty() {
        config.mail.cc.clone_from(&cli.cc);
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Cancels the run on Ctrl-C so in-flight requests stop promptly.
fn cancel_on_interrupt(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });
}

async fn run(cli: Cli) -> Result<RunState> {
    let config = load_config(&cli)?;
    tracing::debug!(
        subscription = %config.subscription_id,
        mode = ?config.auth.mode,
        "Configuration loaded"
    );

    let tokens = AzureTokenProvider::from_config(&config)?;
    let fetcher = ConsumptionClient::new(
        config.billing.management_url.clone(),
        config.billing.api_version.clone(),
        config.billing.max_pages,
        config.request_timeout(),
    )?;
    let notifier = SmtpNotifier::from_config(&config.mail, config.request_timeout())?;

    let cancel = CancellationToken::new();
    cancel_on_interrupt(cancel.clone());

    let pipeline = Pipeline::new(
        tokens,
        fetcher,
        notifier,
        RunSettings::from_config(&config),
        cancel,
    );

    let mut stdout = std::io::stdout();
    let outcome = pipeline.run(&mut stdout).await;

    if let Some(receipt) = &outcome.receipt {
        if outcome.state.is_done() {
            println!("Email sent successfully! ({receipt})");
        }
    }
    Ok(outcome.state)
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match run(cli).await {
        Ok(RunState::Done) => ExitCode::SUCCESS,
        Ok(RunState::Failed { error, .. }) => {
            eprintln!("An error occurred: {error}");
            ExitCode::FAILURE
        }
        Ok(state) => {
            eprintln!("An error occurred: run stopped in state {state}");
            ExitCode::FAILURE
        }
        Err(e) => {
            eprintln!("An error occurred: {e:#}");
            ExitCode::FAILURE
        }
    }
}
