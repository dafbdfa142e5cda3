use crate::config::AppConfig;
use crate::error::AppError;
use crate::services::auth::TokenProvider;
use crate::services::billing::CostFetcher;
use crate::services::mailer::Notifier;
use crate::services::report::build_report;
use crate::state::{RunState, Stage};
use crate::types::{DeliveryReceipt, EmailMessage, Report};
use std::io::Write;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

/// Per-run settings the orchestrator needs beyond its components.
#[derive(Debug, Clone)]
pub struct RunSettings {
    pub subscription_id: String,
    pub from_address: String,
    pub from_name: String,
    pub to: String,
    pub cc: Vec<String>,
    pub subject: String,
}

impl RunSettings {
    #[must_use]
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            subscription_id: config.subscription_id.clone(),
            from_address: config.mail.sender().to_string(),
            from_name: config.mail.from_name.clone(),
            to: config.mail.to.clone(),
            cc: config.mail.cc.clone(),
            subject: config.mail.subject.clone(),
        }
    }

    fn message(&self, report: &Report) -> EmailMessage {
        EmailMessage {
            from_address: self.from_address.clone(),
            from_name: self.from_name.clone(),
            to: self.to.clone(),
            cc: self.cc.clone(),
            subject: self.subject.clone(),
            body: report.body.clone(),
        }
    }
}

/// Result of one run: where it ended plus whatever was produced on the way.
#[derive(Debug)]
pub struct RunOutcome {
    pub state: RunState,
    pub report: Option<Report>,
    pub receipt: Option<DeliveryReceipt>,
}

/// Sequences token acquisition, cost retrieval, report building and delivery.
pub struct Pipeline<T, F, N> {
    tokens: T,
    fetcher: F,
    notifier: N,
    settings: RunSettings,
    cancel: CancellationToken,
}

impl<T, F, N> Pipeline<T, F, N>
where
    T: TokenProvider,
    F: CostFetcher,
    N: Notifier,
{
    pub const fn new(
        tokens: T,
        fetcher: F,
        notifier: N,
        settings: RunSettings,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            tokens,
            fetcher,
            notifier,
            settings,
            cancel,
        }
    }

    /// Runs every stage once. The console table is written to `console`.
    ///
    /// A billing API rejection still mails the stand-in report once before the
    /// run ends in `Failed`. Every other stage error ends the run immediately.
    pub async fn run<W: Write + Send>(&self, console: &mut W) -> RunOutcome {
        let mut outcome = RunOutcome {
            state: RunState::new(),
            report: None,
            receipt: None,
        };

        outcome.state.advance();
        let credential = match self
            .tokens
            .acquire_token(&self.cancel)
            .instrument(info_span!("stage", name = %Stage::Authenticating))
            .await
        {
            Ok(credential) => credential,
            Err(e) => return self.finish_failed(outcome, e),
        };

        outcome.state.advance();
        let fetched = self
            .fetcher
            .fetch_usage(&credential, &self.settings.subscription_id, &self.cancel)
            .instrument(info_span!("stage", name = %Stage::Fetching))
            .await;
        drop(credential);

        let records = match fetched {
            Ok(records) => records,
            Err(e) if e.is_api() => {
                warn!(error = %e, "Billing API request failed, mailing stand-in report");
                let report = Report::fetch_failed();
                write_table(console, &report);
                match self.deliver(&report).await {
                    Ok(receipt) => outcome.receipt = Some(receipt),
                    Err(delivery) => {
                        error!(error = %delivery, "Stand-in report could not be delivered");
                    }
                }
                outcome.report = Some(report);
                return self.finish_failed(outcome, e);
            }
            Err(e) => return self.finish_failed(outcome, e),
        };

        outcome.state.advance();
        let report = build_report(&records);
        info!(
            lines = report.lines.len(),
            skipped = report.skipped,
            "Report built"
        );
        write_table(console, &report);

        outcome.state.advance();
        let delivered = self.deliver(&report).await;
        outcome.report = Some(report);
        match delivered {
            Ok(receipt) => {
                outcome.receipt = Some(receipt);
                outcome.state.advance();
                info!("Cost report run complete");
                outcome
            }
            Err(e) => self.finish_failed(outcome, e),
        }
    }

    async fn deliver(&self, report: &Report) -> Result<DeliveryReceipt, AppError> {
        let message = self.settings.message(report);
        self.notifier
            .send_report(&message, &self.cancel)
            .instrument(info_span!("stage", name = %Stage::Notifying))
            .await
    }

    #[allow(clippy::unused_self)]
    fn finish_failed(&self, mut outcome: RunOutcome, error: AppError) -> RunOutcome {
        if let Some(stage) = outcome.state.stage() {
            error!(%stage, error = %error, "Cost report run failed");
        }
        outcome.state.fail(error);
        outcome
    }
}

fn write_table<W: Write>(console: &mut W, report: &Report) {
    if let Err(e) = console
        .write_all(report.table.as_bytes())
        .and_then(|()| console.flush())
    {
        warn!(error = %e, "Failed to write report table to console");
    }
}
