use crate::error::AppError;
use anyhow::{Context, Result};
use lettre::message::Mailbox;
use serde::Deserialize;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_AUTHORITY: &str = "https://login.microsoftonline.com";
pub const DEFAULT_MANAGEMENT_URL: &str = "https://management.azure.com";
pub const DEFAULT_API_VERSION: &str = "2021-10-01";
pub const INTERACTIVE_SCOPE: &str = "https://management.azure.com/user_impersonation";
pub const CLIENT_CREDENTIALS_SCOPE: &str = "https://management.azure.com/.default";

/// Upper bound for any configured timeout, one day.
pub const MAX_TIMEOUT_SECS: u64 = 86_400;

/// A configured secret. Never shows up in `Debug` output or logs.
#[derive(Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    #[must_use]
    pub const fn new(value: String) -> Self {
        Self(value)
    }

    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[redacted]")
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "camelCase")]
pub enum AuthMode {
    /// Browser sign-in with a loopback redirect.
    #[default]
    Interactive,
    /// App-only token from a client secret, for unattended runs.
    ClientCredentials,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthConfig {
    #[serde(default)]
    pub mode: AuthMode,
    #[serde(default = "default_authority")]
    pub authority: String,
    #[serde(default)]
    pub scopes: Vec<String>,
    /// Loopback port for the redirect. 0 picks a free port.
    #[serde(default)]
    pub redirect_port: u16,
    #[serde(default = "default_login_timeout_secs")]
    pub login_timeout_secs: u64,
    #[serde(default)]
    pub client_secret: Option<Secret>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::default(),
            authority: default_authority(),
            scopes: Vec::new(),
            redirect_port: 0,
            login_timeout_secs: default_login_timeout_secs(),
            client_secret: None,
        }
    }
}

impl AuthConfig {
    /// Scopes to request, falling back to the default for the current mode.
    #[must_use]
    pub fn effective_scopes(&self) -> Vec<String> {
        if !self.scopes.is_empty() {
            return self.scopes.clone();
        }
        let scope = match self.mode {
            AuthMode::Interactive => INTERACTIVE_SCOPE,
            AuthMode::ClientCredentials => CLIENT_CREDENTIALS_SCOPE,
        };
        vec![scope.to_string()]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BillingConfig {
    #[serde(default = "default_management_url")]
    pub management_url: String,
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_max_pages")]
    pub max_pages: usize,
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            management_url: default_management_url(),
            api_version: default_api_version(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MailConfig {
    #[serde(default = "default_smtp_host")]
    pub smtp_host: String,
    #[serde(default = "default_smtp_port")]
    pub smtp_port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: Option<Secret>,
    /// Sender address. Defaults to `username` when empty.
    #[serde(default)]
    pub from_address: String,
    #[serde(default = "default_from_name")]
    pub from_name: String,
    #[serde(default)]
    pub to: String,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default = "default_subject")]
    pub subject: String,
}

impl Default for MailConfig {
    fn default() -> Self {
        Self {
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            username: String::new(),
            password: None,
            from_address: String::new(),
            from_name: default_from_name(),
            to: String::new(),
            cc: Vec::new(),
            subject: default_subject(),
        }
    }
}

impl MailConfig {
    #[must_use]
    pub fn sender(&self) -> &str {
        if self.from_address.trim().is_empty() {
            &self.username
        } else {
            &self.from_address
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub tenant_id: String,
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub subscription_id: String,
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub mail: MailConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            tenant_id: String::new(),
            client_id: String::new(),
            subscription_id: String::new(),
            request_timeout_secs: default_request_timeout_secs(),
            auth: AuthConfig::default(),
            billing: BillingConfig::default(),
            mail: MailConfig::default(),
        }
    }
}

fn default_authority() -> String {
    DEFAULT_AUTHORITY.to_string()
}

const fn default_login_timeout_secs() -> u64 {
    300
}

fn default_management_url() -> String {
    DEFAULT_MANAGEMENT_URL.to_string()
}

fn default_api_version() -> String {
    DEFAULT_API_VERSION.to_string()
}

const fn default_max_pages() -> usize {
    500
}

fn default_smtp_host() -> String {
    "smtp.gmail.com".to_string()
}

const fn default_smtp_port() -> u16 {
    587
}

fn default_from_name() -> String {
    "Azure Cost Tracker".to_string()
}

fn default_subject() -> String {
    "Azure Cost Report".to_string()
}

const fn default_request_timeout_secs() -> u64 {
    30
}

impl AppConfig {
    /// Default config location: `~/.azure-cost-report/config.json`.
    #[must_use]
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".azure-cost-report").join("config.json"))
    }

    /// Loads the config file. An explicit path must exist; the default path may be absent.
    ///
    /// # Errors
    /// Returns an error if the file cannot be read or is not valid JSON.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, required) = match path {
            Some(p) => (Some(p.to_path_buf()), true),
            None => (Self::default_path(), false),
        };

        let Some(path) = path else {
            return Ok(Self::default());
        };

        if !required && !path.exists() {
            return Ok(Self::default());
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Applies `AZURE_*`, `SMTP_*` and `REPORT_TO` overrides from the process environment.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Applies overrides from any key lookup. Empty values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("AZURE_TENANT_ID") {
            self.tenant_id = v;
        }
        if let Some(v) = get("AZURE_CLIENT_ID") {
            self.client_id = v;
        }
        if let Some(v) = get("AZURE_SUBSCRIPTION_ID") {
            self.subscription_id = v;
        }
        if let Some(v) = get("AZURE_CLIENT_SECRET") {
            self.auth.client_secret = Some(Secret::new(v));
        }
        if let Some(v) = get("SMTP_USERNAME") {
            self.mail.username = v;
        }
        if let Some(v) = get("SMTP_PASSWORD") {
            self.mail.password = Some(Secret::new(v));
        }
        if let Some(v) = get("REPORT_TO") {
            self.mail.to = v;
        }
    }

    #[must_use]
    pub const fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    #[must_use]
    pub const fn login_timeout(&self) -> Duration {
        Duration::from_secs(self.auth.login_timeout_secs)
    }

    /// Checks everything a run needs before any network call is made.
    ///
    /// # Errors
    /// Returns `AppError::Config` naming the first invalid value.
    pub fn validate(&self) -> Result<(), AppError> {
        validate_identifier("tenantId", &self.tenant_id)?;
        validate_identifier("clientId", &self.client_id)?;
        validate_identifier("subscriptionId", &self.subscription_id)?;

        let scopes = self.auth.effective_scopes();
        if scopes.iter().any(|s| s.trim().is_empty()) {
            return Err(AppError::Config("auth.scopes must not contain empty entries".into()));
        }
        if self.auth.mode == AuthMode::ClientCredentials
            && self.auth.client_secret.as_ref().map_or(true, Secret::is_empty)
        {
            return Err(AppError::Config(
                "auth.clientSecret (or AZURE_CLIENT_SECRET) is required for client credentials"
                    .into(),
            ));
        }
        validate_url("auth.authority", &self.auth.authority)?;
        validate_timeout("auth.loginTimeoutSecs", self.auth.login_timeout_secs)?;

        validate_url("billing.managementUrl", &self.billing.management_url)?;
        if self.billing.api_version.trim().is_empty() {
            return Err(AppError::Config("billing.apiVersion must not be empty".into()));
        }
        if self.billing.max_pages == 0 {
            return Err(AppError::Config("billing.maxPages must be positive".into()));
        }
        validate_timeout("requestTimeoutSecs", self.request_timeout_secs)?;

        self.validate_mail()
    }

    fn validate_mail(&self) -> Result<(), AppError> {
        let mail = &self.mail;
        if mail.smtp_host.trim().is_empty() {
            return Err(AppError::Config("mail.smtpHost must not be empty".into()));
        }
        if mail.username.trim().is_empty() {
            return Err(AppError::Config(
                "mail.username (or SMTP_USERNAME) must not be empty".into(),
            ));
        }
        if mail.password.as_ref().map_or(true, Secret::is_empty) {
            return Err(AppError::Config(
                "mail.password (or SMTP_PASSWORD) must not be empty".into(),
            ));
        }
        validate_mailbox("mail.fromAddress", mail.sender())?;
        validate_mailbox("mail.to", &mail.to)?;
        for cc in &mail.cc {
            validate_mailbox("mail.cc", cc)?;
        }
        Ok(())
    }
}

fn validate_identifier(name: &str, value: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::Config(format!("{name} must not be empty")));
    }
    if value.trim() != value {
        return Err(AppError::Config(format!(
            "{name} must not have surrounding whitespace: '{value}'"
        )));
    }
    if value.contains('/') || value.contains('?') || value.contains('#') {
        return Err(AppError::Config(format!(
            "{name} contains invalid characters: '{value}'"
        )));
    }
    Ok(())
}

fn validate_timeout(name: &str, secs: u64) -> Result<(), AppError> {
    if secs == 0 || secs > MAX_TIMEOUT_SECS {
        return Err(AppError::Config(format!(
            "{name} must be between 1 and {MAX_TIMEOUT_SECS}, got {secs}"
        )));
    }
    Ok(())
}

fn validate_url(name: &str, value: &str) -> Result<(), AppError> {
    url::Url::parse(value)
        .map(|_| ())
        .map_err(|e| AppError::Config(format!("{name} is not a valid URL: {e}")))
}

fn validate_mailbox(name: &str, value: &str) -> Result<(), AppError> {
    value
        .trim()
        .parse::<Mailbox>()
        .map(|_| ())
        .map_err(|e| AppError::Config(format!("{name} is not a valid address '{value}': {e}")))
}
