pub mod auth;
pub mod billing;
pub mod mailer;
pub mod report;
