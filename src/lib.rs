#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod pipeline;
pub mod services;
pub mod state;
pub mod types;

pub use config::AppConfig;
pub use error::AppError;
pub use pipeline::{Pipeline, RunOutcome, RunSettings};
pub use state::{RunState, Stage};
