pub mod config;
pub mod envelope;
pub mod error;
pub mod secret;
pub mod store;
pub mod web;

pub use config::AppConfig;
pub use error::{AppError, AppResult};
