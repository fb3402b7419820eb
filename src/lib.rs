pub mod error;
pub mod storage;
pub mod identity;
pub mod filter;
pub mod batch;
pub mod admin;
pub mod config;
pub mod server;

pub use error::{AppError, AppResult, DeniedItem};
pub use config::ServerConfig;
