pub mod config;
pub mod engine;
pub mod error;
pub mod types;

pub use error::AppError;
pub use types::*;
