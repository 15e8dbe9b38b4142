pub mod backend;
pub mod config;
pub mod dashboard;
pub mod error;
pub mod monitor;
pub mod node;
pub mod reporter;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;

pub use error::{Error, Result};
