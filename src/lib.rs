pub mod config;
pub mod db;
pub mod error;
pub mod provider;
pub mod queue;
pub mod reporter;
pub mod worker;

pub use error::{Error, Result};
