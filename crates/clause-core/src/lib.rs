pub mod document;
pub mod engine;
pub mod errors;
pub mod health;
pub mod ids;
pub mod instance;
pub mod interpreter;
pub mod query;

pub use errors::{ClauseError, ErrorKind};
