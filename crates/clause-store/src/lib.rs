pub mod atomic;
pub mod documents;
pub mod error;
pub mod notebook;

pub use documents::{DocumentStore, ExportedNotebook, NewDocument};
pub use error::StoreError;
