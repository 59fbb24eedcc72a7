pub mod error;

pub use error::{AuditError, Result};
