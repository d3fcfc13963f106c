pub mod errors;

pub use errors::{ProxyCacheError, Result};
