pub mod canonical;
pub mod constants;
pub mod error;
pub mod types;

pub use canonical::{canonical_bytes, canonical_string};
pub use constants::*;
pub use error::{ErrorKind, XlnError};
pub use types::*;
