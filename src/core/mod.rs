//! Core constants and the classified error taxonomy.

pub mod constants;
mod error;

pub use constants::*;
pub use error::{Classify, ErrorKind, Failure};
