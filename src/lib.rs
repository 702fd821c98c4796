// Core modules
pub mod compel;
pub mod error;

pub use error::{InfectError, Result};
