//! Common utilities and types

pub mod error;
pub mod net;

pub use error::{Error, Phase, Result};
pub use net::{Address, Destination, Network};
