pub mod config;
pub mod dispatch;
pub mod error;
pub mod http;
pub mod node;
pub mod resources;
pub mod sandbox;
pub mod shutdown;
pub mod store;

pub use error::{RelayError, Result};
