//! Seams between the engine and its host process.

pub mod env;
pub mod time;

pub use env::EnvironmentPort;
pub use time::TimePort;
