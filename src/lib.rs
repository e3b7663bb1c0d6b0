pub mod cli;
pub mod engine;
pub mod logging;

pub const KEEL_VERSION: &str = env!("CARGO_PKG_VERSION");
