pub mod monitor;
pub mod stats;
pub mod types;
