pub mod docker;
pub mod memory;
pub mod types;
