pub mod auth;
pub mod types;
