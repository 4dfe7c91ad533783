pub mod allocator;
pub mod types;
