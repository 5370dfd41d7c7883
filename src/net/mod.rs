pub mod api;
pub mod transport;
pub mod types;
