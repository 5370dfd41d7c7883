pub mod connection;
pub mod history;
pub mod mutation;
pub mod router;
