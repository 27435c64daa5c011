pub mod clock;
pub mod config;
pub mod engine;
pub mod limits;
pub mod loyalty;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pricing;
pub mod repository;
pub mod scheduler;
pub mod store;
pub mod wal;
