pub mod config;
pub mod error;
pub mod id_management;
pub mod ingest;
pub mod server;
