pub mod config;
pub mod db;
pub mod error;
pub mod ingest;
pub mod mqtt;
pub mod routes;
pub mod state;
pub mod store;
