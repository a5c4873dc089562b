pub mod auth;
pub mod config;
pub mod course;
pub mod db;
pub mod error;
pub mod evaluation;
pub mod generation;
pub mod ingest;
pub mod models;
pub mod participation;
pub mod providers;
pub mod retrieval;
pub mod routes;
pub mod state;
pub mod storage;
pub mod store;
#[cfg(any(test, feature = "test-helpers"))]
pub mod testing;
