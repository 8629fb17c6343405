pub mod app;
pub mod authz;
pub mod config;
pub mod db;
pub mod delegation;
pub mod docs;
pub mod errors;
pub mod events;
pub mod jwt;
pub mod models;
pub mod reconcile;
pub mod routes;
pub mod service;
pub mod store;

// Re-export commonly used items for tests
pub use app::create_app;
