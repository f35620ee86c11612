pub mod auth;
pub mod config;
pub mod cursor;
pub mod error;
pub mod models;
pub mod openapi;
pub mod repo;
pub mod routes;
pub mod security;
pub mod slug;
pub mod telemetry;
pub mod validation;

// Re-export commonly used items for tests / external users
pub use config::Settings;
pub use cursor::{Page, PageRequest, Sort};
pub use routes::{config, AppState};
pub use security::SecurityHeaders;
