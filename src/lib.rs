pub mod api;
pub mod app;
pub mod auth;
pub mod bulk;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod download;
pub mod error;
pub mod metadata;
pub mod output;
pub mod paginate;
pub mod progress;
pub mod schema;
pub mod store;
pub mod upload;
pub mod validate;
pub mod version;
