pub mod api;
pub mod auth;
pub mod bus;
pub mod config;
pub mod engine;
pub mod error;
pub mod geo;
pub mod hub;
pub mod models;
pub mod observability;
pub mod state;
pub mod store;
