pub mod app;
pub mod audit;
pub mod cli;
pub mod config;
pub mod credential_store;
pub mod error;
pub mod logging;
pub mod operators;
pub mod relay;
pub mod tokens;
