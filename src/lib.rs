pub mod changelog;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod fetch;
pub mod merge;
pub mod schema;
pub mod store;
pub mod util;
pub mod validate;
