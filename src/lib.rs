pub mod agent;
pub mod backoff;
pub mod batch;
pub mod buffer;
pub mod cli;
pub mod config;
pub mod health;
pub mod logging;
pub mod source;
pub mod upload;
