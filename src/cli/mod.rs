pub mod config;
pub mod failed;
pub mod run;
