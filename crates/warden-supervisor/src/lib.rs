pub mod api;
pub mod config;
pub mod hub;
pub mod logging;
pub mod supervisor;
