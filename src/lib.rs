pub mod broadcast;
pub mod config;
pub mod controller;
pub mod logging;
pub mod models;
pub mod perf;
pub mod projects;
pub mod server;
pub mod state_machine;
