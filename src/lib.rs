pub mod config;
pub mod models;
pub mod remote;
pub mod services;
