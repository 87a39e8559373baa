pub mod config;
pub mod context;
pub mod core;
pub mod layout;
pub mod logging;
pub mod web;
