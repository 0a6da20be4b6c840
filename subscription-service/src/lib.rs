pub mod clock;
pub mod config;
pub mod engine;
pub mod handlers;
pub mod models;
pub mod scheduler;
pub mod services;
pub mod startup;
