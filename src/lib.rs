pub mod api;
pub mod buffer;
pub mod config;
pub mod controller;
pub mod domain;
pub mod forecast;
pub mod optimizer;
pub mod persist;
pub mod residual;
pub mod store;
pub mod telemetry;
