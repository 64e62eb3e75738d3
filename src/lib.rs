pub mod camera;
pub mod client;
pub mod config;
