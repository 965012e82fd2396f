pub mod cache;
pub mod camera;
pub mod config;
pub mod context;
pub mod logging;
pub mod pose;
pub mod protocol;
pub mod recorder;
pub mod server;
pub mod stream;
pub mod tracker;
