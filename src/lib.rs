pub mod auth;
pub mod codec;
pub mod config;
pub mod error;
pub mod executor;
pub mod parser;
pub mod pool;
pub mod response;
pub mod server;
