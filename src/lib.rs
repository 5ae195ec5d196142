//! HTTP to FastCGI gateway library.

pub mod config;
pub mod fcgi;
pub mod gateway;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod process;

pub use config::schema::GatewayConfig;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
