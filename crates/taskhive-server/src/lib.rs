pub mod config;
pub mod connection;
pub mod routes;
pub mod server;
pub mod wire;

pub use config::ServerConfig;
pub use server::Server;
