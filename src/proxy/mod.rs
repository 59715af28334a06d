pub mod config;
pub mod handlers;
pub mod health;
pub mod mappers;
pub mod routes;
pub mod server;
pub mod state;
pub mod upstream;

pub use config::ProxyConfig;
pub use server::AxumServer;
