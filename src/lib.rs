pub mod client;
pub mod config;
pub mod error;
pub mod middleware;
pub mod protocol;
pub mod server;
pub mod service;
pub mod storage;
pub mod transfer;

pub use client::FileClient;
pub use config::ServerConfig;
pub use server::Server;
pub use service::FileService;
