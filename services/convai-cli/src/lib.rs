pub mod config;
pub mod ws_transport;
