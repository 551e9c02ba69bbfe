pub mod app_packet;
pub mod connection;
pub mod error;
pub mod health;
pub mod heartbeat;
pub mod reconnect;
pub mod relay;
