pub mod broker_callbacks;
pub mod comm_server;
pub mod server_config;
