pub mod active_queue;
pub mod async_comms;
pub mod client_config;
pub mod comms_status;
pub mod comm_client;
pub mod mailbox;
pub mod sync_comms;
