pub mod client;
pub mod comms;
pub mod db;
pub mod error;
pub mod runtime_context;
pub mod server;
pub mod util;
