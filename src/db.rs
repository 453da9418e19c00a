pub mod broker;
pub mod db_config;
pub mod db_variable;
pub mod moos_db;
pub mod msg_filter;
