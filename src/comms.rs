pub mod message;
pub mod packet;
pub mod protocol;
pub mod skew_filter;
pub mod transport;
