pub mod buf_ext;
pub mod exponential_backoff;
pub mod wildcard;
