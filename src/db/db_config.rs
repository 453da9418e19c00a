use std::time::Duration;

pub const DEFAULT_COMMUNITY: &str = "#1";

#[derive(Debug, Clone)]
pub struct DbConfig {
    /// used as the source of everything the broker publishes itself
    pub name: String,
    pub community: String,
    /// how often the DB_* housekeeping variables are republished
    pub summary_interval: Duration,
    /// log subscription changes at debug instead of info level
    pub quiet: bool,
}

impl DbConfig {
    pub fn new(community: &str) -> DbConfig {
        DbConfig {
            name: format!("MOOSDB_{}", community),
            community: community.to_string(),
            summary_interval: Duration::from_secs(2),
            quiet: false,
        }
    }
}

impl Default for DbConfig {
    fn default() -> Self {
        DbConfig::new(DEFAULT_COMMUNITY)
    }
}
