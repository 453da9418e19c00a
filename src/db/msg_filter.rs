use std::fmt::{Display, Formatter};

use anyhow::anyhow;

use crate::util::wildcard::wildcard_match;

/// A standing wildcard subscription: variables whose name matches `var_pattern`, written by
///  processes whose name matches `app_pattern`.
#[derive(Debug, Clone, PartialEq)]
pub struct MsgFilter {
    pub app_pattern: String,
    pub var_pattern: String,
    pub period: f64,
}

impl MsgFilter {
    pub fn new(var_pattern: &str, app_pattern: &str, period: f64) -> MsgFilter {
        MsgFilter {
            app_pattern: app_pattern.to_string(),
            var_pattern: var_pattern.to_string(),
            period,
        }
    }

    pub fn matches(&self, source: &str, key: &str) -> bool {
        wildcard_match(&self.app_pattern, source) && wildcard_match(&self.var_pattern, key)
    }

    pub fn has_same_patterns(&self, other: &MsgFilter) -> bool {
        self.app_pattern == other.app_pattern && self.var_pattern == other.var_pattern
    }

    /// Parses the `AppPattern=..,VarPattern=..,Interval=..` payload of wildcard (un)register
    ///  messages. Keys are case insensitive, a missing app pattern means any app and a
    ///  missing interval means 0.
    pub fn parse(s: &str) -> anyhow::Result<MsgFilter> {
        let mut app_pattern = None;
        let mut var_pattern = None;
        let mut period = 0.0;

        for (key, value) in s.split(',').filter_map(|kv| kv.split_once('=')) {
            let value = value.trim();
            match key.trim().to_ascii_lowercase().as_str() {
                "apppattern" => app_pattern = Some(value.to_string()),
                "varpattern" => var_pattern = Some(value.to_string()),
                "interval" => period = value.parse::<f64>()
                    .map_err(|_| anyhow!("invalid interval in wildcard filter {:?}", s))?,
                _ => {}
            }
        }

        Ok(MsgFilter {
            app_pattern: app_pattern.unwrap_or_else(|| "*".to_string()),
            var_pattern: var_pattern.ok_or_else(|| anyhow!("wildcard filter without VarPattern: {:?}", s))?,
            period: period.max(0.0),
        })
    }
}

impl Display for MsgFilter {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "AppPattern={},VarPattern={},Interval={}", self.app_pattern, self.var_pattern, self.period)
    }
}
