use std::fmt::{Display, Formatter};
use std::sync::Arc;

use anyhow::bail;
use async_trait::async_trait;
use rustc_hash::FxHashMap;
use tokio::sync::RwLock;
use tracing::warn;

use crate::client::active_queue::ActiveMailHandler;
use crate::comms::message::Message;
use crate::db::moos_db::{DB_QOS, DB_RWSUMMARY};

/// name of the active queue that collects the broker's comms summaries
pub const CLIENT_SUMMARIES_QUEUE: &str = "_ClientSummaries";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommsQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Display for CommsQuality {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CommsQuality::Excellent => "EXCELLENT",
            CommsQuality::Good => "GOOD",
            CommsQuality::Fair => "FAIR",
            CommsQuality::Poor => "POOR",
        };
        write!(f, "{}", s)
    }
}

/// What the broker reports about one of its clients: latencies in milliseconds from `DB_QOS`,
///  subscribed and published variables from `DB_RWSUMMARY`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientCommsStatus {
    pub name: String,
    /// negative while the broker has not reported any latency
    pub recent_latency: f64,
    pub max_latency: f64,
    pub min_latency: f64,
    pub avg_latency: f64,
    pub subscribes: Vec<String>,
    pub publishes: Vec<String>,
}

impl ClientCommsStatus {
    pub fn new(name: &str) -> ClientCommsStatus {
        ClientCommsStatus {
            name: name.to_string(),
            recent_latency: -1.0,
            max_latency: 0.0,
            min_latency: 0.0,
            avg_latency: 0.0,
            subscribes: Vec::new(),
            publishes: Vec::new(),
        }
    }

    pub fn appraise(&self) -> CommsQuality {
        if self.recent_latency < 1.0 {
            CommsQuality::Excellent
        }
        else if self.recent_latency < 10.0 {
            CommsQuality::Good
        }
        else if self.recent_latency < 100.0 {
            CommsQuality::Fair
        }
        else {
            CommsQuality::Poor
        }
    }
}

fn write_names(f: &mut Formatter<'_>, names: &[String]) -> std::fmt::Result {
    if names.is_empty() {
        return writeln!(f, "    nothing");
    }
    for name in names {
        writeln!(f, "    {}", name)?;
    }
    Ok(())
}

/// human readable report
impl Display for ClientCommsStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "Client Name:")?;
        writeln!(f, "    {}", self.name)?;
        writeln!(f)?;
        writeln!(f, "Latencies:")?;
        for (label, value) in [("recent", self.recent_latency), ("max", self.max_latency), ("min", self.min_latency), ("avg", self.avg_latency)] {
            writeln!(f, "    {:<10} {:.3} ms", label, value)?;
        }
        writeln!(f)?;
        writeln!(f, "Subscribes:")?;
        write_names(f, &self.subscribes)?;
        writeln!(f)?;
        writeln!(f, "Publishes:")?;
        write_names(f, &self.publishes)?;
        writeln!(f)?;
        writeln!(f, "Synopsis:")?;
        writeln!(f, "    comms is {}", self.appraise())
    }
}

/// Splits `client=rest,client=rest,...` into its entries, skipping empty ones
fn summary_entries(summary: &str) -> anyhow::Result<Vec<(&str, &str)>> {
    let mut result = Vec::new();
    for entry in summary.split(',').filter(|e| !e.is_empty()) {
        let (client, rest) = entry.split_once('=').unwrap_or((entry, ""));
        if client.is_empty() {
            bail!("summary entry without a client name: {:?}", entry);
        }
        result.push((client, rest));
    }
    Ok(result)
}

/// Applies a `DB_QOS` value: `client=recent:max:min:avg,...`. Unparseable numbers read as 0.
pub fn apply_qos_summary(statuses: &mut FxHashMap<String, ClientCommsStatus>, summary: &str) -> anyhow::Result<()> {
    for (client, latencies) in summary_entries(summary)? {
        let mut values = latencies.split(':')
            .map(|v| v.trim().parse::<f64>().unwrap_or(0.0));
        let status = statuses.entry(client.to_string())
            .or_insert_with(|| ClientCommsStatus::new(client));
        status.recent_latency = values.next().unwrap_or(0.0);
        status.max_latency = values.next().unwrap_or(0.0);
        status.min_latency = values.next().unwrap_or(0.0);
        status.avg_latency = values.next().unwrap_or(0.0);
    }
    Ok(())
}

/// Applies a `DB_RWSUMMARY` value: `client=sub1:sub2&pub1:pub2,...`
pub fn apply_rw_summary(statuses: &mut FxHashMap<String, ClientCommsStatus>, summary: &str) -> anyhow::Result<()> {
    fn names(s: &str) -> Vec<String> {
        s.split(':')
            .filter(|n| !n.is_empty())
            .map(|n| n.to_string())
            .collect()
    }

    for (client, rest) in summary_entries(summary)? {
        let (subscribes, publishes) = rest.split_once('&').unwrap_or((rest, ""));
        let status = statuses.entry(client.to_string())
            .or_insert_with(|| ClientCommsStatus::new(client));
        status.subscribes = names(subscribes);
        status.publishes = names(publishes);
    }
    Ok(())
}

/// Active queue handler that keeps the per-client statuses up to date
pub struct CommsStatusCollector {
    statuses: Arc<RwLock<FxHashMap<String, ClientCommsStatus>>>,
}

impl CommsStatusCollector {
    pub fn new(statuses: Arc<RwLock<FxHashMap<String, ClientCommsStatus>>>) -> CommsStatusCollector {
        CommsStatusCollector { statuses }
    }
}

#[async_trait]
impl ActiveMailHandler for CommsStatusCollector {
    async fn on_message(&self, msg: Message) {
        let summary = msg.string_value();
        let mut statuses = self.statuses.write().await;
        let result = match msg.key.as_str() {
            DB_QOS => apply_qos_summary(&mut statuses, &summary),
            DB_RWSUMMARY => apply_rw_summary(&mut statuses, &summary),
            _ => Ok(()),
        };
        if let Err(e) = result {
            warn!(key = %msg.key, "malformed comms summary: {}", e);
        }
    }
}
