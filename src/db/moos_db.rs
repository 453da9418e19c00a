use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt::Write;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use rustc_hash::FxHashMap;
use tracing::{debug, info, trace, warn};

use crate::comms::message::{DataType, Message, MessageType};
use crate::db::db_config::DbConfig;
use crate::db::db_variable::DbVariable;
use crate::db::msg_filter::MsgFilter;
use crate::error::MoosError;
use crate::runtime_context::RuntimeContext;

pub const DB_TIME: &str = "DB_TIME";
pub const DB_UPTIME: &str = "DB_UPTIME";
pub const DB_CLIENTS: &str = "DB_CLIENTS";
pub const DB_VARSUMMARY: &str = "DB_VARSUMMARY";
pub const DB_RWSUMMARY: &str = "DB_RWSUMMARY";
pub const DB_EVENT: &str = "DB_EVENT";
pub const DB_QOS: &str = "DB_QOS";

pub const REQUEST_ALL: &str = "ALL";
pub const REQUEST_PROC_SUMMARY: &str = "PROC_SUMMARY";
pub const REQUEST_VAR_SUMMARY: &str = "VAR_SUMMARY";
pub const REQUEST_DB_CLEAR: &str = "DB_CLEAR";

/// The broker's tables: variables, registrations, wildcard filters and per-client held mail.
///
/// This is plain synchronous state. The [crate::db::broker::Broker] serializes access to it and
///  connects it to the comm server.
pub struct MoosDb {
    config: Arc<DbConfig>,
    runtime: Arc<RuntimeContext>,
    vars: BTreeMap<String, DbVariable>,
    client_filters: FxHashMap<String, Vec<MsgFilter>>,
    held_mail: FxHashMap<String, VecDeque<Message>>,
    clients: BTreeSet<String>,
    latencies: BTreeMap<String, LatencyStats>,
    start_time: f64,
    last_summary_time: f64,
}

impl MoosDb {
    pub fn new(config: Arc<DbConfig>, runtime: Arc<RuntimeContext>) -> MoosDb {
        let now = runtime.local_time();
        let mut result = MoosDb {
            config,
            runtime,
            vars: Default::default(),
            client_filters: Default::default(),
            held_mail: Default::default(),
            clients: Default::default(),
            latencies: Default::default(),
            start_time: now,
            last_summary_time: now,
        };

        for (name, value) in [(DB_TIME, now), (DB_UPTIME, 0.0)] {
            let mut var = DbVariable::new(name, DataType::Double, now);
            var.double_value = value;
            var.who_changed = result.config.name.clone();
            var.community = result.config.community.clone();
            var.written_time = now;
            result.vars.insert(name.to_string(), var);
        }
        result
    }

    pub fn variable(&self, name: &str) -> Option<&DbVariable> {
        self.vars.get(name)
    }

    pub fn variables(&self) -> impl Iterator<Item = &DbVariable> {
        self.vars.values()
    }

    pub fn connected_clients(&self) -> impl Iterator<Item = &String> {
        self.clients.iter()
    }

    pub fn num_held_messages(&self, client: &str) -> usize {
        self.held_mail.get(client)
            .map(|q| q.len())
            .unwrap_or(0)
    }

    pub fn start_time(&self) -> f64 {
        self.start_time
    }

    /// Processes one packet's messages and returns the reply for the sending client: replies
    ///  to server requests followed by the client's held mail. A packet without any messages
    ///  (not even a Null) does not collect mail.
    pub fn process_packet(&mut self, client: &str, messages: Vec<Message>) -> Vec<Message> {
        self.record_latency(client, &messages);

        let mut reply = Vec::new();
        for msg in &messages {
            if let Err(e) = self.process_message(client, msg, &mut reply) {
                warn!(client, key = %msg.key, "rejected {:?} message: {}", msg.msg_type, e);
            }
        }

        self.maybe_publish_housekeeping();

        if !messages.is_empty() {
            reply.extend(self.fetch_all_mail(client));
        }
        reply
    }

    pub fn process_message(&mut self, client: &str, msg: &Message, reply: &mut Vec<Message>) -> anyhow::Result<()> {
        trace!(client, "processing {}", msg);
        match msg.msg_type {
            MessageType::Notify => self.on_notify(msg),
            MessageType::Register | MessageType::WildcardRegister => self.on_register(client, msg),
            MessageType::Unregister | MessageType::WildcardUnregister => self.on_unregister(client, msg),
            MessageType::ServerRequest => self.on_server_request(msg, reply),
            _ => Ok(()),
        }
    }

    pub fn on_notify(&mut self, msg: &Message) -> anyhow::Result<()> {
        let now = self.runtime.local_time();
        let var = self.vars.entry(msg.key.clone())
            .or_insert_with(|| DbVariable::new(&msg.key, msg.data_type, now));

        if var.written_to == 0 {
            var.data_type = msg.data_type;

            // wildcard filters get their chance when a variable is written for the first time
            for (client, filters) in &self.client_filters {
                for filter in filters.iter().filter(|f| f.matches(&msg.source, &msg.key)) {
                    log_subscription(self.config.quiet, client, &msg.key, &filter.to_string());
                    var.add_subscriber(client, filter.period);
                }
            }
        }

        if var.data_type != msg.data_type {
            return Err(MoosError::TypeConflict {
                key: msg.key.clone(),
                established: var.data_type,
                offered: msg.data_type,
            }.into());
        }

        var.record_write(msg, now, &self.config.community);

        let mut mail = msg.clone();
        if mail.community.is_empty() {
            mail.community = self.config.community.clone();
        }

        for (client, info) in var.subscribers.iter_mut() {
            let held_mail = self.held_mail.entry(client.clone()).or_default();
            if info.is_due(now) {
                held_mail.push_back(mail.clone());
                info.last_sent = now;
            }
            else if let Some(pending) = held_mail.iter_mut().rev().find(|m| m.is_type(MessageType::Notify) && m.key == mail.key) {
                // not delivered yet, so the subscriber gets the latest value instead
                *pending = mail.clone();
            }
        }
        Ok(())
    }

    pub fn on_register(&mut self, client: &str, msg: &Message) -> anyhow::Result<()> {
        let now = self.runtime.local_time();
        match msg.msg_type {
            MessageType::Register => {
                self.subscribe(client, &msg.key, msg.double_value, now);
                log_subscription(self.config.quiet, client, &msg.key, "explicit registration");
            }
            MessageType::WildcardRegister => {
                let filter = MsgFilter::parse(&msg.string_value())?;

                let filters = self.client_filters.entry(client.to_string()).or_default();
                filters.retain(|f| !f.has_same_patterns(&filter));
                filters.push(filter.clone());

                let matching = self.vars.values()
                    .filter(|v| filter.matches(&v.who_changed, &v.name))
                    .map(|v| v.name.clone())
                    .collect::<Vec<_>>();
                for key in matching {
                    log_subscription(self.config.quiet, client, &key, &filter.to_string());
                    self.subscribe(client, &key, filter.period, now);
                }
            }
            other => bail!("not a registration: {:?}", other),
        }
        Ok(())
    }

    /// Adds or updates a subscription. If the variable already holds a value, the client gets
    ///  it right away instead of waiting for the next write.
    fn subscribe(&mut self, client: &str, key: &str, period: f64, now: f64) {
        let var = self.vars.entry(key.to_string())
            .or_insert_with(|| DbVariable::new(key, DataType::NotSet, now));
        var.add_subscriber(client, period);

        if var.written_to != 0 {
            self.held_mail.entry(client.to_string()).or_default()
                .push_back(var.to_message(MessageType::Notify));
            if let Some(info) = var.subscribers.get_mut(client) {
                info.last_sent = now;
            }
        }
    }

    pub fn on_unregister(&mut self, client: &str, msg: &Message) -> anyhow::Result<()> {
        match msg.msg_type {
            MessageType::Unregister => {
                if let Some(var) = self.vars.get_mut(&msg.key) {
                    if var.remove_subscriber(client) {
                        debug!(client, key = %msg.key, "unregistered");
                    }
                }
            }
            MessageType::WildcardUnregister => {
                let filter = MsgFilter::parse(&msg.string_value())?;
                if let Some(filters) = self.client_filters.get_mut(client) {
                    filters.retain(|f| !f.has_same_patterns(&filter));
                }

                for var in self.vars.values_mut() {
                    if filter.matches(&var.who_changed, &var.name) && var.remove_subscriber(client) {
                        debug!(client, key = %var.name, filter = %filter, "unregistered");
                    }
                }
            }
            other => bail!("not an unregistration: {:?}", other),
        }
        Ok(())
    }

    /// Transit time of a packet in ms, measured from the newest timestamp it carries. Messages
    ///  without a time (<= 0) do not count.
    fn record_latency(&mut self, client: &str, messages: &[Message]) {
        let newest = messages.iter()
            .map(|m| m.time)
            .filter(|&t| t > 0.0)
            .fold(f64::NEG_INFINITY, f64::max);
        if newest.is_finite() {
            let sample_ms = ((self.runtime.local_time() - newest) * 1000.0).max(0.0);
            self.latencies.entry(client.to_string())
                .and_modify(|stats| stats.add_sample(sample_ms))
                .or_insert_with(|| LatencyStats::new(sample_ms));
        }
    }

    pub fn latency_stats(&self, client: &str) -> Option<&LatencyStats> {
        self.latencies.get(client)
    }

    /// `client=recent:max:min:avg` for every client with latency samples, comma separated
    pub fn qos_summary(&self) -> String {
        self.latencies.iter()
            .map(|(client, s)| format!("{}={:.3}:{:.3}:{:.3}:{:.3}", client, s.recent, s.max, s.min, s.avg))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Replies carry the request's id so that the client can pick them out of its mail
    pub fn on_server_request(&mut self, msg: &Message, reply: &mut Vec<Message>) -> anyhow::Result<()> {
        let now = self.runtime.local_time();

        if msg.key == REQUEST_ALL {
            for var in self.vars.values() {
                let mut item = var.to_message(MessageType::Notify);
                item.id = msg.id;
                item.time = var.written_time - self.start_time;
                if item.time < 0.0 {
                    item.time = -1.0;
                }
                item.double_value2 = var.write_frequency;
                reply.push(item);
            }
        }
        else if msg.key.contains(REQUEST_PROC_SUMMARY) {
            for client in &self.clients {
                let published = self.vars.values()
                    .filter(|v| v.writers.contains(client))
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>();
                let subscribed = self.vars.values()
                    .filter(|v| v.has_subscriber(client))
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>();

                let summary = format!("{}:SUBSCRIBED={},PUBLISHED={}", client, subscribed.join(","), published.join(","));
                reply.push(self.request_reply(msg, REQUEST_PROC_SUMMARY, &summary, now - self.start_time));
            }
        }
        else if msg.key.contains(REQUEST_VAR_SUMMARY) {
            let names = self.vars.keys()
                .map(|k| k.as_str())
                .collect::<Vec<_>>()
                .join(",");
            reply.push(self.request_reply(msg, REQUEST_VAR_SUMMARY, &names, now));
        }
        else if msg.key.contains(REQUEST_DB_CLEAR) {
            info!(num_variables = self.vars.len(), "clearing the database");
            for var in self.vars.values_mut() {
                var.reset();
            }
            for held_mail in self.held_mail.values_mut() {
                held_mail.clear();
            }
            self.start_time = now;
            reply.push(self.request_reply(msg, REQUEST_DB_CLEAR, "", now));
        }
        else {
            return Err(anyhow!("unknown server request {:?}", msg.key));
        }
        Ok(())
    }

    fn request_reply(&self, request: &Message, key: &str, value: &str, time: f64) -> Message {
        let mut result = Message::new_string(MessageType::Notify, key, value, time);
        result.id = request.id;
        result.source = self.config.name.clone();
        result
    }

    pub fn on_connect(&mut self, client: &str) {
        self.clients.insert(client.to_string());
        self.publish_string(DB_EVENT, &format!("connected={}", client));
    }

    /// Removes every trace of the client: subscriptions, wildcard filters and held mail
    pub fn on_disconnect(&mut self, client: &str) {
        for var in self.vars.values_mut() {
            var.remove_subscriber(client);
        }
        self.client_filters.remove(client);
        self.held_mail.remove(client);
        self.clients.remove(client);
        self.latencies.remove(client);

        self.publish_string(DB_EVENT, &format!("disconnected={}", client));
    }

    pub fn fetch_all_mail(&mut self, client: &str) -> Vec<Message> {
        self.held_mail.get_mut(client)
            .map(|q| q.drain(..).collect())
            .unwrap_or_default()
    }

    /// Republishes the housekeeping variables if the summary interval has passed
    pub fn maybe_publish_housekeeping(&mut self) -> bool {
        let now = self.runtime.local_time();
        if now - self.last_summary_time <= self.config.summary_interval.as_secs_f64() {
            return false;
        }
        self.last_summary_time = now;
        self.publish_housekeeping();
        true
    }

    pub fn publish_housekeeping(&mut self) {
        let now = self.runtime.local_time();
        self.publish_double(DB_TIME, now);
        self.publish_double(DB_UPTIME, now - self.start_time);

        let clients = self.clients.iter()
            .map(|c| format!("{},", c))
            .collect::<String>();
        self.publish_string(DB_CLIENTS, &clients);

        let summary = self.variable_summary();
        self.publish_string(DB_VARSUMMARY, &summary);

        let summary = self.read_write_summary();
        self.publish_string(DB_RWSUMMARY, &summary);

        let summary = self.qos_summary();
        self.publish_string(DB_QOS, &summary);
    }

    /// one line per variable: name, age, last writer, write frequency, type and value
    pub fn variable_summary(&self) -> String {
        let mut result = String::new();
        for var in self.vars.values() {
            let writer = if var.who_changed.is_empty() { "(write pending)" } else { var.who_changed.as_str() };
            let value = match var.data_type {
                DataType::Double => format!("{}", var.double_value),
                DataType::String => {
                    let s = var.string_value();
                    if s.chars().count() > 25 {
                        format!("{}...", s.chars().take(22).collect::<String>())
                    }
                    else {
                        s
                    }
                }
                DataType::Binary => format!("*binary* {} B", var.payload.len()),
                DataType::NotSet => String::new(),
            };
            let _ = writeln!(result, "{:<20} {:<12.3} {:<20} {:>4.1}Hz {} {}",
                             var.name,
                             var.written_time - self.start_time,
                             writer,
                             var.write_frequency,
                             u8::from(var.data_type) as char,
                             value);
        }
        result
    }

    /// `client=sub1:sub2&pub1:pub2` for every connected client, comma separated
    pub fn read_write_summary(&self) -> String {
        self.clients.iter()
            .map(|client| {
                let subscribed = self.vars.values()
                    .filter(|v| v.has_subscriber(client))
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>()
                    .join(":");
                let published = self.vars.values()
                    .filter(|v| v.writers.contains(client))
                    .map(|v| v.name.as_str())
                    .collect::<Vec<_>>()
                    .join(":");
                format!("{}={}&{}", client, subscribed, published)
            })
            .collect::<Vec<_>>()
            .join(",")
    }

    fn publish_double(&mut self, key: &str, value: f64) {
        let msg = Message::new_double(MessageType::Notify, key, value, self.runtime.local_time());
        self.publish(msg);
    }

    fn publish_string(&mut self, key: &str, value: &str) {
        let msg = Message::new_string(MessageType::Notify, key, value, self.runtime.local_time());
        self.publish(msg);
    }

    /// the broker's own writes take the same path as everybody else's
    fn publish(&mut self, mut msg: Message) {
        msg.source = self.config.name.clone();
        msg.community = self.config.community.clone();
        if let Err(e) = self.on_notify(&msg) {
            warn!(key = %msg.key, "could not publish housekeeping variable: {}", e);
        }
    }
}

/// Per-client transit times in milliseconds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LatencyStats {
    pub recent: f64,
    pub max: f64,
    pub min: f64,
    /// exponential moving average
    pub avg: f64,
}

impl LatencyStats {
    const AVG_WEIGHT: f64 = 0.1;

    pub fn new(sample_ms: f64) -> LatencyStats {
        LatencyStats {
            recent: sample_ms,
            max: sample_ms,
            min: sample_ms,
            avg: sample_ms,
        }
    }

    pub fn add_sample(&mut self, sample_ms: f64) {
        self.recent = sample_ms;
        self.max = self.max.max(sample_ms);
        self.min = self.min.min(sample_ms);
        self.avg += Self::AVG_WEIGHT * (sample_ms - self.avg);
    }
}

fn log_subscription(quiet: bool, client: &str, key: &str, via: &str) {
    if quiet {
        debug!(client, key, via, "subscribed");
    }
    else {
        info!(client, key, via, "subscribed");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use bytes::Bytes;
    use rstest::rstest;
    use tokio::time;

    use crate::comms::protocol::SERVER_REQUEST_ID;
    use super::*;

    fn new_db() -> MoosDb {
        MoosDb::new(Arc::new(DbConfig::default()), Arc::new(RuntimeContext::new()))
    }

    fn notify_double(source: &str, key: &str, value: f64) -> Message {
        let mut msg = Message::new_double(MessageType::Notify, key, value, 1.0);
        msg.source = source.to_string();
        msg
    }

    fn notify_string(source: &str, key: &str, value: &str) -> Message {
        let mut msg = Message::new_string(MessageType::Notify, key, value, 1.0);
        msg.source = source.to_string();
        msg
    }

    fn register(client: &str, key: &str, period: f64) -> Message {
        let mut msg = Message::new_double(MessageType::Register, key, period, 1.0);
        msg.source = client.to_string();
        msg
    }

    fn wildcard(msg_type: MessageType, client: &str, filter: MsgFilter) -> Message {
        let mut msg = Message::new_string(msg_type, client, &filter.to_string(), 1.0);
        msg.source = client.to_string();
        msg
    }

    fn server_request(key: &str) -> Message {
        let mut msg = Message::new_string(MessageType::ServerRequest, key, "", 1.0);
        msg.id = SERVER_REQUEST_ID;
        msg
    }

    fn mail_keys(mail: &[Message]) -> Vec<&str> {
        mail.iter().map(|m| m.key.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_variables_exist_from_start() {
        let db = new_db();
        assert_eq!(db.variable(DB_TIME).unwrap().data_type, DataType::Double);
        assert_eq!(db.variable(DB_UPTIME).unwrap().double_value, 0.0);
        assert_eq!(db.variable(DB_TIME).unwrap().who_changed, "MOOSDB_#1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_is_immutable() {
        let mut db = new_db();
        db.on_notify(&notify_double("A", "X", 1.5)).unwrap();

        let err = db.on_notify(&notify_string("A", "X", "oops")).unwrap_err();
        assert_eq!(err.downcast_ref::<MoosError>(), Some(&MoosError::TypeConflict {
            key: "X".to_string(),
            established: DataType::Double,
            offered: DataType::String,
        }));

        let var = db.variable("X").unwrap();
        assert_eq!(var.data_type, DataType::Double);
        assert_eq!(var.double_value, 1.5);
        assert_eq!(var.written_to, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_type_conflict_does_not_abort_packet() {
        let mut db = new_db();
        db.on_notify(&notify_double("A", "X", 1.5)).unwrap();

        db.process_packet("A", vec![notify_string("A", "X", "oops"), notify_double("A", "Y", 2.0)]);
        assert_eq!(db.variable("X").unwrap().double_value, 1.5);
        assert_eq!(db.variable("Y").unwrap().double_value, 2.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_on_existing_value_notifies_once() {
        let mut db = new_db();
        db.on_notify(&notify_double("A", "X", 3.0)).unwrap();

        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        let mail = db.fetch_all_mail("C");
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].msg_type, MessageType::Notify);
        assert_eq!(mail[0].double_value, 3.0);
        assert_eq!(mail[0].source, "A");
        assert!(db.fetch_all_mail("C").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_before_first_write() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        assert_eq!(db.variable("X").unwrap().data_type, DataType::NotSet);
        assert!(db.fetch_all_mail("C").is_empty());

        db.on_notify(&notify_string("A", "X", "hello")).unwrap();
        assert_eq!(db.variable("X").unwrap().data_type, DataType::String);
        let mail = db.fetch_all_mail("C");
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].string_value(), "hello");
        assert_eq!(mail[0].community, "#1");
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_catches_variables_created_later() {
        let mut db = new_db();
        db.on_register("C", &wildcard(MessageType::WildcardRegister, "C", MsgFilter::new("GPS_*", "*", 0.0))).unwrap();
        assert!(db.fetch_all_mail("C").is_empty());

        db.on_notify(&notify_double("P", "GPS_X", 4.0)).unwrap();
        db.on_notify(&notify_double("P", "DEPTH", 5.0)).unwrap();

        let mail = db.fetch_all_mail("C");
        assert_eq!(mail_keys(&mail), vec!["GPS_X"]);
        assert_eq!(mail[0].double_value, 4.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_applies_to_existing_variables() {
        let mut db = new_db();
        db.on_notify(&notify_double("P", "GPS_X", 1.0)).unwrap();
        db.on_notify(&notify_double("Q", "GPS_Y", 2.0)).unwrap();

        db.on_register("C", &wildcard(MessageType::WildcardRegister, "C", MsgFilter::new("GPS_*", "P", 0.0))).unwrap();

        assert_eq!(mail_keys(&db.fetch_all_mail("C")), vec!["GPS_X"]);
        assert!(db.variable("GPS_X").unwrap().has_subscriber("C"));
        assert!(!db.variable("GPS_Y").unwrap().has_subscriber("C"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wildcard_unregister_removes_filter_and_subscriptions() {
        let mut db = new_db();
        let filter = MsgFilter::new("GPS_*", "*", 0.0);
        db.on_register("C", &wildcard(MessageType::WildcardRegister, "C", filter.clone())).unwrap();
        db.on_notify(&notify_double("P", "GPS_X", 1.0)).unwrap();
        db.fetch_all_mail("C");

        db.on_unregister("C", &wildcard(MessageType::WildcardUnregister, "C", filter)).unwrap();
        db.on_notify(&notify_double("P", "GPS_X", 2.0)).unwrap();
        db.on_notify(&notify_double("P", "GPS_Z", 3.0)).unwrap();

        assert!(db.fetch_all_mail("C").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unregister() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        db.on_unregister("C", &Message::new_double(MessageType::Unregister, "X", 0.0, 1.0)).unwrap();
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();
        assert!(db.fetch_all_mail("C").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_interval_throttling_delivers_latest_value() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 1.0)).unwrap();

        for i in 1..=5 {
            db.on_notify(&notify_double("A", "X", i as f64)).unwrap();
            time::advance(Duration::from_millis(40)).await;
        }

        let mail = db.fetch_all_mail("C");
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].double_value, 5.0);

        // delivered mail is not replaced, the next one has to wait for the interval
        db.on_notify(&notify_double("A", "X", 6.0)).unwrap();
        assert!(db.fetch_all_mail("C").is_empty());

        time::advance(Duration::from_secs(1)).await;
        db.on_notify(&notify_double("A", "X", 7.0)).unwrap();
        let mail = db.fetch_all_mail("C");
        assert_eq!(mail.len(), 1);
        assert_eq!(mail[0].double_value, 7.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_delivers_every_write_in_order() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        for i in 1..=3 {
            db.on_notify(&notify_double("A", "X", i as f64)).unwrap();
        }
        let values = db.fetch_all_mail("C").iter().map(|m| m.double_value).collect::<Vec<_>>();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disconnect_cleans_up() {
        let mut db = new_db();
        db.on_connect("C");
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        db.on_register("C", &wildcard(MessageType::WildcardRegister, "C", MsgFilter::new("*", "*", 0.0))).unwrap();
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();
        assert!(db.num_held_messages("C") > 0);

        db.on_disconnect("C");
        assert_eq!(db.num_held_messages("C"), 0);

        db.on_notify(&notify_double("A", "X", 2.0)).unwrap();
        db.on_notify(&notify_double("A", "NEW_VAR", 2.0)).unwrap();
        assert_eq!(db.num_held_messages("C"), 0);
        assert!(db.variables().all(|v| !v.has_subscriber("C")));
        assert_eq!(db.connected_clients().count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_connect_events() {
        let mut db = new_db();
        db.on_connect("WATCHER");
        db.on_register("WATCHER", &register("WATCHER", DB_EVENT, 0.0)).unwrap();
        db.fetch_all_mail("WATCHER");

        db.on_connect("A");
        db.on_disconnect("A");

        let events = db.fetch_all_mail("WATCHER").iter().map(|m| m.string_value()).collect::<Vec<_>>();
        assert_eq!(events, vec!["connected=A".to_string(), "disconnected=A".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_packet_reply_contains_held_mail() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();

        assert!(db.process_packet("C", vec![]).is_empty());
        assert_eq!(db.num_held_messages("C"), 1);

        let reply = db.process_packet("C", vec![Message::null("C", -1.0)]);
        assert_eq!(mail_keys(&reply), vec!["X"]);
        assert_eq!(db.num_held_messages("C"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_request_all() {
        let mut db = new_db();
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();

        let mut reply = Vec::new();
        db.on_server_request(&server_request(REQUEST_ALL), &mut reply).unwrap();

        assert_eq!(mail_keys(&reply), vec![DB_TIME, DB_UPTIME, "X"]);
        assert!(reply.iter().all(|m| m.id == SERVER_REQUEST_ID && m.is_type(MessageType::Notify)));
        let x = &reply[2];
        assert_eq!(x.double_value, 1.0);
        assert_eq!(x.source, "A");
        assert_eq!(x.time, 0.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_request_summaries() {
        let mut db = new_db();
        db.on_connect("A");
        db.on_connect("B");
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();
        db.on_notify(&notify_double("A", "Y", 1.0)).unwrap();
        db.on_register("B", &register("B", "X", 0.0)).unwrap();

        let mut reply = Vec::new();
        db.on_server_request(&server_request(REQUEST_PROC_SUMMARY), &mut reply).unwrap();
        let summaries = reply.iter().map(|m| m.string_value()).collect::<Vec<_>>();
        assert_eq!(summaries, vec![
            "A:SUBSCRIBED=,PUBLISHED=X,Y".to_string(),
            "B:SUBSCRIBED=X,PUBLISHED=".to_string(),
        ]);

        let mut reply = Vec::new();
        db.on_server_request(&server_request(REQUEST_VAR_SUMMARY), &mut reply).unwrap();
        assert_eq!(reply.len(), 1);
        assert_eq!(reply[0].id, SERVER_REQUEST_ID);
        assert_eq!(reply[0].string_value(), "DB_EVENT,DB_TIME,DB_UPTIME,X,Y");
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_request_clear() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        db.on_notify(&notify_string("A", "X", "abc")).unwrap();
        time::advance(Duration::from_secs(10)).await;

        let mut reply = Vec::new();
        db.on_server_request(&server_request(REQUEST_DB_CLEAR), &mut reply).unwrap();
        assert_eq!(mail_keys(&reply), vec![REQUEST_DB_CLEAR]);
        assert_eq!(reply[0].id, SERVER_REQUEST_ID);
        assert_eq!(reply[0].source, "MOOSDB_#1");
        assert_eq!(db.num_held_messages("C"), 0);

        let var = db.variable("X").unwrap();
        assert_eq!(var.written_to, 0);
        assert_eq!(var.string_value(), "");
        assert_eq!(var.data_type, DataType::String);
        assert!(var.has_subscriber("C"));

        // a cleared variable does not notify new subscribers
        db.on_register("D", &register("D", "X", 0.0)).unwrap();
        assert_eq!(db.num_held_messages("D"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_server_request_clear_acknowledged_in_packet_reply() {
        let mut db = new_db();
        db.on_register("C", &register("C", "X", 0.0)).unwrap();
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();

        let reply = db.process_packet("C", vec![server_request(REQUEST_DB_CLEAR)]);
        assert_eq!(mail_keys(&reply), vec![REQUEST_DB_CLEAR]);
        assert_eq!(reply[0].id, SERVER_REQUEST_ID);
    }

    /// request keys other than ALL match as substrings
    #[rstest]
    #[case::clear("XDB_CLEARX", REQUEST_DB_CLEAR)]
    #[case::proc_summary("MY_PROC_SUMMARY", REQUEST_PROC_SUMMARY)]
    #[case::var_summary("VAR_SUMMARY_PLEASE", REQUEST_VAR_SUMMARY)]
    #[tokio::test(start_paused = true)]
    async fn test_server_request_key_matches_substring(#[case] key: &str, #[case] reply_key: &str) {
        let mut db = new_db();
        db.on_connect("A");
        db.on_notify(&notify_double("A", "X", 1.0)).unwrap();

        let mut reply = Vec::new();
        db.on_server_request(&server_request(key), &mut reply).unwrap();
        assert_eq!(mail_keys(&reply), vec![reply_key]);
        assert_eq!(reply[0].id, SERVER_REQUEST_ID);

        let cleared = db.variable("X").unwrap().written_to == 0;
        assert_eq!(cleared, reply_key == REQUEST_DB_CLEAR);
    }

    #[rstest]
    #[case::all_as_substring("XALLX")]
    #[case::all_with_suffix("ALL_VARS")]
    fn test_all_request_needs_exact_key(#[case] key: &str) {
        let mut db = MoosDb::new(Arc::new(DbConfig::default()), Arc::new(RuntimeContext::with_start_time(1000.0)));
        let mut reply = Vec::new();
        assert!(db.on_server_request(&server_request(key), &mut reply).is_err());
        assert!(reply.is_empty());
    }

    #[rstest]
    #[case::unknown("FOO")]
    #[case::lower_case("all")]
    fn test_unknown_server_request(#[case] key: &str) {
        let mut db = MoosDb::new(Arc::new(DbConfig::default()), Arc::new(RuntimeContext::with_start_time(1000.0)));
        let mut reply = Vec::new();
        assert!(db.on_server_request(&server_request(key), &mut reply).is_err());
        assert!(reply.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_housekeeping_after_summary_interval() {
        let mut db = new_db();
        db.on_connect("A");
        db.on_connect("B");
        db.on_register("A", &register("A", DB_CLIENTS, 0.0)).unwrap();
        db.on_notify(&notify_double("B", "X", 1.0)).unwrap();

        assert!(!db.maybe_publish_housekeeping());
        time::advance(Duration::from_millis(2100)).await;

        let reply = db.process_packet("A", vec![Message::null("A", -1.0)]);
        assert_eq!(mail_keys(&reply), vec![DB_CLIENTS]);
        assert_eq!(reply[0].string_value(), "A,B,");
        assert_eq!(reply[0].source, "MOOSDB_#1");

        let uptime = db.variable(DB_UPTIME).unwrap().double_value;
        assert!((uptime - 2.1).abs() < 1e-3, "{}", uptime);
        assert_eq!(db.variable(DB_RWSUMMARY).unwrap().string_value(), "A=DB_CLIENTS&,B=&X");
        assert!(db.variable(DB_VARSUMMARY).unwrap().string_value().lines().any(|l| l.starts_with("X ")));
    }

    fn timed_null(client: &str, time: f64) -> Message {
        let mut msg = Message::null(client, -1.0);
        msg.time = time;
        msg
    }

    #[tokio::test(start_paused = true)]
    async fn test_latency_statistics() {
        let mut db = MoosDb::new(Arc::new(DbConfig::default()), Arc::new(RuntimeContext::with_start_time(1000.0)));
        db.on_connect("A");

        // untimed packets do not count
        db.process_packet("A", vec![Message::null("A", -1.0)]);
        assert!(db.latency_stats("A").is_none());

        db.process_packet("A", vec![timed_null("A", 999.99)]);
        let stats = *db.latency_stats("A").unwrap();
        assert!((stats.recent - 10.0).abs() < 1e-6, "{:?}", stats);
        assert_eq!(stats.min, stats.max);
        assert_eq!(stats.avg, stats.recent);

        // the newest timestamp in the packet counts
        db.process_packet("A", vec![notify_double("A", "X", 1.0), timed_null("A", 999.9)]);
        let stats = *db.latency_stats("A").unwrap();
        assert!((stats.recent - 100.0).abs() < 1e-6, "{:?}", stats);
        assert!((stats.max - 100.0).abs() < 1e-6);
        assert!((stats.min - 10.0).abs() < 1e-6);
        assert!((stats.avg - 19.0).abs() < 1e-6, "{:?}", stats);

        // timestamps from the future are clamped
        db.process_packet("A", vec![timed_null("A", 1001.0)]);
        let stats = *db.latency_stats("A").unwrap();
        assert_eq!(stats.recent, 0.0);
        assert_eq!(stats.min, 0.0);

        db.on_disconnect("A");
        assert!(db.latency_stats("A").is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_qos_published_with_housekeeping() {
        let mut db = MoosDb::new(Arc::new(DbConfig::default()), Arc::new(RuntimeContext::with_start_time(1000.0)));
        db.on_connect("A");
        db.on_connect("B");
        db.on_register("B", &register("B", DB_QOS, 0.0)).unwrap();
        db.process_packet("A", vec![timed_null("A", 999.995)]);
        assert!(db.variable(DB_QOS).is_some_and(|v| v.written_to == 0));

        time::advance(Duration::from_millis(2100)).await;
        let reply = db.process_packet("B", vec![Message::null("B", -1.0)]);
        assert_eq!(mail_keys(&reply), vec![DB_QOS]);
        assert_eq!(reply[0].string_value(), "A=5.000:5.000:5.000:5.000");
        assert_eq!(db.qos_summary(), "A=5.000:5.000:5.000:5.000");
    }

    #[tokio::test(start_paused = true)]
    async fn test_binary_values() {
        let mut db = new_db();
        db.on_register("C", &register("C", "IMG", 0.0)).unwrap();
        let mut msg = Message::new_binary(MessageType::Notify, "IMG", Bytes::from_static(&[0, 1, 2, 255]), 1.0);
        msg.source = "CAM".to_string();
        db.on_notify(&msg).unwrap();

        let mail = db.fetch_all_mail("C");
        assert_eq!(mail[0].payload, Bytes::from_static(&[0, 1, 2, 255]));
        assert!(db.variable_summary().contains("*binary* 4 B"));
    }
}
