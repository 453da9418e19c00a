use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;

use crate::comms::message::{DataType, Message, MessageType};

/// IIR coefficient of the write frequency estimate
const FREQUENCY_ALPHA: f64 = 0.5;
/// the estimate is only updated when at least this much time has passed
const MIN_FREQUENCY_UPDATE_SECS: f64 = 0.5;
/// writes further apart than this count as a frequency of 0
const MAX_FREQUENCY_GAP_SECS: f64 = 10.0;

#[derive(Debug, Clone, PartialEq)]
pub struct RegisterInfo {
    /// minimum time between notifications, 0 for every write
    pub period: f64,
    pub last_sent: f64,
}

impl RegisterInfo {
    pub fn is_due(&self, now: f64) -> bool {
        now - self.last_sent >= self.period
    }
}

/// One named entry of the broker's variable table
#[derive(Debug, Clone)]
pub struct DbVariable {
    pub name: String,
    /// fixed by the first write, `NotSet` while the variable only exists through registrations
    pub data_type: DataType,
    pub double_value: f64,
    pub payload: Bytes,
    /// the writer's timestamp
    pub time: f64,
    /// broker time of the last write
    pub written_time: f64,
    pub who_changed: String,
    pub source_aux: String,
    pub community: String,
    pub written_to: u64,
    pub write_frequency: f64,
    pub writers: BTreeSet<String>,
    pub subscribers: BTreeMap<String, RegisterInfo>,

    stats_time: f64,
    stats_writes: u64,
}

impl DbVariable {
    pub fn new(name: &str, data_type: DataType, now: f64) -> DbVariable {
        DbVariable {
            name: name.to_string(),
            data_type,
            double_value: -1.0,
            payload: Bytes::new(),
            time: -1.0,
            written_time: -1.0,
            who_changed: String::new(),
            source_aux: String::new(),
            community: String::new(),
            written_to: 0,
            write_frequency: 0.0,
            writers: Default::default(),
            subscribers: Default::default(),
            stats_time: now,
            stats_writes: 0,
        }
    }

    /// Adds a subscriber, replacing an existing entry for the same client (and thereby its
    ///  period)
    pub fn add_subscriber(&mut self, client: &str, period: f64) {
        self.subscribers.insert(client.to_string(), RegisterInfo {
            period: period.max(0.0),
            last_sent: -1.0,
        });
    }

    pub fn remove_subscriber(&mut self, client: &str) -> bool {
        self.subscribers.remove(client).is_some()
    }

    pub fn has_subscriber(&self, client: &str) -> bool {
        self.subscribers.contains_key(client)
    }

    pub fn string_value(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }

    /// Applies a write whose data type was already checked against this variable's
    pub fn record_write(&mut self, msg: &Message, now: f64, default_community: &str) {
        self.written_time = now;
        self.time = msg.time;
        self.who_changed = msg.source.clone();
        self.source_aux = msg.source_aux.clone();
        self.community = if msg.community.is_empty() {
            default_community.to_string()
        }
        else {
            msg.community.clone()
        };

        match self.data_type {
            DataType::Double => self.double_value = msg.double_value,
            DataType::String | DataType::Binary => self.payload = msg.payload.clone(),
            DataType::NotSet => {}
        }

        self.writers.insert(msg.source.clone());
        self.written_to += 1;
        self.update_write_frequency(now);
    }

    fn update_write_frequency(&mut self, now: f64) {
        let dt = now - self.stats_time;
        if dt <= MIN_FREQUENCY_UPDATE_SECS {
            return;
        }

        if dt > MAX_FREQUENCY_GAP_SECS {
            self.write_frequency = 0.0;
        }
        else {
            let num_writes = (self.written_to - self.stats_writes) as f64;
            let instantaneous = num_writes / dt;
            self.write_frequency = FREQUENCY_ALPHA * self.write_frequency + (1.0 - FREQUENCY_ALPHA) * instantaneous;
        }
        self.stats_time = now;
        self.stats_writes = self.written_to;
    }

    /// the variable's current state as a message of the given type
    pub fn to_message(&self, msg_type: MessageType) -> Message {
        Message {
            msg_type,
            data_type: self.data_type,
            key: self.name.clone(),
            time: self.time,
            source: self.who_changed.clone(),
            source_aux: self.source_aux.clone(),
            community: self.community.clone(),
            double_value: self.double_value,
            payload: self.payload.clone(),
            ..Default::default()
        }
    }

    /// back to the unwritten state, keeping the established type and the subscribers
    pub fn reset(&mut self) {
        self.time = -1.0;
        self.double_value = -1.0;
        self.payload = Bytes::new();
        self.writers.clear();
        self.written_time = -1.0;
        self.written_to = 0;
        self.write_frequency = 0.0;
        self.stats_writes = 0;
    }
}
