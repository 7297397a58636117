use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tracing::{debug, warn};

pub const DEFAULT_INTERVAL_SECS: u64 = 5;
pub const DEFAULT_BROKER_PORT: u16 = 1883;

/// Device identifier as delivered by the settings API. Kept in its incoming
/// JSON shape so it round-trips unchanged into store requests.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceId {
    Number(i64),
    Text(String),
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceId::Number(n) => write!(f, "{}", n),
            DeviceId::Text(s) => f.write_str(s),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BrokerAddress {
    pub host: String,
    pub port: u16,
}

impl fmt::Display for BrokerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mqtt://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub id: DeviceId,
    pub serial_number: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRule {
    pub topic: String,
    pub device: DeviceIdentity,
    pub broker: BrokerAddress,
    pub interval_secs: u64,
}

impl SubscriptionRule {
    pub fn dedup_key(&self) -> DedupKey {
        DedupKey::new(&self.topic, &self.device.serial_number)
    }

    pub fn interval_ms(&self) -> i64 {
        self.interval_secs.saturating_mul(1000).min(i64::MAX as u64) as i64
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DedupKey {
    pub topic: String,
    pub serial_number: String,
}

impl DedupKey {
    pub fn new(topic: &str, serial_number: &str) -> Self {
        Self {
            topic: topic.to_string(),
            serial_number: serial_number.to_string(),
        }
    }
}

/// A decoded broker payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Reading {
    pub serial_number: String,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub noise: Option<f64>,
    /// Unix milliseconds.
    pub timestamp_ms: i64,
    pub timestamp_raw: String,
    pub raw: String,
}

/// Body posted to the storage endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreRequest {
    pub topic: String,
    pub payload: String,
    pub device_id: DeviceId,
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    pub noise: Option<f64>,
    pub timestamp: String,
}

impl StoreRequest {
    pub fn new(rule: &SubscriptionRule, topic: &str, reading: &Reading) -> Self {
        Self {
            topic: topic.to_string(),
            payload: reading.raw.clone(),
            device_id: rule.device.id.clone(),
            temperature: reading.temperature,
            humidity: reading.humidity,
            noise: reading.noise,
            timestamp: reading.timestamp_raw.clone(),
        }
    }
}

// ---- settings API wire types ----

#[derive(Deserialize, Debug, Default)]
pub struct SettingsResponse {
    #[serde(default)]
    pub settings: Vec<Value>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct SettingRecord {
    pub topic: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub interval: Option<u64>,
    pub device: Option<DeviceRecord>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct DeviceRecord {
    pub id: DeviceId,
    pub serial_number: Option<String>,
    #[serde(alias = "broker_host")]
    pub broker_ip: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub broker_port: Option<u64>,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RuleError {
    #[error("setting has no device")]
    MissingDevice,
    #[error("setting has no topic")]
    MissingTopic,
    #[error("device {0} has no serial number")]
    MissingSerialNumber(DeviceId),
    #[error("device {0} has no broker host")]
    MissingBrokerHost(DeviceId),
    #[error("device {0} has an out of range broker port {1}")]
    InvalidBrokerPort(DeviceId, u64),
}

impl TryFrom<SettingRecord> for SubscriptionRule {
    type Error = RuleError;

    fn try_from(record: SettingRecord) -> Result<Self, Self::Error> {
        let device = record.device.ok_or(RuleError::MissingDevice)?;
        let topic = record
            .topic
            .filter(|t| !t.is_empty())
            .ok_or(RuleError::MissingTopic)?;
        let serial_number = device
            .serial_number
            .filter(|s| !s.is_empty())
            .ok_or_else(|| RuleError::MissingSerialNumber(device.id.clone()))?;
        let host = device
            .broker_ip
            .map(|h| h.trim().to_string())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| RuleError::MissingBrokerHost(device.id.clone()))?;
        let port = match device.broker_port {
            None => DEFAULT_BROKER_PORT,
            Some(p) => u16::try_from(p)
                .ok()
                .filter(|p| *p != 0)
                .ok_or_else(|| RuleError::InvalidBrokerPort(device.id.clone(), p))?,
        };

        Ok(Self {
            topic,
            device: DeviceIdentity {
                id: device.id,
                serial_number,
            },
            broker: BrokerAddress { host, port },
            // zero counts as unset
            interval_secs: record
                .interval
                .filter(|i| *i > 0)
                .unwrap_or(DEFAULT_INTERVAL_SECS),
        })
    }
}

/// Converts the raw settings list into rules. Bad entries are skipped so one
/// broken setting never hides the rest.
pub fn rules_from_settings(settings: Vec<Value>) -> Vec<SubscriptionRule> {
    let mut rules = Vec::with_capacity(settings.len());
    for (index, raw) in settings.into_iter().enumerate() {
        let record: SettingRecord = match serde_json::from_value(raw) {
            Ok(record) => record,
            Err(e) => {
                warn!("Skipping malformed setting #{}: {}", index, e);
                continue;
            }
        };
        match SubscriptionRule::try_from(record) {
            Ok(rule) => rules.push(rule),
            Err(RuleError::MissingDevice) => {
                debug!("Skipping setting #{} without device", index);
            }
            Err(e) => warn!("Skipping setting #{}: {}", index, e),
        }
    }
    rules
}

/// Accepts a JSON number, a numeric string, or null.
fn lenient_u64<'de, D>(deserializer: D) -> Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<Value>::deserialize(deserializer)? {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_u64()
            .map(Some)
            .ok_or_else(|| de::Error::custom(format!("expected a non-negative integer, got {}", n))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(None),
        Some(Value::String(s)) => s
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| de::Error::custom(format!("expected a non-negative integer, got '{}'", s))),
        Some(other) => Err(de::Error::custom(format!(
            "expected a non-negative integer, got {}",
            other
        ))),
    }
}
