use crate::http_api::ApiError;
use crate::models::{Reading, StoreRequest, SubscriptionRule};
use crate::mqtt_service::MessageHandler;
use crate::throttle::ThrottleState;
use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use time::{Date, OffsetDateTime, PrimitiveDateTime};
use tracing::{debug, error, info, warn};

const FIELD_COUNT: usize = 5;

/// Destination for accepted readings.
#[async_trait]
pub trait StorageSink: Send + Sync {
    async fn store(&self, request: &StoreRequest) -> Result<(), ApiError>;
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PayloadError {
    #[error("expected 5 comma separated fields, got {0}")]
    TooFewFields(usize),
    #[error("unparseable timestamp '{0}'")]
    InvalidTimestamp(String),
}

/// What happened to a single inbound message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Accepted,
    Malformed,
    InvalidTimestamp,
    Mismatch,
    Throttled,
    StoreFailed,
}

/// Decodes `serial,temperature,humidity[%],noise,timestamp`.
pub fn parse_payload(payload: &str) -> Result<Reading, PayloadError> {
    let parts: Vec<&str> = payload.split(',').collect();
    if parts.len() < FIELD_COUNT {
        return Err(PayloadError::TooFewFields(parts.len()));
    }

    let timestamp_raw = parts[4].trim();
    let timestamp_ms = parse_timestamp(timestamp_raw)
        .ok_or_else(|| PayloadError::InvalidTimestamp(timestamp_raw.to_string()))?;

    Ok(Reading {
        serial_number: parts[0].trim().to_string(),
        temperature: parse_number(parts[1]),
        humidity: parse_number(&parts[2].replace('%', "")),
        noise: parse_number(parts[3]),
        timestamp_ms,
        timestamp_raw: timestamp_raw.to_string(),
        raw: payload.to_string(),
    })
}

/// Reads the longest numeric prefix, so units such as `40dB` still yield a
/// value. No leading number means no value.
fn parse_number(field: &str) -> Option<f64> {
    let text = field.trim_start();
    let bytes = text.as_bytes();
    let digits_from = |start: usize| {
        bytes[start..]
            .iter()
            .take_while(|b| b.is_ascii_digit())
            .count()
    };

    let mut end = 0;
    if matches!(bytes.first(), Some(b'+' | b'-')) {
        end += 1;
    }
    let integer = digits_from(end);
    end += integer;
    let mut fraction = 0;
    if bytes.get(end) == Some(&b'.') {
        fraction = digits_from(end + 1);
        if integer > 0 || fraction > 0 {
            end += 1 + fraction;
        }
    }
    if integer == 0 && fraction == 0 {
        return None;
    }
    if matches!(bytes.get(end), Some(b'e' | b'E')) {
        let mut exponent = end + 1;
        if matches!(bytes.get(exponent), Some(b'+' | b'-')) {
            exponent += 1;
        }
        let digits = digits_from(exponent);
        if digits > 0 {
            end = exponent + digits;
        }
    }

    text[..end].parse::<f64>().ok().filter(|v| v.is_finite())
}

/// Unix milliseconds for the supported timestamp forms. The epoch itself is
/// treated as invalid.
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    let instant = OffsetDateTime::parse(raw, &Rfc3339)
        .ok()
        .or_else(|| {
            PrimitiveDateTime::parse(
                raw,
                format_description!("[year]-[month]-[day]T[hour]:[minute]:[second][optional [.[subsecond]]]"),
            )
            .or_else(|_| {
                PrimitiveDateTime::parse(
                    raw,
                    format_description!("[year]-[month]-[day] [hour]:[minute]:[second][optional [.[subsecond]]]"),
                )
            })
            .ok()
            .map(PrimitiveDateTime::assume_utc)
        })
        .or_else(|| {
            Date::parse(raw, format_description!("[year]-[month]-[day]"))
                .ok()
                .map(|date| date.midnight().assume_utc())
        })?;

    let millis = i64::try_from(instant.unix_timestamp_nanos() / 1_000_000).ok()?;
    (millis != 0).then_some(millis)
}

/// Validates, throttles and forwards readings for the rules bound to it.
pub struct MessageAcceptor {
    sink: Arc<dyn StorageSink>,
    throttle: Arc<ThrottleState>,
}

impl MessageAcceptor {
    pub fn new(sink: Arc<dyn StorageSink>, throttle: Arc<ThrottleState>) -> Self {
        Self { sink, throttle }
    }

    pub async fn on_message(&self, rule: &SubscriptionRule, topic: &str, payload: &str) -> Outcome {
        debug!("{} => {}", topic, payload);

        let reading = match parse_payload(payload) {
            Ok(reading) => reading,
            Err(PayloadError::TooFewFields(count)) => {
                warn!("Invalid payload on '{}' ({} fields), skipping", topic, count);
                return Outcome::Malformed;
            }
            Err(e) => {
                debug!("Dropping message on '{}': {}", topic, e);
                return Outcome::InvalidTimestamp;
            }
        };

        // A connection fans every publish out to all of its rules.
        if reading.serial_number != rule.device.serial_number || topic != rule.topic {
            return Outcome::Mismatch;
        }

        let key = rule.dedup_key();
        if !self
            .throttle
            .should_accept(&key, reading.timestamp_ms, rule.interval_ms())
        {
            debug!(
                "Throttled reading from {} on '{}' at {}",
                reading.serial_number, topic, reading.timestamp_raw
            );
            return Outcome::Throttled;
        }

        let request = StoreRequest::new(rule, topic, &reading);
        match self.sink.store(&request).await {
            Ok(()) => {
                info!("Data posted for {} on '{}'", reading.serial_number, topic);
                self.throttle.record(key, reading.timestamp_ms);
                Outcome::Accepted
            }
            Err(e) => {
                error!(
                    "Error posting reading from {} on '{}': {}",
                    reading.serial_number, topic, e
                );
                Outcome::StoreFailed
            }
        }
    }
}

#[async_trait]
impl MessageHandler for MessageAcceptor {
    async fn handle(&self, rule: &SubscriptionRule, topic: &str, payload: &str) {
        self.on_message(rule, topic, payload).await;
    }
}
