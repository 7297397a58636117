use crate::http_api::ApiError;
use crate::models::{BrokerAddress, DeviceId, SubscriptionRule};
use crate::mqtt_service::{ConnectionPool, MessageHandler, SubscribeResult};
use crate::throttle::ThrottleState;
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{error, info, warn};

/// Where subscription rules come from.
#[async_trait]
pub trait SettingsSource: Send + Sync {
    async fn fetch_rules(&self) -> Result<Vec<SubscriptionRule>, ApiError>;
}

#[derive(Debug, Clone, Copy)]
pub struct ReconcilerOptions {
    /// Close connections and drop topics that left the configuration.
    pub prune_stale: bool,
    /// Throttle entries idle for this long are evicted after each refresh.
    pub dedup_retention: Option<Duration>,
}

impl Default for ReconcilerOptions {
    fn default() -> Self {
        Self {
            prune_stale: true,
            dedup_retention: Some(Duration::from_secs(86_400)),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RefreshSummary {
    pub rules: usize,
    pub connections_created: usize,
    pub connections_removed: usize,
    pub subscriptions_added: usize,
    pub subscriptions_removed: usize,
}

/// Keeps the connection pool in line with the latest settings.
pub struct Reconciler {
    source: Arc<dyn SettingsSource>,
    pool: Arc<ConnectionPool>,
    handler: Arc<dyn MessageHandler>,
    throttle: Arc<ThrottleState>,
    snapshot: RwLock<Arc<Vec<SubscriptionRule>>>,
    options: ReconcilerOptions,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SettingsSource>,
        pool: Arc<ConnectionPool>,
        handler: Arc<dyn MessageHandler>,
        throttle: Arc<ThrottleState>,
        options: ReconcilerOptions,
    ) -> Self {
        Self {
            source,
            pool,
            handler,
            throttle,
            snapshot: RwLock::new(Arc::new(Vec::new())),
            options,
        }
    }

    /// Rules from the last successful refresh.
    pub async fn snapshot(&self) -> Arc<Vec<SubscriptionRule>> {
        self.snapshot.read().await.clone()
    }

    /// Fetches settings and reconciles the pool against them. On fetch
    /// failure nothing changes and the error is handed back.
    pub async fn refresh(&self) -> Result<RefreshSummary, ApiError> {
        let rules = match self.source.fetch_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Failed to load settings, keeping previous snapshot: {}", e);
                return Err(e);
            }
        };
        info!("Settings loaded: {} records", rules.len());

        let mut summary = RefreshSummary {
            rules: rules.len(),
            ..RefreshSummary::default()
        };

        let devices = group_by_device(&rules);

        if self.options.prune_stale {
            for device_id in self.pool.device_ids().await {
                if !devices.contains_key(&device_id) && self.pool.remove(&device_id).await {
                    info!("Device {} left the configuration, connection closed", device_id);
                    summary.connections_removed += 1;
                }
            }
        }

        for (device_id, (broker, device_rules)) in &devices {
            let (connection, created) = self.pool.ensure_connection(device_id, broker).await;
            if created {
                summary.connections_created += 1;
            }

            let wanted: HashSet<&str> = device_rules.iter().map(|r| r.topic.as_str()).collect();
            if self.options.prune_stale {
                for topic in connection.topics().await {
                    if !wanted.contains(topic.as_str()) && connection.unsubscribe(&topic).await {
                        summary.subscriptions_removed += 1;
                    }
                }
            }

            for rule in device_rules {
                if connection.subscribe((*rule).clone(), self.handler.clone()).await
                    == SubscribeResult::Added
                {
                    info!(
                        "Subscribing to topic '{}' for device {}",
                        rule.topic, rule.device.serial_number
                    );
                    summary.subscriptions_added += 1;
                }
            }
        }
        drop(devices);

        {
            let mut snapshot = self.snapshot.write().await;
            *snapshot = Arc::new(rules);
        }

        if let Some(retention) = self.options.dedup_retention {
            self.throttle.evict_idle(retention);
        }

        info!(
            "Reconciled {} rules: +{} / -{} connections, +{} / -{} subscriptions",
            summary.rules,
            summary.connections_created,
            summary.connections_removed,
            summary.subscriptions_added,
            summary.subscriptions_removed
        );
        Ok(summary)
    }
}

/// Groups rules per device. A device listed with several brokers keeps the
/// first one; rules pointing elsewhere are ignored.
fn group_by_device(
    rules: &[SubscriptionRule],
) -> HashMap<DeviceId, (BrokerAddress, Vec<&SubscriptionRule>)> {
    let mut devices: HashMap<DeviceId, (BrokerAddress, Vec<&SubscriptionRule>)> = HashMap::new();
    for rule in rules {
        let (broker, device_rules) = devices
            .entry(rule.device.id.clone())
            .or_insert_with(|| (rule.broker.clone(), Vec::new()));
        if *broker != rule.broker {
            warn!(
                "Device {} is configured with brokers {} and {}, ignoring topic '{}'",
                rule.device.id, broker, rule.broker, rule.topic
            );
            continue;
        }
        device_rules.push(rule);
    }
    devices
}
