use crate::config::Config;
use crate::models::{BrokerAddress, DeviceId, SubscriptionRule};
use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, SubscribeReasonCode};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use tokio::sync::{mpsc, Mutex};
use tokio::task::AbortHandle;
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Receives every publish delivered on a connection, once per bound rule.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, rule: &SubscriptionRule, topic: &str, payload: &str);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Errored(String),
}

#[derive(Debug, Clone)]
pub struct ConnectionOptions {
    pub keep_alive: Duration,
    pub retry_interval: Duration,
    pub max_retry_interval: Duration,
    pub channel_capacity: usize,
    /// How long a SUBSCRIBE may wait for its SUBACK.
    pub subscribe_timeout: Duration,
}

impl ConnectionOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            keep_alive: Duration::from_secs(config.mqtt_keep_alive_secs),
            retry_interval: Duration::from_millis(config.mqtt_retry_interval_ms),
            max_retry_interval: Duration::from_secs(60),
            channel_capacity: config.mqtt_channel_capacity,
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            keep_alive: Duration::from_secs(10),
            retry_interval: Duration::from_millis(5000),
            max_retry_interval: Duration::from_secs(60),
            channel_capacity: 10,
            subscribe_timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Clone)]
struct Binding {
    rule: SubscriptionRule,
    handler: Arc<dyn MessageHandler>,
}

/// State shared between a connection and its background tasks.
struct Shared {
    device_id: DeviceId,
    broker: BrokerAddress,
    state: Mutex<ConnectionState>,
    bindings: Mutex<HashMap<String, Binding>>,
    /// Topics the broker granted in the current session.
    confirmed: StdMutex<HashSet<String>>,
    closed: AtomicBool,
}

impl Shared {
    fn new(device_id: DeviceId, broker: BrokerAddress, state: ConnectionState) -> Self {
        Self {
            device_id,
            broker,
            state: Mutex::new(state),
            bindings: Mutex::new(HashMap::new()),
            confirmed: StdMutex::new(HashSet::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Once closed, only `Disconnected` may be written.
    async fn set_state(&self, next: ConnectionState) {
        let mut state = self.state.lock().await;
        if self.closed.load(Ordering::SeqCst) && next != ConnectionState::Disconnected {
            return;
        }
        *state = next;
    }

    async fn topics(&self) -> Vec<String> {
        self.bindings.lock().await.keys().cloned().collect()
    }

    fn confirmed(&self) -> MutexGuard<'_, HashSet<String>> {
        self.confirmed
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Bound, but not granted by the broker in this session.
    async fn needs_subscribe(&self, topic: &str) -> bool {
        self.bindings.lock().await.contains_key(topic) && !self.confirmed().contains(topic)
    }
}

/// What `subscribe` did with a rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscribeResult {
    Added,
    Replaced,
}

/// One broker session for one device. Reconnects on its own.
pub struct BrokerConnection {
    client: AsyncClient,
    shared: Arc<Shared>,
    subscribe_tx: mpsc::UnboundedSender<String>,
    tasks: Vec<AbortHandle>,
}

impl BrokerConnection {
    /// Starts the connect sequence in the background and returns at once.
    pub fn open(device_id: DeviceId, broker: BrokerAddress, options: &ConnectionOptions) -> Arc<Self> {
        let client_id = format!("sensor_relay_{}_{}", device_id, Uuid::new_v4());
        let mut mqtt_options = MqttOptions::new(client_id, broker.host.clone(), broker.port);
        mqtt_options.set_keep_alive(options.keep_alive);
        mqtt_options.set_clean_session(true);

        let (client, eventloop) = AsyncClient::new(mqtt_options, options.channel_capacity);
        let (tx, rx) = mpsc::channel(options.channel_capacity);
        let (subscribe_tx, subscribe_rx) = mpsc::unbounded_channel();
        let (ack_tx, ack_rx) = mpsc::unbounded_channel();

        let shared = Arc::new(Shared::new(device_id, broker, ConnectionState::Disconnected));

        let poller = tokio::spawn(run_event_loop(
            shared.clone(),
            eventloop,
            tx,
            subscribe_tx.clone(),
            ack_tx,
            options.clone(),
        ));
        let subscriber = tokio::spawn(run_subscriber(
            shared.clone(),
            client.clone(),
            subscribe_rx,
            ack_rx,
            options.subscribe_timeout,
        ));
        let dispatcher = tokio::spawn(dispatch(shared.clone(), rx));

        Arc::new(Self {
            client,
            shared,
            subscribe_tx,
            tasks: vec![
                poller.abort_handle(),
                subscriber.abort_handle(),
                dispatcher.abort_handle(),
            ],
        })
    }

    pub fn broker(&self) -> &BrokerAddress {
        &self.shared.broker
    }

    /// Snapshot of the current state; never waits on the network.
    pub async fn state(&self) -> ConnectionState {
        self.shared.state.lock().await.clone()
    }

    pub async fn topics(&self) -> Vec<String> {
        self.shared.topics().await
    }

    /// Topics the broker has granted since the last connect.
    pub fn confirmed_topics(&self) -> Vec<String> {
        self.shared.confirmed().iter().cloned().collect()
    }

    /// Binds `handler` to `rule` and asks the broker for the rule's topic.
    /// A topic that is already bound gets its rule replaced; it is requested
    /// again unless the broker already granted it.
    pub async fn subscribe(
        &self,
        rule: SubscriptionRule,
        handler: Arc<dyn MessageHandler>,
    ) -> SubscribeResult {
        let topic = rule.topic.clone();
        let previous = {
            let mut bindings = self.shared.bindings.lock().await;
            bindings.insert(topic.clone(), Binding { rule, handler })
        };

        // Not connected yet: the ConnAck handler requests every bound topic.
        if *self.shared.state.lock().await == ConnectionState::Connected
            && !self.shared.confirmed().contains(&topic)
        {
            let _ = self.subscribe_tx.send(topic);
        }

        if previous.is_some() {
            SubscribeResult::Replaced
        } else {
            SubscribeResult::Added
        }
    }

    /// Drops the binding for `topic`. Returns false when it was not bound.
    pub async fn unsubscribe(&self, topic: &str) -> bool {
        let removed = self.shared.bindings.lock().await.remove(topic).is_some();
        if removed {
            self.shared.confirmed().remove(topic);
            if let Err(e) = self.client.try_unsubscribe(topic) {
                warn!(
                    "Failed to unsubscribe '{}' for device {}: {}",
                    topic, self.shared.device_id, e
                );
            } else {
                info!("Unsubscribed from topic '{}' for device {}", topic, self.shared.device_id);
            }
        }
        removed
    }

    /// Disconnects from the broker and stops the background tasks.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::SeqCst);
        if let Err(e) = self.client.try_disconnect() {
            debug!("Disconnect request for device {} not sent: {}", self.shared.device_id, e);
        }
        // Give the event loop a moment to flush the disconnect packet.
        sleep(Duration::from_millis(50)).await;
        for task in &self.tasks {
            task.abort();
        }
        self.shared.set_state(ConnectionState::Disconnected).await;
        info!("Closed connection to {} for device {}", self.shared.broker, self.shared.device_id);
    }
}

impl fmt::Debug for BrokerConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BrokerConnection")
            .field("device_id", &self.shared.device_id)
            .field("broker", &self.shared.broker)
            .finish()
    }
}

/// Sends queued subscribe requests one at a time, each waiting for its
/// SUBACK, so every acknowledgement belongs to the topic in flight.
async fn run_subscriber(
    shared: Arc<Shared>,
    client: AsyncClient,
    mut topics: mpsc::UnboundedReceiver<String>,
    mut acks: mpsc::UnboundedReceiver<bool>,
    ack_timeout: Duration,
) {
    while let Some(topic) = topics.recv().await {
        if !shared.needs_subscribe(&topic).await {
            continue;
        }
        // Leftovers from a request that timed out.
        while acks.try_recv().is_ok() {}

        if let Err(e) = client.subscribe(topic.clone(), QoS::AtLeastOnce).await {
            error!(
                "Error subscribing to '{}' for device {}: {}",
                topic, shared.device_id, e
            );
            break;
        }

        match timeout(ack_timeout, acks.recv()).await {
            Ok(Some(true)) => {
                info!("Subscribed to topic '{}' for device {}", topic, shared.device_id);
                shared.confirmed().insert(topic);
            }
            Ok(Some(false)) => error!(
                "Broker {} rejected subscription to '{}' for device {}",
                shared.broker, topic, shared.device_id
            ),
            Ok(None) => break,
            Err(_) => warn!(
                "No SUBACK for '{}' from {} within {:?}",
                topic, shared.broker, ack_timeout
            ),
        }
    }
}

async fn run_event_loop(
    shared: Arc<Shared>,
    mut eventloop: EventLoop,
    tx: mpsc::Sender<(String, String)>,
    subscribe_tx: mpsc::UnboundedSender<String>,
    ack_tx: mpsc::UnboundedSender<bool>,
    options: ConnectionOptions,
) {
    let mut retry_interval = options.retry_interval;
    shared.set_state(ConnectionState::Connecting).await;

    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!(
                    "Connected to MQTT broker {} for device {}",
                    shared.broker, shared.device_id
                );
                shared.set_state(ConnectionState::Connected).await;
                retry_interval = options.retry_interval;

                // Clean sessions forget subscriptions, so replay them.
                shared.confirmed().clear();
                for topic in shared.topics().await {
                    let _ = subscribe_tx.send(topic);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let granted = !ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                let _ = ack_tx.send(granted);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let payload = match String::from_utf8(publish.payload.to_vec()) {
                    Ok(payload) => payload,
                    Err(_) => {
                        warn!("Non UTF-8 payload on '{}', skipping", publish.topic);
                        continue;
                    }
                };
                if tx.send((publish.topic, payload)).await.is_err() {
                    debug!("Dispatcher for device {} is gone", shared.device_id);
                    break;
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker {} closed the session", shared.broker);
                shared.set_state(ConnectionState::Disconnected).await;
            }
            Ok(Event::Outgoing(rumqttc::Outgoing::Disconnect)) => {
                debug!("Disconnect sent for device {}", shared.device_id);
                shared.set_state(ConnectionState::Disconnected).await;
                break;
            }
            Ok(event) => {
                debug!("Unhandled event: {:?}", event);
            }
            Err(e) => {
                error!(
                    "MQTT error for device {} on {}: {}",
                    shared.device_id, shared.broker, e
                );
                shared.set_state(ConnectionState::Errored(e.to_string())).await;
                shared.confirmed().clear();

                warn!("Retrying {} in {:?}...", shared.broker, retry_interval);
                sleep(retry_interval).await;
                retry_interval = (retry_interval * 2).min(options.max_retry_interval);
                shared.set_state(ConnectionState::Connecting).await;
            }
        }
    }
}

/// Hands publishes to the bound handlers in delivery order.
async fn dispatch(shared: Arc<Shared>, mut rx: mpsc::Receiver<(String, String)>) {
    while let Some((topic, payload)) = rx.recv().await {
        let bindings: Vec<Binding> = shared.bindings.lock().await.values().cloned().collect();
        for binding in bindings {
            binding.handler.handle(&binding.rule, &topic, &payload).await;
        }
    }
}

/// Live connections keyed by device id.
pub struct ConnectionPool {
    connections: Mutex<HashMap<DeviceId, Arc<BrokerConnection>>>,
    options: ConnectionOptions,
}

impl ConnectionPool {
    pub fn new(options: ConnectionOptions) -> Self {
        Self {
            connections: Mutex::new(HashMap::new()),
            options,
        }
    }

    /// Returns the connection for `device_id`, opening one if needed. The
    /// flag is true when a new connection was opened. A known device whose
    /// broker moved gets its old connection closed first.
    pub async fn ensure_connection(
        &self,
        device_id: &DeviceId,
        broker: &BrokerAddress,
    ) -> (Arc<BrokerConnection>, bool) {
        let (connection, previous) = {
            let mut connections = self.connections.lock().await;
            if let Some(existing) = connections.get(device_id) {
                if existing.broker() == broker {
                    return (existing.clone(), false);
                }
            }

            info!("Connecting to MQTT broker {} for device {}", broker, device_id);
            let connection = BrokerConnection::open(device_id.clone(), broker.clone(), &self.options);
            let previous = connections.insert(device_id.clone(), connection.clone());
            (connection, previous)
        };

        if let Some(previous) = previous {
            info!(
                "Broker for device {} changed from {} to {}",
                device_id,
                previous.broker(),
                broker
            );
            previous.close().await;
        }
        (connection, true)
    }

    pub async fn get(&self, device_id: &DeviceId) -> Option<Arc<BrokerConnection>> {
        self.connections.lock().await.get(device_id).cloned()
    }

    pub async fn device_ids(&self) -> Vec<DeviceId> {
        self.connections.lock().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    /// Closes and forgets the connection for `device_id`.
    pub async fn remove(&self, device_id: &DeviceId) -> bool {
        let removed = self.connections.lock().await.remove(device_id);
        match removed {
            Some(connection) => {
                connection.close().await;
                true
            }
            None => false,
        }
    }

    pub async fn close_all(&self) {
        let drained: Vec<Arc<BrokerConnection>> =
            self.connections.lock().await.drain().map(|(_, c)| c).collect();
        for connection in drained {
            connection.close().await;
        }
    }
}
