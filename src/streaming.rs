use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use eventsource_stream::Eventsource;
use futures::StreamExt;
use log::{debug, error, info, warn};
use rand::Rng;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::store::{AllData, DataItem, DataKind, DataStore};

const DEFAULT_INITIAL_RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(30);
const STREAM_PATH: &str = "/all";

/// Failures encountered while running the stream.
#[derive(Debug, Error)]
enum StreamError {
    #[error("stream connection failed: {0}")]
    Connect(reqwest::Error),
    #[error("stream request rejected with HTTP status {0}")]
    Http(u16),
    #[error("event stream broke: {0}")]
    Stream(String),
    #[error("undecodable {event} event payload: {reason}")]
    Payload { event: String, reason: String },
}

impl StreamError {
    // 401 and 403 mean the credentials will never work; everything else
    // (transport failures, 400, 408, 429, 5xx) is worth another attempt.
    fn is_unrecoverable(&self) -> bool {
        matches!(self, StreamError::Http(401) | StreamError::Http(403))
    }
}

/// Configures and builds a [StreamingDataSource].
pub struct StreamingDataSourceBuilder {
    base_url: String,
    sdk_key: String,
    initial_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

impl StreamingDataSourceBuilder {
    pub fn new(base_url: impl Into<String>, sdk_key: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            sdk_key: sdk_key.into(),
            initial_reconnect_delay: DEFAULT_INITIAL_RECONNECT_DELAY,
            max_reconnect_delay: DEFAULT_MAX_RECONNECT_DELAY,
        }
    }

    /// The delay before the first reconnection attempt; later attempts back
    /// off exponentially from here.
    pub fn initial_reconnect_delay(&mut self, delay: Duration) -> &mut Self {
        self.initial_reconnect_delay = delay;
        self
    }

    /// The ceiling on the reconnection backoff.
    pub fn max_reconnect_delay(&mut self, delay: Duration) -> &mut Self {
        self.max_reconnect_delay = delay;
        self
    }

    pub fn build(&self) -> StreamingDataSource {
        let (init_tx, init_rx) = watch::channel(false);
        StreamingDataSource {
            config: StreamConfig {
                stream_url: format!("{}{}", self.base_url.trim_end_matches('/'), STREAM_PATH),
                sdk_key: self.sdk_key.clone(),
                initial_reconnect_delay: self.initial_reconnect_delay,
                max_reconnect_delay: self.max_reconnect_delay,
            },
            initialized: Arc::new(AtomicBool::new(false)),
            init_tx: Arc::new(init_tx),
            init_rx,
            task_handle: None,
            shutdown_tx: None,
        }
    }
}

#[derive(Clone)]
struct StreamConfig {
    stream_url: String,
    sdk_key: String,
    initial_reconnect_delay: Duration,
    max_reconnect_delay: Duration,
}

/// Maintains a long-lived server-sent-event connection to the control plane
/// and applies its `put`/`patch`/`delete` messages to a data store.
///
/// All store mutations happen on one consumer task, so message ordering is
/// preserved without any global locking. The source restarts the stream on
/// recoverable failures with capped, jittered exponential backoff; invalid
/// credentials stop it permanently.
pub struct StreamingDataSource {
    config: StreamConfig,
    initialized: Arc<AtomicBool>,
    init_tx: Arc<watch::Sender<bool>>,
    init_rx: watch::Receiver<bool>,
    task_handle: Option<JoinHandle<()>>,
    shutdown_tx: Option<mpsc::Sender<()>>,
}

impl StreamingDataSource {
    /// Starts the consumer task, feeding the given store.
    pub fn start(&mut self, store: Arc<dyn DataStore>) {
        if self.task_handle.is_some() {
            warn!("streaming data source started twice; ignoring");
            return;
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
        self.shutdown_tx = Some(shutdown_tx);

        let config = self.config.clone();
        let initialized = Arc::clone(&self.initialized);
        let init_tx = Arc::clone(&self.init_tx);

        self.task_handle = Some(tokio::spawn(async move {
            run_stream_loop(config, store, initialized, init_tx, shutdown_rx).await;
        }));
    }

    /// Stops the consumer task and closes the connection. In-flight
    /// evaluations elsewhere are unaffected; data already stored continues
    /// to serve them.
    pub async fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
            let _ = handle.await;
        }
    }

    /// True once a full ruleset has been received and stored. Never reverts,
    /// even across reconnects: stale-but-present data keeps serving.
    pub fn initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Waits up to `timeout` for the first full ruleset. Returns whether the
    /// source became initialized in time.
    pub async fn wait_for_initialization(&self, timeout: Duration) -> bool {
        let mut init_rx = self.init_rx.clone();
        if *init_rx.borrow() {
            return true;
        }
        tokio::time::timeout(timeout, async move {
            while init_rx.changed().await.is_ok() {
                if *init_rx.borrow() {
                    return true;
                }
            }
            false
        })
        .await
        .unwrap_or(false)
    }
}

impl Drop for StreamingDataSource {
    fn drop(&mut self) {
        if let Some(handle) = self.task_handle.take() {
            handle.abort();
        }
    }
}

async fn run_stream_loop(
    config: StreamConfig,
    store: Arc<dyn DataStore>,
    initialized: Arc<AtomicBool>,
    init_tx: Arc<watch::Sender<bool>>,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    let mut consecutive_failures: u32 = 0;

    loop {
        if shutdown_rx.try_recv().is_ok() {
            info!("streaming data source received shutdown signal");
            break;
        }

        info!("connecting to event stream at {}", config.stream_url);

        match connect_and_consume(&config, store.as_ref(), &initialized, &init_tx).await {
            Ok(()) => {
                debug!("event stream closed by server");
                consecutive_failures = 0;
            }
            Err(e) if e.is_unrecoverable() => {
                error!("event stream rejected the SDK key ({}); giving up", e);
                break;
            }
            Err(e) => {
                error!("event stream failed: {}", e);
                consecutive_failures += 1;
            }
        }

        let delay = backoff_delay(&config, consecutive_failures);
        warn!(
            "reconnecting to event stream in {:?} (attempt {})",
            delay,
            consecutive_failures + 1
        );

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown_rx.recv() => {
                info!("streaming data source shut down during reconnect wait");
                break;
            }
        }
    }
}

// Exponential backoff from the initial delay, capped, with the final delay
// drawn uniformly from [half, full] so a fleet of clients spreads out.
fn backoff_delay(config: &StreamConfig, consecutive_failures: u32) -> Duration {
    let factor = 2u64.saturating_pow(consecutive_failures.min(16));
    let capped = Duration::from_millis(
        (config.initial_reconnect_delay.as_millis() as u64)
            .saturating_mul(factor)
            .min(config.max_reconnect_delay.as_millis() as u64),
    );
    capped.mul_f64(rand::thread_rng().gen_range(0.5..=1.0))
}

async fn connect_and_consume(
    config: &StreamConfig,
    store: &dyn DataStore,
    initialized: &AtomicBool,
    init_tx: &watch::Sender<bool>,
) -> Result<(), StreamError> {
    let client = reqwest::Client::new();
    let response = client
        .get(&config.stream_url)
        .header("Authorization", &config.sdk_key)
        .header("Accept", "text/event-stream")
        .header("Cache-Control", "no-cache")
        .send()
        .await
        .map_err(StreamError::Connect)?;

    if !response.status().is_success() {
        return Err(StreamError::Http(response.status().as_u16()));
    }

    info!("event stream established");

    let mut events = response.bytes_stream().eventsource();

    while let Some(event) = events.next().await {
        match event {
            Ok(event) => {
                process_message(store, initialized, init_tx, &event.event, &event.data)?
            }
            Err(e) => return Err(StreamError::Stream(e.to_string())),
        }
    }

    Ok(())
}

#[derive(Deserialize)]
struct PutData {
    data: AllData,
}

#[derive(Deserialize)]
struct PatchData {
    path: String,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct DeleteData {
    path: String,
    version: u64,
}

fn parse_path(path: &str) -> Option<(DataKind, &str)> {
    if let Some(key) = path.strip_prefix("/flags/") {
        Some((DataKind::Flag, key))
    } else {
        path.strip_prefix("/segments/")
            .map(|key| (DataKind::Segment, key))
    }
}

fn payload_error(event: &str, e: impl ToString) -> StreamError {
    StreamError::Payload {
        event: event.to_string(),
        reason: e.to_string(),
    }
}

// Applies one stream message to the store. An Err means the payload was
// undecodable and the stream must be dropped and re-established; anything
// recognizable but irrelevant is logged and skipped.
fn process_message(
    store: &dyn DataStore,
    initialized: &AtomicBool,
    init_tx: &watch::Sender<bool>,
    event: &str,
    data: &str,
) -> Result<(), StreamError> {
    match event {
        "put" => {
            let put: PutData =
                serde_json::from_str(data).map_err(|e| payload_error(event, e))?;
            match store.init(put.data) {
                Ok(()) => {
                    debug!("stream delivered full ruleset");
                    initialized.store(true, Ordering::SeqCst);
                    let _ = init_tx.send(true);
                }
                Err(e) => {
                    // remain uninitialized; the stream stays up and a later
                    // put may succeed
                    error!("failed to store full ruleset: {}", e);
                }
            }
        }
        "patch" => {
            let patch: PatchData =
                serde_json::from_str(data).map_err(|e| payload_error(event, e))?;
            let (kind, key) = match parse_path(&patch.path) {
                Some(parsed) => parsed,
                None => {
                    warn!("patch for unrecognized path {}; ignoring", patch.path);
                    return Ok(());
                }
            };
            let item: DataItem = match kind {
                DataKind::Flag => serde_json::from_value::<crate::Flag>(patch.data)
                    .map(DataItem::from)
                    .map_err(|e| payload_error(event, e))?,
                DataKind::Segment => serde_json::from_value::<crate::Segment>(patch.data)
                    .map(DataItem::from)
                    .map_err(|e| payload_error(event, e))?,
            };
            match store.upsert(kind, key, item) {
                Ok(applied) => {
                    if !applied {
                        debug!("patch for {} was older than stored version; ignored", key);
                    }
                }
                Err(e) => error!("failed to apply patch for {}: {}", key, e),
            }
        }
        "delete" => {
            let delete: DeleteData =
                serde_json::from_str(data).map_err(|e| payload_error(event, e))?;
            let (kind, key) = match parse_path(&delete.path) {
                Some(parsed) => parsed,
                None => {
                    warn!("delete for unrecognized path {}; ignoring", delete.path);
                    return Ok(());
                }
            };
            if let Err(e) = store.upsert(kind, key, DataItem::Tombstone(delete.version)) {
                error!("failed to apply delete for {}: {}", key, e);
            }
        }
        other => {
            warn!("unexpected event type {} on stream; ignoring", other);
        }
    }
    Ok(())
}
