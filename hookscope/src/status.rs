use hookscope_process::Upid;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Status of a subsystem event or probe operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum StatusCode {
    Ok,
    Internal,
    ResourceUnavailable,
}

impl std::fmt::Display for StatusCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            StatusCode::Ok => "OK",
            StatusCode::Internal => "INTERNAL",
            StatusCode::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
        };
        f.write_str(s)
    }
}

/// One row of the source-status stream: high-level subsystem events.
#[derive(Debug, Clone, Serialize)]
pub struct SourceStatusRecord {
    pub time_ns: i64,
    pub agent_upid: String,
    pub source_connector: String,
    pub status: StatusCode,
    pub error_message: String,
    pub context: String,
}

/// One row of the probe-status stream: per-probe attach/resolution
/// outcomes, with structured info for operators.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeStatusRecord {
    pub time_ns: i64,
    pub agent_upid: String,
    pub source_connector: String,
    pub tracepoint: String,
    pub status: StatusCode,
    pub error_message: String,
    pub info_json: String,
}

/// Structured payload of a probe-status row. The field set is the
/// operator contract: enough to say which handler was bound where, for
/// which pid, and how.
#[derive(Debug, Clone, Serialize)]
pub struct ProbeInfo {
    pub binary: String,
    pub symbol: String,
    pub address: u64,
    pub pid: u32,
    #[serde(rename = "type")]
    pub attach_type: &'static str,
    pub probe_fn: String,
}

/// Producer half of the status streams.
///
/// Both streams are bounded; a full channel drops the new row and
/// counts it, so the deploy path never blocks on a slow consumer.
#[derive(Clone)]
pub struct StatusReporter {
    agent_upid: String,
    source_tx: SyncSender<SourceStatusRecord>,
    probe_tx: SyncSender<ProbeStatusRecord>,
    dropped: Arc<AtomicU64>,
}

impl std::fmt::Debug for StatusReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusReporter")
            .field("agent_upid", &self.agent_upid)
            .field("dropped", &self.dropped.load(Ordering::Relaxed))
            .finish()
    }
}

/// Consumer half: drains snapshots of the appended rows.
#[derive(Debug)]
pub struct StatusStream {
    source_rx: Receiver<SourceStatusRecord>,
    probe_rx: Receiver<ProbeStatusRecord>,
    dropped: Arc<AtomicU64>,
}

impl StatusReporter {
    pub fn channel(agent_upid: Upid, capacity: usize) -> (StatusReporter, StatusStream) {
        let (source_tx, source_rx) = sync_channel(capacity);
        let (probe_tx, probe_rx) = sync_channel(capacity);
        let dropped = Arc::new(AtomicU64::new(0));
        (
            StatusReporter {
                agent_upid: agent_upid.to_string(),
                source_tx,
                probe_tx,
                dropped: Arc::clone(&dropped),
            },
            StatusStream {
                source_rx,
                probe_rx,
                dropped,
            },
        )
    }

    pub fn source_status(
        &self,
        source_connector: &str,
        status: StatusCode,
        error_message: &str,
        context: &str,
    ) {
        let record = SourceStatusRecord {
            time_ns: now_ns(),
            agent_upid: self.agent_upid.clone(),
            source_connector: source_connector.to_string(),
            status,
            error_message: error_message.to_string(),
            context: context.to_string(),
        };
        if let Err(TrySendError::Full(_)) = self.source_tx.try_send(record) {
            self.count_drop("source-status");
        }
    }

    pub fn probe_status(
        &self,
        source_connector: &str,
        tracepoint: &str,
        status: StatusCode,
        error_message: &str,
        info: &ProbeInfo,
    ) {
        let record = ProbeStatusRecord {
            time_ns: now_ns(),
            agent_upid: self.agent_upid.clone(),
            source_connector: source_connector.to_string(),
            tracepoint: tracepoint.to_string(),
            status,
            error_message: error_message.to_string(),
            info_json: serde_json::to_string(info).unwrap_or_default(),
        };
        if let Err(TrySendError::Full(_)) = self.probe_tx.try_send(record) {
            self.count_drop("probe-status");
        }
    }

    fn count_drop(&self, stream: &str) {
        let n = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
        if n.is_power_of_two() {
            warn!("{stream} stream full; {n} rows dropped so far");
        }
    }
}

impl StatusStream {
    pub fn drain_source(&self) -> Vec<SourceStatusRecord> {
        self.source_rx.try_iter().collect()
    }

    pub fn drain_probe(&self) -> Vec<ProbeStatusRecord> {
        self.probe_rx.try_iter().collect()
    }

    pub fn dropped_rows(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn now_ns() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}
