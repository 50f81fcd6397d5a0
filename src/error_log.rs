// ─────────────────────────────────────────────────────────────────────────────
// error_log.rs — Batched, de-duplicating error sink
//
// Components report EngineErrors through a cheap cloneable handle; a single
// background task batches them toward an ErrorStore. Identical errors inside
// a 60-second window collapse into one counted record, and a per-flush cap
// keeps a misbehaving venue from flooding the store.
// ─────────────────────────────────────────────────────────────────────────────
use crate::errors::{EngineError, Severity};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::PathBuf;
use tokio::sync::{mpsc, watch};

const DEDUP_WINDOW_MS: i64 = 60_000;
const FLUSH_BATCH: usize = 20;
const FLUSH_INTERVAL_MS: u64 = 2_000;
const MAX_RECORDS_PER_FLUSH: usize = 50;

// ─── Record & Store Interface ────────────────────────────────────────────────

/// The logical record shape the persistent store receives.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub timestamp: i64,
    pub error_type: String,
    pub error_code: Option<i64>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub symbol: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_action: Option<String>,
    pub severity: Severity,
    pub session_id: String,
    pub resolved: bool,
    /// Occurrences collapsed into this record inside the de-dup window.
    pub count: u64,
    pub first_seen: i64,
    pub last_seen: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Interface the engine writes through. The UI's own store can implement
/// this out of tree; the engine ships a JSON-lines file store.
pub trait ErrorStore: Send + Sync {
    fn append(&self, batch: &[ErrorRecord]);
    fn clear(&self);
}

/// Append-only JSONL store, one record per line.
pub struct JsonlStore {
    path: PathBuf,
}

impl JsonlStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

impl ErrorStore for JsonlStore {
    fn append(&self, batch: &[ErrorRecord]) {
        if batch.is_empty() {
            return;
        }
        if let Some(parent) = self.path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        match std::fs::OpenOptions::new().create(true).append(true).open(&self.path) {
            Ok(mut file) => {
                for record in batch {
                    if let Ok(line) = serde_json::to_string(record) {
                        let _ = writeln!(file, "{}", line);
                    }
                }
            }
            Err(e) => log::error!("[ERRLOG] Cannot open {}: {}", self.path.display(), e),
        }
    }

    fn clear(&self) {
        if let Err(e) = std::fs::write(&self.path, b"") {
            log::warn!("[ERRLOG] Cannot clear {}: {}", self.path.display(), e);
        }
    }
}

// ─── Handle & Sink Task ──────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ReportedError {
    pub error: EngineError,
    pub component: &'static str,
    pub user_action: Option<String>,
    pub at_ms: i64,
    /// Overrides for engine-level conditions that are not venue errors
    /// (e.g. a position left unprotected across passes).
    pub kind_label: Option<String>,
    pub severity_override: Option<Severity>,
}

impl ReportedError {
    fn severity(&self) -> Severity {
        self.severity_override.unwrap_or_else(|| self.error.severity())
    }

    fn type_label(&self) -> String {
        self.kind_label
            .clone()
            .unwrap_or_else(|| self.error.kind.as_str().to_string())
    }
}

/// Cloneable reporting handle. Reporting never blocks the caller.
#[derive(Clone)]
pub struct ErrorLogger {
    tx: mpsc::UnboundedSender<ReportedError>,
    session_id: String,
}

impl ErrorLogger {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn report(&self, error: &EngineError, component: &'static str) {
        self.report_with_action(error, component, None);
    }

    pub fn report_with_action(
        &self,
        error: &EngineError,
        component: &'static str,
        user_action: Option<String>,
    ) {
        self.submit(ReportedError {
            error: error.clone(),
            component,
            user_action,
            at_ms: chrono::Utc::now().timestamp_millis(),
            kind_label: None,
            severity_override: None,
        });
    }

    /// Engine-level structural failure (not a venue reject): always critical,
    /// labelled with its own type in the store.
    pub fn report_structural(
        &self,
        component: &'static str,
        kind_label: &str,
        symbol: Option<String>,
        message: String,
    ) {
        let mut error = EngineError::new(crate::errors::ErrorKind::Protocol, message);
        error.symbol = symbol;
        self.submit(ReportedError {
            error,
            component,
            user_action: None,
            at_ms: chrono::Utc::now().timestamp_millis(),
            kind_label: Some(kind_label.to_string()),
            severity_override: Some(Severity::Critical),
        });
    }

    fn submit(&self, reported: ReportedError) {
        match reported.severity() {
            Severity::Critical => log::error!("🚨 {}", reported.error),
            Severity::High => log::error!("{}", reported.error),
            Severity::Medium => log::warn!("{}", reported.error),
            Severity::Low => log::debug!("{}", reported.error),
        }
        let _ = self.tx.send(reported);
    }
}

/// Key identifying "the same" error for de-duplication.
fn dedup_key(r: &ReportedError) -> (String, &'static str, Option<String>, String) {
    (
        r.type_label(),
        r.component,
        r.error.symbol.clone(),
        r.error.message.clone(),
    )
}

struct PendingRecord {
    record: ErrorRecord,
}

/// Builds the sink and its background task. The task owns the store and
/// drains until every handle is dropped or shutdown fires.
pub fn spawn_error_sink(
    store: std::sync::Arc<dyn ErrorStore>,
    session_id: String,
    mut shutdown: watch::Receiver<bool>,
) -> (ErrorLogger, tokio::task::JoinHandle<()>) {
    let (tx, mut rx) = mpsc::unbounded_channel::<ReportedError>();
    let logger = ErrorLogger { tx, session_id: session_id.clone() };

    let handle = tokio::spawn(async move {
        let mut pending: HashMap<(String, &'static str, Option<String>, String), PendingRecord> =
            HashMap::new();
        let mut order: Vec<(String, &'static str, Option<String>, String)> = Vec::new();
        let mut dropped: u64 = 0;
        let mut flush_tick =
            tokio::time::interval(std::time::Duration::from_millis(FLUSH_INTERVAL_MS));

        loop {
            tokio::select! {
                maybe = rx.recv() => {
                    match maybe {
                        Some(reported) => {
                            absorb(&mut pending, &mut order, &mut dropped, reported, &session_id);
                            if pending.len() >= FLUSH_BATCH {
                                flush(&*store, &mut pending, &mut order, &mut dropped);
                            }
                        }
                        None => {
                            flush(&*store, &mut pending, &mut order, &mut dropped);
                            return;
                        }
                    }
                }
                _ = flush_tick.tick() => {
                    flush(&*store, &mut pending, &mut order, &mut dropped);
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        // Drain whatever is already queued, then flush once.
                        while let Ok(reported) = rx.try_recv() {
                            absorb(&mut pending, &mut order, &mut dropped, reported, &session_id);
                        }
                        flush(&*store, &mut pending, &mut order, &mut dropped);
                        return;
                    }
                }
            }
        }
    });

    (logger, handle)
}

fn absorb(
    pending: &mut HashMap<(String, &'static str, Option<String>, String), PendingRecord>,
    order: &mut Vec<(String, &'static str, Option<String>, String)>,
    dropped: &mut u64,
    reported: ReportedError,
    session_id: &str,
) {
    let key = dedup_key(&reported);
    if let Some(existing) = pending.get_mut(&key) {
        if reported.at_ms - existing.record.first_seen <= DEDUP_WINDOW_MS {
            existing.record.count += 1;
            existing.record.last_seen = reported.at_ms;
            return;
        }
    }
    if pending.len() >= MAX_RECORDS_PER_FLUSH {
        *dropped += 1;
        return;
    }
    let record = ErrorRecord {
        timestamp: reported.at_ms,
        error_type: reported.type_label(),
        error_code: reported.error.code,
        message: reported.error.message.clone(),
        stack_trace: None,
        component: Some(reported.component.to_string()),
        symbol: reported.error.symbol.clone(),
        user_action: reported.user_action.clone(),
        severity: reported.severity(),
        session_id: session_id.to_string(),
        resolved: false,
        count: 1,
        first_seen: reported.at_ms,
        last_seen: reported.at_ms,
        details: None,
    };
    order.push(key.clone());
    pending.insert(key, PendingRecord { record });
}

fn flush(
    store: &dyn ErrorStore,
    pending: &mut HashMap<(String, &'static str, Option<String>, String), PendingRecord>,
    order: &mut Vec<(String, &'static str, Option<String>, String)>,
    dropped: &mut u64,
) {
    if pending.is_empty() && *dropped == 0 {
        return;
    }
    let mut batch: Vec<ErrorRecord> = Vec::with_capacity(order.len());
    for key in order.drain(..) {
        if let Some(p) = pending.remove(&key) {
            batch.push(p.record);
        }
    }
    if *dropped > 0 {
        log::warn!("[ERRLOG] Rate limit dropped {} error records this interval", dropped);
        *dropped = 0;
    }
    store.append(&batch);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::ErrorKind;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct MemStore {
        batches: Mutex<Vec<Vec<ErrorRecord>>>,
    }

    impl ErrorStore for MemStore {
        fn append(&self, batch: &[ErrorRecord]) {
            self.batches.lock().unwrap().push(batch.to_vec());
        }

        fn clear(&self) {
            self.batches.lock().unwrap().clear();
        }
    }

    impl MemStore {
        fn all(&self) -> Vec<ErrorRecord> {
            self.batches.lock().unwrap().iter().flatten().cloned().collect()
        }
    }

    fn reported(kind: ErrorKind, msg: &str, at_ms: i64) -> ReportedError {
        ReportedError {
            error: EngineError::new(kind, msg),
            component: "TEST",
            user_action: None,
            at_ms,
            kind_label: None,
            severity_override: None,
        }
    }

    #[test]
    fn duplicates_collapse_inside_window() {
        let mut pending = HashMap::new();
        let mut order = Vec::new();
        let mut dropped = 0;
        for i in 0..5 {
            absorb(
                &mut pending,
                &mut order,
                &mut dropped,
                reported(ErrorKind::Network, "timeout /fapi/v1/depth", 1_000 + i * 100),
                "sess",
            );
        }
        assert_eq!(pending.len(), 1);
        let record = &pending.values().next().unwrap().record;
        assert_eq!(record.count, 5);
        assert_eq!(record.first_seen, 1_000);
        assert_eq!(record.last_seen, 1_400);
    }

    #[test]
    fn distinct_messages_stay_separate() {
        let mut pending = HashMap::new();
        let mut order = Vec::new();
        let mut dropped = 0;
        absorb(&mut pending, &mut order, &mut dropped, reported(ErrorKind::Network, "a", 0), "s");
        absorb(&mut pending, &mut order, &mut dropped, reported(ErrorKind::Network, "b", 0), "s");
        absorb(&mut pending, &mut order, &mut dropped, reported(ErrorKind::Parse, "a", 0), "s");
        assert_eq!(pending.len(), 3);
    }

    #[test]
    fn rate_limit_drops_beyond_cap() {
        let mut pending = HashMap::new();
        let mut order = Vec::new();
        let mut dropped = 0;
        for i in 0..(MAX_RECORDS_PER_FLUSH + 10) {
            absorb(
                &mut pending,
                &mut order,
                &mut dropped,
                reported(ErrorKind::Network, &format!("msg {}", i), 0),
                "s",
            );
        }
        assert_eq!(pending.len(), MAX_RECORDS_PER_FLUSH);
        assert_eq!(dropped, 10);
    }

    #[tokio::test]
    async fn sink_flushes_on_shutdown() {
        let store = Arc::new(MemStore::default());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (logger, handle) =
            spawn_error_sink(store.clone(), "session-1".to_string(), shutdown_rx);

        logger.report(&EngineError::network("boom"), "TEST");
        logger.report(&EngineError::network("boom"), "TEST");
        drop(logger);
        let _ = shutdown_tx.send(true);
        handle.await.unwrap();

        let records = store.all();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].count, 2);
        assert_eq!(records[0].session_id, "session-1");
        assert_eq!(records[0].error_type, "NETWORK");
    }
}
