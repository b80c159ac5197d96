//! Per-session message coalescer.
//!
//! Buffers rapid inbound fragments, debounces the flush so it fires a quiet
//! period after the *last* fragment, and enforces at-most-one in-flight
//! flush per session. Fragments that arrive mid-flight open a fresh batch
//! and get exactly one follow-up flush once the current one completes.

use crate::traits::BatchHandler;
use crate::types::{Attachment, BufferedBatch, FragmentMetadata, SessionKey};
use dashmap::DashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, Notify};

#[derive(Default)]
struct SessionSlot {
    batch: Option<BufferedBatch>,
    /// Bumped on every enqueue; a timer whose epoch no longer matches was
    /// superseded and aborts without error.
    epoch: u64,
    in_flight: bool,
    gate: Arc<Mutex<()>>,
}

#[derive(Clone)]
pub struct SessionCoalescer {
    inner: Arc<CoalescerInner>,
}

struct CoalescerInner {
    quiet_period: Duration,
    slots: DashMap<SessionKey, SessionSlot>,
    handler: Arc<dyn BatchHandler>,
    active: AtomicUsize,
    drained: Notify,
}

impl SessionCoalescer {
    pub fn new(quiet_period: Duration, handler: Arc<dyn BatchHandler>) -> Self {
        Self {
            inner: Arc::new(CoalescerInner {
                quiet_period,
                slots: DashMap::new(),
                handler,
                active: AtomicUsize::new(0),
                drained: Notify::new(),
            }),
        }
    }

    /// Append a fragment to the session's batch (creating it if absent) and
    /// re-arm the debounce timer. Returns immediately.
    pub fn enqueue(
        &self,
        key: SessionKey,
        text: Option<String>,
        attachments: Vec<Attachment>,
        metadata: FragmentMetadata,
    ) {
        let epoch = {
            let mut slot = self.inner.slots.entry(key.clone()).or_default();
            let batch = slot
                .batch
                .get_or_insert_with(|| BufferedBatch::new(metadata.clone()));
            if let Some(text) = text {
                if !text.is_empty() {
                    batch.fragments.push(text);
                }
            }
            batch.attachments.extend(attachments);
            batch.metadata = metadata;
            slot.epoch = slot.epoch.wrapping_add(1);
            slot.epoch
        };

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            inner.fire(key, epoch).await;
        });
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.active.load(Ordering::SeqCst)
    }

    /// Wait until no flush is executing. Returns false on timeout.
    pub async fn drain(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let notified = self.inner.drained.notified();
            if self.inner.active.load(Ordering::SeqCst) == 0 {
                return true;
            }
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let _ = tokio::time::timeout(remaining, notified).await;
        }
    }
}

impl CoalescerInner {
    async fn fire(&self, key: SessionKey, epoch: u64) {
        tokio::time::sleep(self.quiet_period).await;

        let Some((gate, batch)) = self.claim_timer(&key, epoch) else {
            return;
        };
        // The session guard serializes flush execution across both
        // scheduling regimes; claims themselves are atomic on the slot.
        let _guard = gate.lock().await;
        self.execute(&key, batch).await;

        // Fragments queued while the flush was executing: exactly one
        // follow-up flush per queued batch, still under this guard.
        while let Some(batch) = self.claim_queued(&key) {
            self.execute(&key, batch).await;
        }
    }

    fn claim_timer(
        &self,
        key: &SessionKey,
        epoch: u64,
    ) -> Option<(Arc<Mutex<()>>, BufferedBatch)> {
        let mut slot = self.slots.get_mut(key)?;
        if slot.epoch != epoch || slot.in_flight {
            // Superseded by a later fragment, or an executing flush will
            // itself re-check for the queued batch when it completes.
            return None;
        }
        let batch = slot.batch.take()?;
        slot.in_flight = true;
        Some((slot.gate.clone(), batch))
    }

    fn claim_queued(&self, key: &SessionKey) -> Option<BufferedBatch> {
        let mut slot = self.slots.get_mut(key)?;
        if slot.in_flight {
            return None;
        }
        let batch = slot.batch.take()?;
        slot.in_flight = true;
        Some(batch)
    }

    async fn execute(&self, key: &SessionKey, batch: BufferedBatch) {
        self.active.fetch_add(1, Ordering::SeqCst);
        // Cleanup must run even when the handler fails or panics, so a
        // session is never left permanently in-flight.
        let _cleanup = FlushCleanup {
            coalescer: self,
            key,
        };
        let fragments = batch.fragments.len();
        if let Err(error) = self.handler.on_flush(key, batch).await {
            tracing::error!(session = %key, %error, fragments, "flush handler failed");
        }
    }
}

struct FlushCleanup<'a> {
    coalescer: &'a CoalescerInner,
    key: &'a SessionKey,
}

impl Drop for FlushCleanup<'_> {
    fn drop(&mut self) {
        if let Some(mut slot) = self.coalescer.slots.get_mut(self.key) {
            slot.in_flight = false;
        }
        self.coalescer.active.fetch_sub(1, Ordering::SeqCst);
        self.coalescer.drained.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::sync::atomic::AtomicBool;
    use tokio::sync::mpsc;

    fn metadata(sender_label: &str) -> FragmentMetadata {
        FragmentMetadata {
            conversation_id: "conv-1".to_string(),
            sender_id: "user-1".to_string(),
            sender_label: sender_label.to_string(),
            is_group: true,
            received_at: Utc::now(),
        }
    }

    struct RecordingHandler {
        flushed_tx: mpsc::UnboundedSender<(String, String)>,
        started_tx: mpsc::UnboundedSender<()>,
        release: Arc<Notify>,
        gate_first: AtomicBool,
        concurrent: AtomicUsize,
        max_concurrent: AtomicUsize,
    }

    impl RecordingHandler {
        fn new(
            gate_first: bool,
        ) -> (
            Arc<Self>,
            mpsc::UnboundedReceiver<(String, String)>,
            mpsc::UnboundedReceiver<()>,
        ) {
            let (flushed_tx, flushed_rx) = mpsc::unbounded_channel();
            let (started_tx, started_rx) = mpsc::unbounded_channel();
            let handler = Arc::new(Self {
                flushed_tx,
                started_tx,
                release: Arc::new(Notify::new()),
                gate_first: AtomicBool::new(gate_first),
                concurrent: AtomicUsize::new(0),
                max_concurrent: AtomicUsize::new(0),
            });
            (handler, flushed_rx, started_rx)
        }
    }

    #[async_trait]
    impl BatchHandler for RecordingHandler {
        async fn on_flush(&self, _key: &SessionKey, batch: BufferedBatch) -> Result<()> {
            let now = self.concurrent.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_concurrent.fetch_max(now, Ordering::SeqCst);
            let _ = self.started_tx.send(());

            if self.gate_first.swap(false, Ordering::SeqCst) {
                self.release.notified().await;
            }

            let _ = self
                .flushed_tx
                .send((batch.joined_text(), batch.metadata.sender_label.clone()));
            self.concurrent.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_merges_fragments_in_arrival_order() {
        let (handler, mut flushed, _started) = RecordingHandler::new(false);
        let coalescer = Arc::new(SessionCoalescer::new(
            Duration::from_secs(2),
            handler.clone(),
        ));
        let key = SessionKey::scoped("conv-1", "user-1");

        for (i, text) in ["a", "b", "c"].iter().enumerate() {
            coalescer.enqueue(
                key.clone(),
                Some(text.to_string()),
                vec![],
                metadata(&format!("sender-{i}")),
            );
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        let (text, sender_label) = flushed.recv().await.expect("one flush");
        assert_eq!(text, "a\nb\nc");
        // Metadata is from the most recently enqueued fragment.
        assert_eq!(sender_label, "sender-2");

        assert!(coalescer.drain(Duration::from_secs(5)).await);
        assert!(flushed.try_recv().is_err(), "exactly one flush expected");
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_timer_is_dropped_without_effect() {
        let (handler, mut flushed, _started) = RecordingHandler::new(false);
        let coalescer = Arc::new(SessionCoalescer::new(
            Duration::from_secs(2),
            handler.clone(),
        ));
        let key = SessionKey::scoped("conv-1", "user-1");

        coalescer.enqueue(key.clone(), Some("a".to_string()), vec![], metadata("s"));
        tokio::time::sleep(Duration::from_secs(1)).await;
        coalescer.enqueue(key.clone(), Some("b".to_string()), vec![], metadata("s"));

        let (text, _) = flushed.recv().await.expect("one flush");
        assert_eq!(text, "a\nb");
        assert!(coalescer.drain(Duration::from_secs(5)).await);
        assert!(flushed.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn fragment_during_flush_triggers_exactly_one_follow_up() {
        let (handler, mut flushed, mut started) = RecordingHandler::new(true);
        let coalescer = Arc::new(SessionCoalescer::new(
            Duration::from_secs(2),
            handler.clone(),
        ));
        let key = SessionKey::scoped("conv-1", "user-1");

        for text in ["a", "b", "c"] {
            coalescer.enqueue(key.clone(), Some(text.to_string()), vec![], metadata("s"));
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        // First flush is executing (blocked in the handler); enqueue mid-flight.
        started.recv().await.expect("flush started");
        coalescer.enqueue(key.clone(), Some("d".to_string()), vec![], metadata("s"));
        handler.release.notify_one();

        let (first, _) = flushed.recv().await.expect("initial flush");
        assert_eq!(first, "a\nb\nc");
        let (second, _) = flushed.recv().await.expect("follow-up flush");
        assert_eq!(second, "d");

        assert!(coalescer.drain(Duration::from_secs(10)).await);
        assert!(flushed.try_recv().is_err(), "no duplicate follow-ups");
        assert_eq!(handler.max_concurrent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_never_flush_concurrently_under_bursts() {
        let (handler, mut flushed, _started) = RecordingHandler::new(false);
        let coalescer = Arc::new(SessionCoalescer::new(
            Duration::from_millis(100),
            handler.clone(),
        ));
        let key = SessionKey::scoped("conv-1", "user-1");

        for burst in 0..5 {
            for i in 0..3 {
                coalescer.enqueue(
                    key.clone(),
                    Some(format!("m{burst}-{i}")),
                    vec![],
                    metadata("s"),
                );
            }
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        assert!(coalescer.drain(Duration::from_secs(10)).await);
        let mut seen = Vec::new();
        while let Ok((text, _)) = flushed.try_recv() {
            seen.push(text);
        }
        let all: Vec<String> = seen.join("\n").split('\n').map(String::from).collect();
        assert_eq!(all.len(), 15, "no fragment lost or duplicated");
        assert_eq!(handler.max_concurrent.load(Ordering::SeqCst), 1);
    }

    struct FailingHandler {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl BatchHandler for FailingHandler {
        async fn on_flush(&self, _key: &SessionKey, _batch: BufferedBatch) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(anyhow::anyhow!("boom"))
        }
    }

    #[tokio::test(start_paused = true)]
    async fn handler_failure_never_leaves_session_blocked() {
        let handler = Arc::new(FailingHandler {
            calls: AtomicUsize::new(0),
        });
        let coalescer = Arc::new(SessionCoalescer::new(
            Duration::from_millis(100),
            handler.clone(),
        ));
        let key = SessionKey::scoped("conv-1", "user-1");

        coalescer.enqueue(key.clone(), Some("x".to_string()), vec![], metadata("s"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(coalescer.drain(Duration::from_secs(5)).await);

        // The session accepts and flushes new work after the failure.
        coalescer.enqueue(key.clone(), Some("y".to_string()), vec![], metadata("s"));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(coalescer.drain(Duration::from_secs(5)).await);
        assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
        assert_eq!(coalescer.in_flight_count(), 0);
    }
}
