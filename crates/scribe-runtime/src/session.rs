//! One client's recognition stream.
//!
//! A [`Session`] is shared between its connection (which feeds chunks and
//! owns the client-facing lifecycle) and at most one decode task at a time.
//!
//! Ordering comes from a per-session strand: chunks wait in the session's
//! pending queue and a single task decodes them one after another,
//! re-submitting itself to the executor while work remains. Different
//! sessions interleave freely on the decode pool.
//!
//! ```text
//!  connection ──submit(chunk)──► pending ──(scheduled?)──► DecodeQueue
//!       ▲                                                     │
//!       └──── Outbound (unbounded mpsc) ◄── decode one chunk ◄┘
//! ```

use std::collections::VecDeque;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::time::Instant;

use metrics::{counter, histogram};
use parking_lot::Mutex;
use scribe_core::{AudioChunk, SessionId};
use scribe_engine::{DecodeContext, DecodeOutput, EngineError, EngineLease, EnginePool};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::executor::{DecodeQueue, panic_message};

/// Lifecycle position of a session. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SessionState {
    /// Accepted, handshake not finished.
    Connecting = 0,
    /// Receiving audio.
    Streaming = 1,
    /// No new audio; in-flight chunks finishing.
    Draining = 2,
    /// All work done, connection released.
    Closed = 3,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Connecting,
            1 => Self::Streaming,
            2 => Self::Draining,
            _ => Self::Closed,
        }
    }
}

/// Why a session stopped streaming.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainReason {
    /// Client signalled end of speech.
    EndOfStream,
    /// Client went away.
    Disconnected,
    /// Client sent something unintelligible.
    ProtocolError,
    /// The transport failed.
    TransportError,
    /// The server is stopping.
    ServerShutdown,
}

/// Error categories reported to the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The engine failed on this chunk.
    DecodeFailed,
    /// The chunk was not decoded because the server is stopping.
    ShuttingDown,
    /// The client message could not be understood.
    InvalidMessage,
}

/// Messages from decode tasks (and the connection) to the connection's writer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    /// One chunk decoded.
    Partial {
        /// Chunk sequence number.
        seq: u64,
        /// Text of that chunk.
        text: String,
    },
    /// A chunk (or the stream) failed.
    Error {
        /// Chunk sequence number, if the error concerns one chunk.
        seq: Option<u64>,
        /// Category.
        code: ErrorCode,
        /// Human-readable detail.
        message: String,
    },
    /// The stream's last chunk was answered; carries the whole transcript.
    Final {
        /// Accumulated transcript.
        text: String,
    },
    /// Writer should send a Close frame and stop.
    Close,
}

#[derive(Default)]
struct Strand {
    pending: VecDeque<AudioChunk>,
    scheduled: bool,
}

/// Shared state of one client stream.
pub struct Session {
    id: SessionId,
    state: AtomicU8,
    drain_reason: Mutex<Option<DrainReason>>,
    strand: Mutex<Strand>,
    context: Mutex<DecodeContext>,
    outstanding: watch::Sender<usize>,
    sink: mpsc::UnboundedSender<Outbound>,
    attached: AtomicBool,
    discarded: AtomicU64,
    queue: DecodeQueue,
    engines: EnginePool,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("outstanding", &self.outstanding())
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create a session in [`SessionState::Connecting`].
    ///
    /// `sink` is the connection writer's inbox.
    pub fn new(
        id: SessionId,
        queue: DecodeQueue,
        engines: EnginePool,
        sink: mpsc::UnboundedSender<Outbound>,
    ) -> Arc<Self> {
        let (outstanding, _) = watch::channel(0);
        Arc::new(Self {
            id,
            state: AtomicU8::new(SessionState::Connecting as u8),
            drain_reason: Mutex::new(None),
            strand: Mutex::new(Strand::default()),
            context: Mutex::new(DecodeContext::default()),
            outstanding,
            sink,
            attached: AtomicBool::new(true),
            discarded: AtomicU64::new(0),
            queue,
            engines,
            shutdown: CancellationToken::new(),
        })
    }

    /// Session identifier.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Why the session started draining, if it has.
    pub fn drain_reason(&self) -> Option<DrainReason> {
        *self.drain_reason.lock()
    }

    fn advance(&self, to: SessionState) -> bool {
        let mut current = self.state.load(Ordering::Acquire);
        loop {
            if current >= to as u8 {
                return false;
            }
            match self.state.compare_exchange_weak(
                current,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    debug!(session_id = %self.id, from = ?SessionState::from_u8(current), to = ?to, "session state");
                    return true;
                }
                Err(actual) => current = actual,
            }
        }
    }

    /// `Connecting → Streaming`.
    pub fn start_streaming(&self) -> bool {
        self.advance(SessionState::Streaming)
    }

    /// Move to `Draining`, recording `reason` if this is the first drain.
    pub fn begin_drain(&self, reason: DrainReason) -> bool {
        {
            let mut slot = self.drain_reason.lock();
            if slot.is_none() {
                *slot = Some(reason);
            }
        }
        self.advance(SessionState::Draining)
    }

    /// Final transition.
    pub fn close(&self) -> bool {
        self.advance(SessionState::Closed)
    }

    /// Token cancelled when the server asks this session to drain.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Ask the session's connection to drain.
    pub fn signal_shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Chunks submitted and not yet answered.
    pub fn outstanding(&self) -> usize {
        *self.outstanding.borrow()
    }

    /// Resolve once every submitted chunk has been answered.
    pub async fn wait_idle(&self) {
        let mut rx = self.outstanding.subscribe();
        let _ = rx.wait_for(|n| *n == 0).await;
    }

    /// Chunks decoded so far.
    pub fn chunks_decoded(&self) -> u64 {
        self.context.lock().chunks_decoded
    }

    /// Mark the client gone.
    ///
    /// Chunks still waiting in the strand are dropped unanswered; a chunk
    /// already on an engine finishes and its result is discarded.
    pub fn detach(&self) {
        self.attached.store(false, Ordering::Release);
        let dropped = std::mem::take(&mut self.strand.lock().pending);
        if !dropped.is_empty() {
            self.release_unanswered(dropped.len());
            debug!(
                session_id = %self.id,
                chunks = dropped.len(),
                "pending chunks dropped, client gone"
            );
        }
    }

    fn release_unanswered(&self, chunks: usize) {
        let _ = self.discarded.fetch_add(chunks as u64, Ordering::Relaxed);
        self.outstanding.send_modify(|n| *n = n.saturating_sub(chunks));
    }

    /// Whether results still reach the client.
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::Acquire)
    }

    /// Results and pending chunks dropped because the client was gone.
    pub fn results_discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }

    /// Queue `chunk` for decoding after every chunk submitted before it.
    ///
    /// Chunks submitted after [`detach`](Self::detach) are dropped.
    pub fn submit(self: &Arc<Self>, chunk: AudioChunk) {
        if !self.is_attached() {
            let _ = self.discarded.fetch_add(1, Ordering::Relaxed);
            return;
        }
        self.outstanding.send_modify(|n| *n += 1);
        let schedule = {
            let mut strand = self.strand.lock();
            strand.pending.push_back(chunk);
            !std::mem::replace(&mut strand.scheduled, true)
        };
        if schedule {
            self.schedule();
        }
    }

    /// Hand the strand to the executor. A rejected task answers every
    /// pending chunk with `SHUTTING_DOWN` when its ticket is dropped.
    fn schedule(self: &Arc<Self>) {
        let ticket = StrandTicket {
            session: Some(Arc::clone(self)),
        };
        if self.queue.submit(Box::new(move || ticket.run())).is_err() {
            debug!(session_id = %self.id, "decode task rejected, executor shutting down");
        }
    }

    /// Send to the writer, or count the result as discarded.
    pub fn deliver(&self, message: Outbound) {
        if self.is_attached() && self.sink.send(message).is_ok() {
            return;
        }
        let _ = self.discarded.fetch_add(1, Ordering::Relaxed);
        debug!(session_id = %self.id, "result discarded, client gone");
    }

    fn decode_next(&self) {
        let Some(chunk) = self.strand.lock().pending.pop_front() else {
            return;
        };
        let seq = chunk.seq;
        let started = Instant::now();

        let result = catch_unwind(AssertUnwindSafe(|| {
            let mut engine = self.lease_engine();
            let mut ctx = self.context.lock();
            let output = engine.decode(&mut ctx, &chunk)?;
            ctx.record(&output);
            Ok::<DecodeOutput, EngineError>(output)
        }))
        .unwrap_or_else(|panic| Err(EngineError::Panicked(panic_message(panic.as_ref()))));

        histogram!("decode_duration_seconds").record(started.elapsed().as_secs_f64());
        counter!("decode_tasks_total").increment(1);

        match result {
            Ok(output) => {
                debug!(session_id = %self.id, seq, chars = output.text.len(), "chunk decoded");
                self.deliver(Outbound::Partial {
                    seq,
                    text: output.text,
                });
            }
            Err(e) => {
                counter!("decode_errors_total").increment(1);
                warn!(session_id = %self.id, seq, error = %e, "chunk decode failed");
                self.deliver(Outbound::Error {
                    seq: Some(seq),
                    code: ErrorCode::DecodeFailed,
                    message: e.to_string(),
                });
            }
        }
        if chunk.is_final {
            self.deliver_final();
        }
        self.outstanding.send_modify(|n| *n = n.saturating_sub(1));
    }

    /// Lease an engine, waiting for one to come back if all are busy.
    fn lease_engine(&self) -> EngineLease {
        if let Some(lease) = self.engines.try_checkout() {
            return lease;
        }
        debug!(session_id = %self.id, "all engines busy, waiting");
        self.engines.checkout()
    }

    /// The stream's closing message, sent whether or not its last chunk decoded.
    fn deliver_final(&self) {
        let text = self.context.lock().transcript.clone();
        self.deliver(Outbound::Final { text });
    }

    /// Keep the strand going, or release it when nothing is pending.
    fn continue_strand(self: &Arc<Self>) {
        let more = {
            let mut strand = self.strand.lock();
            strand.scheduled = !strand.pending.is_empty();
            strand.scheduled
        };
        if more {
            self.schedule();
        }
    }

    /// Answer every pending chunk with `SHUTTING_DOWN` and release the strand.
    fn reject_pending(&self) {
        let rejected: Vec<AudioChunk> = {
            let mut strand = self.strand.lock();
            strand.scheduled = false;
            strand.pending.drain(..).collect()
        };
        if rejected.is_empty() {
            return;
        }
        warn!(session_id = %self.id, chunks = rejected.len(), "pending chunks rejected at shutdown");
        for chunk in &rejected {
            self.deliver(Outbound::Error {
                seq: Some(chunk.seq),
                code: ErrorCode::ShuttingDown,
                message: "server is shutting down".into(),
            });
        }
        if rejected.iter().any(|chunk| chunk.is_final) {
            self.deliver_final();
        }
        self.outstanding
            .send_modify(|n| *n = n.saturating_sub(rejected.len()));
    }
}

/// The strand's single in-flight task. Dropping it unrun releases the strand.
struct StrandTicket {
    session: Option<Arc<Session>>,
}

impl StrandTicket {
    fn run(mut self) {
        if let Some(session) = self.session.take() {
            session.decode_next();
            session.continue_strand();
        }
    }
}

impl Drop for StrandTicket {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            session.reject_pending();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use scribe_engine::{AsrEngine, EngineFactory};

    use super::*;
    use crate::executor::{DecodeExecutor, WorkGuard};

    /// Echoes `"<seq>"`, fails on seq 13, panics on seq 66.
    struct ScriptedEngine {
        delay: Duration,
        busy: Arc<AtomicUsize>,
    }

    impl AsrEngine for ScriptedEngine {
        fn decode(
            &mut self,
            _ctx: &mut DecodeContext,
            chunk: &AudioChunk,
        ) -> Result<DecodeOutput, EngineError> {
            let _ = self.busy.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            let _ = self.busy.fetch_sub(1, Ordering::SeqCst);
            match chunk.seq {
                13 => Err(EngineError::Inference("bad frame".into())),
                66 => panic!("engine bug"),
                seq => Ok(DecodeOutput {
                    text: format!("w{seq}"),
                    is_final: chunk.is_final,
                }),
            }
        }
    }

    struct Harness {
        executor: DecodeExecutor,
        _guard: WorkGuard,
        engines: EnginePool,
    }

    fn harness(workers: usize, engines: usize, delay_ms: u64) -> Harness {
        let busy = Arc::new(AtomicUsize::new(0));
        let factory = move |_: usize| -> Result<Box<dyn AsrEngine>, EngineError> {
            Ok(Box::new(ScriptedEngine {
                delay: Duration::from_millis(delay_ms),
                busy: Arc::clone(&busy),
            }))
        };
        let engines = EnginePool::initialize(engines, &factory as &dyn EngineFactory).unwrap();
        let (executor, guard) = DecodeExecutor::start(workers).unwrap();
        Harness {
            executor,
            _guard: guard,
            engines,
        }
    }

    fn session(h: &Harness) -> (Arc<Session>, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let s = Session::new(SessionId::new(), h.executor.queue(), h.engines.clone(), tx);
        (s, rx)
    }

    fn chunk(seq: u64, is_final: bool) -> AudioChunk {
        AudioChunk {
            seq,
            samples: vec![0.0; 160],
            is_final,
        }
    }

    async fn idle(s: &Session) {
        tokio::time::timeout(Duration::from_secs(5), s.wait_idle())
            .await
            .expect("session did not go idle");
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Outbound> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn state_only_moves_forward() {
        let h = harness(1, 1, 0);
        let (s, _rx) = session(&h);
        assert_eq!(s.state(), SessionState::Connecting);
        assert!(s.start_streaming());
        assert!(s.begin_drain(DrainReason::EndOfStream));
        assert!(!s.start_streaming());
        assert!(!s.begin_drain(DrainReason::Disconnected));
        assert_eq!(s.drain_reason(), Some(DrainReason::EndOfStream));
        assert!(s.close());
        assert!(!s.close());
        assert_eq!(s.state(), SessionState::Closed);
    }

    #[test]
    fn drain_from_connecting_skips_streaming() {
        let h = harness(1, 1, 0);
        let (s, _rx) = session(&h);
        assert!(s.begin_drain(DrainReason::ProtocolError));
        assert_eq!(s.state(), SessionState::Draining);
    }

    #[tokio::test]
    async fn chunks_complete_in_submission_order() {
        let h = harness(4, 4, 2);
        let (s, mut rx) = session(&h);
        for seq in 0..20 {
            s.submit(chunk(seq, seq == 19));
        }
        idle(&s).await;
        let msgs = drain(&mut rx);
        let seqs: Vec<u64> = msgs
            .iter()
            .filter_map(|m| match m {
                Outbound::Partial { seq, .. } => Some(*seq),
                _ => None,
            })
            .collect();
        assert_eq!(seqs, (0..20).collect::<Vec<_>>());
        assert_matches::assert_matches!(msgs.last(), Some(Outbound::Final { text }) if text.starts_with("w0 w1"));
        assert_eq!(s.chunks_decoded(), 20);
    }

    #[tokio::test]
    async fn decode_error_is_reported_per_chunk() {
        let h = harness(1, 1, 0);
        let (s, mut rx) = session(&h);
        for seq in 12..15 {
            s.submit(chunk(seq, false));
        }
        idle(&s).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 3);
        assert_matches::assert_matches!(
            &msgs[1],
            Outbound::Error { seq: Some(13), code: ErrorCode::DecodeFailed, .. }
        );
        assert_matches::assert_matches!(&msgs[2], Outbound::Partial { seq: 14, .. });
    }

    #[tokio::test]
    async fn engine_panic_becomes_error_and_engine_returns() {
        let h = harness(1, 1, 0);
        let (s, mut rx) = session(&h);
        s.submit(chunk(66, false));
        s.submit(chunk(67, false));
        idle(&s).await;
        let msgs = drain(&mut rx);
        assert_matches::assert_matches!(
            &msgs[0],
            Outbound::Error { code: ErrorCode::DecodeFailed, message, .. } if message.contains("engine bug")
        );
        assert_matches::assert_matches!(&msgs[1], Outbound::Partial { seq: 67, .. });
        assert_eq!(h.engines.checked_out(), 0);
        assert_eq!(h.executor.live_workers(), 1);
    }

    #[tokio::test]
    async fn failed_last_chunk_still_closes_the_stream() {
        let h = harness(1, 1, 0);
        let (s, mut rx) = session(&h);
        s.submit(chunk(12, false));
        s.submit(chunk(13, true));
        idle(&s).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 3);
        assert_matches::assert_matches!(&msgs[0], Outbound::Partial { seq: 12, .. });
        assert_matches::assert_matches!(
            &msgs[1],
            Outbound::Error { seq: Some(13), code: ErrorCode::DecodeFailed, .. }
        );
        assert_matches::assert_matches!(&msgs[2], Outbound::Final { text } if text == "w12");
    }

    #[tokio::test]
    async fn detach_drops_pending_chunks() {
        let h = harness(1, 1, 20);
        let (s, rx) = session(&h);
        for seq in 0..5 {
            s.submit(chunk(seq, false));
        }
        s.detach();
        drop(rx);
        idle(&s).await;
        // at most the chunk already on the engine was decoded
        assert!(s.chunks_decoded() <= 1);
        assert_eq!(s.results_discarded(), 5);
        assert_eq!(s.outstanding(), 0);
    }

    #[tokio::test]
    async fn submit_after_detach_is_dropped() {
        let h = harness(1, 1, 0);
        let (s, _rx) = session(&h);
        s.detach();
        s.submit(chunk(0, true));
        assert_eq!(s.outstanding(), 0);
        assert_eq!(s.results_discarded(), 1);
        idle(&s).await;
        assert_eq!(s.chunks_decoded(), 0);
    }

    #[tokio::test]
    async fn rejected_strand_answers_shutting_down() {
        let h = harness(1, 1, 0);
        let _ = h.executor.shutdown();
        let (s, mut rx) = session(&h);
        s.submit(chunk(0, false));
        s.submit(chunk(1, true));
        idle(&s).await;
        let msgs = drain(&mut rx);
        assert_eq!(msgs.len(), 3);
        assert!(msgs[..2].iter().all(|m| matches!(
            m,
            Outbound::Error { code: ErrorCode::ShuttingDown, .. }
        )));
        assert_matches::assert_matches!(&msgs[2], Outbound::Final { text } if text.is_empty());
        assert_eq!(s.outstanding(), 0);
    }

    #[tokio::test]
    async fn shutdown_with_queued_strand_releases_chunks() {
        let h = harness(1, 1, 50);
        let (a, mut rx_a) = session(&h);
        let (b, mut rx_b) = session(&h);
        a.submit(chunk(0, false));
        // b's task waits in the queue behind a's running decode
        std::thread::sleep(Duration::from_millis(10));
        b.submit(chunk(0, false));
        b.submit(chunk(1, false));
        let report = h.executor.shutdown();
        assert_eq!(report.discarded, 1);
        idle(&a).await;
        idle(&b).await;
        assert_matches::assert_matches!(drain(&mut rx_a).as_slice(), [Outbound::Partial { seq: 0, .. }]);
        let b_msgs = drain(&mut rx_b);
        assert_eq!(b_msgs.len(), 2);
        assert!(b_msgs.iter().all(|m| matches!(
            m,
            Outbound::Error { code: ErrorCode::ShuttingDown, .. }
        )));
    }

    #[test]
    fn shutdown_token_is_per_session() {
        let h = harness(1, 1, 0);
        let (a, _ra) = session(&h);
        let (b, _rb) = session(&h);
        a.signal_shutdown();
        assert!(a.shutdown_token().is_cancelled());
        assert!(!b.shutdown_token().is_cancelled());
    }

    #[test]
    fn error_codes_serialize_screaming() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::ShuttingDown).unwrap(),
            "\"SHUTTING_DOWN\""
        );
        assert_eq!(
            serde_json::to_string(&ErrorCode::DecodeFailed).unwrap(),
            "\"DECODE_FAILED\""
        );
    }
}
