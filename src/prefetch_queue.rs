//! Prefetch queue: a bounded buffer of rendered frames kept topped up by a
//! single background producer task.
//!
//! The producer asks the [`PromptEvolver`] for the next prompt, calls the
//! [`ImageBackend`], renders the bytes and appends the frame. The consumer
//! (the display tick) calls [`PrefetchQueue::take`] once per tick.
//!
//! Phases:
//!
//! ```text
//! Idle -> Producing -> Ready(n) -> Draining <-> Producing -> Stopped
//!                 \-> Paused <-/
//! ```
//!
//! - `Producing`: buffer empty, a generation is pending or in flight.
//! - `Draining`: frames buffered while the producer tops up behind them.
//! - `Ready`: buffer full, producer waiting for the consumer.
//!
//! All shared state lives behind one lock. The in-flight slot is claimed
//! under that lock together with the capacity check, so at most one backend
//! call is ever outstanding and `buffered + in_flight <= capacity` holds at
//! every observation point.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{Notify, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::ascii_renderer::{RenderedFrame, TargetWidth, render_bytes};
use crate::error::{BackendError, DreamError, DreamResult};
use crate::generation::{AspectRatio, GenerationRequest, ImageBackend, QualityTier};
use crate::prompt_evolution::{PromptEvolver, Theme};

/// Largest buffer the queue accepts.
pub const MAX_CAPACITY: usize = 16;

/// Backend calls made per frame before it is skipped (one immediate retry).
pub const MAX_ATTEMPTS: u32 = 2;

/// Explicit settings threaded into [`PrefetchQueue::new`].
#[derive(Clone, Debug, PartialEq)]
pub struct QueueConfig {
    /// Frames buffered ahead of the display
    pub capacity: usize,
    /// Render width in columns, or auto from the terminal
    pub width: TargetWidth,
    /// Backend quality tier
    pub quality: QualityTier,
    /// Aspect ratio of generated images
    pub aspect_ratio: AspectRatio,
    /// Carry per-cell colour
    pub color: bool,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            capacity: 3,
            width: TargetWidth::Auto,
            quality: QualityTier::Normal,
            aspect_ratio: AspectRatio::Square,
            color: true,
        }
    }
}

impl QueueConfig {
    /// Reject settings the queue cannot run with.
    pub fn validate(&self) -> DreamResult<()> {
        if self.capacity == 0 {
            return Err(DreamError::config("frame buffer capacity must be at least 1"));
        }
        if self.capacity > MAX_CAPACITY {
            return Err(DreamError::config(format!(
                "frame buffer capacity {} exceeds the maximum of {MAX_CAPACITY}",
                self.capacity
            )));
        }
        if let TargetWidth::Columns(0) = self.width {
            return Err(DreamError::config("render width must be positive"));
        }
        Ok(())
    }
}

/// Coarse lifecycle phase, see the module docs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueuePhase {
    /// Created, producer not started
    Idle,
    /// Buffer empty, generation pending or in flight
    Producing,
    /// Buffer full
    Ready,
    /// Frames buffered, producer topping up
    Draining,
    /// No new generations are issued
    Paused,
    /// Terminal
    Stopped,
}

/// A frame that could not be produced.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameFailure {
    /// Sequence number that was skipped
    pub sequence: u64,
    /// Backend calls made for it
    pub attempts: u32,
    /// Last error, rendered for display
    pub reason: String,
}

impl FrameFailure {
    fn into_error(self) -> DreamError {
        DreamError::GenerationFailed {
            sequence: self.sequence,
            attempts: self.attempts,
            reason: self.reason,
        }
    }
}

/// Snapshot published on the status side channel after every change.
#[derive(Clone, Debug, PartialEq)]
pub struct QueueStatus {
    pub phase: QueuePhase,
    /// Slots in the buffer, skipped frames included
    pub buffered: usize,
    pub capacity: usize,
    /// Sequence number of the outstanding backend call
    pub in_flight: Option<u64>,
    /// Frames successfully rendered and buffered
    pub produced: u64,
    /// Sequence numbers given up on
    pub skipped: u64,
    /// Slots handed to the consumer
    pub taken: u64,
    /// Times `take()` had to suspend on an empty buffer
    pub consumer_waits: u64,
    pub last_failure: Option<FrameFailure>,
    /// Theme the producer is currently drawing prompts from
    pub theme: Theme,
}

enum Slot {
    Frame(RenderedFrame),
    Skipped(FrameFailure),
}

impl Slot {
    fn into_result(self) -> DreamResult<RenderedFrame> {
        match self {
            Self::Frame(frame) => Ok(frame),
            Self::Skipped(failure) => Err(failure.into_error()),
        }
    }
}

struct State {
    buffer: VecDeque<Slot>,
    capacity: usize,
    in_flight: Option<u64>,
    next_sequence: u64,
    started: bool,
    paused: bool,
    stopped: bool,
    pending_theme: Option<Theme>,
    theme: Theme,
    produced: u64,
    skipped: u64,
    taken: u64,
    consumer_waits: u64,
    last_failure: Option<FrameFailure>,
}

impl State {
    fn phase(&self) -> QueuePhase {
        if self.stopped {
            QueuePhase::Stopped
        } else if !self.started {
            QueuePhase::Idle
        } else if self.paused {
            QueuePhase::Paused
        } else if self.buffer.is_empty() {
            QueuePhase::Producing
        } else if self.buffer.len() >= self.capacity {
            QueuePhase::Ready
        } else {
            QueuePhase::Draining
        }
    }

    fn has_room(&self) -> bool {
        self.buffer.len() + usize::from(self.in_flight.is_some()) < self.capacity
    }

    fn snapshot(&self) -> QueueStatus {
        QueueStatus {
            phase: self.phase(),
            buffered: self.buffer.len(),
            capacity: self.capacity,
            in_flight: self.in_flight,
            produced: self.produced,
            skipped: self.skipped,
            taken: self.taken,
            consumer_waits: self.consumer_waits,
            last_failure: self.last_failure.clone(),
            theme: self.theme,
        }
    }
}

struct Shared {
    state: Mutex<State>,
    /// Wakes the consumer: frame appended, resume, stop.
    frame_ready: Notify,
    /// Wakes the producer: slot freed, resume, stop, theme change.
    producer_wake: Notify,
    status: watch::Sender<QueueStatus>,
}

impl Shared {
    fn publish(&self, state: &State) {
        self.status.send_replace(state.snapshot());
    }

    fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }
}

/// Bounded, strictly ordered frame buffer fed by one producer task.
pub struct PrefetchQueue {
    shared: Arc<Shared>,
    config: QueueConfig,
    producer: Option<JoinHandle<()>>,
}

impl PrefetchQueue {
    /// Validate `config` and build an idle queue.
    ///
    /// Fails with [`DreamError::Config`] before anything is generated.
    pub fn new(config: QueueConfig) -> DreamResult<Self> {
        config.validate()?;
        let state = State {
            buffer: VecDeque::with_capacity(config.capacity),
            capacity: config.capacity,
            in_flight: None,
            next_sequence: 0,
            started: false,
            paused: false,
            stopped: false,
            pending_theme: None,
            theme: Theme::default(),
            produced: 0,
            skipped: 0,
            taken: 0,
            consumer_waits: 0,
            last_failure: None,
        };
        let (status, _) = watch::channel(state.snapshot());
        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                frame_ready: Notify::new(),
                producer_wake: Notify::new(),
                status,
            }),
            config,
            producer: None,
        })
    }

    /// Spawn the production loop. Only valid from [`QueuePhase::Idle`].
    ///
    /// Must be called inside a tokio runtime.
    pub fn start(
        &mut self,
        evolver: PromptEvolver,
        backend: Arc<dyn ImageBackend>,
    ) -> DreamResult<()> {
        {
            let mut state = self.shared.state.lock();
            if state.stopped {
                return Err(DreamError::QueueStopped);
            }
            if state.started {
                return Err(DreamError::config("prefetch queue already started"));
            }
            state.started = true;
            state.theme = evolver.state().theme();
            self.shared.publish(&state);
        }

        info!(
            "Starting prefetch queue: capacity {}, backend '{}', {} @ {}",
            self.config.capacity,
            backend.name(),
            self.config.quality,
            self.config.aspect_ratio
        );
        let producer = Producer {
            shared: Arc::clone(&self.shared),
            evolver,
            backend,
            config: self.config.clone(),
        };
        self.producer = Some(tokio::spawn(producer.run()));
        Ok(())
    }

    /// Remove and return the oldest frame, waiting if none is buffered.
    ///
    /// A sequence number the producer gave up on comes back as
    /// [`DreamError::GenerationFailed`] in its place in the order. With a
    /// timeout, an empty wait ends in [`DreamError::TakeTimeout`]. While
    /// paused, the wait does not end on buffered frames until `resume()`.
    pub async fn take(&self, timeout: Option<Duration>) -> DreamResult<RenderedFrame> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut waited = false;

        loop {
            let notified = self.shared.frame_ready.notified();
            {
                let mut state = self.shared.state.lock();
                if let Some(result) = self.pop_locked(&mut state) {
                    return result;
                }
                if !waited {
                    waited = true;
                    state.consumer_waits += 1;
                    self.shared.publish(&state);
                }
            }

            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        return Err(DreamError::TakeTimeout(timeout));
                    }
                }
                _ => notified.await,
            }
        }
    }

    /// Non-suspending variant of [`take`](Self::take): `Ok(None)` when
    /// nothing is available right now.
    pub fn try_take(&self) -> DreamResult<Option<RenderedFrame>> {
        let mut state = self.shared.state.lock();
        self.pop_locked(&mut state).transpose()
    }

    fn pop_locked(&self, state: &mut State) -> Option<DreamResult<RenderedFrame>> {
        if state.stopped {
            return Some(Err(DreamError::QueueStopped));
        }
        if state.paused {
            return None;
        }
        let slot = state.buffer.pop_front()?;
        state.taken += 1;
        self.shared.publish(state);
        self.shared.producer_wake.notify_one();
        Some(slot.into_result())
    }

    /// Stop issuing new backend calls. An in-flight call still completes
    /// and its frame is buffered.
    pub fn pause(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped || state.paused {
            return;
        }
        state.paused = true;
        debug!("Prefetch queue paused");
        self.shared.publish(&state);
    }

    /// Undo [`pause`](Self::pause).
    pub fn resume(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped || !state.paused {
            return;
        }
        state.paused = false;
        debug!("Prefetch queue resumed");
        self.shared.publish(&state);
        self.shared.producer_wake.notify_one();
        self.shared.frame_ready.notify_one();
    }

    /// Terminal. Buffered frames are dropped, the producer exits at its next
    /// yield point and a frame whose call is still in flight is discarded
    /// when it lands. Idempotent.
    pub fn stop(&self) {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return;
        }
        state.stopped = true;
        let dropped = state.buffer.len();
        state.buffer.clear();
        info!(
            "Stopping prefetch queue ({} buffered frames dropped, in flight: {:?})",
            dropped, state.in_flight
        );
        self.shared.publish(&state);
        self.shared.producer_wake.notify_one();
        self.shared.frame_ready.notify_waiters();
        self.shared.frame_ready.notify_one();
    }

    /// Switch journey theme. Applied by the producer before its next
    /// prompt; frames already buffered keep the old theme.
    pub fn set_theme(&self, theme: Theme) -> DreamResult<()> {
        let mut state = self.shared.state.lock();
        if state.stopped {
            return Err(DreamError::QueueStopped);
        }
        info!("Theme change requested: {}", theme);
        state.pending_theme = Some(theme);
        self.shared.producer_wake.notify_one();
        Ok(())
    }

    /// Wait until the buffer holds `capacity` slots, so the first ticks of
    /// a session do not each wait on the backend.
    ///
    /// Fails with [`DreamError::TakeTimeout`] if the buffer is still short
    /// when `timeout` runs out, and with [`DreamError::QueueStopped`] if the
    /// queue stops first.
    pub async fn prefill(&self, timeout: Option<Duration>) -> DreamResult<()> {
        let mut status = self.watch();
        let filled = status.wait_for(|s| s.phase == QueuePhase::Stopped || s.buffered >= s.capacity);
        let reached = match timeout {
            Some(limit) => tokio::time::timeout(limit, filled)
                .await
                .map_err(|_| DreamError::TakeTimeout(limit))?
                .map(|s| s.phase),
            None => filled.await.map(|s| s.phase),
        };
        match reached {
            Ok(QueuePhase::Stopped) | Err(_) => Err(DreamError::QueueStopped),
            Ok(_) => {
                debug!("Prefill complete");
                Ok(())
            }
        }
    }

    /// Current status snapshot.
    #[must_use]
    pub fn status(&self) -> QueueStatus {
        self.shared.state.lock().snapshot()
    }

    /// Receiver for the status side channel.
    #[must_use]
    pub fn watch(&self) -> watch::Receiver<QueueStatus> {
        self.shared.status.subscribe()
    }

    /// Settings the queue was built with.
    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Wait for the producer task to exit. Call after [`stop`](Self::stop);
    /// returns once any in-flight call has landed and been discarded.
    pub async fn join(&mut self) {
        if let Some(handle) = self.producer.take() {
            if let Err(e) = handle.await {
                warn!("Producer task ended abnormally: {}", e);
            }
        }
    }
}

impl Drop for PrefetchQueue {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background half of the queue. Owns the evolver and the backend handle.
struct Producer {
    shared: Arc<Shared>,
    evolver: PromptEvolver,
    backend: Arc<dyn ImageBackend>,
    config: QueueConfig,
}

impl Producer {
    async fn run(mut self) {
        while let Some(sequence) = self.claim_slot().await {
            let prompt = self.evolver.next_prompt();
            let request = GenerationRequest::new(prompt.text(), self.config.aspect_ratio, self.config.quality);
            debug!("Frame #{} prompt: {}", sequence, prompt);

            let (attempts, outcome) = self.generate(sequence, &request).await;

            if self.shared.is_stopped() {
                self.discard(sequence);
                break;
            }

            let slot = match outcome {
                Ok(bytes) => {
                    match render_bytes(&bytes, prompt, sequence, self.config.width, self.config.color) {
                        Ok(frame) => Slot::Frame(frame),
                        Err(e) => {
                            warn!("Frame #{} could not be rendered: {}", sequence, e);
                            Slot::Skipped(FrameFailure {
                                sequence,
                                attempts,
                                reason: e.to_string(),
                            })
                        }
                    }
                }
                Err(e) => {
                    warn!("Skipping frame #{} after {} attempts: {}", sequence, attempts, e);
                    Slot::Skipped(FrameFailure {
                        sequence,
                        attempts,
                        reason: e.to_string(),
                    })
                }
            };

            if !self.commit(sequence, slot) {
                break;
            }
            tokio::task::yield_now().await;
        }
        debug!("Producer loop exited");
    }

    /// Wait until there is room and production is allowed, then claim the
    /// in-flight slot and the next sequence number. `None` once stopped.
    async fn claim_slot(&mut self) -> Option<u64> {
        loop {
            let shared = Arc::clone(&self.shared);
            let notified = shared.producer_wake.notified();
            let pending_theme = {
                let mut state = self.shared.state.lock();
                if state.stopped {
                    return None;
                }
                if !state.paused && state.has_room() {
                    let sequence = state.next_sequence;
                    state.next_sequence += 1;
                    state.in_flight = Some(sequence);
                    let pending = state.pending_theme.take();
                    self.shared.publish(&state);
                    Some((sequence, pending))
                } else {
                    None
                }
            };

            if let Some((sequence, pending)) = pending_theme {
                if let Some(theme) = pending {
                    self.apply_theme(theme);
                }
                return Some(sequence);
            }
            notified.await;
        }
    }

    fn apply_theme(&mut self, theme: Theme) {
        match self.evolver.set_theme(theme) {
            Ok(()) => {
                info!("Journey switched to {}", theme);
                let mut state = self.shared.state.lock();
                state.theme = theme;
                self.shared.publish(&state);
            }
            Err(e) => warn!("Ignoring theme change to {}: {}", theme, e),
        }
    }

    /// One call plus one immediate retry for the same sequence number. A
    /// pause landing between attempts holds the retry until `resume()`; a
    /// stop abandons it.
    async fn generate(
        &self,
        sequence: u64,
        request: &GenerationRequest,
    ) -> (u32, Result<Vec<u8>, BackendError>) {
        let mut attempts = 0;
        loop {
            attempts += 1;
            debug!("Frame #{} attempt {} via {}", sequence, attempts, self.backend.name());
            let err = match self.backend.generate(request).await {
                Ok(bytes) => return (attempts, Ok(bytes)),
                Err(e) => e,
            };
            if attempts >= MAX_ATTEMPTS || !self.wait_unpaused().await {
                return (attempts, Err(err));
            }
            warn!("Frame #{} attempt {} failed, retrying: {}", sequence, attempts, err);
        }
    }

    /// Suspend while paused. False once stopped.
    async fn wait_unpaused(&self) -> bool {
        loop {
            let notified = self.shared.producer_wake.notified();
            {
                let state = self.shared.state.lock();
                if state.stopped {
                    return false;
                }
                if !state.paused {
                    return true;
                }
            }
            debug!("Retry held while paused");
            notified.await;
        }
    }

    fn discard(&self, sequence: u64) {
        let mut state = self.shared.state.lock();
        state.in_flight = None;
        info!("Discarding frame #{} completed after stop", sequence);
        self.shared.publish(&state);
    }

    /// Append `slot` and release the in-flight marker. False once stopped.
    fn commit(&self, sequence: u64, slot: Slot) -> bool {
        let mut state = self.shared.state.lock();
        state.in_flight = None;
        if state.stopped {
            info!("Discarding frame #{} completed after stop", sequence);
            self.shared.publish(&state);
            return false;
        }
        match &slot {
            Slot::Frame(_) => state.produced += 1,
            Slot::Skipped(failure) => {
                state.skipped += 1;
                state.last_failure = Some(failure.clone());
            }
        }
        state.buffer.push_back(slot);
        self.shared.publish(&state);
        self.shared.frame_ready.notify_one();
        true
    }
}
