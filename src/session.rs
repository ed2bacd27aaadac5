use crate::{
    ascii_renderer::RenderedFrame,
    config::Config,
    display::TerminalDisplay,
    error::{DreamError, DreamResult},
    generation::ImageBackend,
    prefetch_queue::{PrefetchQueue, QueueStatus},
    prompt_evolution::{PromptEvolver, Theme},
};
use anyhow::Result;
use crossterm::event::{Event, EventStream, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use futures::{Stream, StreamExt};
use std::future::Future;
use std::io::{self, Write};
use std::pin::Pin;
use std::sync::Arc;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{info, warn};

/// What a key press asks the session to do.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyAction {
    TogglePause,
    NextTheme,
    Quit,
}

/// Map a key press to a session action.
pub fn key_action(key: &KeyEvent) -> Option<KeyAction> {
    match key.code {
        KeyCode::Char('c') if key.modifiers.contains(KeyModifiers::CONTROL) => Some(KeyAction::Quit),
        KeyCode::Char('q') | KeyCode::Char('Q') | KeyCode::Esc => Some(KeyAction::Quit),
        KeyCode::Char(' ') => Some(KeyAction::TogglePause),
        KeyCode::Char('t') | KeyCode::Char('T') => Some(KeyAction::NextTheme),
        _ => None,
    }
}

/// The action behind a terminal event, `None` for events that carry none.
fn event_action(event: io::Result<Event>) -> Option<KeyAction> {
    match event {
        Ok(Event::Key(key)) if key.kind == KeyEventKind::Press => key_action(&key),
        Ok(_) => None,
        Err(e) => {
            warn!("Terminal event error: {}", e);
            None
        }
    }
}

/// Counters reported when a session ends.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SessionSummary {
    pub shown: u64,
    pub skipped: u64,
}

impl SessionSummary {
    fn record(&mut self, result: &DreamResult<RenderedFrame>) {
        match result {
            Ok(_) => self.shown += 1,
            Err(DreamError::TakeTimeout(_)) => {}
            Err(_) => self.skipped += 1,
        }
    }
}

/// One dream: config, evolver and backend wired to a prefetch queue and a
/// display tick.
pub struct DreamSession {
    config: Config,
    evolver: PromptEvolver,
    backend: Arc<dyn ImageBackend>,
}

impl DreamSession {
    /// Validate `config` and build the evolver and backend it names.
    pub fn new(config: Config) -> DreamResult<Self> {
        config.validate()?;
        let backend = config.build_backend()?;
        Self::with_backend(config, backend)
    }

    /// Session with an injected backend.
    pub fn with_backend(config: Config, backend: Arc<dyn ImageBackend>) -> DreamResult<Self> {
        config.to_queue_config().validate()?;
        let evolver = config.build_evolver()?;
        Ok(Self {
            config,
            evolver,
            backend,
        })
    }

    fn start_queue(self) -> DreamResult<(PrefetchQueue, Config)> {
        let mut queue = PrefetchQueue::new(self.config.to_queue_config())?;
        queue.start(self.evolver, self.backend)?;
        Ok((queue, self.config))
    }

    /// Print frames to `display` without touching terminal modes. Ends after
    /// `max_frames` ticks that produced a frame or a skip, or on Ctrl+C.
    pub async fn run_headless<W: Write>(
        self,
        display: &mut TerminalDisplay<W>,
        max_frames: Option<u64>,
    ) -> Result<SessionSummary> {
        let (mut queue, config) = self.start_queue()?;
        let mut summary = SessionSummary::default();

        info!("Dreaming headless (max frames: {:?})", max_frames);
        tokio::select! {
            result = headless_loop(&queue, &config, display, max_frames, &mut summary) => result?,
            _ = tokio::signal::ctrl_c() => info!("Interrupted"),
        }

        queue.stop();
        queue.join().await;
        Ok(summary)
    }

    /// Full-screen session on the real terminal, driven by key presses.
    pub async fn run_interactive(self) -> Result<SessionSummary> {
        let backend_name = self.backend.name().to_string();
        let theme = self.evolver.state().theme();
        let (queue, config) = self.start_queue()?;

        let mut display = TerminalDisplay::stdout();
        display.enter()?;
        display.show_startup(&backend_name, theme, config.capacity)?;

        let mut summary = SessionSummary::default();
        let mut events = EventStream::new();
        let result = match prefill_interactive(&queue, &config, &mut events).await {
            Ok(true) => interactive_loop(&queue, &config, theme, events, &mut display, &mut summary).await,
            Ok(false) => Ok(()),
            Err(e) => Err(e),
        };

        queue.stop();
        display.show_goodbye(summary.shown, summary.skipped)?;
        result.map(|()| summary)
    }
}

async fn headless_loop<W: Write>(
    queue: &PrefetchQueue,
    config: &Config,
    display: &mut TerminalDisplay<W>,
    max_frames: Option<u64>,
    summary: &mut SessionSummary,
) -> Result<()> {
    if config.prefill {
        match queue.prefill(Some(config.prefill_timeout())).await {
            Ok(()) => {}
            Err(DreamError::QueueStopped) => return Ok(()),
            Err(e) => warn!("Starting before the buffer is full: {}", e),
        }
    }

    let mut tick = interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    while max_frames.is_none_or(|max| summary.shown + summary.skipped < max) {
        tick.tick().await;
        let result = queue.take(Some(config.take_timeout())).await;
        summary.record(&result);
        match result {
            Ok(frame) => display.print_frame(&frame)?,
            Err(DreamError::QueueStopped) => break,
            Err(e) if e.is_frame_level() => {
                warn!("Tick without a frame: {}", e);
                display.print_notice(&format!("! {e}"))?;
            }
            Err(e) => return Err(e.into()),
        }
    }
    Ok(())
}

/// Fill the buffer while the startup screen is up. False if the user quit
/// or the queue stopped first.
async fn prefill_interactive<S>(queue: &PrefetchQueue, config: &Config, events: &mut S) -> Result<bool>
where
    S: Stream<Item = io::Result<Event>> + Unpin,
{
    if !config.prefill {
        return Ok(true);
    }
    let prefill = queue.prefill(Some(config.prefill_timeout()));
    tokio::pin!(prefill);

    loop {
        tokio::select! {
            result = &mut prefill => {
                return match result {
                    Ok(()) => Ok(true),
                    Err(DreamError::QueueStopped) => Ok(false),
                    Err(e) => {
                        warn!("Starting before the buffer is full: {}", e);
                        Ok(true)
                    }
                };
            }
            maybe_event = events.next() => match maybe_event {
                None => return Ok(false),
                Some(event) => {
                    if event_action(event) == Some(KeyAction::Quit) {
                        return Ok(false);
                    }
                }
            },
        }
    }
}

type PendingTake<'a> = Pin<Box<dyn Future<Output = DreamResult<RenderedFrame>> + 'a>>;

/// Await the outstanding take, if there is one.
async fn next_frame(pending: &mut Option<PendingTake<'_>>) -> Option<DreamResult<RenderedFrame>> {
    match pending.as_mut() {
        Some(take) => Some(take.await),
        None => None,
    }
}

async fn interactive_loop<W, S>(
    queue: &PrefetchQueue,
    config: &Config,
    mut theme: Theme,
    mut events: S,
    display: &mut TerminalDisplay<W>,
    summary: &mut SessionSummary,
) -> Result<()>
where
    W: Write,
    S: Stream<Item = io::Result<Event>> + Unpin,
{
    let mut tick = interval(config.tick_interval());
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut paused = false;
    // One take per tick, kept across loop iterations until it resolves.
    let mut pending: Option<PendingTake<'_>> = None;

    loop {
        tokio::select! {
            biased;

            maybe_event = events.next() => {
                let Some(event) = maybe_event else { break };
                match event_action(event) {
                    Some(KeyAction::Quit) => break,
                    Some(KeyAction::TogglePause) => {
                        paused = !paused;
                        if paused {
                            queue.pause();
                            display.show_paused()?;
                        } else {
                            queue.resume();
                            display.show_generating(&queue.status())?;
                        }
                    }
                    Some(KeyAction::NextTheme) => {
                        theme = theme.cycle();
                        queue.set_theme(theme)?;
                        display.show_generating(&queue.status())?;
                    }
                    None => {}
                }
            }

            Some(result) = next_frame(&mut pending), if pending.is_some() && !paused => {
                pending = None;
                if matches!(result, Err(DreamError::QueueStopped)) {
                    break;
                }
                summary.record(&result);
                show_result(display, result, &queue.status())?;
            }

            _ = tick.tick() => {
                if pending.is_none() {
                    pending = Some(Box::pin(queue.take(Some(config.take_timeout()))));
                } else if !paused {
                    // Previous tick is still waiting on the producer.
                    display.show_generating(&queue.status())?;
                }
            }
        }
    }
    Ok(())
}

fn show_result<W: Write>(
    display: &mut TerminalDisplay<W>,
    result: DreamResult<RenderedFrame>,
    status: &QueueStatus,
) -> Result<()> {
    match result {
        Ok(frame) => display.show_frame(&frame, status),
        Err(DreamError::TakeTimeout(_)) => display.show_generating(status),
        Err(e) if e.is_frame_level() => {
            warn!("Frame skipped: {}", e);
            display.show_failure(&e, status)
        }
        Err(e) => Err(e.into()),
    }
}
