//! Terminal display driver.
//!
//! Draws rendered frames, the status line and the transient screens
//! (startup, generating, failure, pause, goodbye). Every screen writes to an
//! injected [`Write`] so tests can capture the output; [`TerminalDisplay::stdout`]
//! is the convenience constructor for the real terminal.

use std::io::{self, Stdout, Write};

use anyhow::Result;
use crossterm::cursor::{Hide, MoveTo, Show};
use crossterm::style::{Color, Print, ResetColor, SetAttribute, Attribute, SetForegroundColor};
use crossterm::terminal::{
    Clear, ClearType, EnterAlternateScreen, LeaveAlternateScreen, disable_raw_mode, enable_raw_mode,
};
use crossterm::{execute, queue};
use tracing::debug;

use crate::ascii_renderer::{Cell, RenderedFrame, Rgb};
use crate::error::DreamError;
use crate::prefetch_queue::QueueStatus;
use crate::prompt_evolution::Theme;

/// Key hints shown under the art.
pub const KEY_HINTS: &str = "[space] pause  [t] next journey  [q] quit";

const ACCENT: Color = Color::Rgb { r: 120, g: 180, b: 255 };
const WARNING: Color = Color::Rgb { r: 250, g: 190, b: 40 };

/// Write one frame's glyph rows, coloured when the frame carries colour.
///
/// `line_end` is `"\n"` for plain output and `"\r\n"` in raw mode.
pub fn write_frame<W: Write>(out: &mut W, frame: &RenderedFrame, line_end: &str) -> io::Result<()> {
    for row in frame.rows() {
        write_row(out, row, frame.color_enabled())?;
        queue!(out, Print(line_end))?;
    }
    Ok(())
}

fn write_row<W: Write>(out: &mut W, row: &[Cell], color: bool) -> io::Result<()> {
    if !color {
        let line: String = row.iter().map(|cell| cell.ch).collect();
        return queue!(out, Print(line));
    }

    let mut current: Option<Rgb> = None;
    let mut run = String::new();
    for cell in row {
        if current != Some(cell.color) {
            if !run.is_empty() {
                queue!(out, Print(&run))?;
                run.clear();
            }
            let Rgb { r, g, b } = cell.color;
            queue!(out, SetForegroundColor(Color::Rgb { r, g, b }))?;
            current = Some(cell.color);
        }
        run.push(cell.ch);
    }
    if !run.is_empty() {
        queue!(out, Print(&run))?;
    }
    queue!(out, ResetColor)
}

/// Caption line for a frame: sequence, journey and prompt, cut to `width`.
#[must_use]
pub fn caption(frame: &RenderedFrame, width: usize) -> String {
    let theme = frame.prompt().theme().map_or("custom", |t| t.key());
    let full = format!("#{} [{}] {}", frame.sequence(), theme, frame.prompt().text());
    truncate(&full, width.max(16))
}

fn truncate(text: &str, width: usize) -> String {
    if text.chars().count() <= width {
        return text.to_string();
    }
    let mut cut: String = text.chars().take(width.saturating_sub(3)).collect();
    cut.push_str("...");
    cut
}

/// One-line summary of the queue for the bottom of the screen.
#[must_use]
pub fn status_line(status: &QueueStatus) -> String {
    let mut line = format!(
        "{} | buffer {}/{} | shown {} | skipped {}",
        status.theme, status.buffered, status.capacity, status.taken, status.skipped
    );
    if let Some(sequence) = status.in_flight {
        line.push_str(&format!(" | dreaming #{sequence}"));
    }
    line
}

/// Full-screen display over any writer.
pub struct TerminalDisplay<W: Write> {
    out: W,
    /// Row just below the last drawn art, where status text goes.
    status_row: u16,
    raw: bool,
}

impl TerminalDisplay<Stdout> {
    /// Display on the process's stdout.
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write> TerminalDisplay<W> {
    pub fn new(out: W) -> Self {
        Self {
            out,
            status_row: 2,
            raw: false,
        }
    }

    /// Switch the real terminal to raw mode on the alternate screen.
    pub fn enter(&mut self) -> Result<()> {
        enable_raw_mode()?;
        execute!(self.out, EnterAlternateScreen, Hide)?;
        self.raw = true;
        debug!("Entered alternate screen");
        Ok(())
    }

    /// Restore the terminal. Safe to call more than once.
    pub fn leave(&mut self) -> Result<()> {
        if !self.raw {
            return Ok(());
        }
        self.raw = false;
        execute!(self.out, Show, LeaveAlternateScreen)?;
        disable_raw_mode()?;
        Ok(())
    }

    fn line_end(&self) -> &'static str {
        if self.raw { "\r\n" } else { "\n" }
    }

    fn clear(&mut self) -> Result<()> {
        queue!(self.out, Clear(ClearType::All), MoveTo(0, 0))?;
        Ok(())
    }

    fn write_status(&mut self, color: Color, text: &str) -> Result<()> {
        queue!(
            self.out,
            MoveTo(0, self.status_row),
            Clear(ClearType::CurrentLine),
            SetForegroundColor(color),
            Print(text),
            ResetColor
        )?;
        self.out.flush()?;
        Ok(())
    }

    /// Shown while the first frame is generated (the backend may be cold).
    pub fn show_startup(&mut self, backend: &str, theme: Theme, capacity: usize) -> Result<()> {
        let end = self.line_end();
        self.clear()?;
        queue!(
            self.out,
            SetAttribute(Attribute::Bold),
            SetForegroundColor(ACCENT),
            Print("ascii-dream"),
            ResetColor,
            SetAttribute(Attribute::Reset),
            Print(end),
            Print(end),
            Print(format!("journey: {theme}{end}")),
            Print(format!("backend: {backend}{end}")),
            Print(format!("prefetching {capacity} frames, the first one can take a while...{end}")),
            Print(end),
            Print(KEY_HINTS),
            Print(end)
        )?;
        self.status_row = 7;
        self.out.flush()?;
        Ok(())
    }

    /// Replace the screen with `frame`, its caption and the status line.
    pub fn show_frame(&mut self, frame: &RenderedFrame, status: &QueueStatus) -> Result<()> {
        let end = self.line_end();
        let width = frame.max_row_width();
        self.clear()?;
        queue!(
            self.out,
            SetForegroundColor(ACCENT),
            Print(caption(frame, width)),
            ResetColor,
            Print(end)
        )?;
        write_frame(&mut self.out, frame, end)?;
        queue!(
            self.out,
            SetAttribute(Attribute::Dim),
            Print(KEY_HINTS),
            SetAttribute(Attribute::Reset),
            Print(end)
        )?;
        self.status_row = u16::try_from(frame.row_count() + 2).unwrap_or(u16::MAX);
        let line = status_line(status);
        self.write_status(Color::DarkGrey, &line)
    }

    /// The tick found no frame yet; the last art stays on screen.
    pub fn show_generating(&mut self, status: &QueueStatus) -> Result<()> {
        let line = format!("generating next frame... {}", status_line(status));
        self.write_status(Color::DarkGrey, &line)
    }

    /// A frame was skipped; keep going.
    pub fn show_failure(&mut self, err: &DreamError, status: &QueueStatus) -> Result<()> {
        let line = format!("! {err} | {}", status_line(status));
        self.write_status(WARNING, &line)
    }

    pub fn show_paused(&mut self) -> Result<()> {
        self.write_status(WARNING, "|| paused, press space to resume")
    }

    /// Final screen. Leaves raw mode first so the text stays on the terminal.
    pub fn show_goodbye(&mut self, shown: u64, skipped: u64) -> Result<()> {
        self.leave()?;
        writeln!(self.out, "Dream ended after {shown} frames ({skipped} skipped). Sweet dreams.")?;
        self.out.flush()?;
        Ok(())
    }

    /// Headless output: caption plus plain rows, no cursor control.
    pub fn print_frame(&mut self, frame: &RenderedFrame) -> Result<()> {
        writeln!(self.out, "{}", caption(frame, usize::MAX))?;
        write_frame(&mut self.out, frame, "\n")?;
        writeln!(self.out)?;
        self.out.flush()?;
        Ok(())
    }

    /// Headless failure line.
    pub fn print_notice(&mut self, text: &str) -> Result<()> {
        writeln!(self.out, "{text}")?;
        self.out.flush()?;
        Ok(())
    }

    /// The underlying writer.
    pub fn writer(&self) -> &W {
        &self.out
    }
}

impl<W: Write> Drop for TerminalDisplay<W> {
    fn drop(&mut self) {
        let _ = self.leave();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ascii_renderer::{RawFrame, TargetWidth, render};
    use crate::prefetch_queue::{FrameFailure, QueuePhase};
    use crate::prompt_evolution::Prompt;
    use image::{Rgb as Px, RgbImage};

    fn frame(color: bool) -> RenderedFrame {
        let img = RgbImage::from_fn(32, 32, |x, _| if x < 16 { Px([0, 0, 0]) } else { Px([255, 40, 40]) });
        let prompt = Prompt::new("crimson tide over black glass", Some(Theme::Liquid), 4);
        render(RawFrame::new(img, prompt, 4), TargetWidth::Columns(16), color).unwrap()
    }

    fn status() -> QueueStatus {
        QueueStatus {
            phase: QueuePhase::Draining,
            buffered: 1,
            capacity: 3,
            in_flight: Some(6),
            produced: 5,
            skipped: 1,
            taken: 4,
            consumer_waits: 2,
            last_failure: None,
            theme: Theme::Liquid,
        }
    }

    fn output(display: &TerminalDisplay<Vec<u8>>) -> String {
        String::from_utf8_lossy(display.writer()).to_string()
    }

    #[test]
    fn test_plain_frame_has_no_escape_codes() {
        let mut out = Vec::new();
        let frame = frame(false);
        write_frame(&mut out, &frame, "\n").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(!text.contains('\x1b'));
        assert_eq!(text, frame.to_plain_string());
    }

    #[test]
    fn test_colored_frame_emits_truecolor_runs() {
        let mut out = Vec::new();
        write_frame(&mut out, &frame(true), "\n").unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.contains("\x1b[38;2;255;40;40m"));
        // One colour change per half of each row, not one per cell.
        let changes = text.matches("\x1b[38;2;").count();
        assert_eq!(changes, frame(true).row_count() * 2);
    }

    #[test]
    fn test_caption_is_truncated_to_width() {
        let frame = frame(false);
        let short = caption(&frame, 20);
        assert_eq!(short.chars().count(), 20);
        assert!(short.starts_with("#4 [liquid]"));
        assert!(short.ends_with("..."));
        assert!(caption(&frame, 200).ends_with("black glass"));
    }

    #[test]
    fn test_status_line_reports_buffer_and_in_flight() {
        let line = status_line(&status());
        assert!(line.contains("buffer 1/3"));
        assert!(line.contains("skipped 1"));
        assert!(line.contains("dreaming #6"));
    }

    #[test]
    fn test_show_frame_draws_caption_art_and_hints() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show_frame(&frame(false), &status()).unwrap();
        let text = output(&display);
        assert!(text.contains("crimson tide"));
        assert!(text.contains(KEY_HINTS));
        assert!(text.contains("buffer 1/3"));
    }

    #[test]
    fn test_failure_and_pause_screens() {
        let mut display = TerminalDisplay::new(Vec::new());
        let failure = FrameFailure {
            sequence: 3,
            attempts: 2,
            reason: "network error: reset".into(),
        };
        let err = DreamError::GenerationFailed {
            sequence: failure.sequence,
            attempts: failure.attempts,
            reason: failure.reason.clone(),
        };
        display.show_failure(&err, &status()).unwrap();
        display.show_paused().unwrap();
        let text = output(&display);
        assert!(text.contains("frame #3"));
        assert!(text.contains("paused"));
    }

    #[test]
    fn test_headless_print_and_goodbye() {
        let mut display = TerminalDisplay::new(Vec::new());
        display.show_startup("mock", Theme::Cosmic, 3).unwrap();
        display.print_frame(&frame(false)).unwrap();
        display.show_goodbye(1, 0).unwrap();
        let text = output(&display);
        assert!(text.contains("journey: cosmic"));
        assert!(text.contains("#4 [liquid]"));
        assert!(text.contains("Dream ended after 1 frames"));
    }
}
