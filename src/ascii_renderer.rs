//! Image to coloured character grid.
//!
//! The renderer works in three passes over a decoded [`RawFrame`]:
//!
//! 1. size the grid: the caller's column count, and a row count that keeps
//!    the image's aspect ratio once terminal cells (roughly twice as tall as
//!    they are wide) are taken into account;
//! 2. area-average every image pixel that falls inside each cell, so fine
//!    generated texture blends instead of aliasing;
//! 3. map each cell's luminance onto [`CHARACTER_RAMP`] and keep its
//!    averaged colour separately. The glyph carries brightness, the colour
//!    carries hue.
//!
//! Rendering is a pure function of its inputs.

use std::fmt;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{DreamError, DreamResult};
use crate::prompt_evolution::Prompt;

/// Height/width ratio of a terminal character cell.
pub const CELL_ASPECT_RATIO: f64 = 2.0;

/// Glyphs from darkest to lightest.
pub const CHARACTER_RAMP: &str =
    " .'`^\",:;Il!i~+_-?][}{1)(|\\/tfjrxnuvczXYUJCLQ0OZmwqpdbkhao*#MW&8%B@$";

/// Upper bound for automatically sized frames.
pub const MAX_AUTO_WIDTH: u16 = 120;
/// Lower bound for automatically sized frames.
pub const MIN_AUTO_WIDTH: u16 = 20;
/// Width used when the terminal size cannot be read.
pub const FALLBACK_WIDTH: u16 = 80;
/// Hard cap on any render width.
pub const MAX_RENDER_WIDTH: u16 = 400;
/// Hard cap on the row count of any render.
pub const MAX_RENDER_HEIGHT: usize = 200;

/// 24-bit colour.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Rgb {
    /// Red
    pub r: u8,
    /// Green
    pub g: u8,
    /// Blue
    pub b: u8,
}

impl Rgb {
    /// Build from components.
    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Neutral grey of the given level.
    #[must_use]
    pub const fn gray(level: u8) -> Self {
        Self::new(level, level, level)
    }

    /// Rec. 601 luma, 0..=255.
    #[must_use]
    pub fn luminance(&self) -> u8 {
        let luma = 0.299 * f64::from(self.r) + 0.587 * f64::from(self.g) + 0.114 * f64::from(self.b);
        luma.round().clamp(0.0, 255.0) as u8
    }
}

/// One character cell of a rendered frame.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Cell {
    /// Glyph picked from the luminance ramp
    pub ch: char,
    /// Averaged cell colour (grey when colour is disabled)
    pub color: Rgb,
}

/// Requested render width.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "WidthValue", into = "WidthValue")]
pub enum TargetWidth {
    /// Follow the live terminal size
    #[default]
    Auto,
    /// Fixed number of columns
    Columns(u16),
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum WidthValue {
    Columns(u16),
    Keyword(String),
}

impl TryFrom<WidthValue> for TargetWidth {
    type Error = String;

    fn try_from(value: WidthValue) -> Result<Self, Self::Error> {
        match value {
            WidthValue::Columns(cols) => Ok(Self::Columns(cols)),
            WidthValue::Keyword(word) if word.eq_ignore_ascii_case("auto") => Ok(Self::Auto),
            WidthValue::Keyword(word) => Err(format!(
                "width must be \"auto\" or a column count, got '{word}'"
            )),
        }
    }
}

impl From<TargetWidth> for WidthValue {
    fn from(width: TargetWidth) -> Self {
        match width {
            TargetWidth::Auto => Self::Keyword("auto".to_string()),
            TargetWidth::Columns(cols) => Self::Columns(cols),
        }
    }
}

impl TargetWidth {
    /// Parse `"auto"` or a column count.
    pub fn parse(raw: &str) -> DreamResult<Self> {
        let raw = raw.trim();
        if raw.eq_ignore_ascii_case("auto") {
            return Ok(Self::Auto);
        }
        raw.parse::<u16>()
            .map(Self::Columns)
            .map_err(|_| DreamError::config(format!("invalid width '{raw}': expected \"auto\" or a number")))
    }

    /// Concrete column count for this render.
    #[must_use]
    pub fn resolve(&self) -> u16 {
        match self {
            Self::Auto => {
                let columns = crossterm::terminal::size().map(|(cols, _)| cols).ok();
                columns.map_or(FALLBACK_WIDTH, auto_width_for)
            }
            Self::Columns(cols) => (*cols).clamp(1, MAX_RENDER_WIDTH),
        }
    }
}

impl fmt::Display for TargetWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => f.write_str("auto"),
            Self::Columns(cols) => write!(f, "{cols}"),
        }
    }
}

/// 70% of the terminal, kept inside [`MIN_AUTO_WIDTH`]..=[`MAX_AUTO_WIDTH`].
#[must_use]
pub fn auto_width_for(terminal_columns: u16) -> u16 {
    let framed = u32::from(terminal_columns) * 7 / 10;
    u16::try_from(framed)
        .unwrap_or(MAX_AUTO_WIDTH)
        .clamp(MIN_AUTO_WIDTH, MAX_AUTO_WIDTH)
}

/// Row count for `columns` that preserves the image's aspect ratio.
#[must_use]
pub fn grid_height(image_width: u32, image_height: u32, columns: u16) -> usize {
    if image_width == 0 {
        return 1;
    }
    let rows = f64::from(columns) * f64::from(image_height) / f64::from(image_width) / CELL_ASPECT_RATIO;
    (rows.round() as usize).max(1)
}

/// Columns and rows for an image rendered at most `columns` wide.
///
/// Rows are capped at [`MAX_RENDER_HEIGHT`]; when the cap applies the
/// columns shrink with it so tall images keep their aspect ratio.
#[must_use]
pub fn grid_size(image_width: u32, image_height: u32, columns: u16) -> (usize, usize) {
    let columns = columns.max(1);
    let rows = grid_height(image_width, image_height, columns);
    if rows <= MAX_RENDER_HEIGHT || image_height == 0 {
        return (usize::from(columns), rows);
    }
    let scaled = MAX_RENDER_HEIGHT as f64 * CELL_ASPECT_RATIO * f64::from(image_width) / f64::from(image_height);
    let cols = (scaled.round() as usize).clamp(1, usize::from(columns));
    (cols, MAX_RENDER_HEIGHT)
}

/// Decoded generation output waiting to be rendered.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pixels: RgbImage,
    prompt: Prompt,
    sequence: u64,
}

impl RawFrame {
    /// Wrap an already decoded image.
    #[must_use]
    pub fn new(pixels: RgbImage, prompt: Prompt, sequence: u64) -> Self {
        Self {
            pixels,
            prompt,
            sequence,
        }
    }

    /// Decode encoded image bytes (PNG, JPEG, WebP).
    pub fn decode(bytes: &[u8], prompt: Prompt, sequence: u64) -> DreamResult<Self> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| DreamError::unsupported_image(format!("frame #{sequence}: {e}")))?;
        Ok(Self::new(decoded.to_rgb8(), prompt, sequence))
    }

    /// Pixel width.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    /// Pixel height.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    /// Originating prompt.
    #[must_use]
    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    /// Sequence number assigned by the queue.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

/// Immutable character grid ready for display.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RenderedFrame {
    sequence: u64,
    width: u16,
    rows: Vec<Vec<Cell>>,
    prompt: Prompt,
    color_enabled: bool,
}

impl RenderedFrame {
    /// Sequence number of the originating generation.
    #[must_use]
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Column count the frame was rendered for.
    #[must_use]
    pub fn width(&self) -> u16 {
        self.width
    }

    /// Rows, top to bottom.
    #[must_use]
    pub fn rows(&self) -> &[Vec<Cell>] {
        &self.rows
    }

    /// Number of rows.
    #[must_use]
    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    /// Widest row, in cells.
    #[must_use]
    pub fn max_row_width(&self) -> usize {
        self.rows.iter().map(Vec::len).max().unwrap_or(0)
    }

    /// Prompt the image was generated from.
    #[must_use]
    pub fn prompt(&self) -> &Prompt {
        &self.prompt
    }

    /// Whether cell colours should be emitted.
    #[must_use]
    pub fn color_enabled(&self) -> bool {
        self.color_enabled
    }

    /// Glyphs only, one line per row.
    #[must_use]
    pub fn to_plain_string(&self) -> String {
        let mut out = String::with_capacity(self.rows.len() * (usize::from(self.width) + 1));
        for row in &self.rows {
            out.extend(row.iter().map(|cell| cell.ch));
            out.push('\n');
        }
        out
    }
}

/// Render `raw` into a character grid of `width` columns.
///
/// Consumes the raw frame. Fails with [`DreamError::UnsupportedImage`] for
/// images with no pixels; never returns a partial grid.
pub fn render(raw: RawFrame, width: TargetWidth, color_enabled: bool) -> DreamResult<RenderedFrame> {
    let columns = width.resolve();
    render_columns(raw, columns, color_enabled)
}

/// Decode and render in one step.
pub fn render_bytes(
    bytes: &[u8],
    prompt: Prompt,
    sequence: u64,
    width: TargetWidth,
    color_enabled: bool,
) -> DreamResult<RenderedFrame> {
    let raw = RawFrame::decode(bytes, prompt, sequence)?;
    render(raw, width, color_enabled)
}

fn render_columns(raw: RawFrame, columns: u16, color_enabled: bool) -> DreamResult<RenderedFrame> {
    let (img_w, img_h) = raw.pixels.dimensions();
    if img_w == 0 || img_h == 0 {
        return Err(DreamError::unsupported_image(format!(
            "frame #{} has no pixels ({img_w}x{img_h})",
            raw.sequence
        )));
    }

    let (cols, rows) = grid_size(img_w, img_h, columns);
    let ramp: Vec<char> = CHARACTER_RAMP.chars().collect();

    let x_bounds: Vec<(u32, u32)> = (0..cols).map(|c| span(c, cols, img_w)).collect();
    let mut grid = Vec::with_capacity(rows);

    for r in 0..rows {
        let (y0, y1) = span(r, rows, img_h);
        let mut line = Vec::with_capacity(cols);
        for &(x0, x1) in &x_bounds {
            let avg = average_region(&raw.pixels, x0, x1, y0, y1);
            let luma = avg.luminance();
            let ch = ramp[glyph_index(luma, ramp.len())];
            let color = if color_enabled { avg } else { Rgb::gray(luma) };
            line.push(Cell { ch, color });
        }
        grid.push(line);
    }

    debug!(
        sequence = raw.sequence,
        columns = cols,
        rows,
        "rendered frame from {img_w}x{img_h} image"
    );

    Ok(RenderedFrame {
        sequence: raw.sequence,
        width: u16::try_from(cols).unwrap_or(columns.max(1)),
        rows: grid,
        prompt: raw.prompt,
        color_enabled,
    })
}

/// Pixel range covered by cell `index` of `count` over `extent` pixels.
/// Always at least one pixel wide.
fn span(index: usize, count: usize, extent: u32) -> (u32, u32) {
    let extent_u64 = u64::from(extent);
    let start = (index as u64 * extent_u64 / count as u64) as u32;
    let end = ((index as u64 + 1) * extent_u64 / count as u64) as u32;
    let start = start.min(extent - 1);
    (start, end.max(start + 1).min(extent))
}

fn average_region(pixels: &RgbImage, x0: u32, x1: u32, y0: u32, y1: u32) -> Rgb {
    let mut sum = [0u64; 3];
    let mut count = 0u64;
    for y in y0..y1 {
        for x in x0..x1 {
            let px = pixels.get_pixel(x, y);
            sum[0] += u64::from(px[0]);
            sum[1] += u64::from(px[1]);
            sum[2] += u64::from(px[2]);
            count += 1;
        }
    }
    let count = count.max(1);
    let channel = |total: u64| ((total + count / 2) / count) as u8;
    Rgb::new(channel(sum[0]), channel(sum[1]), channel(sum[2]))
}

fn glyph_index(luma: u8, ramp_len: usize) -> usize {
    (usize::from(luma) * (ramp_len - 1) + 127) / 255
}
