//! Generation Backend contract and implementations.
//!
//! The backend is an opaque async call: prompt + size + quality tier in,
//! encoded image bytes out. It owns its own latency and failure modes and
//! reports failures as a [`BackendError`] classification. Two
//! implementations ship with the crate:
//!
//! - [`HttpImageBackend`]: POSTs JSON to a remote text-to-image endpoint
//!   and expects PNG/JPEG/WebP bytes back.
//! - [`MockImageBackend`]: draws a deterministic procedural picture from the
//!   prompt text, with configurable latency, so the pipeline runs offline.

use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageFormat, Rgb as Px, RgbImage};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{info, warn};

use crate::error::{BackendError, DreamError};
use crate::http_client::{HttpClient, ReqwestHttpClient};
use crate::prompt_evolution::COLOR_PALETTE;

/// Speed/quality trade-off for generation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QualityTier {
    /// Quarter-area images, much quicker round trips
    Fast,
    /// Full 512-based resolution
    #[default]
    Normal,
}

impl QualityTier {
    /// Config/CLI key.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Fast => "fast",
            Self::Normal => "normal",
        }
    }
}

impl FromStr for QualityTier {
    type Err = DreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "fast" => Ok(Self::Fast),
            "normal" => Ok(Self::Normal),
            other => Err(DreamError::config(format!(
                "unknown quality '{other}' (choose from: fast, normal)"
            ))),
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// Aspect ratio of generated images.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AspectRatio {
    /// 1:1
    #[default]
    #[serde(rename = "1:1")]
    Square,
    /// 16:9
    #[serde(rename = "16:9")]
    Widescreen,
    /// 9:16
    #[serde(rename = "9:16")]
    Tall,
    /// 4:3
    #[serde(rename = "4:3")]
    Standard,
    /// 3:4
    #[serde(rename = "3:4")]
    StandardPortrait,
}

impl AspectRatio {
    /// Every supported ratio.
    pub const ALL: [AspectRatio; 5] = [
        AspectRatio::Square,
        AspectRatio::Widescreen,
        AspectRatio::Tall,
        AspectRatio::Standard,
        AspectRatio::StandardPortrait,
    ];

    /// Config/CLI key.
    #[must_use]
    pub fn key(&self) -> &'static str {
        match self {
            Self::Square => "1:1",
            Self::Widescreen => "16:9",
            Self::Tall => "9:16",
            Self::Standard => "4:3",
            Self::StandardPortrait => "3:4",
        }
    }

    /// Pixel dimensions `(width, height)` for this ratio at `quality`.
    ///
    /// Sizes stay multiples of 8, as diffusion models require, and keep
    /// roughly the pixel count of the square size.
    #[must_use]
    pub fn dimensions(&self, quality: QualityTier) -> (u32, u32) {
        let (w, h) = match self {
            Self::Square => (512, 512),
            Self::Widescreen => (768, 432),
            Self::Tall => (432, 768),
            Self::Standard => (576, 432),
            Self::StandardPortrait => (432, 576),
        };
        match quality {
            QualityTier::Normal => (w, h),
            QualityTier::Fast => (w / 2, h / 2),
        }
    }
}

impl FromStr for AspectRatio {
    type Err = DreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key = s.trim();
        AspectRatio::ALL
            .iter()
            .copied()
            .find(|ratio| ratio.key() == key)
            .ok_or_else(|| {
                DreamError::config(format!(
                    "unknown aspect ratio '{key}' (choose from: 1:1, 16:9, 9:16, 4:3, 3:4)"
                ))
            })
    }
}

impl fmt::Display for AspectRatio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// One call's worth of parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GenerationRequest {
    /// Text prompt
    pub prompt: String,
    /// Image width in pixels
    pub width: u32,
    /// Image height in pixels
    pub height: u32,
    /// Quality tier
    pub quality: QualityTier,
}

impl GenerationRequest {
    /// Request sized from an aspect ratio and quality tier.
    pub fn new(prompt: impl Into<String>, aspect: AspectRatio, quality: QualityTier) -> Self {
        let (width, height) = aspect.dimensions(quality);
        Self {
            prompt: prompt.into(),
            width,
            height,
            quality,
        }
    }
}

/// Generation Backend contract.
///
/// Implementations may take seconds per call and may fail; the prefetch
/// queue never issues more than one call at a time per queue.
#[async_trait]
pub trait ImageBackend: Send + Sync {
    /// Human-readable backend name for logs and the status line.
    fn name(&self) -> &str;

    /// Generate one image and return it encoded (PNG, JPEG or WebP).
    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError>;
}

/// Remote text-to-image endpoint spoken to over JSON/HTTP.
///
/// Request body: `{"prompt", "width", "height", "quality", "steps"}`.
/// A 2xx reply carries the encoded image as its body.
pub struct HttpImageBackend<C: HttpClient = ReqwestHttpClient> {
    client: C,
    endpoint: String,
    api_token: Option<String>,
}

impl HttpImageBackend<ReqwestHttpClient> {
    /// Backend using reqwest with the given per-call timeout.
    pub fn new(endpoint: impl Into<String>, api_token: Option<String>, timeout: Duration) -> Self {
        Self::with_client(ReqwestHttpClient::new(timeout), endpoint, api_token)
    }
}

impl<C: HttpClient> HttpImageBackend<C> {
    /// Backend with an injected HTTP client.
    pub fn with_client(client: C, endpoint: impl Into<String>, api_token: Option<String>) -> Self {
        Self {
            client,
            endpoint: endpoint.into(),
            api_token,
        }
    }

    fn request_body(request: &GenerationRequest) -> serde_json::Value {
        // Turbo-class models produce a usable image in a single step.
        let steps = match request.quality {
            QualityTier::Fast => 1,
            QualityTier::Normal => 2,
        };
        json!({
            "prompt": request.prompt,
            "width": request.width,
            "height": request.height,
            "quality": request.quality.key(),
            "steps": steps,
        })
    }
}

#[async_trait]
impl<C: HttpClient> ImageBackend for HttpImageBackend<C> {
    fn name(&self) -> &str {
        "http"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError> {
        let bearer = self.api_token.as_ref().map(|token| format!("Bearer {token}"));
        let mut headers = vec![("content-type", "application/json"), ("accept", "image/*")];
        if let Some(bearer) = bearer.as_deref() {
            headers.push(("authorization", bearer));
        }

        info!(
            "Requesting {}x{} image for prompt: {}",
            request.width, request.height, request.prompt
        );
        let reply = self
            .client
            .post_json(&self.endpoint, &headers, &Self::request_body(request))
            .await?;

        if !reply.is_success() {
            let message: String = String::from_utf8_lossy(&reply.body).chars().take(200).collect();
            warn!(status = reply.status, "generation endpoint returned an error");
            return Err(BackendError::Remote {
                status: reply.status,
                message,
            });
        }
        if reply.body.is_empty() {
            return Err(BackendError::InvalidResponse("empty image body".to_string()));
        }
        Ok(reply.body)
    }
}

/// Offline backend painting a procedural picture from the prompt.
///
/// The same prompt and size always give the same bytes.
pub struct MockImageBackend {
    latency: Duration,
}

impl MockImageBackend {
    /// Mock that waits `latency` before answering.
    #[must_use]
    pub fn new(latency: Duration) -> Self {
        Self { latency }
    }

    /// Paint and PNG-encode the picture for `request`.
    pub fn paint(request: &GenerationRequest) -> Result<Vec<u8>, BackendError> {
        let seed = fnv1a(request.prompt.as_bytes());
        let (primary, secondary) = prompt_colors(&request.prompt, seed);
        let (w, h) = (request.width.max(1), request.height.max(1));
        let cx = (seed % 1000) as f32 / 1000.0;
        let cy = ((seed >> 16) % 1000) as f32 / 1000.0;
        let freq = 3.0 + ((seed >> 32) % 7) as f32;

        let img = RgbImage::from_fn(w, h, |x, y| {
            let u = x as f32 / w as f32;
            let v = y as f32 / h as f32;
            let dist = ((u - cx).powi(2) + (v - cy).powi(2)).sqrt();
            let wave = ((u * freq + v * freq * 0.7).sin() * 0.5 + 0.5) * 0.35;
            let t = (1.0 - dist * 1.4).clamp(0.0, 1.0) * 0.65 + wave;
            let mix = |a: u8, b: u8| (f32::from(a) * t + f32::from(b) * (1.0 - t)).clamp(0.0, 255.0) as u8;
            Px([
                mix(primary[0], secondary[0]),
                mix(primary[1], secondary[1]),
                mix(primary[2], secondary[2]),
            ])
        });

        let mut buf = Vec::new();
        img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
            .map_err(|e| BackendError::InvalidResponse(format!("failed to encode mock image: {e}")))?;
        Ok(buf)
    }
}

impl Default for MockImageBackend {
    fn default() -> Self {
        Self::new(Duration::from_millis(800))
    }
}

#[async_trait]
impl ImageBackend for MockImageBackend {
    fn name(&self) -> &str {
        "mock"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<Vec<u8>, BackendError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        Self::paint(request)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

fn named_color(word: &str) -> Option<[u8; 3]> {
    let rgb = match word {
        "blue" => [40, 90, 220],
        "purple" => [130, 50, 180],
        "orange" => [240, 140, 30],
        "red" => [210, 35, 35],
        "green" => [40, 170, 70],
        "turquoise" => [60, 210, 200],
        "magenta" => [220, 40, 200],
        "cyan" => [40, 220, 240],
        "amber" => [250, 190, 40],
        "violet" => [150, 90, 230],
        "crimson" => [180, 20, 60],
        "emerald" => [30, 160, 110],
        "golden" => [230, 190, 60],
        "silver" => [190, 195, 205],
        "coral" => [250, 120, 90],
        "indigo" => [75, 40, 160],
        "rose" => [240, 110, 150],
        "teal" => [30, 130, 130],
        _ => return None,
    };
    Some(rgb)
}

/// First two palette colours named in the prompt, falling back to hashed
/// picks.
fn prompt_colors(prompt: &str, seed: u64) -> ([u8; 3], [u8; 3]) {
    let mut named = prompt
        .split(|c: char| !c.is_alphabetic())
        .filter_map(|word| named_color(&word.to_lowercase()));
    let fallback = |shift: u32| {
        let word = COLOR_PALETTE[((seed >> shift) % COLOR_PALETTE.len() as u64) as usize];
        named_color(word).unwrap_or([128, 128, 128])
    };
    let primary = named.next().unwrap_or_else(|| fallback(8));
    let secondary = named.next().unwrap_or_else(|| primary.map(|c| c / 5));
    (primary, secondary)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http_client::HttpReply;
    use std::sync::Mutex;

    /// Mock HTTP client that records the last body and returns a fixed reply.
    struct MockHttpClient {
        reply: Result<HttpReply, BackendError>,
        last_body: Mutex<Option<serde_json::Value>>,
        last_headers: Mutex<Vec<(String, String)>>,
    }

    impl MockHttpClient {
        fn replying(status: u16, body: &[u8]) -> Self {
            Self {
                reply: Ok(HttpReply {
                    status,
                    body: body.to_vec(),
                }),
                last_body: Mutex::new(None),
                last_headers: Mutex::new(Vec::new()),
            }
        }

        fn failing(err: BackendError) -> Self {
            Self {
                reply: Err(err),
                last_body: Mutex::new(None),
                last_headers: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpClient for MockHttpClient {
        async fn post_json(
            &self,
            _url: &str,
            headers: &[(&str, &str)],
            body: &serde_json::Value,
        ) -> Result<HttpReply, BackendError> {
            *self.last_body.lock().unwrap() = Some(body.clone());
            *self.last_headers.lock().unwrap() = headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            self.reply.clone()
        }
    }

    fn request() -> GenerationRequest {
        GenerationRequest::new("swirling cyan and amber patterns", AspectRatio::Square, QualityTier::Fast)
    }

    #[test]
    fn test_dimensions_table() {
        assert_eq!(AspectRatio::Square.dimensions(QualityTier::Normal), (512, 512));
        assert_eq!(AspectRatio::Square.dimensions(QualityTier::Fast), (256, 256));
        assert_eq!(AspectRatio::Widescreen.dimensions(QualityTier::Fast), (384, 216));
        assert_eq!(AspectRatio::StandardPortrait.dimensions(QualityTier::Normal), (432, 576));
    }

    #[test]
    fn test_parse_aspect_and_quality() {
        assert_eq!("16:9".parse::<AspectRatio>().unwrap(), AspectRatio::Widescreen);
        assert!("2:1".parse::<AspectRatio>().is_err());
        assert_eq!("FAST".parse::<QualityTier>().unwrap(), QualityTier::Fast);
        assert!("ultra".parse::<QualityTier>().is_err());
    }

    #[tokio::test]
    async fn test_http_backend_sends_request_body_and_token() {
        let client = MockHttpClient::replying(200, b"\x89PNG fake");
        let backend = HttpImageBackend::with_client(client, "http://gpu/generate", Some("secret".into()));

        let bytes = backend.generate(&request()).await.unwrap();
        assert_eq!(bytes, b"\x89PNG fake");

        let body = backend.client.last_body.lock().unwrap().clone().unwrap();
        assert_eq!(body["prompt"], "swirling cyan and amber patterns");
        assert_eq!(body["width"], 256);
        assert_eq!(body["height"], 256);
        assert_eq!(body["quality"], "fast");

        let headers = backend.client.last_headers.lock().unwrap().clone();
        assert!(headers.contains(&("authorization".to_string(), "Bearer secret".to_string())));
    }

    #[tokio::test]
    async fn test_http_backend_maps_error_status_to_remote() {
        let backend = HttpImageBackend::with_client(
            MockHttpClient::replying(503, b"container warming up"),
            "http://gpu/generate",
            None,
        );
        let err = backend.generate(&request()).await.unwrap_err();
        assert_eq!(
            err,
            BackendError::Remote {
                status: 503,
                message: "container warming up".to_string()
            }
        );
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_http_backend_rejects_empty_body() {
        let backend =
            HttpImageBackend::with_client(MockHttpClient::replying(200, b""), "http://gpu/generate", None);
        let err = backend.generate(&request()).await.unwrap_err();
        assert!(matches!(err, BackendError::InvalidResponse(_)));
    }

    #[tokio::test]
    async fn test_http_backend_passes_transport_errors_through() {
        let backend = HttpImageBackend::with_client(
            MockHttpClient::failing(BackendError::Timeout(Duration::from_secs(60))),
            "http://gpu/generate",
            None,
        );
        let err = backend.generate(&request()).await.unwrap_err();
        assert_eq!(err, BackendError::Timeout(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_mock_backend_is_deterministic_and_decodable() {
        let backend = MockImageBackend::new(Duration::ZERO);
        let a = backend.generate(&request()).await.unwrap();
        let b = backend.generate(&request()).await.unwrap();
        assert_eq!(a, b);

        let decoded = image::load_from_memory(&a).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (256, 256));
    }

    #[test]
    fn test_prompt_colors_prefer_named_colors() {
        let (primary, secondary) = prompt_colors("cosmic teal dust in crimson void", 0);
        assert_eq!(primary, [30, 130, 130]);
        assert_eq!(secondary, [180, 20, 60]);
    }
}
