//! ASCII Dream - an endless stream of AI-generated ASCII art.
//!
//! A background producer keeps a small buffer of frames ready while the
//! current one is on screen, so a slow text-to-image backend does not stall
//! the display. It supports:
//!
//! - **Prompt journeys** that drift one small change at a time
//! - **ASCII rendering** with area averaging and per-cell colour
//! - **Prefetching** with back-pressure, one retry per frame and recorded skips
//! - **Pluggable backends**: a JSON/HTTP endpoint or an offline procedural mock
//!
//! # Architecture
//!
//! - [`prompt_evolution`] - Themes, journey state and the prompt evolver
//! - [`ascii_renderer`] - Image to character grid
//! - [`generation`] - Generation backend contract and implementations
//! - [`http_client`] - HTTP client abstraction
//! - [`prefetch_queue`] - Bounded producer/consumer frame buffer
//! - [`config`] - Settings from file, environment and flags
//! - [`display`] - Terminal display driver
//! - [`session`] - Wires everything to a display tick
//! - [`error`] - Error taxonomy
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use std::time::Duration;
//! use ascii_dream::generation::MockImageBackend;
//! use ascii_dream::prefetch_queue::{PrefetchQueue, QueueConfig};
//! use ascii_dream::prompt_evolution::{PromptEvolver, Theme};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut queue = PrefetchQueue::new(QueueConfig::default())?;
//!     queue.start(
//!         PromptEvolver::new(Theme::Cosmic, Some(42)),
//!         Arc::new(MockImageBackend::new(Duration::from_millis(200))),
//!     )?;
//!
//!     let frame = queue.take(Some(Duration::from_secs(5))).await?;
//!     print!("{}", frame.to_plain_string());
//!     queue.stop();
//!     Ok(())
//! }
//! ```

pub mod ascii_renderer;
pub mod config;
pub mod display;
pub mod error;
pub mod generation;
pub mod http_client;
pub mod prefetch_queue;
pub mod prompt_evolution;
pub mod session;
