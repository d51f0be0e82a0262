//! Stream a chat completion and pull the fenced code block out of it while
//! it is still arriving.
//!
//! The pipeline is: raw response chunks go through [`frames::FrameAssembler`]
//! into JSON payloads, [`generate::tokens`] maps those to text deltas, and a
//! [`fence::FenceExtractor`] turns the growing text into the best-known
//! content after every token. [`web`] serves the same pipeline over HTTP.

pub mod cli;
pub mod config;
pub mod error;
pub mod fence;
pub mod frames;
pub mod generate;
pub mod providers;
pub mod session;
pub mod upstream;
pub mod web;

pub use config::Config;
pub use error::PagecastError;
pub use fence::{extract, CloseBreak, EndPolicy, Extraction, FenceExtractor, FenceState, FenceStyle};
pub use frames::{payloads, Frame, FrameAssembler};
pub use session::{Outcome, Preview, Session};
