//! Text generation for the reasoning and synthesis stages.
//!
//! The pipeline only depends on the [`TextGenerator`] trait. The bundled
//! [`HttpTextGenerator`] talks to any OpenAI-compatible endpoint:
//!
//! ```ignore
//! use dx_forge::llm::{HttpTextGenerator, TextGenerator};
//!
//! let generator = HttpTextGenerator::from_env()?;
//! let raw = generator.generate("Propose hypotheses for ...").await?;
//! ```

pub mod client;

pub use client::{HttpTextGenerator, Message, TextGenerator};
