//! Provider driver implementations: a unified wire-format-agnostic
//! interface over OpenAI, Anthropic, and Google's Gemini chat APIs.

pub mod loop_detector;
pub mod provider;

#[cfg(feature = "openai")]
pub mod openai;

#[cfg(feature = "anthropic")]
pub mod anthropic;

#[cfg(feature = "gemini")]
pub mod gemini;

pub use loop_detector::{LoopAction, LoopDetection, LoopDetector, LoopDetectorConfig, LoopType};
pub use provider::*;

#[cfg(feature = "openai")]
pub use openai::OpenAIDriver;

#[cfg(feature = "anthropic")]
pub use anthropic::AnthropicDriver;

#[cfg(feature = "gemini")]
pub use gemini::GeminiDriver;
