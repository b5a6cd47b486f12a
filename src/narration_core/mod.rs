//! Language-aware narration text processing: formatting for TTS, possessive
//! stripping, sentence-length control, transition/segment validation and the
//! intro/transition generators.

pub mod cache;
pub mod formatter;
pub mod generator;
pub mod numerals;
pub mod rules;
pub mod text;
pub mod types;
pub mod validator;

pub use cache::NarrationCache;
pub use formatter::TextFormatter;
pub use generator::{IntroGenerator, TransitionGenerator};
pub use types::{EpisodeContext, FormatterConfig, GeneratorConfig};
pub use validator::{SegmentQualityValidator, TransitionQualityValidator};
