//! Retrieval-augmented answering.
//!
//! Turns retrieved units and conversation history into a prompt and streams
//! the generated answer back to the caller.

pub mod answer;
pub mod types;

pub use answer::{AnswerOrchestrator, AnswerStream};
pub use types::{Answer, AnswerEvent};
