pub mod errors;
pub mod gemini;
pub mod retry;
pub mod streaming;
