//! Wire types for the dialect surfaces.
//!
//! Anthropic Messages has no module here: that dialect is validated and
//! forwarded byte-for-byte (the GGUF engine accepts the format natively),
//! so the server never materializes its schema.

pub mod ollama;
pub mod openai;
pub mod responses;
