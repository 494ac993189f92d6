//! prompt-prefix-cache: prompt-prefix KV-cache manager for an
//! OpenAI-compatible local LLM inference server.
//!
//! - [`cache`]: key composition, layer storage, entries, admission/eviction,
//!   quantization promotion, and the generation bridge
//! - [`config`]: process configuration and per-request generation parameters
//! - [`inference`]: decode-loop orchestration and the llama.cpp FFI seam
//! - [`server`]: the OpenAI-compatible HTTP surface

pub mod cache;
pub mod config;
pub mod inference;
pub mod server;
