//! Prompt-prefix KV-cache.
//!
//! - [`key`]: bucket key composition from model identity + generation params
//! - [`layer`]: dense/quantized per-layer tensor backing
//! - [`entry`]: one bucket's tokens + layers + timestamps
//! - [`manager`]: admission, lookup, eviction, TTL sweep
//! - [`promoter`]: mid-generation dense-to-quantized conversion
//! - [`bridge`]: detach-on-hit / reattach-on-write-back handoff to generation

pub mod bridge;
pub mod entry;
pub mod key;
pub mod layer;
pub mod manager;
pub mod promoter;
