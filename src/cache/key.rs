//! Cache key composition.
//!
//! Derives a deterministic bucket string from model identity and generation
//! parameters so that only parameter-equivalent requests ever share a cache
//! entry.

use crate::config::GenerationParams;

/// Compose the bucket key for a (model, params) pair.
///
/// Floats are formatted with a fixed number of decimal places rather than
/// `{}` so the key is stable across platforms and builds (locale-dependent
/// or precision-dependent formatting would let bit-identical parameter sets
/// fail to collide).
pub fn compose(model: &str, params: &GenerationParams) -> String {
    format!(
        "{model}|t={:.6}|p={:.6}|{}",
        params.temperature,
        params.top_p,
        quant_tag(params)
    )
}

fn quant_tag(params: &GenerationParams) -> String {
    match params.kv_bits {
        Some(bits) => format!("kv{bits}g{}", params.kv_group_size),
        None => "nokv".to_string(),
    }
}
