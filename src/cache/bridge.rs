//! Generation Bridge: the only surface the request handler touches. Hides
//! the manager's tables and tensor handles behind `begin`/`end`, so the
//! handler deals only in token vectors and an opaque handle.

use crate::cache::layer::{DenseLayer, Layer};
use crate::cache::manager::{CacheHandle, Manager};
use crate::config::{GenerationParams, ModelConfig};

/// Fresh per-layer dense storage for a cold miss, sized from model shape.
fn fresh_layers(model: &ModelConfig) -> Vec<Layer> {
    (0..model.n_layers)
        .map(|_| {
            Layer::Dense(DenseLayer::new(
                model.n_kv_heads,
                model.head_dim,
                model.dense_growth_step,
            ))
        })
        .collect()
}

/// Resolve a prompt's already-cached prefix and return the suffix the
/// decoder must actually evaluate, plus the handle to drive forward and
/// later return via [`end`].
pub async fn begin(
    manager: &Manager,
    model_name: &str,
    model: &ModelConfig,
    prompt_tokens: &[u32],
    params: &GenerationParams,
) -> (Vec<u32>, CacheHandle) {
    let (suffix, handle) = manager.lookup(model_name, prompt_tokens, params).await;
    let handle = handle.unwrap_or_else(|| CacheHandle {
        key: crate::cache::key::compose(model_name, params),
        tokens: Vec::new(),
        layers: fresh_layers(model),
    });
    (suffix, handle)
}

/// Hand the fully extended token list and handle back to the manager for
/// admission. Must not be called if generation was cancelled before
/// producing a token list the caller wants retained.
pub async fn end(
    manager: &Manager,
    model_name: &str,
    full_tokens: Vec<u32>,
    handle: CacheHandle,
    params: &GenerationParams,
) {
    manager.write_back(model_name, full_tokens, handle, params).await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;

    fn model() -> ModelConfig {
        ModelConfig {
            n_layers: 2,
            n_kv_heads: 1,
            head_dim: 2,
            dense_growth_step: 256,
            ..ModelConfig::default()
        }
    }

    fn params() -> GenerationParams {
        GenerationParams::default()
    }

    #[tokio::test]
    async fn begin_on_cold_cache_returns_full_prompt_and_fresh_layers() {
        let manager = Manager::new(&CacheConfig {
            enable_cache: true,
            ..CacheConfig::default()
        });
        let model = model();
        let (suffix, handle) = begin(&manager, "m", &model, &[1, 2, 3], &params()).await;
        assert_eq!(suffix, vec![1, 2, 3]);
        assert_eq!(handle.layers.len(), 2);
        assert!(handle.layers.iter().all(Layer::is_dense));
    }

    #[tokio::test]
    async fn round_trip_through_begin_and_end_produces_a_hit() {
        let manager = Manager::new(&CacheConfig {
            enable_cache: true,
            ..CacheConfig::default()
        });
        let model = model();
        let p = params();

        let (suffix, mut handle) = begin(&manager, "m", &model, &[1, 2, 3], &p).await;
        assert_eq!(suffix, vec![1, 2, 3]);
        for layer in handle.layers.iter_mut() {
            let tile = vec![0.0f32; model.n_kv_heads * 3 * model.head_dim];
            layer.append(&tile, &tile, 3).unwrap();
        }
        end(&manager, "m", vec![1, 2, 3], handle, &p).await;

        let (suffix, handle) = begin(&manager, "m", &model, &[1, 2, 3, 4], &p).await;
        assert_eq!(suffix, vec![4]);
        assert_eq!(handle.layers[0].current_tokens(), 3);
    }
}
