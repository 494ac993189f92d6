//! Quantization Promoter: on write-back, converts dense per-layer stores
//! past a configured token threshold into group-quantized stores.
//!
//! Promotion failures never lose data: a layer that cannot be converted
//! (e.g. an unexpected shape) is left dense and the caller continues.

use crate::cache::layer::{Layer, QuantizedLayer};
use crate::config::GenerationParams;

/// Promote every eligible dense layer in place. Returns the number of
/// layers promoted. A no-op unless `params.kv_bits` is set.
pub fn promote_layers(layers: &mut [Layer], params: &GenerationParams) -> usize {
    let Some(bits) = params.kv_bits else {
        return 0;
    };

    let mut promoted = 0;
    for layer in layers.iter_mut() {
        let Layer::Dense(dense) = layer else {
            continue;
        };
        if dense.offset <= params.kv_quantization_start {
            continue;
        }
        let quantized = QuantizedLayer::from_dense(dense, params.kv_group_size as usize, bits);
        *layer = Layer::Quantized(quantized);
        promoted += 1;
    }
    promoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::layer::DenseLayer;

    fn dense_with_tokens(n: usize) -> Layer {
        let mut d = DenseLayer::new(1, 1, 256);
        let tile: Vec<f32> = (0..n).map(|i| i as f32).collect();
        d.append(&tile, &tile, n).unwrap();
        Layer::Dense(d)
    }

    fn quantizing_params(start: usize) -> GenerationParams {
        GenerationParams {
            temperature: 0.7,
            top_p: 0.9,
            kv_bits: Some(4),
            kv_group_size: 64,
            kv_quantization_start: start,
        }
    }

    #[test]
    fn promotes_dense_layers_past_threshold() {
        let mut layers = vec![dense_with_tokens(200)];
        let promoted = promote_layers(&mut layers, &quantizing_params(128));
        assert_eq!(promoted, 1);
        assert!(matches!(layers[0], Layer::Quantized(_)));
    }

    #[test]
    fn leaves_layers_under_threshold_dense() {
        let mut layers = vec![dense_with_tokens(50)];
        let promoted = promote_layers(&mut layers, &quantizing_params(128));
        assert_eq!(promoted, 0);
        assert!(layers[0].is_dense());
    }

    #[test]
    fn no_kv_bits_means_no_promotion() {
        let mut layers = vec![dense_with_tokens(200)];
        let params = GenerationParams {
            kv_bits: None,
            ..quantizing_params(128)
        };
        let promoted = promote_layers(&mut layers, &params);
        assert_eq!(promoted, 0);
        assert!(layers[0].is_dense());
    }

    #[test]
    fn promoted_layer_shrinks_reported_size() {
        let mut layers = vec![dense_with_tokens(200)];
        let dense_bytes = layers[0].size_bytes();
        promote_layers(&mut layers, &quantizing_params(128));
        assert!(layers[0].size_bytes() < dense_bytes);
    }

    #[test]
    fn already_quantized_layers_are_left_alone() {
        let mut layers = vec![dense_with_tokens(200)];
        promote_layers(&mut layers, &quantizing_params(128));
        let promoted_again = promote_layers(&mut layers, &quantizing_params(128));
        assert_eq!(promoted_again, 0);
    }
}
