//! Layer-Cache: the uniform trim/append/size-estimate contract over the two
//! backing tensor representations: dense and group-quantized KV.
//!
//! A [`Layer`] is a tagged variant rather than a trait object hierarchy: the
//! shape difference between `Dense` and `Quantized` storage (growable
//! padded buffers vs. exact-length packed groups) is significant enough
//! that dispatching on the tag reads more plainly than virtual calls, and
//! it keeps both shapes `Sized` and easy to move in and out of a
//! [`super::entry::CacheEntry`].

use half::f16;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LayerError {
    #[error("trim({n}) exceeds live offset {offset}")]
    TrimExceedsOffset { n: usize, offset: usize },

    #[error("trim to offset {new_offset} is not a multiple of group_size {group_size}; boundary is unquantizable without retained raw keys")]
    UnalignedQuantizedTrim {
        new_offset: usize,
        group_size: usize,
    },

    #[error("append tile length {got} does not match expected {expected} (kv_heads * s_new * head_dim)")]
    AppendShapeMismatch { got: usize, expected: usize },
}

/// One transformer layer's KV cache, in either backing representation.
#[derive(Debug)]
pub enum Layer {
    Dense(DenseLayer),
    Quantized(QuantizedLayer),
}

impl Layer {
    pub fn append(&mut self, k_new: &[f32], v_new: &[f32], s_new: usize) -> Result<(), LayerError> {
        match self {
            Layer::Dense(d) => d.append(k_new, v_new, s_new),
            Layer::Quantized(q) => q.append(k_new, v_new, s_new),
        }
    }

    /// Remove the last `n` live positions. Returns the count actually
    /// removed, which is always `n` on success; a non-aligned quantized
    /// trim is a hard error (cache miss), never a silent partial trim.
    pub fn trim(&mut self, n: usize) -> Result<usize, LayerError> {
        match self {
            Layer::Dense(d) => d.trim(n),
            Layer::Quantized(q) => q.trim(n),
        }
    }

    pub fn size_bytes(&self) -> usize {
        match self {
            Layer::Dense(d) => d.size_bytes(),
            Layer::Quantized(q) => q.size_bytes(),
        }
    }

    pub fn current_tokens(&self) -> usize {
        match self {
            Layer::Dense(d) => d.offset,
            Layer::Quantized(q) => q.offset,
        }
    }

    pub fn is_trimmable(&self) -> bool {
        true
    }

    pub fn is_dense(&self) -> bool {
        matches!(self, Layer::Dense(_))
    }
}

/// Dense KV storage: `[batch=1, kv_heads, capacity, head_dim]`, only the
/// first `offset` positions along the token axis are live.
#[derive(Debug)]
pub struct DenseLayer {
    /// Per-head K buffers, each `capacity * head_dim` elements, token-major.
    pub k: Vec<Vec<f32>>,
    pub v: Vec<Vec<f32>>,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub capacity: usize,
    pub offset: usize,
    pub step: usize,
}

impl DenseLayer {
    pub fn new(kv_heads: usize, head_dim: usize, step: usize) -> Self {
        Self {
            k: vec![Vec::new(); kv_heads],
            v: vec![Vec::new(); kv_heads],
            kv_heads,
            head_dim,
            capacity: 0,
            offset: 0,
            step,
        }
    }

    /// `k_new`/`v_new` are token-major tiles concatenated per head:
    /// `kv_heads * s_new * head_dim` elements each.
    fn append(&mut self, k_new: &[f32], v_new: &[f32], s_new: usize) -> Result<(), LayerError> {
        let expected = self.kv_heads * s_new * self.head_dim;
        if k_new.len() != expected || v_new.len() != expected {
            return Err(LayerError::AppendShapeMismatch {
                got: k_new.len(),
                expected,
            });
        }

        if self.offset + s_new > self.capacity {
            let grow_blocks = (s_new as f64 / self.step as f64).ceil() as usize;
            let new_capacity = self.capacity + grow_blocks * self.step;
            for head in 0..self.kv_heads {
                self.k[head].resize(new_capacity * self.head_dim, 0.0);
                self.v[head].resize(new_capacity * self.head_dim, 0.0);
            }
            self.capacity = new_capacity;
        }

        for head in 0..self.kv_heads {
            let tile_start = head * s_new * self.head_dim;
            let tile_end = tile_start + s_new * self.head_dim;
            let dst_start = self.offset * self.head_dim;
            let dst_end = dst_start + s_new * self.head_dim;
            self.k[head][dst_start..dst_end].copy_from_slice(&k_new[tile_start..tile_end]);
            self.v[head][dst_start..dst_end].copy_from_slice(&v_new[tile_start..tile_end]);
        }

        self.offset += s_new;
        Ok(())
    }

    fn trim(&mut self, n: usize) -> Result<usize, LayerError> {
        if n > self.offset {
            return Err(LayerError::TrimExceedsOffset {
                n,
                offset: self.offset,
            });
        }
        self.offset -= n;
        Ok(n)
    }

    fn size_bytes(&self) -> usize {
        self.kv_heads * self.capacity * self.head_dim * 2 * std::mem::size_of::<f32>()
    }
}

/// Per-head-dimension group-quantized buffer for one tensor (K or V).
#[derive(Debug, Default, Clone)]
struct QuantizedHead {
    /// Packed values for complete groups, laid out `[head_dim][packed bytes]`.
    packed: Vec<Vec<u8>>,
    scales: Vec<Vec<f16>>,
    biases: Vec<Vec<f16>>,
    /// Raw values for the still-open trailing group, `[head_dim][< group_size]`.
    pending: Vec<Vec<f32>>,
}

impl QuantizedHead {
    fn new(head_dim: usize) -> Self {
        Self {
            packed: vec![Vec::new(); head_dim],
            scales: vec![Vec::new(); head_dim],
            biases: vec![Vec::new(); head_dim],
            pending: vec![Vec::new(); head_dim],
        }
    }

    fn complete_groups(&self, dim: usize) -> usize {
        self.scales[dim].len()
    }

    fn size_bytes(&self) -> usize {
        let packed: usize = self.packed.iter().map(|p| p.len()).sum();
        let stats: usize = self
            .scales
            .iter()
            .chain(self.biases.iter())
            .map(|s| s.len() * std::mem::size_of::<f16>())
            .sum();
        let pending: usize = self
            .pending
            .iter()
            .map(|p| p.len() * std::mem::size_of::<f32>())
            .sum();
        packed + stats + pending
    }
}

/// Group-quantized KV storage. `offset` is the exact live token count;
/// there is no growth slack (unlike `DenseLayer::capacity`).
#[derive(Debug)]
pub struct QuantizedLayer {
    k_heads: Vec<QuantizedHead>,
    v_heads: Vec<QuantizedHead>,
    pub kv_heads: usize,
    pub head_dim: usize,
    pub offset: usize,
    pub group_size: usize,
    pub bits: u8,
}

impl QuantizedLayer {
    pub fn new(kv_heads: usize, head_dim: usize, group_size: usize, bits: u8) -> Self {
        Self {
            k_heads: (0..kv_heads).map(|_| QuantizedHead::new(head_dim)).collect(),
            v_heads: (0..kv_heads).map(|_| QuantizedHead::new(head_dim)).collect(),
            kv_heads,
            head_dim,
            offset: 0,
            group_size,
            bits,
        }
    }

    /// Build a quantized layer from a fully materialized dense slice
    /// `[..offset]`, used by the quantization promoter.
    pub fn from_dense(dense: &DenseLayer, group_size: usize, bits: u8) -> Self {
        let mut layer = Self::new(dense.kv_heads, dense.head_dim, group_size, bits);
        // Feed the dense layer's live data through append in exactly the
        // token order it was written, so the same group-boundary logic
        // that runs during live decode governs the one-shot conversion.
        for head in 0..dense.kv_heads {
            for t in 0..dense.offset {
                for d in 0..dense.head_dim {
                    let idx = t * dense.head_dim + d;
                    layer.k_heads[head].pending[d].push(dense.k[head][idx]);
                    layer.v_heads[head].pending[d].push(dense.v[head][idx]);
                }
            }
        }
        layer.offset = dense.offset;
        for head in 0..dense.kv_heads {
            for d in 0..dense.head_dim {
                flush_complete_groups(&mut layer.k_heads[head], d, group_size, bits);
                flush_complete_groups(&mut layer.v_heads[head], d, group_size, bits);
            }
        }
        layer
    }

    fn append(&mut self, k_new: &[f32], v_new: &[f32], s_new: usize) -> Result<(), LayerError> {
        let expected = self.kv_heads * s_new * self.head_dim;
        if k_new.len() != expected || v_new.len() != expected {
            return Err(LayerError::AppendShapeMismatch {
                got: k_new.len(),
                expected,
            });
        }

        for head in 0..self.kv_heads {
            let tile_start = head * s_new * self.head_dim;
            for t in 0..s_new {
                for d in 0..self.head_dim {
                    let idx = tile_start + t * self.head_dim + d;
                    self.k_heads[head].pending[d].push(k_new[idx]);
                    self.v_heads[head].pending[d].push(v_new[idx]);
                }
            }
            for d in 0..self.head_dim {
                flush_complete_groups(&mut self.k_heads[head], d, self.group_size, self.bits);
                flush_complete_groups(&mut self.v_heads[head], d, self.group_size, self.bits);
            }
        }

        self.offset += s_new;
        Ok(())
    }

    fn trim(&mut self, n: usize) -> Result<usize, LayerError> {
        if n > self.offset {
            return Err(LayerError::TrimExceedsOffset {
                n,
                offset: self.offset,
            });
        }
        let new_offset = self.offset - n;
        if new_offset % self.group_size != 0 {
            return Err(LayerError::UnalignedQuantizedTrim {
                new_offset,
                group_size: self.group_size,
            });
        }
        let keep_groups = new_offset / self.group_size;
        for head in 0..self.kv_heads {
            for d in 0..self.head_dim {
                truncate_groups(&mut self.k_heads[head], d, keep_groups, self.group_size, self.bits);
                truncate_groups(&mut self.v_heads[head], d, keep_groups, self.group_size, self.bits);
            }
        }
        self.offset = new_offset;
        Ok(n)
    }

    fn size_bytes(&self) -> usize {
        self.k_heads.iter().map(|h| h.size_bytes()).sum::<usize>()
            + self.v_heads.iter().map(|h| h.size_bytes()).sum::<usize>()
    }
}

fn packed_byte_len(n_values: usize, bits: u8) -> usize {
    match bits {
        8 => n_values,
        4 => n_values.div_ceil(2),
        _ => unreachable!("kv_bits is validated to be 4 or 8 at the server boundary"),
    }
}

fn quantize_group(values: &[f32], bits: u8) -> (Vec<u8>, f16, f16) {
    let min = values.iter().copied().fold(f32::INFINITY, f32::min);
    let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let levels = (1u32 << bits) - 1;
    let scale = if max > min { (max - min) / levels as f32 } else { 1.0 };
    let bias = min;

    let codes: Vec<u8> = values
        .iter()
        .map(|&x| (((x - bias) / scale).round().clamp(0.0, levels as f32)) as u8)
        .collect();

    let packed = match bits {
        8 => codes,
        4 => codes
            .chunks(2)
            .map(|pair| {
                let hi = pair[0] & 0x0F;
                let lo = pair.get(1).copied().unwrap_or(0) & 0x0F;
                (hi << 4) | lo
            })
            .collect(),
        _ => unreachable!("kv_bits is validated to be 4 or 8 at the server boundary"),
    };

    (packed, f16::from_f32(scale), f16::from_f32(bias))
}

#[allow(dead_code)]
fn dequantize_group(packed: &[u8], scale: f16, bias: f16, bits: u8, count: usize) -> Vec<f32> {
    let scale = scale.to_f32();
    let bias = bias.to_f32();
    let codes: Vec<u8> = match bits {
        8 => packed.to_vec(),
        4 => packed
            .iter()
            .flat_map(|&b| [b >> 4, b & 0x0F])
            .take(count)
            .collect(),
        _ => unreachable!("kv_bits is validated to be 4 or 8 at the server boundary"),
    };
    codes.into_iter().map(|c| c as f32 * scale + bias).collect()
}

/// Drain complete groups out of `head.pending[dim]` into packed storage.
fn flush_complete_groups(head: &mut QuantizedHead, dim: usize, group_size: usize, bits: u8) {
    while head.pending[dim].len() >= group_size {
        let group: Vec<f32> = head.pending[dim].drain(..group_size).collect();
        let (packed, scale, bias) = quantize_group(&group, bits);
        head.packed[dim].extend_from_slice(&packed);
        head.scales[dim].push(scale);
        head.biases[dim].push(bias);
    }
}

/// Truncate a head-dim's stored groups down to `keep_groups`, dropping the
/// (now-stale) pending tail entirely (the caller has already verified the
/// new offset lands on a group boundary).
fn truncate_groups(
    head: &mut QuantizedHead,
    dim: usize,
    keep_groups: usize,
    group_size: usize,
    bits: u8,
) {
    head.scales[dim].truncate(keep_groups);
    head.biases[dim].truncate(keep_groups);
    let packed_len = packed_byte_len(keep_groups * group_size, bits);
    head.packed[dim].truncate(packed_len);
    head.pending[dim].clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(kv_heads: usize, head_dim: usize, step: usize) -> DenseLayer {
        DenseLayer::new(kv_heads, head_dim, step)
    }

    #[test]
    fn dense_append_grows_capacity_in_steps() {
        let mut d = dense(2, 4, 256);
        let tile: Vec<f32> = vec![1.0; 2 * 10 * 4];
        d.append(&tile, &tile, 10).unwrap();
        assert_eq!(d.offset, 10);
        assert_eq!(d.capacity, 256);

        let tile2: Vec<f32> = vec![2.0; 2 * 300 * 4];
        d.append(&tile2, &tile2, 300).unwrap();
        assert_eq!(d.offset, 310);
        assert_eq!(d.capacity, 512); // ceil(300/256)*256 + 256
    }

    #[test]
    fn dense_trim_is_offset_only() {
        let mut d = dense(1, 2, 256);
        let tile: Vec<f32> = vec![1.0; 1 * 5 * 2];
        d.append(&tile, &tile, 5).unwrap();
        let cap_before = d.capacity;
        let removed = d.trim(2).unwrap();
        assert_eq!(removed, 2);
        assert_eq!(d.offset, 3);
        assert_eq!(d.capacity, cap_before); // no realloc
    }

    #[test]
    fn dense_trim_rejects_too_large_n() {
        let mut d = dense(1, 2, 256);
        let tile: Vec<f32> = vec![1.0; 1 * 3 * 2];
        d.append(&tile, &tile, 3).unwrap();
        assert!(d.trim(4).is_err());
    }

    #[test]
    fn dense_trim_then_trim_zero_is_idempotent() {
        let mut d = dense(1, 2, 256);
        let tile: Vec<f32> = vec![1.0; 1 * 5 * 2];
        d.append(&tile, &tile, 5).unwrap();
        d.trim(2).unwrap();
        let (offset_after, bytes_after) = (d.offset, d.size_bytes());
        d.trim(0).unwrap();
        assert_eq!(d.offset, offset_after);
        assert_eq!(d.size_bytes(), bytes_after);
    }

    fn quantized(kv_heads: usize, head_dim: usize, group_size: usize, bits: u8) -> QuantizedLayer {
        QuantizedLayer::new(kv_heads, head_dim, group_size, bits)
    }

    #[test]
    fn quantized_append_closes_groups_exactly() {
        let mut q = quantized(1, 2, 8, 8);
        let tile: Vec<f32> = (0..16).map(|i| i as f32).collect(); // 8 tokens * 2 dims
        q.append(&tile, &tile, 8).unwrap();
        assert_eq!(q.offset, 8);
        assert_eq!(q.k_heads[0].complete_groups(0), 1);
        assert_eq!(q.k_heads[0].pending[0].len(), 0);
    }

    #[test]
    fn quantized_append_leaves_partial_group_pending() {
        let mut q = quantized(1, 1, 8, 8);
        let tile: Vec<f32> = vec![1.0; 5];
        q.append(&tile, &tile, 5).unwrap();
        assert_eq!(q.offset, 5);
        assert_eq!(q.k_heads[0].complete_groups(0), 0);
        assert_eq!(q.k_heads[0].pending[0].len(), 5);
    }

    #[test]
    fn quantized_trim_on_group_boundary_succeeds() {
        let mut q = quantized(1, 1, 8, 8);
        let tile: Vec<f32> = vec![1.0; 16];
        q.append(&tile, &tile, 16).unwrap();
        assert_eq!(q.offset, 16);
        let removed = q.trim(8).unwrap();
        assert_eq!(removed, 8);
        assert_eq!(q.offset, 8);
        assert_eq!(q.k_heads[0].complete_groups(0), 1);
    }

    #[test]
    fn quantized_trim_off_boundary_is_rejected() {
        let mut q = quantized(1, 1, 8, 8);
        let tile: Vec<f32> = vec![1.0; 16];
        q.append(&tile, &tile, 16).unwrap();
        assert!(q.trim(3).is_err());
        // Rejected trim must not mutate state.
        assert_eq!(q.offset, 16);
    }

    #[test]
    fn quantize_roundtrip_is_close() {
        let values = vec![0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0, 7.0];
        let (packed, scale, bias) = quantize_group(&values, 8);
        let back = dequantize_group(&packed, scale, bias, 8, values.len());
        for (a, b) in values.iter().zip(back.iter()) {
            assert!((a - b).abs() < 0.1, "{a} vs {b}");
        }
    }

    #[test]
    fn from_dense_matches_live_append_group_count() {
        let mut d = dense(1, 1, 256);
        let tile: Vec<f32> = (0..20).map(|i| i as f32).collect();
        d.append(&tile, &tile, 20).unwrap();

        let q = QuantizedLayer::from_dense(&d, 8, 8);
        assert_eq!(q.offset, 20);
        assert_eq!(q.k_heads[0].complete_groups(0), 2);
        assert_eq!(q.k_heads[0].pending[0].len(), 4);
    }
}
