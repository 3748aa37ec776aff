use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

/// Maps a relative position (`key_pos - query_pos`) to one of `num_buckets` buckets.
///
/// Small distances get their own bucket, larger ones share logarithmically sized buckets up
/// to `max_distance`. In the bidirectional case half of the buckets are reserved for keys
/// to the right of the query.
pub fn relative_position_bucket(
    relative_position: i64,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
) -> u32 {
    let mut num_buckets = num_buckets as i64;
    let mut bucket = 0i64;
    let distance = if bidirectional {
        num_buckets /= 2;
        if relative_position > 0 {
            bucket += num_buckets;
        }
        relative_position.abs()
    } else {
        -relative_position.min(0)
    };

    let max_exact = num_buckets / 2;
    if distance < max_exact {
        bucket += distance;
    } else {
        let scaled = (distance as f32 / max_exact as f32).ln()
            / (max_distance as f32 / max_exact as f32).ln()
            * (num_buckets - max_exact) as f32;
        let large = (max_exact + scaled as i64).min(num_buckets - 1);
        bucket += large;
    }
    bucket as u32
}

/// Learned per-head attention bias indexed by relative position bucket. Only the first
/// block of each stack owns one; later blocks reuse the bias it produces.
pub struct PositionalEmbedding {
    embedding: Embedding,
    bidirectional: bool,
    num_buckets: usize,
    max_distance: usize,
}

impl PositionalEmbedding {
    pub fn new(
        num_buckets: usize,
        max_distance: usize,
        num_heads: usize,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let embedding = embedding(num_buckets, num_heads, vb)?;
        Ok(Self {
            embedding,
            bidirectional,
            num_buckets,
            max_distance,
        })
    }

    /// Bias of shape `(1, num_heads, query_len, key_len)`.
    pub fn bias(
        &self,
        query_len: usize,
        key_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        let buckets: Vec<u32> = (0..query_len)
            .flat_map(|q| {
                (0..key_len).map(move |k| {
                    relative_position_bucket(
                        k as i64 - q as i64,
                        self.bidirectional,
                        self.num_buckets,
                        self.max_distance,
                    )
                })
            })
            .collect();
        let buckets = Tensor::from_vec(buckets, (query_len, key_len), device)?;
        self.embedding
            .forward(&buckets)? // (query_len, key_len, num_heads)
            .permute((2, 0, 1))?
            .unsqueeze(0)?
            .to_dtype(dtype)
    }
}
