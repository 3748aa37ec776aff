use candle_core::{DType, Device, Module, Result, Tensor, D};
use candle_nn::{ops::softmax, Dropout, VarBuilder};

use crate::{
    config::ModelConfig, embeddings::positional_embedding::PositionalEmbedding,
    precision::CastLinear,
};

// T5 folds the 1/sqrt(d_kv) scaling into the initialisation of `q`, so scores are not scaled
// here. `bias` carries both the relative position bias and the additive masks.
fn attention(
    q: &Tensor,
    k: &Tensor,
    v: &Tensor,
    bias: &Tensor,
    dropout: Option<&Dropout>,
    train: bool,
) -> Result<(Tensor, Tensor)> {
    // (batch_sz, num_heads, q_len, k_len) =
    //     (batch_sz, num_heads, q_len, d_kv) * (batch_sz, num_heads, d_kv, k_len)
    let attention_scores = q.matmul(&k.t()?)?;
    let attention_scores = attention_scores.broadcast_add(&bias.to_dtype(q.dtype())?)?;

    let attention_weights =
        softmax(&attention_scores.to_dtype(DType::F32)?, D::Minus1)?.to_dtype(q.dtype())?;

    let attention_weights = match dropout {
        Some(d) => d.forward(&attention_weights, train)?,
        None => attention_weights,
    };

    // (batch_sz, num_heads, q_len, d_kv) =
    //     (batch_sz, num_heads, q_len, k_len) * (batch_sz, num_heads, k_len, d_kv)
    let attention_output = attention_weights.matmul(v)?;

    Ok((attention_output, attention_weights))
}

pub struct MultiHeadAttention {
    w_q: CastLinear,
    w_k: CastLinear,
    w_v: CastLinear,
    w_o: CastLinear,
    relative_attention_bias: Option<PositionalEmbedding>,
    dropout: Dropout,
    num_heads: usize,
    head_size: usize,
}

impl MultiHeadAttention {
    /// `vb` points at `SelfAttention` / `EncDecAttention`.
    pub fn new(
        config: &ModelConfig,
        has_relative_attention_bias: bool,
        bidirectional: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (d_model, inner_dim) = (config.d_model, config.inner_dim());
        let w_q = CastLinear::new(d_model, inner_dim, vb.pp("q"))?;
        let w_k = CastLinear::new(d_model, inner_dim, vb.pp("k"))?;
        let w_v = CastLinear::new(d_model, inner_dim, vb.pp("v"))?;
        let w_o = CastLinear::new(inner_dim, d_model, vb.pp("o"))?;
        let relative_attention_bias = if has_relative_attention_bias {
            Some(PositionalEmbedding::new(
                config.relative_attention_num_buckets,
                config.relative_attention_max_distance,
                config.num_heads,
                bidirectional,
                vb.pp("relative_attention_bias"),
            )?)
        } else {
            None
        };

        Ok(Self {
            w_q,
            w_k,
            w_v,
            w_o,
            relative_attention_bias,
            dropout: Dropout::new(config.dropout_rate as f32),
            num_heads: config.num_heads,
            head_size: config.d_kv,
        })
    }

    /// Relative position bias `(1, num_heads, query_len, key_len)`, zeros for layers without
    /// a learned bias (cross attention).
    pub fn position_bias(
        &self,
        query_len: usize,
        key_len: usize,
        dtype: DType,
        device: &Device,
    ) -> Result<Tensor> {
        match &self.relative_attention_bias {
            Some(bias) => bias.bias(query_len, key_len, dtype, device),
            None => Tensor::zeros((1, self.num_heads, query_len, key_len), dtype, device),
        }
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (batch_size, seq_len, _) = xs.dims3()?;
        // (batch_sz, seq_len, inner_dim) -> (batch_sz, num_heads, seq_len, head_sz)
        xs.reshape((batch_size, seq_len, self.num_heads, self.head_size))?
            .transpose(1, 2)?
            .contiguous()
    }

    pub fn forward(
        &self,
        query: &Tensor,
        key_value: &Tensor,
        bias: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (batch_size, seq_len, _) = query.dims3()?;
        let q = self.split_heads(&self.w_q.forward(query)?)?;
        let k = self.split_heads(&self.w_k.forward(key_value)?)?;
        let v = self.split_heads(&self.w_v.forward(key_value)?)?;

        let (attention_output, _attention_weights) =
            attention(&q, &k, &v, bias, Some(&self.dropout), train)?;

        let attention_output = attention_output // (batch_sz, num_heads, seq_len, head_sz)
            .transpose(1, 2)? // (batch_sz, seq_len, num_heads, head_sz)
            .contiguous()?
            .reshape((batch_size, seq_len, self.num_heads * self.head_size))?
            .apply(&self.w_o)?; // (batch_sz, seq_len, d_model)

        Ok(attention_output)
    }
}

#[cfg(test)]
mod tests {
    use candle_core::{DType, Device, Tensor};
    use candle_nn::{VarBuilder, VarMap};

    use super::*;
    use crate::utils::{causal_bias, padding_bias};

    #[test]
    fn test_attention() {
        let device = Device::Cpu;

        let q = Tensor::from_vec(vec![0.1f32, 0.2, 0.3, 0.4], (1, 1, 1, 4), &device).unwrap();
        let k = q.clone();
        let v = q.clone();

        let bias = causal_bias(1, DType::F32, &device).unwrap();

        let (attention_output, attention_weights) =
            attention(&q, &k, &v, &bias, None, false).unwrap();

        assert_eq!(attention_output.shape(), q.shape());
        assert_eq!(
            attention_weights.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0]
        );
    }

    #[test]
    fn test_padding_gets_no_weight() {
        let device = Device::Cpu;
        let q = Tensor::ones((1, 1, 2, 4), DType::F32, &device).unwrap();
        let k = Tensor::ones((1, 1, 3, 4), DType::F32, &device).unwrap();
        let mask = Tensor::new(&[[1u32, 1, 0]], &device).unwrap();
        let bias = padding_bias(&mask, DType::F32).unwrap();

        let (_, weights) = attention(&q, &k, &k, &bias, None, false).unwrap();
        let weights = weights.reshape((2, 3)).unwrap().to_vec2::<f32>().unwrap();
        for row in weights {
            assert_eq!(row, vec![0.5, 0.5, 0.0]);
        }
    }

    #[test]
    fn test_multi_head_attention_shapes() {
        let device = Device::Cpu;
        let config = ModelConfig::tiny(10);
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let mha = MultiHeadAttention::new(&config, true, true, vb.pp("SelfAttention")).unwrap();

        let xs = Tensor::ones((2, 5, config.d_model), DType::F32, &device).unwrap();
        let bias = mha.position_bias(5, 5, DType::F32, &device).unwrap();
        assert_eq!(bias.dims(), &[1, config.num_heads, 5, 5]);

        let ys = mha.forward(&xs, &xs, &bias, false).unwrap();
        assert_eq!(ys.dims(), &[2, 5, config.d_model]);

        let names = varmap.data().lock().unwrap();
        for name in ["q", "k", "v", "o", "relative_attention_bias"] {
            assert!(names.contains_key(&format!("SelfAttention.{name}.weight")));
        }
    }
}
