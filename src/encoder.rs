use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::{
    config::ModelConfig, feed_forward::FeedForward, layer_norm::LayerNormalization,
    multi_head_attention::MultiHeadAttention, residual_connection::ResidualConnection,
};

pub struct EncoderBlock {
    self_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    residual_connections: Vec<ResidualConnection>,
}

impl EncoderBlock {
    pub fn new(
        config: &ModelConfig,
        has_relative_attention_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let (d_model, eps, drop_p) = (
            config.d_model,
            config.layer_norm_epsilon,
            config.dropout_rate as f32,
        );
        let self_attention = MultiHeadAttention::new(
            config,
            has_relative_attention_bias,
            true,
            vb.pp("layer.0").pp("SelfAttention"),
        )?;
        let feed_forward = FeedForward::new(config, vb.pp("layer.1").pp("DenseReluDense"))?;

        let residual_connections = vec![
            ResidualConnection::new(d_model, eps, drop_p, vb.pp("layer.0"))?,
            ResidualConnection::new(d_model, eps, drop_p, vb.pp("layer.1"))?,
        ];

        Ok(Self {
            self_attention,
            feed_forward,
            residual_connections,
        })
    }

    pub fn forward(&self, xs: &Tensor, position_bias: &Tensor, train: bool) -> Result<Tensor> {
        let xs = self.residual_connections[0].forward(
            xs,
            &|xs| self.self_attention.forward(xs, xs, position_bias, train),
            train,
        )?;
        let xs = self.residual_connections[1].forward(
            &xs,
            &|xs| self.feed_forward.forward_t(xs, train),
            train,
        )?;

        Ok(xs)
    }
}

pub struct Encoder {
    blocks: Vec<EncoderBlock>,
    norm: LayerNormalization,
    dropout: Dropout,
}

impl Encoder {
    /// `vb` points at `encoder`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..config.num_layers)
            .map(|i| EncoderBlock::new(config, i == 0, vb.pp(format!("block.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let norm = LayerNormalization::new(
            config.d_model,
            config.layer_norm_epsilon,
            vb.pp("final_layer_norm"),
        )?;
        Ok(Self {
            blocks,
            norm,
            dropout: Dropout::new(config.dropout_rate as f32),
        })
    }

    /// `xs` are the embedded input tokens, `mask_bias` the additive padding bias
    /// `(batch, 1, 1, seq_len)`.
    pub fn forward(&self, xs: &Tensor, mask_bias: &Tensor, train: bool) -> Result<Tensor> {
        let (_, seq_len, _) = xs.dims3()?;
        let position_bias = self.blocks[0]
            .self_attention
            .position_bias(seq_len, seq_len, xs.dtype(), xs.device())?
            .broadcast_add(&mask_bias.to_dtype(xs.dtype())?)?;

        let mut xs = self.dropout.forward_t(xs, train)?;
        for block in &self.blocks {
            xs = block.forward(&xs, &position_bias, train)?;
        }
        let output = self.dropout.forward_t(&self.norm.forward(&xs)?, train)?;
        Ok(output)
    }
}
