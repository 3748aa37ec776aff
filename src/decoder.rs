use candle_core::{Module, ModuleT, Result, Tensor};
use candle_nn::{Dropout, VarBuilder};

use crate::{
    config::ModelConfig, feed_forward::FeedForward, layer_norm::LayerNormalization,
    multi_head_attention::MultiHeadAttention, residual_connection::ResidualConnection,
    utils::causal_bias,
};

pub struct DecoderBlock {
    self_attention: MultiHeadAttention,
    cross_attention: MultiHeadAttention,
    feed_forward: FeedForward,
    residual_connections: Vec<ResidualConnection>,
}

impl DecoderBlock {
    pub fn new(
        config: &ModelConfig,
        has_relative_attention_bias: bool,
        vb: VarBuilder,
    ) -> Result<Self> {
        let self_attention = MultiHeadAttention::new(
            config,
            has_relative_attention_bias,
            false,
            vb.pp("layer.0").pp("SelfAttention"),
        )?;
        let cross_attention =
            MultiHeadAttention::new(config, false, true, vb.pp("layer.1").pp("EncDecAttention"))?;
        let feed_forward = FeedForward::new(config, vb.pp("layer.2").pp("DenseReluDense"))?;

        let residual_connections = (0..3)
            .map(|i| {
                ResidualConnection::new(
                    config.d_model,
                    config.layer_norm_epsilon,
                    config.dropout_rate as f32,
                    vb.pp(format!("layer.{i}")),
                )
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            self_attention,
            cross_attention,
            feed_forward,
            residual_connections,
        })
    }

    pub fn forward(
        &self,
        xs: &Tensor,
        encoder_output: &Tensor,
        self_bias: &Tensor,
        cross_bias: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mut x = xs.clone();
        x = self.residual_connections[0].forward(
            &x,
            &|x| self.self_attention.forward(x, x, self_bias, train),
            train,
        )?;
        x = self.residual_connections[1].forward(
            &x,
            &|x| {
                self.cross_attention
                    .forward(x, encoder_output, cross_bias, train)
            },
            train,
        )?;
        x = self.residual_connections[2].forward(
            &x,
            &|x| self.feed_forward.forward_t(x, train),
            train,
        )?;
        Ok(x)
    }
}

pub struct Decoder {
    blocks: Vec<DecoderBlock>,
    norm: LayerNormalization,
    dropout: Dropout,
}

impl Decoder {
    /// `vb` points at `decoder`.
    pub fn new(config: &ModelConfig, vb: VarBuilder) -> Result<Self> {
        let blocks = (0..config.decoder_layers())
            .map(|i| DecoderBlock::new(config, i == 0, vb.pp(format!("block.{i}"))))
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

    /// `xs` are the embedded decoder inputs, `encoder_mask_bias` the additive padding bias of
    /// the encoder input `(batch, 1, 1, src_len)`.
    pub fn forward(
        &self,
        xs: &Tensor,
        encoder_output: &Tensor,
        encoder_mask_bias: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let (_, tgt_len, _) = xs.dims3()?;
        let (dtype, device) = (xs.dtype(), xs.device());
        let src_len = encoder_output.dims3()?.1;

        let self_bias = self.blocks[0]
            .self_attention
            .position_bias(tgt_len, tgt_len, dtype, device)?
            .broadcast_add(&causal_bias(tgt_len, dtype, device)?)?;
        let cross_bias = self.blocks[0]
            .cross_attention
            .position_bias(tgt_len, src_len, dtype, device)?
            .broadcast_add(&encoder_mask_bias.to_dtype(dtype)?)?;

        let mut x = self.dropout.forward_t(xs, train)?;
        for block in &self.blocks {
            x = block.forward(&x, encoder_output, &self_bias, &cross_bias, train)?;
        }
        let output = self.dropout.forward_t(&self.norm.forward(&x)?, train)?;
        Ok(output)
    }
}
