use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{ops::log_softmax, VarBuilder};

use crate::{
    config::ModelConfig, decoder::Decoder, embeddings::input_embedding::InputEmbedding,
    encoder::Encoder, projection_layer::ProjectionLayer, utils::padding_bias,
};

/// T5 encoder-decoder with a language-modelling head. Variable names match the published
/// checkpoints (`shared`, `encoder.block.{i}.layer.{j}...`, `decoder...`, `lm_head`) so a
/// `model.safetensors` file can be loaded straight into the `VarMap` backing `vb`.
pub struct Transformer {
    shared: InputEmbedding,
    encoder: Encoder,
    decoder: Decoder,
    projection_layer: ProjectionLayer,
    config: ModelConfig,
    dtype: DType,
}

impl Transformer {
    /// `dtype` is the activation dtype; variables are created with the dtype of `vb`.
    pub fn new(config: &ModelConfig, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let shared =
            InputEmbedding::new(config.vocab_size, config.d_model, dtype, vb.pp("shared"))?;
        let encoder = Encoder::new(config, vb.pp("encoder"))?;
        let decoder = Decoder::new(config, vb.pp("decoder"))?;
        let projection_layer = if config.tie_word_embeddings {
            ProjectionLayer::tied(shared.weight(), config.d_model)
        } else {
            ProjectionLayer::untied(config.d_model, config.vocab_size, vb.clone())?
        };

        Ok(Self {
            shared,
            encoder,
            decoder,
            projection_layer,
            config: config.clone(),
            dtype,
        })
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    /// (batch, src_len) ids and mask --> (batch, src_len, d_model)
    pub fn encode(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mask_bias = padding_bias(attention_mask, self.dtype)?;
        self.encoder
            .forward(&self.shared.forward(input_ids)?, &mask_bias, train)
    }

    /// Logits `(batch, tgt_len, vocab_size)` in f32 for every decoder position.
    pub fn decode(
        &self,
        decoder_input_ids: &Tensor,
        encoder_output: &Tensor,
        attention_mask: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let mask_bias = padding_bias(attention_mask, self.dtype)?;
        let decoder_output = self.decoder.forward(
            &self.shared.forward(decoder_input_ids)?,
            encoder_output,
            &mask_bias,
            train,
        )?;
        self.projection_layer.forward(&decoder_output)
    }

    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: &Tensor,
        decoder_input_ids: &Tensor,
        train: bool,
    ) -> Result<Tensor> {
        let encoder_output = self.encode(input_ids, attention_mask, train)?;
        self.decode(decoder_input_ids, &encoder_output, attention_mask, train)
    }
}

/// Mean token cross-entropy over the positions where `label_weights` is 1.
///
/// `logits`: (batch, tgt_len, vocab) f32, `targets`: (batch, tgt_len) u32 with ignored
/// positions holding any valid id, `label_weights`: (batch, tgt_len) f32 of 0/1.
pub fn masked_cross_entropy(
    logits: &Tensor,
    targets: &Tensor,
    label_weights: &Tensor,
) -> Result<Tensor> {
    let (batch_size, tgt_len, vocab_size) = logits.dims3()?;
    let n = batch_size * tgt_len;
    let log_probs = log_softmax(&logits.reshape((n, vocab_size))?, D::Minus1)?;
    let picked = log_probs
        .gather(&targets.reshape((n, 1))?, 1)?
        .reshape(n)?;
    let weights = label_weights.reshape(n)?;
    let count = weights.sum_all()?.to_scalar::<f32>()?.max(1.0);
    (picked * weights)?.sum_all()?.affine(-1.0 / count as f64, 0.)
}

#[cfg(test)]
mod tests {
    use candle_core::{Device, Var};
    use candle_nn::VarMap;

    use super::*;

    fn tiny_model(varmap: &VarMap) -> Transformer {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        Transformer::new(&ModelConfig::tiny(20), DType::F32, vb).unwrap()
    }

    #[test]
    fn test_transformer_forward_shapes() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let device = Device::Cpu;

        let input_ids = Tensor::new(&[[5u32, 6, 7, 1], [8, 9, 1, 0]], &device).unwrap();
        let attention_mask = Tensor::new(&[[1u32, 1, 1, 1], [1, 1, 1, 0]], &device).unwrap();
        let decoder_input_ids = Tensor::new(&[[0u32, 10, 11], [0, 12, 1]], &device).unwrap();

        let encoder_output = model.encode(&input_ids, &attention_mask, false).unwrap();
        assert_eq!(encoder_output.dims(), &[2, 4, 16]);

        let logits = model
            .forward(&input_ids, &attention_mask, &decoder_input_ids, false)
            .unwrap();
        assert_eq!(logits.dims(), &[2, 3, 20]);
        assert_eq!(logits.dtype(), DType::F32);
    }

    #[test]
    fn test_checkpoint_variable_names() {
        let varmap = VarMap::new();
        let _model = tiny_model(&varmap);
        let data = varmap.data().lock().unwrap();
        for name in [
            "shared.weight",
            "encoder.block.0.layer.0.SelfAttention.q.weight",
            "encoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
            "encoder.block.0.layer.0.layer_norm.weight",
            "encoder.block.1.layer.1.DenseReluDense.wi.weight",
            "encoder.final_layer_norm.weight",
            "decoder.block.0.layer.0.SelfAttention.relative_attention_bias.weight",
            "decoder.block.1.layer.1.EncDecAttention.o.weight",
            "decoder.block.1.layer.2.DenseReluDense.wo.weight",
            "decoder.final_layer_norm.weight",
        ] {
            assert!(data.contains_key(name), "missing {name}");
        }
        for shared_bias in [
            "encoder.block.1.layer.0.SelfAttention.relative_attention_bias.weight",
            "decoder.block.0.layer.1.EncDecAttention.relative_attention_bias.weight",
        ] {
            assert!(!data.contains_key(shared_bias));
        }
        assert!(!data.contains_key("lm_head.weight"));
    }

    #[test]
    fn test_padding_does_not_change_encoding() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let device = Device::Cpu;

        let short = model
            .encode(
                &Tensor::new(&[[5u32, 6, 1]], &device).unwrap(),
                &Tensor::new(&[[1u32, 1, 1]], &device).unwrap(),
                false,
            )
            .unwrap();
        let padded = model
            .encode(
                &Tensor::new(&[[5u32, 6, 1, 0, 0]], &device).unwrap(),
                &Tensor::new(&[[1u32, 1, 1, 0, 0]], &device).unwrap(),
                false,
            )
            .unwrap()
            .narrow(1, 0, 3)
            .unwrap();
        let diff = (short - padded)
            .unwrap()
            .abs()
            .unwrap()
            .max_keepdim(2)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();
        assert!(diff.iter().all(|d| *d < 1e-4), "{diff:?}");
    }

    #[test]
    fn test_masked_cross_entropy_ignores_masked_positions() {
        let device = Device::Cpu;
        // uniform logits over 4 classes: every kept position costs ln(4)
        let logits = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let targets = Tensor::new(&[[1u32, 2, 0]], &device).unwrap();
        let weights = Tensor::new(&[[1f32, 1., 0.]], &device).unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &weights)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap();
        assert!((loss - 4f32.ln()).abs() < 1e-6);
    }

    #[test]
    fn test_loss_backpropagates_to_shared_embedding() {
        let varmap = VarMap::new();
        let model = tiny_model(&varmap);
        let device = Device::Cpu;

        let input_ids = Tensor::new(&[[5u32, 6, 1]], &device).unwrap();
        let attention_mask = Tensor::new(&[[1u32, 1, 1]], &device).unwrap();
        let decoder_input_ids = Tensor::new(&[[0u32, 7]], &device).unwrap();
        let targets = Tensor::new(&[[7u32, 1]], &device).unwrap();
        let weights = Tensor::new(&[[1f32, 1.]], &device).unwrap();

        let logits = model
            .forward(&input_ids, &attention_mask, &decoder_input_ids, true)
            .unwrap();
        let loss = masked_cross_entropy(&logits, &targets, &weights).unwrap();
        assert!(loss.to_scalar::<f32>().unwrap().is_finite());

        let grads = loss.backward().unwrap();
        let data = varmap.data().lock().unwrap();
        let shared: &Var = data.get("shared.weight").unwrap();
        assert!(grads.get(shared.as_tensor()).is_some());
    }
}
