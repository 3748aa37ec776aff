use std::path::Path;

use candle_core::{DType, Device, Tensor};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    checkpoint::{load_model, ModelFiles},
    config::InferenceArgs,
    error::{Error, Result},
    generation::{generate, GenerationConfig, LogitsProcessor},
    tokenizer_helper::decode,
    transformer::Transformer,
};

/// A fine-tuned model and its own tokenizer, loaded back from a saved directory.
pub struct Translator {
    model: Transformer,
    inference_tokenizer: Tokenizer,
    prefix: String,
    device: Device,
}

impl Translator {
    pub fn from_pretrained(dir: impl AsRef<Path>, prefix: &str, device: &Device) -> Result<Self> {
        let files = ModelFiles::from_dir(dir.as_ref())?;
        let model_config = files.model_config()?;
        let inference_tokenizer = files.tokenizer()?;
        let (_, model) = load_model(&model_config, &files.weights, DType::F32, device)?;
        Ok(Self {
            model,
            inference_tokenizer,
            prefix: prefix.to_string(),
            device: device.clone(),
        })
    }

    pub fn translate(&self, text: &str, args: &InferenceArgs) -> Result<String> {
        let config = GenerationConfig {
            min_new_tokens: args.min_new_tokens,
            ..GenerationConfig::top_k_top_p(args.max_new_tokens, args.top_k, args.top_p)
        };
        let mut processor = LogitsProcessor::new(args.seed, config.sampling);
        self.translate_with(text, &config, &mut processor)
    }

    pub fn translate_with(
        &self,
        text: &str,
        config: &GenerationConfig,
        processor: &mut LogitsProcessor,
    ) -> Result<String> {
        let input = format!("{}{}", self.prefix, text);
        let encoding = self
            .inference_tokenizer
            .encode(input, true)
            .map_err(Error::tokenizer)?;
        let input_ids = Tensor::new(encoding.get_ids(), &self.device)?.unsqueeze(0)?;
        let attention_mask =
            Tensor::new(encoding.get_attention_mask(), &self.device)?.unsqueeze(0)?;

        let outputs = generate(&self.model, &input_ids, &attention_mask, config, processor)?;
        let ids = outputs.into_iter().next().unwrap_or_default();
        debug!(?ids, "generated");
        decode(&self.inference_tokenizer, &ids, true)
    }
}
