use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Hyperparameters of the fine-tuning run. Field names follow the keys written to
/// `training_args.json` so checkpoints can be inspected with the usual tooling.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingArgs {
    pub output_dir: PathBuf,
    pub num_train_epochs: usize,
    pub per_device_train_batch_size: usize,
    pub per_device_eval_batch_size: usize,
    pub learning_rate: f64,
    pub weight_decay: f64,
    pub adam_beta1: f64,
    pub adam_beta2: f64,
    pub adam_epsilon: f64,
    pub max_grad_norm: f64,
    pub fp16: bool,
    pub logging_steps: usize,
    pub save_steps: usize,
    pub save_total_limit: Option<usize>,
    pub generation_max_length: usize,
    pub push_to_hub: bool,
    pub hub_model_id: Option<String>,
    /// Seeds the per-epoch shuffle of the training set.
    pub seed: u64,
}

impl Default for TrainingArgs {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("t5_small_ko_en_translation"),
            num_train_epochs: 2,
            per_device_train_batch_size: 16,
            per_device_eval_batch_size: 16,
            learning_rate: 2e-5,
            weight_decay: 0.01,
            adam_beta1: 0.9,
            adam_beta2: 0.999,
            adam_epsilon: 1e-8,
            max_grad_norm: 1.0,
            fp16: true,
            logging_steps: 500,
            save_steps: 500,
            save_total_limit: Some(3),
            generation_max_length: 20,
            push_to_hub: true,
            hub_model_id: None,
            seed: 42,
        }
    }
}

impl TrainingArgs {
    pub fn validate(&self) -> Result<()> {
        if self.per_device_train_batch_size == 0 || self.per_device_eval_batch_size == 0 {
            return Err(Error::Config("batch size must be positive".to_string()));
        }
        if self.generation_max_length < 2 {
            return Err(Error::Config(
                "generation_max_length must leave room for at least one token".to_string(),
            ));
        }
        Ok(())
    }
}

/// Sampling settings for the final translation.
#[derive(Debug, Clone)]
pub struct InferenceArgs {
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub top_k: usize,
    pub top_p: f64,
    pub seed: Option<u64>,
}

impl Default for InferenceArgs {
    fn default() -> Self {
        Self {
            max_new_tokens: 40,
            min_new_tokens: 0,
            top_k: 30,
            top_p: 0.95,
            seed: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub data_path: PathBuf,
    pub has_header: bool,
    pub checkpoint: String,
    pub src_lang: String,
    pub tgt_lang: String,
    pub max_length: usize,
    pub test_size: f64,
    pub split_seed: Option<u64>,
    pub cpu: bool,
    pub training: TrainingArgs,
    pub inference: InferenceArgs,
    pub sample_text: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("data/ko_en_parallel.csv"),
            has_header: true,
            checkpoint: "google-t5/t5-small".to_string(),
            src_lang: "ko".to_string(),
            tgt_lang: "en".to_string(),
            max_length: 128,
            test_size: 0.2,
            split_seed: None,
            cpu: false,
            training: TrainingArgs::default(),
            inference: InferenceArgs::default(),
            sample_text: "오늘 날씨가 정말 좋네요.".to_string(),
        }
    }
}

impl Config {
    /// Instruction prepended to every source sentence, e.g. `translate Korean to English: `.
    pub fn prefix(&self) -> String {
        format!(
            "translate {} to {}: ",
            language_name(&self.src_lang),
            language_name(&self.tgt_lang)
        )
    }
}

pub fn language_name(code: &str) -> &str {
    match code {
        "ko" => "Korean",
        "en" => "English",
        "fr" => "French",
        "de" => "German",
        "ro" => "Romanian",
        "ja" => "Japanese",
        "zh" => "Chinese",
        other => other,
    }
}

fn default_max_distance() -> usize {
    128
}

fn default_true() -> bool {
    true
}

fn default_feed_forward_proj() -> String {
    "relu".to_string()
}

/// The subset of a T5 `config.json` the model needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub d_model: usize,
    pub d_kv: usize,
    pub d_ff: usize,
    pub num_layers: usize,
    #[serde(default)]
    pub num_decoder_layers: Option<usize>,
    pub num_heads: usize,
    pub relative_attention_num_buckets: usize,
    #[serde(default = "default_max_distance")]
    pub relative_attention_max_distance: usize,
    pub dropout_rate: f64,
    pub layer_norm_epsilon: f64,
    #[serde(default = "default_feed_forward_proj")]
    pub feed_forward_proj: String,
    #[serde(default = "default_true")]
    pub tie_word_embeddings: bool,
    pub pad_token_id: u32,
    pub eos_token_id: u32,
    #[serde(default)]
    pub decoder_start_token_id: u32,
}

impl ModelConfig {
    pub fn decoder_layers(&self) -> usize {
        self.num_decoder_layers.unwrap_or(self.num_layers)
    }

    pub fn inner_dim(&self) -> usize {
        self.num_heads * self.d_kv
    }

    pub fn is_gated(&self) -> bool {
        self.feed_forward_proj.starts_with("gated")
    }

    /// A small configuration for tests and smoke runs.
    #[cfg(test)]
    pub fn tiny(vocab_size: usize) -> Self {
        Self {
            vocab_size,
            d_model: 16,
            d_kv: 4,
            d_ff: 32,
            num_layers: 2,
            num_decoder_layers: None,
            num_heads: 4,
            relative_attention_num_buckets: 8,
            relative_attention_max_distance: 16,
            dropout_rate: 0.1,
            layer_norm_epsilon: 1e-6,
            feed_forward_proj: "relu".to_string(),
            tie_word_embeddings: true,
            pad_token_id: 0,
            eos_token_id: 1,
            decoder_start_token_id: 0,
        }
    }
}
