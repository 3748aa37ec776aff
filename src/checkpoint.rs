use std::{
    fs,
    path::{Path, PathBuf},
};

use candle_core::{DType, Device};
use candle_nn::{VarBuilder, VarMap};
use hf_hub::api::sync::Api;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    config::{ModelConfig, TrainingArgs},
    error::{Error, Result},
    tokenizer_helper::load_tokenizer,
    transformer::Transformer,
};

pub const CONFIG_NAME: &str = "config.json";
pub const TOKENIZER_NAME: &str = "tokenizer.json";
pub const WEIGHTS_NAME: &str = "model.safetensors";
pub const GENERATION_CONFIG_NAME: &str = "generation_config.json";
pub const TRAINING_ARGS_NAME: &str = "training_args.json";
pub const TRAINER_STATE_NAME: &str = "trainer_state.json";
pub const CHECKPOINT_PREFIX: &str = "checkpoint-";

/// The three files a model directory (local or on the hub) has to provide.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub config: PathBuf,
    pub tokenizer: PathBuf,
    pub weights: PathBuf,
}

impl ModelFiles {
    /// `checkpoint` is either a local directory or a hub model id like `google-t5/t5-small`.
    pub fn resolve(checkpoint: &str) -> Result<Self> {
        let local = Path::new(checkpoint);
        if local.is_dir() {
            return Self::from_dir(local);
        }

        info!(checkpoint, "fetching model files from the hub");
        let repo = Api::new()?.model(checkpoint.to_string());
        Ok(Self {
            config: repo.get(CONFIG_NAME)?,
            tokenizer: repo.get(TOKENIZER_NAME)?,
            weights: repo.get(WEIGHTS_NAME)?,
        })
    }

    pub fn from_dir(dir: &Path) -> Result<Self> {
        let files = Self {
            config: dir.join(CONFIG_NAME),
            tokenizer: dir.join(TOKENIZER_NAME),
            weights: dir.join(WEIGHTS_NAME),
        };
        for path in [&files.config, &files.tokenizer, &files.weights] {
            if !path.is_file() {
                return Err(Error::Config(format!("{} not found", path.display())));
            }
        }
        Ok(files)
    }

    pub fn model_config(&self) -> Result<ModelConfig> {
        let file = fs::File::open(&self.config)?;
        Ok(serde_json::from_reader(file)?)
    }

    pub fn tokenizer(&self) -> Result<Tokenizer> {
        load_tokenizer(&self.tokenizer)
    }
}

/// Builds the model with f32 variables and fills them from `weights`.
pub fn load_model(
    config: &ModelConfig,
    weights: &Path,
    dtype: DType,
    device: &Device,
) -> Result<(VarMap, Transformer)> {
    let varmap = VarMap::new();
    let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
    let model = Transformer::new(config, dtype, vb)?;
    load_weights(&varmap, weights, device)?;
    Ok((varmap, model))
}

/// Every variable of `varmap` must be present in the file; extra tensors are ignored.
pub fn load_weights(varmap: &VarMap, weights: &Path, device: &Device) -> Result<()> {
    let tensors = candle_core::safetensors::load(weights, device)?;
    let vars = varmap
        .data()
        .lock()
        .map_err(|e| Error::Config(e.to_string()))?;
    for (name, var) in vars.iter() {
        let tensor = tensors.get(name).ok_or_else(|| {
            Error::Config(format!("{} is missing from {}", name, weights.display()))
        })?;
        var.set(&tensor.to_dtype(var.dtype())?)?;
    }
    debug!(tensors = vars.len(), path = %weights.display(), "loaded weights");
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: usize,
    pub epoch: f64,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub learning_rate: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eval_loss: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eval_bleu: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub eval_gen_len: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub train_runtime: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainerState {
    pub global_step: usize,
    pub epoch: f64,
    pub max_steps: usize,
    pub num_train_epochs: usize,
    pub log_history: Vec<LogEntry>,
}

/// What a model directory is written from.
pub struct Snapshot<'a> {
    pub varmap: &'a VarMap,
    pub model_config: &'a ModelConfig,
    pub tokenizer: &'a Tokenizer,
    pub args: &'a TrainingArgs,
    pub state: &'a TrainerState,
}

fn write_json(path: &Path, value: &impl Serialize) -> Result<()> {
    let file = fs::File::create(path)?;
    serde_json::to_writer_pretty(file, value)?;
    Ok(())
}

pub fn save_pretrained(dir: &Path, snapshot: &Snapshot) -> Result<()> {
    fs::create_dir_all(dir)?;

    snapshot.varmap.save(dir.join(WEIGHTS_NAME))?;

    let mut config = serde_json::to_value(snapshot.model_config)?;
    if let Some(map) = config.as_object_mut() {
        map.insert("model_type".to_string(), json!("t5"));
        map.insert("architectures".to_string(), json!(["T5ForConditionalGeneration"]));
    }
    write_json(&dir.join(CONFIG_NAME), &config)?;

    write_json(
        &dir.join(GENERATION_CONFIG_NAME),
        &json!({
            "decoder_start_token_id": snapshot.model_config.decoder_start_token_id,
            "eos_token_id": snapshot.model_config.eos_token_id,
            "pad_token_id": snapshot.model_config.pad_token_id,
            "max_length": snapshot.args.generation_max_length,
        }),
    )?;

    snapshot
        .tokenizer
        .save(dir.join(TOKENIZER_NAME), false)
        .map_err(Error::tokenizer)?;
    write_json(&dir.join(TRAINING_ARGS_NAME), snapshot.args)?;
    write_json(&dir.join(TRAINER_STATE_NAME), snapshot.state)?;

    info!(dir = %dir.display(), "model saved");
    Ok(())
}

pub fn checkpoint_dir(output_dir: &Path, step: usize) -> PathBuf {
    output_dir.join(format!("{CHECKPOINT_PREFIX}{step}"))
}

/// `checkpoint-<step>` directories under `output_dir`, oldest step first.
pub fn sorted_checkpoints(output_dir: &Path) -> Result<Vec<PathBuf>> {
    if !output_dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut checkpoints = Vec::new();
    for entry in fs::read_dir(output_dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| name.strip_prefix(CHECKPOINT_PREFIX))
            .and_then(|step| step.parse::<usize>().ok());
        if let (Some(step), true) = (step, path.is_dir()) {
            checkpoints.push((step, path));
        }
    }
    checkpoints.sort_by_key(|(step, _)| *step);
    Ok(checkpoints.into_iter().map(|(_, path)| path).collect())
}

/// Deletes the oldest checkpoints until at most `limit` remain. Returns the removed paths.
pub fn rotate_checkpoints(output_dir: &Path, limit: Option<usize>) -> Result<Vec<PathBuf>> {
    let Some(limit) = limit else {
        return Ok(Vec::new());
    };
    let checkpoints = sorted_checkpoints(output_dir)?;
    let excess = checkpoints.len().saturating_sub(limit);
    let removed: Vec<PathBuf> = checkpoints.into_iter().take(excess).collect();
    for path in &removed {
        info!(path = %path.display(), "deleting older checkpoint");
        fs::remove_dir_all(path)?;
    }
    Ok(removed)
}
