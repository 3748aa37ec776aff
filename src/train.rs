use std::time::Instant;

use candle_core::{backprop::GradStore, DType, Device, Var};
use candle_nn::{AdamW, Optimizer, ParamsAdamW, VarMap};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    checkpoint::{
        checkpoint_dir, load_model, rotate_checkpoints, save_pretrained, LogEntry, ModelFiles,
        Snapshot, TrainerState,
    },
    config::{Config, ModelConfig, TrainingArgs},
    dataset::{load_records, Preprocessor, Seq2SeqBatcher, TokenizedExample, TranslationDataset},
    error::{Error, Result},
    generation::{generate, GenerationConfig, LogitsProcessor},
    hub::{default_repo_name, push_to_hub},
    metrics::{compute_metrics, TranslationMetrics},
    precision::{compute_dtype, LossScaler},
    transformer::{masked_cross_entropy, Transformer},
    utils::device,
};

/// Linear decay from `base_lr` to 0 over `total_steps`, no warmup.
pub fn linear_schedule(base_lr: f64, step: usize, total_steps: usize) -> f64 {
    if total_steps == 0 {
        return base_lr;
    }
    base_lr * total_steps.saturating_sub(step) as f64 / total_steps as f64
}

/// Layer-norm weights are excluded from weight decay.
fn is_no_decay(name: &str) -> bool {
    name.contains("layer_norm") || name.ends_with(".bias")
}

/// AdamW over two parameter groups sharing everything but the weight decay.
pub struct ParamGroups {
    decay: AdamW,
    no_decay: AdamW,
    vars: Vec<Var>,
}

impl ParamGroups {
    pub fn new(varmap: &VarMap, args: &TrainingArgs) -> Result<Self> {
        let mut named: Vec<(String, Var)> = varmap
            .data()
            .lock()
            .map_err(|e| Error::Config(e.to_string()))?
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        named.sort_by(|a, b| a.0.cmp(&b.0));

        let (no_decay, decay): (Vec<_>, Vec<_>) =
            named.into_iter().partition(|(name, _)| is_no_decay(name));
        debug!(decay = decay.len(), no_decay = no_decay.len(), "parameter groups");

        let params = |weight_decay| ParamsAdamW {
            lr: args.learning_rate,
            beta1: args.adam_beta1,
            beta2: args.adam_beta2,
            eps: args.adam_epsilon,
            weight_decay,
        };
        let decay: Vec<Var> = decay.into_iter().map(|(_, var)| var).collect();
        let no_decay: Vec<Var> = no_decay.into_iter().map(|(_, var)| var).collect();
        let vars = decay.iter().chain(&no_decay).cloned().collect();

        Ok(Self {
            decay: AdamW::new(decay, params(args.weight_decay))?,
            no_decay: AdamW::new(no_decay, params(0.0))?,
            vars,
        })
    }

    pub fn vars(&self) -> &[Var] {
        &self.vars
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        self.decay.set_learning_rate(lr);
        self.no_decay.set_learning_rate(lr);
    }

    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.decay.step(grads)?;
        self.no_decay.step(grads)?;
        Ok(())
    }
}

/// Divides the gradients by the loss scale and clips their global norm to `max_norm`.
///
/// Returns the unscaled norm before clipping, or `None` when a gradient is not finite, in
/// which case the gradients are left untouched.
pub fn unscale_and_clip(
    grads: &mut GradStore,
    vars: &[Var],
    scale: f64,
    max_norm: f64,
) -> Result<Option<f64>> {
    let mut sum_sq = 0f64;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            sum_sq += grad.to_dtype(DType::F32)?.sqr()?.sum_all()?.to_scalar::<f32>()? as f64;
        }
    }
    let norm = sum_sq.sqrt() / scale;
    if !norm.is_finite() {
        return Ok(None);
    }

    let clip = if max_norm > 0.0 && norm > max_norm {
        max_norm / (norm + 1e-6)
    } else {
        1.0
    };
    let factor = clip / scale;
    if factor != 1.0 {
        for var in vars {
            if let Some(grad) = grads.get(var.as_tensor()) {
                let grad = grad.affine(factor, 0.)?;
                grads.insert(var.as_tensor(), grad);
            }
        }
    }
    Ok(Some(norm))
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvalOutput {
    pub eval_loss: f64,
    pub metrics: TranslationMetrics,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrainOutput {
    pub global_step: usize,
    pub training_loss: f64,
}

pub struct Seq2SeqTrainer {
    model: Transformer,
    varmap: VarMap,
    tokenizer: Tokenizer,
    args: TrainingArgs,
    train_set: Vec<TokenizedExample>,
    eval_set: Vec<TokenizedExample>,
    device: Device,
    optimizer: ParamGroups,
    loss_scaler: LossScaler,
    state: TrainerState,
}

impl Seq2SeqTrainer {
    pub fn new(
        model: Transformer,
        varmap: VarMap,
        tokenizer: Tokenizer,
        args: TrainingArgs,
        train_set: Vec<TokenizedExample>,
        eval_set: Vec<TokenizedExample>,
        device: Device,
    ) -> Result<Self> {
        args.validate()?;
        let optimizer = ParamGroups::new(&varmap, &args)?;
        let loss_scaler = LossScaler::for_dtype(model.dtype());
        let steps_per_epoch = train_set.len().div_ceil(args.per_device_train_batch_size);
        let state = TrainerState {
            max_steps: steps_per_epoch * args.num_train_epochs,
            num_train_epochs: args.num_train_epochs,
            ..Default::default()
        };

        Ok(Self {
            model,
            varmap,
            tokenizer,
            args,
            train_set,
            eval_set,
            device,
            optimizer,
            loss_scaler,
            state,
        })
    }

    pub fn state(&self) -> &TrainerState {
        &self.state
    }

    fn model_config(&self) -> &ModelConfig {
        self.model.config()
    }

    fn batcher<'a>(
        &self,
        examples: &'a [TokenizedExample],
        batch_size: usize,
        shuffle_seed: Option<u64>,
    ) -> Seq2SeqBatcher<'a> {
        let config = self.model_config();
        Seq2SeqBatcher::new(
            examples,
            batch_size,
            shuffle_seed,
            config.pad_token_id,
            config.decoder_start_token_id,
            &self.device,
        )
    }

    pub fn train(&mut self) -> Result<TrainOutput> {
        let start = Instant::now();
        let args = self.args.clone();
        let total_steps = self.state.max_steps;
        let steps_per_epoch = total_steps / args.num_train_epochs.max(1);
        info!(
            examples = self.train_set.len(),
            epochs = args.num_train_epochs,
            batch_size = args.per_device_train_batch_size,
            total_steps,
            dtype = ?self.model.dtype(),
            "starting training"
        );

        let train_set = std::mem::take(&mut self.train_set);
        let mut total_loss = 0f64;
        let mut logged_loss = 0f64;
        let mut logged_steps = 0usize;

        for epoch in 0..args.num_train_epochs {
            let shuffle_seed = args.seed.wrapping_add(epoch as u64);
            let batcher =
                self.batcher(&train_set, args.per_device_train_batch_size, Some(shuffle_seed));
            for batch in batcher {
                let batch = batch?;
                let logits = self.model.forward(
                    &batch.input_ids,
                    &batch.attention_mask,
                    &batch.decoder_input_ids,
                    true,
                )?;
                let loss = masked_cross_entropy(&logits, &batch.targets, &batch.label_weights)?;
                let loss_value = loss.to_scalar::<f32>()? as f64;

                let mut grads = self.loss_scaler.scale_loss(&loss)?.backward()?;
                let grad_norm = unscale_and_clip(
                    &mut grads,
                    self.optimizer.vars(),
                    self.loss_scaler.scale(),
                    args.max_grad_norm,
                )?;
                let lr = linear_schedule(args.learning_rate, self.state.global_step, total_steps);
                if self.loss_scaler.update(grad_norm.is_some()) {
                    self.optimizer.set_learning_rate(lr);
                    self.optimizer.step(&grads)?;
                }

                self.state.global_step += 1;
                self.state.epoch = epoch as f64
                    + (self.state.global_step - epoch * steps_per_epoch) as f64
                        / steps_per_epoch.max(1) as f64;
                total_loss += loss_value;
                logged_loss += loss_value;
                logged_steps += 1;

                if args.logging_steps > 0 && self.state.global_step % args.logging_steps == 0 {
                    self.log_loss(logged_loss / logged_steps as f64, lr);
                    logged_loss = 0.0;
                    logged_steps = 0;
                }
                if args.save_steps > 0 && self.state.global_step % args.save_steps == 0 {
                    self.save_checkpoint()?;
                }
            }

            if logged_steps > 0 {
                let lr = linear_schedule(args.learning_rate, self.state.global_step, total_steps);
                self.log_loss(logged_loss / logged_steps as f64, lr);
                logged_loss = 0.0;
                logged_steps = 0;
            }

            let eval = self.evaluate()?;
            info!(
                epoch = epoch + 1,
                eval_loss = eval.eval_loss,
                bleu = eval.metrics.bleu,
                gen_len = eval.metrics.gen_len,
                "evaluation"
            );
            self.state.log_history.push(LogEntry {
                step: self.state.global_step,
                epoch: self.state.epoch,
                eval_loss: Some(eval.eval_loss),
                eval_bleu: Some(eval.metrics.bleu),
                eval_gen_len: Some(eval.metrics.gen_len),
                ..Default::default()
            });
        }
        self.train_set = train_set;

        let training_loss = total_loss / self.state.global_step.max(1) as f64;
        let train_runtime = start.elapsed().as_secs_f64();
        self.state.log_history.push(LogEntry {
            step: self.state.global_step,
            epoch: self.state.epoch,
            loss: Some(training_loss),
            train_runtime: Some(train_runtime),
            ..Default::default()
        });
        info!(training_loss, train_runtime, "training finished");

        Ok(TrainOutput {
            global_step: self.state.global_step,
            training_loss,
        })
    }

    fn log_loss(&mut self, loss: f64, learning_rate: f64) {
        info!(
            step = self.state.global_step,
            epoch = self.state.epoch,
            loss,
            learning_rate,
            "train"
        );
        self.state.log_history.push(LogEntry {
            step: self.state.global_step,
            epoch: self.state.epoch,
            loss: Some(loss),
            learning_rate: Some(learning_rate),
            ..Default::default()
        });
    }

    /// Masked cross-entropy on the eval split plus BLEU over greedy generations.
    pub fn evaluate(&self) -> Result<EvalOutput> {
        let generation_config = GenerationConfig::greedy(self.args.generation_max_length - 1);
        let mut processor = LogitsProcessor::new(None, generation_config.sampling);

        let mut loss_sum = 0f64;
        let mut preds = Vec::with_capacity(self.eval_set.len());
        let mut labels = Vec::with_capacity(self.eval_set.len());
        for batch in self.batcher(&self.eval_set, self.args.per_device_eval_batch_size, None) {
            let batch = batch?;
            let logits = self.model.forward(
                &batch.input_ids,
                &batch.attention_mask,
                &batch.decoder_input_ids,
                false,
            )?;
            let loss = masked_cross_entropy(&logits, &batch.targets, &batch.label_weights)?;
            loss_sum += loss.to_scalar::<f32>()? as f64 * batch.labels.len() as f64;

            preds.extend(generate(
                &self.model,
                &batch.input_ids,
                &batch.attention_mask,
                &generation_config,
                &mut processor,
            )?);
            labels.extend(batch.labels);
        }

        let pad_token_id = self.model_config().pad_token_id;
        let metrics = compute_metrics(&self.tokenizer, &preds, &labels, pad_token_id)?;
        Ok(EvalOutput {
            eval_loss: loss_sum / self.eval_set.len().max(1) as f64,
            metrics,
        })
    }

    fn snapshot(&self) -> Snapshot<'_> {
        Snapshot {
            varmap: &self.varmap,
            model_config: self.model.config(),
            tokenizer: &self.tokenizer,
            args: &self.args,
            state: &self.state,
        }
    }

    fn save_checkpoint(&self) -> Result<()> {
        let dir = checkpoint_dir(&self.args.output_dir, self.state.global_step);
        save_pretrained(&dir, &self.snapshot())?;
        rotate_checkpoints(&self.args.output_dir, self.args.save_total_limit)?;
        Ok(())
    }

    /// Writes the final model, tokenizer and configs to `output_dir`.
    pub fn save_model(&self) -> Result<()> {
        save_pretrained(&self.args.output_dir, &self.snapshot())
    }

    pub fn push_to_hub(&self) -> Result<String> {
        let repo_id = match &self.args.hub_model_id {
            Some(id) => id.clone(),
            None => default_repo_name(&self.args.output_dir)?,
        };
        push_to_hub(&self.args.output_dir, &repo_id, "End of training")
    }
}

/// Loads the corpus and the base checkpoint, fine-tunes, saves to `output_dir` and pushes
/// when configured.
pub fn fine_tune(config: &Config) -> Result<TrainOutput> {
    let device = device(config.cpu)?;
    let files = ModelFiles::resolve(&config.checkpoint)?;
    let training_tokenizer = files.tokenizer()?;
    let model_config = files.model_config()?;

    let records = load_records(
        &config.data_path,
        &config.src_lang,
        &config.tgt_lang,
        config.has_header,
    )?;
    let dataset = TranslationDataset::train_test_split(
        records,
        &config.src_lang,
        &config.tgt_lang,
        config.test_size,
        config.split_seed,
    )?;
    info!(train = dataset.train_set.len(), test = dataset.test_set.len(), "dataset split");

    let preprocessor = Preprocessor::new(
        &training_tokenizer,
        &config.prefix(),
        &dataset.src_lang,
        &dataset.tgt_lang,
        config.max_length,
    )?;
    let train_set = preprocessor.preprocess(&dataset.train_set)?;
    let eval_set = preprocessor.preprocess(&dataset.test_set)?;

    let dtype = compute_dtype(config.training.fp16, &device);
    let (varmap, model) = load_model(&model_config, &files.weights, dtype, &device)?;

    let mut trainer = Seq2SeqTrainer::new(
        model,
        varmap,
        training_tokenizer,
        config.training.clone(),
        train_set,
        eval_set,
        device,
    )?;
    let output = trainer.train()?;
    trainer.save_model()?;
    if config.training.push_to_hub {
        let repo_id = trainer.push_to_hub()?;
        info!(repo_id, "model available on the hub");
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use candle_core::Tensor;
    use candle_nn::VarBuilder;

    use super::*;
    use crate::{
        checkpoint::{sorted_checkpoints, CONFIG_NAME, TRAINER_STATE_NAME, WEIGHTS_NAME},
        dataset::TranslationRecord,
        tokenizer_helper::train_word_level,
    };

    #[test]
    fn test_linear_schedule() {
        assert_eq!(linear_schedule(2e-5, 0, 4), 2e-5);
        assert!((linear_schedule(2e-5, 1, 4) - 1.5e-5).abs() < 1e-12);
        assert_eq!(linear_schedule(2e-5, 4, 4), 0.0);
        assert_eq!(linear_schedule(2e-5, 9, 4), 0.0);
    }

    #[test]
    fn test_no_decay_names() {
        assert!(is_no_decay("encoder.block.0.layer.0.layer_norm.weight"));
        assert!(is_no_decay("decoder.final_layer_norm.weight"));
        assert!(!is_no_decay("encoder.block.0.layer.0.SelfAttention.q.weight"));
        assert!(!is_no_decay("shared.weight"));
    }

    #[test]
    fn test_unscale_and_clip() {
        let device = Device::Cpu;
        let var = Var::new(&[1f32, 1.], &device).unwrap();
        let coeffs = Tensor::new(&[3f32, 4.], &device).unwrap();
        let loss = (var.as_tensor() * &coeffs).unwrap().sum_all().unwrap();

        // scaled by 2: raw gradients are [6, 8], unscaled norm 5, clipped to norm 1
        let mut grads = loss.affine(2.0, 0.).unwrap().backward().unwrap();
        let norm = unscale_and_clip(&mut grads, &[var.clone()], 2.0, 1.0).unwrap();
        assert!((norm.unwrap() - 5.0).abs() < 1e-6);
        let clipped = grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap();
        assert!((clipped[0] - 0.6).abs() < 1e-5 && (clipped[1] - 0.8).abs() < 1e-5);

        // below the threshold only the scale is removed
        let mut grads = loss.affine(2.0, 0.).unwrap().backward().unwrap();
        unscale_and_clip(&mut grads, &[var.clone()], 2.0, 10.0).unwrap();
        assert_eq!(grads.get(var.as_tensor()).unwrap().to_vec1::<f32>().unwrap(), vec![3.0, 4.0]);

        let overflow = (var.as_tensor() * f64::INFINITY).unwrap().sum_all().unwrap();
        let mut grads = overflow.backward().unwrap();
        assert_eq!(unscale_and_clip(&mut grads, &[var], 1.0, 1.0).unwrap(), None);
    }

    #[test]
    fn test_param_groups_split_layer_norms() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        Transformer::new(&ModelConfig::tiny(20), DType::F32, vb).unwrap();
        let groups = ParamGroups::new(&varmap, &TrainingArgs::default()).unwrap();
        assert_eq!(groups.vars().len(), varmap.all_vars().len());
    }

    #[test]
    fn test_trainer_runs_and_rotates_checkpoints() {
        let dir = tempfile::tempdir().unwrap();
        let device = Device::Cpu;
        let pairs = [
            ("안녕", "hello"),
            ("잘가", "bye"),
            ("고마워", "thanks"),
            ("미안해", "sorry"),
            ("좋아", "good"),
        ];
        let prefix = "translate Korean to English: ";

        let sequences = pairs
            .iter()
            .flat_map(|(ko, en)| [format!("{prefix}{ko}"), en.to_string()])
            .collect();
        let tokenizer = train_word_level(dir.path(), sequences);
        let records: Vec<TranslationRecord> = pairs
            .iter()
            .enumerate()
            .map(|(i, (ko, en))| {
                TranslationRecord::new(i.to_string(), "ko", ko.to_string(), "en", en.to_string())
            })
            .collect();
        let preprocessor = Preprocessor::new(&tokenizer, prefix, "ko", "en", 128).unwrap();
        let examples = preprocessor.preprocess(&records).unwrap();

        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let model_config = ModelConfig::tiny(tokenizer.get_vocab_size(true));
        let model = Transformer::new(&model_config, DType::F32, vb).unwrap();

        let args = TrainingArgs {
            output_dir: dir.path().join("out"),
            num_train_epochs: 4,
            per_device_train_batch_size: 2,
            per_device_eval_batch_size: 2,
            learning_rate: 1e-2,
            fp16: false,
            logging_steps: 1,
            save_steps: 1,
            save_total_limit: Some(3),
            generation_max_length: 5,
            push_to_hub: false,
            ..Default::default()
        };
        let mut trainer = Seq2SeqTrainer::new(
            model,
            varmap,
            tokenizer,
            args.clone(),
            examples[..3].to_vec(),
            examples[3..].to_vec(),
            device,
        )
        .unwrap();

        let output = trainer.train().unwrap();
        assert_eq!(output.global_step, 8);
        assert!(output.training_loss.is_finite());

        // a checkpoint every step, only the newest three survive; step 7 is mid-epoch
        let checkpoints = sorted_checkpoints(&args.output_dir).unwrap();
        assert_eq!(
            checkpoints,
            [6, 7, 8].map(|step| checkpoint_dir(&args.output_dir, step)).to_vec()
        );
        let eval_entries = trainer
            .state()
            .log_history
            .iter()
            .filter(|entry| entry.eval_bleu.is_some())
            .count();
        assert_eq!(eval_entries, 4);

        trainer.save_model().unwrap();
        for name in [CONFIG_NAME, WEIGHTS_NAME, TRAINER_STATE_NAME] {
            assert!(args.output_dir.join(name).is_file());
        }
    }
}
