use candle_core::{IndexOp, Tensor};
use rand::{distributions::WeightedIndex, prelude::Distribution, rngs::StdRng, SeedableRng};

use crate::{
    error::{Error, Result},
    transformer::Transformer,
};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Sampling {
    Greedy,
    /// Keep the `k` most likely tokens, then the smallest set of those whose probability
    /// mass reaches `p`, and sample from what is left.
    TopKThenTopP { k: usize, p: f64, temperature: f64 },
}

#[derive(Debug, Clone)]
pub struct GenerationConfig {
    pub max_new_tokens: usize,
    pub min_new_tokens: usize,
    pub sampling: Sampling,
}

impl GenerationConfig {
    pub fn greedy(max_new_tokens: usize) -> Self {
        Self {
            max_new_tokens,
            min_new_tokens: 0,
            sampling: Sampling::Greedy,
        }
    }

    pub fn top_k_top_p(max_new_tokens: usize, k: usize, p: f64) -> Self {
        Self {
            max_new_tokens,
            min_new_tokens: 0,
            sampling: Sampling::TopKThenTopP {
                k,
                p,
                temperature: 1.0,
            },
        }
    }
}

pub struct LogitsProcessor {
    rng: StdRng,
    sampling: Sampling,
}

impl LogitsProcessor {
    pub fn new(seed: Option<u64>, sampling: Sampling) -> Self {
        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self { rng, sampling }
    }

    pub fn sample(&mut self, logits: &mut [f32]) -> Result<u32> {
        match self.sampling {
            Sampling::Greedy => Ok(argmax(logits)),
            Sampling::TopKThenTopP { k, p, temperature } => {
                if temperature != 1.0 {
                    logits.iter_mut().for_each(|l| *l /= temperature as f32);
                }
                top_k_filter(logits, k);
                top_p_filter(logits, p);
                let probs = softmax(logits);
                let distribution =
                    WeightedIndex::new(&probs).map_err(|e| Error::Generation(e.to_string()))?;
                Ok(distribution.sample(&mut self.rng) as u32)
            }
        }
    }
}

fn argmax(logits: &[f32]) -> u32 {
    logits
        .iter()
        .enumerate()
        .fold((0, f32::NEG_INFINITY), |(best, best_value), (i, &value)| {
            if value > best_value {
                (i, value)
            } else {
                (best, best_value)
            }
        })
        .0 as u32
}

fn softmax(logits: &[f32]) -> Vec<f32> {
    let max = logits.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let exps: Vec<f32> = logits.iter().map(|&l| (l - max).exp()).collect();
    let sum: f32 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

/// Masks every logit below the k-th largest one; ties with it are kept.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() {
        return;
    }
    let mut sorted = logits.to_vec();
    sorted.sort_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    logits
        .iter_mut()
        .filter(|l| **l < threshold)
        .for_each(|l| *l = f32::NEG_INFINITY);
}

/// Walks the tokens from least to most likely and masks them while their cumulative
/// probability stays within `1 - p`. The most likely token always survives.
pub fn top_p_filter(logits: &mut [f32], p: f64) {
    if p >= 1.0 {
        return;
    }
    let probs = softmax(logits);
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| probs[a].total_cmp(&probs[b]));

    let mut cumulative = 0f64;
    for &index in &order[..order.len() - 1] {
        cumulative += probs[index] as f64;
        if cumulative > 1.0 - p {
            break;
        }
        logits[index] = f32::NEG_INFINITY;
    }
}

/// Autoregressive generation for a batch. Every returned sequence starts with the decoder
/// start token; finished rows are padded with the pad token.
pub fn generate(
    model: &Transformer,
    input_ids: &Tensor,
    attention_mask: &Tensor,
    config: &GenerationConfig,
    processor: &mut LogitsProcessor,
) -> Result<Vec<Vec<u32>>> {
    let (batch_size, _) = input_ids.dims2()?;
    let device = input_ids.device();
    let model_config = model.config();
    let (start, eos, pad) = (
        model_config.decoder_start_token_id,
        model_config.eos_token_id as usize,
        model_config.pad_token_id,
    );

    let encoder_output = model.encode(input_ids, attention_mask, false)?;
    let mut sequences = vec![vec![start]; batch_size];
    let mut finished = vec![false; batch_size];

    for step in 0..config.max_new_tokens {
        let decoder_input_ids =
            Tensor::from_vec(sequences.concat(), (batch_size, step + 1), device)?;
        let logits = model.decode(&decoder_input_ids, &encoder_output, attention_mask, false)?;
        let next_logits = logits.i((.., step, ..))?.to_vec2::<f32>()?;

        for (i, mut row) in next_logits.into_iter().enumerate() {
            if finished[i] {
                sequences[i].push(pad);
                continue;
            }
            if step < config.min_new_tokens && eos < row.len() {
                row[eos] = f32::NEG_INFINITY;
            }
            let next_token = processor.sample(&mut row)?;
            sequences[i].push(next_token);
            finished[i] = next_token as usize == eos;
        }

        if finished.iter().all(|done| *done) {
            break;
        }
    }

    Ok(sequences)
}
