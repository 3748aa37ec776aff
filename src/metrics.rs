//! Translation quality metrics for generated token ids.
//!
//! BLEU follows sacreBLEU's corpus defaults: `13a` tokenization, n-grams up to 4,
//! exponential smoothing and the closest reference length for the brevity penalty.

use std::{collections::HashMap, sync::OnceLock};

use regex::Regex;
use serde::Serialize;
use tokenizers::Tokenizer;

use crate::{dataset::IGNORE_INDEX, error::Result, tokenizer_helper::decode};

const MAX_NGRAM_ORDER: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TranslationMetrics {
    pub bleu: f64,
    pub gen_len: f64,
}

pub fn postprocess_text(preds: &[String], labels: &[String]) -> (Vec<String>, Vec<Vec<String>>) {
    let preds = preds.iter().map(|pred| pred.trim().to_string()).collect();
    let labels = labels
        .iter()
        .map(|label| vec![label.trim().to_string()])
        .collect();
    (preds, labels)
}

/// Decodes generated ids and reference labels (with `IGNORE_INDEX` mapped back to the pad
/// id), then scores them.
pub fn compute_metrics(
    tokenizer: &Tokenizer,
    preds: &[Vec<u32>],
    labels: &[Vec<i64>],
    pad_token_id: u32,
) -> Result<TranslationMetrics> {
    let decoded_preds = preds
        .iter()
        .map(|ids| decode(tokenizer, ids, true))
        .collect::<Result<Vec<_>>>()?;
    let decoded_labels = labels
        .iter()
        .map(|ids| {
            let ids: Vec<u32> = ids
                .iter()
                .map(|&id| if id == IGNORE_INDEX { pad_token_id } else { id as u32 })
                .collect();
            decode(tokenizer, &ids, true)
        })
        .collect::<Result<Vec<_>>>()?;

    let (decoded_preds, decoded_labels) = postprocess_text(&decoded_preds, &decoded_labels);
    let bleu = corpus_bleu(&decoded_preds, &decoded_labels);

    let gen_len = if preds.is_empty() {
        0.0
    } else {
        let total: usize = preds
            .iter()
            .map(|ids| ids.iter().filter(|&&id| id != pad_token_id).count())
            .sum();
        total as f64 / preds.len() as f64
    };

    Ok(TranslationMetrics {
        bleu: round4(bleu),
        gen_len: round4(gen_len),
    })
}

fn round4(value: f64) -> f64 {
    (value * 10_000.0).round() / 10_000.0
}

fn regexes() -> &'static [(Regex, &'static str); 4] {
    static REGEXES: OnceLock<[(Regex, &'static str); 4]> = OnceLock::new();
    REGEXES.get_or_init(|| {
        [
            // punctuation and symbols
            (Regex::new(r"([{-~\[-` -&(-+:-@/])").expect("valid regex"), " ${1} "),
            // period and comma unless preceded by a digit
            (Regex::new(r"([^0-9])([\.,])").expect("valid regex"), "${1} ${2} "),
            // period and comma unless followed by a digit
            (Regex::new(r"([\.,])([^0-9])").expect("valid regex"), " ${1} ${2}"),
            // dash when preceded by a digit
            (Regex::new(r"([0-9])(-)").expect("valid regex"), "${1} ${2} "),
        ]
    })
}

/// The `13a` tokenizer of mteval-v13a.
pub fn tokenize_13a(line: &str) -> String {
    let mut line = line.replace("<skipped>", "").replace("-\n", "").replace('\n', " ");
    if line.contains('&') {
        line = line
            .replace("&quot;", "\"")
            .replace("&amp;", "&")
            .replace("&lt;", "<")
            .replace("&gt;", ">");
    }
    let mut line = format!(" {line} ");
    for (re, replacement) in regexes() {
        line = re.replace_all(&line, *replacement).into_owned();
    }
    line.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn ngram_counts(tokens: &[&str], order: usize) -> HashMap<Vec<String>, usize> {
    let mut counts = HashMap::new();
    for n in 1..=order {
        for window in tokens.windows(n) {
            let ngram = window.iter().map(|t| t.to_string()).collect::<Vec<_>>();
            *counts.entry(ngram).or_insert(0) += 1;
        }
    }
    counts
}

#[derive(Debug, Default, Clone, PartialEq)]
struct BleuStats {
    correct: [usize; MAX_NGRAM_ORDER],
    total: [usize; MAX_NGRAM_ORDER],
    sys_len: usize,
    ref_len: usize,
}

fn sentence_stats(hypothesis: &str, references: &[String]) -> BleuStats {
    let hyp = tokenize_13a(hypothesis);
    let hyp_tokens: Vec<&str> = hyp.split_whitespace().collect();
    let refs: Vec<String> = references.iter().map(|r| tokenize_13a(r)).collect();

    // closest reference length, the shorter one on ties
    let mut ref_len = usize::MAX;
    let mut max_ref_counts: HashMap<Vec<String>, usize> = HashMap::new();
    for reference in &refs {
        let ref_tokens: Vec<&str> = reference.split_whitespace().collect();
        let len = ref_tokens.len();
        let diff = len.abs_diff(hyp_tokens.len());
        let best = ref_len.abs_diff(hyp_tokens.len());
        if diff < best || (diff == best && len < ref_len) {
            ref_len = len;
        }
        for (ngram, count) in ngram_counts(&ref_tokens, MAX_NGRAM_ORDER) {
            let entry = max_ref_counts.entry(ngram).or_insert(0);
            *entry = (*entry).max(count);
        }
    }

    let mut stats = BleuStats {
        sys_len: hyp_tokens.len(),
        ref_len: if ref_len == usize::MAX { 0 } else { ref_len },
        ..Default::default()
    };
    for (ngram, count) in ngram_counts(&hyp_tokens, MAX_NGRAM_ORDER) {
        let n = ngram.len() - 1;
        stats.total[n] += count;
        stats.correct[n] += count.min(max_ref_counts.get(&ngram).copied().unwrap_or(0));
    }
    stats
}

/// Corpus BLEU on the 0–100 scale. `references[i]` holds the references of `hypotheses[i]`.
pub fn corpus_bleu(hypotheses: &[String], references: &[Vec<String>]) -> f64 {
    let mut stats = BleuStats::default();
    for (hypothesis, refs) in hypotheses.iter().zip(references) {
        let sentence = sentence_stats(hypothesis, refs);
        for n in 0..MAX_NGRAM_ORDER {
            stats.correct[n] += sentence.correct[n];
            stats.total[n] += sentence.total[n];
        }
        stats.sys_len += sentence.sys_len;
        stats.ref_len += sentence.ref_len;
    }
    compute_bleu(&stats)
}

fn compute_bleu(stats: &BleuStats) -> f64 {
    let mut precisions = [0f64; MAX_NGRAM_ORDER];
    let mut smooth_mteval = 1f64;
    for n in 0..MAX_NGRAM_ORDER {
        if stats.total[n] == 0 {
            break;
        }
        precisions[n] = if stats.correct[n] == 0 {
            smooth_mteval *= 2.0;
            100.0 / (smooth_mteval * stats.total[n] as f64)
        } else {
            100.0 * stats.correct[n] as f64 / stats.total[n] as f64
        };
    }

    let brevity_penalty = if stats.sys_len < stats.ref_len {
        if stats.sys_len > 0 {
            (1.0 - stats.ref_len as f64 / stats.sys_len as f64).exp()
        } else {
            0.0
        }
    } else {
        1.0
    };

    let log_sum: f64 = precisions
        .iter()
        .map(|&p| if p == 0.0 { -9_999_999_999.0 } else { p.ln() })
        .sum();
    brevity_penalty * (log_sum / MAX_NGRAM_ORDER as f64).exp()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn strings(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_postprocess_text() {
        let (preds, labels) = postprocess_text(
            &strings(&["  hello there ", "bye\n"]),
            &strings(&[" hello there", "good bye  "]),
        );
        assert_eq!(preds, strings(&["hello there", "bye"]));
        assert_eq!(
            labels,
            vec![strings(&["hello there"]), strings(&["good bye"])]
        );
    }

    #[test]
    fn test_tokenize_13a() {
        assert_eq!(tokenize_13a("Hello, world!"), "Hello , world !");
        assert_eq!(tokenize_13a("It costs 3.50 dollars."), "It costs 3.50 dollars .");
        assert_eq!(tokenize_13a("a &amp; b"), "a & b");
        assert_eq!(tokenize_13a("pages 10-12"), "pages 10 - 12");
    }

    #[test]
    fn test_identical_translation_scores_100() {
        let preds = strings(&["The cat is on the mat.", "It is raining heavily today"]);
        let refs = vec![
            strings(&["The cat is on the mat."]),
            strings(&["It is raining heavily today"]),
        ];
        assert!((corpus_bleu(&preds, &refs) - 100.0).abs() < 1e-9);
    }

    #[test]
    fn test_brevity_penalty() {
        let preds = strings(&["the cat sat on"]);
        let refs = vec![strings(&["the cat sat on the mat"])];
        // all n-grams match, only the brevity penalty applies: exp(1 - 6/4)
        let expected = 100.0 * (1.0f64 - 6.0 / 4.0).exp();
        assert!((corpus_bleu(&preds, &refs) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_exponential_smoothing() {
        // 4 of 4 unigrams, 1 of 3 bigrams, 0 of 2 trigrams, 0 of 1 fourgram
        let preds = strings(&["a b x y"]);
        let refs = vec![strings(&["a b y x"])];
        let precisions = [100.0f64, 100.0 * 1.0 / 3.0, 100.0 / (2.0 * 2.0), 100.0 / (4.0 * 1.0)];
        let expected = (precisions.iter().map(|p| p.ln()).sum::<f64>() / 4.0).exp();
        assert!((corpus_bleu(&preds, &refs) - expected).abs() < 1e-9);
    }

    #[test]
    fn test_no_output_scores_zero() {
        let preds = strings(&[""]);
        let refs = vec![strings(&["something"])];
        assert_eq!(corpus_bleu(&preds, &refs), 0.0);
    }

    #[test]
    fn test_compute_metrics_gen_len() {
        let dir = tempfile::tempdir().unwrap();
        let tokenizer = crate::tokenizer_helper::train_word_level(
            dir.path(),
            vec!["the cat is on the mat".to_string()],
        );
        let id = |t: &str| tokenizer.token_to_id(t).unwrap();
        let sentence: Vec<u32> = ["the", "cat", "is", "on", "the", "mat"]
            .iter()
            .map(|t| id(t))
            .collect();

        let mut pred = vec![0];
        pred.extend(&sentence);
        pred.extend([1, 0, 0]);
        let mut label: Vec<i64> = sentence.iter().map(|&t| t as i64).collect();
        label.extend([1, IGNORE_INDEX, IGNORE_INDEX]);

        let preds = [pred, vec![0, id("cat"), 1]];
        let metrics = compute_metrics(&tokenizer, &preds, &[label.clone(), label], 0).unwrap();
        // non-pad lengths: 7 and 2
        assert_eq!(metrics.gen_len, 4.5);
        assert!(metrics.bleu > 0.0 && metrics.bleu < 100.0);
    }
}
