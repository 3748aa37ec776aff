use std::{collections::HashMap, fs::File, path::Path};

use candle_core::{Device, Tensor};
use parquet::file::reader::SerializedFileReader;
use parquet::record::Field;
use rand::{rngs::StdRng, seq::SliceRandom, thread_rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{
    error::{Error, Result},
    tokenizer_helper::with_max_length,
};

/// Label value for positions the loss must skip.
pub const IGNORE_INDEX: i64 = -100;

#[derive(Debug, Clone, PartialEq)]
pub struct TranslationRecord {
    pub id: String,
    pub translation: HashMap<String, String>, // {src_lang: text, tgt_lang: text}
}

impl TranslationRecord {
    pub fn new(id: String, src_lang: &str, source: String, tgt_lang: &str, target: String) -> Self {
        let translation =
            HashMap::from([(src_lang.to_string(), source), (tgt_lang.to_string(), target)]);
        Self { id, translation }
    }

    pub fn text(&self, lang: &str) -> &str {
        self.translation.get(lang).map(String::as_str).unwrap_or_default()
    }
}

/// Reads `(id, source, target)` rows. `.parquet` files are read by column name, anything
/// else is treated as CSV with positional columns.
pub fn load_records(
    path: impl AsRef<Path>,
    src_lang: &str,
    tgt_lang: &str,
    has_header: bool,
) -> Result<Vec<TranslationRecord>> {
    let path = path.as_ref();
    // records are keyed by language code
    if src_lang == tgt_lang {
        return Err(Error::Config(format!(
            "source and target language are both `{src_lang}`"
        )));
    }
    let extension = path.extension().and_then(|ext| ext.to_str());
    let records = match extension {
        Some("parquet") => {
            let reader = SerializedFileReader::new(File::open(path)?)?;
            load_parquet(reader, src_lang, tgt_lang)?
        }
        Some("csv") | Some("tsv") | Some("txt") | None => {
            let tab_separated = extension == Some("tsv");
            load_csv(File::open(path)?, src_lang, tgt_lang, has_header, tab_separated)?
        }
        Some(other) => return Err(Error::UnsupportedFormat(other.to_string())),
    };
    info!(path = %path.display(), records = records.len(), "loaded parallel corpus");
    Ok(records)
}

fn load_csv(
    reader: impl std::io::Read,
    src_lang: &str,
    tgt_lang: &str,
    has_header: bool,
    tab_separated: bool,
) -> Result<Vec<TranslationRecord>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(has_header)
        .delimiter(if tab_separated { b'\t' } else { b',' })
        .flexible(true)
        .from_reader(reader);

    reader
        .records()
        .map(|row| {
            let row = row?;
            if row.len() < 3 {
                let line = row.position().map(|p| p.line()).unwrap_or_default();
                return Err(Error::MalformedRecord {
                    line,
                    fields: row.len(),
                });
            }
            Ok(TranslationRecord::new(
                row[0].to_string(),
                src_lang,
                row[1].to_string(),
                tgt_lang,
                row[2].to_string(),
            ))
        })
        .collect()
}

// Accepts both flat `id, <src_lang>, <tgt_lang>` columns and the `translation` struct column
// used by the hub's translation datasets.
fn load_parquet(
    parquet: SerializedFileReader<File>,
    src_lang: &str,
    tgt_lang: &str,
) -> Result<Vec<TranslationRecord>> {
    let mut records = Vec::new();
    for (index, row) in parquet.into_iter().enumerate() {
        let row = row?;
        let mut id = index.to_string();
        let mut translation = HashMap::new();
        for (name, field) in row.get_column_iter() {
            match field {
                Field::Group(subrow) if name == "translation" => {
                    for (lang, text) in subrow.get_column_iter() {
                        if let Field::Str(text) = text {
                            translation.insert(lang.clone(), text.clone());
                        }
                    }
                }
                Field::Str(value) if name == "id" => id = value.clone(),
                Field::Str(value) if name == src_lang || name == tgt_lang => {
                    translation.insert(name.clone(), value.clone());
                }
                Field::Int(value) if name == "id" => id = value.to_string(),
                Field::Long(value) if name == "id" => id = value.to_string(),
                _ => {}
            }
        }
        if !translation.contains_key(src_lang) || !translation.contains_key(tgt_lang) {
            return Err(Error::MalformedRecord {
                line: index as u64 + 1,
                fields: translation.len() + 1,
            });
        }
        records.push(TranslationRecord { id, translation });
    }
    Ok(records)
}

#[derive(Debug, Clone)]
pub struct TranslationDataset {
    pub src_lang: String,
    pub tgt_lang: String,
    pub train_set: Vec<TranslationRecord>,
    pub test_set: Vec<TranslationRecord>,
}

impl TranslationDataset {
    /// Uniformly shuffles `records` and holds out `ceil(test_size * n)` of them.
    pub fn train_test_split(
        records: Vec<TranslationRecord>,
        src_lang: &str,
        tgt_lang: &str,
        test_size: f64,
        seed: Option<u64>,
    ) -> Result<Self> {
        let n = records.len();
        let n_test = (test_size * n as f64).ceil() as usize;
        let n_train = n.saturating_sub(n_test);
        if n_test == 0 || n_train == 0 {
            return Err(Error::Config(format!(
                "cannot split {n} records with test_size {test_size}: one side would be empty"
            )));
        }

        let mut records = records;
        match seed {
            Some(seed) => records.shuffle(&mut StdRng::seed_from_u64(seed)),
            None => records.shuffle(&mut thread_rng()),
        }
        let test_set = records.split_off(n_train);
        debug!(train = records.len(), test = test_set.len(), "split dataset");

        Ok(Self {
            src_lang: src_lang.to_string(),
            tgt_lang: tgt_lang.to_string(),
            train_set: records,
            test_set,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u32>,
    pub labels: Vec<u32>,
}

/// Prefixes the source sentence and tokenizes both sides with the shared vocabulary.
pub struct Preprocessor {
    tokenizer: Tokenizer,
    prefix: String,
    src_lang: String,
    tgt_lang: String,
}

impl Preprocessor {
    pub fn new(
        tokenizer: &Tokenizer,
        prefix: &str,
        src_lang: &str,
        tgt_lang: &str,
        max_length: usize,
    ) -> Result<Self> {
        Ok(Self {
            tokenizer: with_max_length(tokenizer, max_length)?,
            prefix: prefix.to_string(),
            src_lang: src_lang.to_string(),
            tgt_lang: tgt_lang.to_string(),
        })
    }

    pub fn preprocess(&self, records: &[TranslationRecord]) -> Result<Vec<TokenizedExample>> {
        let inputs: Vec<String> = records
            .iter()
            .map(|record| format!("{}{}", self.prefix, record.text(&self.src_lang)))
            .collect();
        let targets: Vec<String> = records
            .iter()
            .map(|record| record.text(&self.tgt_lang).to_string())
            .collect();

        let inputs = self.tokenizer.encode_batch(inputs, true).map_err(Error::tokenizer)?;
        let targets = self.tokenizer.encode_batch(targets, true).map_err(Error::tokenizer)?;

        Ok(inputs
            .into_iter()
            .zip(targets)
            .map(|(input, target)| TokenizedExample {
                input_ids: input.get_ids().to_vec(),
                attention_mask: input.get_attention_mask().to_vec(),
                labels: target.get_ids().to_vec(),
            })
            .collect())
    }
}

/// A padded batch. `labels` keeps the raw ids with `IGNORE_INDEX` padding for metrics,
/// `targets` and `label_weights` are the loss-ready form of the same labels.
#[derive(Debug, Clone)]
pub struct Seq2SeqBatch {
    pub input_ids: Tensor,         //(batch, src_len)
    pub attention_mask: Tensor,    //(batch, src_len)
    pub decoder_input_ids: Tensor, //(batch, tgt_len)
    pub targets: Tensor,           //(batch, tgt_len)
    pub label_weights: Tensor,     //(batch, tgt_len)
    pub labels: Vec<Vec<i64>>,
}

/// Pads every example to the longest one in the batch and derives the decoder inputs by
/// shifting the labels one position to the right.
pub fn collate(
    examples: &[&TokenizedExample],
    pad_token_id: u32,
    decoder_start_token_id: u32,
    device: &Device,
) -> Result<Seq2SeqBatch> {
    let batch_size = examples.len();
    let src_len = examples.iter().map(|e| e.input_ids.len()).max().unwrap_or(0);
    let tgt_len = examples.iter().map(|e| e.labels.len()).max().unwrap_or(0);

    let mut input_ids = Vec::with_capacity(batch_size * src_len);
    let mut attention_mask = Vec::with_capacity(batch_size * src_len);
    let mut decoder_input_ids = Vec::with_capacity(batch_size * tgt_len);
    let mut targets = Vec::with_capacity(batch_size * tgt_len);
    let mut label_weights = Vec::with_capacity(batch_size * tgt_len);
    let mut labels = Vec::with_capacity(batch_size);

    for example in examples {
        let padding = src_len - example.input_ids.len();
        input_ids.extend(&example.input_ids);
        input_ids.extend(std::iter::repeat(pad_token_id).take(padding));
        attention_mask.extend(&example.attention_mask);
        attention_mask.extend(std::iter::repeat(0).take(padding));

        let row: Vec<i64> = example
            .labels
            .iter()
            .map(|&id| id as i64)
            .chain(std::iter::repeat(IGNORE_INDEX))
            .take(tgt_len)
            .collect();

        decoder_input_ids.push(decoder_start_token_id);
        decoder_input_ids.extend(row[..tgt_len.saturating_sub(1)].iter().map(|&id| {
            if id == IGNORE_INDEX {
                pad_token_id
            } else {
                id as u32
            }
        }));
        for &id in &row {
            let ignored = id == IGNORE_INDEX;
            targets.push(if ignored { 0 } else { id as u32 });
            label_weights.push(if ignored { 0f32 } else { 1f32 });
        }
        labels.push(row);
    }

    Ok(Seq2SeqBatch {
        input_ids: Tensor::from_vec(input_ids, (batch_size, src_len), device)?,
        attention_mask: Tensor::from_vec(attention_mask, (batch_size, src_len), device)?,
        decoder_input_ids: Tensor::from_vec(decoder_input_ids, (batch_size, tgt_len), device)?,
        targets: Tensor::from_vec(targets, (batch_size, tgt_len), device)?,
        label_weights: Tensor::from_vec(label_weights, (batch_size, tgt_len), device)?,
        labels,
    })
}

pub struct Seq2SeqBatcher<'a> {
    dataset: Vec<&'a TokenizedExample>,
    batch_size: usize,
    current_idx: usize,
    pad_token_id: u32,
    decoder_start_token_id: u32,
    device: Device,
}

impl<'a> Seq2SeqBatcher<'a> {
    pub fn new(
        dataset: &'a [TokenizedExample],
        batch_size: usize,
        shuffle_seed: Option<u64>,
        pad_token_id: u32,
        decoder_start_token_id: u32,
        device: &Device,
    ) -> Self {
        let mut dataset = dataset.iter().collect::<Vec<_>>();
        if let Some(seed) = shuffle_seed {
            dataset.shuffle(&mut StdRng::seed_from_u64(seed));
        }

        Self {
            dataset,
            batch_size,
            current_idx: 0,
            pad_token_id,
            decoder_start_token_id,
            device: device.clone(),
        }
    }

    pub fn num_batches(&self) -> usize {
        self.dataset.len().div_ceil(self.batch_size)
    }
}

impl Iterator for Seq2SeqBatcher<'_> {
    type Item = Result<Seq2SeqBatch>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.current_idx >= self.dataset.len() {
            return None;
        }

        // The last batch may be smaller than `batch_size`.
        let end_idx = (self.current_idx + self.batch_size).min(self.dataset.len());
        let batch_items = &self.dataset[self.current_idx..end_idx];
        self.current_idx = end_idx;

        Some(collate(
            batch_items,
            self.pad_token_id,
            self.decoder_start_token_id,
            &self.device,
        ))
    }
}
