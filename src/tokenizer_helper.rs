use std::path::Path;

use tokenizers::{Tokenizer, TruncationParams};

use crate::error::{Error, Result};

/// Loads a `tokenizer.json` with padding and truncation switched off; truncation is set by
/// the preprocessor and padding by the collator.
pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer> {
    let mut tokenizer = Tokenizer::from_file(path.as_ref()).map_err(Error::tokenizer)?;
    tokenizer.with_padding(None);
    tokenizer.with_truncation(None).map_err(Error::tokenizer)?;
    Ok(tokenizer)
}

pub fn with_max_length(tokenizer: &Tokenizer, max_length: usize) -> Result<Tokenizer> {
    let mut tokenizer = tokenizer.clone();
    tokenizer
        .with_truncation(Some(TruncationParams {
            max_length,
            ..Default::default()
        }))
        .map_err(Error::tokenizer)?;
    Ok(tokenizer)
}

pub fn token_id(tokenizer: &Tokenizer, token: &str) -> Result<u32> {
    tokenizer
        .token_to_id(token)
        .ok_or_else(|| Error::MissingToken(token.to_string()))
}

pub fn decode(tokenizer: &Tokenizer, ids: &[u32], skip_special_tokens: bool) -> Result<String> {
    tokenizer
        .decode(ids, skip_special_tokens)
        .map_err(Error::tokenizer)
}

/// Word-level tokenizer with T5-style special tokens (`<pad>` = 0, `</s>` = 1, `<unk>` = 2)
/// and an appended `</s>`, trained on `sequences`. Lets tests run without downloading a
/// checkpoint.
#[cfg(test)]
pub fn train_word_level(dir: &Path, sequences: Vec<String>) -> Tokenizer {
    use tokenizers::models::wordlevel::{WordLevel, WordLevelTrainerBuilder};
    use tokenizers::pre_tokenizers::whitespace::WhitespaceSplit;
    use tokenizers::processors::template::TemplateProcessing;
    use tokenizers::{
        AddedToken, DecoderWrapper, NormalizerWrapper, PostProcessorWrapper, PreTokenizerWrapper,
        TokenizerBuilder,
    };

    let mut trainer = WordLevelTrainerBuilder::default()
        .show_progress(false)
        .special_tokens(vec![
            AddedToken::from("<pad>", true),
            AddedToken::from("</s>", true),
            AddedToken::from("<unk>", true),
        ])
        .build()
        .unwrap();

    let template = TemplateProcessing::builder()
        .try_single("$A </s>")
        .unwrap()
        .special_tokens(vec![("</s>", 1)])
        .build()
        .unwrap();

    let mut tokenizer = TokenizerBuilder::<
        WordLevel,
        NormalizerWrapper,
        PreTokenizerWrapper,
        PostProcessorWrapper,
        DecoderWrapper,
    >::default()
    .with_model(
        WordLevel::builder()
            .unk_token("<unk>".to_string())
            .build()
            .unwrap(),
    )
    .with_pre_tokenizer(Some(PreTokenizerWrapper::WhitespaceSplit(WhitespaceSplit)))
    .with_post_processor(Some(PostProcessorWrapper::Template(template)))
    .build()
    .unwrap();

    let filename = dir.join("tokenizer.json");
    tokenizer
        .train(&mut trainer, sequences.into_iter())
        .unwrap()
        .save(&filename, false)
        .unwrap();

    load_tokenizer(&filename).unwrap()
}
