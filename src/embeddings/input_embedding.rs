use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{embedding, Embedding, VarBuilder};

/// Token embedding shared by the encoder, the decoder and (when tied) the LM head.
/// T5 does not scale the embeddings by sqrt(d_model).
pub struct InputEmbedding {
    embedding: Embedding,
    dtype: DType,
}

impl InputEmbedding {
    pub fn new(vocab_size: usize, d_model: usize, dtype: DType, vb: VarBuilder) -> Result<Self> {
        let embedding = embedding(vocab_size, d_model, vb)?;
        Ok(Self { embedding, dtype })
    }

    pub fn weight(&self) -> &Tensor {
        self.embedding.embeddings()
    }
}

impl Module for InputEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        // (batch_sz, seq_len) --> (batch_sz, seq_len, d_model)
        self.embedding.forward(xs)?.to_dtype(self.dtype)
    }
}
