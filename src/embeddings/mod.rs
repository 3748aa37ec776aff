pub mod input_embedding;
pub mod positional_embedding;
