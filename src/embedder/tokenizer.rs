/// WordPiece tokenization for the sentence-transformer ONNX model.
use std::path::Path;

use anyhow::Result;
use tokenizers::{PaddingParams, Tokenizer, TruncationParams};

/// all-MiniLM-L6-v2 was trained on sequences of at most 256 word pieces.
pub const MAX_SEQUENCE_LENGTH: usize = 256;

/// HuggingFace tokenizer configured to truncate and pad batches.
pub struct SentenceTokenizer {
    inner: Tokenizer,
}

/// A rectangular batch of encodings, flattened row-major as
/// `[batch, seq_len]`.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedBatch {
    pub batch: usize,
    pub seq_len: usize,
    pub input_ids: Vec<i64>,
    pub attention_mask: Vec<i64>,
    pub token_type_ids: Vec<i64>,
}

impl SentenceTokenizer {
    /// Load `tokenizer.json` from the model directory.
    pub fn from_model_dir(model_dir: &Path) -> Result<Self> {
        let tokenizer_path = model_dir.join("tokenizer.json");

        anyhow::ensure!(
            tokenizer_path.exists(),
            "tokenizer.json not found in {}",
            model_dir.display()
        );

        let mut inner = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow::anyhow!("failed to load tokenizer: {e}"))?;

        inner
            .with_truncation(Some(TruncationParams {
                max_length: MAX_SEQUENCE_LENGTH,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("failed to configure truncation: {e}"))?;

        // Pad every batch to its longest member
        inner.with_padding(Some(PaddingParams::default()));

        Ok(Self { inner })
    }

    /// Encode `texts` into one padded batch.
    pub fn encode_batch(&self, texts: &[&str]) -> Result<EncodedBatch> {
        let encodings = self
            .inner
            .encode_batch(texts.to_vec(), true)
            .map_err(|e| anyhow::anyhow!("failed to encode batch: {e}"))?;

        let seq_len = encodings.first().map_or(0, |e| e.get_ids().len());
        let mut out = EncodedBatch {
            batch: encodings.len(),
            seq_len,
            input_ids: Vec::with_capacity(encodings.len() * seq_len),
            attention_mask: Vec::with_capacity(encodings.len() * seq_len),
            token_type_ids: Vec::with_capacity(encodings.len() * seq_len),
        };

        for enc in &encodings {
            anyhow::ensure!(
                enc.get_ids().len() == seq_len,
                "tokenizer returned ragged batch"
            );
            out.input_ids
                .extend(enc.get_ids().iter().map(|&id| i64::from(id)));
            out.attention_mask
                .extend(enc.get_attention_mask().iter().map(|&m| i64::from(m)));
            out.token_type_ids
                .extend(enc.get_type_ids().iter().map(|&t| i64::from(t)));
        }

        Ok(out)
    }

    #[must_use]
    pub fn vocab_size(&self) -> usize {
        self.inner.get_vocab_size(false)
    }
}
