/// ONNX Runtime embedder for sentence-transformers/all-MiniLM-L6-v2.
///
/// Runs the transformer over a padded batch, mean-pools token states under
/// the attention mask and L2-normalises each row.
use std::path::Path;
use std::sync::Mutex;

use ort::session::Session;
use ort::value::Tensor;
use tracing::{debug, info};

use super::tokenizer::SentenceTokenizer;
use super::{Embedder, EmbedderError};

/// Hidden size of all-MiniLM-L6-v2.
pub const MINILM_DIMENSIONS: usize = 384;

/// Texts per inference call; bounds peak memory for long chapters.
const MAX_BATCH: usize = 16;

pub struct OnnxEmbedder {
    session: Mutex<Session>,
    tokenizer: SentenceTokenizer,
    dimensions: usize,
}

impl OnnxEmbedder {
    /// Load `model.onnx` and `tokenizer.json` from `model_dir`.
    pub fn new(model_dir: &Path) -> Result<Self, EmbedderError> {
        let model_path = model_dir.join("model.onnx");

        if !model_path.exists() {
            return Err(EmbedderError::ModelLoadFailed(format!(
                "model.onnx not found in {}",
                model_dir.display()
            )));
        }

        info!("Loading embedding model from {}", model_dir.display());

        let session = Session::builder()
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("session builder error: {e}")))?
            .with_intra_threads(4)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("thread config error: {e}")))?
            .commit_from_file(&model_path)
            .map_err(|e| EmbedderError::ModelLoadFailed(format!("model load error: {e}")))?;

        let tokenizer = SentenceTokenizer::from_model_dir(model_dir)
            .map_err(|e| EmbedderError::TokenizerError(e.to_string()))?;

        info!(
            "Embedding model ready (vocab size: {})",
            tokenizer.vocab_size()
        );

        Ok(Self {
            session: Mutex::new(session),
            tokenizer,
            dimensions: MINILM_DIMENSIONS,
        })
    }

    fn embed_chunk(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let encoded = self
            .tokenizer
            .encode_batch(texts)
            .map_err(|e| EmbedderError::TokenizerError(e.to_string()))?;
        let shape = [encoded.batch, encoded.seq_len];

        let input_ids = Tensor::from_array((shape, encoded.input_ids.clone()))
            .map_err(|e| EmbedderError::InferenceFailed(format!("input_ids error: {e}")))?;
        let attention_mask = Tensor::from_array((shape, encoded.attention_mask.clone()))
            .map_err(|e| EmbedderError::InferenceFailed(format!("attention_mask error: {e}")))?;
        let token_type_ids = Tensor::from_array((shape, encoded.token_type_ids.clone()))
            .map_err(|e| EmbedderError::InferenceFailed(format!("token_type_ids error: {e}")))?;

        let mut session = self
            .session
            .lock()
            .map_err(|e| EmbedderError::InferenceFailed(format!("lock poisoned: {e}")))?;
        let outputs = session
            .run(ort::inputs![
                "input_ids" => input_ids,
                "attention_mask" => attention_mask,
                "token_type_ids" => token_type_ids,
            ])
            .map_err(|e| EmbedderError::InferenceFailed(format!("inference failed: {e}")))?;

        // last_hidden_state: [batch, seq_len, hidden]
        let (_shape, hidden) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("output extraction: {e}")))?;

        let row_len = encoded.seq_len * self.dimensions;
        if hidden.len() != encoded.batch * row_len {
            return Err(EmbedderError::InferenceFailed(format!(
                "unexpected output size {} for batch {}x{}",
                hidden.len(),
                encoded.batch,
                encoded.seq_len
            )));
        }

        Ok((0..encoded.batch)
            .map(|row| {
                let states = &hidden[row * row_len..(row + 1) * row_len];
                let mask = &encoded.attention_mask
                    [row * encoded.seq_len..(row + 1) * encoded.seq_len];
                l2_normalize(mean_pool(states, mask, self.dimensions))
            })
            .collect())
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedderError> {
        self.embed_chunk(&[text])?
            .pop()
            .ok_or_else(|| EmbedderError::InferenceFailed("empty model output".into()))
    }

    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>, EmbedderError> {
        let mut out = Vec::with_capacity(texts.len());
        for chunk in texts.chunks(MAX_BATCH) {
            debug!("embedding batch of {}", chunk.len());
            out.extend(self.embed_chunk(chunk)?);
        }
        Ok(out)
    }

    fn dimensions(&self) -> usize {
        self.dimensions
    }
}

/// Average of the token states whose mask is set. `states` is one row of
/// shape `[seq_len, hidden]`.
fn mean_pool(states: &[f32], mask: &[i64], hidden: usize) -> Vec<f32> {
    let mut pooled = vec![0.0f32; hidden];
    let mut weight = 0.0f32;

    for (token, &m) in states.chunks_exact(hidden).zip(mask) {
        if m == 0 {
            continue;
        }
        weight += 1.0;
        for (acc, v) in pooled.iter_mut().zip(token) {
            *acc += v;
        }
    }

    if weight > 0.0 {
        for v in &mut pooled {
            *v /= weight;
        }
    }
    pooled
}

fn l2_normalize(mut vec: Vec<f32>) -> Vec<f32> {
    let norm = vec.iter().map(|v| v * v).sum::<f32>().sqrt();
    if norm > 0.0 {
        for v in &mut vec {
            *v /= norm;
        }
    }
    vec
}
