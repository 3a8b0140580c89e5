use anyhow::{Result, bail};
use async_trait::async_trait;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{Device, Tensor};
use candle_nn::ops::softmax;
use candle_nn::{Linear, Module, VarBuilder, linear};
use candle_transformers::models::bert::{BertModel, Config as BertConfig, DTYPE};
use chrono::Utc;
use hf_hub::{Repo, RepoType, api::tokio::Api};
use std::path::PathBuf;
use tokenizers::{PaddingParams, Tokenizer};
use uuid::Uuid;

use crate::engine::BatchedEngine;
use crate::types::{ClassificationRequest, ClassificationResponse, EmotionLabel};

/// BERT encoder plus an explicitly constructed pooler and six-way
/// classification head, matching the checkpoint layout of a
/// `BertForSequenceClassification` fine-tune.
///
/// All fields are read-only after construction; `classify_batch` takes
/// `&self` and concurrent callers share one instance behind an `Arc`.
pub struct BertEmotionEngine {
    model: BertModel,
    pooler: Linear,
    classifier: Linear,
    tokenizer: Tokenizer,
    device: Device,
}

#[derive(Debug, Clone)]
pub struct BertEngineConfig {
    pub model_id: Option<String>,
    pub model_path: Option<PathBuf>,
    pub revision: String,
    pub use_pth: bool,
    pub cpu: bool,
    pub max_sequence_length: usize,
}

impl Default for BertEngineConfig {
    fn default() -> Self {
        Self {
            model_id: None,
            model_path: None,
            revision: "main".to_string(),
            use_pth: false,
            cpu: false,
            max_sequence_length: 512,
        }
    }
}

impl BertEmotionEngine {
    fn device(cpu: bool) -> Result<Device> {
        if cpu {
            Ok(Device::Cpu)
        } else if metal_is_available() {
            tracing::info!("Using metal acceleration");
            Ok(Device::new_metal(0)?)
        } else if cuda_is_available() {
            tracing::info!("Using CUDA GPU acceleration");
            Ok(Device::new_cuda(0)?)
        } else {
            tracing::info!(
                "CUDA not available, running on CPU. To run on GPU, build with `--features cuda`"
            );
            Ok(Device::Cpu)
        }
    }

    /// Loads tokenizer, configuration, and weights, then builds the model in
    /// one deterministic pass. Any missing file or missing/mismatched tensor
    /// is an error; there is no partial weight loading.
    #[tracing::instrument(skip(config), fields(model_id = ?config.model_id, cpu = config.cpu))]
    pub async fn new(config: BertEngineConfig) -> Result<Self> {
        let device = Self::device(config.cpu)?;

        // Get files from either the HuggingFace API, or from a specified local directory
        let (config_filename, tokenizer_filename, weights_filename) = {
            match &config.model_path {
                Some(base_path) => {
                    if !base_path.is_dir() {
                        bail!("Model path {} is not a directory.", base_path.display());
                    }

                    let config_file = base_path.join("config.json");
                    let tokenizer_file = base_path.join("tokenizer.json");
                    let weights_file = if config.use_pth {
                        base_path.join("pytorch_model.bin")
                    } else {
                        base_path.join("model.safetensors")
                    };
                    (config_file, tokenizer_file, weights_file)
                }
                None => {
                    let Some(model_id) = config.model_id else {
                        bail!("Either model_id or model_path must be specified");
                    };

                    let repo =
                        Repo::with_revision(model_id, RepoType::Model, config.revision.clone());
                    let api = Api::new()?;
                    let api = api.repo(repo);
                    let config_file = api.get("config.json").await?;
                    let tokenizer_file = api.get("tokenizer.json").await?;
                    let weights_file = if config.use_pth {
                        api.get("pytorch_model.bin").await?
                    } else {
                        api.get("model.safetensors").await?
                    };
                    (config_file, tokenizer_file, weights_file)
                }
            }
        };

        let model_config = std::fs::read_to_string(config_filename)?;
        let model_config: BertConfig = serde_json::from_str(&model_config)?;

        let mut tokenizer = Tokenizer::from_file(tokenizer_filename)
            .map_err(|e| anyhow::anyhow!("Tokenizer error: {e}"))?;
        tokenizer.with_padding(Some(PaddingParams::default()));
        tokenizer
            .with_truncation(Some(tokenizers::TruncationParams {
                max_length: config.max_sequence_length,
                ..Default::default()
            }))
            .map_err(|e| anyhow::anyhow!("Tokenizer truncation error: {e}"))?;

        let vb = if config.use_pth {
            VarBuilder::from_pth(&weights_filename, DTYPE, &device)?
        } else {
            unsafe { VarBuilder::from_mmaped_safetensors(&[weights_filename], DTYPE, &device)? }
        };

        // Checkpoint layout: `bert.*` for the encoder and pooler,
        // `classifier.*` for the fine-tuned head.
        let model = BertModel::load(vb.pp("bert"), &model_config)?;
        let pooler = linear(
            model_config.hidden_size,
            model_config.hidden_size,
            vb.pp("bert").pp("pooler").pp("dense"),
        )?;
        let classifier = linear(
            model_config.hidden_size,
            EmotionLabel::COUNT,
            vb.pp("classifier"),
        )?;

        Ok(Self {
            model,
            pooler,
            classifier,
            tokenizer,
            device,
        })
    }

    /// One forward pass over a padded batch, returning per-text logits of
    /// shape `[batch, 6]`.
    fn forward(
        &self,
        input_ids: &Tensor,
        token_type_ids: &Tensor,
        attention_mask: &Tensor,
    ) -> Result<Tensor> {
        let hidden = self
            .model
            .forward(input_ids, token_type_ids, Some(attention_mask))?;
        // Pool on the [CLS] token, as BertForSequenceClassification does.
        let cls = hidden.narrow(1, 0, 1)?.squeeze(1)?;
        let pooled = self.pooler.forward(&cls)?.tanh()?;
        Ok(self.classifier.forward(&pooled)?)
    }
}

/// First strict maximum in index order, so tied logits resolve to the
/// lowest index.
pub(crate) fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (index, &value) in logits.iter().enumerate().skip(1) {
        if value > logits[best] {
            best = index;
        }
    }
    best
}

#[async_trait]
impl BatchedEngine for BertEmotionEngine {
    #[tracing::instrument(skip(self, requests), fields(batch_size = requests.len()))]
    async fn classify_batch(
        &self,
        requests: Vec<ClassificationRequest>,
    ) -> Result<Vec<Result<ClassificationResponse>>> {
        let texts: Vec<String> = requests.iter().map(|r| r.text.clone()).collect();

        // Tokenize the whole batch off the async runtime
        let tokenizer_clone = self.tokenizer.clone();
        let (input_ids, attention_mask, token_type_ids) = tokio::task::spawn_blocking(move || {
            tokenizer_clone
                .encode_batch(texts, true)
                .map_err(|e| anyhow::anyhow!("Tokenization error: {e}"))
                .map(|encodings| {
                    let mut encoding_stack = Vec::default();
                    let mut attention_mask_stack = Vec::default();
                    let mut token_type_id_stack = Vec::default();

                    for encoding in &encodings {
                        encoding_stack.push(encoding.get_ids().to_vec());
                        attention_mask_stack.push(encoding.get_attention_mask().to_vec());
                        token_type_id_stack.push(encoding.get_type_ids().to_vec());
                    }

                    (encoding_stack, attention_mask_stack, token_type_id_stack)
                })
        })
        .await??;

        // Convert to tensors
        let input_ids_tensors: Result<Vec<_>> = input_ids
            .iter()
            .map(|ids| Tensor::new(ids.as_slice(), &self.device).map_err(anyhow::Error::from))
            .collect();
        let attention_mask_tensors: Result<Vec<_>> = attention_mask
            .iter()
            .map(|mask| Tensor::new(mask.as_slice(), &self.device).map_err(anyhow::Error::from))
            .collect();
        let token_type_ids_tensors: Result<Vec<_>> = token_type_ids
            .iter()
            .map(|types| Tensor::new(types.as_slice(), &self.device).map_err(anyhow::Error::from))
            .collect();

        let input_ids = Tensor::stack(&input_ids_tensors?, 0)?;
        let attention_mask = Tensor::stack(&attention_mask_tensors?, 0)?;
        let token_type_ids = Tensor::stack(&token_type_ids_tensors?, 0)?;

        let logits = self.forward(&input_ids, &token_type_ids, &attention_mask)?;
        let logit_rows = logits.to_vec2::<f32>()?;
        let scores = softmax(&logits, 1)?.to_vec2::<f32>()?;

        let mut responses: Vec<Result<ClassificationResponse>> = Vec::new();

        for (row, probs) in logit_rows.iter().zip(scores.iter()) {
            let index = argmax(row);
            let response = EmotionLabel::from_index(index)
                .ok_or_else(|| anyhow::anyhow!("Predicted index {index} has no label"))
                .map(|label| ClassificationResponse {
                    id: format!("classify-{}", Uuid::new_v4().simple()),
                    created: Utc::now().timestamp(),
                    label,
                    index,
                    probs: probs.iter().map(|&x| x as f64).collect(),
                });
            responses.push(response);
        }

        Ok(responses)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn argmax_picks_the_maximal_logit() {
        assert_eq!(argmax(&[0.1, 0.3, 2.5, -1.0, 0.0, 0.2]), 2);
        assert_eq!(argmax(&[-3.0, -1.5, -2.0, -0.5, -4.0, -0.9]), 3);
    }

    #[test]
    fn argmax_ties_resolve_to_the_lowest_index() {
        assert_eq!(argmax(&[1.0, 1.0, 0.0, 0.0, 0.0, 0.0]), 0);
        assert_eq!(argmax(&[0.0, 2.0, 2.0, 2.0, 0.0, 0.0]), 1);
        assert_eq!(argmax(&[0.5; 6]), 0);
    }

    #[test]
    fn argmax_result_is_always_a_valid_label_index() {
        let rows = [
            [1.0, 2.0, 3.0, 4.0, 5.0, 6.0],
            [6.0, 5.0, 4.0, 3.0, 2.0, 1.0],
            [0.0; 6],
        ];
        for row in rows {
            assert!(EmotionLabel::from_index(argmax(&row)).is_some());
        }
    }

    // The tests below need the reference fine-tuned checkpoint. Point
    // MAUM_MODEL_DIR at a directory holding config.json, tokenizer.json and
    // pytorch_model.bin, then run with `cargo test -- --ignored`.

    fn reference_config() -> BertEngineConfig {
        let dir = std::env::var_os("MAUM_MODEL_DIR").expect("MAUM_MODEL_DIR is not set");
        BertEngineConfig {
            model_path: Some(PathBuf::from(dir)),
            use_pth: true,
            cpu: true,
            ..Default::default()
        }
    }

    async fn classify_one(engine: &BertEmotionEngine, text: &str) -> ClassificationResponse {
        let mut responses = engine
            .classify_batch(vec![ClassificationRequest {
                text: text.to_string(),
            }])
            .await
            .unwrap();
        responses.remove(0).unwrap()
    }

    #[tokio::test]
    #[ignore = "requires the reference fine-tuned weights"]
    async fn reference_weights_classify_happy_day_as_joy() {
        let engine = BertEmotionEngine::new(reference_config()).await.unwrap();
        let response = classify_one(&engine, "행복한 하루였다").await;
        assert_eq!(response.label, EmotionLabel::Joy);
        assert_eq!(response.index, 0);
    }

    #[tokio::test]
    #[ignore = "requires the reference fine-tuned weights"]
    async fn classification_is_deterministic() {
        let engine = BertEmotionEngine::new(reference_config()).await.unwrap();
        let text = "오늘은 정말 힘든 하루였다";
        let first = classify_one(&engine, text).await;
        let second = classify_one(&engine, text).await;
        assert_eq!(first.label, second.label);
        assert_eq!(first.probs, second.probs);
    }

    #[tokio::test]
    #[ignore = "requires the reference fine-tuned weights"]
    async fn long_input_matches_its_first_512_tokens() {
        let engine = BertEmotionEngine::new(reference_config()).await.unwrap();
        // Both inputs exceed the 512-token window and share the same prefix,
        // so after truncation they are the same sequence.
        let long = "행복한 하루였다 ".repeat(2000);
        let shorter = "행복한 하루였다 ".repeat(600);
        let a = classify_one(&engine, &long).await;
        let b = classify_one(&engine, &shorter).await;
        assert_eq!(a.label, b.label);
    }

    #[tokio::test]
    #[ignore = "requires the reference fine-tuned weights"]
    async fn empty_input_still_yields_a_label() {
        let engine = BertEmotionEngine::new(reference_config()).await.unwrap();
        let response = classify_one(&engine, "").await;
        assert!(EmotionLabel::from_index(response.index).is_some());
    }
}
