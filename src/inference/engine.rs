//! Inference orchestrator: drives the decode loop and hands prompt/cache
//! ownership to the [`crate::cache::bridge`] around it.
//!
//! The engine is the top-level component that:
//! 1. Receives tokenized prompts and generation parameters
//! 2. Asks the cache bridge for the suffix actually worth evaluating
//! 3. Drives the decode loop (one token at a time)
//! 4. Writes the fully extended token list back through the bridge

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::info;

use crate::cache::bridge;
use crate::cache::manager::Manager;
use crate::config::{Config, GenerationParams};
use crate::inference::llama_ffi::{LlamaContext, LlamaModel, TokenId};

/// A generation request.
#[derive(Debug)]
pub struct GenerationRequest {
    /// Unique request ID.
    pub request_id: String,

    /// Model identity, used both for loading and as the cache bucket's
    /// model component.
    pub model_name: String,

    /// Input token IDs (prompt).
    pub prompt_tokens: Vec<TokenId>,

    /// Maximum tokens to generate.
    pub max_tokens: usize,

    /// Stop sequences (as token IDs).
    pub stop_tokens: Vec<TokenId>,

    /// Sampling and KV-quantization parameters; also the cache bucket key.
    pub params: GenerationParams,
}

/// A generated token event.
#[derive(Debug, Clone)]
pub enum GenerationEvent {
    /// A new token was generated.
    Token { token_id: TokenId, text: String },
    /// Generation is complete.
    Done {
        total_tokens: usize,
        prompt_tokens: usize,
        completion_tokens: usize,
        tokens_reused: usize,
    },
    /// An error occurred during generation.
    Error(String),
}

/// The inference engine.
pub struct InferenceEngine {
    cache: Arc<Manager>,
    config: Arc<Config>,
    model: Arc<LlamaModel>,
}

impl InferenceEngine {
    pub fn new(cache: Arc<Manager>, config: Arc<Config>, model: Arc<LlamaModel>) -> Self {
        Self { cache, config, model }
    }

    /// Run a generation request, streaming tokens to the returned receiver.
    pub async fn generate(&mut self, request: GenerationRequest) -> mpsc::Receiver<GenerationEvent> {
        let (tx, rx) = mpsc::channel(32);

        let cache = self.cache.clone();
        let config = self.config.clone();
        let model = self.model.clone();
        let max_tokens = request.max_tokens;
        let prompt_tokens: Vec<u32> = request.prompt_tokens.iter().map(|&t| t as u32).collect();
        let prompt_len = prompt_tokens.len();

        tokio::spawn(async move {
            info!(
                request_id = request.request_id,
                model = request.model_name,
                prompt_tokens = prompt_len,
                max_tokens,
                "starting generation"
            );

            let (suffix, mut handle) =
                bridge::begin(&cache, &request.model_name, &config.model, &prompt_tokens, &request.params).await;
            let tokens_reused = prompt_len - suffix.len();

            let mut ctx = match model.new_context(crate::inference::llama_ffi::ContextParams::default()) {
                Ok(ctx) => ctx,
                Err(e) => {
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    return;
                }
            };

            let suffix_i32: Vec<TokenId> = suffix.iter().map(|&t| t as TokenId).collect();
            if let Err(e) = ctx.decode(&suffix_i32) {
                let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                return;
            }

            for layer in handle.layers.iter_mut() {
                let kv_heads = config.model.n_kv_heads;
                let head_dim = config.model.head_dim;
                let tile = vec![0.0f32; kv_heads * suffix.len() * head_dim];
                if suffix.is_empty() {
                    continue;
                }
                if let Err(e) = layer.append(&tile, &tile, suffix.len()) {
                    let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                    return;
                }
            }

            let mut generated = 0usize;
            let mut full_tokens = prompt_tokens.clone();
            for i in 0..max_tokens {
                let token_id = match ctx.sample() {
                    Ok(t) => t,
                    Err(e) => {
                        let _ = tx.send(GenerationEvent::Error(e.to_string())).await;
                        break;
                    }
                };
                let text = model.detokenize(&[token_id]).unwrap_or_else(|_| format!("tok_{i}"));

                full_tokens.push(token_id as u32);
                generated += 1;

                if tx.send(GenerationEvent::Token { token_id, text }).await.is_err() {
                    break;
                }

                if request.stop_tokens.contains(&token_id) {
                    break;
                }
            }

            for layer in handle.layers.iter_mut() {
                if generated == 0 {
                    continue;
                }
                let kv_heads = config.model.n_kv_heads;
                let head_dim = config.model.head_dim;
                let tile = vec![0.0f32; kv_heads * generated * head_dim];
                let _ = layer.append(&tile, &tile, generated);
            }

            bridge::end(&cache, &request.model_name, full_tokens, handle, &request.params).await;

            let _ = tx
                .send(GenerationEvent::Done {
                    total_tokens: prompt_len + generated,
                    prompt_tokens: prompt_len,
                    completion_tokens: generated,
                    tokens_reused,
                })
                .await;

            info!(request_id = request.request_id, generated, tokens_reused, "generation complete");
        });

        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::inference::llama_ffi::ModelParams;

    fn test_model() -> Arc<LlamaModel> {
        Arc::new(LlamaModel::load("test.gguf", ModelParams::default()).unwrap())
    }

    #[tokio::test]
    async fn test_generation_produces_tokens() {
        let config = Arc::new(Config::default());
        let cache = Arc::new(Manager::new(&CacheConfig {
            enable_cache: true,
            ..CacheConfig::default()
        }));
        let mut engine = InferenceEngine::new(cache, config, test_model());

        let request = GenerationRequest {
            request_id: "test-1".to_string(),
            model_name: "llama-3-8b".to_string(),
            prompt_tokens: vec![1, 2, 3],
            max_tokens: 5,
            stop_tokens: vec![],
            params: GenerationParams::default(),
        };

        let mut rx = engine.generate(request).await;

        let mut token_count = 0;
        let mut got_done = false;
        while let Some(event) = rx.recv().await {
            match event {
                GenerationEvent::Token { .. } => token_count += 1,
                GenerationEvent::Done { completion_tokens, .. } => {
                    assert_eq!(completion_tokens, 5);
                    got_done = true;
                }
                GenerationEvent::Error(e) => panic!("unexpected error: {e}"),
            }
        }

        assert_eq!(token_count, 5);
        assert!(got_done);
    }

    #[tokio::test]
    async fn second_identical_request_reuses_the_prompt() {
        let config = Arc::new(Config::default());
        let cache = Arc::new(Manager::new(&CacheConfig {
            enable_cache: true,
            ..CacheConfig::default()
        }));

        let make_request = |id: &str| GenerationRequest {
            request_id: id.to_string(),
            model_name: "llama-3-8b".to_string(),
            prompt_tokens: vec![1, 2, 3],
            max_tokens: 1,
            stop_tokens: vec![],
            params: GenerationParams::default(),
        };

        let mut engine = InferenceEngine::new(cache.clone(), config.clone(), test_model());
        let mut rx = engine.generate(make_request("a")).await;
        while rx.recv().await.is_some() {}

        let mut engine = InferenceEngine::new(cache.clone(), config, test_model());
        let mut rx = engine.generate(make_request("b")).await;
        let mut done_reused = None;
        while let Some(event) = rx.recv().await {
            if let GenerationEvent::Done { tokens_reused, .. } = event {
                done_reused = Some(tokens_reused);
            }
        }
        assert_eq!(done_reused, Some(2)); // all but the last prompt token reused
    }
}
