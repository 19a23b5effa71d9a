//! Tract-based local embedding pipeline (pure-Rust fallback for platforms
//! without an ONNX Runtime build, enabled via `local-embeddings-tract`).
//!
//! Loads the ONNX model with tract-onnx, tokenizes with the tokenizers
//! crate, and runs inference inside `spawn_blocking`.

use tract_onnx::prelude::*;

use crate::error::{ConduitError, Result};

const ALL_MINILM_REPO: &str = "sentence-transformers/all-MiniLM-L6-v2";
const DEFAULT_MAX_LEN: usize = 256;

fn model_manifest(model_name: &str) -> Result<(&'static str, &'static str)> {
    match model_name {
        "all-minilm-l6-v2" => Ok(("onnx/model.onnx", "tokenizer.json")),
        other => Err(ConduitError::Other(anyhow::anyhow!(
            "tract backend supports only all-minilm-l6-v2, requested '{other}'"
        ))),
    }
}

fn cache_dir() -> Result<std::path::PathBuf> {
    let base = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    let dir = std::path::PathBuf::from(base)
        .join(".cache")
        .join("conduit-kb")
        .join("models");
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

fn download_to_cache(repo: &str, path: &str, cache_path: &std::path::Path) -> Result<()> {
    if cache_path.exists() {
        return Ok(());
    }
    let url = format!(
        "https://huggingface.co/{}/resolve/main/{}",
        repo,
        path.replace(' ', "%20")
    );
    let resp = reqwest::blocking::get(&url)
        .and_then(|r| r.error_for_status())
        .map_err(|e| ConduitError::Other(anyhow::anyhow!("download {url}: {e}")))?;
    let bytes = resp
        .bytes()
        .map_err(|e| ConduitError::Other(anyhow::anyhow!("read body: {e}")))?;
    if let Some(parent) = cache_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(cache_path, &bytes)?;
    Ok(())
}

fn ensure_cached(model_name: &str) -> Result<(std::path::PathBuf, std::path::PathBuf)> {
    let (onnx_rel, tokenizer_rel) = model_manifest(model_name)?;
    let model_dir = cache_dir()?.join(model_name);
    let onnx_path = model_dir.join(onnx_rel);
    let tokenizer_path = model_dir.join(tokenizer_rel);
    download_to_cache(ALL_MINILM_REPO, onnx_rel, &onnx_path)?;
    download_to_cache(ALL_MINILM_REPO, tokenizer_rel, &tokenizer_path)?;
    Ok((onnx_path, tokenizer_path))
}

/// Called from `embedding.rs` when `local-embeddings-tract` is the active local backend.
pub async fn embed_local_tract(model_name: &str, dims: usize, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let model_name = model_name.to_string();
    let texts = texts.to_vec();
    tokio::task::spawn_blocking(move || run_tract_embed(&model_name, dims, &texts))
        .await
        .map_err(|e| ConduitError::Other(e.into()))?
}

fn run_tract_embed(model_name: &str, dims: usize, texts: &[String]) -> Result<Vec<Vec<f32>>> {
    let (onnx_path, tokenizer_path) = ensure_cached(model_name)?;

    let tokenizer = tokenizers::Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| ConduitError::Other(anyhow::anyhow!("load tokenizer: {e}")))?;

    let model = tract_onnx::onnx()
        .model_for_path(&onnx_path)
        .map_err(|e| ConduitError::Other(anyhow::anyhow!("load onnx: {e}")))?
        .into_optimized()
        .map_err(|e| ConduitError::Other(anyhow::anyhow!("optimize: {e}")))?
        .into_runnable()
        .map_err(|e| ConduitError::Other(anyhow::anyhow!("build runnable: {e}")))?;

    let mut all_embeddings = Vec::with_capacity(texts.len());

    for chunk in texts.chunks(16) {
        let encodings: Vec<_> = chunk
            .iter()
            .map(|s| {
                tokenizer
                    .encode(s.as_str(), true)
                    .map_err(|e| ConduitError::Other(anyhow::anyhow!("tokenize: {e}")))
            })
            .collect::<Result<Vec<_>>>()?;

        let max_len = encodings
            .iter()
            .map(|e| e.get_ids().len())
            .max()
            .unwrap_or(1)
            .min(DEFAULT_MAX_LEN);

        let n = encodings.len();
        let mut input_ids = vec![0i64; n * max_len];
        let mut attention_mask = vec![0i64; n * max_len];

        for (i, enc) in encodings.iter().enumerate() {
            let ids = enc.get_ids();
            let len = ids.len().min(max_len);
            for (j, &id) in ids.iter().take(len).enumerate() {
                input_ids[i * max_len + j] = id as i64;
                attention_mask[i * max_len + j] = 1;
            }
        }

        let input_ids_tensor = ndarray::Array2::from_shape_vec((n, max_len), input_ids)
            .map_err(|e| ConduitError::Other(anyhow::anyhow!("input ids shape: {e}")))?;
        let attention_mask_tensor = ndarray::Array2::from_shape_vec((n, max_len), attention_mask)
            .map_err(|e| ConduitError::Other(anyhow::anyhow!("attention mask shape: {e}")))?;

        let input_ids_t: Tensor = input_ids_tensor.into();
        let attention_mask_t: Tensor = attention_mask_tensor.into();
        let result = model
            .run(tvec!(input_ids_t.into(), attention_mask_t.into()))
            .map_err(|e| ConduitError::Other(anyhow::anyhow!("run: {e}")))?;

        let output = result
            .into_iter()
            .next()
            .ok_or_else(|| ConduitError::Other(anyhow::anyhow!("no output tensor")))?;
        let view = output
            .to_array_view::<f32>()
            .map_err(|e| ConduitError::Other(anyhow::anyhow!("output to array: {e}")))?;

        // Output is either [batch, dims] (pooled) or [batch, seq_len, dims]
        // (last_hidden_state), in which case mean-pool over the valid tokens.
        let shape = view.shape();
        if shape.len() == 2 {
            for i in 0..shape[0] {
                let row: Vec<f32> = view.slice(ndarray::s![i, ..]).iter().copied().collect();
                all_embeddings.push(normalize_l2(row));
            }
        } else if shape.len() == 3 {
            let seq_len = shape[1];
            for (i, enc) in encodings.iter().enumerate() {
                let valid_len = enc.get_ids().len().min(seq_len).min(max_len);
                let mut sum = vec![0f32; dims];
                let mut count = 0f32;
                for j in 0..valid_len {
                    for (k, &v) in view.slice(ndarray::s![i, j, ..]).iter().enumerate() {
                        if k < dims {
                            sum[k] += v;
                        }
                    }
                    count += 1.0;
                }
                if count > 0.0 {
                    for x in &mut sum {
                        *x /= count;
                    }
                }
                all_embeddings.push(normalize_l2(sum));
            }
        } else {
            return Err(ConduitError::Other(anyhow::anyhow!(
                "unexpected output shape: {shape:?}"
            )));
        }
    }

    Ok(all_embeddings)
}

fn normalize_l2(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-9 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
