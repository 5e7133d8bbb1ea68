// export/ — ONNX export stage.
//
// Two halves:
// - trace: load the checkpoint with candle and run the forward pass on the
//   fixed dummy sentence, proving the computation before anything is written.
// - lowering: build the opset-14 graph directly from the safetensors tensors
//   (bert.rs on top of builder.rs) and serialize it with prost.

pub mod bert;
pub mod builder;

use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use candle_core::{DType, Device, Tensor};
use candle_nn::VarBuilder;
use candle_onnx::onnx::tensor_proto::DataType;
use candle_transformers::models::bert::{BertModel, Config as BertConfig};
use prost::Message;
use tokenizers::Tokenizer;

use crate::{config, fetch};

use self::bert::{lower_bert, ModelConfig, Weights};
use self::builder::{tensor_value_info, Dim, GraphBuilder};

/// Run the export stage against a populated artifact directory.
/// Returns the path of the exported graph (model.onnx).
pub fn export_onnx(model_dir: &Path) -> anyhow::Result<PathBuf> {
    log::info!("Converting to ONNX format...");

    let config_path = model_dir.join("config.json");
    let config_str = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read {}", config_path.display()))?;
    let model_cfg: ModelConfig = serde_json::from_str(&config_str)
        .with_context(|| format!("parse {}", config_path.display()))?;
    let bert_cfg: BertConfig = serde_json::from_str(&config_str)
        .with_context(|| format!("parse {} as BERT config", config_path.display()))?;

    log::info!(
        "Model architecture: hidden_size={}, layers={}, heads={}, vocab_size={}, type_vocab_size={}",
        bert_cfg.hidden_size,
        bert_cfg.num_hidden_layers,
        bert_cfg.num_attention_heads,
        model_cfg.vocab_size,
        model_cfg.type_vocab_size,
    );

    // Trace first. A checkpoint that cannot run its own forward pass must
    // abort the pipeline; no partial export is valid.
    let (seq_len, hidden) = trace_forward(model_dir, &bert_cfg)?;
    if hidden != model_cfg.hidden_size {
        bail!(
            "traced hidden size {hidden} does not match config hidden_size {}",
            model_cfg.hidden_size
        );
    }
    if seq_len > model_cfg.max_position_embeddings {
        bail!(
            "traced sequence length {seq_len} exceeds max_position_embeddings {}",
            model_cfg.max_position_embeddings
        );
    }
    log::info!("Traced forward pass on dummy input: [1, {seq_len}, {hidden}]");

    // Lower the same computation to ONNX from the raw checkpoint tensors.
    let weights_path = model_dir.join("model.safetensors");
    let weight_bytes = std::fs::read(&weights_path)
        .with_context(|| format!("read {}", weights_path.display()))?;
    let weights = Weights::from_safetensors(&weight_bytes)?;

    let mut g = GraphBuilder::new();
    lower_bert(&mut g, &model_cfg, &weights)?;

    let dyn_2d = [
        Dim::Dynamic(config::export::DYN_BATCH),
        Dim::Dynamic(config::export::DYN_SEQUENCE),
    ];
    let model = g.finish(
        vec![
            tensor_value_info(config::export::INPUT_IDS, DataType::Int64, &dyn_2d),
            tensor_value_info(config::export::ATTENTION_MASK, DataType::Int64, &dyn_2d),
        ],
        vec![tensor_value_info(
            config::export::LAST_HIDDEN_STATE,
            DataType::Float,
            &[
                Dim::Dynamic(config::export::DYN_BATCH),
                Dim::Dynamic(config::export::DYN_SEQUENCE),
                Dim::Fixed(model_cfg.hidden_size as i64),
            ],
        )],
    );

    let onnx_path = model_dir.join(config::export::ONNX_FILE);
    let encoded = model.encode_to_vec();
    fetch::write_atomic(&onnx_path, &encoded)?;

    log::info!(
        "Model exported to {} ({} bytes)",
        onnx_path.display(),
        encoded.len()
    );
    Ok(onnx_path)
}

/// Load the checkpoint with candle and run the forward pass on the fixed
/// dummy sentence. Returns (sequence length, hidden size) of the output.
fn trace_forward(model_dir: &Path, bert_cfg: &BertConfig) -> anyhow::Result<(usize, usize)> {
    let device = Device::Cpu;

    let weights_path = model_dir.join("model.safetensors");
    let vb = unsafe {
        VarBuilder::from_mmaped_safetensors(&[weights_path.clone()], DType::F32, &device)
            .with_context(|| format!("load weights from {}", weights_path.display()))?
    };
    let model = BertModel::load(vb, bert_cfg).context("load BERT model")?;

    let tokenizer_path = model_dir.join("tokenizer.json");
    let tokenizer = Tokenizer::from_file(&tokenizer_path)
        .map_err(|e| anyhow::anyhow!("load tokenizer: {e}"))?;

    let encoding = tokenizer
        .encode(config::export::DUMMY_SENTENCE, true)
        .map_err(|e| anyhow::anyhow!("tokenize dummy sentence: {e}"))?;

    let token_ids = encoding.get_ids();
    let attention_mask = encoding.get_attention_mask();

    // Truncate to the model context limit, mirroring the exported contract.
    let len = token_ids.len().min(config::export::MAX_TOKENS);
    let token_ids = &token_ids[..len];
    let attention_mask = &attention_mask[..len];

    // Tensors [1, seq_len].
    let token_ids_t = Tensor::new(
        token_ids.iter().map(|&id| id as i64).collect::<Vec<_>>().as_slice(),
        &device,
    )?
    .unsqueeze(0)?;
    let attention_mask_t = Tensor::new(
        attention_mask.iter().map(|&m| m as i64).collect::<Vec<_>>().as_slice(),
        &device,
    )?
    .unsqueeze(0)?;
    let token_type_ids = token_ids_t.zeros_like()?;

    let output = model.forward(&token_ids_t, &token_type_ids, Some(&attention_mask_t))?;
    let (batch, seq, hidden) = output.dims3().context("trace output is not rank 3")?;
    if batch != 1 || seq != len {
        bail!("unexpected trace output shape [{batch}, {seq}, {hidden}] for input length {len}");
    }

    Ok((seq, hidden))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_model_config_parses_bge_small_config() {
        // The shape of BAAI/bge-small-en-v1.5's config.json (abridged).
        let json = r#"{
            "architectures": ["BertModel"],
            "model_type": "bert",
            "vocab_size": 30522,
            "hidden_size": 384,
            "num_hidden_layers": 12,
            "num_attention_heads": 12,
            "intermediate_size": 1536,
            "hidden_act": "gelu",
            "max_position_embeddings": 512,
            "type_vocab_size": 2,
            "layer_norm_eps": 1e-12
        }"#;
        let cfg: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.hidden_size, 384);
        assert_eq!(cfg.num_hidden_layers, 12);
        assert_eq!(cfg.hidden_act, "gelu");
    }

    #[test]
    fn test_model_config_defaults() {
        let json = r#"{
            "vocab_size": 16,
            "hidden_size": 8,
            "num_hidden_layers": 1,
            "num_attention_heads": 2,
            "intermediate_size": 16,
            "max_position_embeddings": 32
        }"#;
        let cfg: ModelConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.type_vocab_size, 2);
        assert_eq!(cfg.hidden_act, "gelu");
        assert!((cfg.layer_norm_eps - 1e-12).abs() < f64::EPSILON);
    }
}
