// bert.rs — Lowering of the BERT forward computation onto the ONNX builder.
//
// Emits the same computation the traced candle model performs: embeddings
// (word + position + token type, LayerNorm), then N encoder layers of
// multi-head self-attention with an additive mask and an erf-form GELU
// feed-forward block. Everything is expressed with opset-14 semantics:
// LayerNorm is decomposed into primitives, Unsqueeze takes its axes as an
// input tensor, ReduceMean takes them as an attribute.
//
// Constant folding happens at construction time: linear weights are stored
// pre-transposed for MatMul, and scalar constants (sqrt(head_size), the
// mask fill value, eps) are baked in as initializers.

use std::collections::BTreeMap;

use anyhow::{bail, Context};
use candle_onnx::onnx::tensor_proto;
use serde::Deserialize;

use crate::config;

use super::builder::{attr_int, GraphBuilder};

/// The architecture fields of config.json the lowering needs. Parsed
/// separately from candle's own `bert::Config` (which drives the trace) so
/// the graph construction depends only on the documented JSON contract.
#[derive(Debug, Clone, Deserialize)]
pub struct ModelConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub intermediate_size: usize,
    pub max_position_embeddings: usize,
    #[serde(default = "default_type_vocab_size")]
    pub type_vocab_size: usize,
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f64,
    #[serde(default = "default_hidden_act")]
    pub hidden_act: String,
}

fn default_type_vocab_size() -> usize {
    2
}

fn default_layer_norm_eps() -> f64 {
    1e-12
}

fn default_hidden_act() -> String {
    "gelu".to_string()
}

/// Checkpoint tensors, decoded from safetensors into host floats.
pub struct Weights {
    tensors: BTreeMap<String, WeightTensor>,
}

pub struct WeightTensor {
    pub dims: Vec<i64>,
    pub data: Vec<f32>,
}

impl Weights {
    pub fn new() -> Self {
        Self {
            tensors: BTreeMap::new(),
        }
    }

    pub fn insert(&mut self, name: &str, dims: Vec<i64>, data: Vec<f32>) {
        self.tensors.insert(name.to_string(), WeightTensor { dims, data });
    }

    /// Decode a safetensors buffer. All BGE checkpoints store f32 weights;
    /// anything else is rejected rather than silently converted.
    pub fn from_safetensors(bytes: &[u8]) -> anyhow::Result<Self> {
        let st = safetensors::SafeTensors::deserialize(bytes)
            .context("failed to parse model.safetensors")?;

        let mut out = Self::new();
        for (name, view) in st.tensors() {
            if view.dtype() != safetensors::Dtype::F32 {
                bail!(
                    "unsupported dtype {:?} for tensor {name} (expected F32)",
                    view.dtype()
                );
            }
            let dims: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
            let data: Vec<f32> = view
                .data()
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect();
            out.insert(&name, dims, data);
        }
        Ok(out)
    }

    /// Look up a tensor by its logical name, tolerating the `bert.` prefix
    /// some checkpoints carry.
    pub fn get(&self, name: &str) -> anyhow::Result<&WeightTensor> {
        self.tensors
            .get(name)
            .or_else(|| self.tensors.get(&format!("bert.{name}")))
            .with_context(|| format!("checkpoint is missing tensor {name}"))
    }
}

/// Emit the full forward graph. The final hidden state is written to the
/// fixed `last_hidden_state` output name.
pub fn lower_bert(g: &mut GraphBuilder, cfg: &ModelConfig, w: &Weights) -> anyhow::Result<()> {
    if cfg.hidden_size % cfg.num_attention_heads != 0 {
        bail!(
            "hidden_size {} not divisible by num_attention_heads {}",
            cfg.hidden_size,
            cfg.num_attention_heads
        );
    }

    let mut x = embeddings(g, cfg, w)?;
    let ext_mask = extended_attention_mask(g);

    for i in 0..cfg.num_hidden_layers {
        let is_last = i + 1 == cfg.num_hidden_layers;
        x = encoder_layer(g, cfg, w, &x, &ext_mask, i, is_last)?;
    }

    Ok(())
}

/// word + position + token-type embeddings, summed and normalized.
fn embeddings(g: &mut GraphBuilder, cfg: &ModelConfig, w: &Weights) -> anyhow::Result<String> {
    let ids = config::export::INPUT_IDS;

    let word_table = reg_weight(g, w, "embeddings.word_embeddings.weight")?;
    let word = g.push("Gather", &[&word_table, ids], vec![attr_int("axis", 0)]);

    // Position ids for a dynamic sequence length: Range over dim 1 of the
    // input shape, unsqueezed to [1, seq] so the gather broadcasts over batch.
    let shape = g.push("Shape", &[ids], vec![]);
    let seq_idx = g.scalar_i64(1);
    let seq_len = g.push("Gather", &[&shape, &seq_idx], vec![attr_int("axis", 0)]);
    let start = g.scalar_i64(0);
    let step = g.scalar_i64(1);
    let range = g.push("Range", &[&start, &seq_len, &step], vec![]);
    let pos_ids = g.unsqueeze(&range, &[0]);
    let pos_table = reg_weight(g, w, "embeddings.position_embeddings.weight")?;
    let pos = g.push("Gather", &[&pos_table, &pos_ids], vec![attr_int("axis", 0)]);

    // Token type ids are all zero for single-sentence inputs; x - x keeps the
    // dynamic shape without a dedicated zeros constant.
    let zeros = g.push("Sub", &[ids, ids], vec![]);
    let type_table = reg_weight(g, w, "embeddings.token_type_embeddings.weight")?;
    let tok = g.push("Gather", &[&type_table, &zeros], vec![attr_int("axis", 0)]);

    let sum = g.push("Add", &[&word, &pos], vec![]);
    let sum = g.push("Add", &[&sum, &tok], vec![]);

    layer_norm(g, cfg, w, &sum, "embeddings.LayerNorm", None)
}

/// [batch, seq] 0/1 mask -> [batch, 1, 1, seq] additive float mask.
fn extended_attention_mask(g: &mut GraphBuilder) -> String {
    let mask_f = g.push(
        "Cast",
        &[config::export::ATTENTION_MASK],
        vec![attr_int("to", tensor_proto::DataType::Float as i64)],
    );
    let expanded = g.unsqueeze(&mask_f, &[1, 2]);
    let one = g.scalar_f32(1.0);
    let inverted = g.push("Sub", &[&one, &expanded], vec![]);
    let fill = g.scalar_f32(config::export::ATTENTION_MASK_FILL);
    g.push("Mul", &[&inverted, &fill], vec![])
}

fn encoder_layer(
    g: &mut GraphBuilder,
    cfg: &ModelConfig,
    w: &Weights,
    x: &str,
    ext_mask: &str,
    layer: usize,
    is_last: bool,
) -> anyhow::Result<String> {
    let p = format!("encoder.layer.{layer}");
    let heads = cfg.num_attention_heads as i64;
    let head_size = (cfg.hidden_size / cfg.num_attention_heads) as i64;

    // Projections. [batch, seq, hidden] x [hidden, hidden].
    let q = linear(g, w, x, &format!("{p}.attention.self.query"))?;
    let k = linear(g, w, x, &format!("{p}.attention.self.key"))?;
    let v = linear(g, w, x, &format!("{p}.attention.self.value"))?;

    // Split heads: [batch, seq, hidden] -> [batch, heads, seq, head_size].
    // Zeros in the reshape target copy the batch/seq dims through.
    let q4 = split_heads(g, &q, heads, head_size);
    let k4 = split_heads(g, &k, heads, head_size);
    let v4 = split_heads(g, &v, heads, head_size);

    // Scaled dot-product attention with the additive mask.
    let k4t = g.transpose(&k4, &[0, 1, 3, 2]);
    let scores = g.push("MatMul", &[&q4, &k4t], vec![]);
    let scale = g.scalar_f32((head_size as f32).sqrt());
    let scores = g.push("Div", &[&scores, &scale], vec![]);
    let scores = g.push("Add", &[&scores, ext_mask], vec![]);
    let probs = g.push("Softmax", &[&scores], vec![attr_int("axis", -1)]);
    let ctx = g.push("MatMul", &[&probs, &v4], vec![]);

    // Merge heads back to [batch, seq, hidden].
    let ctx = g.transpose(&ctx, &[0, 2, 1, 3]);
    let ctx = g.reshape(&ctx, &[0, 0, -1]);

    let attn = linear(g, w, &ctx, &format!("{p}.attention.output.dense"))?;
    let res = g.push("Add", &[&attn, x], vec![]);
    let x = layer_norm(g, cfg, w, &res, &format!("{p}.attention.output.LayerNorm"), None)?;

    // Feed-forward block.
    let inter = linear(g, w, &x, &format!("{p}.intermediate.dense"))?;
    let act = activation(g, cfg, &inter);
    let out = linear(g, w, &act, &format!("{p}.output.dense"))?;
    let res = g.push("Add", &[&out, &x], vec![]);

    let out_name = is_last.then_some(config::export::LAST_HIDDEN_STATE);
    layer_norm(g, cfg, w, &res, &format!("{p}.output.LayerNorm"), out_name)
}

fn split_heads(g: &mut GraphBuilder, x: &str, heads: i64, head_size: i64) -> String {
    let x4 = g.reshape(x, &[0, 0, heads, head_size]);
    g.transpose(&x4, &[0, 2, 1, 3])
}

/// MatMul against the pre-transposed checkpoint weight, plus bias.
fn linear(g: &mut GraphBuilder, w: &Weights, x: &str, prefix: &str) -> anyhow::Result<String> {
    let weight = w.get(&format!("{prefix}.weight"))?;
    if weight.dims.len() != 2 {
        bail!("{prefix}.weight is not 2-D: {:?}", weight.dims);
    }
    let (t_dims, t_data) = transpose_2d(&weight.dims, &weight.data);
    let w_name = g.init_f32(&format!("{prefix}.weight"), &t_dims, &t_data);

    let bias = w.get(&format!("{prefix}.bias"))?;
    let b_name = g.init_f32(&format!("{prefix}.bias"), &bias.dims, &bias.data);

    let mm = g.push("MatMul", &[x, &w_name], vec![]);
    Ok(g.push("Add", &[&mm, &b_name], vec![]))
}

/// Opset-14 LayerNorm decomposition over the last axis.
fn layer_norm(
    g: &mut GraphBuilder,
    cfg: &ModelConfig,
    w: &Weights,
    x: &str,
    prefix: &str,
    out: Option<&str>,
) -> anyhow::Result<String> {
    let gamma = reg_weight(g, w, &format!("{prefix}.weight"))?;
    let beta = reg_weight(g, w, &format!("{prefix}.bias"))?;

    let mean_attrs = || {
        vec![
            super::builder::attr_ints("axes", &[-1]),
            attr_int("keepdims", 1),
        ]
    };

    let mean = g.push("ReduceMean", &[x], mean_attrs());
    let centered = g.push("Sub", &[x, &mean], vec![]);
    let sq = g.push("Mul", &[&centered, &centered], vec![]);
    let var = g.push("ReduceMean", &[&sq], mean_attrs());
    let eps = g.scalar_f32(cfg.layer_norm_eps as f32);
    let var_eps = g.push("Add", &[&var, &eps], vec![]);
    let std = g.push("Sqrt", &[&var_eps], vec![]);
    let norm = g.push("Div", &[&centered, &std], vec![]);
    let scaled = g.push("Mul", &[&norm, &gamma], vec![]);

    match out {
        Some(name) => {
            g.push_named("Add", &[&scaled, &beta], &[name], vec![]);
            Ok(name.to_string())
        }
        None => Ok(g.push("Add", &[&scaled, &beta], vec![])),
    }
}

fn activation(g: &mut GraphBuilder, cfg: &ModelConfig, x: &str) -> String {
    match cfg.hidden_act.as_str() {
        "relu" => g.push("Relu", &[x], vec![]),
        // Exact (erf) GELU: x * 0.5 * (1 + erf(x / sqrt(2))).
        _ => {
            let sqrt2 = g.scalar_f32(std::f32::consts::SQRT_2);
            let scaled = g.push("Div", &[x, &sqrt2], vec![]);
            let erf = g.push("Erf", &[&scaled], vec![]);
            let one = g.scalar_f32(1.0);
            let erf1 = g.push("Add", &[&erf, &one], vec![]);
            let half = g.scalar_f32(0.5);
            let xh = g.push("Mul", &[x, &half], vec![]);
            g.push("Mul", &[&xh, &erf1], vec![])
        }
    }
}

/// Register a checkpoint tensor as an initializer under its logical name.
fn reg_weight(g: &mut GraphBuilder, w: &Weights, name: &str) -> anyhow::Result<String> {
    let t = w.get(name)?;
    Ok(g.init_f32(name, &t.dims, &t.data))
}

/// Row-major 2-D transpose ([out, in] checkpoint layout -> [in, out] for MatMul).
fn transpose_2d(dims: &[i64], data: &[f32]) -> (Vec<i64>, Vec<f32>) {
    let (rows, cols) = (dims[0] as usize, dims[1] as usize);
    let mut out = vec![0.0f32; rows * cols];
    for i in 0..rows {
        for j in 0..cols {
            out[j * rows + i] = data[i * cols + j];
        }
    }
    (vec![dims[1], dims[0]], out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export::builder::{tensor_value_info, Dim};
    use std::collections::HashSet;

    fn tiny_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 16,
            hidden_size: 8,
            num_hidden_layers: 2,
            num_attention_heads: 2,
            intermediate_size: 16,
            max_position_embeddings: 32,
            type_vocab_size: 2,
            layer_norm_eps: 1e-12,
            hidden_act: "gelu".to_string(),
        }
    }

    fn fill(n: usize) -> Vec<f32> {
        (0..n).map(|i| (i as f32) * 0.01 - 0.3).collect()
    }

    fn tiny_weights(cfg: &ModelConfig) -> Weights {
        let h = cfg.hidden_size;
        let mut w = Weights::new();
        let mut table = |name: &str, rows: usize, cols: usize| {
            w.insert(name, vec![rows as i64, cols as i64], fill(rows * cols));
        };
        table("embeddings.word_embeddings.weight", cfg.vocab_size, h);
        table(
            "embeddings.position_embeddings.weight",
            cfg.max_position_embeddings,
            h,
        );
        table("embeddings.token_type_embeddings.weight", cfg.type_vocab_size, h);

        let mut vector = |name: &str, n: usize| {
            w.insert(name, vec![n as i64], fill(n));
        };
        vector("embeddings.LayerNorm.weight", h);
        vector("embeddings.LayerNorm.bias", h);

        for i in 0..cfg.num_hidden_layers {
            let p = format!("encoder.layer.{i}");
            for lin in [
                "attention.self.query",
                "attention.self.key",
                "attention.self.value",
                "attention.output.dense",
            ] {
                w.insert(&format!("{p}.{lin}.weight"), vec![h as i64, h as i64], fill(h * h));
                w.insert(&format!("{p}.{lin}.bias"), vec![h as i64], fill(h));
            }
            w.insert(
                &format!("{p}.intermediate.dense.weight"),
                vec![cfg.intermediate_size as i64, h as i64],
                fill(cfg.intermediate_size * h),
            );
            w.insert(
                &format!("{p}.intermediate.dense.bias"),
                vec![cfg.intermediate_size as i64],
                fill(cfg.intermediate_size),
            );
            w.insert(
                &format!("{p}.output.dense.weight"),
                vec![h as i64, cfg.intermediate_size as i64],
                fill(h * cfg.intermediate_size),
            );
            w.insert(&format!("{p}.output.dense.bias"), vec![h as i64], fill(h));
            w.insert(&format!("{p}.attention.output.LayerNorm.weight"), vec![h as i64], fill(h));
            w.insert(&format!("{p}.attention.output.LayerNorm.bias"), vec![h as i64], fill(h));
            w.insert(&format!("{p}.output.LayerNorm.weight"), vec![h as i64], fill(h));
            w.insert(&format!("{p}.output.LayerNorm.bias"), vec![h as i64], fill(h));
        }
        w
    }

    fn lowered_graph() -> candle_onnx::onnx::GraphProto {
        let cfg = tiny_config();
        let w = tiny_weights(&cfg);
        let mut g = GraphBuilder::new();
        lower_bert(&mut g, &cfg, &w).unwrap();

        use candle_onnx::onnx::tensor_proto::DataType;
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
                    Dim::Fixed(cfg.hidden_size as i64),
                ],
            )],
        );
        model.graph.unwrap()
    }

    #[test]
    fn test_every_node_input_resolves() {
        let graph = lowered_graph();

        let mut known: HashSet<String> = graph.input.iter().map(|i| i.name.clone()).collect();
        known.extend(graph.initializer.iter().map(|t| t.name.clone()));

        // Nodes are appended in topological order, so a single pass suffices.
        for node in &graph.node {
            for input in &node.input {
                assert!(known.contains(input), "dangling input {input} on {}", node.name);
            }
            known.extend(node.output.iter().cloned());
        }
    }

    #[test]
    fn test_last_hidden_state_is_produced_once() {
        let graph = lowered_graph();
        let producers = graph
            .node
            .iter()
            .filter(|n| n.output.iter().any(|o| o == config::export::LAST_HIDDEN_STATE))
            .count();
        assert_eq!(producers, 1);
    }

    #[test]
    fn test_matmul_count_matches_layers() {
        let graph = lowered_graph();
        let matmuls = graph.node.iter().filter(|n| n.op_type == "MatMul").count();
        // Per layer: q/k/v/attn-out/intermediate/output projections plus the
        // two attention MatMuls.
        assert_eq!(matmuls, tiny_config().num_hidden_layers * 8);
    }

    #[test]
    fn test_linear_weights_are_transposed() {
        let graph = lowered_graph();
        let init = graph
            .initializer
            .iter()
            .find(|t| t.name == "encoder.layer.0.intermediate.dense.weight")
            .unwrap();
        // Checkpoint layout is [intermediate, hidden]; MatMul layout is [hidden, intermediate].
        assert_eq!(init.dims, vec![8, 16]);
    }

    #[test]
    fn test_transpose_2d() {
        let (dims, data) = transpose_2d(&[2, 3], &[1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
        assert_eq!(dims, vec![3, 2]);
        assert_eq!(data, vec![1.0, 4.0, 2.0, 5.0, 3.0, 6.0]);
    }

    #[test]
    fn test_missing_tensor_is_reported_by_name() {
        let cfg = tiny_config();
        let w = Weights::new();
        let mut g = GraphBuilder::new();
        let err = lower_bert(&mut g, &cfg, &w).unwrap_err();
        assert!(err.to_string().contains("embeddings.word_embeddings.weight"));
    }

    #[test]
    fn test_weights_from_safetensors_roundtrip() {
        // Minimal hand-built safetensors buffer: one [2, 2] f32 tensor.
        let header = r#"{"t":{"dtype":"F32","shape":[2,2],"data_offsets":[0,16]}}"#;
        let mut buf = (header.len() as u64).to_le_bytes().to_vec();
        buf.extend_from_slice(header.as_bytes());
        for v in [1.0f32, 2.0, 3.0, 4.0] {
            buf.extend_from_slice(&v.to_le_bytes());
        }

        let w = Weights::from_safetensors(&buf).unwrap();
        let t = w.get("t").unwrap();
        assert_eq!(t.dims, vec![2, 2]);
        assert_eq!(t.data, vec![1.0, 2.0, 3.0, 4.0]);
    }

    #[test]
    fn test_get_tolerates_bert_prefix() {
        let mut w = Weights::new();
        w.insert("bert.embeddings.LayerNorm.weight", vec![2], vec![1.0, 1.0]);
        assert!(w.get("embeddings.LayerNorm.weight").is_ok());
    }
}
