// quantize.rs — Dynamic uint8 quantization of the exported graph.
//
// Reads model.onnx back from disk and rewrites float weights to uint8,
// mirroring onnxruntime's quantize_dynamic with QUInt8:
// - MatMul weights become DynamicQuantizeLinear(activation) + MatMulInteger +
//   Cast + scale multiplication (activation range computed at runtime, no
//   calibration set).
// - Gather (embedding) weights are stored uint8 with a DequantizeLinear
//   appended after the gather.
// Biases, LayerNorm parameters, and shape/axes constants stay in float/int64.
// The graph's input/output contract is unchanged.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use anyhow::{bail, Context};
use candle_onnx::onnx::{tensor_proto, GraphProto, ModelProto, NodeProto, TensorProto};
use prost::Message;

use crate::config;
use crate::export::builder::attr_int;
use crate::fetch;

/// Quantize the exported graph at `input` and write the result to `output`.
/// Deterministic for a given input graph; any malformed protobuf aborts.
pub fn quantize_dynamic(input: &Path, output: &Path) -> anyhow::Result<()> {
    log::info!("Quantizing model for mobile deployment...");

    let bytes = std::fs::read(input).with_context(|| format!("read {}", input.display()))?;
    let mut model = ModelProto::decode(bytes.as_slice())
        .with_context(|| format!("parse {} as ONNX", input.display()))?;
    let graph = model
        .graph
        .as_mut()
        .with_context(|| format!("{} has no graph", input.display()))?;

    let stats = quantize_graph(graph)?;
    log::info!(
        "Quantized {} MatMul and {} Gather weight tensors to uint8",
        stats.matmuls,
        stats.gathers
    );

    let encoded = model.encode_to_vec();
    fetch::write_atomic(output, &encoded)?;

    let before = bytes.len();
    let after = encoded.len();
    log::info!(
        "Quantized model saved to {} ({} -> {} bytes, {:.1}% of original)",
        output.display(),
        before,
        after,
        (after as f64 / before as f64) * 100.0
    );
    Ok(())
}

pub struct QuantStats {
    pub matmuls: usize,
    pub gathers: usize,
}

/// Rewrite all eligible weights in place. A weight is eligible when it is a
/// 2-D float initializer consumed by exactly one MatMul (right operand) or
/// one Gather (data operand).
pub fn quantize_graph(graph: &mut GraphProto) -> anyhow::Result<QuantStats> {
    let init_pos: HashMap<String, usize> = graph
        .initializer
        .iter()
        .enumerate()
        .map(|(i, t)| (t.name.clone(), i))
        .collect();

    // Shared initializers keep their float form; rewriting one consumer would
    // silently change the type seen by the others.
    let mut use_counts: HashMap<String, usize> = HashMap::new();
    for node in &graph.node {
        for input in &node.input {
            *use_counts.entry(input.clone()).or_default() += 1;
        }
    }

    let mut stats = QuantStats {
        matmuls: 0,
        gathers: 0,
    };
    let mut removed: HashSet<String> = HashSet::new();
    let mut added: Vec<TensorProto> = Vec::new();
    let mut new_nodes: Vec<NodeProto> = Vec::with_capacity(graph.node.len());

    for node in std::mem::take(&mut graph.node) {
        let weight_name = eligible_weight(&node, graph, &init_pos, &use_counts);
        let Some(weight_name) = weight_name else {
            new_nodes.push(node);
            continue;
        };

        let weight = &graph.initializer[init_pos[&weight_name]];
        let data = tensor_f32(weight)
            .with_context(|| format!("initializer {weight_name} has no float data"))?;
        let (q, scale, zero_point) = quantize_u8(&data);

        removed.insert(weight_name.clone());
        let q_name = format!("{weight_name}_quantized");
        let scale_name = format!("{weight_name}_scale");
        let zp_name = format!("{weight_name}_zero_point");
        added.push(TensorProto {
            name: q_name.clone(),
            dims: weight.dims.clone(),
            data_type: tensor_proto::DataType::Uint8 as i32,
            raw_data: q,
            ..Default::default()
        });
        added.push(scalar_f32_tensor(&scale_name, scale));
        added.push(scalar_u8_tensor(&zp_name, zero_point));

        if node.op_type == "MatMul" {
            stats.matmuls += 1;
            rewrite_matmul(&node, &q_name, &scale_name, &zp_name, &mut new_nodes);
        } else if node.op_type == "Gather" {
            stats.gathers += 1;
            rewrite_gather(node, &q_name, &scale_name, &zp_name, &mut new_nodes);
        } else {
            bail!("unexpected quantization target op {}", node.op_type);
        }
    }

    if stats.matmuls == 0 && stats.gathers == 0 {
        bail!("no quantizable weights found; refusing to emit an unchanged copy");
    }

    graph.node = new_nodes;
    graph.initializer.retain(|t| !removed.contains(&t.name));
    graph.initializer.extend(added);
    Ok(stats)
}

/// The initializer name this node qualifies for quantization on, if any.
fn eligible_weight(
    node: &NodeProto,
    graph: &GraphProto,
    init_pos: &HashMap<String, usize>,
    use_counts: &HashMap<String, usize>,
) -> Option<String> {
    if node.output.len() != 1 {
        return None;
    }
    let candidate = match node.op_type.as_str() {
        "MatMul" => node.input.get(1),
        "Gather" => node.input.first(),
        _ => return None,
    }?;

    let pos = *init_pos.get(candidate)?;
    let tensor = &graph.initializer[pos];
    let is_2d_float =
        tensor.dims.len() == 2 && tensor.data_type == tensor_proto::DataType::Float as i32;
    let single_use = use_counts.get(candidate).copied() == Some(1);
    (is_2d_float && single_use).then(|| candidate.clone())
}

/// MatMul(a, W) -> Mul(Cast(MatMulInteger(DQL(a), W_q)), a_scale * w_scale).
fn rewrite_matmul(
    node: &NodeProto,
    q_name: &str,
    scale_name: &str,
    zp_name: &str,
    out: &mut Vec<NodeProto>,
) {
    let activation = node.input[0].clone();
    let y = node.output[0].clone();
    let stem = &node.name;

    let a_q = format!("{stem}_a_quantized");
    let a_scale = format!("{stem}_a_scale");
    let a_zp = format!("{stem}_a_zero_point");
    out.push(NodeProto {
        op_type: "DynamicQuantizeLinear".to_string(),
        name: format!("{stem}_dynamic_quantize"),
        input: vec![activation],
        output: vec![a_q.clone(), a_scale.clone(), a_zp.clone()],
        ..Default::default()
    });

    let acc = format!("{stem}_int32");
    out.push(NodeProto {
        op_type: "MatMulInteger".to_string(),
        name: format!("{stem}_matmul_integer"),
        input: vec![a_q, q_name.to_string(), a_zp, zp_name.to_string()],
        output: vec![acc.clone()],
        ..Default::default()
    });

    let acc_f = format!("{stem}_float");
    out.push(NodeProto {
        op_type: "Cast".to_string(),
        name: format!("{stem}_cast"),
        input: vec![acc],
        output: vec![acc_f.clone()],
        attribute: vec![attr_int("to", tensor_proto::DataType::Float as i64)],
        ..Default::default()
    });

    let combined_scale = format!("{stem}_combined_scale");
    out.push(NodeProto {
        op_type: "Mul".to_string(),
        name: format!("{stem}_scale_mul"),
        input: vec![a_scale, scale_name.to_string()],
        output: vec![combined_scale.clone()],
        ..Default::default()
    });

    out.push(NodeProto {
        op_type: "Mul".to_string(),
        name: format!("{stem}_rescale"),
        input: vec![acc_f, combined_scale],
        output: vec![y],
        ..Default::default()
    });
}

/// Gather(W, ids) -> DequantizeLinear(Gather(W_q, ids)), weight-only form.
fn rewrite_gather(
    mut node: NodeProto,
    q_name: &str,
    scale_name: &str,
    zp_name: &str,
    out: &mut Vec<NodeProto>,
) {
    let y = node.output[0].clone();
    let gathered_q = format!("{}_quantized_out", node.name);
    let dequant_name = format!("{}_dequantize", node.name);

    node.input[0] = q_name.to_string();
    node.output[0] = gathered_q.clone();
    out.push(node);

    out.push(NodeProto {
        op_type: "DequantizeLinear".to_string(),
        name: dequant_name,
        input: vec![gathered_q, scale_name.to_string(), zp_name.to_string()],
        output: vec![y],
        ..Default::default()
    });
}

/// Asymmetric uint8 quantization of a weight tensor. The range is widened to
/// include 0 so that zero is exactly representable at the zero point.
pub fn quantize_u8(data: &[f32]) -> (Vec<u8>, f32, u8) {
    let mut min = 0.0f32;
    let mut max = 0.0f32;
    for &v in data {
        min = min.min(v);
        max = max.max(v);
    }

    let mut scale = (max - min) / config::quantize::QUANT_LEVELS;
    if scale <= 0.0 {
        scale = config::quantize::MIN_SCALE;
    }
    let zero_point = (-min / scale)
        .round()
        .clamp(0.0, config::quantize::QUANT_LEVELS) as u8;

    let q = data
        .iter()
        .map(|&v| {
            (v / scale + zero_point as f32)
                .round()
                .clamp(0.0, config::quantize::QUANT_LEVELS) as u8
        })
        .collect();

    (q, scale, zero_point)
}

fn scalar_f32_tensor(name: &str, value: f32) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        data_type: tensor_proto::DataType::Float as i32,
        raw_data: value.to_le_bytes().to_vec(),
        ..Default::default()
    }
}

fn scalar_u8_tensor(name: &str, value: u8) -> TensorProto {
    TensorProto {
        name: name.to_string(),
        data_type: tensor_proto::DataType::Uint8 as i32,
        raw_data: vec![value],
        ..Default::default()
    }
}

/// Decode an f32 initializer stored either as raw little-endian bytes or in
/// the repeated float field.
fn tensor_f32(t: &TensorProto) -> Option<Vec<f32>> {
    if !t.raw_data.is_empty() {
        return Some(
            t.raw_data
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
        );
    }
    if !t.float_data.is_empty() {
        return Some(t.float_data.clone());
    }
    None
}
