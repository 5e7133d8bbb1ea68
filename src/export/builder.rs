// builder.rs — Thin construction layer over the ONNX protobuf types.
//
// Wraps candle-onnx's prost-generated ModelProto/GraphProto/NodeProto with
// helpers for appending nodes, registering initializers, and declaring graph
// inputs/outputs with dynamic (dim_param) axes. The BERT lowering in bert.rs
// is written entirely against this API.

use candle_onnx::onnx::{
    attribute_proto, tensor_proto, tensor_shape_proto, type_proto, AttributeProto, GraphProto,
    ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto, TypeProto,
    ValueInfoProto,
};

use crate::config;

/// One dimension of a declared graph input/output: fixed size or a named
/// symbolic axis resolved at inference time.
#[derive(Debug, Clone)]
pub enum Dim {
    Fixed(i64),
    Dynamic(&'static str),
}

pub struct GraphBuilder {
    nodes: Vec<NodeProto>,
    initializers: Vec<TensorProto>,
    next_id: usize,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            initializers: Vec::new(),
            next_id: 0,
        }
    }

    fn fresh(&mut self, stem: &str) -> String {
        let name = format!("{stem}_{}", self.next_id);
        self.next_id += 1;
        name
    }

    /// Append a single-output node; the output tensor name is generated from
    /// the op type and returned for wiring into downstream nodes.
    pub fn push(&mut self, op_type: &str, inputs: &[&str], attrs: Vec<AttributeProto>) -> String {
        let out = self.fresh(&op_type.to_ascii_lowercase());
        self.push_named(op_type, inputs, &[&out], attrs);
        out
    }

    /// Append a node with explicit output names (graph outputs, multi-output ops).
    pub fn push_named(
        &mut self,
        op_type: &str,
        inputs: &[&str],
        outputs: &[&str],
        attrs: Vec<AttributeProto>,
    ) {
        let name = self.fresh(&format!("{}_node", op_type.to_ascii_lowercase()));
        self.nodes.push(NodeProto {
            op_type: op_type.to_string(),
            name,
            input: inputs.iter().map(|s| s.to_string()).collect(),
            output: outputs.iter().map(|s| s.to_string()).collect(),
            attribute: attrs,
            ..Default::default()
        });
    }

    /// Register a float initializer (weights, biases, scalar constants).
    /// Data is stored as little-endian raw bytes, the layout exporters emit.
    pub fn init_f32(&mut self, name: &str, dims: &[i64], data: &[f32]) -> String {
        self.initializers.push(TensorProto {
            name: name.to_string(),
            dims: dims.to_vec(),
            data_type: tensor_proto::DataType::Float as i32,
            raw_data: f32_le_bytes(data),
            ..Default::default()
        });
        name.to_string()
    }

    /// Register an int64 initializer (shapes, axes, scalar index constants).
    pub fn init_i64(&mut self, name: &str, dims: &[i64], data: &[i64]) -> String {
        self.initializers.push(TensorProto {
            name: name.to_string(),
            dims: dims.to_vec(),
            data_type: tensor_proto::DataType::Int64 as i32,
            int64_data: data.to_vec(),
            ..Default::default()
        });
        name.to_string()
    }

    /// Anonymous scalar float constant.
    pub fn scalar_f32(&mut self, value: f32) -> String {
        let name = self.fresh("const_f");
        self.init_f32(&name, &[], &[value])
    }

    /// Anonymous scalar int64 constant.
    pub fn scalar_i64(&mut self, value: i64) -> String {
        let name = self.fresh("const_i");
        self.init_i64(&name, &[], &[value])
    }

    /// Unsqueeze with the opset-13+ calling convention (axes as an input tensor).
    pub fn unsqueeze(&mut self, input: &str, axes: &[i64]) -> String {
        let axes_name = self.fresh("unsqueeze_axes");
        self.init_i64(&axes_name, &[axes.len() as i64], axes);
        self.push("Unsqueeze", &[input, &axes_name], vec![])
    }

    /// Reshape against a constant target shape; zeros copy the input dim.
    pub fn reshape(&mut self, input: &str, shape: &[i64]) -> String {
        let shape_name = self.fresh("reshape_shape");
        self.init_i64(&shape_name, &[shape.len() as i64], shape);
        self.push("Reshape", &[input, &shape_name], vec![])
    }

    pub fn transpose(&mut self, input: &str, perm: &[i64]) -> String {
        self.push("Transpose", &[input], vec![attr_ints("perm", perm)])
    }

    /// Assemble the final versioned model around the accumulated graph.
    pub fn finish(
        self,
        inputs: Vec<ValueInfoProto>,
        outputs: Vec<ValueInfoProto>,
    ) -> ModelProto {
        ModelProto {
            ir_version: config::export::IR_VERSION,
            producer_name: "bge-onnx-convert".to_string(),
            producer_version: config::TOOL_VERSION.to_string(),
            opset_import: vec![OperatorSetIdProto {
                domain: String::new(),
                version: config::export::OPSET_VERSION,
            }],
            graph: Some(GraphProto {
                name: config::export::GRAPH_NAME.to_string(),
                node: self.nodes,
                initializer: self.initializers,
                input: inputs,
                output: outputs,
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Declare a graph input/output tensor with its element type and axes.
pub fn tensor_value_info(
    name: &str,
    elem_type: tensor_proto::DataType,
    dims: &[Dim],
) -> ValueInfoProto {
    let dim = dims
        .iter()
        .map(|d| tensor_shape_proto::Dimension {
            value: Some(match d {
                Dim::Fixed(v) => tensor_shape_proto::dimension::Value::DimValue(*v),
                Dim::Dynamic(p) => {
                    tensor_shape_proto::dimension::Value::DimParam(p.to_string())
                }
            }),
            ..Default::default()
        })
        .collect();

    ValueInfoProto {
        name: name.to_string(),
        r#type: Some(TypeProto {
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: elem_type as i32,
                shape: Some(TensorShapeProto { dim }),
            })),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn attr_int(name: &str, value: i64) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: attribute_proto::AttributeType::Int as i32,
        i: value,
        ..Default::default()
    }
}

pub fn attr_ints(name: &str, values: &[i64]) -> AttributeProto {
    AttributeProto {
        name: name.to_string(),
        r#type: attribute_proto::AttributeType::Ints as i32,
        ints: values.to_vec(),
        ..Default::default()
    }
}

pub fn f32_le_bytes(data: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() * 4);
    for v in data {
        out.extend_from_slice(&v.to_le_bytes());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_generates_unique_outputs() {
        let mut g = GraphBuilder::new();
        let a = g.push("Add", &["x", "y"], vec![]);
        let b = g.push("Add", &["x", "y"], vec![]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_dynamic_axes_become_dim_params() {
        let info = tensor_value_info(
            "input_ids",
            tensor_proto::DataType::Int64,
            &[Dim::Dynamic("batch_size"), Dim::Dynamic("sequence_length")],
        );
        let shape = match info.r#type.unwrap().value.unwrap() {
            type_proto::Value::TensorType(t) => t.shape.unwrap(),
            other => panic!("unexpected type value: {other:?}"),
        };
        assert_eq!(shape.dim.len(), 2);
        match &shape.dim[0].value {
            Some(tensor_shape_proto::dimension::Value::DimParam(p)) => {
                assert_eq!(p, "batch_size")
            }
            other => panic!("expected dim_param, got {other:?}"),
        }
    }

    #[test]
    fn test_finish_sets_opset_and_ir_version() {
        let g = GraphBuilder::new();
        let model = g.finish(vec![], vec![]);
        assert_eq!(model.ir_version, config::export::IR_VERSION);
        assert_eq!(model.opset_import.len(), 1);
        assert_eq!(model.opset_import[0].version, config::export::OPSET_VERSION);
        assert_eq!(
            model.graph.unwrap().name,
            config::export::GRAPH_NAME
        );
    }

    #[test]
    fn test_init_f32_raw_data_layout() {
        let mut g = GraphBuilder::new();
        g.init_f32("w", &[2], &[1.0, -2.5]);
        let model = g.finish(vec![], vec![]);
        let init = &model.graph.unwrap().initializer[0];
        assert_eq!(init.dims, vec![2]);
        assert_eq!(init.raw_data.len(), 8);
        assert_eq!(&init.raw_data[..4], &1.0f32.to_le_bytes());
    }
}
