//! ONNX model handling: protobuf schema, external-data bundling, inspection.

pub mod external;
pub mod inspect;
pub mod proto;

pub use external::{BundleStats, ExternalDataBundler, ExternalDataInfo};
pub use inspect::{Dim, ModelSummary, TensorSignature, inspect_model};
pub use proto::{GraphProto, ModelProto, TensorProto};

use crate::error::PrepError;
use prost::Message;
use proto::AttributeProto;
use std::path::Path;

/// How a constant tensor is attached to the graph.
///
/// Only initializers are eligible for external storage; attribute tensors
/// (e.g. `Constant` node values) always stay inline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TensorRole {
    Initializer,
    Attribute,
}

/// Decode a model file. External tensor payloads are left unresolved.
pub fn load_model(path: &Path) -> Result<ModelProto, PrepError> {
    let bytes = std::fs::read(path)?;
    Ok(ModelProto::decode(bytes.as_slice())?)
}

/// Encode `model` to `path`.
pub fn save_model(model: &ModelProto, path: &Path) -> Result<(), PrepError> {
    std::fs::write(path, model.encode_to_vec())?;
    Ok(())
}

/// Visit every tensor in the model: initializers and attribute tensors of
/// the main graph, of every nested subgraph and of local functions.
pub fn for_each_tensor_mut(
    model: &mut ModelProto,
    visit: &mut dyn FnMut(&mut TensorProto, TensorRole) -> Result<(), PrepError>,
) -> Result<(), PrepError> {
    if let Some(graph) = model.graph.as_mut() {
        walk_graph_mut(graph, visit)?;
    }
    for function in model.functions.iter_mut() {
        for node in function.node.iter_mut() {
            for attr in node.attribute.iter_mut() {
                walk_attribute_mut(attr, visit)?;
            }
        }
    }
    Ok(())
}

fn walk_graph_mut(
    graph: &mut GraphProto,
    visit: &mut dyn FnMut(&mut TensorProto, TensorRole) -> Result<(), PrepError>,
) -> Result<(), PrepError> {
    for tensor in graph.initializer.iter_mut() {
        visit(tensor, TensorRole::Initializer)?;
    }
    for sparse in graph.sparse_initializer.iter_mut() {
        for tensor in [sparse.values.as_mut(), sparse.indices.as_mut()]
            .into_iter()
            .flatten()
        {
            visit(tensor, TensorRole::Attribute)?;
        }
    }
    for node in graph.node.iter_mut() {
        for attr in node.attribute.iter_mut() {
            walk_attribute_mut(attr, visit)?;
        }
    }
    Ok(())
}

fn walk_attribute_mut(
    attr: &mut AttributeProto,
    visit: &mut dyn FnMut(&mut TensorProto, TensorRole) -> Result<(), PrepError>,
) -> Result<(), PrepError> {
    if let Some(tensor) = attr.t.as_mut() {
        visit(tensor, TensorRole::Attribute)?;
    }
    for tensor in attr.tensors.iter_mut() {
        visit(tensor, TensorRole::Attribute)?;
    }
    for sparse in attr.sparse_tensor.iter_mut().chain(attr.sparse_tensors.iter_mut()) {
        for tensor in [sparse.values.as_mut(), sparse.indices.as_mut()]
            .into_iter()
            .flatten()
        {
            visit(tensor, TensorRole::Attribute)?;
        }
    }
    if let Some(graph) = attr.g.as_mut() {
        walk_graph_mut(graph, visit)?;
    }
    for graph in attr.graphs.iter_mut() {
        walk_graph_mut(graph, visit)?;
    }
    Ok(())
}

/// Read-only counterpart of [`for_each_tensor_mut`].
pub fn for_each_tensor(model: &ModelProto, visit: &mut dyn FnMut(&TensorProto, TensorRole)) {
    fn graph_tensors(graph: &GraphProto, visit: &mut dyn FnMut(&TensorProto, TensorRole)) {
        for tensor in &graph.initializer {
            visit(tensor, TensorRole::Initializer);
        }
        for sparse in &graph.sparse_initializer {
            for tensor in [sparse.values.as_ref(), sparse.indices.as_ref()]
                .into_iter()
                .flatten()
            {
                visit(tensor, TensorRole::Attribute);
            }
        }
        for node in &graph.node {
            for attr in &node.attribute {
                attribute_tensors(attr, visit);
            }
        }
    }

    fn attribute_tensors(attr: &AttributeProto, visit: &mut dyn FnMut(&TensorProto, TensorRole)) {
        for tensor in attr.t.iter().chain(attr.tensors.iter()) {
            visit(tensor, TensorRole::Attribute);
        }
        for sparse in attr.sparse_tensor.iter().chain(attr.sparse_tensors.iter()) {
            for tensor in [sparse.values.as_ref(), sparse.indices.as_ref()]
                .into_iter()
                .flatten()
            {
                visit(tensor, TensorRole::Attribute);
            }
        }
        for graph in attr.g.iter().chain(attr.graphs.iter()) {
            graph_tensors(graph, visit);
        }
    }

    if let Some(graph) = model.graph.as_ref() {
        graph_tensors(graph, visit);
    }
    for function in &model.functions {
        for node in &function.node {
            for attr in &node.attribute {
                attribute_tensors(attr, visit);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proto::NodeProto;
    use tempfile::TempDir;

    fn tensor(name: &str, len: usize) -> TensorProto {
        TensorProto {
            name: Some(name.into()),
            dims: vec![len as i64],
            data_type: Some(proto::tensor_proto::DataType::Uint8 as i32),
            raw_data: Some(vec![7; len]),
            ..Default::default()
        }
    }

    fn model_with_subgraph() -> ModelProto {
        let body = GraphProto {
            name: Some("loop_body".into()),
            initializer: vec![tensor("body.w", 8)],
            ..Default::default()
        };
        let node = NodeProto {
            op_type: Some("If".into()),
            attribute: vec![
                AttributeProto {
                    name: Some("then_branch".into()),
                    g: Some(body),
                    ..Default::default()
                },
                AttributeProto {
                    name: Some("value".into()),
                    t: Some(tensor("const", 4)),
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        ModelProto {
            ir_version: Some(8),
            graph: Some(GraphProto {
                node: vec![node],
                initializer: vec![tensor("w0", 16), tensor("w1", 32)],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn test_walk_visits_nested_tensors_with_roles() {
        let model = model_with_subgraph();
        let mut seen = Vec::new();
        for_each_tensor(&model, &mut |t, role| seen.push((t.name().to_string(), role)));
        assert_eq!(
            seen,
            vec![
                ("w0".to_string(), TensorRole::Initializer),
                ("w1".to_string(), TensorRole::Initializer),
                ("body.w".to_string(), TensorRole::Initializer),
                ("const".to_string(), TensorRole::Attribute),
            ]
        );
    }

    #[test]
    fn test_walk_mut_stops_on_error() {
        let mut model = model_with_subgraph();
        let mut visited = 0;
        let result = for_each_tensor_mut(&mut model, &mut |_, _| {
            visited += 1;
            if visited == 2 {
                return Err(PrepError::bundle("stop"));
            }
            Ok(())
        });
        assert!(result.is_err());
        assert_eq!(visited, 2);
    }

    #[test]
    fn test_save_and_load_model() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.onnx");
        let model = model_with_subgraph();
        save_model(&model, &path).unwrap();
        assert_eq!(load_model(&path).unwrap(), model);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("m.onnx");
        std::fs::write(&path, [0xff, 0xff, 0xff]).unwrap();
        assert!(matches!(load_model(&path), Err(PrepError::Decode(_))));
    }
}
