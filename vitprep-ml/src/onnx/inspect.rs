//! Structural summary of an ONNX model.

use super::external::ExternalDataInfo;
use super::proto::tensor_proto::DataType;
use super::proto::tensor_shape_proto::dimension::Value as DimValue;
use super::proto::type_proto::Value as TypeValue;
use super::proto::{GraphProto, ValueInfoProto};
use super::{ModelProto, TensorRole, for_each_tensor, load_model};
use crate::error::PrepError;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::Path;
use tracing::warn;

/// One dimension of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Dim {
    Fixed(i64),
    Symbolic(String),
    Unknown,
}

impl fmt::Display for Dim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dim::Fixed(v) => write!(f, "{v}"),
            Dim::Symbolic(s) => write!(f, "{s}"),
            Dim::Unknown => write!(f, "?"),
        }
    }
}

/// Name, element type and shape of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorSignature {
    pub name: String,
    pub elem_type: String,
    pub dims: Vec<Dim>,
}

impl fmt::Display for TensorSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dims: Vec<String> = self.dims.iter().map(Dim::to_string).collect();
        write!(f, "{}: {}[{}]", self.name, self.elem_type, dims.join(", "))
    }
}

/// Bytes referenced in one external data file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalFileSummary {
    pub location: String,
    pub tensors: usize,
    pub referenced_bytes: u64,
    /// Size on disk; `None` when the file is missing.
    pub file_size: Option<u64>,
    /// Every referenced segment fits inside the file.
    pub in_bounds: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpsetImport {
    pub domain: String,
    pub version: i64,
}

/// What `vitprep inspect` reports about a model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelSummary {
    pub ir_version: i64,
    pub producer: String,
    pub opsets: Vec<OpsetImport>,
    pub graph_name: String,
    pub node_count: usize,
    pub inputs: Vec<TensorSignature>,
    pub outputs: Vec<TensorSignature>,
    pub initializer_count: usize,
    pub inline_tensors: usize,
    pub external_tensors: usize,
    pub external_files: Vec<ExternalFileSummary>,
}

impl ModelSummary {
    pub fn input(&self, name: &str) -> Option<&TensorSignature> {
        self.inputs.iter().find(|s| s.name == name)
    }

    pub fn output(&self, name: &str) -> Option<&TensorSignature> {
        self.outputs.iter().find(|s| s.name == name)
    }

    /// Every external reference points inside an existing file.
    pub fn external_data_complete(&self) -> bool {
        self.external_files
            .iter()
            .all(|f| f.file_size.is_some() && f.in_bounds)
    }

    /// Require exactly one input named `input` and a first output named
    /// `output`. Further outputs (such as a pooled embedding) are allowed
    /// and logged.
    pub fn check_io(&self, input: &str, output: &str) -> Result<(), PrepError> {
        let names = |sigs: &[TensorSignature]| {
            sigs.iter()
                .map(|s| s.name.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        };
        if self.inputs.len() != 1 || self.input(input).is_none() {
            return Err(PrepError::invalid_model(format!(
                "expected single input '{input}', found [{}]",
                names(&self.inputs)
            )));
        }
        if self.outputs.first().map(|s| s.name.as_str()) != Some(output) {
            return Err(PrepError::invalid_model(format!(
                "expected first output '{output}', found [{}]",
                names(&self.outputs)
            )));
        }
        if self.outputs.len() > 1 {
            warn!(
                primary = output,
                extra = %names(&self.outputs[1..]),
                "Model has additional outputs"
            );
        }
        Ok(())
    }
}

/// Decode `path` and summarize it; external files are checked relative to
/// the model's directory.
pub fn inspect_model(path: &Path) -> Result<ModelSummary, PrepError> {
    let model = load_model(path)?;
    let base = path.parent().unwrap_or(Path::new(""));
    Ok(summarize(&model, base))
}

/// Summarize an in-memory model.
pub fn summarize(model: &ModelProto, base_dir: &Path) -> ModelSummary {
    let empty = GraphProto::default();
    let graph = model.graph.as_ref().unwrap_or(&empty);

    let initializer_names: HashSet<&str> = graph.initializer.iter().map(|t| t.name()).collect();
    let inputs = graph
        .input
        .iter()
        .filter(|v| !initializer_names.contains(v.name.as_deref().unwrap_or("")))
        .map(signature)
        .collect();
    let outputs = graph.output.iter().map(signature).collect();

    let mut initializer_count = 0;
    let mut inline_tensors = 0;
    let mut external_tensors = 0;
    // location -> (tensors, referenced bytes, furthest end, all parsed)
    let mut refs: BTreeMap<String, (usize, u64, u64, bool)> = BTreeMap::new();

    for_each_tensor(model, &mut |tensor, role| {
        if role == TensorRole::Initializer {
            initializer_count += 1;
        }
        if !tensor.is_external() {
            inline_tensors += 1;
            return;
        }
        external_tensors += 1;
        match ExternalDataInfo::from_tensor(tensor) {
            Ok(info) => {
                let entry = refs.entry(info.location.clone()).or_insert((0, 0, 0, true));
                entry.0 += 1;
                match info.length {
                    Some(len) => {
                        entry.1 += len;
                        entry.2 = entry.2.max(info.offset.saturating_add(len));
                    }
                    None => entry.2 = entry.2.max(info.offset),
                }
            }
            Err(_) => {
                let entry = refs
                    .entry(tensor.external_entry("location").unwrap_or("").to_string())
                    .or_insert((0, 0, 0, true));
                entry.0 += 1;
                entry.3 = false;
            }
        }
    });

    let external_files = refs
        .into_iter()
        .map(|(location, (tensors, referenced_bytes, end, parsed))| {
            let info = ExternalDataInfo {
                location: location.clone(),
                offset: 0,
                length: None,
            };
            let file_size = info
                .resolve(base_dir)
                .ok()
                .and_then(|p| std::fs::metadata(p).ok())
                .map(|m| m.len());
            ExternalFileSummary {
                location,
                tensors,
                referenced_bytes,
                file_size,
                in_bounds: parsed && file_size.is_some_and(|size| end <= size),
            }
        })
        .collect();

    ModelSummary {
        ir_version: model.ir_version.unwrap_or(0),
        producer: format!(
            "{} {}",
            model.producer_name.as_deref().unwrap_or("unknown"),
            model.producer_version.as_deref().unwrap_or("")
        )
        .trim()
        .to_string(),
        opsets: model
            .opset_import
            .iter()
            .map(|o| OpsetImport {
                domain: o.domain.clone().unwrap_or_default(),
                version: o.version.unwrap_or(0),
            })
            .collect(),
        graph_name: graph.name.clone().unwrap_or_default(),
        node_count: graph.node.len(),
        inputs,
        outputs,
        initializer_count,
        inline_tensors,
        external_tensors,
        external_files,
    }
}

fn signature(value: &ValueInfoProto) -> TensorSignature {
    let (elem_type, dims) = match value.r#type.as_ref().and_then(|t| t.value.as_ref()) {
        Some(TypeValue::TensorType(tensor)) => {
            let elem_type = tensor
                .elem_type
                .and_then(|code| DataType::try_from(code).ok())
                .map(|dt| dt.name().to_string())
                .unwrap_or_else(|| "UNDEFINED".to_string());
            let dims = tensor
                .shape
                .as_ref()
                .map(|shape| {
                    shape
                        .dim
                        .iter()
                        .map(|d| match &d.value {
                            Some(DimValue::DimValue(v)) => Dim::Fixed(*v),
                            Some(DimValue::DimParam(p)) => Dim::Symbolic(p.clone()),
                            None => Dim::Unknown,
                        })
                        .collect()
                })
                .unwrap_or_default();
            (elem_type, dims)
        }
        Some(TypeValue::SequenceType(_)) => ("SEQUENCE".to_string(), Vec::new()),
        Some(TypeValue::MapType(_)) => ("MAP".to_string(), Vec::new()),
        Some(TypeValue::OptionalType(_)) => ("OPTIONAL".to_string(), Vec::new()),
        Some(TypeValue::SparseTensorType(_)) => ("SPARSE_TENSOR".to_string(), Vec::new()),
        None => ("UNDEFINED".to_string(), Vec::new()),
    };
    TensorSignature {
        name: value.name.clone().unwrap_or_default(),
        elem_type,
        dims,
    }
}
