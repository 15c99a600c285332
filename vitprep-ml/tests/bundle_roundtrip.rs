//! Bundling a scattered export and reading the result back.

use pretty_assertions::assert_eq;
use std::path::Path;
use tempfile::TempDir;

use vitprep_ml::onnx::proto::tensor_proto::{DataLocation, DataType};
use vitprep_ml::onnx::proto::tensor_shape_proto::{Dimension, dimension};
use vitprep_ml::onnx::proto::{
    AttributeProto, GraphProto, ModelProto, NodeProto, OperatorSetIdProto,
    StringStringEntryProto, TensorProto, TensorShapeProto, TypeProto, ValueInfoProto, type_proto,
};
use vitprep_ml::onnx::{ExternalDataBundler, ExternalDataInfo, inspect_model, load_model, save_model};

fn io(name: &str, dims: &[i64]) -> ValueInfoProto {
    ValueInfoProto {
        name: Some(name.into()),
        r#type: Some(TypeProto {
            denotation: None,
            value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                elem_type: Some(DataType::Float as i32),
                shape: Some(TensorShapeProto {
                    dim: dims
                        .iter()
                        .map(|d| Dimension {
                            denotation: None,
                            value: Some(dimension::Value::DimValue(*d)),
                        })
                        .collect(),
                }),
            })),
        }),
        ..Default::default()
    }
}

/// One weight file per tensor, as the exporter writes for large models.
fn scattered_tensor(dir: &Path, name: &str, len: usize, fill: u8) -> TensorProto {
    let file = format!("{name}.bin");
    std::fs::write(dir.join(&file), vec![fill; len]).unwrap();
    TensorProto {
        name: Some(name.into()),
        dims: vec![(len / 4) as i64],
        data_type: Some(DataType::Float as i32),
        external_data: vec![StringStringEntryProto::new("location", file)],
        data_location: Some(DataLocation::External as i32),
        ..Default::default()
    }
}

fn scattered_model(dir: &Path) -> ModelProto {
    ModelProto {
        ir_version: Some(8),
        producer_name: Some("pytorch".into()),
        producer_version: Some("2.4.0".into()),
        opset_import: vec![OperatorSetIdProto {
            domain: Some(String::new()),
            version: Some(18),
        }],
        graph: Some(GraphProto {
            name: Some("main_graph".into()),
            node: vec![NodeProto {
                op_type: Some("Constant".into()),
                output: vec!["shape_const".into()],
                attribute: vec![AttributeProto {
                    name: Some("value".into()),
                    t: Some(TensorProto {
                        name: Some("shape_const".into()),
                        raw_data: Some(vec![9; 4096]),
                        ..Default::default()
                    }),
                    ..Default::default()
                }],
                ..Default::default()
            }],
            input: vec![io("pixel_values", &[1, 3, 224, 224])],
            output: vec![io("last_hidden_state", &[1, 201, 1280])],
            initializer: vec![
                scattered_tensor(dir, "patch_embed.weight", 4096, 1),
                scattered_tensor(dir, "pos_embed", 1024, 2),
                TensorProto {
                    name: Some("ln.bias".into()),
                    raw_data: Some(vec![3; 1023]),
                    ..Default::default()
                },
                TensorProto {
                    name: Some("head.weight".into()),
                    raw_data: Some(vec![4; 2000]),
                    ..Default::default()
                },
            ],
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[test]
fn scattered_export_becomes_one_data_file() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("onnx_temp_export");
    std::fs::create_dir_all(&scratch).unwrap();
    save_model(&scattered_model(&scratch), &scratch.join("model.onnx")).unwrap();

    let onnx = dir.path().join("dinov3_vith16plus_eager.onnx");
    let data = dir.path().join("dinov3_vith16plus_eager.onnx_data");
    let stats = ExternalDataBundler::new(1024)
        .bundle(&scratch.join("model.onnx"), &onnx, &data)
        .unwrap();

    assert_eq!(stats.resolved, 2);
    assert_eq!(stats.externalized, 3);
    // ln.bias and the Constant attribute.
    assert_eq!(stats.inlined, 2);
    assert_eq!(std::fs::metadata(&data).unwrap().len(), 4096 + 1024 + 2000);

    // The bundle no longer depends on the scratch directory.
    std::fs::remove_dir_all(&scratch).unwrap();

    let model = load_model(&onnx).unwrap();
    let graph = model.graph.as_ref().unwrap();
    let blob = std::fs::read(&data).unwrap();
    let expected: [(&str, u8, usize); 3] = [
        ("patch_embed.weight", 1, 4096),
        ("pos_embed", 2, 1024),
        ("head.weight", 4, 2000),
    ];
    for (name, fill, len) in expected {
        let tensor = graph.initializer.iter().find(|t| t.name() == name).unwrap();
        assert!(tensor.is_external());
        assert!(tensor.raw_data.is_none());
        let info = ExternalDataInfo::from_tensor(tensor).unwrap();
        assert_eq!(info.location, "dinov3_vith16plus_eager.onnx_data");
        assert_eq!(info.length, Some(len as u64));
        let start = info.offset as usize;
        assert!(blob[start..start + len].iter().all(|b| *b == fill));
    }

    let constant = graph.node[0].attribute[0].t.as_ref().unwrap();
    assert!(!constant.is_external());
    assert_eq!(constant.raw_data.as_ref().unwrap().len(), 4096);

    let summary = inspect_model(&onnx).unwrap();
    summary.check_io("pixel_values", "last_hidden_state").unwrap();
    assert!(summary.external_data_complete());
    assert_eq!(summary.external_tensors, 3);
    assert_eq!(summary.external_files.len(), 1);
    assert_eq!(summary.external_files[0].referenced_bytes, 4096 + 1024 + 2000);
}

#[test]
fn rebundling_is_stable() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    std::fs::create_dir_all(&scratch).unwrap();
    save_model(&scattered_model(&scratch), &scratch.join("model.onnx")).unwrap();

    let bundler = ExternalDataBundler::new(1024);
    let first = dir.path().join("first");
    bundler
        .bundle(&scratch.join("model.onnx"), &first.join("m.onnx"), &first.join("m.onnx_data"))
        .unwrap();
    let second = dir.path().join("second");
    bundler
        .bundle(&first.join("m.onnx"), &second.join("m.onnx"), &second.join("m.onnx_data"))
        .unwrap();

    assert_eq!(
        std::fs::read(first.join("m.onnx")).unwrap(),
        std::fs::read(second.join("m.onnx")).unwrap()
    );
    assert_eq!(
        std::fs::read(first.join("m.onnx_data")).unwrap(),
        std::fs::read(second.join("m.onnx_data")).unwrap()
    );
    assert_eq!(
        inspect_model(&first.join("m.onnx")).unwrap().inputs,
        inspect_model(&second.join("m.onnx")).unwrap().inputs
    );
}

#[test]
fn missing_weight_file_fails_without_outputs() {
    let dir = TempDir::new().unwrap();
    let scratch = dir.path().join("scratch");
    std::fs::create_dir_all(&scratch).unwrap();
    save_model(&scattered_model(&scratch), &scratch.join("model.onnx")).unwrap();
    std::fs::remove_file(scratch.join("pos_embed.bin")).unwrap();

    let onnx = dir.path().join("m.onnx");
    let data = dir.path().join("m.onnx_data");
    assert!(ExternalDataBundler::new(1024).bundle(&scratch.join("model.onnx"), &onnx, &data).is_err());
    assert!(!onnx.exists());
    assert!(!data.exists());
}
