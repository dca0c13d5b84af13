//! KDLパーサー
//!
//! gate.kdl をパースして [`Project`] を生成します。
//! 各ノードタイプのパース処理はモジュールに分離されています。

mod resource;
mod variable;

use resource::{parse_output, parse_resource};
use variable::{parse_variable, parse_variables_block};

pub use resource::kdl_value_to_json;

use crate::error::{FlowError, Result};
use crate::model::Project;
use kdl::{KdlDocument, KdlNode};
use std::fs;
use std::path::Path;

/// KDLファイルをパースしてProjectを生成
pub fn parse_kdl_file<P: AsRef<Path>>(path: P) -> Result<Project> {
    let content = fs::read_to_string(path.as_ref()).map_err(|e| FlowError::IoError {
        path: path.as_ref().to_path_buf(),
        message: e.to_string(),
    })?;
    let name = path
        .as_ref()
        .parent()
        .and_then(|p| p.file_name())
        .and_then(|n| n.to_str())
        .unwrap_or("unnamed")
        .to_string();
    parse_kdl_string(&content, name)
}

/// KDL文字列をパース
pub fn parse_kdl_string(content: &str, default_name: String) -> Result<Project> {
    let doc: KdlDocument = content.parse()?;

    let mut project = Project {
        name: default_name,
        ..Default::default()
    };

    for node in doc.nodes() {
        match node.name().value() {
            "project" => {
                if let Some(name) = first_string(node) {
                    project.name = name.to_string();
                }
            }
            "topology" => {
                let topology = first_string(node).ok_or_else(|| {
                    FlowError::InvalidConfig("topology requires a name".to_string())
                })?;
                project.topology = Some(topology.to_string());
            }
            "variable" => {
                project.declare(parse_variable(node)?);
            }
            "variables" => {
                project.values.extend(parse_variables_block(node));
            }
            "resource" => {
                let resource = parse_resource(node)?;
                if project.resources.iter().any(|r| r.name == resource.name) {
                    return Err(FlowError::DuplicateResource(resource.name));
                }
                project.resources.push(resource);
            }
            "output" => {
                let output = parse_output(node)?;
                if project.outputs.iter().any(|o| o.name == output.name) {
                    return Err(FlowError::DuplicateOutput(output.name));
                }
                project.outputs.push(output);
            }
            other => {
                tracing::debug!(node = other, "Skipping unknown top-level node");
            }
        }
    }

    Ok(project)
}

/// 最初の位置引数を文字列として取得
pub(crate) fn first_string(node: &KdlNode) -> Option<&str> {
    node.entries()
        .iter()
        .find(|e| e.name().is_none())
        .and_then(|e| e.value().as_string())
}

/// 名前付きプロパティを取得
pub(crate) fn property<'a>(node: &'a KdlNode, key: &str) -> Option<&'a kdl::KdlValue> {
    node.entries()
        .iter()
        .find(|e| e.name().map(|n| n.value()) == Some(key))
        .map(|e| e.value())
}

#[cfg(test)]
mod tests;
