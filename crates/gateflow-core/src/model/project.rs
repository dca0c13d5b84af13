//! プロジェクト定義

use super::resource::{OutputSpec, ResourceDescriptor};
use super::variable::VariableSpec;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// gate.kdl から読み込まれたプロジェクト
///
/// 変数はまだ検証・展開されていない状態です。
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Project {
    /// プロジェクト名
    pub name: String,
    /// 組み込みトポロジー名（例: "file-gateway"）
    #[serde(default)]
    pub topology: Option<String>,
    /// 変数の宣言（宣言順）
    #[serde(default)]
    pub variables: Vec<VariableSpec>,
    /// variables ブロックで与えられた値
    #[serde(default)]
    pub values: BTreeMap<String, serde_json::Value>,
    /// 追加のカスタムリソース
    #[serde(default)]
    pub resources: Vec<ResourceDescriptor>,
    /// 追加の出力
    #[serde(default)]
    pub outputs: Vec<OutputSpec>,
}

impl Project {
    pub fn variable(&self, name: &str) -> Option<&VariableSpec> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// 変数宣言を追加、既存なら上書き
    pub fn declare(&mut self, spec: VariableSpec) {
        if let Some(existing) = self.variables.iter_mut().find(|v| v.name == spec.name) {
            existing.merge(spec);
        } else {
            self.variables.push(spec);
        }
    }

    /// 別ファイル（gate.local.kdl など）の内容をマージ
    pub fn merge(&mut self, other: Project) {
        if !other.name.is_empty() {
            self.name = other.name;
        }
        if other.topology.is_some() {
            self.topology = other.topology;
        }
        for spec in other.variables {
            self.declare(spec);
        }
        self.values.extend(other.values);
        for resource in other.resources {
            if let Some(existing) = self.resources.iter_mut().find(|r| r.name == resource.name) {
                *existing = resource;
            } else {
                self.resources.push(resource);
            }
        }
        for output in other.outputs {
            if let Some(existing) = self.outputs.iter_mut().find(|o| o.name == output.name) {
                *existing = output;
            } else {
                self.outputs.push(output);
            }
        }
    }
}
