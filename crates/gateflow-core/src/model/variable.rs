//! 変数定義

use serde::{Deserialize, Serialize};

/// 変数の型
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VariableKind {
    #[default]
    String,
    Integer,
    Bool,
    /// IPv4 CIDR（例: 10.0.0.0/8）
    Cidr,
}

impl VariableKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "string" => Some(VariableKind::String),
            "integer" | "int" | "number" => Some(VariableKind::Integer),
            "bool" | "boolean" => Some(VariableKind::Bool),
            "cidr" => Some(VariableKind::Cidr),
            _ => None,
        }
    }
}

impl std::fmt::Display for VariableKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            VariableKind::String => write!(f, "string"),
            VariableKind::Integer => write!(f, "integer"),
            VariableKind::Bool => write!(f, "bool"),
            VariableKind::Cidr => write!(f, "cidr"),
        }
    }
}

/// 変数の宣言
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariableSpec {
    pub name: String,
    #[serde(default)]
    pub kind: VariableKind,
    /// 値の指定が必須か
    #[serde(default)]
    pub required: bool,
    /// 未指定時のデフォルト値
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
}

impl VariableSpec {
    /// 必須変数を作成
    pub fn required(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::String,
            required: true,
            default: None,
            description: None,
        }
    }

    /// デフォルト値付きの任意変数を作成
    pub fn optional(name: impl Into<String>, default: impl Into<serde_json::Value>) -> Self {
        Self {
            name: name.into(),
            kind: VariableKind::String,
            required: false,
            default: Some(default.into()),
            description: None,
        }
    }

    pub fn of_kind(mut self, kind: VariableKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// 別の宣言で上書き（プロジェクトファイル側の宣言を優先）
    pub fn merge(&mut self, other: VariableSpec) {
        self.kind = other.kind;
        self.required = other.required;
        if other.default.is_some() {
            self.default = other.default;
            self.required = false;
        }
        if other.description.is_some() {
            self.description = other.description;
        }
    }
}
