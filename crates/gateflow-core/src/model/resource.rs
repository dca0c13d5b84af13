//! リソース記述子と出力定義

use super::expr::Expr;
use super::kind::ResourceKind;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// 依存先の論理名を宣言するインターフェース
///
/// 属性値を実行時に走査するのではなく、型付きの式ツリーから参照を集めます。
pub trait Dependencies {
    fn dependencies(&self) -> BTreeSet<String>;
}

/// 1つのインフラオブジェクトの宣言
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// 安定した論理名
    pub name: String,
    /// 種別タグ
    pub kind: ResourceKind,
    /// 属性名 -> 式
    #[serde(default)]
    pub attributes: BTreeMap<String, Expr>,
    /// 明示的な依存先（宣言順）
    #[serde(default)]
    pub depends_on: Vec<String>,
}

impl ResourceDescriptor {
    pub fn new(name: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            attributes: BTreeMap::new(),
            depends_on: Vec::new(),
        }
    }

    /// 属性を追加
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Expr>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// 明示的な依存を追加
    pub fn depends_on(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        if !self.depends_on.contains(&name) {
            self.depends_on.push(name);
        }
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&Expr> {
        self.attributes.get(key)
    }
}

impl Dependencies for ResourceDescriptor {
    fn dependencies(&self) -> BTreeSet<String> {
        let mut deps: BTreeSet<String> = self
            .attributes
            .values()
            .flat_map(|expr| expr.references())
            .map(|r| r.resource.clone())
            .collect();
        deps.extend(self.depends_on.iter().cloned());
        deps
    }
}

/// 公開される出力値の定義
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputSpec {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub value: Expr,
}

impl OutputSpec {
    pub fn new(name: impl Into<String>, value: impl Into<Expr>) -> Self {
        Self {
            name: name.into(),
            description: None,
            value: value.into(),
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

impl Dependencies for OutputSpec {
    fn dependencies(&self) -> BTreeSet<String> {
        self.value
            .references()
            .into_iter()
            .map(|r| r.resource.clone())
            .collect()
    }
}
