//! 属性値の式
//!
//! リテラル値と、他リソースの計算済み出力への参照を表現します。

use crate::error::{FlowError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;

/// 他リソースの出力への参照（`resource.attribute`）
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Reference {
    /// 参照先リソースの論理名
    pub resource: String,
    /// 参照先の属性名
    pub attribute: String,
}

impl Reference {
    pub fn new(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            attribute: attribute.into(),
        }
    }
}

impl FromStr for Reference {
    type Err = FlowError;

    fn from_str(s: &str) -> Result<Self> {
        match s.split_once('.') {
            Some((resource, attribute)) if !resource.is_empty() && !attribute.is_empty() => {
                Ok(Reference::new(resource, attribute))
            }
            _ => Err(FlowError::InvalidReference(s.to_string())),
        }
    }
}

impl std::fmt::Display for Reference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.resource, self.attribute)
    }
}

/// 属性値の式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Expr {
    /// リテラル値
    Literal(Value),
    /// 他リソースの出力への参照
    Ref(Reference),
    /// 要素ごとに評価されるリスト
    List(Vec<Expr>),
    /// 文字列として連結される式の並び
    Concat(Vec<Expr>),
}

impl Expr {
    pub fn literal(value: impl Into<Value>) -> Self {
        Expr::Literal(value.into())
    }

    pub fn reference(resource: impl Into<String>, attribute: impl Into<String>) -> Self {
        Expr::Ref(Reference::new(resource, attribute))
    }

    /// 式に含まれる全ての参照
    pub fn references(&self) -> Vec<&Reference> {
        let mut refs = Vec::new();
        self.collect_references(&mut refs);
        refs
    }

    fn collect_references<'a>(&'a self, refs: &mut Vec<&'a Reference>) {
        match self {
            Expr::Literal(_) => {}
            Expr::Ref(reference) => refs.push(reference),
            Expr::List(items) | Expr::Concat(items) => {
                for item in items {
                    item.collect_references(refs);
                }
            }
        }
    }

    /// 参照を解決して値を得る
    ///
    /// 解決できない参照があれば、最初に見つかったものを `Err` で返します。
    pub fn try_resolve<F>(&self, lookup: &F) -> std::result::Result<Value, Reference>
    where
        F: Fn(&Reference) -> Option<Value>,
    {
        match self {
            Expr::Literal(value) => Ok(value.clone()),
            Expr::Ref(reference) => lookup(reference).ok_or_else(|| reference.clone()),
            Expr::List(items) => items
                .iter()
                .map(|item| item.try_resolve(lookup))
                .collect::<std::result::Result<Vec<_>, _>>()
                .map(Value::Array),
            Expr::Concat(parts) => {
                let mut out = String::new();
                for part in parts {
                    out.push_str(&value_to_plain_string(&part.try_resolve(lookup)?));
                }
                Ok(Value::String(out))
            }
        }
    }

    /// 文字列リテラルを書き換える（テンプレート展開用）
    pub fn map_strings<F>(&mut self, f: &mut F) -> Result<()>
    where
        F: FnMut(&str) -> Result<String>,
    {
        match self {
            Expr::Literal(value) => map_json_strings(value, f),
            Expr::Ref(_) => Ok(()),
            Expr::List(items) | Expr::Concat(items) => {
                for item in items {
                    item.map_strings(f)?;
                }
                Ok(())
            }
        }
    }
}

impl From<Value> for Expr {
    fn from(value: Value) -> Self {
        Expr::Literal(value)
    }
}

impl From<&str> for Expr {
    fn from(value: &str) -> Self {
        Expr::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for Expr {
    fn from(value: String) -> Self {
        Expr::Literal(Value::String(value))
    }
}

impl From<Reference> for Expr {
    fn from(reference: Reference) -> Self {
        Expr::Ref(reference)
    }
}

fn map_json_strings<F>(value: &mut Value, f: &mut F) -> Result<()>
where
    F: FnMut(&str) -> Result<String>,
{
    match value {
        Value::String(s) => {
            *s = f(s)?;
        }
        Value::Array(items) => {
            for item in items {
                map_json_strings(item, f)?;
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                map_json_strings(item, f)?;
            }
        }
        _ => {}
    }
    Ok(())
}

/// 連結用の文字列表現（文字列はクォートなし、null は空文字）
pub fn value_to_plain_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn lookup(reference: &Reference) -> Option<Value> {
        match (reference.resource.as_str(), reference.attribute.as_str()) {
            ("instance", "private_ip") => Some(json!("10.0.1.15")),
            ("share", "path") => Some(json!("/uploads")),
            _ => None,
        }
    }

    #[test]
    fn test_parse_reference() {
        let r: Reference = "gateway_instance.private_ip".parse().unwrap();
        assert_eq!(r.resource, "gateway_instance");
        assert_eq!(r.attribute, "private_ip");
        assert!("no_dot".parse::<Reference>().is_err());
        assert!(".attr".parse::<Reference>().is_err());
        assert!("res.".parse::<Reference>().is_err());
    }

    #[test]
    fn test_concat_resolves_to_string() {
        let expr = Expr::Concat(vec![
            Expr::literal("mount "),
            Expr::reference("instance", "private_ip"),
            Expr::literal(":"),
            Expr::reference("share", "path"),
        ]);
        assert_eq!(expr.try_resolve(&lookup).unwrap(), json!("mount 10.0.1.15:/uploads"));
    }

    #[test]
    fn test_unresolved_reference_is_reported() {
        let expr = Expr::List(vec![
            Expr::reference("instance", "private_ip"),
            Expr::reference("volume", "id"),
        ]);
        let missing = expr.try_resolve(&lookup).unwrap_err();
        assert_eq!(missing, Reference::new("volume", "id"));
    }

    #[test]
    fn test_references_walk_nested_expressions() {
        let expr = Expr::List(vec![
            Expr::literal(1),
            Expr::Concat(vec![Expr::reference("a", "id"), Expr::reference("b", "arn")]),
        ]);
        let refs: Vec<String> = expr.references().iter().map(|r| r.to_string()).collect();
        assert_eq!(refs, vec!["a.id", "b.arn"]);
    }

    #[test]
    fn test_map_strings_leaves_references_alone() {
        let mut expr = Expr::List(vec![
            Expr::literal(json!({"name": "x"})),
            Expr::reference("a", "id"),
        ]);
        expr.map_strings(&mut |s| Ok(s.to_uppercase())).unwrap();
        assert_eq!(
            expr,
            Expr::List(vec![
                Expr::literal(json!({"name": "X"})),
                Expr::reference("a", "id"),
            ])
        );
    }
}
