//! 変数の解決と検証
//!
//! 値の優先順位（後勝ち）:
//! 1. 宣言のデフォルト値
//! 2. variables ブロック（gate.kdl → gate.local.kdl）
//! 3. 環境変数 `GATE_VAR_<name>`
//! 4. CLI の `--var name=value`
//!
//! 検証はプロバイダー呼び出しの前に行い、全ての問題をまとめて報告します。

use crate::error::{FlowError, Result};
use crate::model::{VariableKind, VariableSpec};
use ipnet::Ipv4Net;
use serde_json::Value;
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// 環境変数による上書きのプレフィックス
pub const ENV_PREFIX: &str = "GATE_VAR_";

/// 検証済みの変数値
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedVariables {
    values: BTreeMap<String, Value>,
}

impl ResolvedVariables {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// 文字列として取得（数値や真偽値は文字列化）
    pub fn string(&self, name: &str) -> Option<String> {
        self.values.get(name).map(|v| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    pub fn integer(&self, name: &str) -> Option<i64> {
        self.values.get(name).and_then(|v| v.as_i64())
    }

    pub fn cidr(&self, name: &str) -> Option<Ipv4Net> {
        self.values
            .get(name)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// テスト・組み込み用に直接値を構築
    pub fn from_values(values: impl IntoIterator<Item = (String, Value)>) -> Self {
        Self {
            values: values.into_iter().collect(),
        }
    }
}

/// 値の供給元
#[derive(Debug, Clone, Default)]
pub struct VariableSources {
    /// variables ブロックの値
    pub file: BTreeMap<String, Value>,
    /// 環境変数からの値
    pub env: BTreeMap<String, String>,
    /// CLI からの値
    pub cli: BTreeMap<String, String>,
}

impl VariableSources {
    /// `GATE_VAR_*` 環境変数を収集
    pub fn with_process_env(mut self) -> Self {
        for (key, value) in std::env::vars() {
            if let Some(name) = key.strip_prefix(ENV_PREFIX) {
                debug!(variable = %name, "Variable supplied by environment");
                self.env.insert(name.to_lowercase(), value);
            }
        }
        self
    }
}

/// `name=value` 形式の CLI 引数をパース
pub fn parse_assignment(raw: &str) -> Result<(String, String)> {
    match raw.split_once('=') {
        Some((name, value)) if !name.trim().is_empty() => {
            Ok((name.trim().to_string(), value.to_string()))
        }
        _ => Err(FlowError::InvalidConfig(format!(
            "変数の指定は name=value 形式です: {}",
            raw
        ))),
    }
}

/// 宣言と供給された値から変数を解決
pub fn resolve_variables(
    specs: &[VariableSpec],
    sources: &VariableSources,
) -> Result<ResolvedVariables> {
    let mut problems = Vec::new();
    let mut values = BTreeMap::new();

    for spec in specs {
        let raw = sources
            .cli
            .get(&spec.name)
            .map(|s| Value::String(s.clone()))
            .or_else(|| sources.env.get(&spec.name).map(|s| Value::String(s.clone())))
            .or_else(|| sources.file.get(&spec.name).cloned())
            .or_else(|| spec.default.clone());

        match raw {
            Some(raw) => match coerce(spec, raw) {
                Ok(value) => {
                    values.insert(spec.name.clone(), value);
                }
                Err(problem) => problems.push(problem),
            },
            None if spec.required => {
                problems.push(format!("必須変数 '{}' が指定されていません", spec.name));
            }
            None => {}
        }
    }

    let declared = |name: &String| specs.iter().any(|s| &s.name == name);
    for name in sources.file.keys().chain(sources.cli.keys()) {
        if !declared(name) {
            problems.push(format!("未宣言の変数 '{}' に値が指定されています", name));
        }
    }
    for name in sources.env.keys() {
        if !declared(name) {
            warn!(variable = %name, "Ignoring undeclared variable from environment");
        }
    }

    if !problems.is_empty() {
        problems.sort();
        problems.dedup();
        return Err(FlowError::VariableValidation(problems));
    }

    Ok(ResolvedVariables { values })
}

/// 宣言された型に合わせて値を変換・検証
fn coerce(spec: &VariableSpec, raw: Value) -> std::result::Result<Value, String> {
    let invalid = |raw: &Value| {
        format!(
            "変数 '{}' の値 {} は {} 型として不正です",
            spec.name, raw, spec.kind
        )
    };

    match spec.kind {
        VariableKind::String => match raw {
            Value::String(_) => Ok(raw),
            Value::Number(_) | Value::Bool(_) => Ok(Value::String(raw.to_string())),
            _ => Err(invalid(&raw)),
        },
        VariableKind::Integer => match &raw {
            Value::Number(n) if n.is_i64() => Ok(raw),
            Value::String(s) => s
                .trim()
                .parse::<i64>()
                .map(|n| Value::Number(n.into()))
                .map_err(|_| invalid(&raw)),
            _ => Err(invalid(&raw)),
        },
        VariableKind::Bool => match &raw {
            Value::Bool(_) => Ok(raw),
            Value::String(s) => match s.trim() {
                "true" => Ok(Value::Bool(true)),
                "false" => Ok(Value::Bool(false)),
                _ => Err(invalid(&raw)),
            },
            _ => Err(invalid(&raw)),
        },
        VariableKind::Cidr => match &raw {
            Value::String(s) => s
                .trim()
                .parse::<Ipv4Net>()
                .map(|net| Value::String(net.to_string()))
                .map_err(|_| invalid(&raw)),
            _ => Err(invalid(&raw)),
        },
    }
}
