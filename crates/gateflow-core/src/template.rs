//! テンプレート展開機能
//!
//! Teraを使用して、カスタムリソースと出力の文字列リテラルを
//! 解決済みの変数で展開します。

use crate::error::{FlowError, Result};
use crate::model::{OutputSpec, ResourceDescriptor};
use crate::variables::ResolvedVariables;
use tera::{Context, Tera};
use tracing::debug;

/// テンプレートプロセッサ
pub struct TemplateProcessor {
    tera: Tera,
    context: Context,
}

impl TemplateProcessor {
    /// 新しいテンプレートプロセッサを作成
    pub fn new() -> Self {
        Self {
            tera: Tera::default(),
            context: Context::new(),
        }
    }

    /// 解決済みの変数から作成
    pub fn from_variables(variables: &ResolvedVariables) -> Self {
        let mut processor = Self::new();
        for (key, value) in variables.iter() {
            processor.add_variable(key.clone(), value.clone());
        }
        processor
    }

    /// 変数を追加
    pub fn add_variable(&mut self, key: impl Into<String>, value: serde_json::Value) {
        self.context.insert(key.into(), &value);
    }

    /// 文字列をテンプレートとして展開
    ///
    /// テンプレート構文を含まない文字列はそのまま返します。
    pub fn render_str(&mut self, template: &str) -> Result<String> {
        if !template.contains("{{") && !template.contains("{%") {
            return Ok(template.to_string());
        }
        self.tera.render_str(template, &self.context).map_err(|e| {
            // Teraのエラーから詳細情報を抽出
            let error_detail = extract_tera_error_detail(&e);
            FlowError::TemplateRenderError(error_detail)
        })
    }

    /// リソースの全属性を展開
    pub fn render_resource(&mut self, resource: &mut ResourceDescriptor) -> Result<()> {
        debug!(resource = %resource.name, "Rendering resource attributes");
        for (key, expr) in resource.attributes.iter_mut() {
            expr.map_strings(&mut |s| self.render_str(s)).map_err(|e| {
                FlowError::TemplateRenderError(format!("{}.{}: {}", resource.name, key, e))
            })?;
        }
        Ok(())
    }

    /// 出力の値を展開
    pub fn render_output(&mut self, output: &mut OutputSpec) -> Result<()> {
        let name = output.name.clone();
        output
            .value
            .map_strings(&mut |s| self.render_str(s))
            .map_err(|e| FlowError::TemplateRenderError(format!("output {}: {}", name, e)))
    }
}

impl Default for TemplateProcessor {
    fn default() -> Self {
        Self::new()
    }
}

/// Teraエラーから詳細情報を抽出
///
/// Teraのエラーメッセージを解析して、未定義変数などの具体的な情報を取得します。
fn extract_tera_error_detail(e: &tera::Error) -> String {
    use std::error::Error;

    let mut details = vec![e.to_string()];
    let mut source = e.source();
    while let Some(err) = source {
        details.push(err.to_string());
        source = err.source();
    }

    let full_error = details.join(" | ");

    // 変数名を抽出: "Variable `xxx` not found in context"
    if full_error.contains("not found in context")
        && let Some(start) = full_error.find("Variable `")
        && let Some(end) = full_error[start..].find("` not found")
    {
        let var_name = &full_error[start + 10..start + end];
        return format!(
            "未定義の変数: `{}`\nヒント: variable で宣言し、variables ブロックか --var で値を指定してください",
            var_name
        );
    }

    full_error
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Expr, ResourceKind};
    use serde_json::json;

    fn processor() -> TemplateProcessor {
        TemplateProcessor::from_variables(&ResolvedVariables::from_values([
            ("name_prefix".to_string(), json!("acme")),
            ("bucket_name".to_string(), json!("uploads")),
        ]))
    }

    #[test]
    fn test_simple_variable_expansion() {
        let mut p = processor();
        assert_eq!(p.render_str("{{ name_prefix }}-gw").unwrap(), "acme-gw");
    }

    #[test]
    fn test_plain_strings_are_untouched() {
        let mut p = processor();
        let policy = r#"{"Version":"2012-10-17"}"#;
        assert_eq!(p.render_str(policy).unwrap(), policy);
    }

    #[test]
    fn test_undefined_variable_hint() {
        let mut p = processor();
        let err = p.render_str("{{ missing }}").unwrap_err();
        assert!(err.to_string().contains("missing"), "{err}");
    }

    #[test]
    fn test_render_resource_attributes() {
        let mut resource = ResourceDescriptor::new("topic", ResourceKind::NotificationTopic)
            .with("name", "{{ name_prefix }}-audit")
            .with(
                "tags",
                Expr::literal(json!({"bucket": "{{ bucket_name }}"})),
            )
            .with("owner", Expr::reference("role", "arn"));

        processor().render_resource(&mut resource).unwrap();

        assert_eq!(resource.attribute("name"), Some(&Expr::literal("acme-audit")));
        assert_eq!(
            resource.attribute("tags"),
            Some(&Expr::literal(json!({"bucket": "uploads"})))
        );
        assert_eq!(resource.attribute("owner"), Some(&Expr::reference("role", "arn")));
    }
}
