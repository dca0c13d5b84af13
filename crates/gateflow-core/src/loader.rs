//! 統合ローダー
//!
//! ファイル発見、パース、変数解決、トポロジー展開、グラフ構築を統合します。
//! ここで失敗した場合、プロバイダーは一度も呼び出されません。

use crate::discovery::{discover_files, find_project_root};
use crate::error::{FlowError, Result};
use crate::graph::ResourceGraph;
use crate::model::{OutputSpec, Project, ResourceDescriptor, VariableSpec};
use crate::parser::parse_kdl_file;
use crate::template::TemplateProcessor;
use crate::topology::{build_topology, builtin_variables};
use crate::variables::{ResolvedVariables, VariableSources, resolve_variables};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// 検証済みのプロジェクト
#[derive(Debug, Clone)]
pub struct LoadedProject {
    /// プロジェクト名
    pub name: String,
    /// プロジェクトルート（文字列から構築した場合は None）
    pub root: Option<PathBuf>,
    /// 組み込みトポロジー名
    pub topology: Option<String>,
    /// 解決済みの変数
    pub variables: ResolvedVariables,
    /// 依存グラフ
    pub graph: ResourceGraph,
    /// 出力定義
    pub outputs: Vec<OutputSpec>,
}

/// カレントディレクトリからプロジェクトをロード
#[instrument(skip(cli_vars))]
pub fn load_project(cli_vars: &BTreeMap<String, String>) -> Result<LoadedProject> {
    info!("Starting project load");
    let project_root = find_project_root()?;
    load_project_from_root(&project_root, cli_vars)
}

/// 指定されたルートディレクトリからプロジェクトをロード
///
/// 読み込み順序: gate.kdl → gate.local.kdl
#[instrument(skip(project_root, cli_vars), fields(project_root = %project_root.display()))]
pub fn load_project_from_root(
    project_root: &Path,
    cli_vars: &BTreeMap<String, String>,
) -> Result<LoadedProject> {
    debug!("Step 1: Discovering files");
    let discovered = discover_files(project_root)?;
    let root_file = discovered
        .root
        .ok_or_else(|| FlowError::ProjectRootNotFound(project_root.to_path_buf()))?;

    debug!("Step 2: Parsing KDL");
    let mut project = parse_kdl_file(&root_file)?;
    if project.name == crate::discovery::WORK_DIR {
        project.name = project_root
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or("unnamed")
            .to_string();
    }
    if let Some(local) = &discovered.local_override {
        debug!(file = %local.display(), "Merging local override");
        project.merge(parse_kdl_file(local)?);
    }

    let sources = VariableSources {
        file: project.values.clone(),
        env: BTreeMap::new(),
        cli: cli_vars.clone(),
    }
    .with_process_env();

    let mut loaded = assemble(project, &sources)?;
    loaded.root = Some(project_root.to_path_buf());
    Ok(loaded)
}

/// パース済みのプロジェクトを検証してグラフを構築
#[instrument(skip_all, fields(project = %project.name))]
pub fn assemble(project: Project, sources: &VariableSources) -> Result<LoadedProject> {
    debug!("Step 3: Resolving variables");
    let specs = variable_specs(&project)?;
    let variables = resolve_variables(&specs, sources)?;

    debug!("Step 4: Expanding topology");
    let (mut resources, mut outputs) = match &project.topology {
        Some(name) => {
            let topology = build_topology(name, &variables)?;
            (topology.resources, topology.outputs)
        }
        None => (Vec::new(), Vec::new()),
    };

    let mut processor = TemplateProcessor::from_variables(&variables);
    for mut resource in project.resources {
        processor.render_resource(&mut resource)?;
        upsert_resource(&mut resources, resource);
    }
    for mut output in project.outputs {
        processor.render_output(&mut output)?;
        if let Some(existing) = outputs.iter_mut().find(|o| o.name == output.name) {
            *existing = output;
        } else {
            outputs.push(output);
        }
    }

    debug!("Step 5: Building dependency graph");
    let graph = ResourceGraph::build(resources)?;
    graph.validate_outputs(&outputs)?;

    info!(
        resources = graph.len(),
        outputs = outputs.len(),
        "Project loaded successfully"
    );

    Ok(LoadedProject {
        name: project.name,
        root: None,
        topology: project.topology,
        variables,
        graph,
        outputs,
    })
}

/// 組み込みの宣言に利用者の宣言を重ねた変数一覧
fn variable_specs(project: &Project) -> Result<Vec<VariableSpec>> {
    let mut specs = match &project.topology {
        Some(name) => builtin_variables(name)?,
        None => Vec::new(),
    };
    for spec in &project.variables {
        if let Some(existing) = specs.iter_mut().find(|s| s.name == spec.name) {
            existing.merge(spec.clone());
        } else {
            specs.push(spec.clone());
        }
    }
    Ok(specs)
}

/// 同名のリソースはカスタム定義で置き換える
fn upsert_resource(resources: &mut Vec<ResourceDescriptor>, resource: ResourceDescriptor) {
    if let Some(existing) = resources.iter_mut().find(|r| r.name == resource.name) {
        debug!(resource = %resource.name, "Custom resource overrides topology resource");
        *existing = resource;
    } else {
        resources.push(resource);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Expr;
    use crate::parser::parse_kdl_string;
    use serial_test::serial;
    use std::fs;

    const GATE_KDL: &str = r#"
project "nfs-uploads"
topology "file-gateway"

variables {
    region "eu-west-1"
    vpc_id "vpc-0abc"
    subnet_id "subnet-0abc"
    subnet_cidr "10.0.0.0/8"
    bucket_name "uploads"
    gateway_ami "ami-0123"
}
"#;

    fn cli(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_assemble_file_gateway() {
        let project = parse_kdl_string(GATE_KDL, "unnamed".to_string()).unwrap();
        let sources = VariableSources {
            file: project.values.clone(),
            ..Default::default()
        };
        let loaded = assemble(project, &sources).unwrap();

        assert_eq!(loaded.name, "nfs-uploads");
        assert_eq!(loaded.graph.len(), 15);
        assert_eq!(loaded.outputs.len(), 2);
    }

    #[test]
    fn test_missing_required_variables_are_all_reported() {
        let project =
            parse_kdl_string("topology \"file-gateway\"", "unnamed".to_string()).unwrap();
        let err = assemble(project, &VariableSources::default()).unwrap_err();

        let FlowError::VariableValidation(problems) = err else {
            panic!("expected validation error");
        };
        assert_eq!(problems.len(), 6);
    }

    #[test]
    fn test_custom_resource_with_template() {
        let content = format!(
            "{GATE_KDL}\n{}",
            r#"
resource "audit_topic" kind="notification-topic" {
    name "{{ name_prefix }}-audit"
}
output "audit_topic_arn" (ref)"audit_topic.arn"
"#
        );
        let project = parse_kdl_string(&content, "unnamed".to_string()).unwrap();
        let sources = VariableSources {
            file: project.values.clone(),
            ..Default::default()
        };
        let loaded = assemble(project, &sources).unwrap();

        let topic = loaded.graph.get("audit_topic").unwrap();
        assert_eq!(topic.attribute("name"), Some(&Expr::literal("gateflow-audit")));
        assert_eq!(loaded.outputs.len(), 3);
    }

    #[test]
    fn test_cli_overrides_file() {
        let project = parse_kdl_string(GATE_KDL, "unnamed".to_string()).unwrap();
        let sources = VariableSources {
            file: project.values.clone(),
            cli: cli(&[("instance_type", "m5.2xlarge")]),
            ..Default::default()
        };
        let loaded = assemble(project, &sources).unwrap();
        assert_eq!(
            loaded.variables.string("instance_type").as_deref(),
            Some("m5.2xlarge")
        );
    }

    #[test]
    #[serial]
    fn test_load_project_from_root_with_local_override() {
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        fs::write(root.join("gate.kdl"), GATE_KDL).unwrap();
        fs::write(
            root.join("gate.local.kdl"),
            "variables {\n    bucket_name \"local-uploads\"\n}\n",
        )
        .unwrap();

        temp_env::with_var("GATE_VAR_REGION", Some("us-east-2"), || {
            let loaded = load_project_from_root(root, &BTreeMap::new()).unwrap();
            assert_eq!(loaded.root.as_deref(), Some(root));
            assert_eq!(
                loaded.variables.string("bucket_name").as_deref(),
                Some("local-uploads")
            );
            assert_eq!(loaded.variables.string("region").as_deref(), Some("us-east-2"));
        });
    }

    #[test]
    fn test_missing_root_file() {
        let temp_dir = tempfile::tempdir().unwrap();
        let err = load_project_from_root(temp_dir.path(), &BTreeMap::new()).unwrap_err();
        assert!(matches!(err, FlowError::ProjectRootNotFound(_)));
    }
}
