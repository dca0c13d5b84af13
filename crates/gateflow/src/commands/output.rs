use crate::GlobalArgs;
use crate::context;
use colored::Colorize;
use gateflow_cloud::{OutputProjector, StateManager, StateSnapshot};
use gateflow_core::{OutputSpec, value_to_plain_string};

pub async fn handle(global: &GlobalArgs, name: Option<&str>, json: bool) -> anyhow::Result<()> {
    let (project, root) = context::load_project(global)?;
    let snapshot = StateManager::new(&root).load().await?;
    let projector = OutputProjector::new(&project.outputs, &snapshot);

    if let Some(name) = name {
        let value = projector.get(name)?;
        if json {
            println!("{}", serde_json::to_string_pretty(&value)?);
        } else {
            println!("{}", value_to_plain_string(&value));
        }
        return Ok(());
    }

    if json {
        let values: serde_json::Map<String, serde_json::Value> = projector
            .all()
            .into_iter()
            .filter_map(|(name, value)| value.ok().map(|v| (name, v)))
            .collect();
        println!("{}", serde_json::to_string_pretty(&values)?);
        return Ok(());
    }

    print_outputs(&project.outputs, &snapshot);
    Ok(())
}

/// 出力値を一覧表示
pub fn print_outputs(specs: &[OutputSpec], state: &StateSnapshot) {
    if specs.is_empty() {
        return;
    }
    println!("{}", "出力:".bold());
    for (name, value) in OutputProjector::new(specs, state).all() {
        match value {
            Ok(value) => println!("  {} = {}", name.cyan(), value_to_plain_string(&value)),
            Err(e) => println!("  {} = {}", name.cyan(), format!("(未確定: {})", e).dimmed()),
        }
    }
}
