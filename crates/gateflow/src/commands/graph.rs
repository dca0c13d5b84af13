use crate::GlobalArgs;
use crate::context;
use colored::Colorize;

/// 依存グラフをレイヤーごとに表示
///
/// 同じレイヤーのリソースは並行して作成されます。
pub fn handle(global: &GlobalArgs) -> anyhow::Result<()> {
    let (project, _) = context::load_project(global)?;
    let graph = &project.graph;

    println!(
        "{}",
        format!("依存グラフ: {} ({}リソース)", project.name, graph.len())
            .blue()
            .bold()
    );

    for (index, layer) in graph.layers().iter().enumerate() {
        println!();
        println!("{}", format!("レイヤー {}:", index + 1).bold());
        for name in layer {
            let kind = graph
                .get(name)
                .map(|r| r.kind.to_string())
                .unwrap_or_default();
            let deps = graph.dependencies_of(name);
            if deps.is_empty() {
                println!("  • {} ({})", name.cyan(), kind);
            } else {
                println!(
                    "  • {} ({}) ← {}",
                    name.cyan(),
                    kind,
                    deps.into_iter().collect::<Vec<_>>().join(", ")
                );
            }
        }
    }

    Ok(())
}
