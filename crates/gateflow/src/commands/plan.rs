use crate::GlobalArgs;
use crate::context::{self, Context};
use colored::Colorize;
use gateflow_cloud::{ActionType, Plan};

pub async fn handle(global: &GlobalArgs) -> anyhow::Result<()> {
    println!("{}", "実行計画を作成中...".blue().bold());
    let ctx = Context::load(global)?;
    context::print_loaded_config_files(&ctx.root);

    let snapshot = ctx.state_manager().load().await?;
    let provider = ctx.provider(&snapshot)?;
    context::ensure_authenticated(provider.as_ref()).await?;

    let plan = gateflow_cloud::plan(&ctx.project.graph, &snapshot, provider.as_ref())?;
    print_plan(&plan);

    if plan.has_changes {
        println!();
        println!("適用するには {} を実行してください", "gate apply".cyan());
    }
    Ok(())
}

/// 計画を表示
pub fn print_plan(plan: &Plan) {
    println!();
    if !plan.has_changes {
        println!("{}", "✓ 変更はありません".green());
        return;
    }

    println!("{}", "実行計画:".bold());
    for action in &plan.actions {
        let (symbol, label) = match action.action_type {
            ActionType::Create => ("+".green(), "作成".green()),
            ActionType::Update => ("~".yellow(), "更新".yellow()),
            ActionType::Replace => ("-/+".magenta(), "置換".magenta()),
            ActionType::Delete => ("-".red(), "削除".red()),
            ActionType::NoOp => continue,
        };
        match action.strategy {
            Some(strategy) => println!(
                "  {} {} ({}) {} [{}]",
                symbol,
                action.resource.cyan(),
                action.kind,
                label,
                strategy
            ),
            None => println!(
                "  {} {} ({}) {}",
                symbol,
                action.resource.cyan(),
                action.kind,
                label
            ),
        }
        for change in &action.changes {
            println!("      {}", change);
        }
    }
    for (name, id) in &plan.deposed {
        println!("  {} {} (旧リソース {}) {}", "-".red(), name.cyan(), id, "削除".red());
    }
    if !plan.pre_deletes.is_empty() {
        println!();
        println!("{}", "作成の前に削除（依存する側から順に）:".bold());
        println!("  {}", plan.pre_deletes.join(" → "));
    }

    println!();
    println!("計画: {}", plan.summary());
}
