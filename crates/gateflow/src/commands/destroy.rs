use crate::GlobalArgs;
use crate::commands::apply::print_result;
use crate::context::{self, Context};
use colored::Colorize;
use gateflow_cloud::Executor;

pub async fn handle(global: &GlobalArgs, yes: bool) -> anyhow::Result<()> {
    println!("{}", "リソースを削除します...".blue().bold());
    let ctx = Context::load(global)?;

    let state_manager = ctx.state_manager();
    let lock = state_manager.acquire_lock().await?;
    let snapshot = state_manager.load().await?;

    if snapshot.is_empty() {
        println!("{}", "管理中のリソースはありません".green());
        lock.release().await?;
        return Ok(());
    }

    println!();
    println!(
        "{}",
        format!("削除対象のリソース ({} 個):", snapshot.resources.len()).bold()
    );
    for (name, resource) in &snapshot.resources {
        println!("  • {} ({}, {})", name.cyan(), resource.kind, resource.id);
    }

    if !yes {
        println!();
        println!("{}", "警告: 上記のリソースはすべて削除されます。".yellow());
        println!("実行するには --yes オプションを指定してください");
        lock.release().await?;
        return Ok(());
    }

    let provider = ctx.provider(&snapshot)?;
    context::ensure_authenticated(provider.as_ref()).await?;

    println!();
    let executor = Executor::new(provider, ctx.executor_config());
    let mut outcome = executor
        .destroy(snapshot, context::cancel_on_ctrl_c())
        .await;

    state_manager.save(&mut outcome.state).await?;
    lock.release().await?;

    print_result(&outcome.result);
    outcome.into_result()?;
    println!();
    println!("{}", "✓ すべてのリソースを削除しました".green().bold());
    Ok(())
}
