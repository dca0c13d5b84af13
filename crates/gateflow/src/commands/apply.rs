use crate::GlobalArgs;
use crate::commands::plan::print_plan;
use crate::commands::output::print_outputs;
use crate::context::{self, Context};
use colored::Colorize;
use gateflow_cloud::{ApplyResult, Executor};

pub async fn handle(global: &GlobalArgs, yes: bool) -> anyhow::Result<()> {
    println!("{}", "構築を開始します...".blue().bold());
    let ctx = Context::load(global)?;
    context::print_loaded_config_files(&ctx.root);

    let state_manager = ctx.state_manager();
    let lock = state_manager.acquire_lock().await?;
    let snapshot = state_manager.load().await?;

    let provider = ctx.provider(&snapshot)?;
    context::ensure_authenticated(provider.as_ref()).await?;

    let plan = gateflow_cloud::plan(&ctx.project.graph, &snapshot, provider.as_ref())?;
    print_plan(&plan);

    if !plan.has_changes {
        lock.release().await?;
        return Ok(());
    }

    // 確認（--yesが指定されていない場合）
    if !yes {
        println!();
        println!(
            "{}",
            "警告: クラウド上のリソースを作成・変更・削除します。".yellow()
        );
        println!("実行するには --yes オプションを指定してください");
        lock.release().await?;
        return Ok(());
    }

    println!();
    let executor = Executor::new(provider, ctx.executor_config());
    println!("実行ID: {}", executor.run_id().to_string().cyan());
    let mut outcome = executor
        .apply(
            &ctx.project.graph,
            &plan,
            snapshot,
            context::cancel_on_ctrl_c(),
        )
        .await;

    // 失敗時も実際に作成された分は記録する
    state_manager.save(&mut outcome.state).await?;
    lock.release().await?;

    print_result(&outcome.result);
    if outcome.result.is_success() && !outcome.cancelled {
        println!();
        print_outputs(&ctx.project.outputs, &outcome.state);
    }

    outcome.into_result()?;
    println!();
    println!("{}", "✓ 構築が完了しました".green().bold());
    Ok(())
}

/// 実行結果を表示
pub fn print_result(result: &ApplyResult) {
    for done in &result.succeeded {
        println!("  ✓ {} ({}) {}", done.resource.cyan(), done.action, done.message);
    }
    for failed in &result.failed {
        println!(
            "  {} {} ({}): {}",
            "✗".red(),
            failed.resource.cyan(),
            failed.action,
            failed.error.as_deref().unwrap_or_default()
        );
    }
    for name in &result.skipped {
        println!("  {} {} (スキップ)", "-".yellow(), name.cyan());
    }
    for name in &result.rolled_back {
        println!("  {} {} (ロールバック)", "↩".yellow(), name.cyan());
    }
    println!(
        "完了: {}件, 失敗: {}件, スキップ: {}件 ({}ms)",
        result.succeeded.len(),
        result.failed.len(),
        result.skipped.len(),
        result.duration_ms
    );
}
