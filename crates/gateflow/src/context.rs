//! コマンド共通の読み込み処理

use crate::{GlobalArgs, ProviderKind};
use colored::Colorize;
use gateflow_cloud::{
    ExecutorConfig, PollConfig, ResourceProvider, RetryConfig, SimulatedProvider, StateManager,
    StateSnapshot,
};
use gateflow_cloud_aws::AwsProvider;
use gateflow_config::EngineSettings;
use gateflow_core::{LoadedProject, find_project_root, load_project_from_root, parse_assignment};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// 読み込み済みのプロジェクトと実行設定
pub struct Context {
    pub project: LoadedProject,
    pub root: PathBuf,
    pub settings: EngineSettings,
    pub global: GlobalArgs,
}

impl Context {
    /// プロジェクトと実行設定を読み込む
    pub fn load(global: &GlobalArgs) -> anyhow::Result<Self> {
        let (project, root) = load_project(global)?;

        let mut settings = EngineSettings::load()?;
        if let Some(parallelism) = global.parallelism {
            settings.parallelism = parallelism;
        }
        if let Some(timeout) = global.apply_timeout {
            settings.apply_timeout_secs = timeout;
        }
        settings.validate()?;

        Ok(Self {
            project,
            root,
            settings,
            global: global.clone(),
        })
    }

    pub fn state_manager(&self) -> StateManager {
        StateManager::new(&self.root)
    }

    pub fn executor_config(&self) -> ExecutorConfig {
        let retry = &self.settings.retry;
        let poll = &self.settings.poll;
        ExecutorConfig {
            parallelism: self.settings.parallelism,
            retry: RetryConfig {
                max_attempts: retry.max_attempts,
                initial_delay: Duration::from_millis(retry.initial_delay_ms),
                max_delay: Duration::from_millis(retry.max_delay_ms),
                backoff_multiplier: retry.multiplier,
            },
            poll: PollConfig {
                timeout: Duration::from_secs(poll.timeout_secs),
                initial_interval: Duration::from_millis(poll.initial_interval_ms),
                max_interval: Duration::from_millis(poll.max_interval_ms),
                multiplier: poll.multiplier,
            },
            apply_timeout: (self.settings.apply_timeout_secs > 0)
                .then(|| self.settings.apply_timeout()),
        }
    }

    /// プロバイダを生成
    ///
    /// 模擬プロバイダは記録済みの状態から復元します。
    pub fn provider(&self, snapshot: &StateSnapshot) -> anyhow::Result<Arc<dyn ResourceProvider>> {
        let provider: Arc<dyn ResourceProvider> = match self.global.provider {
            ProviderKind::Simulated => Arc::new(SimulatedProvider::from_snapshot(snapshot)),
            ProviderKind::Aws => {
                let region = self.project.variables.string("region").ok_or_else(|| {
                    anyhow::anyhow!("aws プロバイダには変数 region が必要です")
                })?;
                let mut provider = AwsProvider::new(region);
                if let Some(profile) = &self.global.profile {
                    provider = provider.with_profile(profile);
                }
                Arc::new(provider)
            }
        };
        Ok(provider)
    }
}

/// プロジェクトのみを読み込む（実行設定は不要なコマンド用）
pub fn load_project(global: &GlobalArgs) -> anyhow::Result<(LoadedProject, PathBuf)> {
    let mut vars = BTreeMap::new();
    for raw in &global.vars {
        let (name, value) = parse_assignment(raw)?;
        vars.insert(name, value);
    }

    let root = find_project_root()?;
    let project = load_project_from_root(&root, &vars)?;
    tracing::debug!(
        project = %project.name,
        resources = project.graph.len(),
        provider = ?global.provider,
        "Project loaded"
    );
    Ok((project, root))
}

/// プロバイダの認証を確認
pub async fn ensure_authenticated(provider: &dyn ResourceProvider) -> anyhow::Result<()> {
    let status = provider.check_auth().await?;
    if !status.authenticated {
        return Err(anyhow::anyhow!(
            "{} の認証に失敗しました: {}",
            provider.display_name(),
            status.error.unwrap_or_default()
        ));
    }
    if let Some(account) = &status.account_info {
        println!("プロバイダ: {} ({})", provider.display_name().cyan(), account);
    }
    Ok(())
}

/// Ctrl-C で取り消されるトークン
pub fn cancel_on_ctrl_c() -> CancellationToken {
    let token = CancellationToken::new();
    let trigger = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!(
                "{}",
                "⚠ 中断しました。今回作成したリソースをロールバックします...".yellow()
            );
            trigger.cancel();
        }
    });
    token
}

/// 読み込んだ設定ファイル情報を表示
pub fn print_loaded_config_files(project_root: &Path) {
    println!("📄 読み込んだ設定ファイル:");

    for dir in [project_root.to_path_buf(), project_root.join(".gateflow")] {
        let root_file = dir.join("gate.kdl");
        if root_file.exists() {
            println!("  • {}", root_file.display().to_string().cyan());
        }
        let local_file = dir.join("gate.local.kdl");
        if local_file.exists() {
            println!(
                "  • {} (ローカルオーバーライド)",
                local_file.display().to_string().cyan()
            );
        }
    }
}
