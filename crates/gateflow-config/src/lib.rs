pub mod error;

pub use error::*;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// 設定ファイル名
pub const SETTINGS_FILE: &str = "config.yaml";

/// gateflowの設定ディレクトリを取得
pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or(ConfigError::ConfigDirNotFound)?
        .join("gateflow");

    if !config_dir.exists() {
        std::fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

/// 実行エンジンの設定
///
/// `~/.config/gateflow/config.yaml` から読み込み、環境変数で上書きします。
///
/// ```yaml
/// parallelism: 4
/// apply_timeout_secs: 3600
/// retry:
///   max_attempts: 5
/// poll:
///   timeout_secs: 900
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineSettings {
    /// 同時に実行するプロバイダー呼び出しの上限
    pub parallelism: usize,
    /// apply 全体のタイムアウト（秒）
    pub apply_timeout_secs: u64,
    pub retry: RetrySettings,
    pub poll: PollSettings,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            parallelism: 10,
            apply_timeout_secs: 3600,
            retry: RetrySettings::default(),
            poll: PollSettings::default(),
        }
    }
}

/// 一時的なエラーの再試行設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    /// 最大試行回数
    pub max_attempts: u32,
    /// 初期待機時間（ミリ秒）
    pub initial_delay_ms: u64,
    /// 最大待機時間（ミリ秒）
    pub max_delay_ms: u64,
    /// Exponential倍率
    pub multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 1000,
            max_delay_ms: 30000,
            multiplier: 2.0,
        }
    }
}

/// 非同期な準備完了待ちのポーリング設定
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PollSettings {
    /// 待機の上限（秒）
    pub timeout_secs: u64,
    /// 初期間隔（ミリ秒）
    pub initial_interval_ms: u64,
    /// 最大間隔（ミリ秒）
    pub max_interval_ms: u64,
    pub multiplier: f64,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            timeout_secs: 900,
            initial_interval_ms: 5000,
            max_interval_ms: 30000,
            multiplier: 1.5,
        }
    }
}

impl EngineSettings {
    /// 設定ディレクトリから読み込み、環境変数を適用
    pub fn load() -> Result<Self> {
        let path = get_config_dir()?.join(SETTINGS_FILE);
        let mut settings = Self::load_from(&path)?;
        settings.apply_env()?;
        settings.validate()?;
        Ok(settings)
    }

    /// 指定ファイルから読み込み（存在しなければデフォルト）
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "Settings file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(&content).map_err(|source| ConfigError::InvalidSettings {
            path: path.to_path_buf(),
            source,
        })
    }

    /// GATEFLOW_* 環境変数で上書き
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(v) = env_number("GATEFLOW_PARALLELISM")? {
            self.parallelism = v as usize;
        }
        if let Some(v) = env_number("GATEFLOW_APPLY_TIMEOUT")? {
            self.apply_timeout_secs = v;
        }
        if let Some(v) = env_number("GATEFLOW_MAX_ATTEMPTS")? {
            self.retry.max_attempts = v as u32;
        }
        if let Some(v) = env_number("GATEFLOW_POLL_TIMEOUT")? {
            self.poll.timeout_secs = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.parallelism == 0 {
            return Err(ConfigError::InvalidValue(
                "parallelism は 1 以上を指定してください".to_string(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::InvalidValue(
                "retry.max_attempts は 1 以上を指定してください".to_string(),
            ));
        }
        if self.retry.multiplier < 1.0 || self.poll.multiplier < 1.0 {
            return Err(ConfigError::InvalidValue(
                "multiplier は 1.0 以上を指定してください".to_string(),
            ));
        }
        Ok(())
    }

    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }
}

fn env_number(name: &str) -> Result<Option<u64>> {
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}
