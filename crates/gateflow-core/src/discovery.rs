//! ファイル自動発見機能
//!
//! プロジェクトルートと、その中の gate.kdl / gate.local.kdl を探します。

use crate::error::{FlowError, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// ルートファイル名
pub const ROOT_FILE: &str = "gate.kdl";
/// ローカルオーバーライドファイル名
pub const LOCAL_FILE: &str = "gate.local.kdl";
/// プロジェクト内の作業ディレクトリ
pub const WORK_DIR: &str = ".gateflow";

/// 発見されたファイル群
#[derive(Debug, Clone, Default)]
pub struct DiscoveredFiles {
    /// ルートファイル (gate.kdl)
    pub root: Option<PathBuf>,
    /// ローカルオーバーライドファイル (gate.local.kdl)
    pub local_override: Option<PathBuf>,
}

/// プロジェクトルートを検出
///
/// 以下の優先順位で検索:
/// 1. 環境変数 GATEFLOW_PROJECT_ROOT
/// 2. カレントディレクトリから上に向かって以下を探す:
///    - gate.kdl
///    - .gateflow/gate.kdl
#[tracing::instrument]
pub fn find_project_root() -> Result<PathBuf> {
    let start_dir = std::env::current_dir()?;
    find_project_root_from(&start_dir)
}

/// 指定ディレクトリを起点にプロジェクトルートを検出
pub fn find_project_root_from(start_dir: &Path) -> Result<PathBuf> {
    if let Ok(root) = std::env::var("GATEFLOW_PROJECT_ROOT") {
        let path = PathBuf::from(&root);
        debug!(env_root = %root, "Checking GATEFLOW_PROJECT_ROOT");
        if has_root_file(&path) {
            info!(project_root = %path.display(), "Found project root from environment variable");
            return Ok(path);
        }
    }

    let mut current = start_dir.to_path_buf();
    debug!(start_dir = %start_dir.display(), "Searching for project root");

    loop {
        if has_root_file(&current) {
            info!(project_root = %current.display(), "Found project root");
            return Ok(current);
        }
        if !current.pop() {
            break;
        }
    }

    warn!(start_dir = %start_dir.display(), "Project root not found");
    Err(FlowError::ProjectRootNotFound(start_dir.to_path_buf()))
}

fn has_root_file(dir: &Path) -> bool {
    dir.join(ROOT_FILE).exists() || dir.join(WORK_DIR).join(ROOT_FILE).exists()
}

/// プロジェクトルートからファイルを自動発見
///
/// 直下のファイルが `.gateflow/` 配下より優先されます。
#[tracing::instrument(skip(project_root), fields(project_root = %project_root.display()))]
pub fn discover_files(project_root: &Path) -> Result<DiscoveredFiles> {
    let discovered = DiscoveredFiles {
        root: pick(project_root, ROOT_FILE),
        local_override: pick(project_root, LOCAL_FILE),
    };
    debug!(
        root = ?discovered.root,
        local = ?discovered.local_override,
        "File discovery complete"
    );
    Ok(discovered)
}

fn pick(project_root: &Path, file: &str) -> Option<PathBuf> {
    [project_root.join(file), project_root.join(WORK_DIR).join(file)]
        .into_iter()
        .find(|p| p.exists())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;

    #[test]
    fn test_discover_files() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_root = temp_dir.path();

        fs::write(project_root.join("gate.kdl"), "// root")?;
        fs::write(project_root.join("gate.local.kdl"), "// local")?;

        let discovered = discover_files(project_root)?;
        assert!(discovered.root.unwrap().ends_with("gate.kdl"));
        assert!(discovered.local_override.unwrap().ends_with("gate.local.kdl"));
        Ok(())
    }

    #[test]
    fn test_discover_files_in_work_dir() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_root = temp_dir.path();

        fs::create_dir_all(project_root.join(".gateflow"))?;
        fs::write(project_root.join(".gateflow/gate.kdl"), "// root")?;

        let discovered = discover_files(project_root)?;
        assert!(discovered.root.unwrap().ends_with(".gateflow/gate.kdl"));
        assert!(discovered.local_override.is_none());
        Ok(())
    }

    #[test]
    fn test_root_file_priority_over_work_dir() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_root = temp_dir.path();

        fs::write(project_root.join("gate.kdl"), "// root")?;
        fs::create_dir_all(project_root.join(".gateflow"))?;
        fs::write(project_root.join(".gateflow/gate.kdl"), "// nested")?;

        let root = discover_files(project_root)?.root.unwrap();
        assert!(!root.to_string_lossy().contains(".gateflow"));
        Ok(())
    }

    #[test]
    #[serial]
    fn test_find_project_root_walks_up() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_root = temp_dir.path();
        fs::write(project_root.join("gate.kdl"), "// root")?;
        let nested = project_root.join("a/b");
        fs::create_dir_all(&nested)?;

        temp_env::with_var_unset("GATEFLOW_PROJECT_ROOT", || {
            let found = find_project_root_from(&nested).unwrap();
            assert_eq!(found, project_root);
        });
        Ok(())
    }

    #[test]
    #[serial]
    fn test_find_project_root_from_env() -> Result<()> {
        let temp_dir = tempfile::tempdir().unwrap();
        let project_root = temp_dir.path();
        fs::write(project_root.join("gate.kdl"), "// root")?;
        let elsewhere = tempfile::tempdir().unwrap();

        temp_env::with_var(
            "GATEFLOW_PROJECT_ROOT",
            Some(project_root.to_str().unwrap()),
            || {
                let found = find_project_root_from(elsewhere.path()).unwrap();
                assert_eq!(found, project_root);
            },
        );
        Ok(())
    }

    #[test]
    #[serial]
    fn test_project_root_not_found() {
        let elsewhere = tempfile::tempdir().unwrap();
        temp_env::with_var_unset("GATEFLOW_PROJECT_ROOT", || {
            let err = find_project_root_from(elsewhere.path()).unwrap_err();
            assert!(matches!(err, FlowError::ProjectRootNotFound(_)));
        });
    }
}
