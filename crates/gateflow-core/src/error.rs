use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FlowError {
    #[error("KDLパースエラー: {0}")]
    KdlParse(#[from] kdl::KdlError),

    #[error("ファイル読み込みエラー: {0}")]
    Io(#[from] std::io::Error),

    #[error("IO エラー: {path}\n理由: {message}")]
    IoError { path: PathBuf, message: String },

    #[error("無効な設定: {0}")]
    InvalidConfig(String),

    #[error("変数の検証に失敗しました:\n{}", .0.iter().map(|p| format!("  - {p}")).collect::<Vec<_>>().join("\n"))]
    VariableValidation(Vec<String>),

    #[error("テンプレート展開エラー: {0}")]
    TemplateRenderError(String),

    #[error(
        "プロジェクトルートが見つかりません\n探索開始位置: {0}\nヒント: gate.kdl ファイルを含むディレクトリで実行してください"
    )]
    ProjectRootNotFound(PathBuf),

    #[error("未知のトポロジー: {0}")]
    UnknownTopology(String),

    #[error("未知のリソース種別: {0}")]
    UnknownResourceKind(String),

    #[error("リソース名が重複しています: {0}")]
    DuplicateResource(String),

    #[error("出力名が重複しています: {0}")]
    DuplicateOutput(String),

    #[error("'{from}' が存在しないリソース '{to}' を参照しています")]
    UnknownReference { from: String, to: String },

    #[error("循環依存が検出されました: {}", format_edges(.edges))]
    CircularDependency { edges: Vec<(String, String)> },

    #[error("不正な参照式: {0}（\"resource.attribute\" 形式で指定してください）")]
    InvalidReference(String),

    #[error("リソースが見つかりません: {0}")]
    ResourceNotFound(String),
}

fn format_edges(edges: &[(String, String)]) -> String {
    edges
        .iter()
        .map(|(from, to)| format!("{from} -> {to}"))
        .collect::<Vec<_>>()
        .join(", ")
}

pub type Result<T> = std::result::Result<T, FlowError>;
