mod commands;
mod context;

use clap::{Args, Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "gate")]
#[command(about = "書けば、立ち上がる。NFS ファイルゲートウェイを KDL で。", long_about = None)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

/// 全コマンド共通のオプション
#[derive(Args, Debug, Clone)]
pub struct GlobalArgs {
    /// 変数を上書き (name=value、複数指定可)
    #[arg(long = "var", value_name = "NAME=VALUE", global = true)]
    pub vars: Vec<String>,

    /// 使用するプロバイダ
    #[arg(
        long,
        value_enum,
        env = "GATEFLOW_PROVIDER",
        default_value = "aws",
        global = true
    )]
    pub provider: ProviderKind,

    /// aws CLI のプロファイル
    #[arg(long, global = true)]
    pub profile: Option<String>,

    /// 同時に実行する操作数の上限
    #[arg(long, global = true)]
    pub parallelism: Option<usize>,

    /// 適用全体のタイムアウト（秒、0 で無制限）
    #[arg(long, value_name = "SECS", global = true)]
    pub apply_timeout: Option<u64>,

    /// 詳細なログを表示
    #[arg(short, long, global = true)]
    pub verbose: bool,
}

#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderKind {
    /// aws CLI 経由で AWS に構築
    Aws,
    /// メモリ上の模擬プロバイダ（状態ファイルから復元）
    Simulated,
}

#[derive(Subcommand)]
enum Commands {
    /// 設定を検証
    Validate,
    /// 依存グラフを表示
    Graph,
    /// 実行計画を表示
    Plan,
    /// 計画を適用してリソースを構築
    Apply {
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 管理中のリソースをすべて削除
    Destroy {
        /// 確認なしで実行
        #[arg(short, long)]
        yes: bool,
    },
    /// 出力値を表示
    Output {
        /// 出力名（省略時はすべて）
        name: Option<String>,
        /// JSON 形式で表示
        #[arg(long)]
        json: bool,
    },
    /// バージョン情報を表示
    Version,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let filter = if cli.global.verbose {
        tracing_subscriber::EnvFilter::new(
            "gateflow=debug,gateflow_core=debug,gateflow_cloud=debug,gateflow_cloud_aws=debug",
        )
    } else {
        tracing_subscriber::EnvFilter::from_default_env()
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Version => {
            println!("gateflow {}", env!("CARGO_PKG_VERSION"));
            Ok(())
        }
        Commands::Validate => commands::validate::handle(&cli.global),
        Commands::Graph => commands::graph::handle(&cli.global),
        Commands::Plan => commands::plan::handle(&cli.global).await,
        Commands::Apply { yes } => commands::apply::handle(&cli.global, yes).await,
        Commands::Destroy { yes } => commands::destroy::handle(&cli.global, yes).await,
        Commands::Output { name, json } => {
            commands::output::handle(&cli.global, name.as_deref(), json).await
        }
    }
}
