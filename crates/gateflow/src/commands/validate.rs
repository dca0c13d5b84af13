use crate::GlobalArgs;
use crate::context;
use colored::Colorize;

pub fn handle(global: &GlobalArgs) -> anyhow::Result<()> {
    println!("{}", "設定を検証中...".blue());

    match context::load_project(global) {
        Ok((project, root)) => {
            println!("プロジェクトルート: {}", root.display().to_string().cyan());
            context::print_loaded_config_files(&root);
            println!("{}", "✓ 設定ファイルは正常です！".green().bold());
            println!();
            println!("サマリー:");
            println!("  プロジェクト: {}", project.name.cyan());
            if let Some(topology) = &project.topology {
                println!("  トポロジー: {}", topology.cyan());
            }
            println!("  変数: {}個", project.variables.len());
            println!(
                "  リソース: {}個 ({}レイヤー)",
                project.graph.len(),
                project.graph.layers().len()
            );
            println!("  出力: {}個", project.outputs.len());
            for output in &project.outputs {
                match &output.description {
                    Some(description) => println!("    - {} ({})", output.name.cyan(), description),
                    None => println!("    - {}", output.name.cyan()),
                }
            }
        }
        Err(e) => {
            eprintln!();
            eprintln!("{}", "✗ 設定エラー".red().bold());
            eprintln!("  {}", e);
            std::process::exit(1);
        }
    }

    Ok(())
}
