#![forbid(unsafe_code)]

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use lb_groupby::Leaderboard;
use lb_io::{leaderboard_to_json, render_table, write_leaderboard_csv};
use lb_report::RunnerConfig;
use log::debug;

/// Build career and season leaderboards from per-season stat tables.
#[derive(Debug, Parser)]
#[command(name = "leaderboard", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List the available reports.
    List {
        /// JSON file with report definitions merged over the built-ins.
        #[arg(long, env = "LEADERBOARD_REPORTS")]
        reports: Option<PathBuf>,
    },
    /// Run one report against a directory of CSV season tables.
    Run {
        report: String,
        #[arg(long, env = "LEADERBOARD_DATA_DIR", default_value = "data")]
        data_dir: PathBuf,
        #[arg(long, env = "LEADERBOARD_REPORTS")]
        reports: Option<PathBuf>,
        /// Replace the report's own row limit.
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, value_enum, default_value_t = Format::Table)]
        format: Format,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Format {
    Table,
    Csv,
    Json,
}

fn render(board: &Leaderboard, format: Format) -> Result<String, Box<dyn std::error::Error>> {
    Ok(match format {
        Format::Table => render_table(board),
        Format::Csv => write_leaderboard_csv(board)?,
        Format::Json => format!("{:#}\n", leaderboard_to_json(board)),
    })
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    debug!("{cli:?}");

    match cli.command {
        Command::List { reports } => {
            let config = RunnerConfig {
                reports_path: reports,
                ..RunnerConfig::default_paths()
            };
            let catalog = config.catalog()?;
            let width = catalog.names().map(str::len).max().unwrap_or(0);
            for report in catalog.iter() {
                println!("{:<width$}  {}", report.name, report.title);
            }
        }
        Command::Run {
            report,
            data_dir,
            reports,
            limit,
            format,
        } => {
            let config = RunnerConfig {
                data_dir,
                reports_path: reports,
                limit_override: limit,
            };
            let (spec, board) = config.run(&report)?;
            if format == Format::Table {
                println!("{}\n", spec.title);
            }
            print!("{}", render(&board, format)?);
        }
    }

    Ok(())
}
