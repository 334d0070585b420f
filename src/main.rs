use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use btc_backtest::data;
use btc_backtest::engine::Backtester;
use btc_backtest::exec::strip_code_fences;

#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Backtest a strategy script over a date window
    Backtest {
        /// Daily OHLCV CSV (Date,Open,High,Low,Close,Volume)
        #[arg(long)]
        data: PathBuf,
        /// Strategy script defining run(df, holdings)
        #[arg(long)]
        strategy: PathBuf,
        /// First execution day (inclusive), e.g. 2020-01-02
        #[arg(long)]
        start: String,
        /// Last execution day (inclusive)
        #[arg(long)]
        end: String,
    },
    /// Run an analysis script defining run_on_data(df) over the full dataset
    Analyze {
        /// Daily OHLCV CSV (Date,Open,High,Low,Close,Volume)
        #[arg(long)]
        data: PathBuf,
        /// Analysis script
        #[arg(long)]
        script: PathBuf,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    match args.command {
        Command::Backtest {
            data,
            strategy,
            start,
            end,
        } => {
            let backtester = load_backtester(&data)?;
            let source = read_script(&strategy)?;
            match backtester.test_strategy(&start, &end, &source) {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(err) => {
                    eprintln!("{err}");
                    std::process::exit(1);
                }
            }
        }
        Command::Analyze { data, script } => {
            let backtester = load_backtester(&data)?;
            let source = read_script(&script)?;
            match backtester.run_analysis(&source) {
                Ok(result) => println!("{}", serde_json::to_string_pretty(&result)?),
                Err(err) => {
                    eprintln!("{err}");
                    std::process::exit(1);
                }
            }
        }
    }

    Ok(())
}

fn load_backtester(path: &PathBuf) -> Result<Backtester> {
    let table = data::csv::load_table(path)?;
    tracing::info!(rows = table.len(), path = %path.display(), "Loaded price table");
    Ok(Backtester::new(table))
}

fn read_script(path: &PathBuf) -> Result<String> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read script {}", path.display()))?;
    Ok(strip_code_fences(&raw))
}
