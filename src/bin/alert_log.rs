//! alert_log - print the persisted detection and email logs
//!
//! Reads `detection_log.csv` and `email_log.csv` from the log directory, the same files
//! watchpostd appends to, and prints them oldest first.

use anyhow::Result;
use clap::{Parser, ValueEnum};
use std::io::IsTerminal;
use std::path::PathBuf;

use watchpost::{Category, Logbook, WatchpostConfig};

#[path = "../ui.rs"]
mod ui;

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Which {
    Detections,
    Emails,
    Both,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Print the watchpost detection and email logs")]
struct Args {
    /// Log directory (defaults to the configured one)
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,

    /// Which log to print
    #[arg(long, value_enum, default_value_t = Which::Both)]
    show: Which,

    /// Only rows for this category
    #[arg(long)]
    category: Option<Category>,

    /// Print only the last N rows of each log
    #[arg(long, value_name = "N")]
    tail: Option<usize>,

    /// UI mode for stderr progress (auto|plain|pretty)
    #[arg(long, default_value = "auto", value_name = "MODE")]
    ui: String,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();
    let args = Args::parse();
    let is_tty = std::io::stderr().is_terminal();
    let stdout_is_tty = std::io::stdout().is_terminal();
    let ui = ui::Ui::from_args(Some(&args.ui), is_tty, !stdout_is_tty);

    let log_dir = match args.log_dir.clone() {
        Some(dir) => dir,
        None => WatchpostConfig::load()?.log_dir,
    };
    let logbook = {
        let _stage = ui.stage("Open logbook");
        Logbook::open(&log_dir)?
    };
    let wanted = |type_column: &str| match args.category {
        Some(category) => type_column.eq_ignore_ascii_case(category.as_str()),
        None => true,
    };

    if matches!(args.show, Which::Detections | Which::Both) {
        println!("=== Detections ({}) ===", logbook.detection_log_path().display());
        let rows: Vec<_> = logbook
            .detections()
            .into_iter()
            .filter(|row| wanted(&row.category))
            .collect();
        for row in tail(&rows, args.tail) {
            println!("{}  {:<8}  {}", row.timestamp, row.category, row.details);
        }
        println!("{} row(s)", rows.len());
    }

    if args.show == Which::Both {
        println!();
    }

    if matches!(args.show, Which::Emails | Which::Both) {
        println!("=== Emails ({}) ===", logbook.email_log_path().display());
        let rows: Vec<_> = logbook
            .emails()
            .into_iter()
            .filter(|row| wanted(&row.category))
            .collect();
        for row in tail(&rows, args.tail) {
            println!(
                "{}  {:<8}  {:<30}  {}",
                row.timestamp, row.category, row.recipient, row.status
            );
        }
        println!("{} row(s)", rows.len());
    }

    Ok(())
}

fn tail<T>(rows: &[T], count: Option<usize>) -> &[T] {
    match count {
        Some(n) if n < rows.len() => &rows[rows.len() - n..],
        _ => rows,
    }
}
