use clap::Parser;
use eyre::{Result, eyre};
use memtrace::Format;
use std::path::PathBuf;

use super::load_report;

#[derive(Debug, Parser)]
pub struct ShowArgs {
    #[arg(help = "JSON leak report")]
    report: PathBuf,

    #[arg(
        long,
        default_value = "table",
        help = "Output format: table, log, json or json-pretty"
    )]
    format: Format,
}

impl ShowArgs {
    pub fn run(&self) -> Result<()> {
        let report = load_report(&self.report)?;

        if report.is_empty() {
            println!("No live allocations in {}", self.report.display());
            return Ok(());
        }

        if self.format == Format::Log {
            for line in report.lines() {
                println!("{line}");
            }
            return Ok(());
        }

        self.format
            .reporter()
            .report(&report)
            .map_err(|err| eyre!("failed to render report: {err}"))
    }
}
