use clap::Parser;
use colored::*;
use eyre::{Result, bail};
use memtrace::{LeakReport, format_bytes};
use prettytable::{Cell, Row, Table};
use std::collections::HashMap;
use std::path::PathBuf;

use super::load_report;

#[derive(Debug, Parser)]
pub struct CompareArgs {
    #[arg(long, help = "JSON leak report taken first")]
    before: PathBuf,

    #[arg(long, help = "JSON leak report taken later")]
    after: PathBuf,

    #[arg(long, help = "Exit with an error if total leaked bytes grew")]
    fail_on_growth: bool,
}

impl CompareArgs {
    pub fn run(&self) -> Result<()> {
        let before = load_report(&self.before)?;
        let after = load_report(&self.after)?;
        let diffs = compare_reports(&before, &after);

        println!(
            "{} {} → {} ({:+.1}%)",
            "[memtrace]".blue().bold(),
            format_bytes(before.bytes_tracked as u64),
            format_bytes(after.bytes_tracked as u64),
            calculate_percentage_diff(before.bytes_tracked as u64, after.bytes_tracked as u64)
        );
        println!(
            "{} → {} live allocations",
            before.count_tracked, after.count_tracked
        );

        if !diffs.is_empty() {
            diff_table(&diffs).printstd();
        }

        if self.fail_on_growth && after.bytes_tracked > before.bytes_tracked {
            bail!(
                "leaked bytes grew by {}",
                format_bytes((after.bytes_tracked - before.bytes_tracked) as u64)
            );
        }

        Ok(())
    }
}

/// Per-stack change between two reports. Stacks are matched by trace text since
/// ids are only stable within one process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackDiff {
    pub trace: String,
    pub bytes_before: usize,
    pub bytes_after: usize,
    pub count_before: usize,
    pub count_after: usize,
}

impl StackDiff {
    fn growth(&self) -> i128 {
        self.bytes_after as i128 - self.bytes_before as i128
    }
}

pub fn compare_reports(before: &LeakReport, after: &LeakReport) -> Vec<StackDiff> {
    let mut by_trace: HashMap<&str, StackDiff> = HashMap::new();

    for stack in &before.stacks_by_bytes {
        let entry = by_trace
            .entry(stack.trace.as_str())
            .or_insert_with(|| empty_diff(&stack.trace));
        entry.bytes_before += stack.total_size;
        entry.count_before += stack.count;
    }

    for stack in &after.stacks_by_bytes {
        let entry = by_trace
            .entry(stack.trace.as_str())
            .or_insert_with(|| empty_diff(&stack.trace));
        entry.bytes_after += stack.total_size;
        entry.count_after += stack.count;
    }

    let mut diffs: Vec<StackDiff> = by_trace.into_values().collect();
    diffs.sort_by(|a, b| {
        b.growth()
            .cmp(&a.growth())
            .then_with(|| a.trace.cmp(&b.trace))
    });
    diffs
}

fn empty_diff(trace: &str) -> StackDiff {
    StackDiff {
        trace: trace.to_string(),
        bytes_before: 0,
        bytes_after: 0,
        count_before: 0,
        count_after: 0,
    }
}

fn diff_table(diffs: &[StackDiff]) -> Table {
    let mut table = Table::new();
    table.add_row(Row::new(vec![
        Cell::new("Bytes"),
        Cell::new("Allocations"),
        Cell::new("Trace"),
    ]));

    for diff in diffs {
        table.add_row(Row::new(vec![
            Cell::new(&format!(
                "{} → {} ({:+.1}%)",
                format_bytes(diff.bytes_before as u64),
                format_bytes(diff.bytes_after as u64),
                calculate_percentage_diff(diff.bytes_before as u64, diff.bytes_after as u64)
            )),
            Cell::new(&format!("{} → {}", diff.count_before, diff.count_after)),
            Cell::new(&diff.trace),
        ]));
    }

    table
}

fn calculate_percentage_diff(before: u64, after: u64) -> f64 {
    if before == 0 {
        if after == 0 { 0.0 } else { 100.0 }
    } else {
        ((after as f64 - before as f64) / before as f64) * 100.0
    }
}
