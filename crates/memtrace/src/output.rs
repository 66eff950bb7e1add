use colored::*;
use prettytable::{Attr, Cell, Row, Table, color};
use std::time::Duration;

use crate::alloc::shared::format_bytes;
use crate::report::{Leak, LeakReport, StackSummary};

/// Sink for leak reports.
///
/// Implement this trait to route reports somewhere other than the built-in formats,
/// e.g. a file, a test harness or a metrics pipeline. Reporters run after the
/// tracer lock is released and may allocate freely; with a global tracer those
/// allocations are tracked like any other.
///
/// # Examples
///
/// ```rust
/// use memtrace::{LeakReport, Reporter};
/// use std::error::Error;
///
/// struct Summary;
///
/// impl Reporter for Summary {
///     fn report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
///         eprintln!("{} bytes in {} allocations", report.bytes_tracked, report.count_tracked);
///         Ok(())
///     }
/// }
/// ```
pub trait Reporter: Send + Sync {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>>;
}

/// Emits every report line as a `tracing` event at TRACE level, target `memtrace`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        for line in report.lines() {
            tracing::trace!(target: "memtrace", "{line}");
        }
        Ok(())
    }
}

/// Prints the report as tables on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        display_table(report);
        Ok(())
    }
}

/// Prints the report as one line of JSON on stdout.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string(report)?);
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
        println!("{}", serde_json::to_string_pretty(report)?);
        Ok(())
    }
}

pub(crate) fn use_colors() -> bool {
    std::env::var("NO_COLOR").is_err()
}

fn header_row(headers: &[&str], use_colors: bool) -> Row {
    let cells = headers
        .iter()
        .map(|header| {
            if use_colors {
                Cell::new(header)
                    .with_style(Attr::Bold)
                    .with_style(Attr::ForegroundColor(color::CYAN))
            } else {
                Cell::new(header).with_style(Attr::Bold)
            }
        })
        .collect();
    Row::new(cells)
}

/// First resolved frame of a trace, shortened to its last two path segments.
pub(crate) fn short_frame(trace: &str) -> String {
    let frame = trace.lines().next().unwrap_or_default();
    let name = frame.split(" at ").next().unwrap_or(frame);
    let parts: Vec<&str> = name.split("::").collect();
    if parts.len() > 2 {
        parts[parts.len() - 2..].join("::")
    } else {
        name.to_string()
    }
}

pub(crate) fn leaks_table(report: &LeakReport, use_colors: bool) -> Table {
    let mut table = Table::new();
    table.add_row(header_row(&["#", "Size", "Allocated at", "Stack"], use_colors));

    for (index, leak) in report.leaks.iter().enumerate() {
        table.add_row(Row::new(vec![
            Cell::new(&(index + 1).to_string()),
            Cell::new(&format_bytes(leak.size as u64)),
            Cell::new(&format!("+{:.2?}", Duration::from_nanos(leak.acquired_ns))),
            Cell::new(&stack_label(report, leak)),
        ]));
    }

    table
}

fn stack_label(report: &LeakReport, leak: &Leak) -> String {
    match leak.stack_id {
        Some(id) => match report.stack(id) {
            Some(stack) => format!("{id} {}", short_frame(&stack.trace)),
            None => id.to_string(),
        },
        None => "-".to_string(),
    }
}

pub(crate) fn stacks_table(stacks: &[StackSummary], count_first: bool, use_colors: bool) -> Table {
    let mut table = Table::new();
    let headers = if count_first {
        ["Allocations", "Bytes", "Trace"]
    } else {
        ["Bytes", "Allocations", "Trace"]
    };
    table.add_row(header_row(&headers, use_colors));

    for stack in stacks {
        let bytes = Cell::new(&format_bytes(stack.total_size as u64));
        let count = Cell::new(&stack.count.to_string());
        let (first, second) = if count_first {
            (count, bytes)
        } else {
            (bytes, count)
        };
        table.add_row(Row::new(vec![first, second, Cell::new(&stack.trace)]));
    }

    table
}

pub(crate) fn display_table(report: &LeakReport) {
    let use_colors = use_colors();

    println!(
        "{} leak report - level: {}",
        "[memtrace]".blue().bold(),
        report.level
    );
    println!(
        "{} still allocated in {} allocations",
        format_bytes(report.bytes_tracked as u64).yellow().bold(),
        report.count_tracked
    );

    if !report.size_percentiles.is_empty() {
        let summary: Vec<String> = report
            .size_percentiles
            .iter()
            .map(|p| format!("P{} {}", p.percentile, format_bytes(p.bytes)))
            .collect();
        println!("Live allocation sizes: {}", summary.join(", "));
    }

    println!();
    println!("{}", "Leaks in order of allocation".bold());
    leaks_table(report, use_colors).printstd();

    if !report.stacks_by_bytes.is_empty() {
        println!();
        println!("{}", "Stacks by bytes leaked".bold());
        stacks_table(&report.stacks_by_bytes, false, use_colors).printstd();

        println!();
        println!("{}", "Stacks by number of leaks".bold());
        stacks_table(&report.stacks_by_count, true, use_colors).printstd();
    }
}
