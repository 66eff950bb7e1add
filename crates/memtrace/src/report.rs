//! Leak report assembly.
//!
//! A [`LeakReport`] is a self-contained snapshot of everything the tracer still
//! considers live, handed to a [`Reporter`](crate::Reporter). The tables are
//! copied under the tracer lock; symbol resolution happens after the lock is
//! released. It carries three views of the same data: every
//! live allocation oldest first, and the distinct stacks ordered by bytes and by
//! allocation count.

use hdrhistogram::Histogram;
use nohash_hasher::IntMap;
use serde::{Deserialize, Serialize};
use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::alloc::shared::{fatal, format_bytes};
use crate::level::Level;
use crate::stack::{self, StackId};
use crate::tracer::Bookkeeping;

const BANNER_WIDTH: usize = 80;

/// One allocation still live at report time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Leak {
    pub size: usize,
    /// Nanoseconds between tracer start and the allocation.
    pub acquired_ns: u64,
    /// Absent at `Level::Bytes`.
    pub stack_id: Option<StackId>,
}

/// Live allocations grouped by the call stack that made them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackSummary {
    pub stack_id: StackId,
    /// Symbolicated frames, one per line, innermost first.
    pub trace: String,
    pub count: usize,
    pub total_size: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SizePercentile {
    pub percentile: u8,
    pub bytes: u64,
}

/// Snapshot of live tracked memory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeakReport {
    pub level: Level,
    /// Value of the byte counter when the report was taken.
    pub bytes_tracked: usize,
    pub count_tracked: usize,
    pub size_percentiles: Vec<SizePercentile>,
    /// Oldest first.
    pub leaks: Vec<Leak>,
    pub stacks_by_bytes: Vec<StackSummary>,
    pub stacks_by_count: Vec<StackSummary>,
}

#[derive(Default)]
struct StackMetadata {
    count: usize,
    total_size: usize,
}

struct Chronological {
    acquired_at: quanta::Instant,
    sequence: u64,
    size: usize,
    stack: Option<StackId>,
}

impl PartialEq for Chronological {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Chronological {}

impl PartialOrd for Chronological {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Chronological {
    fn cmp(&self, other: &Self) -> Ordering {
        self.acquired_at
            .cmp(&other.acquired_at)
            .then(self.sequence.cmp(&other.sequence))
    }
}

/// A report whose traces are not yet symbolicated, plus the raw frames they need.
pub(crate) struct UnresolvedReport {
    report: LeakReport,
    frames: IntMap<StackId, Box<[usize]>>,
}

impl UnresolvedReport {
    /// Fills in every trace. Does not touch the tracer tables.
    pub(crate) fn resolve(self) -> LeakReport {
        let Self { mut report, frames } = self;
        let traces: IntMap<StackId, String> = frames
            .into_iter()
            .map(|(id, frames)| (id, stack::resolve(&frames)))
            .collect();

        for summary in report
            .stacks_by_bytes
            .iter_mut()
            .chain(report.stacks_by_count.iter_mut())
        {
            if let Some(trace) = traces.get(&summary.stack_id) {
                summary.trace.clone_from(trace);
            }
        }
        report
    }
}

const LOW_BYTES: u64 = 1;
const HIGH_BYTES: u64 = 1 << 40;
const SIGFIGS: u8 = 3;

impl LeakReport {
    /// Copies what the report needs out of `books`. Runs under the tracer lock.
    pub(crate) fn snapshot(
        books: &Bookkeeping,
        level: Level,
        bytes_tracked: usize,
        percentiles: &[u8],
    ) -> UnresolvedReport {
        let mut heap = BinaryHeap::with_capacity(books.allocs.len());
        let mut by_stack: IntMap<StackId, StackMetadata> = IntMap::default();
        let mut sizes = Histogram::<u64>::new_with_bounds(LOW_BYTES, HIGH_BYTES, SIGFIGS).ok();

        for record in books.allocs.values() {
            heap.push(Reverse(Chronological {
                acquired_at: record.acquired_at,
                sequence: record.sequence,
                size: record.size,
                stack: record.stack,
            }));

            if let Some(sizes) = sizes.as_mut() {
                let clamped = (record.size as u64).clamp(LOW_BYTES, HIGH_BYTES);
                let _ = sizes.record(clamped);
            }

            if let Some(id) = record.stack {
                let meta = by_stack.entry(id).or_default();
                meta.count += 1;
                meta.total_size += record.size;
            }
        }

        let mut leaks = Vec::with_capacity(heap.len());
        while let Some(Reverse(entry)) = heap.pop() {
            let elapsed = entry.acquired_at.saturating_duration_since(books.started_at);
            leaks.push(Leak {
                size: entry.size,
                acquired_ns: u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX),
                stack_id: entry.stack,
            });
        }

        let mut frames = IntMap::with_capacity_and_hasher(by_stack.len(), Default::default());
        let mut stacks_by_bytes: Vec<StackSummary> = by_stack
            .into_iter()
            .map(|(stack_id, meta)| {
                let Some(record) = books.stacks.get(&stack_id) else {
                    fatal(format_args!("live allocation references unknown stack {stack_id}"));
                };
                frames.insert(stack_id, Box::from(record.frames()));
                StackSummary {
                    stack_id,
                    trace: String::new(),
                    count: meta.count,
                    total_size: meta.total_size,
                }
            })
            .collect();

        let mut stacks_by_count = stacks_by_bytes.clone();
        stacks_by_bytes.sort_by(by_bytes);
        stacks_by_count.sort_by(by_count);

        let size_percentiles = match sizes {
            Some(sizes) if !sizes.is_empty() => percentiles
                .iter()
                .map(|&percentile| SizePercentile {
                    percentile,
                    bytes: sizes.value_at_percentile(f64::from(percentile)),
                })
                .collect(),
            _ => Vec::new(),
        };

        let report = Self {
            level,
            bytes_tracked,
            count_tracked: leaks.len(),
            size_percentiles,
            leaks,
            stacks_by_bytes,
            stacks_by_count,
        };
        UnresolvedReport { report, frames }
    }

    /// Looks up a stack summary by id.
    pub fn stack(&self, id: StackId) -> Option<&StackSummary> {
        self.stacks_by_bytes.iter().find(|s| s.stack_id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.leaks.is_empty()
    }

    /// Renders the report as plain text lines, banners included.
    ///
    /// Traces span several lines; each frame becomes its own indented line.
    pub fn lines(&self) -> Vec<String> {
        let banner = "#".repeat(BANNER_WIDTH);
        let mut lines = vec![
            banner.clone(),
            "#  BEGIN MEMTRACE DUMP".to_string(),
            banner.clone(),
            format!(
                "tracer: {} bytes still allocated in {} allocations",
                self.bytes_tracked, self.count_tracked
            ),
        ];

        if !self.size_percentiles.is_empty() {
            let summary: Vec<String> = self
                .size_percentiles
                .iter()
                .map(|p| format!("P{} {}", p.percentile, format_bytes(p.bytes)))
                .collect();
            lines.push(format!("live allocation sizes: {}", summary.join(", ")));
        }

        lines.push("Leaks in order of allocation:".to_string());
        for leak in &self.leaks {
            lines.push(format!("ALLOC {} bytes", leak.size));
            if let Some(stack) = leak.stack_id.and_then(|id| self.stack(id)) {
                lines.push("  stacktrace:".to_string());
                push_trace(&mut lines, &stack.trace);
            }
        }

        if self.level == Level::Stacks {
            lines.push("Stacks by bytes leaked:".to_string());
            for stack in &self.stacks_by_bytes {
                lines.push(format!(
                    "{} bytes in {} allocations:",
                    stack.total_size, stack.count
                ));
                push_trace(&mut lines, &stack.trace);
            }

            lines.push("Stacks by number of leaks:".to_string());
            for stack in &self.stacks_by_count {
                lines.push(format!(
                    "{} allocations leaking {} bytes:",
                    stack.count, stack.total_size
                ));
                push_trace(&mut lines, &stack.trace);
            }
        }

        lines.push(banner.clone());
        lines.push("#  END MEMTRACE DUMP".to_string());
        lines.push(banner);
        lines
    }
}

fn push_trace(lines: &mut Vec<String>, trace: &str) {
    lines.extend(trace.lines().map(|frame| format!("    {frame}")));
}

fn by_bytes(a: &StackSummary, b: &StackSummary) -> Ordering {
    b.total_size
        .cmp(&a.total_size)
        .then(b.count.cmp(&a.count))
        .then(a.stack_id.cmp(&b.stack_id))
}

fn by_count(a: &StackSummary, b: &StackSummary) -> Ordering {
    b.count
        .cmp(&a.count)
        .then(b.total_size.cmp(&a.total_size))
        .then(a.stack_id.cmp(&b.stack_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stack::CapturedStack;

    fn sample_books() -> (Bookkeeping, StackId, StackId) {
        let mut books = Bookkeeping::new(Level::Stacks);
        let s1 = CapturedStack::from_frames(&[0x10, 0x20]).expect("frames");
        let s2 = CapturedStack::from_frames(&[0x30]).expect("frames");

        books.insert(0xa, 100, Some(&s1));
        books.insert(0xb, 50, Some(&s1));
        books.insert(0xc, 10, Some(&s2));
        (books, s1.id(), s2.id())
    }

    #[test]
    fn test_leaks_oldest_first() {
        let (books, s1, s2) = sample_books();
        let report = LeakReport::snapshot(&books, Level::Stacks, 160, &[50]).resolve();

        let sizes: Vec<usize> = report.leaks.iter().map(|l| l.size).collect();
        assert_eq!(sizes, vec![100, 50, 10]);
        assert_eq!(report.leaks[0].stack_id, Some(s1));
        assert_eq!(report.leaks[2].stack_id, Some(s2));
        assert!(report.leaks[0].acquired_ns <= report.leaks[1].acquired_ns);
        assert_eq!(report.count_tracked, 3);
    }

    #[test]
    fn test_stack_views_are_sorted() {
        let (books, s1, s2) = sample_books();
        let report = LeakReport::snapshot(&books, Level::Stacks, 160, &[50]).resolve();

        let by_bytes: Vec<(StackId, usize, usize)> = report
            .stacks_by_bytes
            .iter()
            .map(|s| (s.stack_id, s.total_size, s.count))
            .collect();
        assert_eq!(by_bytes, vec![(s1, 150, 2), (s2, 10, 1)]);

        let by_count: Vec<StackId> = report.stacks_by_count.iter().map(|s| s.stack_id).collect();
        assert_eq!(by_count, vec![s1, s2]);
        assert_eq!(report.stack(s2).map(|s| s.trace.as_str()), Some("0x30"));
    }

    #[test]
    fn test_ties_break_by_count_then_id() {
        let mut books = Bookkeeping::new(Level::Stacks);
        let big = CapturedStack::from_frames(&[0x1]).expect("frames");
        let many = CapturedStack::from_frames(&[0x2]).expect("frames");
        books.insert(0xa, 40, Some(&big));
        books.insert(0xb, 20, Some(&many));
        books.insert(0xc, 20, Some(&many));

        let report = LeakReport::snapshot(&books, Level::Stacks, 80, &[]).resolve();
        assert_eq!(report.stacks_by_bytes[0].stack_id, many.id());
        assert_eq!(report.stacks_by_count[0].stack_id, many.id());
    }

    #[test]
    fn test_bytes_level_has_no_stacks() {
        let mut books = Bookkeeping::new(Level::Bytes);
        books.insert(0xa, 7, None);
        let report = LeakReport::snapshot(&books, Level::Bytes, 7, &[50]).resolve();

        assert_eq!(report.leaks.len(), 1);
        assert!(report.stacks_by_bytes.is_empty());

        let lines = report.lines();
        assert!(lines.contains(&"ALLOC 7 bytes".to_string()));
        assert!(!lines.iter().any(|l| l.starts_with("Stacks by")));
    }

    #[test]
    fn test_lines_layout() {
        let (books, _, _) = sample_books();
        let report = LeakReport::snapshot(&books, Level::Stacks, 160, &[]).resolve();
        let lines = report.lines();

        assert_eq!(lines[1], "#  BEGIN MEMTRACE DUMP");
        assert_eq!(lines[3], "tracer: 160 bytes still allocated in 3 allocations");
        assert_eq!(lines[lines.len() - 2], "#  END MEMTRACE DUMP");

        let pos = |needle: &str| lines.iter().position(|l| l == needle).expect(needle);
        assert!(pos("Leaks in order of allocation:") < pos("Stacks by bytes leaked:"));
        assert!(pos("Stacks by bytes leaked:") < pos("Stacks by number of leaks:"));
        assert!(lines.contains(&"150 bytes in 2 allocations:".to_string()));
        assert!(lines.contains(&"1 allocations leaking 10 bytes:".to_string()));
        assert!(lines.contains(&"    0x30".to_string()));
    }

    #[test]
    fn test_snapshot_holds_frames_until_resolved() {
        let (books, s1, _) = sample_books();
        let unresolved = LeakReport::snapshot(&books, Level::Stacks, 160, &[]);
        drop(books);

        assert!(unresolved.report.stacks_by_bytes.iter().all(|s| s.trace.is_empty()));
        let report = unresolved.resolve();
        assert_eq!(report.stack(s1).map(|s| s.trace.as_str()), Some("0x10\n0x20"));
        assert!(report.stacks_by_count.iter().all(|s| !s.trace.is_empty()));
    }

    #[test]
    fn test_size_percentiles() {
        let (books, _, _) = sample_books();
        let report = LeakReport::snapshot(&books, Level::Stacks, 160, &[0, 100]).resolve();

        assert_eq!(report.size_percentiles.len(), 2);
        assert_eq!(report.size_percentiles[0].bytes, 10);
        assert_eq!(report.size_percentiles[1].bytes, 100);
    }
}
