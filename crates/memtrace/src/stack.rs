//! Call stack capture, identity and symbolication.
//!
//! A stack is identified by a content hash of its raw return addresses. Two
//! allocations made from the same call path hash to the same [`StackId`] and share
//! one stored [`StackRecord`]. Distinct paths that collide are merged.

use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;

use crate::config::MAX_FRAMES;

/// Tracer frames at the top of every captured stack: `capture` itself and the
/// tracer entry point that called it (`Tracer::track` or a `GlobalAlloc` method).
pub const FRAMES_TO_SKIP: usize = 2;

/// Room for frames of the unwinder itself, reported above `capture`.
const UNWINDER_FRAMES: usize = 8;

const BUFFER_LEN: usize = MAX_FRAMES + FRAMES_TO_SKIP + UNWINDER_FRAMES;

// Fixed seeds keep ids stable for the lifetime of the process.
const SEEDS: [u64; 4] = [
    0x6d65_6d74_7261_6365,
    0x9e37_79b9_7f4a_7c15,
    0xc2b2_ae3d_27d4_eb4f,
    0x1656_67b1_9e37_79f9,
];

cfg_if::cfg_if! {
    if #[cfg(any(target_arch = "wasm32", miri))] {
        /// Whether this target can walk the stack at all.
        pub const CAPTURE_AVAILABLE: bool = false;
    } else {
        /// Whether this target can walk the stack at all.
        pub const CAPTURE_AVAILABLE: bool = true;
    }
}

/// Content hash of a captured sequence of return addresses.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct StackId(u64);

impl nohash_hasher::IsEnabled for StackId {}

impl StackId {
    pub fn from_frames(frames: &[usize]) -> Self {
        let state = ahash::RandomState::with_seeds(SEEDS[0], SEEDS[1], SEEDS[2], SEEDS[3]);
        Self(state.hash_one(frames))
    }
}

impl From<u64> for StackId {
    fn from(raw: u64) -> Self {
        Self(raw)
    }
}

impl fmt::Display for StackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// Raw frames of one distinct call path, stored once and never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct StackRecord {
    frames: Box<[usize]>,
}

impl StackRecord {
    pub(crate) fn new(frames: &[usize]) -> Self {
        Self {
            frames: frames.into(),
        }
    }

    pub(crate) fn frames(&self) -> &[usize] {
        &self.frames
    }
}

/// Frames captured on the allocating thread, before any lock is taken.
pub(crate) struct CapturedStack {
    buffer: [usize; BUFFER_LEN],
    start: usize,
    end: usize,
}

impl CapturedStack {
    #[cfg(test)]
    pub(crate) fn from_frames(frames: &[usize]) -> Option<Self> {
        if frames.is_empty() {
            return None;
        }
        let end = frames.len().min(BUFFER_LEN);
        let mut buffer = [0; BUFFER_LEN];
        buffer[..end].copy_from_slice(&frames[..end]);
        Some(Self {
            buffer,
            start: 0,
            end,
        })
    }

    pub(crate) fn frames(&self) -> &[usize] {
        &self.buffer[self.start..self.end]
    }

    pub(crate) fn id(&self) -> StackId {
        StackId::from_frames(self.frames())
    }
}

/// Walks the current thread's stack, keeping at most `limit` frames below the
/// tracer's own machinery. Returns `None` when nothing usable was captured.
///
/// Must be called directly from a tracer entry point marked `#[inline(never)]`:
/// the caller of `capture` is dropped as tracer code and its caller is the host's
/// call site.
#[inline(never)]
pub(crate) fn capture(limit: usize) -> Option<CapturedStack> {
    let marker = capture as *const () as usize;
    let wanted = limit
        .saturating_add(FRAMES_TO_SKIP + UNWINDER_FRAMES)
        .min(BUFFER_LEN);

    let mut buffer = [0; BUFFER_LEN];
    let mut len = 0;
    let mut marker_at = None;

    backtrace::trace(|frame| {
        if marker_at.is_none() && frame.symbol_address() as usize == marker {
            marker_at = Some(len);
        }
        buffer[len] = frame.ip() as usize;
        len += 1;
        len < wanted
    });

    // Without a marker the unwinder's frames stay in; they are identical for every
    // call so stack identity is unaffected.
    let start = marker_at.unwrap_or(0) + FRAMES_TO_SKIP;
    let end = start.saturating_add(limit).min(len);
    if start >= end {
        return None;
    }

    Some(CapturedStack { buffer, start, end })
}

/// Checks whether stack capture yields anything on this platform.
pub(crate) fn capture_supported() -> bool {
    if !CAPTURE_AVAILABLE {
        return false;
    }

    let mut any = false;
    backtrace::trace(|_| {
        any = true;
        false
    });
    any
}

/// Resolves raw frames to one printable line per frame, innermost first.
pub(crate) fn resolve(frames: &[usize]) -> String {
    let mut lines = Vec::with_capacity(frames.len());

    for &ip in frames {
        let mut line = None;
        backtrace::resolve(ip as *mut c_void, |symbol| {
            if line.is_none() {
                line = Some(describe(symbol, ip));
            }
        });
        lines.push(line.unwrap_or_else(|| format!("{ip:#x}")));
    }

    lines.join("\n")
}

fn describe(symbol: &backtrace::Symbol, ip: usize) -> String {
    let name = symbol
        .name()
        .map(|name| name.to_string())
        .unwrap_or_else(|| format!("{ip:#x}"));

    match (symbol.filename(), symbol.lineno()) {
        (Some(file), Some(line)) => format!("{name} at {}:{line}", file.display()),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[inline(never)]
    fn capture_here(limit: usize) -> Option<CapturedStack> {
        capture(limit)
    }

    #[test]
    fn test_same_frames_same_id() {
        let a = StackId::from_frames(&[0x1000, 0x2000, 0x3000]);
        let b = StackId::from_frames(&[0x1000, 0x2000, 0x3000]);
        let c = StackId::from_frames(&[0x1000, 0x2000, 0x3001]);

        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_capture_respects_limit() {
        if !capture_supported() {
            return;
        }

        let stack = capture_here(3).expect("stack capture");
        assert!(!stack.frames().is_empty());
        assert!(stack.frames().len() <= 3);
    }

    #[test]
    fn test_same_call_site_same_id() {
        if !capture_supported() {
            return;
        }

        let ids: Vec<StackId> = (0..2)
            .map(|_| capture_here(8).expect("stack capture").id())
            .collect();
        assert_eq!(ids[0], ids[1]);
    }

    #[test]
    fn test_resolve_unknown_address_falls_back_to_hex() {
        let trace = resolve(&[0x10, 0x20]);
        assert_eq!(trace, "0x10\n0x20");
    }

    #[test]
    fn test_captured_stack_from_frames() {
        assert!(CapturedStack::from_frames(&[]).is_none());

        let stack = CapturedStack::from_frames(&[1, 2, 3]).expect("non-empty");
        assert_eq!(stack.frames(), &[1, 2, 3]);
        assert_eq!(stack.id(), StackId::from_frames(&[1, 2, 3]));
    }

    #[test]
    fn test_record_keeps_frames() {
        let record = StackRecord::new(&[7, 8]);
        assert_eq!(record.frames(), &[7, 8]);
    }

    #[test]
    fn test_display_is_fixed_width_hex() {
        assert_eq!(StackId::from(0xab).to_string(), "00000000000000ab");
    }
}
