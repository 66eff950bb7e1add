use memtrace::{LeakReport, Level, Reporter, Tracer};
use std::alloc::{GlobalAlloc, Layout, System};
use std::error::Error;

/// Prints only the heaviest stacks.
struct TopStacks {
    limit: usize,
}

impl Reporter for TopStacks {
    fn report(&self, report: &LeakReport) -> Result<(), Box<dyn Error>> {
        println!(
            "{} live bytes in {} allocations",
            report.bytes_tracked, report.count_tracked
        );
        for stack in report.stacks_by_bytes.iter().take(self.limit) {
            println!("{} bytes from {} allocations:", stack.total_size, stack.count);
            for frame in stack.trace.lines() {
                println!("    {frame}");
            }
        }
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    // A private tracer, driven by hand instead of installed as the global allocator.
    let tracer = Tracer::builder()
        .level(Level::Stacks)
        .frames(16)
        .reporter(Box::new(TopStacks { limit: 2 }))
        .build(System);

    let layout = Layout::from_size_align(256, 8)?;
    let mut blocks = Vec::new();
    for _ in 0..4 {
        let ptr = unsafe { tracer.alloc(layout) };
        if ptr.is_null() {
            return Err("allocation failed".into());
        }
        blocks.push(ptr);
    }

    for ptr in blocks.drain(..2) {
        unsafe { tracer.dealloc(ptr, layout) };
    }

    tracer.dump();

    for ptr in blocks {
        unsafe { tracer.dealloc(ptr, layout) };
    }
    assert_eq!(tracer.bytes_tracked(), 0);

    Ok(())
}
