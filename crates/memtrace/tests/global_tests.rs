#[cfg(test)]
pub mod tests {
    use memtrace::{LeakReport, Level, Reporter, Tracer};
    use std::alloc::System;
    use std::hint::black_box;
    use std::sync::Mutex;

    #[global_allocator]
    static GLOBAL: Tracer = Tracer::global(System, Level::Stacks, 32);

    static OUTPUT: Mutex<String> = Mutex::new(String::new());

    /// Appends every report to `OUTPUT`, growing a buffer the host allocated
    /// through the tracer.
    struct Buffered;

    impl Reporter for Buffered {
        fn report(&self, report: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
            let mut output = OUTPUT.lock().unwrap();
            for line in report.lines() {
                output.push_str(&line);
                output.push('\n');
            }
            Ok(())
        }
    }

    #[inline(never)]
    fn leak_from_site() -> &'static mut [u8] {
        let leaked = Box::leak(vec![7u8; 48].into_boxed_slice());
        black_box(leaked)
    }

    #[test]
    fn test_reporter_reallocating_during_dump() {
        black_box(leak_from_site());
        OUTPUT.lock().unwrap().reserve(16);
        GLOBAL.set_reporter(Box::new(Buffered));

        GLOBAL.dump();

        // Small blocks land on the addresses the report freed while growing.
        let reused: Vec<Vec<u8>> = (0..256).map(|i| vec![i as u8; 16]).collect();
        black_box(&reused);
        drop(reused);

        GLOBAL.dump();

        let output = OUTPUT.lock().unwrap();
        assert!(output.matches("BEGIN MEMTRACE DUMP").count() >= 2);
        assert!(output.contains("END MEMTRACE DUMP"));
    }

    #[test]
    fn test_global_traces_name_the_allocating_function() {
        if GLOBAL.level() != Level::Stacks {
            return;
        }

        let leaked = leak_from_site();
        let report = GLOBAL.leak_report().unwrap();
        let found = report
            .stacks_by_bytes
            .iter()
            .any(|stack| stack.trace.contains("leak_from_site"));
        assert!(found, "no trace names leak_from_site");
        black_box(leaked);
    }
}
