use crossbeam_channel::{Sender, bounded, select, tick};
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::tracer::Tracer;

/// Dumps the tracer when dropped.
///
/// Typically held for the whole of `main`, so the report covers whatever is still
/// allocated when the program winds down.
///
/// ```rust,no_run
/// use memtrace::{DumpGuard, Level, Tracer};
/// use std::alloc::System;
///
/// #[global_allocator]
/// static GLOBAL: Tracer = Tracer::global(System, Level::Stacks, 8);
///
/// fn main() {
///     let _memtrace = DumpGuard::new(&GLOBAL);
///     // ...
/// }
/// ```
#[must_use = "the report is emitted when the guard is dropped"]
#[derive(Debug)]
pub struct DumpGuard<'a, A> {
    tracer: &'a Tracer<A>,
}

impl<'a, A> DumpGuard<'a, A> {
    pub fn new(tracer: &'a Tracer<A>) -> Self {
        Self { tracer }
    }
}

impl<A> Drop for DumpGuard<'_, A> {
    fn drop(&mut self) {
        self.tracer.dump();
    }
}

/// Background thread that dumps a tracer on a fixed interval until dropped.
#[must_use = "the dump thread stops when this handle is dropped"]
#[derive(Debug)]
pub struct PeriodicDump {
    shutdown_tx: Option<Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicDump {
    pub fn start<A>(tracer: &'static Tracer<A>, interval: Duration) -> io::Result<Self>
    where
        A: Sync + 'static,
    {
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);
        let ticker = tick(interval);

        let handle = thread::Builder::new()
            .name("memtrace-dump".into())
            .spawn(move || {
                loop {
                    select! {
                        recv(ticker) -> _ => tracer.dump(),
                        recv(shutdown_rx) -> _ => break,
                    }
                }
            })?;

        tracing::debug!(target: "memtrace", ?interval, "periodic dump started");

        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            handle: Some(handle),
        })
    }
}

impl Drop for PeriodicDump {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::LeakReport;
    use crate::level::Level;
    use crate::output::Reporter;
    use std::alloc::System;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting(Arc<AtomicUsize>);

    impl Reporter for Counting {
        fn report(&self, _: &LeakReport) -> Result<(), Box<dyn std::error::Error>> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn counting_tracer() -> (Tracer, Arc<AtomicUsize>) {
        let dumps = Arc::new(AtomicUsize::new(0));
        let tracer = Tracer::new(System, Level::Bytes, 8);
        tracer.set_reporter(Box::new(Counting(Arc::clone(&dumps))));
        tracer.track(std::ptr::without_provenance_mut(0x1000), 32);
        (tracer, dumps)
    }

    #[test]
    fn test_dump_guard_dumps_on_drop() {
        let (tracer, dumps) = counting_tracer();
        {
            let _guard = DumpGuard::new(&tracer);
            assert_eq!(dumps.load(Ordering::SeqCst), 0);
        }
        assert_eq!(dumps.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_periodic_dump_stops_on_drop() {
        let (tracer, dumps) = counting_tracer();
        let tracer: &'static Tracer = Box::leak(Box::new(tracer));

        let periodic = PeriodicDump::start(tracer, Duration::from_millis(5)).expect("spawn");
        while dumps.load(Ordering::SeqCst) < 2 {
            thread::sleep(Duration::from_millis(1));
        }
        drop(periodic);

        let after_stop = dumps.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(30));
        assert_eq!(dumps.load(Ordering::SeqCst), after_stop);
    }
}
