use memtrace::{Format, Level, PeriodicDump, Tracer};
use std::alloc::System;
use std::hint::black_box;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

#[global_allocator]
static GLOBAL: Tracer = Tracer::global(System, Level::Stacks, 32);

static SESSIONS: Mutex<Vec<String>> = Mutex::new(Vec::new());

#[inline(never)]
fn handle_request(id: usize) {
    let body = format!("request {id}");
    black_box(&body);

    // Every third request leaves its session behind.
    if id % 3 == 0 {
        if let Ok(mut sessions) = SESSIONS.lock() {
            sessions.push(format!("session-{id}"));
        }
    }
}

fn main() -> std::io::Result<()> {
    GLOBAL.set_reporter(Format::Table.reporter());
    let _periodic = PeriodicDump::start(&GLOBAL, Duration::from_millis(50))?;

    for id in 0..30 {
        handle_request(id);
        thread::sleep(Duration::from_millis(10));
    }

    Ok(())
}
