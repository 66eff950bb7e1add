use memtrace::{Level, Tracer};
use std::alloc::System;
use std::hint::black_box;

#[global_allocator]
static GLOBAL: Tracer = Tracer::global(System, Level::Stacks, 32);

#[inline(never)]
fn leak_cache_entries(count: usize) {
    for i in 0..count {
        let entry: &'static mut Vec<u64> = Box::leak(Box::new(vec![i as u64; 16]));
        black_box(entry);
    }
}

#[inline(never)]
fn leak_buffer() {
    let buffer: &'static mut [u8] = Box::leak(vec![0u8; 4096].into_boxed_slice());
    black_box(buffer);
}

#[inline(never)]
fn transient_work() {
    let scratch = vec![1u8; 1024];
    black_box(&scratch);
}

#[memtrace::main(tracer = GLOBAL)]
fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_target(false)
        .init();

    leak_cache_entries(3);
    leak_buffer();
    for _ in 0..10 {
        transient_work();
    }
}
