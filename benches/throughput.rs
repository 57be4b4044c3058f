//! Throughput benchmarks

use criterion::{criterion_group, criterion_main, Criterion, Throughput};
use serialcal_core::core::context::LineTerminator;
use serialcal_core::core::dump::{hex_dump, Direction};
use serialcal_core::core::protocol::LineAssembler;
use serialcal_core::core::relay::{ConsoleTranslator, DeviceRenderer, RelayOptions};
use serialcal_core::core::ring_buffer::RingBuffer;
use std::hint::black_box;

fn ring_benchmark(c: &mut Criterion) {
    let data: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();

    let mut group = c.benchmark_group("ring_buffer");
    group.throughput(Throughput::Bytes(data.len() as u64));

    group.bench_function("push_pop", |b| {
        let mut ring = RingBuffer::new(1024);
        let mut out = [0u8; 256];
        b.iter(|| {
            for chunk in black_box(&data).chunks(256) {
                for &byte in chunk {
                    ring.push(byte);
                }
                black_box(ring.pop_into(&mut out));
            }
        })
    });

    group.bench_function("overflow", |b| {
        let mut ring = RingBuffer::new(64);
        b.iter(|| {
            for &byte in black_box(&data) {
                ring.push(byte);
            }
            black_box(ring.available())
        })
    });

    group.finish();
}

fn relay_benchmark(c: &mut Criterion) {
    let device_text: Vec<u8> = b"T=23.51 C\r\nH=40.2 %\r\nSTATUS OK\r\n".repeat(32);
    let console_text: Vec<u8> = b"C 1\rE 0\nI\r\n".repeat(32);

    let mut group = c.benchmark_group("relay");
    group.throughput(Throughput::Bytes(device_text.len() as u64));

    group.bench_function("render_device", |b| {
        let mut renderer = DeviceRenderer::new(LineTerminator::CrLf, false);
        b.iter(|| black_box(renderer.render(black_box(&device_text))))
    });

    group.bench_function("translate_console", |b| {
        let mut translator = ConsoleTranslator::new(LineTerminator::CrLf, RelayOptions::default());
        b.iter(|| black_box(translator.translate(black_box(&console_text))))
    });

    group.bench_function("assemble_lines", |b| {
        b.iter(|| {
            let mut assembler = LineAssembler::new(4096);
            let lines = black_box(&device_text)
                .iter()
                .filter_map(|&byte| assembler.push(byte))
                .count();
            black_box(lines)
        })
    });

    group.bench_function("hex_dump", |b| {
        b.iter(|| black_box(hex_dump(Direction::Inbound, black_box(&device_text))))
    });

    group.finish();
}

criterion_group!(benches, ring_benchmark, relay_benchmark);
criterion_main!(benches);
