//! Criterion benchmarks for the Spoke frame codec.
//!
//! Covers the two layers every message crosses: binary framing and the JSON
//! command envelope inside it.
//!
//! Run with:
//! ```bash
//! cargo bench --package spoke-core --bench frame_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::json;
use spoke_core::protocol::frame::{decode_message, encode_message};
use spoke_core::protocol::{Command, CommandType, Message};
use uuid::Uuid;

// ── Fixtures ──────────────────────────────────────────────────────────────────

fn command_message(command: &Command) -> Message {
    Message::from_command(Uuid::new_v4(), Uuid::new_v4(), command).expect("fixture command must encode")
}

fn fixtures() -> Vec<(&'static str, Message)> {
    let snapshot: serde_json::Map<String, serde_json::Value> =
        (0..64).map(|i| (format!("sensor-{i}"), json!(i as f64 * 0.5))).collect();

    vec![
        ("heartbeat", command_message(&Command::heartbeat())),
        (
            "device_command",
            command_message(
                &Command::with_data(CommandType::DeviceCommand, &json!({"device": "relay-1", "action": "toggle"}))
                    .expect("fixture command must encode"),
            ),
        ),
        (
            "status_snapshot_64",
            command_message(
                &Command::with_data(CommandType::StatusSnapshot, &snapshot).expect("fixture command must encode"),
            ),
        ),
        ("raw_64k", Message::new(Uuid::new_v4(), Uuid::nil(), vec![0xA5; 64 * 1024])),
    ]
}

// ── Benchmarks ────────────────────────────────────────────────────────────────

fn bench_encode(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_message");
    for (name, msg) in fixtures() {
        group.throughput(Throughput::Bytes(msg.length() as u64 + 4));
        group.bench_with_input(BenchmarkId::new("msg", name), &msg, |b, msg| {
            b.iter(|| encode_message(black_box(msg)).expect("encode must succeed"))
        });
    }
    group.finish();
}

fn bench_decode(c: &mut Criterion) {
    let mut group = c.benchmark_group("decode_message");
    for (name, msg) in fixtures() {
        let bytes = encode_message(&msg).expect("encode must succeed for benchmark setup");
        group.throughput(Throughput::Bytes(bytes.len() as u64));
        group.bench_with_input(BenchmarkId::new("msg", name), &bytes, |b, bytes| {
            b.iter(|| decode_message(black_box(bytes)).expect("decode must succeed"))
        });
    }
    group.finish();
}

/// Frame decode plus envelope parse: the reader's per-message cost.
fn bench_decode_and_parse_command(c: &mut Criterion) {
    let msg = command_message(
        &Command::with_data(CommandType::DeviceCommand, &json!({"device": "relay-1", "action": "on"}))
            .expect("fixture command must encode"),
    );
    let bytes = encode_message(&msg).expect("encode must succeed for benchmark setup");

    c.bench_function("decode_and_parse_device_command", |b| {
        b.iter(|| {
            let (decoded, _) = decode_message(black_box(&bytes)).unwrap();
            decoded.command().unwrap()
        })
    });
}

criterion_group!(benches, bench_encode, bench_decode, bench_decode_and_parse_command);
criterion_main!(benches);
