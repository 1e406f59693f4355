use std::io::Cursor;

use criterion::{black_box, criterion_group, criterion_main, Criterion};

use pl_core::InputState;
use pl_proto::codec::{encode_command, encode_event, read_command, read_event};
use pl_proto::{Command, Event, FrameRequest, SimulationSnapshot};

fn bench_codec(c: &mut Criterion) {
    let cmd = Command::SetInputState(InputState::new(false, true, true, false));
    c.bench_function("pl_proto_encode_set_input_state", |b| {
        b.iter(|| black_box(encode_command(black_box(&cmd))))
    });

    let cmd_bytes = encode_command(&cmd);
    c.bench_function("pl_proto_read_set_input_state", |b| {
        b.iter(|| black_box(read_command(&mut Cursor::new(black_box(&cmd_bytes))).unwrap()))
    });

    let step = Event::RunStep { time_ms: 12_340 };
    let step_bytes = encode_event(&step);
    c.bench_function("pl_proto_read_run_step", |b| {
        b.iter(|| black_box(read_event(&mut Cursor::new(black_box(&step_bytes)), None).unwrap()))
    });

    let frame = pl_bench::frame(7);
    let req = FrameRequest {
        width: frame.width,
        height: frame.height,
    };
    let frame_bytes = encode_event(&Event::FrameReady(frame));
    c.bench_function("pl_proto_read_frame_160x120", |b| {
        b.iter(|| {
            black_box(read_event(&mut Cursor::new(black_box(&frame_bytes)), Some(req)).unwrap())
        })
    });
}

fn bench_snapshot(c: &mut Criterion) {
    let raw = pl_bench::snapshot(32).raw().to_vec();
    c.bench_function("pl_proto_parse_snapshot_32cp", |b| {
        b.iter(|| black_box(SimulationSnapshot::parse(black_box(raw.clone())).unwrap()))
    });
}

criterion_group!(benches, bench_codec, bench_snapshot);
criterion_main!(benches);
