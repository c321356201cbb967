use criterion::{black_box, criterion_group, criterion_main, Criterion};
use gasoline::buffer::{LogEntry, TelemetryBuffer};
use gasoline::cursor::Cursor;

fn entry(i: usize) -> LogEntry {
    LogEntry {
        ts: String::new(),
        level: "info".into(),
        message: format!("benchmark message number {i} with a realistic length payload"),
        source: "console".into(),
        tab_id: Some(1),
        sequence: None,
        extra: serde_json::Map::new(),
    }
}

fn bench_buffers(c: &mut Criterion) {
    c.bench_function("append_into_bounded_buffer", |b| {
        let buffer = TelemetryBuffer::new("logs", 1000);
        let mut i = 0usize;
        b.iter(|| {
            buffer.append(black_box(entry(i))).unwrap();
            i += 1;
        });
    });

    c.bench_function("cursor_read_page_of_100", |b| {
        let buffer = TelemetryBuffer::new("logs", 1000);
        for i in 0..1000 {
            buffer.append(entry(i)).unwrap();
        }
        b.iter(|| {
            let (page, next) = buffer.read(black_box(&Cursor::zero()), 100, None);
            black_box((page, next));
        });
    });

    c.bench_function("filtered_read_errors_only", |b| {
        let buffer = TelemetryBuffer::new("logs", 1000);
        for i in 0..1000 {
            let mut e = entry(i);
            if i % 10 == 0 {
                e.level = "error".into();
            }
            buffer.append(e).unwrap();
        }
        let errors_only = |e: &LogEntry| e.level == "error";
        b.iter(|| {
            let (page, _) = buffer.read(black_box(&Cursor::zero()), usize::MAX, Some(&errors_only));
            black_box(page);
        });
    });
}

criterion_group!(benches, bench_buffers);
criterion_main!(benches);
