use criterion::{black_box, criterion_group, criterion_main, Criterion};
use pullserve::parser::{HttpParser, Mode};
use pullserve::ready_pool::ReadyPool;

fn bench_ready_pool_insert_pop(c: &mut Criterion) {
    c.bench_function("ready_pool insert+pop 1000", |b| {
        b.iter(|| {
            let pool = ReadyPool::new();
            for id in 0..1000u64 {
                pool.insert(id);
            }
            for _ in 0..1000u64 {
                black_box(pool.pop());
            }
        });
    });
}

fn bench_parse_get_request(c: &mut Criterion) {
    let raw = b"GET /index.html HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\nUser-Agent: bench\r\n\r\n";
    c.bench_function("parse simple GET request", |b| {
        b.iter(|| {
            let mut parser = HttpParser::new(Mode::Request);
            parser.execute(black_box(raw));
            black_box(parser.completed());
        });
    });
}

fn bench_parse_chunked_request(c: &mut Criterion) {
    let raw = b"POST /submit HTTP/1.1\r\nHost: h\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
    c.bench_function("parse chunked POST request", |b| {
        b.iter(|| {
            let mut parser = HttpParser::new(Mode::Request);
            parser.execute(black_box(raw));
            black_box(parser.completed());
        });
    });
}

criterion_group!(benches, bench_ready_pool_insert_pop, bench_parse_get_request, bench_parse_chunked_request);
criterion_main!(benches);
