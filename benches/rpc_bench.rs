//! Datapath micro-benchmarks.
//!
//! Measures the per-packet fixed costs: header encode/decode, buffer-pool
//! allocation and MsgBuffer setup.
//!
//! Run with:
//! ```bash
//! cargo bench --bench rpc_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use udrpc::buffer::BufferPool;
use udrpc::{PktHdr, PktType, PKT_HDR_SIZE};

fn bench_pkt_hdr(c: &mut Criterion) {
    let mut group = c.benchmark_group("pkt_hdr");
    group.throughput(Throughput::Bytes(PKT_HDR_SIZE as u64));

    let mut buf = [0u8; PKT_HDR_SIZE];
    group.bench_function("encode", |b| {
        b.iter(|| {
            let hdr = PktHdr::new(
                PktType::Req,
                black_box(3),
                black_box(4096),
                black_box(17),
                black_box(2),
                black_box(0xABCD_EF01),
            );
            unsafe { hdr.write_to(buf.as_mut_ptr()) };
            black_box(&buf);
        })
    });

    let hdr = PktHdr::new(PktType::Resp, 3, 4096, 17, 2, 0xABCD_EF01);
    unsafe { hdr.write_to(buf.as_mut_ptr()) };
    group.bench_function("decode", |b| {
        b.iter(|| {
            let hdr = unsafe { PktHdr::read_from(black_box(buf.as_ptr())) };
            black_box(hdr.req_num());
            black_box(hdr.msg_size());
        })
    });

    group.finish();
}

fn bench_buffer_pool(c: &mut Criterion) {
    let mut group = c.benchmark_group("buffer_pool");

    let pool = BufferPool::new();
    for size in [64usize, 4096, 65536] {
        group.bench_function(format!("alloc_free_{size}"), |b| {
            // Warm the size class so the steady-state path is measured.
            let warm = pool.alloc(size).unwrap();
            pool.free(warm);
            b.iter(|| {
                let raw = pool.alloc(black_box(size)).unwrap();
                pool.free(raw);
            })
        });
    }

    group.finish();
}

criterion_group!(benches, bench_pkt_hdr, bench_buffer_pool);
criterion_main!(benches);
