use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use tto::database::StatementReader;
use tto::streaming::protocol::{filler_block, FILLER_LEN, TERMINATOR};

fn make_dump(rows: usize) -> Vec<u8> {
    let mut dump = b"-- MySQL dump\n\nCREATE TABLE t (id INT, name VARCHAR(32));\n".to_vec();
    for i in 0..rows {
        dump.extend_from_slice(format!("INSERT INTO t VALUES ({i},'row;{i}');\n").as_bytes());
    }
    dump.extend_from_slice(b"-- Dump completed\n");
    dump.extend_from_slice(&filler_block(FILLER_LEN));
    dump.push(TERMINATOR);
    dump
}

fn bench_split_statements(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    let mut group = c.benchmark_group("split_statements");

    for rows in [100, 1_000, 10_000].iter() {
        let dump = make_dump(*rows);
        group.throughput(Throughput::Bytes(dump.len() as u64));
        group.bench_with_input(BenchmarkId::from_parameter(rows), &dump, |b, dump| {
            b.iter(|| {
                runtime.block_on(async {
                    let mut reader = StatementReader::new(black_box(dump.as_slice()));
                    while let Some(statement) = reader.next_statement().await.unwrap() {
                        black_box(statement);
                    }
                    reader.statements()
                })
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_split_statements);
criterion_main!(benches);
