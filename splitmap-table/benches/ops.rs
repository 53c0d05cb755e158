use criterion::{black_box, criterion_group, criterion_main, Criterion};

use splitmap_table::{Table, TableConfig};

fn key(v: u64) -> Vec<u8> {
    v.to_le_bytes().to_vec()
}

fn bench_lookup_hit(c: &mut Criterion) {
    let table = Table::with_default_sync(TableConfig {
        init_size: 1024,
        ..Default::default()
    })
    .unwrap();
    let guard = table.read_lock();
    for k in 0..1024u64 {
        table.add(&guard, key(k), key(k));
    }

    c.bench_function("lookup_hit", |b| {
        let mut k = 0u64;
        b.iter(|| {
            k = (k + 1) & 1023;
            black_box(table.lookup(&guard, &key(k)).node().is_some())
        })
    });
}

fn bench_add_del(c: &mut Criterion) {
    let table = Table::with_default_sync(TableConfig {
        init_size: 1024,
        ..Default::default()
    })
    .unwrap();

    c.bench_function("add_del", |b| {
        let mut k = 0u64;
        b.iter(|| {
            k += 1;
            let guard = table.read_lock();
            table.add(&guard, key(k), key(k));
            let found = table.lookup(&guard, &key(k));
            table.del(&guard, &found).unwrap();
        })
    });
}

criterion_group!(benches, bench_lookup_hit, bench_add_del);
criterion_main!(benches);
