//! Record-layer crypto benchmarks.

use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use snell::crypto::{CipherKind, PskCipher, MAX_CHUNK};

fn bench_key_derivation(c: &mut Criterion) {
    let cipher = PskCipher::new(CipherKind::Aes128Gcm, b"pass".to_vec());
    let salt = [0x42u8; 16];

    c.bench_function("argon2id_derive", |b| {
        b.iter(|| black_box(cipher.derive(black_box(&salt)).unwrap()))
    });
}

fn bench_seal(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_record");
    group.throughput(Throughput::Bytes(MAX_CHUNK as u64));

    for kind in [CipherKind::Aes128Gcm, CipherKind::ChaCha20Poly1305] {
        let mut sealer = PskCipher::new(kind, b"pass".to_vec())
            .derive(&[0x42u8; 16])
            .unwrap();
        group.bench_function(format!("{kind:?}"), |b| {
            let mut buf = vec![0u8; MAX_CHUNK];
            b.iter(|| {
                let tag = sealer.seal_detached(black_box(&mut buf)).unwrap();
                black_box(tag)
            })
        });
    }
    group.finish();
}

fn bench_seal_open_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("seal_open_record");
    group.throughput(Throughput::Bytes(MAX_CHUNK as u64));

    for kind in [CipherKind::Aes128Gcm, CipherKind::ChaCha20Poly1305] {
        let descriptor = PskCipher::new(kind, b"pass".to_vec());
        group.bench_function(format!("{kind:?}"), |b| {
            let mut sealer = descriptor.derive(&[0x42u8; 16]).unwrap();
            let mut opener = descriptor.derive(&[0x42u8; 16]).unwrap();
            let mut buf = vec![0u8; MAX_CHUNK];
            b.iter(|| {
                let tag = sealer.seal_detached(&mut buf).unwrap();
                opener.open_detached(&mut buf, &tag).unwrap();
            })
        });
    }
    group.finish();
}

criterion_group!(
    benches,
    bench_key_derivation,
    bench_seal,
    bench_seal_open_round_trip
);
criterion_main!(benches);
