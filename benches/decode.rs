// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Benchmark for basic-block decoding.
//!
//! Make sure the result of the benchmarked function is used,
//! whether by sending it to black_box, or to return it from the closure.

use std::hint::black_box;

use criterion::{criterion_group, criterion_main, Criterion};

use dbrew::decoder::decode_block_bytes;

/// A frame-setup prologue ending at its first branch.
const PROLOGUE: &[u8] = &[
    0x55,
    0x48, 0x89, 0xE5,
    0x48, 0x83, 0xEC, 0x20,
    0x48, 0x89, 0x7D, 0xF8,
    0x48, 0x8B, 0x45, 0xF8,
    0x48, 0x85, 0xC0,
    0x74, 0x00,
];

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("block decoding", |b| {
        b.iter(|| black_box(decode_block_bytes(black_box(PROLOGUE), 0x40_0000).unwrap()))
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
