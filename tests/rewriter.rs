// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! End-to-end specialization scenarios.
//!
//! Source functions are hand-assembled byte sequences so their
//! instruction mix is exactly the modeled set; the rewritten copies are
//! executed for real and compared against the originals.

mod common;

use common::{call_at, code_bytes, contains, AsmFunc};
use dbrew::Rewriter;

/// `foo(i, j) = if i == 5 { 0 } else { i + j }`
///
/// ```text
/// cmp $5, %rdi
/// jne 1f
/// xor %eax, %eax
/// ret
/// 1: lea (%rdi,%rsi), %rax
/// ret
/// ```
const FOO: &[u8] = &[
    0x48, 0x83, 0xFF, 0x05,
    0x75, 0x03,
    0x31, 0xC0,
    0xC3,
    0x48, 0x8D, 0x04, 0x37,
    0xC3,
];

/// `sum(a, b) = a + b`
///
/// ```text
/// add %rsi, %rdi
/// mov %rdi, %rax
/// ret
/// ```
const SUM: &[u8] = &[0x48, 0x01, 0xF7, 0x48, 0x89, 0xF8, 0xC3];

/// `stencil(xs, coeffs) = sum(coeffs[i] * xs[i] for i in 0..4)`
///
/// ```text
/// xor %eax, %eax
/// xor %rcx, %rcx
/// 1: mov (%rsi,%rcx,8), %r8
/// imul (%rdi,%rcx,8), %r8
/// add %r8, %rax
/// inc %rcx
/// cmp $4, %rcx
/// jne 1b
/// ret
/// ```
const STENCIL: &[u8] = &[
    0x31, 0xC0,
    0x48, 0x31, 0xC9,
    0x4C, 0x8B, 0x04, 0xCE,
    0x4C, 0x0F, 0xAF, 0x04, 0xCF,
    0x4C, 0x01, 0xC0,
    0x48, 0xFF, 0xC1,
    0x48, 0x83, 0xF9, 0x04,
    0x75, 0xEB,
    0xC3,
];

/// `count(a, b) = { while a > 0 { b += 1; a -= 1; } b }`
///
/// ```text
/// 1: test %rdi, %rdi
/// jle 2f
/// inc %rsi
/// dec %rdi
/// jmp 1b
/// 2: mov %rsi, %rax
/// ret
/// ```
const COUNT: &[u8] = &[
    0x48, 0x85, 0xFF,
    0x7E, 0x08,
    0x48, 0xFF, 0xC6,
    0x48, 0xFF, 0xCF,
    0xEB, 0xF3,
    0x48, 0x89, 0xF0,
    0xC3,
];

#[test]
fn static_branch_is_folded_away() {
    let func = AsmFunc::new(FOO);
    assert_eq!(func.call(&[2, 3]), 5);
    assert_eq!(func.call(&[5, 3]), 0);

    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    rw.set_par_static(0);
    let addr = rw.rewrite(&[2, 3]).unwrap();

    assert_eq!(call_at(addr, &[2, 3]), 5);
    assert_eq!(call_at(addr, &[2, 100]), 102);

    // The comparison against 5 resolved at rewrite time.
    let (addr, size) = rw.generated_code();
    let bytes = code_bytes(addr, size);
    assert!(!contains(&bytes, &[0x83, 0xFF, 0x05]), "generated code still compares against 5");
}

#[test]
fn dynamic_add_is_kept() {
    let func = AsmFunc::new(SUM);
    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    let addr = rw.rewrite(&[1, 2]).unwrap();

    assert_eq!(call_at(addr, &[1, 2]), 3);
    assert_eq!(call_at(addr, &[40, 2]), 42);

    // Both operands stay dynamic, so the add itself must survive.
    let (addr, size) = rw.generated_code();
    assert!(contains(&code_bytes(addr, size), &[0x48, 0x01, 0xF7]));
}

#[test]
fn stencil_unrolls_and_drops_zero_coefficients() {
    let func = AsmFunc::new(STENCIL);
    let xs: [i64; 4] = [1, 2, 3, 4];
    let coeffs: [i64; 4] = [3, 0, 5, 7];
    let expected = (3 * 1 + 5 * 3 + 7 * 4) as u64;
    assert_eq!(func.call(&[xs.as_ptr() as u64, coeffs.as_ptr() as u64]), expected);

    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    rw.set_par_static(1);
    let addr = rw.rewrite(&[xs.as_ptr() as u64, coeffs.as_ptr() as u64]).unwrap();

    assert_eq!(call_at(addr, &[xs.as_ptr() as u64, coeffs.as_ptr() as u64]), expected);
    let other: [i64; 4] = [10, 20, 30, 40];
    assert_eq!(call_at(addr, &[other.as_ptr() as u64, coeffs.as_ptr() as u64]), 30 + 150 + 280);

    let (addr, size) = rw.generated_code();
    let bytes = code_bytes(addr, size);
    // The loop unrolled: no conditional jump survives.
    assert!(!contains(&bytes, &[0x75]), "loop back-edge survived specialization");
    // One multiply per non-zero coefficient.
    let muls = bytes.windows(2).filter(|w| w == &[0x0F, 0xAF]).count();
    assert_eq!(muls, 3, "zero coefficient was not dropped");
}

#[test]
fn dynamic_loop_keeps_its_back_edge() {
    let func = AsmFunc::new(COUNT);
    assert_eq!(func.call(&[4, 7]), 11);

    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    let addr = rw.rewrite(&[4, 7]).unwrap();

    assert_eq!(call_at(addr, &[4, 7]), 11);
    assert_eq!(call_at(addr, &[0, 7]), 7);
    assert_eq!(call_at(addr, &[100, 0]), 100);

    // The flags stay dynamic, so a conditional back-edge must exist.
    let (addr, size) = rw.generated_code();
    let bytes = code_bytes(addr, size);
    assert!(
        contains(&bytes, &[0x48, 0xFF, 0xCF]),
        "the decrement disappeared from a dynamic loop"
    );
}

#[test]
fn static_loop_is_unrolled() {
    let func = AsmFunc::new(COUNT);
    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    rw.set_par_static(0);
    let addr = rw.rewrite(&[3, 0]).unwrap();

    assert_eq!(call_at(addr, &[3, 7]), 10);
    assert_eq!(call_at(addr, &[3, 0]), 3);

    let (addr, size) = rw.generated_code();
    let bytes = code_bytes(addr, size);
    // Straight-line code: three increments, no jumps at all.
    let incs = bytes.windows(3).filter(|w| w == &[0x48, 0xFF, 0xC6]).count();
    assert_eq!(incs, 3);
    assert!(!contains(&bytes, &[0x7E]), "conditional jump survived full unrolling");
    assert!(!contains(&bytes, &[0xE9]), "unconditional jump survived full unrolling");
}

#[test]
fn force_unknown_blocks_unrolling() {
    let func = AsmFunc::new(COUNT);
    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    rw.set_par_static(0);
    rw.set_force_unknown(0);
    let addr = rw.rewrite(&[3, 0]).unwrap();

    // Still correct for the traced value of the static parameter.
    assert_eq!(call_at(addr, &[3, 7]), 10);
    assert_eq!(call_at(addr, &[3, 0]), 3);

    // The loop body survived as a loop: the decrement is still there.
    let (addr, size) = rw.generated_code();
    let bytes = code_bytes(addr, size);
    assert!(
        contains(&bytes, &[0x48, 0xFF, 0xCF]),
        "force_unknown did not stop the unrolling"
    );
}

/// `outer(a, b) = helper(a, b) + 1` with `helper(a, b) = a + b`, the call
/// being a direct `call rel32` within the same buffer.
fn outer_with_helper() -> Vec<u8> {
    let mut code = vec![
        0xE8, 0x05, 0x00, 0x00, 0x00, // call helper (+5)
        0x48, 0x83, 0xC0, 0x01, // add $1, %rax
        0xC3,
    ];
    // helper: add %rsi, %rdi; mov %rdi, %rax; ret
    code.extend_from_slice(&[0x48, 0x01, 0xF7, 0x48, 0x89, 0xF8, 0xC3]);
    code
}

#[test]
fn calls_are_inlined() {
    let func = AsmFunc::new(&outer_with_helper());
    assert_eq!(func.call(&[2, 3]), 6);

    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(2);
    let addr = rw.rewrite(&[2, 3]).unwrap();

    assert_eq!(call_at(addr, &[2, 3]), 6);
    assert_eq!(call_at(addr, &[10, 20]), 31);

    // The helper was flattened into the caller: no call left, and only
    // the single final return.
    let (addr, size) = rw.generated_code();
    let bytes = code_bytes(addr, size);
    assert!(!contains(&bytes, &[0xE8]), "call survived inlining");
    assert_eq!(bytes.iter().filter(|&&b| b == 0xC3).count(), 1);
}

/// `skip(a, b) = if a != 0 { b + N } else { b }`, with the conditional
/// jumping over N increments:
///
/// ```text
/// test %rdi, %rdi
/// je end
/// inc %rsi   (N times)
/// end: mov %rsi, %rax
/// ret
/// ```
fn skip_over_incs(n: usize) -> Vec<u8> {
    let mut code = vec![0x48, 0x85, 0xFF, 0x0F, 0x84];
    code.extend_from_slice(&((n * 3) as u32).to_le_bytes());
    for _ in 0..n {
        code.extend_from_slice(&[0x48, 0xFF, 0xC6]);
    }
    code.extend_from_slice(&[0x48, 0x89, 0xF0, 0xC3]);
    code
}

#[test]
fn jump_distance_selects_short_or_near_form() {
    // A short hop stays a 2-byte Jcc.
    let small = AsmFunc::new(&skip_over_incs(2));
    let mut rw = Rewriter::new().unwrap();
    rw.set_function(small.addr());
    rw.set_par_count(2);
    let addr = rw.rewrite(&[1, 5]).unwrap();
    assert_eq!(call_at(addr, &[1, 5]), 7);
    assert_eq!(call_at(addr, &[0, 5]), 5);
    let (addr, size) = rw.generated_code();
    assert!(contains(&code_bytes(addr, size), &[0x74]), "short je expected for a near target");

    // 45 increments put the branch target out of short range.
    let big = AsmFunc::new(&skip_over_incs(45));
    let mut rw = Rewriter::new().unwrap();
    rw.set_function(big.addr());
    rw.set_par_count(2);
    let addr = rw.rewrite(&[1, 5]).unwrap();
    assert_eq!(call_at(addr, &[1, 5]), 50);
    assert_eq!(call_at(addr, &[0, 5]), 5);
    let (addr, size) = rw.generated_code();
    assert!(contains(&code_bytes(addr, size), &[0x0F, 0x84]), "near je expected for a far target");
}

#[test]
fn failed_rewrite_reports_and_stores_the_error() {
    // A function starting with an opcode outside the decoded set.
    let func = AsmFunc::new(&[0x0E, 0xC3]);
    let mut rw = Rewriter::new().unwrap();
    rw.set_function(func.addr());
    rw.set_par_count(0);

    let err = rw.rewrite(&[]).unwrap_err();
    assert_eq!(err.kind, dbrew::ErrorKind::BadOpcode);
    assert_eq!(rw.last_error(), Some(&err));
    assert_eq!(rw.generated_code().0, 0);
}

#[test]
fn rewriter_is_reusable() {
    let sum = AsmFunc::new(SUM);
    let foo = AsmFunc::new(FOO);

    let mut rw = Rewriter::new().unwrap();
    rw.set_function(sum.addr());
    rw.set_par_count(2);
    let a1 = rw.rewrite(&[1, 2]).unwrap();
    assert_eq!(call_at(a1, &[20, 22]), 42);

    rw.set_function(foo.addr());
    let a2 = rw.rewrite(&[7, 1]).unwrap();
    assert_eq!(call_at(a2, &[5, 9]), 0);
    assert_eq!(call_at(a2, &[7, 1]), 8);
}
