// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Decode/encode round-trips over the handled opcode set.
//!
//! Every sequence here uses the encoding the encoder itself would choose,
//! so re-encoding the decoded instructions must reproduce the input bytes
//! exactly.

use dbrew::decoder::decode_block_bytes;
use dbrew::encoder::encode_instr;

fn round_trip(bytes: &[u8]) {
    let dbb = decode_block_bytes(bytes, 0x10_0000).unwrap();
    let mut out = Vec::new();
    for instr in &dbb.instrs {
        out.extend(encode_instr(instr).unwrap_or_else(|e| panic!("{instr} failed to encode: {e}")));
    }
    assert_eq!(out, bytes, "round trip of {bytes:02x?}");
}

#[test]
fn alu_forms() {
    round_trip(&[0x48, 0x01, 0xF7, 0xC3]); // add %rsi, %rdi
    round_trip(&[0x48, 0x29, 0xC8, 0xC3]); // sub %rcx, %rax
    round_trip(&[0x48, 0x21, 0xD8, 0xC3]); // and %rbx, %rax
    round_trip(&[0x31, 0xC0, 0xC3]); // xor %eax, %eax
    round_trip(&[0x4D, 0x09, 0xC8, 0xC3]); // or %r9, %r8
    round_trip(&[0x48, 0x03, 0x47, 0x08, 0xC3]); // add 0x8(%rdi), %rax
}

#[test]
fn group1_immediates() {
    round_trip(&[0x48, 0x83, 0xEC, 0x08, 0xC3]); // sub $8, %rsp
    round_trip(&[0x83, 0xC0, 0x7F, 0xC3]); // add $127, %eax
    round_trip(&[0x81, 0xC0, 0x80, 0x00, 0x00, 0x00, 0xC3]); // add $128, %eax
    round_trip(&[0x48, 0x81, 0xC0, 0xFF, 0xFF, 0xFF, 0x7F, 0xC3]); // add $0x7fffffff, %rax
    round_trip(&[0x80, 0xC1, 0x05, 0xC3]); // add $5, %cl
}

#[test]
fn mov_forms() {
    round_trip(&[0x48, 0x89, 0xD8, 0xC3]); // mov %rbx, %rax
    round_trip(&[0x48, 0x8B, 0x44, 0xCF, 0x10, 0xC3]); // mov 0x10(%rdi,%rcx,8), %rax
    round_trip(&[0x48, 0xC7, 0xC0, 0x2A, 0x00, 0x00, 0x00, 0xC3]); // mov $42, %rax
    round_trip(&[0x49, 0xBA, 0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11, 0xC3]); // movabs
    round_trip(&[0x88, 0x47, 0x03, 0xC3]); // mov %al, 0x3(%rdi)
    round_trip(&[0x48, 0x8B, 0x45, 0x00, 0xC3]); // mov (%rbp), %rax
}

#[test]
fn widening_moves() {
    round_trip(&[0x48, 0x0F, 0xBE, 0xC3, 0xC3]); // movsx %bl, %rax
    round_trip(&[0x0F, 0xB7, 0xC8, 0xC3]); // movzx %ax, %ecx
    round_trip(&[0x48, 0x63, 0xC7, 0xC3]); // movsxd %edi, %rax
}

#[test]
fn unary_and_shift_forms() {
    round_trip(&[0x48, 0xF7, 0xD8, 0xC3]); // neg %rax
    round_trip(&[0xF7, 0xD1, 0xC3]); // not %ecx
    round_trip(&[0xFF, 0xC0, 0xC3]); // inc %eax
    round_trip(&[0x48, 0xFF, 0xCF, 0xC3]); // dec %rdi
    round_trip(&[0xC1, 0xE0, 0x04, 0xC3]); // shl $4, %eax
    round_trip(&[0x48, 0xD1, 0xE8, 0xC3]); // shr $1, %rax
    round_trip(&[0x48, 0xD3, 0xF8, 0xC3]); // sar %cl, %rax
}

#[test]
fn stack_and_multiply_forms() {
    round_trip(&[0x55, 0xC3]); // push %rbp
    round_trip(&[0x41, 0x54, 0xC3]); // push %r12
    round_trip(&[0x5D, 0xC3]); // pop %rbp
    round_trip(&[0x6A, 0x08, 0xC3]); // push $8
    round_trip(&[0xC9, 0xC3]); // leave
    round_trip(&[0x0F, 0xAF, 0xC6, 0xC3]); // imul %esi, %eax
    round_trip(&[0x48, 0x6B, 0xC7, 0x09, 0xC3]); // imul $9, %rdi, %rax
    round_trip(&[0x48, 0x69, 0xC7, 0x00, 0x01, 0x00, 0x00, 0xC3]); // imul $256, %rdi, %rax
    round_trip(&[0x48, 0x85, 0xFF, 0xC3]); // test %rdi, %rdi
    round_trip(&[0x48, 0xF7, 0xE6, 0xC3]); // mul %rsi (passthrough)
}

#[test]
fn sse_passthrough() {
    round_trip(&[0xF2, 0x0F, 0x58, 0xC1, 0xC3]); // addsd %xmm1, %xmm0
    round_trip(&[0xF2, 0x0F, 0x10, 0x07, 0xC3]); // movsd (%rdi), %xmm0
    round_trip(&[0x66, 0x0F, 0xEF, 0xC0, 0xC3]); // pxor %xmm0, %xmm0
    round_trip(&[0x66, 0x0F, 0x2E, 0xC1, 0xC3]); // ucomisd %xmm1, %xmm0
    round_trip(&[0xF3, 0x0F, 0x6F, 0x06, 0xC3]); // movdqu (%rsi), %xmm0
}

#[test]
fn byte_registers_need_rex() {
    // add $1, %sil is only encodable with a REX prefix.
    round_trip(&[0x40, 0x80, 0xC6, 0x01, 0xC3]);
}
