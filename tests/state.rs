// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Meta-state lattice and emulator-state snapshot behaviour.

use dbrew::state::{CaptureState, EmuState};
use dbrew::operand::Width;
use dbrew::register::Reg;

use CaptureState::*;

#[test]
fn combine_is_monotonic() {
    // Knowledge never appears from nothing: combining with Dynamic is
    // Dynamic, combining with Dead is Dead.
    for s in [Dynamic, Static, StackRelative, Static2] {
        assert_eq!(s.combine(Dynamic), Dynamic);
        assert_eq!(Dynamic.combine(s), Dynamic);
        assert_eq!(s.combine(Dead), Dead);
        assert_eq!(Dead.combine(s), Dead);
    }
    // Static knowledge is preserved, recursive knowledge dominates.
    assert_eq!(Static.combine(Static), Static);
    assert_eq!(Static.combine(Static2), Static2);
    assert_eq!(Static2.combine(Static), Static2);
    assert_eq!(Static2.combine(Static2), Static2);
}

#[test]
fn stack_relative_survives_additive_operations_only() {
    assert_eq!(StackRelative.combine_additive(Static), StackRelative);
    assert_eq!(Static.combine_additive(StackRelative), StackRelative);
    assert_eq!(StackRelative.combine(Static), Dynamic);
    assert_eq!(StackRelative.combine_additive(Dynamic), Dynamic);
    assert_eq!(StackRelative.combine(StackRelative), StackRelative);
}

#[test]
fn flags_collapse_substates() {
    assert_eq!(StackRelative.for_flag(), Dynamic);
    assert_eq!(Static2.for_flag(), Static);
    assert_eq!(Dynamic.for_flag(), Dynamic);
    assert_eq!(Dead.for_flag(), Dead);
}

#[test]
fn snapshot_is_sized_to_the_accessed_window() {
    let mut es = EmuState::new(256);
    let top = es.stack_top;

    // Nothing accessed: the snapshot carries no stack at all.
    let empty = es.snapshot();
    assert!(es.matches(&empty));

    es.write_stack(top - 24, Width::Qword, 0x1234, CaptureState::Static, false);
    assert_eq!(es.lowest_accessed, top - 24);
    let snap = es.snapshot();
    assert!(es.matches(&snap));

    // The same state saved again still matches; a changed static byte
    // does not.
    es.write_stack(top - 24, Width::Qword, 0x1235, CaptureState::Static, false);
    assert!(!es.matches(&snap));
    es.restore_from(&snap);
    assert!(es.matches(&snap));
}

#[test]
fn dynamic_values_do_not_split_states() {
    let mut a = EmuState::new(64);
    let mut b = EmuState::new(64);
    for i in 0..16 {
        a.reg_state[i] = Dynamic;
        b.reg_state[i] = Dynamic;
    }
    a.set_reg(Reg::RDI, 4);
    b.set_reg(Reg::RDI, 17);
    // Both traces hold an unknown in RDI; the observed values differ but
    // the states are the same.
    assert!(a.matches(&b));

    b.set_reg_state(Reg::RDI, Static);
    assert!(!a.matches(&b));
}

#[test]
fn restore_fills_unaccessed_bytes_with_dead() {
    let mut es = EmuState::new(64);
    let top = es.stack_top;
    es.write_stack(top - 8, Width::Qword, 7, CaptureState::Dynamic, true);
    let snap = es.snapshot();

    // Touch more stack, then roll back.
    es.write_stack(top - 32, Width::Qword, 9, CaptureState::Static, true);
    es.restore_from(&snap);
    assert_eq!(es.lowest_accessed, top - 8);
    let (_, state, _) = es.read_stack(top - 32, Width::Qword);
    assert_eq!(state, CaptureState::Dead);
}

#[test]
fn condition_codes_follow_the_flags() {
    let mut es = EmuState::new(64);
    use dbrew::state::Flag;

    // ZF set: e taken, ne not, le taken, g not.
    es.set_flag(Flag::Zero, true, Static);
    assert!(es.condition(4));
    assert!(!es.condition(5));
    assert!(es.condition(14));
    assert!(!es.condition(15));

    // SF != OF: l taken, ge not.
    es.set_flag(Flag::Zero, false, Static);
    es.set_flag(Flag::Sign, true, Static);
    es.set_flag(Flag::Overflow, false, Static);
    assert!(es.condition(12));
    assert!(!es.condition(13));

    // CF decides b/ae.
    es.set_flag(Flag::Carry, true, Static);
    assert!(es.condition(2));
    assert!(!es.condition(3));
}
