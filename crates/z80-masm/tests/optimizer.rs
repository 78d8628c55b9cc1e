//! Peephole optimizer: categories, presets, stacked scopes, jump
//! threading, and the bytes/cycles ledger.

use z80_cpu::{Bus, FlatBus};
use z80_masm::{Assembler, Config, MemoryFileProvider};

fn assemble(source: &str) -> (FlatBus, Assembler) {
    let mut provider = MemoryFileProvider::new();
    provider.add_source("main.asm", source);
    let mut bus = FlatBus::new();
    let mut assembler = Assembler::new(Config::default());
    assembler
        .compile(&mut bus, &provider, "main.asm", 0)
        .unwrap_or_else(|errors| panic!("compilation failed for:\n{source}\n{errors}"));
    (bus, assembler)
}

fn assert_code(source: &str, expected: &[u8]) {
    let (bus, assembler) = assemble(source);
    let total: usize = assembler.blocks().iter().map(|b| usize::from(b.size)).sum();
    assert_eq!(total, expected.len(), "size mismatch for:\n{source}");
    let start = assembler.blocks().first().map_or(0, |b| b.start);
    for (offset, &byte) in expected.iter().enumerate() {
        assert_eq!(
            bus.peek(start.wrapping_add(offset as u16)),
            byte,
            "byte {offset} mismatch for:\n{source}"
        );
    }
}

fn check_stats(source: &str, bytes_saved: i64, cycles_saved: i64) {
    let (_, assembler) = assemble(source);
    let stats = assembler.optimization_stats();
    assert_eq!(stats.bytes_saved, bytes_saved, "bytes saved for:\n{source}");
    assert_eq!(stats.cycles_saved, cycles_saved, "cycles saved for:\n{source}");
}

#[test]
fn categories_are_opt_in() {
    assert_code("LD A, 0", &[0x3E, 0x00]);
    assert_code("OPTIMIZE +OPS_XOR\nLD A, 0", &[0xAF]);
    assert_code("OPTIMIZE +OPS_XOR\nOPTIMIZE -OPS_XOR\nLD A, 0", &[0x3E, 0x00]);
}

#[test]
fn master_switch_overrides_directives() {
    let mut provider = MemoryFileProvider::new();
    provider.add_source("main.asm", "OPTIMIZE +OPS_XOR\nLD A, 0");
    let mut config = Config::default();
    config.compilation.enable_optimization = false;
    let mut bus = FlatBus::new();
    let mut assembler = Assembler::new(config);
    assembler.compile(&mut bus, &provider, "main.asm", 0).expect("compiles");
    assert_eq!(bus.peek(0), 0x3E);
    assert_eq!(bus.peek(1), 0x00);
    assert_eq!(assembler.optimization_stats().bytes_saved, 0);
    assert_eq!(assembler.optimization_stats().cycles_saved, 0);
}

#[test]
fn operator_idioms() {
    assert_code("OPTIMIZE +OPS_XOR\nLD A, 1", &[0x3E, 0x01]);
    assert_code("OPTIMIZE +OPS_INC\nADD A, 1", &[0x3C]);
    assert_code("OPTIMIZE +OPS_INC\nSUB 1", &[0x3D]);
    assert_code("OPTIMIZE +OPS_INC\nADD A, 2", &[0xC6, 0x02]);
    assert_code("OPTIMIZE +OPS_INC\nADD A, 255", &[0x3D]);
    assert_code("OPTIMIZE +OPS_INC\nADD A, -1", &[0x3D]);
    assert_code("OPTIMIZE +OPS_INC\nSUB 255", &[0x3C]);
    assert_code("OPTIMIZE +OPS_INC\nSUB -1", &[0x3C]);
    assert_code("OPTIMIZE +OPS_OR\nCP 0", &[0xB7]);
    assert_code("OPTIMIZE +OPS_OR\nCP 1", &[0xFE, 0x01]);
    assert_code("OPTIMIZE +OPS_LOGIC +OPS_SLA\nAND 0", &[0xAF]);
    assert_code("OPTIMIZE +OPS_LOGIC\nOR 0", &[0xB7]);
    assert_code("OPTIMIZE +OPS_LOGIC\nXOR 0", &[0xB7]);
    assert_code("OPTIMIZE +OPS_SLA\nSLA A", &[0x87]);
    assert_code("OPTIMIZE +OPS_ROT\nRLC A", &[0x07]);
    assert_code("OPTIMIZE +OPS_ADD0\nADD A, 0", &[0xB7]);
    assert_code("OPTIMIZE +OPS_RST\nCALL 0", &[0xC7]);
    assert_code("OPTIMIZE +OPS_RST\nCALL 0x0008", &[0xCF]);
}

#[test]
fn dead_code_elimination() {
    assert_code("OPTIMIZE +DCE\nLD A, A", &[]);
    assert_code("OPTIMIZE +DCE\nLD B, B", &[]);
    assert_code("OPTIMIZE +DCE\nLD A, B", &[0x78]);
    assert_code("OPTIMIZE +DCE\nJR $+2", &[]);
}

#[test]
fn branch_short() {
    assert_code(
        "OPTIMIZE +BRANCH_SHORT\nJP target\nNOP\ntarget: NOP",
        &[0x18, 0x01, 0x00, 0x00],
    );
    assert_code("OPTIMIZE +BRANCH_SHORT\ntarget: NOP\nJP target", &[0x00, 0x18, 0xFD]);
    assert_code(
        "OPTIMIZE +BRANCH_SHORT\nJP Z, target\nNOP\ntarget: NOP",
        &[0x28, 0x01, 0x00, 0x00],
    );
    // PO has no relative form.
    assert_code(
        "OPTIMIZE +BRANCH_SHORT\nJP PO, target\nNOP\ntarget: NOP",
        &[0xE2, 0x04, 0x00, 0x00, 0x00],
    );
    // Out of range stays absolute.
    let mut expected = vec![0xC3, 0x85, 0x00];
    expected.extend(std::iter::repeat_n(0u8, 130));
    expected.push(0x00);
    assert_code("OPTIMIZE +BRANCH_SHORT\nJP target\nDS 130\ntarget: NOP", &expected);
}

#[test]
fn branch_long() {
    let mut expected = vec![0xC3, 0x83, 0x00];
    expected.extend(std::iter::repeat_n(0u8, 128));
    expected.push(0x00);
    assert_code("OPTIMIZE +BRANCH_LONG\nJR target\nDS 128\ntarget: NOP", &expected);

    let mut expected = vec![0xCA, 0x83, 0x00];
    expected.extend(std::iter::repeat_n(0u8, 128));
    expected.push(0x00);
    assert_code("OPTIMIZE +BRANCH_LONG\nJR Z, target\nDS 128\ntarget: NOP", &expected);

    // In range stays relative.
    assert_code(
        "OPTIMIZE +BRANCH_LONG\nJR Z, target\nNOP\ntarget: NOP",
        &[0x28, 0x01, 0x00, 0x00],
    );
}

#[test]
fn presets_and_stack() {
    assert_code(
        "OPTIMIZE SIZE\nOPTIMIZE NONE\nLD A, 0\nJP target\ntarget: NOP",
        &[0x3E, 0x00, 0xC3, 0x05, 0x00, 0x00],
    );
    assert_code(
        "OPTIMIZE NONE\nOPTIMIZE OPS\nLD A, 0\nADD A, 1\nJP target\ntarget: NOP",
        &[0xAF, 0x3C, 0xC3, 0x05, 0x00, 0x00],
    );
    let source = r"
        LD A, 0
        OPTIMIZE PUSH
        OPTIMIZE +OPS_XOR
        LD A, 0
        OPTIMIZE PUSH
        OPTIMIZE +BRANCH_SHORT
        JP target
    target:
        OPTIMIZE POP
        LD A, 0
        JP target
        OPTIMIZE POP
        LD A, 0
";
    assert_code(
        source,
        &[0x3E, 0x00, 0xAF, 0x18, 0x00, 0xAF, 0xC3, 0x05, 0x00, 0x3E, 0x00],
    );
}

#[test]
fn jump_threading_follows_chains() {
    assert_code(
        "OPTIMIZE +JUMP_THREAD\nJP LabelA\nLabelA:\nJP LabelB\nLabelB:\nJP Target\nTarget:\nNOP",
        &[0xC3, 0x09, 0x00, 0xC3, 0x09, 0x00, 0xC3, 0x09, 0x00, 0x00],
    );
}

#[test]
fn jump_threading_resolves_loops_to_self() {
    assert_code(
        "OPTIMIZE +JUMP_THREAD\nLabelA:\nJP LabelB\nLabelB:\nJP LabelA",
        &[0xC3, 0x00, 0x00, 0xC3, 0x03, 0x00],
    );
    assert_code(
        "OPTIMIZE +JUMP_THREAD +BRANCH_SHORT\nLabelA:\nJR LabelB\nLabelB:\nJR LabelA",
        &[0x18, 0xFE, 0x18, 0xFE],
    );
}

#[test]
fn jump_threading_keeps_jr_in_range() {
    // The final target is too far for JR; the trampoline stays.
    let mut expected = vec![0x18, 0x00, 0xC3, 0xCD, 0x00];
    expected.extend(std::iter::repeat_n(0u8, 200));
    expected.push(0x00);
    assert_code(
        "OPTIMIZE +JUMP_THREAD\nJR Trampoline\nTrampoline:\nJP FarTarget\nDS 200\nFarTarget:\nNOP",
        &expected,
    );
}

#[test]
fn jump_threading_stops_at_conditionals() {
    assert_code(
        "OPTIMIZE +JUMP_THREAD +BRANCH_SHORT\nJP Start\nStart:\nJR Z, Target\nTarget:\nNOP",
        &[0x18, 0x00, 0x28, 0x00, 0x00],
    );
}

#[test]
fn jump_threading_retargets_djnz() {
    assert_code(
        "OPTIMIZE +JUMP_THREAD\nLD B, 10\nLoop:\nDJNZ Trampoline\nRET\nTrampoline:\nJP Target\nTarget:\nXOR A",
        &[0x06, 0x0A, 0x10, 0x04, 0xC9, 0xC3, 0x08, 0x00, 0xAF],
    );
}

#[test]
fn jump_threading_with_widening() {
    let mut expected = vec![0xC3, 0xCE, 0x00, 0xC3, 0xCE, 0x00];
    expected.extend(std::iter::repeat_n(0u8, 200));
    expected.push(0x00);
    assert_code(
        "OPTIMIZE +BRANCH_LONG +JUMP_THREAD\nJR Start\nStart:\nJP Target\nDS 200\nTarget:\nNOP",
        &expected,
    );
}

#[test]
fn short_and_long_interact() {
    let mut expected = vec![0x18, 0x03, 0xC3, 0xCE, 0x00, 0x00];
    expected.extend(std::iter::repeat_n(0u8, 200));
    expected.push(0x00);
    assert_code(
        "OPTIMIZE +BRANCH_LONG +BRANCH_SHORT\nJP NearTarget\nJR FarTarget\nNearTarget:\nNOP\nDS 200\nFarTarget:\nNOP",
        &expected,
    );
}

#[test]
fn savings_ledger() {
    check_stats("OPTIMIZE +OPS_XOR\nLD A, 0", 1, 3);
    check_stats("OPTIMIZE +OPS_INC\nADD A, 1", 1, 3);
    check_stats("OPTIMIZE +BRANCH_SHORT\nJP target\ntarget: NOP", 1, -2);
    check_stats("OPTIMIZE +OPS_RST\nCALL 0", 2, 6);
    check_stats("OPTIMIZE +OPS_RST\nCALL 0x0008", 2, 6);
    check_stats("OPTIMIZE +OPS_SLA\nSLA A", 1, 4);
    check_stats("OPTIMIZE +OPS_XOR +OPS_INC\nLD A, 0\nADD A, 1", 2, 6);
    check_stats("OPTIMIZE NONE\nLD A, 0", 0, 0);
    check_stats("OPTIMIZE +BRANCH_LONG\nJR Target\nDS 130\nTarget: NOP", -1, 2);
    check_stats("OPTIMIZE +DCE\nJR $+2", 2, 12);
    check_stats("OPTIMIZE +DCE\nLD B, B", 1, 4);
    check_stats("OPTIMIZE +OPS_ROT\nRLC A", 1, 4);
    check_stats("OPTIMIZE +OPS_ROT\nRR A", 1, 4);
    check_stats("OPTIMIZE +OPS_OR\nCP 0", 1, 3);
    check_stats("OPTIMIZE +OPS_ADD0\nADD A, 0", 1, 3);
    check_stats("OPTIMIZE +OPS_INC\nSUB 255", 1, 3);
}

#[test]
fn disabled_pipeline_is_bit_identical() {
    let source = "LD A, 0\nADD A, 1\nJP t\nt: NOP";
    let (bus_plain, asm_plain) = assemble(source);
    let with_none = format!("OPTIMIZE NONE\n{source}");
    let (bus_none, asm_none) = assemble(&with_none);
    assert_eq!(asm_plain.optimization_stats(), asm_none.optimization_stats());
    assert_eq!(asm_none.optimization_stats().bytes_saved, 0);
    for address in 0..16u16 {
        assert_eq!(bus_plain.peek(address), bus_none.peek(address));
    }
}
