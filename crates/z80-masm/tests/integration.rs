//! End-to-end: assemble source, then execute it on the CPU. The two
//! subsystems must agree on what every opcode is and costs.

use z80_cpu::{FlatBus, Z80};
use z80_masm::{Assembler, Config, MemoryFileProvider, Value};

/// Assemble into a fresh bus and return it with the assembler.
fn assemble(source: &str, org: u16) -> (FlatBus, Assembler) {
    let mut provider = MemoryFileProvider::new();
    provider.add_source("main.asm", source);
    let mut bus = FlatBus::new();
    let mut assembler = Assembler::new(Config::default());
    assembler
        .compile(&mut bus, &provider, "main.asm", org)
        .unwrap_or_else(|errors| panic!("compilation failed:\n{errors}"));
    (bus, assembler)
}

/// Run from `start` until HALT, bounded in case the program runs away.
fn run_to_halt(cpu: &mut Z80, bus: &mut FlatBus, start: u16) {
    cpu.regs.pc = start;
    for _ in 0..10_000 {
        cpu.step(bus);
        if cpu.regs.halted {
            return;
        }
    }
    panic!("program never halted");
}

#[test]
fn assembled_program_round_trip() {
    let source = r"
        ORG 0x100
    start: LD A, 5
        LD B, A
        ADD A, B
        LD (value), A
        JP finish
    value: DB 0
    finish: HALT
";
    let (mut bus, assembler) = assemble(source, 0);

    // The canonical byte image...
    let expected = [
        0x3E, 0x05, 0x47, 0x80, 0x32, 0x0A, 0x01, 0xC3, 0x0B, 0x01, 0x00, 0x76,
    ];
    for (offset, &byte) in expected.iter().enumerate() {
        assert_eq!(bus.ram[0x100 + offset], byte, "byte {offset}");
    }
    assert_eq!(assembler.symbol("start"), Some(&Value::Int(0x100)));
    assert_eq!(assembler.symbol("value"), Some(&Value::Int(0x10A)));
    assert_eq!(assembler.symbol("finish"), Some(&Value::Int(0x10B)));

    // ...and the execution it implies.
    let mut cpu = Z80::new();
    run_to_halt(&mut cpu, &mut bus, 0x100);
    assert_eq!(cpu.regs.a, 10);
    assert_eq!(bus.ram[0x10A], 10);
    assert_eq!(cpu.regs.pc, 0x10C);
}

#[test]
fn macro_local_labels_do_not_cross_talk() {
    // Each expansion's DJNZ must target its own LD B, 255.
    let source = r"
        ORG 0x200
        DELAY MACRO
            LOCAL loop
            LD B, 255
        loop:
            DJNZ loop
        ENDM

        DELAY
        DELAY
        HALT
";
    let (mut bus, _) = assemble(source, 0);
    let expected = [0x06, 0xFF, 0x10, 0xFE, 0x06, 0xFF, 0x10, 0xFE, 0x76];
    for (offset, &byte) in expected.iter().enumerate() {
        assert_eq!(bus.ram[0x200 + offset], byte, "byte {offset}");
    }

    let mut cpu = Z80::new();
    run_to_halt(&mut cpu, &mut bus, 0x200);
    assert_eq!(cpu.regs.b, 0);
    assert_eq!(cpu.regs.pc, 0x209);
}

#[test]
fn counted_loop_sums_a_table() {
    let source = r"
        ORG 0x000
        LD HL, table
        LD B, COUNT
        XOR A
    sum:
        ADD A, (HL)
        INC HL
        DJNZ sum
        LD (result), A
        HALT
    table:
        DB 1, 2, 3, 4, 5
    COUNT EQU 5
    result: DB 0
";
    let (mut bus, assembler) = assemble(source, 0);
    let mut cpu = Z80::new();
    run_to_halt(&mut cpu, &mut bus, 0);
    assert_eq!(cpu.regs.a, 15);
    let result = match assembler.symbol("result") {
        Some(Value::Int(address)) => *address as u16,
        other => panic!("bad result symbol: {other:?}"),
    };
    assert_eq!(bus.ram[result as usize], 15);
}

#[test]
fn block_copy_via_ldir() {
    let source = r"
        ORG 0x000
        LD HL, source_data
        LD DE, 0x4000
        LD BC, source_len
        LDIR
        HALT
    source_data:
        DB 0xDE, 0xAD, 0xBE, 0xEF
    source_len EQU 4
";
    let (mut bus, _) = assemble(source, 0);
    let mut cpu = Z80::new();
    run_to_halt(&mut cpu, &mut bus, 0);
    assert_eq!(&bus.ram[0x4000..0x4004], &[0xDE, 0xAD, 0xBE, 0xEF]);
    assert_eq!(cpu.regs.bc(), 0);
}

#[test]
fn optimized_code_still_computes_the_same() {
    let plain = r"
        ORG 0x000
        LD A, 0
        ADD A, 1
        ADD A, 1
        CP 0
        HALT
";
    let optimized = format!("OPTIMIZE ALL\n{plain}");

    let (mut bus_a, _) = assemble(plain, 0);
    let mut cpu_a = Z80::new();
    run_to_halt(&mut cpu_a, &mut bus_a, 0);

    let (mut bus_b, assembler) = assemble(&optimized, 0);
    assert!(assembler.optimization_stats().bytes_saved > 0);
    let mut cpu_b = Z80::new();
    run_to_halt(&mut cpu_b, &mut bus_b, 0);

    assert_eq!(cpu_a.regs.a, cpu_b.regs.a);
    assert_eq!(cpu_a.regs.a, 2);
}

#[test]
fn assembler_and_cpu_agree_on_branch_cost() {
    // JP and its BRANCH_SHORT replacement land in the same place; the
    // optimizer's claimed cycle delta matches what the CPU observes.
    let absolute = "ORG 0x000\nJP target\nNOP\ntarget: HALT";
    let shortened = format!("OPTIMIZE +BRANCH_SHORT\n{absolute}");

    let (mut bus_a, _) = assemble(absolute, 0);
    let mut cpu_a = Z80::new();
    let jp_ticks = cpu_a.step(&mut bus_a);
    assert_eq!(jp_ticks, 10);

    let (mut bus_b, assembler) = assemble(&shortened, 0);
    let mut cpu_b = Z80::new();
    let jr_ticks = cpu_b.step(&mut bus_b);
    assert_eq!(jr_ticks, 12);
    assert_eq!(
        assembler.optimization_stats().cycles_saved,
        jp_ticks as i64 - jr_ticks as i64
    );
    assert_eq!(cpu_b.regs.pc, cpu_a.regs.pc.wrapping_sub(1));
}

#[test]
fn interrupt_handler_round_trip() {
    // IM 2 vector table assembled at I=0x80, handler increments a counter.
    let source = r"
        ORG 0x000
        LD A, 0x80
        LD I, A
        IM 2
        EI
        NOP
        NOP
        HALT

        ORG 0x8040
        DW handler

        ORG 0x9000
    handler:
        LD A, 0x77
        HALT
";
    let (mut bus, _) = assemble(source, 0);
    let mut cpu = Z80::new();
    cpu.regs.sp = 0x7000;
    cpu.step(&mut bus); // LD A, 0x80
    cpu.step(&mut bus); // LD I, A
    cpu.step(&mut bus); // IM 2
    cpu.step(&mut bus); // EI - request stays masked at this boundary
    cpu.request_interrupt(0x40);
    assert!(!cpu.regs.iff1);
    cpu.step(&mut bus); // NOP executes, then the IRQ fires at its tail
    assert_eq!(cpu.regs.pc, 0x9000);
    cpu.step(&mut bus);
    cpu.step(&mut bus);
    assert!(cpu.regs.halted);
    assert_eq!(cpu.regs.a, 0x77);
}
