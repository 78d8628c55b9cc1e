//! Instruction execution.
//!
//! `Exec` borrows the CPU state together with the collaborators for the
//! duration of one `run`/`step` call, so every handler is a plain
//! monomorphic method and the tick/bus plumbing stays in one place.

use crate::alu;
use crate::bus::{Bus, Debugger, Events};
use crate::flags::{CF, HF, NF, PF, SF, XF, YF, ZF, bit, sz53p};

use super::{IndexMode, Z80};

pub(super) struct Exec<'a, B: Bus, E: Events, D: Debugger> {
    pub cpu: &'a mut Z80,
    pub bus: &'a mut B,
    pub events: &'a mut E,
    pub debugger: &'a mut D,
}

impl<B: Bus, E: Events, D: Debugger> Exec<'_, B, E, D> {
    // =========================================================================
    // Tick accounting and bus plumbing
    // =========================================================================

    fn add_tick(&mut self) {
        self.add_ticks(1);
    }

    /// Advance the tick counter, firing scheduler events crossed on the way.
    fn add_ticks(&mut self, delta: u64) {
        let target = self.cpu.ticks.wrapping_add(delta);
        let mut deadline = self.events.event_limit();
        while deadline <= target {
            self.cpu.ticks = deadline;
            self.events.handle_event(deadline);
            let next = self.events.event_limit();
            if next <= deadline {
                break;
            }
            deadline = next;
        }
        self.cpu.ticks = target;
    }

    /// Opcode fetch (M1): four T-states, refresh increment.
    fn fetch_opcode(&mut self) -> u8 {
        let pc = self.cpu.regs.pc;
        self.cpu.address_bus = pc;
        self.add_ticks(2);
        let opcode = self.bus.read(pc);
        self.cpu.data_bus = opcode;
        self.cpu.opcodes.push(opcode);
        let r = self.cpu.regs.r;
        self.cpu.regs.r = (r & 0x80) | (r.wrapping_add(1) & 0x7F);
        self.add_ticks(2);
        self.cpu.regs.pc = pc.wrapping_add(1);
        opcode
    }

    /// Memory read: three T-states.
    fn read_byte(&mut self, address: u16) -> u8 {
        self.cpu.address_bus = address;
        self.add_ticks(2);
        let data = self.bus.read(address);
        self.cpu.data_bus = data;
        self.add_tick();
        data
    }

    /// Memory write: three T-states.
    fn write_byte(&mut self, address: u16, value: u8) {
        self.cpu.address_bus = address;
        self.add_tick();
        self.cpu.data_bus = value;
        self.add_tick();
        self.bus.write(address, value);
        self.add_tick();
    }

    fn read_word(&mut self, address: u16) -> u16 {
        let lo = self.read_byte(address);
        let hi = self.read_byte(address.wrapping_add(1));
        u16::from_le_bytes([lo, hi])
    }

    fn write_word(&mut self, address: u16, value: u16) {
        self.write_byte(address, value as u8);
        self.write_byte(address.wrapping_add(1), (value >> 8) as u8);
    }

    /// Stack push: one setup T-state, then high byte before low.
    fn push_word(&mut self, value: u16) {
        self.cpu.regs.sp = self.cpu.regs.sp.wrapping_sub(1);
        self.add_tick();
        self.write_byte(self.cpu.regs.sp, (value >> 8) as u8);
        self.cpu.regs.sp = self.cpu.regs.sp.wrapping_sub(1);
        self.write_byte(self.cpu.regs.sp, value as u8);
    }

    fn pop_word(&mut self) -> u16 {
        let lo = self.read_byte(self.cpu.regs.sp);
        self.cpu.regs.sp = self.cpu.regs.sp.wrapping_add(1);
        let hi = self.read_byte(self.cpu.regs.sp);
        self.cpu.regs.sp = self.cpu.regs.sp.wrapping_add(1);
        u16::from_le_bytes([lo, hi])
    }

    /// I/O read: four T-states.
    fn io_read(&mut self, port: u16) -> u8 {
        self.cpu.address_bus = port;
        self.add_ticks(2);
        let data = self.bus.input(port);
        self.cpu.data_bus = data;
        self.add_ticks(2);
        data
    }

    /// I/O write: four T-states.
    fn io_write(&mut self, port: u16, value: u8) {
        self.cpu.address_bus = port;
        self.add_ticks(2);
        self.cpu.data_bus = value;
        self.bus.output(port, value);
        self.add_ticks(2);
    }

    /// Operand byte at PC.
    fn fetch_byte(&mut self) -> u8 {
        let pc = self.cpu.regs.pc;
        let value = self.read_byte(pc);
        self.cpu.opcodes.push(value);
        self.cpu.regs.pc = pc.wrapping_add(1);
        value
    }

    fn fetch_word(&mut self) -> u16 {
        let lo = self.fetch_byte();
        let hi = self.fetch_byte();
        u16::from_le_bytes([lo, hi])
    }

    // =========================================================================
    // Operand policy: the three accessors DD/FD remap
    // =========================================================================

    fn indexed_hl(&self) -> u16 {
        match self.cpu.index_mode {
            IndexMode::Hl => self.cpu.regs.hl(),
            IndexMode::Ix => self.cpu.regs.ix,
            IndexMode::Iy => self.cpu.regs.iy,
        }
    }

    fn set_indexed_hl(&mut self, value: u16) {
        match self.cpu.index_mode {
            IndexMode::Hl => self.cpu.regs.set_hl(value),
            IndexMode::Ix => self.cpu.regs.ix = value,
            IndexMode::Iy => self.cpu.regs.iy = value,
        }
    }

    fn indexed_h(&self) -> u8 {
        match self.cpu.index_mode {
            IndexMode::Hl => self.cpu.regs.h,
            IndexMode::Ix => self.cpu.regs.ixh(),
            IndexMode::Iy => self.cpu.regs.iyh(),
        }
    }

    fn set_indexed_h(&mut self, value: u8) {
        match self.cpu.index_mode {
            IndexMode::Hl => self.cpu.regs.h = value,
            IndexMode::Ix => self.cpu.regs.set_ixh(value),
            IndexMode::Iy => self.cpu.regs.set_iyh(value),
        }
    }

    fn indexed_l(&self) -> u8 {
        match self.cpu.index_mode {
            IndexMode::Hl => self.cpu.regs.l,
            IndexMode::Ix => self.cpu.regs.ixl(),
            IndexMode::Iy => self.cpu.regs.iyl(),
        }
    }

    fn set_indexed_l(&mut self, value: u8) {
        match self.cpu.index_mode {
            IndexMode::Hl => self.cpu.regs.l = value,
            IndexMode::Ix => self.cpu.regs.set_ixl(value),
            IndexMode::Iy => self.cpu.regs.set_iyl(value),
        }
    }

    /// Effective address of the `(HL)` operand. Indexed modes fetch the
    /// displacement and charge the five internal address-math T-states.
    fn indexed_address(&mut self) -> u16 {
        if self.cpu.index_mode == IndexMode::Hl {
            return self.cpu.regs.hl();
        }
        let offset = self.fetch_byte() as i8;
        let address = self.indexed_hl().wrapping_add(offset as u16);
        self.cpu.regs.wz = address;
        self.add_ticks(5);
        address
    }

    // =========================================================================
    // Register decode helpers
    // =========================================================================

    /// Plain 8-bit register by field code (H and L never remapped).
    fn reg8(&self, code: u8) -> u8 {
        match code {
            0 => self.cpu.regs.b,
            1 => self.cpu.regs.c,
            2 => self.cpu.regs.d,
            3 => self.cpu.regs.e,
            4 => self.cpu.regs.h,
            5 => self.cpu.regs.l,
            7 => self.cpu.regs.a,
            _ => unreachable!("(HL) is not a register"),
        }
    }

    fn set_reg8(&mut self, code: u8, value: u8) {
        match code {
            0 => self.cpu.regs.b = value,
            1 => self.cpu.regs.c = value,
            2 => self.cpu.regs.d = value,
            3 => self.cpu.regs.e = value,
            4 => self.cpu.regs.h = value,
            5 => self.cpu.regs.l = value,
            7 => self.cpu.regs.a = value,
            _ => unreachable!("(HL) is not a register"),
        }
    }

    /// 8-bit register with H/L remapped to the active index register.
    fn reg8_indexed(&self, code: u8) -> u8 {
        match code {
            4 => self.indexed_h(),
            5 => self.indexed_l(),
            _ => self.reg8(code),
        }
    }

    fn set_reg8_indexed(&mut self, code: u8, value: u8) {
        match code {
            4 => self.set_indexed_h(value),
            5 => self.set_indexed_l(value),
            _ => self.set_reg8(code, value),
        }
    }

    /// Register pair by field code, SP variant. HL follows the index mode.
    fn reg16(&self, code: u8) -> u16 {
        match code {
            0 => self.cpu.regs.bc(),
            1 => self.cpu.regs.de(),
            2 => self.indexed_hl(),
            _ => self.cpu.regs.sp,
        }
    }

    fn set_reg16(&mut self, code: u8, value: u16) {
        match code {
            0 => self.cpu.regs.set_bc(value),
            1 => self.cpu.regs.set_de(value),
            2 => self.set_indexed_hl(value),
            _ => self.cpu.regs.sp = value,
        }
    }

    /// Register pair by field code, AF variant (PUSH/POP).
    fn reg16_af(&self, code: u8) -> u16 {
        match code {
            0 => self.cpu.regs.bc(),
            1 => self.cpu.regs.de(),
            2 => self.indexed_hl(),
            _ => self.cpu.regs.af(),
        }
    }

    fn set_reg16_af(&mut self, code: u8, value: u16) {
        match code {
            0 => self.cpu.regs.set_bc(value),
            1 => self.cpu.regs.set_de(value),
            2 => self.set_indexed_hl(value),
            _ => self.cpu.regs.set_af(value),
        }
    }

    /// Branch condition by field code: NZ Z NC C PO PE P M.
    fn condition(&self, code: u8) -> bool {
        let f = self.cpu.regs.f;
        match code {
            0 => f & ZF == 0,
            1 => f & ZF != 0,
            2 => f & CF == 0,
            3 => f & CF != 0,
            4 => f & PF == 0,
            5 => f & PF != 0,
            6 => f & SF == 0,
            _ => f & SF != 0,
        }
    }

    // =========================================================================
    // Execution loop
    // =========================================================================

    pub(super) fn operate(&mut self, single_step: bool, tick_limit: u64) -> u64 {
        let initial_ticks = self.cpu.ticks;
        loop {
            if self.cpu.ei_delay {
                self.cpu.regs.iff1 = true;
                self.cpu.regs.iff2 = true;
                self.cpu.ei_delay = false;
            }
            self.cpu.reti_signaled = false;
            if self.cpu.regs.halted {
                if single_step {
                    self.add_ticks(4);
                } else {
                    let remaining = tick_limit.saturating_sub(self.cpu.ticks);
                    self.add_ticks(remaining);
                }
            } else {
                self.cpu.opcodes.clear();
                self.cpu.index_mode = IndexMode::Hl;
                let mut opcode = self.fetch_opcode();
                while opcode == 0xDD || opcode == 0xFD {
                    self.cpu.index_mode = if opcode == 0xDD { IndexMode::Ix } else { IndexMode::Iy };
                    opcode = self.fetch_opcode();
                }
                self.debugger.before_step(&self.cpu.opcodes);
                self.dispatch(opcode);
            }
            if self.cpu.nmi_pending {
                self.handle_nmi();
            } else if self.cpu.irq_requested && self.cpu.regs.iff1 {
                self.handle_irq();
            }
            self.debugger.after_step(&self.cpu.opcodes);
            if single_step || self.cpu.ticks >= tick_limit {
                break;
            }
        }
        self.cpu.ticks - initial_ticks
    }

    fn handle_nmi(&mut self) {
        self.debugger.before_nmi();
        self.cpu.regs.halted = false;
        self.cpu.regs.iff2 = self.cpu.regs.iff1;
        self.cpu.regs.iff1 = false;
        let pc = self.cpu.regs.pc;
        self.push_word(pc);
        self.cpu.regs.wz = 0x0066;
        self.cpu.regs.pc = 0x0066;
        self.cpu.nmi_pending = false;
        self.add_ticks(4);
        self.debugger.after_nmi();
    }

    fn handle_irq(&mut self) {
        self.debugger.before_irq();
        self.cpu.regs.halted = false;
        self.add_ticks(2);
        self.cpu.regs.iff2 = self.cpu.regs.iff1;
        self.cpu.regs.iff1 = false;
        let pc = self.cpu.regs.pc;
        self.push_word(pc);
        match self.cpu.regs.im {
            0 => {
                self.add_ticks(4);
                // Only the eight RST encodings vector; anything else is a
                // no-op beyond the acknowledge cycle.
                let data = self.cpu.irq_data;
                if data & 0xC7 == 0xC7 {
                    let vector = u16::from(data & 0x38);
                    self.cpu.regs.wz = vector;
                    self.cpu.regs.pc = vector;
                }
            }
            1 => {
                self.add_ticks(4);
                self.cpu.regs.wz = 0x0038;
                self.cpu.regs.pc = 0x0038;
            }
            _ => {
                let pointer = (u16::from(self.cpu.regs.i) << 8) | u16::from(self.cpu.irq_data);
                let handler = self.read_word(pointer);
                self.add_ticks(4);
                self.cpu.regs.wz = handler;
                self.cpu.regs.pc = handler;
            }
        }
        self.cpu.irq_requested = false;
        self.debugger.after_irq();
    }

    fn dispatch(&mut self, opcode: u8) {
        match opcode {
            0xCB => {
                if self.cpu.index_mode == IndexMode::Hl {
                    let op = self.fetch_opcode();
                    self.execute_cb(op);
                } else {
                    self.execute_cb_indexed();
                }
            }
            0xED => {
                let op = self.fetch_opcode();
                self.execute_ed(op);
            }
            _ => self.execute_primary(opcode),
        }
    }

    // =========================================================================
    // Primary table
    // =========================================================================

    fn execute_primary(&mut self, op: u8) {
        match op {
            // NOP
            0x00 => {}

            // LD rr, nn (01=BC, 11=DE, 21=HL/IX/IY, 31=SP)
            0x01 | 0x11 | 0x21 | 0x31 => {
                let value = self.fetch_word();
                self.set_reg16((op >> 4) & 3, value);
            }

            // LD (BC), A
            0x02 => {
                let address = self.cpu.regs.bc();
                let a = self.cpu.regs.a;
                self.write_byte(address, a);
                self.cpu.regs.wz = (u16::from(a) << 8) | (address.wrapping_add(1) & 0xFF);
            }

            // INC rr (03=BC, 13=DE, 23=HL, 33=SP)
            0x03 | 0x13 | 0x23 | 0x33 => {
                self.add_ticks(2);
                let rp = (op >> 4) & 3;
                let value = self.reg16(rp).wrapping_add(1);
                self.set_reg16(rp, value);
            }

            // INC r (04=B .. 3C=A, 34=(HL))
            0x04 | 0x0C | 0x14 | 0x1C | 0x24 | 0x2C | 0x34 | 0x3C => {
                let r = (op >> 3) & 7;
                if r == 6 {
                    let address = self.indexed_address();
                    let value = self.read_byte(address);
                    self.add_tick();
                    let result = alu::inc8(value);
                    self.write_byte(address, result.value);
                    self.cpu.regs.f = (self.cpu.regs.f & CF) | result.flags;
                } else {
                    let result = alu::inc8(self.reg8_indexed(r));
                    self.set_reg8_indexed(r, result.value);
                    self.cpu.regs.f = (self.cpu.regs.f & CF) | result.flags;
                }
            }

            // DEC r (05=B .. 3D=A, 35=(HL))
            0x05 | 0x0D | 0x15 | 0x1D | 0x25 | 0x2D | 0x35 | 0x3D => {
                let r = (op >> 3) & 7;
                if r == 6 {
                    let address = self.indexed_address();
                    let value = self.read_byte(address);
                    self.add_tick();
                    let result = alu::dec8(value);
                    self.write_byte(address, result.value);
                    self.cpu.regs.f = (self.cpu.regs.f & CF) | result.flags;
                } else {
                    let result = alu::dec8(self.reg8_indexed(r));
                    self.set_reg8_indexed(r, result.value);
                    self.cpu.regs.f = (self.cpu.regs.f & CF) | result.flags;
                }
            }

            // LD r, n (06=B .. 3E=A); 36 = LD (HL)/(IX+d), n
            0x06 | 0x0E | 0x16 | 0x1E | 0x26 | 0x2E | 0x36 | 0x3E => {
                let r = (op >> 3) & 7;
                if r == 6 {
                    // Displacement precedes the immediate, and the address
                    // math overlaps the operand fetch (two internal ticks,
                    // not five).
                    if self.cpu.index_mode == IndexMode::Hl {
                        let value = self.fetch_byte();
                        let address = self.cpu.regs.hl();
                        self.write_byte(address, value);
                    } else {
                        let offset = self.fetch_byte() as i8;
                        let address = self.indexed_hl().wrapping_add(offset as u16);
                        self.cpu.regs.wz = address;
                        self.add_ticks(2);
                        let value = self.fetch_byte();
                        self.write_byte(address, value);
                    }
                } else {
                    let value = self.fetch_byte();
                    self.set_reg8_indexed(r, value);
                }
            }

            // RLCA
            0x07 => {
                let carry = self.cpu.regs.a >> 7;
                self.cpu.regs.a = (self.cpu.regs.a << 1) | carry;
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF))
                    | (self.cpu.regs.a & (YF | XF))
                    | bit(CF, carry != 0);
            }

            // EX AF, AF'
            0x08 => {
                let af = self.cpu.regs.af();
                let alt = self.cpu.regs.af_alt();
                self.cpu.regs.set_af(alt);
                self.cpu.regs.set_af_alt(af);
            }

            // ADD HL, rr (09=BC, 19=DE, 29=HL, 39=SP)
            0x09 | 0x19 | 0x29 | 0x39 => {
                self.add_ticks(7);
                let hl = self.indexed_hl();
                let rr = self.reg16((op >> 4) & 3);
                self.cpu.regs.wz = hl.wrapping_add(1);
                let (result, flags) = alu::add16(hl, rr);
                self.set_indexed_hl(result);
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF)) | flags;
            }

            // LD A, (BC)
            0x0A => {
                let address = self.cpu.regs.bc();
                self.cpu.regs.a = self.read_byte(address);
                self.cpu.regs.wz = address.wrapping_add(1);
            }

            // DEC rr (0B=BC, 1B=DE, 2B=HL, 3B=SP)
            0x0B | 0x1B | 0x2B | 0x3B => {
                self.add_ticks(2);
                let rp = (op >> 4) & 3;
                let value = self.reg16(rp).wrapping_sub(1);
                self.set_reg16(rp, value);
            }

            // RRCA
            0x0F => {
                let carry = self.cpu.regs.a & 1;
                self.cpu.regs.a = (self.cpu.regs.a >> 1) | (carry << 7);
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF))
                    | (self.cpu.regs.a & (YF | XF))
                    | bit(CF, carry != 0);
            }

            // DJNZ e
            0x10 => {
                let offset = self.fetch_byte() as i8;
                let target = self.cpu.regs.pc.wrapping_add(offset as u16);
                self.cpu.regs.wz = target;
                self.cpu.regs.b = self.cpu.regs.b.wrapping_sub(1);
                self.add_tick();
                if self.cpu.regs.b != 0 {
                    self.cpu.regs.pc = target;
                    self.add_ticks(5);
                }
            }

            // LD (DE), A
            0x12 => {
                let address = self.cpu.regs.de();
                let a = self.cpu.regs.a;
                self.write_byte(address, a);
                self.cpu.regs.wz = (u16::from(a) << 8) | (address.wrapping_add(1) & 0xFF);
            }

            // RLA
            0x17 => {
                let old_carry = self.cpu.regs.f & CF;
                let new_carry = self.cpu.regs.a >> 7;
                self.cpu.regs.a = (self.cpu.regs.a << 1) | old_carry;
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF))
                    | (self.cpu.regs.a & (YF | XF))
                    | bit(CF, new_carry != 0);
            }

            // JR e
            0x18 => {
                let offset = self.fetch_byte() as i8;
                let target = self.cpu.regs.pc.wrapping_add(offset as u16);
                self.cpu.regs.wz = target;
                self.cpu.regs.pc = target;
                self.add_ticks(5);
            }

            // LD A, (DE)
            0x1A => {
                let address = self.cpu.regs.de();
                self.cpu.regs.a = self.read_byte(address);
                self.cpu.regs.wz = address.wrapping_add(1);
            }

            // RRA
            0x1F => {
                let old_carry = (self.cpu.regs.f & CF) << 7;
                let new_carry = self.cpu.regs.a & 1;
                self.cpu.regs.a = (self.cpu.regs.a >> 1) | old_carry;
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF))
                    | (self.cpu.regs.a & (YF | XF))
                    | bit(CF, new_carry != 0);
            }

            // JR cc, e (20=NZ, 28=Z, 30=NC, 38=C)
            0x20 | 0x28 | 0x30 | 0x38 => {
                let offset = self.fetch_byte() as i8;
                let target = self.cpu.regs.pc.wrapping_add(offset as u16);
                self.cpu.regs.wz = target;
                if self.condition((op >> 3) & 3) {
                    self.cpu.regs.pc = target;
                    self.add_ticks(5);
                }
            }

            // LD (nn), HL
            0x22 => {
                let address = self.fetch_word();
                let value = self.indexed_hl();
                self.write_word(address, value);
                self.cpu.regs.wz = address.wrapping_add(1);
            }

            // DAA
            0x27 => {
                let a = self.cpu.regs.a;
                let nf = self.cpu.regs.f & NF != 0;
                let cf = self.cpu.regs.f & CF != 0;
                let hf = self.cpu.regs.f & HF != 0;

                let mut correction: u8 = 0;
                let mut new_cf = cf;
                if hf || (a & 0x0F) > 9 {
                    correction |= 0x06;
                }
                if cf || a > 0x99 {
                    correction |= 0x60;
                    new_cf = true;
                }
                let result = if nf {
                    a.wrapping_sub(correction)
                } else {
                    a.wrapping_add(correction)
                };
                let new_hf = if nf {
                    hf && (a & 0x0F) < 6
                } else {
                    (a & 0x0F) > 9
                };
                self.cpu.regs.a = result;
                self.cpu.regs.f =
                    sz53p(result) | bit(NF, nf) | bit(CF, new_cf) | bit(HF, new_hf);
            }

            // LD HL, (nn)
            0x2A => {
                let address = self.fetch_word();
                let value = self.read_word(address);
                self.set_indexed_hl(value);
                self.cpu.regs.wz = address.wrapping_add(1);
            }

            // CPL
            0x2F => {
                self.cpu.regs.a = !self.cpu.regs.a;
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF | CF))
                    | HF
                    | NF
                    | (self.cpu.regs.a & (XF | YF));
            }

            // LD (nn), A
            0x32 => {
                let address = self.fetch_word();
                let a = self.cpu.regs.a;
                self.write_byte(address, a);
                self.cpu.regs.wz = (u16::from(a) << 8) | (address.wrapping_add(1) & 0xFF);
            }

            // SCF
            0x37 => {
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF))
                    | CF
                    | (self.cpu.regs.a & (XF | YF));
            }

            // LD A, (nn)
            0x3A => {
                let address = self.fetch_word();
                self.cpu.regs.a = self.read_byte(address);
                self.cpu.regs.wz = address.wrapping_add(1);
            }

            // CCF
            0x3F => {
                let old_carry = self.cpu.regs.f & CF != 0;
                self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | PF))
                    | (self.cpu.regs.a & (XF | YF))
                    | bit(HF, old_carry)
                    | bit(CF, !old_carry);
            }

            // HALT
            0x76 => {
                self.cpu.regs.halted = true;
            }

            // LD r, r' (40-7F except 76)
            0x40..=0x7F => {
                let dst = (op >> 3) & 7;
                let src = op & 7;
                if src == 6 {
                    // H/L destinations stay unremapped when a displacement
                    // is in play.
                    let address = self.indexed_address();
                    let value = self.read_byte(address);
                    self.set_reg8(dst, value);
                } else if dst == 6 {
                    let value = self.reg8(src);
                    let address = self.indexed_address();
                    self.write_byte(address, value);
                } else {
                    let value = self.reg8_indexed(src);
                    self.set_reg8_indexed(dst, value);
                }
            }

            // ALU A, r (80-BF)
            0x80..=0xBF => {
                let r = op & 7;
                let value = if r == 6 {
                    let address = self.indexed_address();
                    self.read_byte(address)
                } else {
                    self.reg8_indexed(r)
                };
                self.alu_a((op >> 3) & 7, value);
            }

            // RET cc
            0xC0 | 0xC8 | 0xD0 | 0xD8 | 0xE0 | 0xE8 | 0xF0 | 0xF8 => {
                self.add_tick();
                if self.condition((op >> 3) & 7) {
                    let address = self.pop_word();
                    self.cpu.regs.wz = address;
                    self.cpu.regs.pc = address;
                }
            }

            // POP rr (C1=BC, D1=DE, E1=HL, F1=AF)
            0xC1 | 0xD1 | 0xE1 | 0xF1 => {
                let value = self.pop_word();
                self.set_reg16_af((op >> 4) & 3, value);
            }

            // JP cc, nn
            0xC2 | 0xCA | 0xD2 | 0xDA | 0xE2 | 0xEA | 0xF2 | 0xFA => {
                let address = self.fetch_word();
                self.cpu.regs.wz = address;
                if self.condition((op >> 3) & 7) {
                    self.cpu.regs.pc = address;
                }
            }

            // JP nn
            0xC3 => {
                let address = self.fetch_word();
                self.cpu.regs.wz = address;
                self.cpu.regs.pc = address;
            }

            // CALL cc, nn
            0xC4 | 0xCC | 0xD4 | 0xDC | 0xE4 | 0xEC | 0xF4 | 0xFC => {
                let address = self.fetch_word();
                self.cpu.regs.wz = address;
                if self.condition((op >> 3) & 7) {
                    let pc = self.cpu.regs.pc;
                    self.push_word(pc);
                    self.cpu.regs.pc = address;
                }
            }

            // PUSH rr (C5=BC, D5=DE, E5=HL, F5=AF)
            0xC5 | 0xD5 | 0xE5 | 0xF5 => {
                let value = self.reg16_af((op >> 4) & 3);
                self.push_word(value);
            }

            // ALU A, n
            0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE => {
                let value = self.fetch_byte();
                self.alu_a((op >> 3) & 7, value);
            }

            // RST (C7..FF)
            0xC7 | 0xCF | 0xD7 | 0xDF | 0xE7 | 0xEF | 0xF7 | 0xFF => {
                let pc = self.cpu.regs.pc;
                self.push_word(pc);
                let vector = u16::from(op & 0x38);
                self.cpu.regs.wz = vector;
                self.cpu.regs.pc = vector;
            }

            // RET
            0xC9 => {
                let address = self.pop_word();
                self.cpu.regs.wz = address;
                self.cpu.regs.pc = address;
            }

            // CALL nn
            0xCD => {
                let address = self.fetch_word();
                self.cpu.regs.wz = address;
                let pc = self.cpu.regs.pc;
                self.push_word(pc);
                self.cpu.regs.pc = address;
            }

            // OUT (n), A
            0xD3 => {
                let port_lo = self.fetch_byte();
                let a = self.cpu.regs.a;
                let port = (u16::from(a) << 8) | u16::from(port_lo);
                self.io_write(port, a);
                self.cpu.regs.wz =
                    (u16::from(a) << 8) | u16::from(port_lo.wrapping_add(1));
            }

            // EXX
            0xD9 => {
                let regs = &mut self.cpu.regs;
                core::mem::swap(&mut regs.b, &mut regs.b_alt);
                core::mem::swap(&mut regs.c, &mut regs.c_alt);
                core::mem::swap(&mut regs.d, &mut regs.d_alt);
                core::mem::swap(&mut regs.e, &mut regs.e_alt);
                core::mem::swap(&mut regs.h, &mut regs.h_alt);
                core::mem::swap(&mut regs.l, &mut regs.l_alt);
            }

            // IN A, (n)
            0xDB => {
                let port_lo = self.fetch_byte();
                let port = (u16::from(self.cpu.regs.a) << 8) | u16::from(port_lo);
                self.cpu.regs.wz = port.wrapping_add(1);
                self.cpu.regs.a = self.io_read(port);
            }

            // EX (SP), HL
            0xE3 => {
                let sp = self.cpu.regs.sp;
                let from_stack = self.read_word(sp);
                self.add_tick();
                self.cpu.regs.wz = from_stack;
                let value = self.indexed_hl();
                self.write_word(sp, value);
                self.set_indexed_hl(from_stack);
                self.add_ticks(2);
            }

            // JP (HL) - no displacement even when prefixed
            0xE9 => {
                self.cpu.regs.pc = self.indexed_hl();
            }

            // EX DE, HL - never remapped
            0xEB => {
                let de = self.cpu.regs.de();
                let hl = self.cpu.regs.hl();
                self.cpu.regs.set_de(hl);
                self.cpu.regs.set_hl(de);
            }

            // DI
            0xF3 => {
                self.cpu.regs.iff1 = false;
                self.cpu.regs.iff2 = false;
            }

            // LD SP, HL
            0xF9 => {
                self.cpu.regs.sp = self.indexed_hl();
                self.cpu.regs.wz = self.cpu.regs.sp.wrapping_add(1);
                self.add_ticks(2);
            }

            // EI - takes effect after the next instruction
            0xFB => {
                self.cpu.ei_delay = true;
            }

            // CB/ED/DD/FD are consumed before dispatch
            _ => unreachable!("prefix byte reached primary dispatch: {op:#04X}"),
        }
    }

    /// ALU operation on A by field code: ADD ADC SUB SBC AND XOR OR CP.
    fn alu_a(&mut self, index: u8, value: u8) {
        let a = self.cpu.regs.a;
        let carry = self.cpu.regs.f & CF != 0;
        let result = match index {
            0 => alu::add8(a, value, false),
            1 => alu::add8(a, value, carry),
            2 => alu::sub8(a, value, false),
            3 => alu::sub8(a, value, carry),
            4 => alu::and8(a, value),
            5 => alu::xor8(a, value),
            6 => alu::or8(a, value),
            _ => alu::cp8(a, value),
        };
        self.cpu.regs.a = result.value;
        self.cpu.regs.f = result.flags;
    }

    // =========================================================================
    // CB table
    // =========================================================================

    /// Rotate/shift by field code: RLC RRC RL RR SLA SRA SLL SRL.
    fn rotate(&self, index: u8, value: u8) -> alu::AluResult {
        let carry = self.cpu.regs.f & CF != 0;
        match index {
            0 => alu::rlc8(value),
            1 => alu::rrc8(value),
            2 => alu::rl8(value, carry),
            3 => alu::rr8(value, carry),
            4 => alu::sla8(value),
            5 => alu::sra8(value),
            6 => alu::sll8(value),
            _ => alu::srl8(value),
        }
    }

    /// BIT b flag update common to all forms; X/Y are filled by the caller.
    fn bit_flags(&mut self, b: u8, value: u8) {
        let result = value & (1 << b);
        self.cpu.regs.f = (self.cpu.regs.f & CF)
            | HF
            | bit(ZF | PF, result == 0)
            | bit(SF, b == 7 && result != 0);
    }

    fn execute_cb(&mut self, op: u8) {
        let group = op >> 6;
        let b = (op >> 3) & 7;
        let r = op & 7;

        if r == 6 {
            let address = self.cpu.regs.hl();
            match group {
                // BIT b, (HL): X/Y leak from the address high byte via WZ
                1 => {
                    let value = self.read_byte(address);
                    self.cpu.regs.wz = address;
                    self.add_tick();
                    self.bit_flags(b, value);
                    self.cpu.regs.f =
                        (self.cpu.regs.f & !(XF | YF)) | (self.cpu.regs.w() & (XF | YF));
                }
                0 => {
                    let value = self.read_byte(address);
                    let result = self.rotate(b, value);
                    self.add_tick();
                    self.write_byte(address, result.value);
                    self.cpu.regs.f = result.flags;
                }
                2 => {
                    let value = self.read_byte(address);
                    self.add_tick();
                    self.write_byte(address, value & !(1 << b));
                }
                _ => {
                    let value = self.read_byte(address);
                    self.add_tick();
                    self.write_byte(address, value | (1 << b));
                }
            }
            return;
        }

        let value = self.reg8(r);
        match group {
            1 => {
                self.bit_flags(b, value);
                self.cpu.regs.f = (self.cpu.regs.f & !(XF | YF)) | (value & (XF | YF));
            }
            0 => {
                let result = self.rotate(b, value);
                self.set_reg8(r, result.value);
                self.cpu.regs.f = result.flags;
            }
            2 => self.set_reg8(r, value & !(1 << b)),
            _ => self.set_reg8(r, value | (1 << b)),
        }
    }

    /// DDCB/FDCB: displacement read before the final opcode; rotate/res/set
    /// also copy the result into a named register (the undocumented copy).
    fn execute_cb_indexed(&mut self) {
        let offset = self.fetch_byte() as i8;
        let op = self.fetch_byte();
        let base = if self.cpu.index_mode == IndexMode::Ix {
            self.cpu.regs.ix
        } else {
            self.cpu.regs.iy
        };
        let address = base.wrapping_add(offset as u16);
        self.cpu.regs.wz = address;
        self.add_ticks(2);

        let group = op >> 6;
        let b = (op >> 3) & 7;
        let r = op & 7;
        let value = self.read_byte(address);

        if group == 1 {
            self.add_tick();
            self.bit_flags(b, value);
            self.cpu.regs.f =
                (self.cpu.regs.f & !(XF | YF)) | (self.cpu.regs.w() & (XF | YF));
            return;
        }

        let result = match group {
            0 => {
                let rotated = self.rotate(b, value);
                self.cpu.regs.f = rotated.flags;
                rotated.value
            }
            2 => value & !(1 << b),
            _ => value | (1 << b),
        };
        self.add_tick();
        self.write_byte(address, result);
        if r != 6 {
            self.set_reg8(r, result);
        }
    }

    // =========================================================================
    // ED table
    // =========================================================================

    fn execute_ed(&mut self, op: u8) {
        match op {
            // IN r, (C); 70 = IN (C), flags only
            0x40 | 0x48 | 0x50 | 0x58 | 0x60 | 0x68 | 0x70 | 0x78 => {
                let port = self.cpu.regs.bc();
                self.cpu.regs.wz = port.wrapping_add(1);
                let value = self.io_read(port);
                let r = (op >> 3) & 7;
                if r != 6 {
                    self.set_reg8(r, value);
                }
                self.cpu.regs.f = sz53p(value) | (self.cpu.regs.f & CF);
            }

            // OUT (C), r; 71 = OUT (C), 0
            0x41 | 0x49 | 0x51 | 0x59 | 0x61 | 0x69 | 0x71 | 0x79 => {
                let port = self.cpu.regs.bc();
                self.cpu.regs.wz = port.wrapping_add(1);
                let r = (op >> 3) & 7;
                let value = if r == 6 { 0 } else { self.reg8(r) };
                self.io_write(port, value);
            }

            // SBC HL, rr
            0x42 | 0x52 | 0x62 | 0x72 => {
                self.add_ticks(7);
                let hl = self.cpu.regs.hl();
                self.cpu.regs.wz = hl.wrapping_add(1);
                let rr = self.reg16_plain((op >> 4) & 3);
                let (result, flags) = alu::sbc16(hl, rr, self.cpu.regs.f & CF != 0);
                self.cpu.regs.set_hl(result);
                self.cpu.regs.f = flags;
            }

            // LD (nn), rr
            0x43 | 0x53 | 0x63 | 0x73 => {
                let address = self.fetch_word();
                self.cpu.regs.wz = address.wrapping_add(1);
                let value = self.reg16_plain((op >> 4) & 3);
                self.write_word(address, value);
            }

            // NEG (and undocumented mirrors)
            0x44 | 0x4C | 0x54 | 0x5C | 0x64 | 0x6C | 0x74 | 0x7C => {
                let result = alu::sub8(0, self.cpu.regs.a, false);
                self.cpu.regs.a = result.value;
                self.cpu.regs.f = result.flags;
            }

            // RETN (and undocumented mirrors)
            0x45 | 0x55 | 0x65 | 0x75 => {
                self.cpu.regs.iff1 = self.cpu.regs.iff2;
                let address = self.pop_word();
                self.cpu.regs.wz = address;
                self.cpu.regs.pc = address;
            }

            // IM 0 (and undocumented mirrors)
            0x46 | 0x4E | 0x66 | 0x6E => {
                self.cpu.regs.im = 0;
            }

            // LD I, A
            0x47 => {
                self.add_tick();
                self.cpu.regs.i = self.cpu.regs.a;
            }

            // ADC HL, rr
            0x4A | 0x5A | 0x6A | 0x7A => {
                self.add_ticks(7);
                let hl = self.cpu.regs.hl();
                self.cpu.regs.wz = hl.wrapping_add(1);
                let rr = self.reg16_plain((op >> 4) & 3);
                let (result, flags) = alu::adc16(hl, rr, self.cpu.regs.f & CF != 0);
                self.cpu.regs.set_hl(result);
                self.cpu.regs.f = flags;
            }

            // LD rr, (nn)
            0x4B | 0x5B | 0x6B | 0x7B => {
                let address = self.fetch_word();
                self.cpu.regs.wz = address.wrapping_add(1);
                let value = self.read_word(address);
                self.set_reg16_plain((op >> 4) & 3, value);
            }

            // RETI (and undocumented mirrors)
            0x4D | 0x5D | 0x6D | 0x7D => {
                self.cpu.regs.iff1 = self.cpu.regs.iff2;
                self.cpu.reti_signaled = true;
                let address = self.pop_word();
                self.cpu.regs.wz = address;
                self.cpu.regs.pc = address;
            }

            // LD R, A
            0x4F => {
                self.add_tick();
                self.cpu.regs.r = self.cpu.regs.a;
            }

            // IM 1
            0x56 | 0x76 => {
                self.cpu.regs.im = 1;
            }

            // LD A, I
            0x57 => {
                self.add_tick();
                self.cpu.regs.a = self.cpu.regs.i;
                self.ld_a_ir_flags();
            }

            // IM 2
            0x5E | 0x7E => {
                self.cpu.regs.im = 2;
            }

            // LD A, R
            0x5F => {
                self.add_tick();
                self.cpu.regs.a = self.cpu.regs.r;
                self.ld_a_ir_flags();
            }

            // RRD
            0x67 => {
                let address = self.cpu.regs.hl();
                let memory = self.read_byte(address);
                self.add_ticks(4);
                self.cpu.regs.wz = address.wrapping_add(1);
                let a = self.cpu.regs.a;
                self.cpu.regs.a = (a & 0xF0) | (memory & 0x0F);
                let new_memory = ((a & 0x0F) << 4) | (memory >> 4);
                self.write_byte(address, new_memory);
                self.cpu.regs.f = sz53p(self.cpu.regs.a) | (self.cpu.regs.f & CF);
            }

            // RLD
            0x6F => {
                let address = self.cpu.regs.hl();
                let memory = self.read_byte(address);
                self.add_ticks(4);
                self.cpu.regs.wz = address.wrapping_add(1);
                let a = self.cpu.regs.a;
                self.cpu.regs.a = (a & 0xF0) | (memory >> 4);
                let new_memory = ((memory & 0x0F) << 4) | (a & 0x0F);
                self.write_byte(address, new_memory);
                self.cpu.regs.f = sz53p(self.cpu.regs.a) | (self.cpu.regs.f & CF);
            }

            // LDI / LDD
            0xA0 => self.block_ld(1),
            0xA8 => self.block_ld(-1),

            // CPI / CPD
            0xA1 => self.block_cp(1),
            0xA9 => self.block_cp(-1),

            // INI / IND
            0xA2 => self.block_in(1),
            0xAA => self.block_in(-1),

            // OUTI / OUTD
            0xA3 => self.block_out(1),
            0xAB => self.block_out(-1),

            // LDIR / LDDR
            0xB0 => {
                self.block_ld(1);
                self.block_repeat(self.cpu.regs.bc() != 0);
            }
            0xB8 => {
                self.block_ld(-1);
                self.block_repeat(self.cpu.regs.bc() != 0);
            }

            // CPIR / CPDR
            0xB1 => {
                self.block_cp(1);
                let again = self.cpu.regs.bc() != 0 && self.cpu.regs.f & ZF == 0;
                self.block_repeat(again);
            }
            0xB9 => {
                self.block_cp(-1);
                let again = self.cpu.regs.bc() != 0 && self.cpu.regs.f & ZF == 0;
                self.block_repeat(again);
            }

            // INIR / INDR
            0xB2 => {
                self.block_in(1);
                self.block_repeat(self.cpu.regs.b != 0);
            }
            0xBA => {
                self.block_in(-1);
                self.block_repeat(self.cpu.regs.b != 0);
            }

            // OTIR / OTDR
            0xB3 => {
                self.block_out(1);
                self.block_repeat(self.cpu.regs.b != 0);
            }
            0xBB => {
                self.block_out(-1);
                self.block_repeat(self.cpu.regs.b != 0);
            }

            // Unlisted ED opcodes: two-fetch no-ops, 8 ticks, R advanced twice
            _ => {}
        }
    }

    /// Register pair without index remapping (ED table never remaps).
    fn reg16_plain(&self, code: u8) -> u16 {
        match code {
            0 => self.cpu.regs.bc(),
            1 => self.cpu.regs.de(),
            2 => self.cpu.regs.hl(),
            _ => self.cpu.regs.sp,
        }
    }

    fn set_reg16_plain(&mut self, code: u8, value: u16) {
        match code {
            0 => self.cpu.regs.set_bc(value),
            1 => self.cpu.regs.set_de(value),
            2 => self.cpu.regs.set_hl(value),
            _ => self.cpu.regs.sp = value,
        }
    }

    fn ld_a_ir_flags(&mut self) {
        let a = self.cpu.regs.a;
        self.cpu.regs.f = (self.cpu.regs.f & CF)
            | bit(SF, a & 0x80 != 0)
            | bit(ZF, a == 0)
            | (a & (YF | XF))
            | bit(PF, self.cpu.regs.iff2);
    }

    /// LDI/LDD body. X and Y come from bits 3 and 1 of A + transferred byte.
    fn block_ld(&mut self, direction: i16) {
        let hl = self.cpu.regs.hl();
        let de = self.cpu.regs.de();
        let value = self.read_byte(hl);
        self.write_byte(de, value);
        self.add_ticks(2);
        self.cpu.regs.set_hl(hl.wrapping_add(direction as u16));
        self.cpu.regs.set_de(de.wrapping_add(direction as u16));
        self.cpu.regs.set_bc(self.cpu.regs.bc().wrapping_sub(1));
        let n = value.wrapping_add(self.cpu.regs.a);
        self.cpu.regs.f = (self.cpu.regs.f & (SF | ZF | CF))
            | bit(XF, n & 0x08 != 0)
            | bit(YF, n & 0x02 != 0)
            | bit(PF, self.cpu.regs.bc() != 0);
    }

    /// CPI/CPD body. X and Y come from A - value - H, like a half-finished
    /// subtraction.
    fn block_cp(&mut self, direction: i16) {
        let hl = self.cpu.regs.hl();
        let value = self.read_byte(hl);
        self.add_ticks(5);
        self.cpu.regs.wz = self.cpu.regs.wz.wrapping_add(direction as u16);
        let a = self.cpu.regs.a;
        let result = a.wrapping_sub(value);
        let half = (a & 0x0F) < (value & 0x0F);
        let n = result.wrapping_sub(u8::from(half));
        self.cpu.regs.set_hl(hl.wrapping_add(direction as u16));
        self.cpu.regs.set_bc(self.cpu.regs.bc().wrapping_sub(1));
        self.cpu.regs.f = (self.cpu.regs.f & CF)
            | NF
            | bit(ZF, result == 0)
            | bit(SF, result & 0x80 != 0)
            | bit(HF, half)
            | bit(XF, n & 0x08 != 0)
            | bit(YF, n & 0x02 != 0)
            | bit(PF, self.cpu.regs.bc() != 0);
    }

    /// INI/IND body, including the synthetic-sum carry/half-carry rule.
    fn block_in(&mut self, direction: i16) {
        self.add_tick();
        let port = self.cpu.regs.bc();
        self.cpu.regs.wz = port.wrapping_add(direction as u16);
        let value = self.io_read(port);
        self.cpu.regs.b = self.cpu.regs.b.wrapping_sub(1);
        let hl = self.cpu.regs.hl();
        self.write_byte(hl, value);
        self.cpu.regs.set_hl(hl.wrapping_add(direction as u16));
        let adjusted_c = if direction > 0 {
            self.cpu.regs.c.wrapping_add(1)
        } else {
            self.cpu.regs.c.wrapping_sub(1)
        };
        self.block_io_flags(value, adjusted_c);
    }

    /// OUTI/OUTD body. The synthetic sum uses L after the pointer moves.
    fn block_out(&mut self, direction: i16) {
        self.add_tick();
        let hl = self.cpu.regs.hl();
        let value = self.read_byte(hl);
        self.cpu.regs.b = self.cpu.regs.b.wrapping_sub(1);
        let port = self.cpu.regs.bc();
        self.cpu.regs.wz = port.wrapping_add(direction as u16);
        self.io_write(port, value);
        self.cpu.regs.set_hl(hl.wrapping_add(direction as u16));
        self.block_io_flags(value, self.cpu.regs.l);
    }

    fn block_io_flags(&mut self, value: u8, addend: u8) {
        let b = self.cpu.regs.b;
        let k = u16::from(value) + u16::from(addend);
        self.cpu.regs.f = bit(ZF, b == 0)
            | (b & (SF | YF | XF))
            | bit(NF, value & 0x80 != 0)
            | bit(HF | CF, k > 0xFF)
            | (sz53p((k as u8 & 7) ^ b) & PF);
    }

    /// Shared repeat tail: rewind PC over the two-byte opcode and charge
    /// the inter-iteration stall.
    fn block_repeat(&mut self, again: bool) {
        if again {
            self.cpu.regs.pc = self.cpu.regs.pc.wrapping_sub(2);
            self.cpu.regs.wz = self.cpu.regs.pc.wrapping_add(1);
            self.add_ticks(5);
        }
    }
}
