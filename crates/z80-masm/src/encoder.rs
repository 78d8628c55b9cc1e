//! Instruction encoder: parsed mnemonic + operands to canonical bytes.

use crate::assembler::{Driver, Features};
use crate::error::ErrorKind;
use crate::lexer::Tok;
use crate::value::Value;

pub(crate) type EncodeError = (ErrorKind, String);

fn syntax(message: impl Into<String>) -> EncodeError {
    (ErrorKind::Syntax, message.into())
}

fn semantic(message: impl Into<String>) -> EncodeError {
    (ErrorKind::Semantic, message.into())
}

/// Is `upper` a mnemonic under the current feature gates? Gated names fall
/// back to ordinary labels when their gate is off.
pub(crate) fn is_mnemonic(upper: &str, features: Features) -> bool {
    const BASE: &[&str] = &[
        "LD", "PUSH", "POP", "EX", "EXX", "LDI", "LDD", "LDIR", "LDDR", "CPI", "CPD", "CPIR",
        "CPDR", "INI", "IND", "INIR", "INDR", "OUTI", "OUTD", "OTIR", "OTDR", "ADD", "ADC",
        "SUB", "SBC", "AND", "XOR", "OR", "CP", "INC", "DEC", "DAA", "CPL", "NEG", "CCF", "SCF",
        "NOP", "HALT", "DI", "EI", "IM", "RLCA", "RLA", "RRCA", "RRA", "RLC", "RL", "RRC", "RR",
        "SLA", "SRA", "SRL", "RLD", "RRD", "BIT", "SET", "RES", "JP", "JR", "DJNZ", "CALL",
        "RET", "RETI", "RETN", "RST", "IN", "OUT",
    ];
    const UNDOC: &[&str] = &["SLL", "SLI"];
    const Z80N: &[&str] = &[
        "SWAPNIB", "MIRROR", "TEST", "MUL", "NEXTREG", "PIXELDN", "PIXELAD", "SETAE", "OUTINB",
        "LDIX", "LDWS", "LDDX", "LDIRX", "LDDRX", "LDPIRX", "LDIRSCALE", "BSLA", "BSRA", "BSRL",
        "BSRF", "BRLC",
    ];
    BASE.contains(&upper)
        || (features.undoc && UNDOC.contains(&upper))
        || (features.z80n && Z80N.contains(&upper))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Reg {
    A,
    B,
    C,
    D,
    E,
    H,
    L,
    I,
    R,
    Ixh,
    Ixl,
    Iyh,
    Iyl,
    Bc,
    De,
    Hl,
    Sp,
    Af,
    AfAlt,
    Ix,
    Iy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mem {
    Bc,
    De,
    Hl,
    Sp,
    C,
    Ix(i8),
    Iy(i8),
    Abs(u16),
}

#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Reg(Reg),
    Mem(Mem),
    Imm(Value),
}

fn parse_reg(name: &str) -> Option<Reg> {
    let upper = name.to_ascii_uppercase();
    Some(match upper.as_str() {
        "A" => Reg::A,
        "B" => Reg::B,
        "C" => Reg::C,
        "D" => Reg::D,
        "E" => Reg::E,
        "H" => Reg::H,
        "L" => Reg::L,
        "I" => Reg::I,
        "R" => Reg::R,
        "IXH" => Reg::Ixh,
        "IXL" => Reg::Ixl,
        "IYH" => Reg::Iyh,
        "IYL" => Reg::Iyl,
        "BC" => Reg::Bc,
        "DE" => Reg::De,
        "HL" => Reg::Hl,
        "SP" => Reg::Sp,
        "AF" => Reg::Af,
        "AF'" => Reg::AfAlt,
        "IX" => Reg::Ix,
        "IY" => Reg::Iy,
        _ => return None,
    })
}

/// Field code of an 8-bit register (B=0 .. A=7); index halves map to H/L.
fn r_code(reg: Reg) -> Option<u8> {
    Some(match reg {
        Reg::B => 0,
        Reg::C => 1,
        Reg::D => 2,
        Reg::E => 3,
        Reg::H | Reg::Ixh | Reg::Iyh => 4,
        Reg::L | Reg::Ixl | Reg::Iyl => 5,
        Reg::A => 7,
        _ => return None,
    })
}

fn index_prefix(reg: Reg) -> Option<u8> {
    match reg {
        Reg::Ixh | Reg::Ixl | Reg::Ix => Some(0xDD),
        Reg::Iyh | Reg::Iyl | Reg::Iy => Some(0xFD),
        _ => None,
    }
}

fn is_index_half(reg: Reg) -> bool {
    matches!(reg, Reg::Ixh | Reg::Ixl | Reg::Iyh | Reg::Iyl)
}

/// Condition field code: NZ Z NC C PO PE P M.
fn parse_condition(toks: &[Tok]) -> Option<u8> {
    if toks.len() != 1 {
        return None;
    }
    let name = toks[0].ident()?.to_ascii_uppercase();
    Some(match name.as_str() {
        "NZ" => 0,
        "Z" => 1,
        "NC" => 2,
        "C" => 3,
        "PO" => 4,
        "PE" => 5,
        "P" => 6,
        "M" => 7,
        _ => return None,
    })
}

impl Driver<'_> {
    fn parse_operand(&mut self, toks: &[Tok]) -> Result<Operand, EncodeError> {
        if toks.is_empty() {
            return Err(syntax("missing operand"));
        }
        // A bare register name
        if toks.len() == 1
            && let Some(name) = toks[0].ident()
            && let Some(reg) = parse_reg(name)
        {
            if is_index_half(reg) && !self.features.undoc {
                return Err(syntax(format!(
                    "{name} requires undocumented instruction support"
                )));
            }
            return Ok(Operand::Reg(reg));
        }
        // A whole-parenthesized operand is a memory reference
        if toks[0].is_punct("(") && toks[toks.len() - 1].is_punct(")") && paren_wraps(toks) {
            let inner = &toks[1..toks.len() - 1];
            if inner.len() == 1
                && let Some(name) = inner[0].ident()
            {
                match name.to_ascii_uppercase().as_str() {
                    "BC" => return Ok(Operand::Mem(Mem::Bc)),
                    "DE" => return Ok(Operand::Mem(Mem::De)),
                    "HL" => return Ok(Operand::Mem(Mem::Hl)),
                    "SP" => return Ok(Operand::Mem(Mem::Sp)),
                    "C" => return Ok(Operand::Mem(Mem::C)),
                    "IX" => return Ok(Operand::Mem(Mem::Ix(0))),
                    "IY" => return Ok(Operand::Mem(Mem::Iy(0))),
                    _ => {}
                }
            }
            if let Some(name) = inner.first().and_then(Tok::ident) {
                let upper = name.to_ascii_uppercase();
                if (upper == "IX" || upper == "IY") && inner.len() >= 2 {
                    let sign = match &inner[1] {
                        Tok::Punct("+") => 1i64,
                        Tok::Punct("-") => -1i64,
                        _ => return Err(syntax("expected + or - after index register")),
                    };
                    let magnitude = self
                        .eval_tokens(&inner[2..])
                        .and_then(|value| value.as_int())
                        .map_err(syntax)?;
                    let displacement = sign * magnitude;
                    if !(-128..=127).contains(&displacement) {
                        return Err(semantic(format!(
                            "index displacement {displacement} out of range"
                        )));
                    }
                    let displacement = displacement as i8;
                    return Ok(Operand::Mem(if upper == "IX" {
                        Mem::Ix(displacement)
                    } else {
                        Mem::Iy(displacement)
                    }));
                }
            }
            let address = self
                .eval_tokens(inner)
                .and_then(|value| value.as_int())
                .map_err(syntax)?;
            return Ok(Operand::Mem(Mem::Abs(address as u16)));
        }
        let value = self.eval_tokens(toks).map_err(syntax)?;
        Ok(Operand::Imm(value))
    }

    fn imm16(&self, operand: &Operand) -> Result<u16, EncodeError> {
        match operand {
            Operand::Imm(value) => Ok(value.as_int().map_err(syntax)? as u16),
            _ => Err(syntax("expected an immediate value")),
        }
    }

    /// Displacement for JR/DJNZ, measured from the byte after the two-byte
    /// encoding.
    fn relative(&self, target: u16) -> Result<u8, EncodeError> {
        let offset = i32::from(target) - (i32::from(self.stmt_logical) + 2);
        if !(-128..=127).contains(&offset) {
            return Err(semantic(format!("relative branch out of range ({offset})")));
        }
        Ok(offset as u8)
    }

    /// ALU operation on an 8-bit operand, with the CB-style layout:
    /// `base | r` for registers, `base | 6` via (HL)/(IX+d).
    fn alu8(&mut self, base: u8, imm_opcode: u8, operand: &Operand) -> Result<Vec<u8>, EncodeError> {
        match operand {
            Operand::Reg(reg) => {
                let code = r_code(*reg).ok_or_else(|| syntax("bad 8-bit operand"))?;
                match index_prefix(*reg) {
                    Some(prefix) if is_index_half(*reg) => Ok(vec![prefix, base | code]),
                    None => Ok(vec![base | code]),
                    _ => Err(syntax("bad 8-bit operand")),
                }
            }
            Operand::Mem(Mem::Hl) => Ok(vec![base | 6]),
            Operand::Mem(Mem::Ix(d)) => Ok(vec![0xDD, base | 6, *d as u8]),
            Operand::Mem(Mem::Iy(d)) => Ok(vec![0xFD, base | 6, *d as u8]),
            Operand::Imm(value) => {
                Ok(vec![imm_opcode, value.as_int().map_err(syntax)? as u8])
            }
            Operand::Mem(_) => Err(syntax("bad 8-bit operand")),
        }
    }

    /// Rotate/shift/bit-group operand encoding under the CB prefix, with
    /// the undocumented copy-to-register form.
    fn cb_group(
        &mut self,
        base: u8,
        operands: &[Operand],
    ) -> Result<Vec<u8>, EncodeError> {
        match operands {
            [Operand::Reg(reg)] => {
                let code = r_code(*reg)
                    .filter(|_| !is_index_half(*reg))
                    .ok_or_else(|| syntax("bad rotate operand"))?;
                Ok(vec![0xCB, base | code])
            }
            [Operand::Mem(Mem::Hl)] => Ok(vec![0xCB, base | 6]),
            [Operand::Mem(Mem::Ix(d))] => Ok(vec![0xDD, 0xCB, *d as u8, base | 6]),
            [Operand::Mem(Mem::Iy(d))] => Ok(vec![0xFD, 0xCB, *d as u8, base | 6]),
            // Undocumented: result also lands in a named register.
            [Operand::Mem(Mem::Ix(d)), Operand::Reg(reg)] if self.features.undoc => {
                let code = r_code(*reg)
                    .filter(|_| !is_index_half(*reg))
                    .ok_or_else(|| syntax("bad copy register"))?;
                Ok(vec![0xDD, 0xCB, *d as u8, base | code])
            }
            [Operand::Mem(Mem::Iy(d)), Operand::Reg(reg)] if self.features.undoc => {
                let code = r_code(*reg)
                    .filter(|_| !is_index_half(*reg))
                    .ok_or_else(|| syntax("bad copy register"))?;
                Ok(vec![0xFD, 0xCB, *d as u8, base | code])
            }
            _ => Err(syntax("bad rotate/shift operands")),
        }
    }

    /// Encode one instruction. `parts` are the comma-separated operand
    /// token slices.
    pub(crate) fn encode_instruction(
        &mut self,
        upper: &str,
        parts: &[&[Tok]],
    ) -> Result<Vec<u8>, EncodeError> {
        // Implied-operand instructions first.
        if parts.is_empty() || (parts.len() == 1 && parts[0].is_empty()) {
            if let Some(bytes) = implied(upper, self.features) {
                return Ok(bytes);
            }
        }

        let operands: Vec<Operand> = {
            let mut list = Vec::new();
            for part in parts {
                if part.is_empty() {
                    return Err(syntax("empty operand"));
                }
            }
            // JR/JP/CALL/RET conditions and IN's flag form are parsed
            // per-mnemonic below; everything else parses eagerly.
            if matches!(upper, "JP" | "JR" | "CALL" | "RET" | "DJNZ" | "IN") {
                Vec::new()
            } else {
                for part in parts {
                    list.push(self.parse_operand(part)?);
                }
                list
            }
        };

        match upper {
            "NOP" | "HALT" | "DI" | "EI" | "EXX" | "DAA" | "CPL" | "NEG" | "CCF" | "SCF"
            | "RLCA" | "RLA" | "RRCA" | "RRA" | "RLD" | "RRD" | "LDI" | "LDD" | "LDIR"
            | "LDDR" | "CPI" | "CPD" | "CPIR" | "CPDR" | "INI" | "IND" | "INIR" | "INDR"
            | "OUTI" | "OUTD" | "OTIR" | "OTDR" | "RETI" | "RETN" | "SWAPNIB" | "MIRROR"
            | "PIXELDN" | "PIXELAD" | "SETAE" | "OUTINB" | "LDIX" | "LDWS" | "LDDX" | "LDIRX"
            | "LDDRX" | "LDPIRX" | "LDIRSCALE" => {
                Err(syntax(format!("{upper} takes no operands")))
            }

            "LD" => self.encode_ld(&operands),

            "PUSH" | "POP" => {
                let pop = upper == "POP";
                match operands.as_slice() {
                    [Operand::Reg(reg)] => {
                        let base = if pop { 0xC1 } else { 0xC5 };
                        match reg {
                            Reg::Bc => Ok(vec![base]),
                            Reg::De => Ok(vec![base | 0x10]),
                            Reg::Hl => Ok(vec![base | 0x20]),
                            Reg::Af => Ok(vec![base | 0x30]),
                            Reg::Ix => Ok(vec![0xDD, base | 0x20]),
                            Reg::Iy => Ok(vec![0xFD, base | 0x20]),
                            _ => Err(syntax(format!("bad {upper} operand"))),
                        }
                    }
                    // Z80N PUSH nn stores big-endian.
                    [Operand::Imm(value)] if !pop && self.features.z80n => {
                        let word = value.as_int().map_err(syntax)? as u16;
                        Ok(vec![0xED, 0x8A, (word >> 8) as u8, word as u8])
                    }
                    _ => Err(syntax(format!("bad {upper} operand"))),
                }
            }

            "EX" => match operands.as_slice() {
                [Operand::Reg(Reg::De), Operand::Reg(Reg::Hl)] => Ok(vec![0xEB]),
                [Operand::Reg(Reg::Af), Operand::Reg(Reg::AfAlt)] => Ok(vec![0x08]),
                [Operand::Mem(Mem::Sp), Operand::Reg(Reg::Hl)] => Ok(vec![0xE3]),
                [Operand::Mem(Mem::Sp), Operand::Reg(Reg::Ix)] => Ok(vec![0xDD, 0xE3]),
                [Operand::Mem(Mem::Sp), Operand::Reg(Reg::Iy)] => Ok(vec![0xFD, 0xE3]),
                _ => Err(syntax("bad EX operands")),
            },

            "ADD" => self.encode_add(&operands),
            "ADC" => self.encode_carry_op(&operands, 0x88, 0xCE, 0x4A),
            "SBC" => self.encode_carry_op(&operands, 0x98, 0xDE, 0x42),
            "SUB" => self.encode_acc_op(&operands, 0x90, 0xD6),
            "AND" => self.encode_acc_op(&operands, 0xA0, 0xE6),
            "XOR" => self.encode_acc_op(&operands, 0xA8, 0xEE),
            "OR" => self.encode_acc_op(&operands, 0xB0, 0xF6),
            "CP" => self.encode_acc_op(&operands, 0xB8, 0xFE),

            "INC" | "DEC" => {
                let dec = upper == "DEC";
                match operands.as_slice() {
                    [Operand::Reg(reg)] => {
                        if let Some(code) = r_code(*reg) {
                            let opcode = (if dec { 0x05 } else { 0x04 }) | (code << 3);
                            return match index_prefix(*reg) {
                                Some(prefix) if is_index_half(*reg) => Ok(vec![prefix, opcode]),
                                None => Ok(vec![opcode]),
                                _ => Err(syntax("bad INC/DEC operand")),
                            };
                        }
                        let base = if dec { 0x0B } else { 0x03 };
                        match reg {
                            Reg::Bc => Ok(vec![base]),
                            Reg::De => Ok(vec![base | 0x10]),
                            Reg::Hl => Ok(vec![base | 0x20]),
                            Reg::Sp => Ok(vec![base | 0x30]),
                            Reg::Ix => Ok(vec![0xDD, base | 0x20]),
                            Reg::Iy => Ok(vec![0xFD, base | 0x20]),
                            _ => Err(syntax("bad INC/DEC operand")),
                        }
                    }
                    [Operand::Mem(Mem::Hl)] => Ok(vec![if dec { 0x35 } else { 0x34 }]),
                    [Operand::Mem(Mem::Ix(d))] => {
                        Ok(vec![0xDD, if dec { 0x35 } else { 0x34 }, *d as u8])
                    }
                    [Operand::Mem(Mem::Iy(d))] => {
                        Ok(vec![0xFD, if dec { 0x35 } else { 0x34 }, *d as u8])
                    }
                    _ => Err(syntax("bad INC/DEC operand")),
                }
            }

            "IM" => match operands.as_slice() {
                [Operand::Imm(value)] => match value.as_int().map_err(syntax)? {
                    0 => Ok(vec![0xED, 0x46]),
                    1 => Ok(vec![0xED, 0x56]),
                    2 => Ok(vec![0xED, 0x5E]),
                    other => Err(semantic(format!("bad interrupt mode {other}"))),
                },
                _ => Err(syntax("IM takes a mode number")),
            },

            "RLC" => self.cb_group(0x00, &operands),
            "RRC" => self.cb_group(0x08, &operands),
            "RL" => self.cb_group(0x10, &operands),
            "RR" => self.cb_group(0x18, &operands),
            "SLA" => self.cb_group(0x20, &operands),
            "SRA" => self.cb_group(0x28, &operands),
            "SLL" | "SLI" => self.cb_group(0x30, &operands),
            "SRL" => self.cb_group(0x38, &operands),

            "BIT" | "RES" | "SET" => {
                let Some((bit_part, rest)) = operands.split_first() else {
                    return Err(syntax(format!("{upper} needs a bit number")));
                };
                let bit = match bit_part {
                    Operand::Imm(value) => value.as_int().map_err(syntax)?,
                    _ => return Err(syntax("bad bit number")),
                };
                if !(0..=7).contains(&bit) {
                    return Err(semantic(format!("bit number {bit} out of range")));
                }
                let base = match upper {
                    "BIT" => 0x40,
                    "RES" => 0x80,
                    _ => 0xC0,
                } | ((bit as u8) << 3);
                if upper == "BIT" && rest.len() != 1 {
                    return Err(syntax("bad BIT operands"));
                }
                self.cb_group(base, rest)
            }

            "JP" => self.encode_jp(parts),
            "JR" => self.encode_jr(parts),
            "DJNZ" => {
                if parts.len() != 1 {
                    return Err(syntax("DJNZ takes one operand"));
                }
                let target = match self.parse_operand(parts[0])? {
                    Operand::Imm(value) => value.as_int().map_err(syntax)? as u16,
                    _ => return Err(syntax("bad DJNZ target")),
                };
                Ok(vec![0x10, self.relative(target)?])
            }
            "CALL" => {
                match parts {
                    [target] => {
                        let operand = self.parse_operand(target)?;
                        let address = self.imm16(&operand)?;
                        Ok(vec![0xCD, address as u8, (address >> 8) as u8])
                    }
                    [cond, target] => {
                        let code = parse_condition(cond)
                            .ok_or_else(|| syntax("bad CALL condition"))?;
                        let operand = self.parse_operand(target)?;
                        let address = self.imm16(&operand)?;
                        Ok(vec![0xC4 | (code << 3), address as u8, (address >> 8) as u8])
                    }
                    _ => Err(syntax("bad CALL operands")),
                }
            }
            "RET" => match parts {
                [] => Ok(vec![0xC9]),
                [cond] => {
                    let code =
                        parse_condition(cond).ok_or_else(|| syntax("bad RET condition"))?;
                    Ok(vec![0xC0 | (code << 3)])
                }
                _ => Err(syntax("bad RET operands")),
            },
            "RST" => match operands.as_slice() {
                [Operand::Imm(value)] => {
                    let vector = value.as_int().map_err(syntax)?;
                    if vector & !0x38 != 0 {
                        return Err(semantic(format!("bad RST vector {vector:#X}")));
                    }
                    Ok(vec![0xC7 | vector as u8])
                }
                _ => Err(syntax("bad RST operand")),
            },

            "IN" => self.encode_in(parts),
            "OUT" => match operands.as_slice() {
                [Operand::Mem(Mem::Abs(port)), Operand::Reg(Reg::A)] => {
                    Ok(vec![0xD3, *port as u8])
                }
                [Operand::Mem(Mem::C), Operand::Reg(reg)] => {
                    let code = r_code(*reg)
                        .filter(|_| !is_index_half(*reg))
                        .ok_or_else(|| syntax("bad OUT register"))?;
                    Ok(vec![0xED, 0x41 | (code << 3)])
                }
                [Operand::Mem(Mem::C), Operand::Imm(value)] => {
                    if value.as_int().map_err(syntax)? != 0 {
                        return Err(syntax("only OUT (C), 0 exists"));
                    }
                    if !self.features.undoc {
                        return Err(syntax(
                            "OUT (C), 0 requires undocumented instruction support",
                        ));
                    }
                    Ok(vec![0xED, 0x71])
                }
                _ => Err(syntax("bad OUT operands")),
            },

            // Z80N
            "TEST" => match operands.as_slice() {
                [Operand::Imm(value)] => {
                    Ok(vec![0xED, 0x27, value.as_int().map_err(syntax)? as u8])
                }
                _ => Err(syntax("TEST takes an immediate")),
            },
            "MUL" => match operands.as_slice() {
                [Operand::Reg(Reg::D), Operand::Reg(Reg::E)] => Ok(vec![0xED, 0x30]),
                _ => Err(syntax("MUL operates on D, E")),
            },
            "NEXTREG" => match operands.as_slice() {
                [Operand::Imm(register), Operand::Reg(Reg::A)] => {
                    Ok(vec![0xED, 0x92, register.as_int().map_err(syntax)? as u8])
                }
                [Operand::Imm(register), Operand::Imm(value)] => Ok(vec![
                    0xED,
                    0x91,
                    register.as_int().map_err(syntax)? as u8,
                    value.as_int().map_err(syntax)? as u8,
                ]),
                _ => Err(syntax("bad NEXTREG operands")),
            },
            "BSLA" | "BSRA" | "BSRL" | "BSRF" | "BRLC" => match operands.as_slice() {
                [Operand::Reg(Reg::De), Operand::Reg(Reg::B)] => {
                    let second = match upper {
                        "BSLA" => 0x28,
                        "BSRA" => 0x29,
                        "BSRL" => 0x2A,
                        "BSRF" => 0x2B,
                        _ => 0x2C,
                    };
                    Ok(vec![0xED, second])
                }
                _ => Err(syntax(format!("{upper} operates on DE, B"))),
            },

            _ => Err(syntax(format!("unknown mnemonic {upper}"))),
        }
    }

    /// ADD: accumulator forms, 16-bit forms, and the Z80N extensions.
    fn encode_add(&mut self, operands: &[Operand]) -> Result<Vec<u8>, EncodeError> {
        match operands {
            // ADD HL/IX/IY, rr
            [Operand::Reg(dst @ (Reg::Hl | Reg::Ix | Reg::Iy)), Operand::Reg(src)] => {
                let rp = match (dst, src) {
                    (_, Reg::Bc) => Some(0x09),
                    (_, Reg::De) => Some(0x19),
                    (Reg::Hl, Reg::Hl) | (Reg::Ix, Reg::Ix) | (Reg::Iy, Reg::Iy) => Some(0x29),
                    (_, Reg::Sp) => Some(0x39),
                    _ => None,
                };
                if let Some(opcode) = rp {
                    return match dst {
                        Reg::Hl => Ok(vec![opcode]),
                        Reg::Ix => Ok(vec![0xDD, opcode]),
                        _ => Ok(vec![0xFD, opcode]),
                    };
                }
                // Z80N: ADD rr, A
                if *src == Reg::A && self.features.z80n {
                    return match dst {
                        Reg::Hl => Ok(vec![0xED, 0x31]),
                        _ => Err(syntax("bad ADD operands")),
                    };
                }
                Err(syntax("bad ADD operands"))
            }
            [Operand::Reg(Reg::Bc | Reg::De), Operand::Reg(Reg::A)] if self.features.z80n => {
                match operands[0] {
                    Operand::Reg(Reg::De) => Ok(vec![0xED, 0x32]),
                    _ => Ok(vec![0xED, 0x33]),
                }
            }
            // Z80N: ADD rr, nn
            [Operand::Reg(dst @ (Reg::Hl | Reg::De | Reg::Bc)), Operand::Imm(value)]
                if self.features.z80n =>
            {
                let word = value.as_int().map_err(syntax)? as u16;
                let opcode = match dst {
                    Reg::Hl => 0x34,
                    Reg::De => 0x35,
                    _ => 0x36,
                };
                Ok(vec![0xED, opcode, word as u8, (word >> 8) as u8])
            }
            // ADD A, x and implicit-A ADD x
            [Operand::Reg(Reg::A), operand] => self.alu8(0x80, 0xC6, operand),
            [operand] => self.alu8(0x80, 0xC6, operand),
            _ => Err(syntax("bad ADD operands")),
        }
    }

    /// ADC/SBC: accumulator forms plus the ED-prefixed HL forms.
    fn encode_carry_op(
        &mut self,
        operands: &[Operand],
        base: u8,
        imm_opcode: u8,
        hl_base: u8,
    ) -> Result<Vec<u8>, EncodeError> {
        match operands {
            [Operand::Reg(Reg::Hl), Operand::Reg(src)] => {
                let rp = match src {
                    Reg::Bc => 0x00,
                    Reg::De => 0x10,
                    Reg::Hl => 0x20,
                    Reg::Sp => 0x30,
                    _ => return Err(syntax("bad 16-bit operand")),
                };
                Ok(vec![0xED, hl_base | rp])
            }
            [Operand::Reg(Reg::A), operand] => self.alu8(base, imm_opcode, operand),
            [operand] => self.alu8(base, imm_opcode, operand),
            _ => Err(syntax("bad operands")),
        }
    }

    /// SUB/AND/XOR/OR/CP: accumulator-only, with optional explicit A.
    fn encode_acc_op(
        &mut self,
        operands: &[Operand],
        base: u8,
        imm_opcode: u8,
    ) -> Result<Vec<u8>, EncodeError> {
        match operands {
            [Operand::Reg(Reg::A), operand] => self.alu8(base, imm_opcode, operand),
            [operand] => self.alu8(base, imm_opcode, operand),
            _ => Err(syntax("bad operands")),
        }
    }

    fn encode_in(&mut self, parts: &[&[Tok]]) -> Result<Vec<u8>, EncodeError> {
        match parts {
            // IN (C): flags only, no register write-back.
            [port] => {
                if self.parse_operand(port)? == Operand::Mem(Mem::C) && self.features.undoc {
                    Ok(vec![0xED, 0x70])
                } else {
                    Err(syntax("bad IN operand"))
                }
            }
            [dst, port] => {
                // IN F, (C) is the same flags-only encoding; F is not a
                // general operand, so it is matched textually.
                let is_f = dst.len() == 1
                    && dst[0].ident().is_some_and(|name| name.eq_ignore_ascii_case("F"));
                if is_f {
                    if self.parse_operand(port)? == Operand::Mem(Mem::C) && self.features.undoc {
                        return Ok(vec![0xED, 0x70]);
                    }
                    return Err(syntax("bad IN operands"));
                }
                let destination = self.parse_operand(dst)?;
                let port = self.parse_operand(port)?;
                match (destination, port) {
                    (Operand::Reg(Reg::A), Operand::Mem(Mem::Abs(address))) => {
                        Ok(vec![0xDB, address as u8])
                    }
                    (Operand::Reg(reg), Operand::Mem(Mem::C)) => {
                        let code = r_code(reg)
                            .filter(|_| !is_index_half(reg))
                            .ok_or_else(|| syntax("bad IN register"))?;
                        Ok(vec![0xED, 0x40 | (code << 3)])
                    }
                    _ => Err(syntax("bad IN operands")),
                }
            }
            _ => Err(syntax("bad IN operands")),
        }
    }

    fn encode_jp(&mut self, parts: &[&[Tok]]) -> Result<Vec<u8>, EncodeError> {
        match parts {
            [single] => {
                match self.parse_operand(single)? {
                    Operand::Mem(Mem::Hl) => Ok(vec![0xE9]),
                    Operand::Mem(Mem::Ix(0)) => Ok(vec![0xDD, 0xE9]),
                    Operand::Mem(Mem::Iy(0)) => Ok(vec![0xFD, 0xE9]),
                    Operand::Mem(Mem::C) if self.features.z80n => Ok(vec![0xED, 0x98]),
                    Operand::Imm(value) => {
                        let address = value.as_int().map_err(syntax)? as u16;
                        Ok(vec![0xC3, address as u8, (address >> 8) as u8])
                    }
                    _ => Err(syntax("bad JP target")),
                }
            }
            [cond, target] => {
                let code = parse_condition(cond).ok_or_else(|| syntax("bad JP condition"))?;
                let operand = self.parse_operand(target)?;
                let address = self.imm16(&operand)?;
                Ok(vec![0xC2 | (code << 3), address as u8, (address >> 8) as u8])
            }
            _ => Err(syntax("bad JP operands")),
        }
    }

    fn encode_jr(&mut self, parts: &[&[Tok]]) -> Result<Vec<u8>, EncodeError> {
        match parts {
            [single] => {
                let target = match self.parse_operand(single)? {
                    Operand::Imm(value) => value.as_int().map_err(syntax)? as u16,
                    _ => return Err(syntax("bad JR target")),
                };
                Ok(vec![0x18, self.relative(target)?])
            }
            [cond, target] => {
                let code = parse_condition(cond).ok_or_else(|| syntax("bad JR condition"))?;
                if code > 3 {
                    return Err(syntax("JR supports NZ, Z, NC, C only"));
                }
                let target = match self.parse_operand(target)? {
                    Operand::Imm(value) => value.as_int().map_err(syntax)? as u16,
                    _ => return Err(syntax("bad JR target")),
                };
                Ok(vec![0x20 | (code << 3), self.relative(target)?])
            }
            _ => Err(syntax("bad JR operands")),
        }
    }

    /// The LD matrix.
    fn encode_ld(&mut self, operands: &[Operand]) -> Result<Vec<u8>, EncodeError> {
        let [dst, src] = operands else {
            return Err(syntax("LD takes two operands"));
        };
        match (dst, src) {
            // Interrupt/refresh registers
            (Operand::Reg(Reg::A), Operand::Reg(Reg::I)) => return Ok(vec![0xED, 0x57]),
            (Operand::Reg(Reg::A), Operand::Reg(Reg::R)) => return Ok(vec![0xED, 0x5F]),
            (Operand::Reg(Reg::I), Operand::Reg(Reg::A)) => return Ok(vec![0xED, 0x47]),
            (Operand::Reg(Reg::R), Operand::Reg(Reg::A)) => return Ok(vec![0xED, 0x4F]),
            _ => {}
        }

        // 8-bit destinations
        if let Operand::Reg(dreg) = dst
            && let Some(dcode) = r_code(*dreg)
        {
            let d_prefix = index_prefix(*dreg).filter(|_| is_index_half(*dreg));
            match src {
                Operand::Reg(sreg) => {
                    if let Some(scode) = r_code(*sreg) {
                        let s_prefix = index_prefix(*sreg).filter(|_| is_index_half(*sreg));
                        // H/L and index halves cannot mix, nor can the two
                        // index registers.
                        let opcode = 0x40 | (dcode << 3) | scode;
                        return match (d_prefix, s_prefix) {
                            (None, None) => Ok(vec![opcode]),
                            (Some(p), None) => {
                                if matches!(sreg, Reg::H | Reg::L) {
                                    Err(syntax("cannot mix H/L with index halves"))
                                } else {
                                    Ok(vec![p, opcode])
                                }
                            }
                            (None, Some(p)) => {
                                if matches!(dreg, Reg::H | Reg::L) {
                                    Err(syntax("cannot mix H/L with index halves"))
                                } else {
                                    Ok(vec![p, opcode])
                                }
                            }
                            (Some(p), Some(q)) if p == q => Ok(vec![p, opcode]),
                            _ => Err(syntax("cannot mix IX and IY halves")),
                        };
                    }
                    return Err(syntax("bad LD source"));
                }
                Operand::Mem(Mem::Hl) => {
                    if is_index_half(*dreg) {
                        return Err(syntax("bad LD destination for (HL)"));
                    }
                    return Ok(vec![0x46 | (dcode << 3)]);
                }
                Operand::Mem(Mem::Ix(d)) => {
                    if is_index_half(*dreg) {
                        return Err(syntax("bad LD destination for (IX+d)"));
                    }
                    return Ok(vec![0xDD, 0x46 | (dcode << 3), *d as u8]);
                }
                Operand::Mem(Mem::Iy(d)) => {
                    if is_index_half(*dreg) {
                        return Err(syntax("bad LD destination for (IY+d)"));
                    }
                    return Ok(vec![0xFD, 0x46 | (dcode << 3), *d as u8]);
                }
                Operand::Mem(Mem::Bc) => {
                    return if *dreg == Reg::A {
                        Ok(vec![0x0A])
                    } else {
                        Err(syntax("only LD A, (BC) exists"))
                    };
                }
                Operand::Mem(Mem::De) => {
                    return if *dreg == Reg::A {
                        Ok(vec![0x1A])
                    } else {
                        Err(syntax("only LD A, (DE) exists"))
                    };
                }
                Operand::Mem(Mem::Abs(address)) => {
                    // Memory loads into 8-bit registers exist only for A.
                    return if *dreg == Reg::A {
                        Ok(vec![0x3A, *address as u8, (*address >> 8) as u8])
                    } else {
                        Err(semantic("memory load into an 8-bit register other than A"))
                    };
                }
                Operand::Imm(value) => {
                    let byte = value.as_int().map_err(syntax)? as u8;
                    let opcode = 0x06 | (dcode << 3);
                    return match d_prefix {
                        Some(prefix) => Ok(vec![prefix, opcode, byte]),
                        None => Ok(vec![opcode, byte]),
                    };
                }
                Operand::Mem(_) => return Err(syntax("bad LD source")),
            }
        }

        // 16-bit destinations
        if let Operand::Reg(dreg @ (Reg::Bc | Reg::De | Reg::Hl | Reg::Sp | Reg::Ix | Reg::Iy)) =
            dst
        {
            match src {
                Operand::Imm(value) => {
                    let word = value.as_int().map_err(syntax)? as u16;
                    let bytes = [word as u8, (word >> 8) as u8];
                    return match dreg {
                        Reg::Bc => Ok(vec![0x01, bytes[0], bytes[1]]),
                        Reg::De => Ok(vec![0x11, bytes[0], bytes[1]]),
                        Reg::Hl => Ok(vec![0x21, bytes[0], bytes[1]]),
                        Reg::Sp => Ok(vec![0x31, bytes[0], bytes[1]]),
                        Reg::Ix => Ok(vec![0xDD, 0x21, bytes[0], bytes[1]]),
                        _ => Ok(vec![0xFD, 0x21, bytes[0], bytes[1]]),
                    };
                }
                Operand::Mem(Mem::Abs(address)) => {
                    let lo = *address as u8;
                    let hi = (*address >> 8) as u8;
                    return match dreg {
                        Reg::Hl => Ok(vec![0x2A, lo, hi]),
                        Reg::Bc => Ok(vec![0xED, 0x4B, lo, hi]),
                        Reg::De => Ok(vec![0xED, 0x5B, lo, hi]),
                        Reg::Sp => Ok(vec![0xED, 0x7B, lo, hi]),
                        Reg::Ix => Ok(vec![0xDD, 0x2A, lo, hi]),
                        _ => Ok(vec![0xFD, 0x2A, lo, hi]),
                    };
                }
                Operand::Reg(sreg) if *dreg == Reg::Sp => {
                    return match sreg {
                        Reg::Hl => Ok(vec![0xF9]),
                        Reg::Ix => Ok(vec![0xDD, 0xF9]),
                        Reg::Iy => Ok(vec![0xFD, 0xF9]),
                        _ => Err(syntax("bad LD SP source")),
                    };
                }
                _ => return Err(syntax("bad LD source")),
            }
        }

        // Memory destinations
        if let Operand::Mem(mem) = dst {
            match (mem, src) {
                (Mem::Bc, Operand::Reg(Reg::A)) => return Ok(vec![0x02]),
                (Mem::De, Operand::Reg(Reg::A)) => return Ok(vec![0x12]),
                (Mem::Hl, Operand::Reg(sreg)) => {
                    if let Some(scode) = r_code(*sreg).filter(|_| !is_index_half(*sreg)) {
                        return Ok(vec![0x70 | scode]);
                    }
                    return Err(syntax("bad LD (HL) source"));
                }
                (Mem::Ix(d), Operand::Reg(sreg)) => {
                    if let Some(scode) = r_code(*sreg).filter(|_| !is_index_half(*sreg)) {
                        return Ok(vec![0xDD, 0x70 | scode, *d as u8]);
                    }
                    return Err(syntax("bad LD (IX+d) source"));
                }
                (Mem::Iy(d), Operand::Reg(sreg)) => {
                    if let Some(scode) = r_code(*sreg).filter(|_| !is_index_half(*sreg)) {
                        return Ok(vec![0xFD, 0x70 | scode, *d as u8]);
                    }
                    return Err(syntax("bad LD (IY+d) source"));
                }
                (Mem::Hl, Operand::Imm(value)) => {
                    return Ok(vec![0x36, value.as_int().map_err(syntax)? as u8]);
                }
                (Mem::Ix(d), Operand::Imm(value)) => {
                    return Ok(vec![0xDD, 0x36, *d as u8, value.as_int().map_err(syntax)? as u8]);
                }
                (Mem::Iy(d), Operand::Imm(value)) => {
                    return Ok(vec![0xFD, 0x36, *d as u8, value.as_int().map_err(syntax)? as u8]);
                }
                (Mem::Abs(address), source) => {
                    let lo = *address as u8;
                    let hi = (*address >> 8) as u8;
                    return match source {
                        Operand::Reg(Reg::A) => Ok(vec![0x32, lo, hi]),
                        Operand::Reg(Reg::Hl) => Ok(vec![0x22, lo, hi]),
                        Operand::Reg(Reg::Bc) => Ok(vec![0xED, 0x43, lo, hi]),
                        Operand::Reg(Reg::De) => Ok(vec![0xED, 0x53, lo, hi]),
                        Operand::Reg(Reg::Sp) => Ok(vec![0xED, 0x73, lo, hi]),
                        Operand::Reg(Reg::Ix) => Ok(vec![0xDD, 0x22, lo, hi]),
                        Operand::Reg(Reg::Iy) => Ok(vec![0xFD, 0x22, lo, hi]),
                        _ => Err(syntax("bad LD (nn) source")),
                    };
                }
                _ => return Err(syntax("bad LD operands")),
            }
        }

        Err(syntax("bad LD operands"))
    }
}

/// Fixed encodings for implied-operand instructions.
fn implied(upper: &str, features: Features) -> Option<Vec<u8>> {
    let bytes: &[u8] = match upper {
        "NOP" => &[0x00],
        "HALT" => &[0x76],
        "DI" => &[0xF3],
        "EI" => &[0xFB],
        "EXX" => &[0xD9],
        "DAA" => &[0x27],
        "CPL" => &[0x2F],
        "SCF" => &[0x37],
        "CCF" => &[0x3F],
        "RLCA" => &[0x07],
        "RLA" => &[0x17],
        "RRCA" => &[0x0F],
        "RRA" => &[0x1F],
        "RET" => &[0xC9],
        "NEG" => &[0xED, 0x44],
        "RETI" => &[0xED, 0x4D],
        "RETN" => &[0xED, 0x45],
        "RLD" => &[0xED, 0x6F],
        "RRD" => &[0xED, 0x67],
        "LDI" => &[0xED, 0xA0],
        "CPI" => &[0xED, 0xA1],
        "INI" => &[0xED, 0xA2],
        "OUTI" => &[0xED, 0xA3],
        "LDD" => &[0xED, 0xA8],
        "CPD" => &[0xED, 0xA9],
        "IND" => &[0xED, 0xAA],
        "OUTD" => &[0xED, 0xAB],
        "LDIR" => &[0xED, 0xB0],
        "CPIR" => &[0xED, 0xB1],
        "INIR" => &[0xED, 0xB2],
        "OTIR" => &[0xED, 0xB3],
        "LDDR" => &[0xED, 0xB8],
        "CPDR" => &[0xED, 0xB9],
        "INDR" => &[0xED, 0xBA],
        "OTDR" => &[0xED, 0xBB],
        _ => {
            if !features.z80n {
                return None;
            }
            match upper {
                "SWAPNIB" => &[0xED, 0x23],
                "MIRROR" => &[0xED, 0x24],
                "OUTINB" => &[0xED, 0x90],
                "PIXELAD" => &[0xED, 0x93],
                "PIXELDN" => &[0xED, 0x94],
                "SETAE" => &[0xED, 0x95],
                "LDIX" => &[0xED, 0xA4],
                "LDWS" => &[0xED, 0xA5],
                "LDDX" => &[0xED, 0xAC],
                "LDIRX" => &[0xED, 0xB4],
                "LDIRSCALE" => &[0xED, 0xB6],
                "LDPIRX" => &[0xED, 0xB7],
                "LDDRX" => &[0xED, 0xBC],
                _ => return None,
            }
        }
    };
    Some(bytes.to_vec())
}

/// A leading `(` only makes the operand a memory reference when its match
/// is the final token.
fn paren_wraps(toks: &[Tok]) -> bool {
    let mut depth = 0usize;
    for (index, tok) in toks.iter().enumerate() {
        match tok {
            Tok::Punct("(") => depth += 1,
            Tok::Punct(")") => {
                depth -= 1;
                if depth == 0 {
                    return index == toks.len() - 1;
                }
            }
            _ => {}
        }
    }
    false
}
