//! Peephole optimizer: named, individually toggleable byte-level rewrites
//! applied at emission time, with a cumulative bytes/cycles ledger.

use std::collections::HashSet;

use log::trace;

use crate::assembler::{Driver, JumpInfo};

/// Kind of branch an instruction encodes, for threading and conversion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Branch {
    /// JP nn / JP cc, nn
    Absolute { cc: Option<u8> },
    /// JR e / JR cc, e
    Relative { cc: Option<u8> },
    /// DJNZ e
    Djnz,
}

fn classify(bytes: &[u8]) -> Option<(Branch, u16)> {
    match bytes {
        [0xC3, lo, hi] => Some((Branch::Absolute { cc: None }, u16::from_le_bytes([*lo, *hi]))),
        [op, lo, hi] if op & 0xC7 == 0xC2 => Some((
            Branch::Absolute { cc: Some((op >> 3) & 7) },
            u16::from_le_bytes([*lo, *hi]),
        )),
        _ => None,
    }
}

fn classify_relative(bytes: &[u8], address: u16) -> Option<(Branch, u16)> {
    let target = |d: u8| address.wrapping_add(2).wrapping_add(d as i8 as u16);
    match bytes {
        [0x18, d] => Some((Branch::Relative { cc: None }, target(*d))),
        [op, d] if op & 0xE7 == 0x20 => {
            Some((Branch::Relative { cc: Some((op >> 3) & 3) }, target(*d)))
        }
        [0x10, d] => Some((Branch::Djnz, target(*d))),
        _ => None,
    }
}

/// Documented T-state cost of the instruction shapes the rewrites touch.
/// Conditional branches are charged at their taken cost.
fn cycle_cost(bytes: &[u8]) -> i64 {
    match bytes {
        [] => 0,
        [0x3E, _] => 7,
        [op, _] if matches!(op, 0xC6 | 0xCE | 0xD6 | 0xDE | 0xE6 | 0xEE | 0xF6 | 0xFE) => 7,
        [0xCB, _] => 8,
        [0xCD, _, _] => 17,
        [op] if op & 0xC7 == 0xC7 => 11, // RST
        [0xC3, _, _] => 10,
        [op, _, _] if op & 0xC7 == 0xC2 => 10,
        [0x18, _] => 12,
        [op, _] if op & 0xE7 == 0x20 => 12,
        [0x10, _] => 13,
        [op] if (0x40..=0x7F).contains(op) => 4, // LD r, r'
        [_] => 4,
        _ => 0,
    }
}

impl Driver<'_> {
    /// Apply enabled rewrites to one encoded instruction, account for the
    /// savings, register any branch for the next pass, and emit.
    pub(crate) fn optimize_and_emit(&mut self, bytes: Vec<u8>) {
        let address = self.stmt_logical;
        let optimized = if self.config.compilation.enable_optimization {
            self.rewrite(bytes.clone(), address)
        } else {
            bytes.clone()
        };

        if self.emitting && optimized != bytes {
            self.stats.bytes_saved += bytes.len() as i64 - optimized.len() as i64;
            self.stats.cycles_saved += cycle_cost(&bytes) - cycle_cost(&optimized);
            trace!(
                "peephole at {address:#06X}: {bytes:02X?} -> {optimized:02X?}"
            );
        }

        // Record the (post-rewrite) branch for next-pass jump threading.
        let info = classify(&optimized)
            .or_else(|| classify_relative(&optimized, address))
            .map(|(branch, target)| JumpInfo {
                target,
                unconditional: matches!(
                    branch,
                    Branch::Absolute { cc: None } | Branch::Relative { cc: None }
                ),
            });
        if let Some(info) = info {
            self.jump_cur.insert(address, info);
        }

        self.emit_bytes(&optimized, true);
    }

    fn rewrite(&mut self, bytes: Vec<u8>, address: u16) -> Vec<u8> {
        let flags = self.optimize;
        let mut bytes = bytes;

        // Dead code: LD r, r and JR to the next instruction.
        if flags.dce {
            match bytes.as_slice() {
                [0x40 | 0x49 | 0x52 | 0x5B | 0x64 | 0x6D | 0x7F] => return Vec::new(),
                [0x18, 0x00] => return Vec::new(),
                _ => {}
            }
        }

        // Operator idioms.
        let idiom: Option<Vec<u8>> = match bytes.as_slice() {
            [0x3E, 0x00] if flags.ops_xor => Some(vec![0xAF]),
            [0xC6, 0x01] | [0xD6, 0xFF] if flags.ops_inc => Some(vec![0x3C]),
            [0xD6, 0x01] | [0xC6, 0xFF] if flags.ops_inc => Some(vec![0x3D]),
            [0xFE, 0x00] if flags.ops_or => Some(vec![0xB7]),
            [0xC6, 0x00] if flags.ops_add0 => Some(vec![0xB7]),
            [0xE6, 0x00] if flags.ops_logic => Some(vec![0xAF]),
            [0xF6, 0x00] | [0xEE, 0x00] if flags.ops_logic => Some(vec![0xB7]),
            [0xCB, 0x27] if flags.ops_sla => Some(vec![0x87]),
            [0xCB, 0x07] if flags.ops_rot => Some(vec![0x07]),
            [0xCB, 0x0F] if flags.ops_rot => Some(vec![0x0F]),
            [0xCB, 0x17] if flags.ops_rot => Some(vec![0x17]),
            [0xCB, 0x1F] if flags.ops_rot => Some(vec![0x1F]),
            [0xCD, lo, 0x00] if flags.ops_rst && lo & !0x38 == 0 => Some(vec![0xC7 | lo]),
            _ => None,
        };
        if let Some(idiom) = idiom {
            bytes = idiom;
        }

        // Branch transformations.
        let branch = classify(&bytes).or_else(|| classify_relative(&bytes, address));
        let Some((kind, mut target)) = branch else {
            return bytes;
        };

        if flags.jump_thread {
            target = self.thread(address, target, kind, flags.branch_long);
        }

        let in_jr_range = |target: u16| {
            let offset = i32::from(target) - (i32::from(address) + 2);
            (-128..=127).contains(&offset)
        };
        let jr_disp =
            |target: u16| (i32::from(target) - (i32::from(address) + 2)) as u8;

        match kind {
            Branch::Absolute { cc } => {
                let convertible = cc.is_none_or(|code| code < 4);
                if flags.branch_short && convertible && in_jr_range(target) {
                    let opcode = match cc {
                        None => 0x18,
                        Some(code) => 0x20 | (code << 3),
                    };
                    return vec![opcode, jr_disp(target)];
                }
                let opcode = match cc {
                    None => 0xC3,
                    Some(code) => 0xC2 | (code << 3),
                };
                vec![opcode, target as u8, (target >> 8) as u8]
            }
            Branch::Relative { cc } => {
                if !in_jr_range(target) && flags.branch_long {
                    let opcode = match cc {
                        None => 0xC3,
                        Some(code) => 0xC2 | (code << 3),
                    };
                    return vec![opcode, target as u8, (target >> 8) as u8];
                }
                let opcode = match cc {
                    None => 0x18,
                    Some(code) => 0x20 | (code << 3),
                };
                vec![opcode, jr_disp(target)]
            }
            Branch::Djnz => vec![0x10, jr_disp(target)],
        }
    }

    /// Follow chains of unconditional jumps recorded in the previous pass.
    ///
    /// A conditional instruction at a target is a barrier. A loop resolves
    /// to the instruction's own address. Relative branches fall back to
    /// the deepest in-range link unless BRANCH_LONG may widen them.
    fn thread(&self, address: u16, first: u16, kind: Branch, may_widen: bool) -> u16 {
        let relative = matches!(kind, Branch::Relative { .. } | Branch::Djnz);
        let mut chain = vec![first];
        let mut visited: HashSet<u16> = HashSet::from([address, first]);
        let mut target = first;
        loop {
            match self.jump_prev.get(&target) {
                Some(info) if info.unconditional => {
                    if visited.contains(&info.target) {
                        // Cycle: the jump can only reach itself.
                        return address;
                    }
                    visited.insert(info.target);
                    chain.push(info.target);
                    target = info.target;
                }
                _ => break,
            }
        }
        if !relative || matches!(kind, Branch::Relative { .. }) && may_widen {
            return target;
        }
        let in_range = |candidate: &&u16| {
            let offset = i32::from(**candidate) - (i32::from(address) + 2);
            (-128..=127).contains(&offset)
        };
        chain.iter().rev().find(in_range).copied().unwrap_or(first)
    }
}
