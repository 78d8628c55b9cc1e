//! Opaque CPU state descriptor for exact save/restore round trips.

use crate::cpu::IndexMode;
use crate::registers::Registers;

/// A complete snapshot of the interpreter's architectural and internal
/// state. `save_state` followed by `restore_state` is the identity; the
/// regression harness compares snapshots field for field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct State {
    pub regs: Registers,
    pub nmi_pending: bool,
    pub irq_requested: bool,
    pub irq_data: u8,
    pub ei_delay: bool,
    pub reti_signaled: bool,
    pub index_mode: IndexMode,
    pub ticks: u64,
    pub address_bus: u16,
    pub data_bus: u8,
}
