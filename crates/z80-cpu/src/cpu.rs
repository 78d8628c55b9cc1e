//! Z80 CPU value type and public execution interface.

mod exec;

use crate::bus::{Bus, Debugger, Events, NullDebugger, NullEvents};
use crate::registers::Registers;
use crate::state::State;

use exec::Exec;

/// Index-addressing mode for the instruction currently being decoded.
///
/// Set by the DD/FD prefix bytes, reset to `Hl` at every instruction
/// boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IndexMode {
    #[default]
    Hl,
    Ix,
    Iy,
}

/// The Z80 CPU.
///
/// Owns the register file and interrupt latches. Memory, the event
/// scheduler and the debugger are external collaborators handed to
/// [`Z80::run`] and [`Z80::step`] per call.
#[derive(Debug, Clone)]
pub struct Z80 {
    pub regs: Registers,

    /// NMI latch, cleared on acceptance.
    pub nmi_pending: bool,
    /// Maskable interrupt latch, cleared on acceptance.
    pub irq_requested: bool,
    /// Data byte the interrupting device drives onto the bus.
    pub irq_data: u8,
    /// True for exactly the one instruction following EI.
    pub ei_delay: bool,
    /// Set by RETI, visible until the next instruction boundary.
    pub reti_signaled: bool,
    /// Per-instruction decoder state.
    pub index_mode: IndexMode,

    /// Monotonic T-state counter.
    pub ticks: u64,

    /// Informational shadow of the address lines, updated per bus cycle.
    pub address_bus: u16,
    /// Informational shadow of the data lines, updated per bus cycle.
    pub data_bus: u8,

    /// Bytes consumed by the current instruction, prefixes included.
    opcodes: Vec<u8>,
}

impl Default for Z80 {
    fn default() -> Self {
        Self::new()
    }
}

impl Z80 {
    #[must_use]
    pub fn new() -> Self {
        let mut cpu = Self {
            regs: Registers::default(),
            nmi_pending: false,
            irq_requested: false,
            irq_data: 0,
            ei_delay: false,
            reti_signaled: false,
            index_mode: IndexMode::Hl,
            ticks: 0,
            address_bus: 0,
            data_bus: 0,
            opcodes: Vec::with_capacity(8),
        };
        cpu.reset_registers();
        cpu
    }

    fn reset_registers(&mut self) {
        self.regs = Registers::default();
        self.regs.sp = 0xFFFF;
        self.nmi_pending = false;
        self.irq_requested = false;
        self.irq_data = 0;
        self.ei_delay = false;
        self.reti_signaled = false;
        self.index_mode = IndexMode::Hl;
        self.ticks = 0;
        self.opcodes.clear();
    }

    /// Reset the CPU and its collaborators.
    pub fn reset(
        &mut self,
        bus: &mut impl Bus,
        events: &mut impl Events,
        debugger: &mut impl Debugger,
    ) {
        self.reset_registers();
        bus.reset();
        events.reset();
        debugger.reset();
    }

    /// Latch a maskable interrupt request carrying `data`.
    pub const fn request_interrupt(&mut self, data: u8) {
        self.irq_requested = true;
        self.irq_data = data;
    }

    /// Latch a non-maskable interrupt request.
    pub const fn request_nmi(&mut self) {
        self.nmi_pending = true;
    }

    /// Execute instructions until the tick counter reaches `tick_limit`.
    /// Returns the elapsed tick count.
    pub fn run(&mut self, bus: &mut impl Bus, tick_limit: u64) -> u64 {
        self.run_with(bus, &mut NullEvents, &mut NullDebugger, tick_limit)
    }

    /// Execute exactly one instruction, plus any interrupt taken at its
    /// tail. Returns the elapsed tick count.
    pub fn step(&mut self, bus: &mut impl Bus) -> u64 {
        self.step_with(bus, &mut NullEvents, &mut NullDebugger)
    }

    /// [`Z80::run`] with an event scheduler and debugger attached.
    pub fn run_with(
        &mut self,
        bus: &mut impl Bus,
        events: &mut impl Events,
        debugger: &mut impl Debugger,
        tick_limit: u64,
    ) -> u64 {
        Exec { cpu: self, bus, events, debugger }.operate(false, tick_limit)
    }

    /// [`Z80::step`] with an event scheduler and debugger attached.
    pub fn step_with(
        &mut self,
        bus: &mut impl Bus,
        events: &mut impl Events,
        debugger: &mut impl Debugger,
    ) -> u64 {
        Exec { cpu: self, bus, events, debugger }.operate(true, 0)
    }

    /// Snapshot every architectural and internal field.
    #[must_use]
    pub const fn save_state(&self) -> State {
        State {
            regs: self.regs,
            nmi_pending: self.nmi_pending,
            irq_requested: self.irq_requested,
            irq_data: self.irq_data,
            ei_delay: self.ei_delay,
            reti_signaled: self.reti_signaled,
            index_mode: self.index_mode,
            ticks: self.ticks,
            address_bus: self.address_bus,
            data_bus: self.data_bus,
        }
    }

    /// Restore a snapshot taken by [`Z80::save_state`].
    pub const fn restore_state(&mut self, state: &State) {
        self.regs = state.regs;
        self.nmi_pending = state.nmi_pending;
        self.irq_requested = state.irq_requested;
        self.irq_data = state.irq_data;
        self.ei_delay = state.ei_delay;
        self.reti_signaled = state.reti_signaled;
        self.index_mode = state.index_mode;
        self.ticks = state.ticks;
        self.address_bus = state.address_bus;
        self.data_bus = state.data_bus;
    }
}
