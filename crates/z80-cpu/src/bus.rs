//! Collaborator interfaces: memory/IO bus, event scheduler, debugger.
//!
//! The CPU never stores references to its collaborators; they are handed to
//! `run`/`step` as explicit arguments, so no back-pointer handshake exists.

/// Memory and I/O bus.
///
/// The only collaborator allowed to touch memory and ports. Addressing
/// policy (RAM vs ROM vs devices) is entirely the bus's concern; from the
/// CPU's point of view every access succeeds.
pub trait Bus {
    /// Reset bus-side state.
    fn reset(&mut self) {}

    /// Read a byte from memory.
    fn read(&mut self, address: u16) -> u8;

    /// Write a byte to memory.
    fn write(&mut self, address: u16, value: u8);

    /// Read a byte from an I/O port. The full 16-bit address bus carries
    /// the port: B in the top byte for the IN/OUT (C) family, A for
    /// IN/OUT (n).
    fn input(&mut self, port: u16) -> u8;

    /// Write a byte to an I/O port.
    fn output(&mut self, port: u16, value: u8);

    /// Non-observable read used by debuggers and test harnesses.
    fn peek(&self, address: u16) -> u8;
}

/// Event scheduler consulted whenever the tick counter advances.
///
/// The default implementation reports an unreachable deadline, which keeps
/// the hot path a single predictable compare.
pub trait Events {
    /// Reset scheduler state.
    fn reset(&mut self) {}

    /// Tick count of the next event deadline.
    fn event_limit(&self) -> u64 {
        u64::MAX
    }

    /// Called synchronously when the tick counter crosses the deadline.
    fn handle_event(&mut self, _current_ticks: u64) {}
}

/// Debugger notified at instruction and interrupt boundaries.
///
/// `opcodes` is the byte sequence consumed for the instruction in program
/// order, prefixes included.
pub trait Debugger {
    /// Reset debugger state.
    fn reset(&mut self) {}

    /// After any prefix bytes are consumed, before the opcode body runs.
    fn before_step(&mut self, _opcodes: &[u8]) {}

    /// After the body and any displacement write-back.
    fn after_step(&mut self, _opcodes: &[u8]) {}

    /// Maskable interrupt acceptance boundary.
    fn before_irq(&mut self) {}
    fn after_irq(&mut self) {}

    /// Non-maskable interrupt acceptance boundary.
    fn before_nmi(&mut self) {}
    fn after_nmi(&mut self) {}
}

/// Trivial event scheduler: never fires.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullEvents;

impl Events for NullEvents {}

/// Trivial debugger: ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullDebugger;

impl Debugger for NullDebugger {}

/// Flat 64 KiB RAM with a value-per-port I/O map.
///
/// The reference bus used by the test suites and by the assembler's
/// integration tests.
pub struct FlatBus {
    pub ram: Box<[u8; 0x10000]>,
    /// Value returned for IN on each port; defaults to 0xFF.
    pub ports: Box<[u8; 0x10000]>,
    /// Log of (port, value) pairs written by OUT.
    pub port_writes: Vec<(u16, u8)>,
}

impl Default for FlatBus {
    fn default() -> Self {
        Self::new()
    }
}

impl FlatBus {
    #[must_use]
    pub fn new() -> Self {
        Self {
            ram: vec![0u8; 0x10000].into_boxed_slice().try_into().expect("64K"),
            ports: vec![0xFFu8; 0x10000].into_boxed_slice().try_into().expect("64K"),
            port_writes: Vec::new(),
        }
    }

    /// Load bytes starting at `address`, wrapping at 64 KiB.
    pub fn load(&mut self, address: u16, bytes: &[u8]) {
        for (offset, &byte) in bytes.iter().enumerate() {
            self.ram[address.wrapping_add(offset as u16) as usize] = byte;
        }
    }
}

impl Bus for FlatBus {
    fn read(&mut self, address: u16) -> u8 {
        self.ram[address as usize]
    }

    fn write(&mut self, address: u16, value: u8) {
        self.ram[address as usize] = value;
    }

    fn input(&mut self, port: u16) -> u8 {
        self.ports[port as usize]
    }

    fn output(&mut self, port: u16, value: u8) {
        self.port_writes.push((port, value));
    }

    fn peek(&self, address: u16) -> u8 {
        self.ram[address as usize]
    }
}
