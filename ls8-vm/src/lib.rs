//! LS-8 virtual machine
//!
//! The LS-8 is an 8-bit register machine: 256 bytes of RAM, eight
//! general-purpose registers, a condition-flag register, and a downward
//! growing stack addressed through register 7. Instructions are one opcode
//! byte followed by zero, one, or two operand bytes.
#![warn(missing_docs)]
#![forbid(unsafe_code)]

use core::fmt::Write;

use log::{log_enabled, trace, Level};
use thiserror::Error;

pub mod program;

/// Size of machine memory, in bytes
pub const RAM_SIZE: usize = 256;

/// Number of general-purpose registers
pub const NUM_REGISTERS: usize = 8;

/// Index of the register holding the stack pointer
pub const SP: u8 = 7;

/// Initial top-of-stack address; the stack grows downward from here
pub const STACK_BASE: u8 = 0xF4;

/// Fatal machine errors
///
/// Every variant is fatal to the machine instance that raised it; there is
/// no resynchronization or retry.
#[derive(Copy, Clone, Debug, Error, PartialEq, Eq)]
pub enum Error {
    /// A memory access was outside the 256-byte address space
    #[error("memory address {addr:#05x} is out of range")]
    OutOfRange {
        /// The offending address
        addr: u16,
    },

    /// An operand byte named a register outside `0..8`
    #[error("register index {index} is out of range")]
    InvalidRegister {
        /// The offending register index
        index: u8,
    },

    /// The fetched opcode byte has no assigned instruction
    #[error("invalid opcode {op:#04x} at {addr:#05x}")]
    InvalidOpcode {
        /// The unassigned opcode byte
        op: u8,
        /// Address it was fetched from
        addr: u16,
    },

    /// A POP or RET ran with nothing left on the stack
    #[error("stack underflow with stack pointer at {sp:#04x}")]
    StackUnderflow {
        /// Stack pointer at the time of the pop
        sp: u8,
    },

    /// A PUSH or CALL ran with the stack pointer already at address 0
    #[error("stack overflow with stack pointer at {sp:#04x}")]
    StackOverflow {
        /// Stack pointer at the time of the push
        sp: u8,
    },
}

/// The fixed opcode assignments
///
/// The discriminants are the on-the-wire bit patterns used by program
/// images, so they must not be renumbered.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Opcode {
    /// Set a register to an immediate value
    Ldi = 0b1000_0010,
    /// Emit a register value to the output device
    Prn = 0b0100_0111,
    /// Add two registers, storing into the first
    Add = 0b1010_0000,
    /// Multiply two registers, storing into the first
    Mul = 0b1010_0010,
    /// Store the second register at the address held in the first
    St = 0b1000_0100,
    /// Push a register value onto the stack
    Push = 0b0100_0101,
    /// Pop the top of the stack into a register
    Pop = 0b0100_0110,
    /// Call the subroutine whose address is held in a register
    Call = 0b0101_0000,
    /// Return from a subroutine
    Ret = 0b0001_0001,
    /// Compare two registers, setting the condition flags
    Cmp = 0b1010_0111,
    /// Jump if the equal flag is set
    Jeq = 0b0101_0101,
    /// Jump if the equal flag is clear
    Jne = 0b0101_0110,
    /// Unconditional jump
    Jmp = 0b0101_0100,
    /// Halt the machine
    Hlt = 0b0000_0001,
}

impl TryFrom<u8> for Opcode {
    type Error = u8;
    fn try_from(v: u8) -> Result<Self, u8> {
        let op = match v {
            0b1000_0010 => Opcode::Ldi,
            0b0100_0111 => Opcode::Prn,
            0b1010_0000 => Opcode::Add,
            0b1010_0010 => Opcode::Mul,
            0b1000_0100 => Opcode::St,
            0b0100_0101 => Opcode::Push,
            0b0100_0110 => Opcode::Pop,
            0b0101_0000 => Opcode::Call,
            0b0001_0001 => Opcode::Ret,
            0b1010_0111 => Opcode::Cmp,
            0b0101_0101 => Opcode::Jeq,
            0b0101_0110 => Opcode::Jne,
            0b0101_0100 => Opcode::Jmp,
            0b0000_0001 => Opcode::Hlt,
            _ => return Err(v),
        };
        Ok(op)
    }
}

/// Byte-addressable machine memory with bounds-checked access
///
/// Addresses are carried as `u16` so that fetch-window arithmetic past the
/// end of memory surfaces as [`Error::OutOfRange`] instead of wrapping.
pub struct Ram([u8; RAM_SIZE]);

impl Ram {
    /// Builds a zero-initialized RAM
    pub fn new() -> Self {
        Ram([0u8; RAM_SIZE])
    }

    /// Reads the byte at `addr`
    pub fn read(&self, addr: u16) -> Result<u8, Error> {
        self.0
            .get(usize::from(addr))
            .copied()
            .ok_or(Error::OutOfRange { addr })
    }

    /// Writes a byte to `addr`
    pub fn write(&mut self, addr: u16, v: u8) -> Result<(), Error> {
        *self
            .0
            .get_mut(usize::from(addr))
            .ok_or(Error::OutOfRange { addr })? = v;
        Ok(())
    }
}

impl Default for Ram {
    fn default() -> Self {
        Self::new()
    }
}

/// The general-purpose register file
///
/// Register indices arrive as untrusted program bytes, so `get` and `set`
/// range-check them.
pub struct Registers([u8; NUM_REGISTERS]);

impl Registers {
    fn new() -> Self {
        let mut reg = Registers([0u8; NUM_REGISTERS]);
        reg.0[usize::from(SP)] = STACK_BASE;
        reg
    }

    /// Reads the register at `index`
    pub fn get(&self, index: u8) -> Result<u8, Error> {
        self.0
            .get(usize::from(index))
            .copied()
            .ok_or(Error::InvalidRegister { index })
    }

    /// Writes the register at `index`
    pub fn set(&mut self, index: u8, v: u8) -> Result<(), Error> {
        *self
            .0
            .get_mut(usize::from(index))
            .ok_or(Error::InvalidRegister { index })? = v;
        Ok(())
    }
}

/// Condition flags, produced atomically by CMP
///
/// Flags persist until the next CMP; nothing else touches them. `equal` is
/// a true equality test, computed independently of `less` and `greater`.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct Flags {
    /// First operand was strictly greater
    pub greater: bool,
    /// First operand was strictly less
    pub less: bool,
    /// Operands were equal
    pub equal: bool,
}

/// Pure arithmetic and compare operations over register values
pub mod alu {
    use super::Flags;

    /// 8-bit addition; overflow wraps
    #[inline]
    pub fn add(a: u8, b: u8) -> u8 {
        a.wrapping_add(b)
    }

    /// 8-bit multiplication; overflow wraps
    #[inline]
    pub fn mul(a: u8, b: u8) -> u8 {
        a.wrapping_mul(b)
    }

    /// Compares two values, producing a full flag set
    #[inline]
    pub fn compare(a: u8, b: u8) -> Flags {
        Flags {
            greater: a > b,
            less: a < b,
            equal: a == b,
        }
    }
}

/// Output sink for the `PRN` instruction
pub trait Device {
    /// Handles a register value emitted by `PRN`
    ///
    /// Emissions arrive in program order, one call per `PRN` executed.
    fn prn(&mut self, value: u8);
}

/// Device which does nothing
pub struct EmptyDevice;
impl Device for EmptyDevice {
    fn prn(&mut self, _value: u8) {
        // nothing to do here
    }
}

/// Console device which buffers emitted values as decimal lines
#[derive(Default)]
pub struct Console {
    out: Vec<u8>,
}

impl Console {
    /// Builds a console with an empty output buffer
    pub fn new() -> Self {
        Self::default()
    }

    /// Takes the output buffer, leaving it empty
    pub fn take_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.out)
    }
}

impl Device for Console {
    fn prn(&mut self, value: u8) {
        self.out.extend_from_slice(value.to_string().as_bytes());
        self.out.push(b'\n');
    }
}

/// Execution state of the machine
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Status {
    /// The machine will execute another instruction when stepped
    Running,
    /// The machine executed HLT; further steps are no-ops
    Halted,
}

/// The machine itself: memory, registers, flags, and program counter
pub struct Cpu {
    ram: Ram,
    reg: Registers,
    flags: Flags,
    pc: u16,
    status: Status,
}

impl Cpu {
    /// Builds a fresh machine
    ///
    /// Memory and registers are zeroed, except for the stack pointer, which
    /// starts at [`STACK_BASE`]. The program counter starts at 0.
    pub fn new() -> Self {
        Self {
            ram: Ram::new(),
            reg: Registers::new(),
            flags: Flags::default(),
            pc: 0,
            status: Status::Running,
        }
    }

    /// Writes a program image into memory starting at address 0
    pub fn load(&mut self, image: &[u8]) -> Result<(), Error> {
        for (addr, byte) in (0u16..).zip(image) {
            self.ram.write(addr, *byte)?;
        }
        Ok(())
    }

    /// Shared borrow of machine memory
    pub fn ram(&self) -> &Ram {
        &self.ram
    }

    /// Shared borrow of the register file
    pub fn registers(&self) -> &Registers {
        &self.reg
    }

    /// Current condition flags
    pub fn flags(&self) -> Flags {
        self.flags
    }

    /// Current program counter
    pub fn pc(&self) -> u16 {
        self.pc
    }

    /// Current execution state
    pub fn status(&self) -> Status {
        self.status
    }

    /// Executes a single fetch–decode–execute cycle
    ///
    /// The fetch window is a fixed three bytes: the opcode and two operand
    /// slots, all bounds-checked. Operand slots not used by an instruction
    /// are read but ignored. Stepping a halted machine is a no-op.
    pub fn step<D: Device>(&mut self, dev: &mut D) -> Result<Status, Error> {
        if self.status == Status::Halted {
            return Ok(Status::Halted);
        }
        if log_enabled!(Level::Trace) {
            trace!("{}", self.trace());
        }
        let pc = self.pc;
        let byte = self.ram.read(pc)?;
        let a = self.ram.read(pc + 1)?;
        let b = self.ram.read(pc + 2)?;
        let op = Opcode::try_from(byte)
            .map_err(|op| Error::InvalidOpcode { op, addr: pc })?;
        let next = match op {
            Opcode::Ldi => op::ldi(self, dev, a, b),
            Opcode::Prn => op::prn(self, dev, a, b),
            Opcode::Add => op::add(self, dev, a, b),
            Opcode::Mul => op::mul(self, dev, a, b),
            Opcode::St => op::st(self, dev, a, b),
            Opcode::Push => op::push(self, dev, a, b),
            Opcode::Pop => op::pop(self, dev, a, b),
            Opcode::Call => op::call(self, dev, a, b),
            Opcode::Ret => op::ret(self, dev, a, b),
            Opcode::Cmp => op::cmp(self, dev, a, b),
            Opcode::Jeq => op::jeq(self, dev, a, b),
            Opcode::Jne => op::jne(self, dev, a, b),
            Opcode::Jmp => op::jmp(self, dev, a, b),
            Opcode::Hlt => op::hlt(self, dev, a, b),
        }?;
        match next {
            Some(pc) => {
                self.pc = pc;
                Ok(Status::Running)
            }
            None => {
                self.status = Status::Halted;
                Ok(Status::Halted)
            }
        }
    }

    /// Runs the machine until it halts
    ///
    /// A program that never executes HLT runs forever; callers that need a
    /// bound should drive [`Cpu::step`] themselves.
    pub fn run<D: Device>(&mut self, dev: &mut D) -> Result<(), Error> {
        while self.step(dev)? == Status::Running {}
        Ok(())
    }

    /// Renders the program counter, fetch window, and registers as one line
    ///
    /// Purely observational; window bytes past the end of memory render
    /// as zero.
    pub fn trace(&self) -> String {
        let w: Vec<u8> = (0..3)
            .map(|i| self.ram.read(self.pc + i).unwrap_or(0))
            .collect();
        let mut s = format!(
            "TRACE: {:02X} | {:02X} {:02X} {:02X} |",
            self.pc, w[0], w[1], w[2]
        );
        for r in &self.reg.0 {
            write!(s, " {r:02X}").unwrap();
        }
        s
    }
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new()
    }
}

mod op {
    use super::*;

    /// Pushes a byte onto the stack, moving the stack pointer down
    fn push_byte(vm: &mut Cpu, v: u8) -> Result<(), Error> {
        let sp = vm.reg.get(SP)?;
        let sp = sp.checked_sub(1).ok_or(Error::StackOverflow { sp })?;
        vm.reg.set(SP, sp)?;
        vm.ram.write(sp.into(), v)
    }

    /// Pops a byte off the stack, moving the stack pointer up
    ///
    /// The stack region is `[0, STACK_BASE)`; a pop with the stack pointer
    /// at or above the base is an unmatched POP/RET.
    fn pop_byte(vm: &mut Cpu) -> Result<u8, Error> {
        let sp = vm.reg.get(SP)?;
        if sp >= STACK_BASE {
            return Err(Error::StackUnderflow { sp });
        }
        let v = vm.ram.read(sp.into())?;
        vm.reg.set(SP, sp + 1)?;
        Ok(v)
    }

    /// Load Immediate
    ///
    /// ```text
    /// LDI reg value
    /// ```
    ///
    /// Sets `reg` to `value`.
    pub fn ldi(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        b: u8,
    ) -> Result<Option<u16>, Error> {
        vm.reg.set(a, b)?;
        Ok(Some(vm.pc + 3))
    }

    /// Print Numeric
    ///
    /// ```text
    /// PRN reg
    /// ```
    ///
    /// Emits the value in `reg` to the output device.
    pub fn prn(
        vm: &mut Cpu,
        dev: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        dev.prn(vm.reg.get(a)?);
        Ok(Some(vm.pc + 2))
    }

    /// Add
    ///
    /// ```text
    /// ADD regA regB
    /// ```
    ///
    /// Sets `regA` to the sum of the two register values, wrapping at 8-bit
    /// width.
    pub fn add(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        b: u8,
    ) -> Result<Option<u16>, Error> {
        let v = alu::add(vm.reg.get(a)?, vm.reg.get(b)?);
        vm.reg.set(a, v)?;
        Ok(Some(vm.pc + 3))
    }

    /// Multiply
    ///
    /// ```text
    /// MUL regA regB
    /// ```
    ///
    /// Sets `regA` to the product of the two register values, wrapping at
    /// 8-bit width.
    pub fn mul(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        b: u8,
    ) -> Result<Option<u16>, Error> {
        let v = alu::mul(vm.reg.get(a)?, vm.reg.get(b)?);
        vm.reg.set(a, v)?;
        Ok(Some(vm.pc + 3))
    }

    /// Store
    ///
    /// ```text
    /// ST regA regB
    /// ```
    ///
    /// Writes the value in `regB` to the memory address held in `regA`.
    /// Advances the program counter by 2, leaving the `regB` operand byte in
    /// the next fetch window.
    pub fn st(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        b: u8,
    ) -> Result<Option<u16>, Error> {
        let addr = vm.reg.get(a)?;
        vm.ram.write(addr.into(), vm.reg.get(b)?)?;
        Ok(Some(vm.pc + 2))
    }

    /// Push
    ///
    /// ```text
    /// PUSH reg
    /// ```
    ///
    /// Decrements the stack pointer and writes the value in `reg` to the new
    /// stack top.
    pub fn push(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        let v = vm.reg.get(a)?;
        push_byte(vm, v)?;
        Ok(Some(vm.pc + 2))
    }

    /// Pop
    ///
    /// ```text
    /// POP reg
    /// ```
    ///
    /// Reads the stack top into `reg` and increments the stack pointer.
    pub fn pop(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        let v = pop_byte(vm)?;
        vm.reg.set(a, v)?;
        Ok(Some(vm.pc + 2))
    }

    /// Call
    ///
    /// ```text
    /// CALL reg
    /// ```
    ///
    /// Pushes the address of the next instruction onto the stack, then jumps
    /// to the address held in `reg`.
    pub fn call(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        let ret_addr = vm.pc + 2;
        let ret_addr = u8::try_from(ret_addr)
            .map_err(|_| Error::OutOfRange { addr: ret_addr })?;
        push_byte(vm, ret_addr)?;
        Ok(Some(vm.reg.get(a)?.into()))
    }

    /// Return
    ///
    /// ```text
    /// RET
    /// ```
    ///
    /// Pops the return address off the stack into the program counter.
    pub fn ret(
        vm: &mut Cpu,
        _: &mut dyn Device,
        _: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        let v = pop_byte(vm)?;
        Ok(Some(v.into()))
    }

    /// Compare
    ///
    /// ```text
    /// CMP regA regB
    /// ```
    ///
    /// Compares the two register values and stores the full flag set.
    pub fn cmp(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        b: u8,
    ) -> Result<Option<u16>, Error> {
        vm.flags = alu::compare(vm.reg.get(a)?, vm.reg.get(b)?);
        Ok(Some(vm.pc + 3))
    }

    /// Jump if Equal
    ///
    /// ```text
    /// JEQ reg
    /// ```
    ///
    /// Jumps to the address held in `reg` if the equal flag is set;
    /// otherwise falls through, skipping one operand byte.
    pub fn jeq(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        if vm.flags.equal {
            Ok(Some(vm.reg.get(a)?.into()))
        } else {
            Ok(Some(vm.pc + 2))
        }
    }

    /// Jump if Not Equal
    ///
    /// ```text
    /// JNE reg
    /// ```
    ///
    /// Jumps to the address held in `reg` if the equal flag is clear;
    /// otherwise falls through, skipping one operand byte.
    pub fn jne(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        if !vm.flags.equal {
            Ok(Some(vm.reg.get(a)?.into()))
        } else {
            Ok(Some(vm.pc + 2))
        }
    }

    /// Jump
    ///
    /// ```text
    /// JMP reg
    /// ```
    ///
    /// Jumps unconditionally to the address held in `reg`.
    pub fn jmp(
        vm: &mut Cpu,
        _: &mut dyn Device,
        a: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        Ok(Some(vm.reg.get(a)?.into()))
    }

    /// Halt
    ///
    /// ```text
    /// HLT
    /// ```
    ///
    /// Stops the machine. This is the only way execution terminates.
    pub fn hlt(
        _: &mut Cpu,
        _: &mut dyn Device,
        _: u8,
        _: u8,
    ) -> Result<Option<u16>, Error> {
        Ok(None)
    }
}
