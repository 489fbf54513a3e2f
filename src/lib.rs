//! An execution engine for user-defined CPUs.
//!
//! Machines are described in terms of hardware modules (registers, register arrays,
//! RAMs, condition bits), microinstructions that operate on those modules,
//! and machine instructions made of microinstructions.
//! A built machine executes its fetch/decode/execute cycle one microinstruction at a time,
//! and records enough history to back up.
//!
//! # Usage
//!
//! A machine is described with a [`MachineBuilder`], which validates it on build:
//! ```
//! use cpusim_engine::machine::{MachineBuilder, RunMode, RunState};
//! use cpusim_engine::machine::hw::{ConditionBit, Ram, Register};
//! use cpusim_engine::machine::instr::{Field, MachineInstruction};
//! use cpusim_engine::machine::micro::{AccessDirection, Micro, MicroOp};
//!
//! let mut b = MachineBuilder::new();
//! let pc = b.add_register(Register::new("pc", 8));
//! let ir = b.add_register(Register::new("ir", 8));
//! let status = b.add_register(Register::new("status", 1));
//! let halt = b.add_condition_bit(ConditionBit::new("halt", status, 0).with_halt(true));
//! let mem = b.add_ram(Ram::new("mem", 256, 8));
//!
//! let read = b.add_micro(Micro::new("ir<-m[pc]", MicroOp::MemoryAccess {
//!     direction: AccessDirection::Read, memory: mem, data: ir.into(), address: pc.into()
//! }));
//! let inc = b.add_micro(Micro::new("pc++", MicroOp::Increment {
//!     register: pc.into(), delta: 1, overflow_bit: None, carry_bit: None
//! }));
//! let decode = b.add_micro(Micro::new("decode", MicroOp::Decode { ir: ir.into() }));
//! let set_halt = b.add_micro(Micro::new("set-halt", MicroOp::SetCondBit { bit: halt, value: true }));
//! b.set_fetch_sequence(vec![read, inc, decode]);
//!
//! let op = b.add_field(Field::new("op", 8));
//! b.add_instruction(MachineInstruction::new("nop", 0, vec![op]));
//! b.add_instruction(MachineInstruction::new("halt", 1, vec![op]).with_micros(vec![set_halt]));
//!
//! let mut machine = b.build().unwrap();
//! machine.load_words(mem, 0, &[0, 0, 1], 8).unwrap();
//!
//! assert_eq!(machine.run(), Ok(RunState::Halted));
//! assert_eq!(machine.hw()[pc].value(), 3);
//! ```
//!
//! For more granularity, there are step modes and backing up.
//! See the [`machine`] module for more details.
#![warn(missing_docs)]

pub mod bits;
pub mod err;
pub mod machine;
