//! Scenarios on a small accumulator machine.
//!
//! Instructions are 16 bits: a 4-bit opcode and a 12-bit address.

use cpusim_engine::machine::hw::{ConditionBit, Ram, RamId, Register, RegisterId};
use cpusim_engine::machine::instr::{Field, MachineInstruction};
use cpusim_engine::machine::micro::{AccessDirection, ArithmeticKind, Comparison, Micro, MicroOp};
use cpusim_engine::machine::{ExecErrKind, Machine, MachineBuilder, MachineRunner, RunMode, RunState};

struct Acc {
    machine: Machine,
    acc: RegisterId,
    mem: RamId
}

fn acc_machine() -> Acc {
    let mut b = MachineBuilder::new();
    let pc = b.add_register(Register::new("pc", 8)).into();
    let ir = b.add_register(Register::new("ir", 16)).into();
    let mar = b.add_register(Register::new("mar", 8)).into();
    let mdr = b.add_register(Register::new("mdr", 16)).into();
    let acc_id = b.add_register(Register::new("acc", 16));
    let acc = acc_id.into();
    let status = b.add_register(Register::new("status", 3));
    let halt = b.add_condition_bit(ConditionBit::new("halt", status, 0).with_halt(true));
    let overflow = b.add_condition_bit(ConditionBit::new("overflow", status, 1));
    let carry = b.add_condition_bit(ConditionBit::new("carry", status, 2));
    let mem = b.add_ram(Ram::new("main", 32, 16));

    let fetch = vec![
        b.add_micro(Micro::new("ir<-m[pc]", MicroOp::MemoryAccess { direction: AccessDirection::Read, memory: mem, data: ir, address: pc })),
        b.add_micro(Micro::new("pc++", MicroOp::Increment { register: pc, delta: 1, overflow_bit: None, carry_bit: None })),
        b.add_micro(Micro::new("decode", MicroOp::Decode { ir })),
    ];
    b.set_fetch_sequence(fetch);

    let mar_ir = b.add_micro(Micro::new("mar<-ir(addr)", MicroOp::TransferRtoR { source: ir, src_start: 0, destination: mar, dest_start: 0, num_bits: 8 }));
    let pc_ir = b.add_micro(Micro::new("pc<-ir(addr)", MicroOp::TransferRtoR { source: ir, src_start: 0, destination: pc, dest_start: 0, num_bits: 8 }));
    let mdr_m = b.add_micro(Micro::new("mdr<-m[mar]", MicroOp::MemoryAccess { direction: AccessDirection::Read, memory: mem, data: mdr, address: mar }));
    let m_acc = b.add_micro(Micro::new("m[mar]<-acc", MicroOp::MemoryAccess { direction: AccessDirection::Write, memory: mem, data: acc, address: mar }));
    let acc_mdr = b.add_micro(Micro::new("acc<-mdr", MicroOp::TransferRtoR { source: mdr, src_start: 0, destination: acc, dest_start: 0, num_bits: 16 }));
    let arith = |kind| MicroOp::Arithmetic { kind, source1: acc, source2: mdr, destination: acc, overflow_bit: Some(overflow), carry_bit: Some(carry) };
    let add = b.add_micro(Micro::new("acc<-acc+mdr", arith(ArithmeticKind::Add)));
    let div = b.add_micro(Micro::new("acc<-acc/mdr", arith(ArithmeticKind::Divide)));
    let if_zero = b.add_micro(Micro::new("if(acc=0)", MicroOp::Test {
        register: acc, start: 0, num_bits: 16, comparison: Comparison::Ne, value: 0, omission: 1
    }));
    let set_halt = b.add_micro(Micro::new("halt", MicroOp::SetCondBit { bit: halt, value: true }));

    let op = b.add_field(Field::new("op", 4));
    let addr = b.add_field(Field::new("addr", 12));
    let fields = vec![op, addr];
    b.add_instruction(MachineInstruction::new("halt", 0, fields.clone()).with_micros(vec![set_halt]));
    b.add_instruction(MachineInstruction::new("load", 1, fields.clone()).with_micros(vec![mar_ir, mdr_m, acc_mdr]));
    b.add_instruction(MachineInstruction::new("add", 2, fields.clone()).with_micros(vec![mar_ir, mdr_m, add]));
    b.add_instruction(MachineInstruction::new("store", 3, fields.clone()).with_micros(vec![mar_ir, m_acc]));
    b.add_instruction(MachineInstruction::new("jmpz", 4, fields.clone()).with_micros(vec![if_zero, pc_ir]));
    b.add_instruction(MachineInstruction::new("div", 5, fields.clone()).with_micros(vec![mar_ir, mdr_m, div]));
    b.add_instruction(MachineInstruction::new("jmp", 6, fields).with_micros(vec![pc_ir]));

    Acc { machine: b.build().unwrap(), acc: acc_id, mem }
}

fn assemble(m: &mut Acc, program: &[(&str, i64)]) {
    let words: Vec<_> = program.iter()
        .map(|&(name, addr)| {
            let id = m.machine.instruction_by_name(name).unwrap();
            m.machine.instruction(id).encode(m.machine.fields(), &[addr]).unwrap()
        })
        .collect();
    m.machine.load_words(m.mem, 0, &words, 16).unwrap();
}

/// Sums 5 + 4 + ... + 1 into address 21.
fn sum_program() -> Acc {
    let mut m = acc_machine();
    assemble(&mut m, &[
        ("load", 21), ("add", 20), ("store", 21),
        ("load", 20), ("add", 22), ("store", 20),
        ("jmpz", 8), ("jmp", 0), ("halt", 0)
    ]);
    m.machine.load_words(m.mem, 20, &[5, 0, -1], 16).unwrap();
    m
}

fn snapshot(machine: &Machine) -> (Vec<i64>, Vec<i64>) {
    let regs = machine.hw().registers().map(|(_, r)| r.value()).collect();
    let mem = machine.hw().rams()
        .flat_map(|(_, ram)| ram.iter().map(|loc| loc.value()))
        .collect();
    (regs, mem)
}

#[test]
fn test_program_runs_to_halt() {
    let mut m = sum_program();
    assert_eq!(m.machine.run(), Ok(RunState::Halted));

    let ram = &m.machine.hw()[m.mem];
    assert_eq!(ram.get_data(21, 16), Some(15));
    assert_eq!(ram.get_data(20, 16), Some(0));
    assert_eq!(m.machine.instructions_run(), 5 * 8 - 1);
}

#[test]
fn test_step_by_micro_matches_step_by_instr() {
    let mut by_instr = sum_program();
    let mut by_micro = sum_program();

    for _ in 0..12 {
        assert_eq!(by_instr.machine.execute(RunMode::StepByInstr), Ok(RunState::Idle));
    }
    for _ in 0..by_instr.machine.micros_run() {
        assert_eq!(by_micro.machine.execute(RunMode::StepByMicro), Ok(RunState::Idle));
    }
    assert_eq!(snapshot(&by_instr.machine), snapshot(&by_micro.machine));
    assert_eq!(by_instr.machine.control_unit().cursor(), by_micro.machine.control_unit().cursor());
    assert!(by_micro.machine.control_unit().at_cycle_start());
}

#[test]
fn test_backup_and_resume_is_exact() {
    let mut uninterrupted = sum_program();
    uninterrupted.machine.run().unwrap();

    let mut m = sum_program();
    let initial = snapshot(&m.machine);
    assert_eq!(m.machine.run_with_limit(50), Ok(RunState::Idle));
    assert!(m.machine.backup_one_machine_instruction());
    assert!(m.machine.control_unit().at_cycle_start());
    assert!(m.machine.backup_one_micro_instruction());
    assert!(m.machine.backup_one_micro_instruction());

    assert_eq!(m.machine.run(), Ok(RunState::Halted));
    assert_eq!(snapshot(&m.machine), snapshot(&uninterrupted.machine));

    m.machine.backup_all_the_way();
    assert_eq!(snapshot(&m.machine), initial);
    assert!(m.machine.control_unit().at_cycle_start());
    assert_eq!(m.machine.run(), Ok(RunState::Halted));
    assert_eq!(snapshot(&m.machine), snapshot(&uninterrupted.machine));
}

#[test]
fn test_breakpoints_resume() {
    let mut m = sum_program();
    m.machine.hw_mut()[m.mem].set_breakpoint(21, true);

    // address 21 is loaded and stored once per iteration
    let mut breaks = 0;
    loop {
        match m.machine.run() {
            Ok(RunState::Broken) => breaks += 1,
            Ok(RunState::Halted) => break,
            other => panic!("unexpected result {other:?}"),
        }
    }
    assert_eq!(breaks, 10);
    assert_eq!(m.machine.hw()[m.mem].get_data(21, 16), Some(15));
}

#[test]
fn test_divide_by_zero() {
    let mut m = acc_machine();
    assemble(&mut m, &[("load", 20), ("div", 21), ("halt", 0)]);
    m.machine.load_words(m.mem, 20, &[9, 0], 16).unwrap();

    let err = m.machine.run().unwrap_err();
    assert_eq!(err.kind, ExecErrKind::DivideByZero);
    assert_eq!(err.micro, "acc<-acc/mdr");
    assert_eq!(err.to_string(), "acc<-acc/mdr: division by zero");
    assert_eq!(m.machine.control_unit().state(), RunState::ExceptionThrown);
    assert_eq!(m.machine.control_unit().micro_index(), 2);
    // the load before the fault stays
    assert_eq!(m.machine.hw()[m.acc].value(), 9);

    // fixing the divisor lets the run continue from the failing microinstruction
    let mdr = m.machine.hw().register_by_name("mdr").unwrap();
    m.machine.hw_mut()[mdr].set_value(3);
    assert_eq!(m.machine.run(), Ok(RunState::Halted));
    assert_eq!(m.machine.hw()[m.acc].value(), 3);
}

#[test]
fn test_runner_reports_states() {
    let mut m = sum_program();
    let rx = m.machine.subscribe();
    let mut runner = MachineRunner::new(m.machine);

    assert!(runner.start(RunMode::RunAndFireCycles));
    assert_eq!(runner.join(), Some(Ok(RunState::Halted)));

    // one fetch and one execute per instruction, including the halt
    let events: Vec<_> = rx.try_iter().collect();
    assert_eq!(events.len(), 2 * 40 + 1);
    assert_eq!(events[0].state, RunState::Fetching);
    assert_eq!((events[1].state, events[1].instruction.as_str()), (RunState::Executing, "load"));
    assert_eq!((events[3].state, events[3].instruction.as_str()), (RunState::Executing, "add"));
    assert_eq!(events.last().map(|e| e.state), Some(RunState::Halted));
    assert_eq!(runner.lock().hw()[m.mem].get_data(21, 16), Some(15));
}
