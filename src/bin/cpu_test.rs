//! Klaus Dormann 6502/65C02 機能テストランナー
//!
//! 使用方法: cargo run --release --bin cpu_test -- [--dir <bin_files>]
//!
//! テストバイナリは同梱していない。成功時は既知のアドレスで自己ループする。

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Instant;

use a2core::cpu::{Cpu, CpuType, MemoryBus};
use clap::Parser;

/// CPU functional test runner
#[derive(Parser, Debug)]
#[command(name = "cpu_test")]
#[command(about = "Runs the 6502 / 65C02 functional test binaries", long_about = None)]
struct Args {
    /// テストバイナリのディレクトリ
    #[arg(long, default_value = "tests/6502_65C02_functional_tests-master/bin_files")]
    dir: PathBuf,

    /// サイクル上限
    #[arg(long, default_value = "200000000")]
    max_cycles: u64,
}

/// テスト用メモリ（64KB フラットメモリ）
struct TestMemory {
    ram: Vec<u8>,
}

impl MemoryBus for TestMemory {
    fn read(&mut self, address: u16) -> u8 {
        self.ram[address as usize]
    }

    fn write(&mut self, address: u16, value: u8) {
        self.ram[address as usize] = value;
    }
}

/// テストの定義
struct TestCase {
    name: &'static str,
    file: &'static str,
    cpu_type: CpuType,
    start: u16,
    success: u16,
}

const TESTS: &[TestCase] = &[
    TestCase {
        name: "6502 functional test",
        file: "6502_functional_test.bin",
        cpu_type: CpuType::Cpu6502,
        start: 0x0400,
        success: 0x3469,
    },
    TestCase {
        name: "65C02 extended opcodes test",
        file: "65C02_extended_opcodes_test.bin",
        cpu_type: CpuType::Cpu65C02,
        start: 0x0400,
        success: 0x24F1,
    },
];

enum Outcome {
    Passed,
    Trapped(u16),
    Timeout(u16),
}

fn run_test(data: &[u8], test: &TestCase, max_cycles: u64) -> (Outcome, u64, TestMemory) {
    let mut memory = TestMemory { ram: vec![0; 0x10000] };
    let len = data.len().min(0x10000);
    memory.ram[..len].copy_from_slice(&data[..len]);
    memory.ram[0xFFFC] = (test.start & 0xFF) as u8;
    memory.ram[0xFFFD] = (test.start >> 8) as u8;

    let mut cpu = Cpu::new(test.cpu_type);
    cpu.reset(&mut memory);

    let mut cycles: u64 = 0;
    loop {
        let pc = cpu.regs.pc;
        cycles += cpu.step(&mut memory) as u64;

        // JMP * で停止
        if cpu.regs.pc == pc {
            let outcome = if pc == test.success {
                Outcome::Passed
            } else {
                Outcome::Trapped(pc)
            };
            return (outcome, cycles, memory);
        }
        if cycles >= max_cycles {
            return (Outcome::Timeout(cpu.regs.pc), cycles, memory);
        }
    }
}

fn dump_memory(memory: &TestMemory, addr: u16) {
    println!("Memory dump around ${:04X}:", addr);
    let start = (addr as usize).saturating_sub(16) & 0xFFF0;
    for row in 0..4 {
        let row_addr = start + row * 16;
        let bytes: Vec<String> = (0..16)
            .map(|col| format!("{:02X}", memory.ram[(row_addr + col) & 0xFFFF]))
            .collect();
        println!("  ${:04X}: {}", row_addr & 0xFFFF, bytes.join(" "));
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();

    let mut failed = false;
    let mut ran = 0;
    for test in TESTS {
        let path = args.dir.join(test.file);
        let data = match std::fs::read(&path) {
            Ok(data) => data,
            Err(e) => {
                println!("{}: skipped ({}: {})", test.name, path.display(), e);
                continue;
            }
        };
        ran += 1;

        let start = Instant::now();
        let (outcome, cycles, memory) = run_test(&data, test, args.max_cycles);
        let elapsed = start.elapsed();
        let mhz = cycles as f64 / elapsed.as_secs_f64() / 1_000_000.0;

        match outcome {
            Outcome::Passed => {
                println!("{}: PASSED ({} cycles, {:.2} MHz effective)", test.name, cycles, mhz);
            }
            Outcome::Trapped(pc) => {
                println!("{}: FAILED, trap at ${:04X} after {} cycles", test.name, pc, cycles);
                dump_memory(&memory, pc);
                failed = true;
            }
            Outcome::Timeout(pc) => {
                println!("{}: TIMEOUT after {} cycles, PC=${:04X}", test.name, cycles, pc);
                failed = true;
            }
        }
    }

    if ran == 0 {
        println!("no test binaries found in {}", args.dir.display());
    }
    if failed {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    }
}
