//! MOS 6502/65C02 CPU エミュレータ
//!
//! Apple IIで使用される6502プロセッサのエミュレーション実装。
//! 命令は256エントリのオペコードテーブル（NMOS版とCMOS版）から駆動される。
//! 命令フェッチは常にバス経由で行う（I/Oページの読み取りには副作用があるため）。

mod addressing;
mod execute;
pub mod opcodes;

pub use addressing::AddressingMode;
pub use opcodes::{Op, Opcode, CMOS_OPCODES, NMOS_OPCODES};

use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// CPUのステータスレジスタのフラグビット
pub mod flags {
    pub const CARRY: u8 = 0b0000_0001;      // C: キャリーフラグ
    pub const ZERO: u8 = 0b0000_0010;       // Z: ゼロフラグ
    pub const IRQ_DISABLE: u8 = 0b0000_0100; // I: 割り込み禁止フラグ
    pub const DECIMAL: u8 = 0b0000_1000;    // D: BCDモードフラグ
    pub const BREAK: u8 = 0b0001_0000;      // B: ブレークフラグ
    pub const UNUSED: u8 = 0b0010_0000;     // 未使用（常に1）
    pub const OVERFLOW: u8 = 0b0100_0000;   // V: オーバーフローフラグ
    pub const NEGATIVE: u8 = 0b1000_0000;   // N: 負数フラグ
}

/// 割り込みベクター
const NMI_VECTOR: u16 = 0xFFFA;
const RESET_VECTOR: u16 = 0xFFFC;
const IRQ_VECTOR: u16 = 0xFFFE;

/// CPUの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CpuType {
    /// オリジナルのNMOS 6502 (Apple II, II+, IIe)
    #[serde(rename = "6502")]
    Cpu6502,
    /// CMOS 65C02 (Apple IIe Enhanced)
    #[serde(rename = "65c02")]
    Cpu65C02,
}

impl std::str::FromStr for CpuType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "6502" => Ok(CpuType::Cpu6502),
            "65c02" => Ok(CpuType::Cpu65C02),
            other => Err(format!("unknown cpu '{}' (expected 6502 or 65c02)", other)),
        }
    }
}

/// CPUレジスタの状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registers {
    /// アキュムレータ（A）
    pub a: u8,
    /// Xインデックスレジスタ
    pub x: u8,
    /// Yインデックスレジスタ
    pub y: u8,
    /// スタックポインタ
    pub sp: u8,
    /// プログラムカウンタ
    pub pc: u16,
    /// ステータスレジスタ（プロセッサフラグ）
    pub status: u8,
}

impl Default for Registers {
    fn default() -> Self {
        Registers {
            a: 0,
            x: 0,
            y: 0,
            sp: 0xFD,  // スタックは$01FDから開始
            pc: 0,
            status: flags::UNUSED | flags::IRQ_DISABLE,
        }
    }
}

impl Registers {
    /// フラグをセット
    pub fn set_flag(&mut self, flag: u8, value: bool) {
        if value {
            self.status |= flag;
        } else {
            self.status &= !flag;
        }
    }

    /// フラグを取得
    pub fn get_flag(&self, flag: u8) -> bool {
        (self.status & flag) != 0
    }

    /// ゼロフラグと負数フラグを値に基づいて更新
    pub fn update_zero_negative_flags(&mut self, value: u8) {
        self.set_flag(flags::ZERO, value == 0);
        self.set_flag(flags::NEGATIVE, (value & 0x80) != 0);
    }
}

/// メモリバスインターフェース
/// CPUがメモリにアクセスするために必要なトレイト
pub trait MemoryBus {
    /// メモリから1バイト読み取り
    fn read(&mut self, address: u16) -> u8;
    /// メモリに1バイト書き込み
    fn write(&mut self, address: u16, value: u8);
    /// 命令フェッチ用の読み取り（オペコードとオペランド）
    fn fetch(&mut self, address: u16) -> u8 {
        self.read(address)
    }
}

/// 6502 CPUエミュレータ
#[derive(Debug, Clone)]
pub struct Cpu {
    /// CPUレジスタ
    pub regs: Registers,
    /// CPUの種類（6502 or 65C02）
    pub cpu_type: CpuType,
    /// 累積サイクル数
    pub total_cycles: u64,
    /// 直前の命令で消費したサイクル
    pub cycles: u32,
    /// trueなら各命令の実行後に逆アセンブル行をログ出力
    pub trace: bool,
    /// KIL命令で停止中
    halted: bool,
}

impl Default for Cpu {
    fn default() -> Self {
        Self::new(CpuType::Cpu6502)
    }
}

impl Cpu {
    /// 新しいCPUインスタンスを作成
    pub fn new(cpu_type: CpuType) -> Self {
        Cpu {
            regs: Registers::default(),
            cpu_type,
            total_cycles: 0,
            cycles: 0,
            trace: false,
            halted: false,
        }
    }

    /// 使用中のオペコードテーブル
    pub fn opcode_table(&self) -> &'static [Opcode; 256] {
        match self.cpu_type {
            CpuType::Cpu6502 => &NMOS_OPCODES,
            CpuType::Cpu65C02 => &CMOS_OPCODES,
        }
    }

    pub fn is_cmos(&self) -> bool {
        self.cpu_type == CpuType::Cpu65C02
    }

    /// KIL命令で停止しているか
    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// DMAカードなどCPU以外がバスを使った分のサイクルを加算
    pub fn add_cycles(&mut self, cycles: u64) {
        self.total_cycles += cycles;
    }

    /// CPUをリセット
    ///
    /// A/X/Y/Sは保持する。リセットベクターからPCを読み込み、Iフラグをセットする。
    pub fn reset<M: MemoryBus>(&mut self, memory: &mut M) {
        self.halted = false;
        self.regs.status |= flags::IRQ_DISABLE | flags::UNUSED;
        if self.is_cmos() {
            self.regs.status &= !flags::DECIMAL;
        }
        self.regs.pc = Self::read_word(memory, RESET_VECTOR);
        self.cycles = 6;
        self.total_cycles += 6;
    }

    /// NMI（ノンマスカブル割り込み）
    pub fn nmi<M: MemoryBus>(&mut self, memory: &mut M) {
        self.interrupt(memory, NMI_VECTOR);
    }

    /// IRQ（割り込み要求）。Iフラグがセットされていれば無視してfalseを返す
    pub fn irq<M: MemoryBus>(&mut self, memory: &mut M) -> bool {
        if self.regs.get_flag(flags::IRQ_DISABLE) {
            return false;
        }
        self.interrupt(memory, IRQ_VECTOR);
        true
    }

    fn interrupt<M: MemoryBus>(&mut self, memory: &mut M, vector: u16) {
        // PCをスタックにプッシュ（上位バイト先）
        self.push_word(memory, self.regs.pc);
        // ステータスレジスタをプッシュ（Bフラグはクリア）
        let status = (self.regs.status | flags::UNUSED) & !flags::BREAK;
        self.push_byte(memory, status);
        self.regs.set_flag(flags::IRQ_DISABLE, true);
        if self.is_cmos() {
            self.regs.set_flag(flags::DECIMAL, false);
        }
        self.regs.pc = Self::read_word(memory, vector);
        self.halted = false;
        self.cycles = 7;
        self.total_cycles += 7;
    }

    /// 1命令を実行し、消費したサイクル数を返す
    pub fn step<M: MemoryBus>(&mut self, memory: &mut M) -> u32 {
        let pc = self.regs.pc;
        let code = memory.fetch(pc);
        let opcode = self.opcode_table()[code as usize];

        if self.halted {
            // KILで停止中はバスを読むだけで進まない
            self.cycles = opcode.cycles as u32;
            self.total_cycles += self.cycles as u64;
            return self.cycles;
        }

        // オペランドはアドレッシングモードに応じて0〜2バイト
        let len = opcode.len();
        let mut line = [code, 0, 0];
        for (i, byte) in line.iter_mut().enumerate().take(len as usize).skip(1) {
            *byte = memory.fetch(pc.wrapping_add(i as u16));
        }
        self.regs.pc = pc.wrapping_add(len);
        self.cycles = opcode.cycles as u32;

        self.execute(memory, opcode, line);

        self.total_cycles += self.cycles as u64;
        if self.trace {
            log::info!(target: "cpu", "{}", self.trace_line(pc, &opcode, line));
        }
        self.cycles
    }

    /// トレース1行: PC、逆アセンブル、実行後のレジスタ
    pub fn trace_line(&self, pc: u16, opcode: &Opcode, line: [u8; 3]) -> String {
        let bytes: Vec<String> = line[..opcode.len() as usize]
            .iter()
            .map(|b| format!("{:02X}", b))
            .collect();
        format!(
            "{:04X}: {:<9} {:<4} {:<12} A={:02X} X={:02X} Y={:02X} S={:02X} P={:02X} [{}]",
            pc,
            bytes.join(" "),
            opcode.mnemonic(),
            opcode.mode.format_operand(pc, line),
            self.regs.a,
            self.regs.x,
            self.regs.y,
            self.regs.sp,
            self.regs.status,
            self.total_cycles
        )
    }

    //--------------------------------------------------
    // スナップショット（ビッグエンディアン）
    //--------------------------------------------------

    /// サイクルカウンタ(8バイト)とA, X, Y, S, PCH, PCL, Pの7バイトを書き出す
    pub fn save<W: Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&self.total_cycles.to_be_bytes())?;
        w.write_all(&[
            self.regs.a,
            self.regs.x,
            self.regs.y,
            self.regs.sp,
            (self.regs.pc >> 8) as u8,
            self.regs.pc as u8,
            self.regs.status,
        ])
    }

    /// saveで書き出した形式を読み込む
    pub fn load<R: Read>(&mut self, r: &mut R) -> std::io::Result<()> {
        let mut cycles = [0u8; 8];
        r.read_exact(&mut cycles)?;
        let mut regs = [0u8; 7];
        r.read_exact(&mut regs)?;
        self.total_cycles = u64::from_be_bytes(cycles);
        self.regs.a = regs[0];
        self.regs.x = regs[1];
        self.regs.y = regs[2];
        self.regs.sp = regs[3];
        self.regs.pc = u16::from_be_bytes([regs[4], regs[5]]);
        self.regs.status = regs[6] | flags::UNUSED;
        self.halted = false;
        Ok(())
    }

    //--------------------------------------------------
    // スタック
    //--------------------------------------------------

    /// スタックに1バイトプッシュ
    fn push_byte<M: MemoryBus>(&mut self, memory: &mut M, value: u8) {
        memory.write(0x0100 | self.regs.sp as u16, value);
        self.regs.sp = self.regs.sp.wrapping_sub(1);
    }

    /// スタックから1バイトポップ
    fn pop_byte<M: MemoryBus>(&mut self, memory: &mut M) -> u8 {
        self.regs.sp = self.regs.sp.wrapping_add(1);
        memory.read(0x0100 | self.regs.sp as u16)
    }

    /// スタックに2バイトプッシュ（上位バイト先）
    fn push_word<M: MemoryBus>(&mut self, memory: &mut M, value: u16) {
        self.push_byte(memory, (value >> 8) as u8);
        self.push_byte(memory, value as u8);
    }

    /// スタックから2バイトポップ
    fn pop_word<M: MemoryBus>(&mut self, memory: &mut M) -> u16 {
        let low = self.pop_byte(memory) as u16;
        let high = self.pop_byte(memory) as u16;
        (high << 8) | low
    }

    fn read_word<M: MemoryBus>(memory: &mut M, address: u16) -> u16 {
        let low = memory.read(address) as u16;
        let high = memory.read(address.wrapping_add(1)) as u16;
        (high << 8) | low
    }
}
