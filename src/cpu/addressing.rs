//! アドレッシングモードの実装
//!
//! オペランドバイトは命令フェッチ時に読み込み済み（`line`）。
//! ここでは実効アドレスの解決とページ跨ぎの判定を行う。

use super::{Cpu, MemoryBus};

/// アドレッシングモードの種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressingMode {
    /// 暗黙的
    Implicit,
    /// アキュムレータ - A
    Accumulator,
    /// 即値（Immediate） - #$nn
    Immediate,
    /// ゼロページ - $nn
    ZeroPage,
    /// ゼロページ,X - $nn,X
    ZeroPageX,
    /// ゼロページ,Y - $nn,Y
    ZeroPageY,
    /// 絶対 - $nnnn
    Absolute,
    /// 絶対,X - $nnnn,X
    AbsoluteX,
    /// 絶対,Y - $nnnn,Y
    AbsoluteY,
    /// 相対（ブランチ命令用） - $nn
    Relative,
    /// 間接 - ($nnnn)
    Indirect,
    /// 間接,X（プリインデックス） - ($nn,X)
    IndirectX,
    /// 間接,Y（ポストインデックス） - ($nn),Y
    IndirectY,
    /// 間接（ゼロページ、65C02のみ） - ($nn)
    IndirectZeroPage,
    /// 絶対インデックス間接（65C02のJMP） - ($nnnn,X)
    AbsoluteIndirectX,
    /// ゼロページ+相対（Rockwell BBR/BBS） - $nn,$rr
    ZeroPageRelative,
}

impl AddressingMode {
    /// オペランドのバイト数
    pub fn operand_bytes(self) -> u16 {
        use AddressingMode::*;
        match self {
            Implicit | Accumulator => 0,
            Immediate | ZeroPage | ZeroPageX | ZeroPageY | Relative | IndirectX | IndirectY
            | IndirectZeroPage => 1,
            Absolute | AbsoluteX | AbsoluteY | Indirect | AbsoluteIndirectX | ZeroPageRelative => 2,
        }
    }

    /// 逆アセンブル用のオペランド表記
    pub fn format_operand(self, pc: u16, line: [u8; 3]) -> String {
        use AddressingMode::*;
        let word = u16::from_le_bytes([line[1], line[2]]);
        match self {
            Implicit => String::new(),
            Accumulator => "A".to_string(),
            Immediate => format!("#${:02X}", line[1]),
            ZeroPage => format!("${:02X}", line[1]),
            ZeroPageX => format!("${:02X},X", line[1]),
            ZeroPageY => format!("${:02X},Y", line[1]),
            Absolute => format!("${:04X}", word),
            AbsoluteX => format!("${:04X},X", word),
            AbsoluteY => format!("${:04X},Y", word),
            Relative => format!("${:04X}", relative_target(pc.wrapping_add(2), line[1])),
            Indirect => format!("(${:04X})", word),
            IndirectX => format!("(${:02X},X)", line[1]),
            IndirectY => format!("(${:02X}),Y", line[1]),
            IndirectZeroPage => format!("(${:02X})", line[1]),
            AbsoluteIndirectX => format!("(${:04X},X)", word),
            ZeroPageRelative => format!(
                "${:02X},${:04X}",
                line[1],
                relative_target(pc.wrapping_add(3), line[2])
            ),
        }
    }
}

/// 次の命令のアドレスに符号付き8ビットの変位を足す
pub(super) fn relative_target(next_pc: u16, offset: u8) -> u16 {
    next_pc.wrapping_add(offset as i8 as u16)
}

fn crosses_page(base: u16, addr: u16) -> bool {
    (base & 0xFF00) != (addr & 0xFF00)
}

impl Cpu {
    //--------------------------------------------------
    // アドレッシングモードのヘルパー関数
    //--------------------------------------------------

    /// 実効アドレスとページ跨ぎの有無を返す
    pub(super) fn effective_address<M: MemoryBus>(
        &self,
        memory: &mut M,
        mode: AddressingMode,
        line: [u8; 3],
    ) -> (u16, bool) {
        use AddressingMode::*;
        let word = u16::from_le_bytes([line[1], line[2]]);
        match mode {
            ZeroPage => (line[1] as u16, false),
            ZeroPageX => (line[1].wrapping_add(self.regs.x) as u16, false),
            ZeroPageY => (line[1].wrapping_add(self.regs.y) as u16, false),
            Absolute => (word, false),
            AbsoluteX => {
                let addr = word.wrapping_add(self.regs.x as u16);
                (addr, crosses_page(word, addr))
            }
            AbsoluteY => {
                let addr = word.wrapping_add(self.regs.y as u16);
                (addr, crosses_page(word, addr))
            }
            Indirect => {
                let low = memory.read(word) as u16;
                let high_addr = if self.is_cmos() {
                    word.wrapping_add(1)
                } else {
                    // NMOSはページ末尾で上位バイトを同じページの先頭から読む
                    (word & 0xFF00) | (word.wrapping_add(1) & 0x00FF)
                };
                let high = memory.read(high_addr) as u16;
                ((high << 8) | low, false)
            }
            IndirectX => {
                let ptr = line[1].wrapping_add(self.regs.x);
                (self.zero_page_pointer(memory, ptr), false)
            }
            IndirectY => {
                let base = self.zero_page_pointer(memory, line[1]);
                let addr = base.wrapping_add(self.regs.y as u16);
                (addr, crosses_page(base, addr))
            }
            IndirectZeroPage => (self.zero_page_pointer(memory, line[1]), false),
            AbsoluteIndirectX => {
                let ptr = word.wrapping_add(self.regs.x as u16);
                let low = memory.read(ptr) as u16;
                let high = memory.read(ptr.wrapping_add(1)) as u16;
                ((high << 8) | low, false)
            }
            // ZeroPageRelative はゼロページ部分のみ
            ZeroPageRelative => (line[1] as u16, false),
            Implicit | Accumulator | Immediate | Relative => (0, false),
        }
    }

    /// ゼロページ上の16ビットポインタ（$FFは$00に折り返す）
    fn zero_page_pointer<M: MemoryBus>(&self, memory: &mut M, ptr: u8) -> u16 {
        let low = memory.read(ptr as u16) as u16;
        let high = memory.read(ptr.wrapping_add(1) as u16) as u16;
        (high << 8) | low
    }

    /// ブランチを実行（共通ロジック）
    ///
    /// 成立で+1サイクル、ページを跨げばさらに+1サイクル。
    pub(super) fn branch(&mut self, offset: u8, condition: bool) {
        if condition {
            let old_pc = self.regs.pc;
            self.regs.pc = relative_target(old_pc, offset);
            self.cycles += 1;
            if crosses_page(old_pc, self.regs.pc) {
                self.cycles += 1;
            }
        }
    }
}
