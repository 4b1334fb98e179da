//! オペコードテーブル
//!
//! 256エントリのテーブルを2種類持つ: NMOS 6502 (Apple II/II+/IIe) と
//! CMOS 65C02 (IIe Enhanced, Rockwellビット命令を含む)。
//! NMOSの未定義命令は1〜3バイトのNOPかKIL、CMOSの未定義命令はNOPになる。

use super::addressing::AddressingMode;
use super::addressing::AddressingMode::*;

/// 命令の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Adc, And, Asl, Bcc, Bcs, Beq, Bit, Bmi, Bne, Bpl, Brk, Bvc, Bvs,
    Clc, Cld, Cli, Clv, Cmp, Cpx, Cpy, Dec, Dex, Dey, Eor, Inc, Inx, Iny,
    Jmp, Jsr, Lda, Ldx, Ldy, Lsr, Nop, Ora, Pha, Php, Pla, Plp, Rol, Ror,
    Rti, Rts, Sbc, Sec, Sed, Sei, Sta, Stx, Sty, Tax, Tay, Tsx, Txa, Txs, Tya,
    // 65C02
    Bra, Phx, Phy, Plx, Ply, Stz, Trb, Tsb,
    // Rockwell
    Rmb(u8), Smb(u8), Bbr(u8), Bbs(u8),
    /// CPU停止（NMOSのみ）
    Kil,
}

impl Op {
    pub fn mnemonic(self) -> &'static str {
        const RMB: [&str; 8] = ["RMB0", "RMB1", "RMB2", "RMB3", "RMB4", "RMB5", "RMB6", "RMB7"];
        const SMB: [&str; 8] = ["SMB0", "SMB1", "SMB2", "SMB3", "SMB4", "SMB5", "SMB6", "SMB7"];
        const BBR: [&str; 8] = ["BBR0", "BBR1", "BBR2", "BBR3", "BBR4", "BBR5", "BBR6", "BBR7"];
        const BBS: [&str; 8] = ["BBS0", "BBS1", "BBS2", "BBS3", "BBS4", "BBS5", "BBS6", "BBS7"];
        use Op::*;
        match self {
            Adc => "ADC", And => "AND", Asl => "ASL", Bcc => "BCC", Bcs => "BCS",
            Beq => "BEQ", Bit => "BIT", Bmi => "BMI", Bne => "BNE", Bpl => "BPL",
            Brk => "BRK", Bvc => "BVC", Bvs => "BVS", Clc => "CLC", Cld => "CLD",
            Cli => "CLI", Clv => "CLV", Cmp => "CMP", Cpx => "CPX", Cpy => "CPY",
            Dec => "DEC", Dex => "DEX", Dey => "DEY", Eor => "EOR", Inc => "INC",
            Inx => "INX", Iny => "INY", Jmp => "JMP", Jsr => "JSR", Lda => "LDA",
            Ldx => "LDX", Ldy => "LDY", Lsr => "LSR", Nop => "NOP", Ora => "ORA",
            Pha => "PHA", Php => "PHP", Pla => "PLA", Plp => "PLP", Rol => "ROL",
            Ror => "ROR", Rti => "RTI", Rts => "RTS", Sbc => "SBC", Sec => "SEC",
            Sed => "SED", Sei => "SEI", Sta => "STA", Stx => "STX", Sty => "STY",
            Tax => "TAX", Tay => "TAY", Tsx => "TSX", Txa => "TXA", Txs => "TXS",
            Tya => "TYA", Bra => "BRA", Phx => "PHX", Phy => "PHY", Plx => "PLX",
            Ply => "PLY", Stz => "STZ", Trb => "TRB", Tsb => "TSB", Kil => "KIL",
            Rmb(n) => RMB[(n & 7) as usize],
            Smb(n) => SMB[(n & 7) as usize],
            Bbr(n) => BBR[(n & 7) as usize],
            Bbs(n) => BBS[(n & 7) as usize],
        }
    }
}

/// テーブルの1エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Opcode {
    pub op: Op,
    pub mode: AddressingMode,
    /// 基本サイクル数
    pub cycles: u8,
    /// ページ跨ぎで+1サイクルする読み込み命令
    pub page_penalty: bool,
}

impl Opcode {
    /// 命令長（1〜3バイト）
    pub fn len(&self) -> u16 {
        1 + self.mode.operand_bytes()
    }

    pub fn mnemonic(&self) -> &'static str {
        self.op.mnemonic()
    }
}

const fn o(op: Op, mode: AddressingMode, cycles: u8) -> Opcode {
    Opcode { op, mode, cycles, page_penalty: false }
}

/// ページ跨ぎペナルティ付き
const fn p(op: Op, mode: AddressingMode, cycles: u8) -> Opcode {
    Opcode { op, mode, cycles, page_penalty: true }
}

/// ORA/AND/EOR/ADC/LDA/CMP/SBC 共通の8アドレッシング
const fn alu(mut t: [Opcode; 256], base: usize, op: Op) -> [Opcode; 256] {
    t[base + 0x01] = o(op, IndirectX, 6);
    t[base + 0x05] = o(op, ZeroPage, 3);
    t[base + 0x09] = o(op, Immediate, 2);
    t[base + 0x0D] = o(op, Absolute, 4);
    t[base + 0x11] = p(op, IndirectY, 5);
    t[base + 0x15] = o(op, ZeroPageX, 4);
    t[base + 0x19] = p(op, AbsoluteY, 4);
    t[base + 0x1D] = p(op, AbsoluteX, 4);
    t
}

/// ASL/ROL/LSR/ROR 共通
const fn shift(mut t: [Opcode; 256], base: usize, op: Op) -> [Opcode; 256] {
    t[base + 0x06] = o(op, ZeroPage, 5);
    t[base + 0x0A] = o(op, Accumulator, 2);
    t[base + 0x0E] = o(op, Absolute, 6);
    t[base + 0x16] = o(op, ZeroPageX, 6);
    t[base + 0x1E] = o(op, AbsoluteX, 7);
    t
}

/// NMOS/CMOS 共通の公式命令
const fn documented() -> [Opcode; 256] {
    let mut t = [UNDEFINED; 256];
    t = alu(t, 0x00, Op::Ora);
    t = alu(t, 0x20, Op::And);
    t = alu(t, 0x40, Op::Eor);
    t = alu(t, 0x60, Op::Adc);
    t = alu(t, 0xA0, Op::Lda);
    t = alu(t, 0xC0, Op::Cmp);
    t = alu(t, 0xE0, Op::Sbc);
    t = shift(t, 0x00, Op::Asl);
    t = shift(t, 0x20, Op::Rol);
    t = shift(t, 0x40, Op::Lsr);
    t = shift(t, 0x60, Op::Ror);

    // STA（即値なし、書き込みはペナルティなしの固定サイクル）
    t[0x81] = o(Op::Sta, IndirectX, 6);
    t[0x85] = o(Op::Sta, ZeroPage, 3);
    t[0x8D] = o(Op::Sta, Absolute, 4);
    t[0x91] = o(Op::Sta, IndirectY, 6);
    t[0x95] = o(Op::Sta, ZeroPageX, 4);
    t[0x99] = o(Op::Sta, AbsoluteY, 5);
    t[0x9D] = o(Op::Sta, AbsoluteX, 5);

    t[0x86] = o(Op::Stx, ZeroPage, 3);
    t[0x8E] = o(Op::Stx, Absolute, 4);
    t[0x96] = o(Op::Stx, ZeroPageY, 4);
    t[0x84] = o(Op::Sty, ZeroPage, 3);
    t[0x8C] = o(Op::Sty, Absolute, 4);
    t[0x94] = o(Op::Sty, ZeroPageX, 4);

    t[0xA2] = o(Op::Ldx, Immediate, 2);
    t[0xA6] = o(Op::Ldx, ZeroPage, 3);
    t[0xAE] = o(Op::Ldx, Absolute, 4);
    t[0xB6] = o(Op::Ldx, ZeroPageY, 4);
    t[0xBE] = p(Op::Ldx, AbsoluteY, 4);
    t[0xA0] = o(Op::Ldy, Immediate, 2);
    t[0xA4] = o(Op::Ldy, ZeroPage, 3);
    t[0xAC] = o(Op::Ldy, Absolute, 4);
    t[0xB4] = o(Op::Ldy, ZeroPageX, 4);
    t[0xBC] = p(Op::Ldy, AbsoluteX, 4);

    t[0xE0] = o(Op::Cpx, Immediate, 2);
    t[0xE4] = o(Op::Cpx, ZeroPage, 3);
    t[0xEC] = o(Op::Cpx, Absolute, 4);
    t[0xC0] = o(Op::Cpy, Immediate, 2);
    t[0xC4] = o(Op::Cpy, ZeroPage, 3);
    t[0xCC] = o(Op::Cpy, Absolute, 4);

    t[0xC6] = o(Op::Dec, ZeroPage, 5);
    t[0xCE] = o(Op::Dec, Absolute, 6);
    t[0xD6] = o(Op::Dec, ZeroPageX, 6);
    t[0xDE] = o(Op::Dec, AbsoluteX, 7);
    t[0xE6] = o(Op::Inc, ZeroPage, 5);
    t[0xEE] = o(Op::Inc, Absolute, 6);
    t[0xF6] = o(Op::Inc, ZeroPageX, 6);
    t[0xFE] = o(Op::Inc, AbsoluteX, 7);

    t[0x24] = o(Op::Bit, ZeroPage, 3);
    t[0x2C] = o(Op::Bit, Absolute, 4);

    t[0x10] = o(Op::Bpl, Relative, 2);
    t[0x30] = o(Op::Bmi, Relative, 2);
    t[0x50] = o(Op::Bvc, Relative, 2);
    t[0x70] = o(Op::Bvs, Relative, 2);
    t[0x90] = o(Op::Bcc, Relative, 2);
    t[0xB0] = o(Op::Bcs, Relative, 2);
    t[0xD0] = o(Op::Bne, Relative, 2);
    t[0xF0] = o(Op::Beq, Relative, 2);

    t[0x00] = o(Op::Brk, Implicit, 7);
    t[0x20] = o(Op::Jsr, Absolute, 6);
    t[0x40] = o(Op::Rti, Implicit, 6);
    t[0x60] = o(Op::Rts, Implicit, 6);
    t[0x4C] = o(Op::Jmp, Absolute, 3);
    t[0x6C] = o(Op::Jmp, Indirect, 5);

    t[0x08] = o(Op::Php, Implicit, 3);
    t[0x28] = o(Op::Plp, Implicit, 4);
    t[0x48] = o(Op::Pha, Implicit, 3);
    t[0x68] = o(Op::Pla, Implicit, 4);

    t[0x18] = o(Op::Clc, Implicit, 2);
    t[0x38] = o(Op::Sec, Implicit, 2);
    t[0x58] = o(Op::Cli, Implicit, 2);
    t[0x78] = o(Op::Sei, Implicit, 2);
    t[0xB8] = o(Op::Clv, Implicit, 2);
    t[0xD8] = o(Op::Cld, Implicit, 2);
    t[0xF8] = o(Op::Sed, Implicit, 2);

    t[0xAA] = o(Op::Tax, Implicit, 2);
    t[0xA8] = o(Op::Tay, Implicit, 2);
    t[0xBA] = o(Op::Tsx, Implicit, 2);
    t[0x8A] = o(Op::Txa, Implicit, 2);
    t[0x9A] = o(Op::Txs, Implicit, 2);
    t[0x98] = o(Op::Tya, Implicit, 2);
    t[0xCA] = o(Op::Dex, Implicit, 2);
    t[0x88] = o(Op::Dey, Implicit, 2);
    t[0xE8] = o(Op::Inx, Implicit, 2);
    t[0xC8] = o(Op::Iny, Implicit, 2);
    t[0xEA] = o(Op::Nop, Implicit, 2);
    t
}

/// 未割り当てエントリの印（サイクル0）
const UNDEFINED: Opcode = o(Op::Kil, Implicit, 0);

const fn is_documented(t: &[Opcode; 256], code: usize) -> bool {
    t[code].cycles != 0
}

/// NMOS 6502: 未定義命令はNOP（列に応じたバイト長）かKIL
const fn build_nmos() -> [Opcode; 256] {
    let mut t = documented();
    let mut code = 0;
    while code < 256 {
        if !is_documented(&t, code) {
            let row = code >> 4;
            let odd_row = row & 1 == 1;
            t[code] = match code & 0x0F {
                0x00 => o(Op::Nop, Immediate, 2), // $80
                0x02 => match code {
                    0x82 | 0xC2 | 0xE2 => o(Op::Nop, Immediate, 2),
                    _ => o(Op::Kil, Implicit, 2),
                },
                0x03 => if odd_row { o(Op::Nop, IndirectY, 8) } else { o(Op::Nop, IndirectX, 8) },
                0x04 => if odd_row { o(Op::Nop, ZeroPageX, 4) } else { o(Op::Nop, ZeroPage, 3) },
                0x07 => if odd_row { o(Op::Nop, ZeroPageX, 6) } else { o(Op::Nop, ZeroPage, 5) },
                0x09 => o(Op::Nop, Immediate, 2), // $89
                0x0A => o(Op::Nop, Implicit, 2),
                0x0B => if odd_row { o(Op::Nop, AbsoluteY, 7) } else { o(Op::Nop, Immediate, 2) },
                0x0C => match code {
                    0x9C => o(Op::Nop, AbsoluteX, 5), // SHY abs,X（ページ跨ぎでも5）
                    _ => if odd_row { p(Op::Nop, AbsoluteX, 4) } else { o(Op::Nop, Absolute, 4) },
                },
                0x0E => o(Op::Nop, AbsoluteY, 5), // $9E
                0x0F => if odd_row { o(Op::Nop, AbsoluteX, 7) } else { o(Op::Nop, Absolute, 6) },
                _ => o(Op::Nop, Implicit, 2),
            };
        }
        code += 1;
    }
    t
}

/// CMOS 65C02（Rockwell拡張付き）
const fn build_cmos() -> [Opcode; 256] {
    let mut t = documented();

    // 未定義命令はNOP
    let mut code = 0;
    while code < 256 {
        if !is_documented(&t, code) {
            t[code] = match code & 0x0F {
                0x02 => o(Op::Nop, Immediate, 2),
                0x03 | 0x0B => o(Op::Nop, Implicit, 1),
                0x04 => if code == 0x44 { o(Op::Nop, ZeroPage, 3) } else { o(Op::Nop, ZeroPageX, 4) },
                0x0C => if code == 0x5C { o(Op::Nop, Absolute, 8) } else { o(Op::Nop, Absolute, 4) },
                _ => o(Op::Nop, Implicit, 2),
            };
        }
        code += 1;
    }

    // (zp) アドレッシング
    t[0x12] = o(Op::Ora, IndirectZeroPage, 5);
    t[0x32] = o(Op::And, IndirectZeroPage, 5);
    t[0x52] = o(Op::Eor, IndirectZeroPage, 5);
    t[0x72] = o(Op::Adc, IndirectZeroPage, 5);
    t[0x92] = o(Op::Sta, IndirectZeroPage, 5);
    t[0xB2] = o(Op::Lda, IndirectZeroPage, 5);
    t[0xD2] = o(Op::Cmp, IndirectZeroPage, 5);
    t[0xF2] = o(Op::Sbc, IndirectZeroPage, 5);

    t[0x89] = o(Op::Bit, Immediate, 2);
    t[0x34] = o(Op::Bit, ZeroPageX, 4);
    t[0x3C] = p(Op::Bit, AbsoluteX, 4);

    t[0x80] = o(Op::Bra, Relative, 2);
    t[0x1A] = o(Op::Inc, Accumulator, 2);
    t[0x3A] = o(Op::Dec, Accumulator, 2);
    t[0x6C] = o(Op::Jmp, Indirect, 6);
    t[0x7C] = o(Op::Jmp, AbsoluteIndirectX, 6);

    t[0xDA] = o(Op::Phx, Implicit, 3);
    t[0x5A] = o(Op::Phy, Implicit, 3);
    t[0xFA] = o(Op::Plx, Implicit, 4);
    t[0x7A] = o(Op::Ply, Implicit, 4);

    t[0x64] = o(Op::Stz, ZeroPage, 3);
    t[0x74] = o(Op::Stz, ZeroPageX, 4);
    t[0x9C] = o(Op::Stz, Absolute, 4);
    t[0x9E] = o(Op::Stz, AbsoluteX, 5);

    t[0x04] = o(Op::Tsb, ZeroPage, 5);
    t[0x0C] = o(Op::Tsb, Absolute, 6);
    t[0x14] = o(Op::Trb, ZeroPage, 5);
    t[0x1C] = o(Op::Trb, Absolute, 6);

    // シフトのabs,Xはページを跨がなければ1サイクル短い
    t[0x1E] = p(Op::Asl, AbsoluteX, 6);
    t[0x3E] = p(Op::Rol, AbsoluteX, 6);
    t[0x5E] = p(Op::Lsr, AbsoluteX, 6);
    t[0x7E] = p(Op::Ror, AbsoluteX, 6);

    let mut n = 0;
    while n < 8 {
        let bit = n as u8;
        t[0x07 + n * 0x10] = o(Op::Rmb(bit), ZeroPage, 5);
        t[0x87 + n * 0x10] = o(Op::Smb(bit), ZeroPage, 5);
        t[0x0F + n * 0x10] = o(Op::Bbr(bit), ZeroPageRelative, 5);
        t[0x8F + n * 0x10] = o(Op::Bbs(bit), ZeroPageRelative, 5);
        n += 1;
    }
    t
}

pub static NMOS_OPCODES: [Opcode; 256] = build_nmos();
pub static CMOS_OPCODES: [Opcode; 256] = build_cmos();
