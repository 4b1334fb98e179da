//! 命令の実行
//!
//! オペコードテーブルのエントリ（命令の種類とアドレッシングモード）から
//! 演算を行う。PCは呼び出し前に次の命令を指している。

use super::addressing::AddressingMode;
use super::opcodes::{Op, Opcode};
use super::{flags, Cpu, MemoryBus};

impl Cpu {
    pub(super) fn execute<M: MemoryBus>(&mut self, memory: &mut M, opcode: Opcode, line: [u8; 3]) {
        match opcode.op {
            //--------------------------------------------------
            // ロード/ストア
            //--------------------------------------------------
            Op::Lda => {
                let value = self.load_operand(memory, &opcode, line);
                self.regs.a = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Ldx => {
                let value = self.load_operand(memory, &opcode, line);
                self.regs.x = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Ldy => {
                let value = self.load_operand(memory, &opcode, line);
                self.regs.y = value;
                self.regs.update_zero_negative_flags(value);
            }
            Op::Sta => self.store(memory, &opcode, line, self.regs.a),
            Op::Stx => self.store(memory, &opcode, line, self.regs.x),
            Op::Sty => self.store(memory, &opcode, line, self.regs.y),
            Op::Stz => self.store(memory, &opcode, line, 0),

            //--------------------------------------------------
            // 転送
            //--------------------------------------------------
            Op::Tax => {
                self.regs.x = self.regs.a;
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Tay => {
                self.regs.y = self.regs.a;
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Op::Txa => {
                self.regs.a = self.regs.x;
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Tya => {
                self.regs.a = self.regs.y;
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Tsx => {
                self.regs.x = self.regs.sp;
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            // TXSはフラグに影響しない
            Op::Txs => self.regs.sp = self.regs.x,

            //--------------------------------------------------
            // スタック
            //--------------------------------------------------
            Op::Pha => self.push_byte(memory, self.regs.a),
            Op::Phx => self.push_byte(memory, self.regs.x),
            Op::Phy => self.push_byte(memory, self.regs.y),
            Op::Php => {
                let status = self.regs.status | flags::BREAK | flags::UNUSED;
                self.push_byte(memory, status);
            }
            Op::Pla => {
                self.regs.a = self.pop_byte(memory);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Plx => {
                self.regs.x = self.pop_byte(memory);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Ply => {
                self.regs.y = self.pop_byte(memory);
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Op::Plp => {
                let status = self.pop_byte(memory);
                self.regs.status = (status | flags::UNUSED) & !flags::BREAK;
            }

            //--------------------------------------------------
            // 算術・論理
            //--------------------------------------------------
            Op::Adc => {
                let value = self.load_operand(memory, &opcode, line);
                self.do_adc(value);
            }
            Op::Sbc => {
                let value = self.load_operand(memory, &opcode, line);
                self.do_sbc(value);
            }
            Op::And => {
                self.regs.a &= self.load_operand(memory, &opcode, line);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Ora => {
                self.regs.a |= self.load_operand(memory, &opcode, line);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Eor => {
                self.regs.a ^= self.load_operand(memory, &opcode, line);
                self.regs.update_zero_negative_flags(self.regs.a);
            }
            Op::Cmp => {
                let value = self.load_operand(memory, &opcode, line);
                self.compare(self.regs.a, value);
            }
            Op::Cpx => {
                let value = self.load_operand(memory, &opcode, line);
                self.compare(self.regs.x, value);
            }
            Op::Cpy => {
                let value = self.load_operand(memory, &opcode, line);
                self.compare(self.regs.y, value);
            }
            Op::Bit => {
                let value = self.load_operand(memory, &opcode, line);
                self.regs.set_flag(flags::ZERO, (self.regs.a & value) == 0);
                // 即値モード（65C02）はN/Vを変更しない
                if opcode.mode != AddressingMode::Immediate {
                    self.regs.set_flag(flags::NEGATIVE, (value & 0x80) != 0);
                    self.regs.set_flag(flags::OVERFLOW, (value & 0x40) != 0);
                }
            }

            //--------------------------------------------------
            // インクリメント/デクリメント、シフト
            //--------------------------------------------------
            Op::Inc => self.modify(memory, &opcode, line, |cpu, v| {
                let r = v.wrapping_add(1);
                cpu.regs.update_zero_negative_flags(r);
                r
            }),
            Op::Dec => self.modify(memory, &opcode, line, |cpu, v| {
                let r = v.wrapping_sub(1);
                cpu.regs.update_zero_negative_flags(r);
                r
            }),
            Op::Inx => {
                self.regs.x = self.regs.x.wrapping_add(1);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Iny => {
                self.regs.y = self.regs.y.wrapping_add(1);
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Op::Dex => {
                self.regs.x = self.regs.x.wrapping_sub(1);
                self.regs.update_zero_negative_flags(self.regs.x);
            }
            Op::Dey => {
                self.regs.y = self.regs.y.wrapping_sub(1);
                self.regs.update_zero_negative_flags(self.regs.y);
            }
            Op::Asl => self.modify(memory, &opcode, line, |cpu, v| {
                cpu.regs.set_flag(flags::CARRY, (v & 0x80) != 0);
                let r = v << 1;
                cpu.regs.update_zero_negative_flags(r);
                r
            }),
            Op::Lsr => self.modify(memory, &opcode, line, |cpu, v| {
                cpu.regs.set_flag(flags::CARRY, (v & 0x01) != 0);
                let r = v >> 1;
                cpu.regs.update_zero_negative_flags(r);
                r
            }),
            Op::Rol => self.modify(memory, &opcode, line, |cpu, v| {
                let carry_in = cpu.regs.get_flag(flags::CARRY) as u8;
                cpu.regs.set_flag(flags::CARRY, (v & 0x80) != 0);
                let r = (v << 1) | carry_in;
                cpu.regs.update_zero_negative_flags(r);
                r
            }),
            Op::Ror => self.modify(memory, &opcode, line, |cpu, v| {
                let carry_in = (cpu.regs.get_flag(flags::CARRY) as u8) << 7;
                cpu.regs.set_flag(flags::CARRY, (v & 0x01) != 0);
                let r = (v >> 1) | carry_in;
                cpu.regs.update_zero_negative_flags(r);
                r
            }),
            Op::Tsb => self.modify(memory, &opcode, line, |cpu, v| {
                cpu.regs.set_flag(flags::ZERO, (cpu.regs.a & v) == 0);
                v | cpu.regs.a
            }),
            Op::Trb => self.modify(memory, &opcode, line, |cpu, v| {
                cpu.regs.set_flag(flags::ZERO, (cpu.regs.a & v) == 0);
                v & !cpu.regs.a
            }),
            Op::Rmb(bit) => self.modify(memory, &opcode, line, |_, v| v & !(1 << bit)),
            Op::Smb(bit) => self.modify(memory, &opcode, line, |_, v| v | (1 << bit)),

            //--------------------------------------------------
            // 分岐
            //--------------------------------------------------
            Op::Bcc => self.branch(line[1], !self.regs.get_flag(flags::CARRY)),
            Op::Bcs => self.branch(line[1], self.regs.get_flag(flags::CARRY)),
            Op::Bne => self.branch(line[1], !self.regs.get_flag(flags::ZERO)),
            Op::Beq => self.branch(line[1], self.regs.get_flag(flags::ZERO)),
            Op::Bpl => self.branch(line[1], !self.regs.get_flag(flags::NEGATIVE)),
            Op::Bmi => self.branch(line[1], self.regs.get_flag(flags::NEGATIVE)),
            Op::Bvc => self.branch(line[1], !self.regs.get_flag(flags::OVERFLOW)),
            Op::Bvs => self.branch(line[1], self.regs.get_flag(flags::OVERFLOW)),
            Op::Bra => self.branch(line[1], true),
            Op::Bbr(bit) => {
                let value = memory.read(line[1] as u16);
                self.branch(line[2], value & (1 << bit) == 0);
            }
            Op::Bbs(bit) => {
                let value = memory.read(line[1] as u16);
                self.branch(line[2], value & (1 << bit) != 0);
            }

            //--------------------------------------------------
            // ジャンプ・サブルーチン・割り込み
            //--------------------------------------------------
            Op::Jmp => {
                let (addr, _) = self.effective_address(memory, opcode.mode, line);
                self.regs.pc = addr;
            }
            Op::Jsr => {
                let target = u16::from_le_bytes([line[1], line[2]]);
                // 戻りアドレス-1を積む
                self.push_word(memory, self.regs.pc.wrapping_sub(1));
                self.regs.pc = target;
            }
            Op::Rts => {
                self.regs.pc = self.pop_word(memory).wrapping_add(1);
            }
            Op::Brk => {
                // BRKは2バイト命令として扱う（PC+1を積む）
                self.push_word(memory, self.regs.pc.wrapping_add(1));
                let status = self.regs.status | flags::BREAK | flags::UNUSED;
                self.push_byte(memory, status);
                self.regs.set_flag(flags::IRQ_DISABLE, true);
                if self.is_cmos() {
                    self.regs.set_flag(flags::DECIMAL, false);
                }
                self.regs.pc = Self::read_word(memory, 0xFFFE);
            }
            Op::Rti => {
                let status = self.pop_byte(memory);
                self.regs.status = (status | flags::UNUSED) & !flags::BREAK;
                self.regs.pc = self.pop_word(memory);
            }

            //--------------------------------------------------
            // フラグ
            //--------------------------------------------------
            Op::Clc => self.regs.set_flag(flags::CARRY, false),
            Op::Sec => self.regs.set_flag(flags::CARRY, true),
            Op::Cli => self.regs.set_flag(flags::IRQ_DISABLE, false),
            Op::Sei => self.regs.set_flag(flags::IRQ_DISABLE, true),
            Op::Cld => self.regs.set_flag(flags::DECIMAL, false),
            Op::Sed => self.regs.set_flag(flags::DECIMAL, true),
            Op::Clv => self.regs.set_flag(flags::OVERFLOW, false),

            Op::Nop => {
                // 未定義NOPのabs,Xだけページ跨ぎで+1
                if opcode.page_penalty {
                    let (_, crossed) = self.effective_address(memory, opcode.mode, line);
                    if crossed {
                        self.cycles += 1;
                    }
                }
            }
            Op::Kil => {
                log::warn!("CPU halted by KIL ${:02X} at ${:04X}", line[0], self.regs.pc.wrapping_sub(1));
                self.regs.pc = self.regs.pc.wrapping_sub(1);
                self.halted = true;
            }
        }
    }

    //--------------------------------------------------
    // オペランドアクセス
    //--------------------------------------------------

    /// 読み込み命令のオペランド値
    fn load_operand<M: MemoryBus>(&mut self, memory: &mut M, opcode: &Opcode, line: [u8; 3]) -> u8 {
        match opcode.mode {
            AddressingMode::Immediate => line[1],
            AddressingMode::Accumulator => self.regs.a,
            mode => {
                let (addr, crossed) = self.effective_address(memory, mode, line);
                if crossed && opcode.page_penalty {
                    self.cycles += 1;
                }
                memory.read(addr)
            }
        }
    }

    fn store<M: MemoryBus>(&mut self, memory: &mut M, opcode: &Opcode, line: [u8; 3], value: u8) {
        let (addr, _) = self.effective_address(memory, opcode.mode, line);
        memory.write(addr, value);
    }

    /// リードモディファイライト（アキュムレータモードを含む）
    fn modify<M, F>(&mut self, memory: &mut M, opcode: &Opcode, line: [u8; 3], f: F)
    where
        M: MemoryBus,
        F: FnOnce(&mut Self, u8) -> u8,
    {
        if opcode.mode == AddressingMode::Accumulator {
            let value = self.regs.a;
            self.regs.a = f(self, value);
            return;
        }
        let (addr, crossed) = self.effective_address(memory, opcode.mode, line);
        if crossed && opcode.page_penalty {
            self.cycles += 1;
        }
        let value = memory.read(addr);
        let result = f(self, value);
        memory.write(addr, result);
    }

    fn compare(&mut self, register: u8, value: u8) {
        self.regs.set_flag(flags::CARRY, register >= value);
        self.regs.update_zero_negative_flags(register.wrapping_sub(value));
    }

    //--------------------------------------------------
    // ADC / SBC
    //--------------------------------------------------

    /// ADC。10進モードではNMOSはバイナリ結果でZ/Nを設定し、
    /// CMOSはBCD結果でZ/N/Vを設定して1サイクル追加する。
    fn do_adc(&mut self, value: u8) {
        let a = self.regs.a;
        let carry = self.regs.get_flag(flags::CARRY) as u16;
        let binary = a as u16 + value as u16 + carry;
        let truncated = binary as u8;

        if !self.regs.get_flag(flags::DECIMAL) {
            self.regs.set_flag(flags::CARRY, binary > 0xFF);
            self.regs.set_flag(
                flags::OVERFLOW,
                ((a ^ truncated) & (value ^ truncated) & 0x80) != 0,
            );
            self.regs.a = truncated;
            self.regs.update_zero_negative_flags(truncated);
            return;
        }

        let mut lo = (a & 0x0F) as u16 + (value & 0x0F) as u16 + carry;
        let mut hi = (a >> 4) as u16 + (value >> 4) as u16;
        if lo > 9 {
            lo -= 10;
            hi += 1;
        }
        // Vは補正前の上位ニブルで判定
        let hi_raw = (hi & 0x0F) as u8;
        let overflow = ((a ^ value) & 0x80) == 0 && ((a ^ (hi_raw << 4)) & 0x80) != 0;
        let carry_out = hi > 9;
        if carry_out {
            hi -= 10;
        }
        let result = (((hi & 0x0F) << 4) | (lo & 0x0F)) as u8;

        self.regs.a = result;
        self.regs.set_flag(flags::CARRY, carry_out);
        self.regs.set_flag(flags::OVERFLOW, overflow);
        if self.is_cmos() {
            self.regs.update_zero_negative_flags(result);
            self.cycles += 1;
        } else {
            self.regs.update_zero_negative_flags(truncated);
        }
    }

    fn do_sbc(&mut self, value: u8) {
        let a = self.regs.a;
        let borrow = 1 - self.regs.get_flag(flags::CARRY) as i16;
        let binary = a as i16 - value as i16 - borrow;
        let truncated = binary as u8;
        // Vはバイナリ演算の符号付きオーバーフロー
        let overflow = ((a ^ value) & (a ^ truncated) & 0x80) != 0;

        if !self.regs.get_flag(flags::DECIMAL) {
            self.regs.set_flag(flags::CARRY, binary >= 0);
            self.regs.set_flag(flags::OVERFLOW, overflow);
            self.regs.a = truncated;
            self.regs.update_zero_negative_flags(truncated);
            return;
        }

        let mut lo = (a & 0x0F) as i16 - (value & 0x0F) as i16 - borrow;
        let mut hi = (a >> 4) as i16 - (value >> 4) as i16;
        if lo < 0 {
            lo += 10;
            hi -= 1;
        }
        let carry_out = hi >= 0;
        if hi < 0 {
            hi += 10;
        }
        let result = (((hi & 0x0F) << 4) | (lo & 0x0F)) as u8;

        self.regs.a = result;
        self.regs.set_flag(flags::CARRY, carry_out);
        self.regs.set_flag(flags::OVERFLOW, overflow);
        if self.is_cmos() {
            self.regs.update_zero_negative_flags(result);
            self.cycles += 1;
        } else {
            self.regs.update_zero_negative_flags(truncated);
        }
    }
}
