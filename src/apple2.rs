//! Apple II エミュレータ
//!
//! CPU、MMU、I/Oページ、スロットのカードを統合する。
//! カードはスロットから一時的に取り出して呼び出し、マシン全体を渡す。

use std::path::Path;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use crate::card::Card;
use crate::cpu::{Cpu, CpuType, MemoryBus};
use crate::error::{EmuError, Result};
use crate::io::{Flag, IoPage};
use crate::memory::Mmu;

/// キャラクタジェネレータ1面の大きさ（256文字 × 8ライン）
pub const CHAR_GEN_SIZE: usize = 2048;

/// 機種
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppleModel {
    AppleII,
    AppleIIPlus,
    AppleIIe,
    AppleIIeEnhanced,
}

impl AppleModel {
    pub fn is_iie(self) -> bool {
        matches!(self, AppleModel::AppleIIe | AppleModel::AppleIIeEnhanced)
    }

    pub fn cpu_type(self) -> CpuType {
        match self {
            AppleModel::AppleIIeEnhanced => CpuType::Cpu65C02,
            _ => CpuType::Cpu6502,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            AppleModel::AppleII => "Apple ][",
            AppleModel::AppleIIPlus => "Apple ][+",
            AppleModel::AppleIIe => "Apple //e",
            AppleModel::AppleIIeEnhanced => "Apple //e (enhanced)",
        }
    }
}

/// Apple IIエミュレータのメイン構造体
pub struct Apple2 {
    pub model: AppleModel,
    /// 6502/65C02 CPU
    pub cpu: Cpu,
    pub mmu: Mmu,
    pub io: IoPage,
    cards: [Option<Box<dyn Card>>; 8],
    /// マシン全体の累積サイクル数（CPUとDMAの両方で進む）
    cycles: u64,
    /// 高速モード要求の数（0以下ならペース調整する）
    fast_requests: Arc<AtomicI32>,
    /// DMAでバスを握っているスロット
    dma_slot: Option<usize>,
    /// 実行ループに返す致命的エラー
    fatal: Option<EmuError>,
    /// キャラクタROM（外部レンダラー用）
    pub char_rom: Vec<u8>,
    pub char_gen_page: usize,
}

/// メモリバスの実装（$C000-$C0FFはI/Oページ）
impl MemoryBus for Apple2 {
    fn read(&mut self, address: u16) -> u8 {
        match address {
            0xC000..=0xC0FF => self.io_read(address),
            _ => self.mmu.peek(address),
        }
    }

    fn write(&mut self, address: u16, value: u8) {
        match address {
            0xC000..=0xC0FF => self.io_write(address, value),
            _ => self.mmu.poke(address, value),
        }
    }

    fn fetch(&mut self, address: u16) -> u8 {
        match address {
            0xC000..=0xC0FF => self.io_read(address),
            _ => self.mmu.peek_code(address),
        }
    }
}

impl Apple2 {
    /// 機種とROMイメージからマシンを作る（リセット前の状態）
    pub fn new(model: AppleModel, rom: &[u8]) -> Result<Self> {
        let is_iie = model.is_iie();
        let mut mmu = Mmu::new(is_iie);
        mmu.load_rom(rom)?;
        if is_iie {
            mmu.set_aux_banks(1);
            mmu.install_language_card(1);
        }
        log::info!("{} with {} KiB ROM", model.name(), rom.len() / 1024);
        Ok(Apple2 {
            model,
            cpu: Cpu::new(model.cpu_type()),
            mmu,
            io: IoPage::new(is_iie),
            cards: Default::default(),
            cycles: 0,
            fast_requests: Arc::new(AtomicI32::new(0)),
            dma_slot: None,
            fatal: None,
            char_rom: Vec::new(),
            char_gen_page: 0,
        })
    }

    //--------------------------------------------------
    // サイクル
    //--------------------------------------------------

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// DMAカードなどCPU以外が消費したサイクルを加算
    pub fn add_cycles(&mut self, cycles: u64) {
        self.cycles += cycles;
    }

    /// 1命令（DMA中はカードの1サイクル）を実行し、進んだサイクル数を返す
    pub fn step(&mut self) -> u64 {
        let start = self.cycles;
        match self.dma_slot {
            Some(slot) => {
                if self.with_card(slot, |card, m| card.dma_cycle(m)).is_none() {
                    log::warn!("DMA holder slot {} is empty; returning the bus to the CPU", slot);
                    self.dma_slot = None;
                }
            }
            None => {
                // CPUを一時的に取り出して実行
                let mut cpu = std::mem::take(&mut self.cpu);
                let cycles = cpu.step(self);
                self.cpu = cpu;
                self.cycles += cycles as u64;
            }
        }
        self.cycles - start
    }

    /// 少なくとも`cycles`サイクル実行する。致命的エラーが起きたら止まる
    pub fn run_cycles(&mut self, cycles: u64) {
        let target = self.cycles + cycles;
        while self.cycles < target && self.fatal.is_none() {
            self.step();
        }
    }

    /// CPUリセット
    ///
    /// MMUのスイッチとPAGE2/HIRES/80COLを解除し、TEXT/MIXEDとキーボードラッチは残す。
    pub fn reset(&mut self) {
        self.mmu.reset();
        self.io.video.page2 = false;
        self.io.video.hires = false;
        self.io.video.col80 = false;
        self.mmu.set_video_flags(false, false);
        self.dma_slot = None;
        for slot in 0..8 {
            self.with_card(slot, |card, m| card.reset(m));
        }

        // CPUを一時的に取り出してリセット
        let mut cpu = std::mem::take(&mut self.cpu);
        cpu.reset(self);
        self.cpu = cpu;
        self.cycles += 6;
        log::info!("reset: PC=${:04X}", self.cpu.regs.pc);
    }

    //--------------------------------------------------
    // スロット
    //--------------------------------------------------

    /// カードを取り出して呼び出し、スロットに戻す。空スロットならNone
    fn with_card<R>(&mut self, slot: usize, f: impl FnOnce(&mut dyn Card, &mut Apple2) -> R) -> Option<R> {
        let mut card = self.cards.get_mut(slot)?.take()?;
        let result = f(card.as_mut(), self);
        self.cards[slot] = Some(card);
        Some(result)
    }

    /// スロットにカードを装着する
    pub fn insert_card(&mut self, slot: usize, mut card: Box<dyn Card>) -> Result<()> {
        if slot > 7 {
            return Err(EmuError::ConfigInvalid(format!("slot {} does not exist", slot)));
        }
        self.remove_card(slot);
        card.assign(slot, self)?;
        log::info!("slot {}: {}", slot, card.name());
        self.cards[slot] = Some(card);
        Ok(())
    }

    /// カードを外す（ROMとソフトスイッチも外す）
    pub fn remove_card(&mut self, slot: usize) -> Option<Box<dyn Card>> {
        let mut card = self.cards.get_mut(slot)?.take()?;
        card.unassign(self);
        self.io.remove_card_softswitches(slot);
        self.mmu.remove_card_rom(slot);
        if self.dma_slot == Some(slot) {
            self.dma_slot = None;
        }
        Some(card)
    }

    /// 装着されているカードの名前
    pub fn card_name(&self, slot: usize) -> Option<&str> {
        self.cards.get(slot)?.as_ref().map(|c| c.name())
    }

    pub(crate) fn card_read(&mut self, slot: usize, index: u8) -> u8 {
        self.with_card(slot, |card, m| card.read_softswitch(index, m))
            .unwrap_or_else(|| self.cycles as u8)
    }

    pub(crate) fn card_write(&mut self, slot: usize, index: u8, value: u8) {
        self.with_card(slot, |card, m| card.write_softswitch(index, value, m));
    }

    /// 最初にディスクを受け付けたカードにイメージを入れる
    pub fn load_disk(&mut self, drive: usize, path: &Path) -> Result<()> {
        for slot in 0..8 {
            if let Some(accepted) = self.with_card(slot, |card, _| card.load_disk(drive, path)) {
                if accepted? {
                    return Ok(());
                }
            }
        }
        Err(EmuError::ConfigInvalid(
            "no disk controller is installed".to_string(),
        ))
    }

    //--------------------------------------------------
    // DMAと高速モード
    //--------------------------------------------------

    /// スロットがバスを握る。別のスロットが保持中ならBusConflict（致命的）
    pub fn activate_dma(&mut self, slot: usize) -> Result<()> {
        if let Some(holder) = self.dma_slot {
            if holder != slot {
                log::error!("bus conflict: slot {} requested DMA held by slot {}", slot, holder);
                self.fatal = Some(EmuError::BusConflict {
                    holder,
                    requester: slot,
                });
                return Err(EmuError::BusConflict {
                    holder,
                    requester: slot,
                });
            }
        }
        self.dma_slot = Some(slot);
        self.mmu.invalidate_cache();
        Ok(())
    }

    pub fn deactivate_dma(&mut self) {
        self.dma_slot = None;
        self.mmu.invalidate_cache();
    }

    pub fn dma_slot(&self) -> Option<usize> {
        self.dma_slot
    }

    /// 実行ループに返す致命的エラーを取り出す
    pub fn take_fatal(&mut self) -> Option<EmuError> {
        self.fatal.take()
    }

    pub fn request_fast_mode(&self) {
        self.fast_requests.fetch_add(1, Ordering::SeqCst);
    }

    pub fn release_fast_mode(&self) {
        self.fast_requests.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn fast_requests(&self) -> i32 {
        self.fast_requests.load(Ordering::SeqCst)
    }

    /// 実行ループと共有する高速モードカウンタ
    pub fn fast_mode_counter(&self) -> Arc<AtomicI32> {
        Arc::clone(&self.fast_requests)
    }

    //--------------------------------------------------
    // 入出力
    //--------------------------------------------------

    /// 先行入力に文字列を積む
    pub fn type_text(&mut self, text: &str) {
        self.io.keyboard.type_text(text);
    }

    /// スピーカークリックを取得してクリア
    pub fn take_speaker_clicks(&mut self) -> Vec<u64> {
        std::mem::take(&mut self.io.speaker_clicks)
    }

    pub fn connect_joystick(&mut self, connected: bool) {
        self.io.joystick.connected = connected;
    }

    pub fn set_paddle(&mut self, index: usize, value: u8) {
        self.io.joystick.paddles[index & 3] = value;
    }

    pub fn set_button(&mut self, index: usize, pressed: bool) {
        if let Some(button) = self.io.joystick.buttons.get_mut(index) {
            *button = pressed;
        }
    }

    /// 次のキャラクタジェネレータに切り替える
    pub fn next_char_gen(&mut self) {
        let pages = (self.char_rom.len() / CHAR_GEN_SIZE).max(1);
        self.char_gen_page = (self.char_gen_page + 1) % pages;
        log::info!("character generator {}/{}", self.char_gen_page + 1, pages);
    }

    /// テキスト画面を文字列にする（40/80桁、行末の空白は削る）
    pub fn text_snapshot(&self) -> String {
        let video = self.io.video;
        let secondary = video.page2 && !self.mmu.store80;
        let main = self.mmu.text_page(secondary, false);
        let col80 = video.col80 && self.model.is_iie() && self.mmu.aux_banks() > 0;
        let aux = self.mmu.text_page(secondary, true);

        let mut lines = Vec::with_capacity(24);
        for row in 0..24 {
            let base = (row % 8) * 0x80 + (row / 8) * 0x28;
            let mut line = String::with_capacity(80);
            for col in 0..40 {
                if col80 {
                    line.push(screen_char(aux[base + col]));
                }
                line.push(screen_char(main[base + col]));
            }
            lines.push(line.trim_end().to_string());
        }
        lines.join("\n")
    }

    /// デバッグ表示
    pub fn debug_info(&self) -> String {
        let r = &self.cpu.regs;
        let mut out = format!(
            "{} cycles={} PC={:04X} A={:02X} X={:02X} Y={:02X} S={:02X} P={:02X}\n",
            self.model.name(),
            self.cycles,
            r.pc,
            r.a,
            r.x,
            r.y,
            r.sp,
            r.status
        );
        out += &format!(
            "TEXT={} MIXED={} PAGE2={} HIRES={} 80COL={} 80STORE={} RAMRD={} RAMWRT={} ALTZP={} LCRAM={} LCBNK2={}\n",
            self.flag(Flag::Text) as u8,
            self.flag(Flag::Mixed) as u8,
            self.flag(Flag::Page2) as u8,
            self.flag(Flag::Hires) as u8,
            self.flag(Flag::Col80) as u8,
            self.flag(Flag::Store80) as u8,
            self.flag(Flag::RamRd) as u8,
            self.flag(Flag::RamWrt) as u8,
            self.flag(Flag::AltZp) as u8,
            self.flag(Flag::LcRam) as u8,
            self.flag(Flag::LcBank2) as u8,
        );
        for (slot, card) in self.cards.iter().enumerate() {
            if let Some(card) = card {
                let info = card.debug_info();
                out += &format!("slot {}: {} {}\n", slot, card.name(), info);
            }
        }
        out
    }
}

/// 画面コードを表示文字にする（反転・点滅は通常文字として扱う）
fn screen_char(code: u8) -> char {
    let c = match code {
        0x00..=0x7F => {
            let c = code & 0x3F;
            if c < 0x20 {
                c + 0x40
            } else {
                c
            }
        }
        0x80..=0x9F => code - 0x40,
        _ => code & 0x7F,
    };
    if c == 0x7F {
        ' '
    } else {
        char::from(c)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// $F000: JMP $F000 だけのROM
    pub(crate) fn test_rom(size: usize) -> Vec<u8> {
        let mut rom = vec![0xEA; size];
        let f000 = size - 0x1000;
        rom[f000..f000 + 3].copy_from_slice(&[0x4C, 0x00, 0xF0]);
        for vector in [size - 6, size - 4, size - 2] {
            rom[vector] = 0x00;
            rom[vector + 1] = 0xF0;
        }
        rom
    }

    pub(crate) fn test_machine(model: AppleModel) -> Apple2 {
        let size = if model.is_iie() { 0x4000 } else { 0x3000 };
        let mut m = Apple2::new(model, &test_rom(size)).unwrap();
        m.reset();
        m
    }

    /// DMAで$0300に書き込み、指定サイクル後にバスを返すカード
    struct DmaCard {
        remaining: u32,
    }

    impl Card for DmaCard {
        fn name(&self) -> &str {
            "dmatest"
        }
        fn assign(&mut self, slot: usize, machine: &mut Apple2) -> Result<()> {
            machine.io.add_card_softswitches(slot, &[], "DMATEST");
            Ok(())
        }
        fn read_softswitch(&mut self, _index: u8, machine: &mut Apple2) -> u8 {
            let _ = machine.activate_dma(4);
            0
        }
        fn write_softswitch(&mut self, _index: u8, _value: u8, _machine: &mut Apple2) {}
        fn dma_cycle(&mut self, machine: &mut Apple2) {
            let value = machine.read(0x0300);
            machine.write(0x0300, value.wrapping_add(1));
            machine.add_cycles(1);
            self.remaining -= 1;
            if self.remaining == 0 {
                machine.deactivate_dma();
            }
        }
    }

    #[test]
    fn test_reset_vector_and_step() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        assert_eq!(m.cpu.regs.pc, 0xF000);
        let before = m.cycles();
        assert_eq!(m.step(), 3);
        assert_eq!(m.cycles(), before + 3);
        assert_eq!(m.cpu.regs.pc, 0xF000);
    }

    #[test]
    fn test_run_cycles() {
        let mut m = test_machine(AppleModel::AppleIIeEnhanced);
        let before = m.cycles();
        m.run_cycles(1000);
        assert!(m.cycles() >= before + 1000);
        assert!(m.cycles() < before + 1003);
    }

    #[test]
    fn test_dma_handoff() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        m.insert_card(4, Box::new(DmaCard { remaining: 5 })).unwrap();
        let regs = m.cpu.regs.clone();
        m.read(0xC0C0);
        assert_eq!(m.dma_slot(), Some(4));

        let before = m.cycles();
        for _ in 0..5 {
            assert_eq!(m.step(), 1);
        }
        assert_eq!(m.dma_slot(), None);
        assert_eq!(m.cycles(), before + 5);
        assert_eq!(m.mmu.peek(0x0300), 5);
        assert_eq!(m.cpu.regs, regs);
    }

    #[test]
    fn test_dma_toggle_leaves_state() {
        let mut m = test_machine(AppleModel::AppleIIe);
        m.write(0xC005, 0);
        let regs = m.cpu.regs.clone();
        let cycles = m.cycles();
        m.activate_dma(4).unwrap();
        m.deactivate_dma();
        assert_eq!(m.cpu.regs, regs);
        assert_eq!(m.cycles(), cycles);
        assert!(m.mmu.alt_main_write);
        assert!(!m.mmu.alt_main_read);
    }

    #[test]
    fn test_bus_conflict_is_fatal() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        m.activate_dma(2).unwrap();
        let err = m.activate_dma(5).unwrap_err();
        assert!(matches!(err, EmuError::BusConflict { holder: 2, requester: 5 }));
        assert!(matches!(m.take_fatal(), Some(EmuError::BusConflict { .. })));
        assert!(m.take_fatal().is_none());
    }

    #[test]
    fn test_empty_slot_reads_floating() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        m.insert_card(4, Box::new(DmaCard { remaining: 1 })).unwrap();
        assert_eq!(m.card_name(4), Some("dmatest"));
        assert!(m.remove_card(4).is_some());
        assert_eq!(m.card_name(4), None);
        let expected = m.cycles() as u8;
        assert_eq!(m.read(0xC0C0), expected);
        assert_eq!(m.dma_slot(), None);
    }

    #[test]
    fn test_fast_mode_counter() {
        let m = test_machine(AppleModel::AppleIIPlus);
        let shared = m.fast_mode_counter();
        m.request_fast_mode();
        m.request_fast_mode();
        m.release_fast_mode();
        assert_eq!(shared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_text_snapshot() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        // 空白で埋める（0は反転の'@'）
        for address in 0x0400..0x0800u16 {
            m.write(address, 0xA0);
        }
        for (i, c) in b"HELLO".iter().enumerate() {
            m.write(0x0400 + i as u16, c | 0x80);
        }
        m.write(0x0480, 0x01); // 反転 'A'
        m.write(0x0428, b']' | 0x80);
        let text = m.text_snapshot();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 24);
        assert_eq!(lines[0], "HELLO");
        assert_eq!(lines[1], "A");
        assert_eq!(lines[8], "]");
        assert_eq!(lines[23], "");
    }

    #[test]
    fn test_text_snapshot_zeroed_screen_is_inverse_at() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        for address in 0x0400..0x0428u16 {
            m.write(address, 0x00);
        }
        let text = m.text_snapshot();
        assert_eq!(text.lines().next(), Some("@".repeat(40).as_str()));
    }

    #[test]
    fn test_text_snapshot_80_columns() {
        let mut m = test_machine(AppleModel::AppleIIe);
        m.write(0xC00D, 0); // 80COL
        m.write(0xC001, 0); // 80STORE
        m.read(0xC055); // PAGE2 → 補助
        m.write(0x0400, b'A' | 0x80);
        m.read(0xC054);
        m.write(0x0400, b'B' | 0x80);
        assert!(m.text_snapshot().starts_with("AB"));
    }

    #[test]
    fn test_load_disk_without_controller() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        assert!(matches!(
            m.load_disk(0, Path::new("/tmp/none.dsk")),
            Err(EmuError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_rom_too_small() {
        assert!(matches!(
            Apple2::new(AppleModel::AppleIIPlus, &[0u8; 100]),
            Err(EmuError::ResourceMissing(_))
        ));
    }
}
