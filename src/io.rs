//! I/Oページ（$C000-$C0FF）
//!
//! 256個の読み取り/書き込みハンドラ表。組み込みスイッチ（キーボード、スピーカー、
//! ビデオフラグ、パドル、IIeのMMU/IOUスイッチ）とカードのソフトスイッチを振り分ける。

use std::collections::VecDeque;

use crate::apple2::Apple2;

/// 1フレームのサイクル数（262ライン × 65サイクル）
pub const CYCLES_PER_FRAME: u64 = 17030;
/// フレーム末尾の垂直帰線期間
pub const VBL_CYCLES: u64 = 4550;
/// パドルタイマーのサイクル数 = 係数 × パドル値
pub const PADDLE_CYCLES_PER_UNIT: u64 = 11;

/// ソフトスイッチで切り替わるフラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Text,
    Mixed,
    Page2,
    Hires,
    Col80,
    AltChar,
    Store80,
    RamRd,
    RamWrt,
    IntCxRom,
    AltZp,
    SlotC3Rom,
    /// $C011 RDLCBNK2
    LcBank2,
    /// $C012 RDLCRAM
    LcRam,
}

/// 組み込みスイッチ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Switch {
    Keyboard,
    ClearStrobe,
    Speaker,
    Set(Flag, bool),
    Annunciator(u8, bool),
    /// 7ビット目にフラグ、下位7ビットにキーボードラッチ
    Status(Flag),
    Vbl,
    Button(u8),
    Paddle(u8),
    PaddleTrigger,
    RamWorksBank,
    LanguageCard,
}

/// ハンドラ表の1エントリ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Handler {
    Unassigned,
    BuiltIn(Switch),
    Card { slot: usize, index: u8 },
}

/// ビデオ関連フラグ
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VideoFlags {
    pub text: bool,
    pub mixed: bool,
    pub page2: bool,
    pub hires: bool,
    pub col80: bool,
    pub alt_char: bool,
    pub annunciators: [bool; 4],
}

impl Default for VideoFlags {
    fn default() -> Self {
        VideoFlags {
            text: true,
            mixed: false,
            page2: false,
            hires: false,
            col80: false,
            alt_char: false,
            annunciators: [false; 4],
        }
    }
}

/// キーボードラッチと先行入力
#[derive(Debug, Clone, Default)]
pub struct Keyboard {
    latch: u8,
    strobe: bool,
    queue: VecDeque<u8>,
    /// 英小文字を大文字にする
    pub force_caps: bool,
}

impl Keyboard {
    fn translate(&self, key: u8) -> u8 {
        let key = match key {
            b'\n' => 0x0D,
            _ => key & 0x7F,
        };
        if self.force_caps {
            key.to_ascii_uppercase()
        } else {
            key
        }
    }

    /// キーを押す（先行入力を追い越してラッチする）
    pub fn press(&mut self, key: u8) {
        self.latch = self.translate(key);
        self.strobe = true;
    }

    /// 文字列を先行入力に積む。ストローブが落ちるたびに1文字ずつラッチされる
    pub fn type_text(&mut self, text: &str) {
        for c in text.chars().filter(char::is_ascii) {
            let key = self.translate(c as u8);
            self.queue.push_back(key);
        }
        if !self.strobe {
            self.next_key();
        }
    }

    pub fn has_strobe(&self) -> bool {
        self.strobe
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    fn value(&self) -> u8 {
        self.latch | if self.strobe { 0x80 } else { 0 }
    }

    fn clear_strobe(&mut self) {
        self.strobe = false;
        self.next_key();
    }

    fn next_key(&mut self) {
        if let Some(key) = self.queue.pop_front() {
            self.latch = key;
            self.strobe = true;
        }
    }
}

/// ジョイスティック（パドル0〜3、ボタン0〜2）
#[derive(Debug, Clone)]
pub struct Joystick {
    pub connected: bool,
    pub paddles: [u8; 4],
    pub buttons: [bool; 3],
    /// $C070を読んだサイクル
    trigger_cycle: u64,
}

impl Default for Joystick {
    fn default() -> Self {
        Joystick {
            connected: false,
            paddles: [0x80; 4],
            buttons: [false; 3],
            trigger_cycle: 0,
        }
    }
}

/// I/Oページ
pub struct IoPage {
    read: [Handler; 256],
    write: [Handler; 256],
    read_names: [&'static str; 256],
    write_names: [&'static str; 256],
    pub video: VideoFlags,
    pub keyboard: Keyboard,
    pub joystick: Joystick,
    /// スピーカーをクリックしたサイクル
    pub speaker_clicks: Vec<u64>,
    /// 組み込みスイッチへのアクセスをログ出力
    pub trace: bool,
}

impl IoPage {
    pub fn new(is_iie: bool) -> Self {
        let mut io = IoPage {
            read: [Handler::Unassigned; 256],
            write: [Handler::Unassigned; 256],
            read_names: [""; 256],
            write_names: [""; 256],
            video: VideoFlags::default(),
            keyboard: Keyboard::default(),
            joystick: Joystick::default(),
            speaker_clicks: Vec::with_capacity(4096),
            trace: false,
        };
        io.install_base();
        if is_iie {
            io.install_iie();
        }
        io
    }

    fn both(&mut self, address: u8, switch: Switch, name: &'static str) {
        self.add_softswitch_read(address, Handler::BuiltIn(switch), name);
        self.add_softswitch_write(address, Handler::BuiltIn(switch), name);
    }

    /// II/II+の組み込みスイッチ
    fn install_base(&mut self) {
        for a in 0x00..=0x0F {
            self.add_softswitch_read(a, Handler::BuiltIn(Switch::Keyboard), "KBD");
        }
        for a in 0x10..=0x1F {
            self.both(a, Switch::ClearStrobe, "KBDSTRB");
        }
        self.add_softswitch_read(0x19, Handler::BuiltIn(Switch::Vbl), "RDVBLBAR");
        for a in 0x30..=0x3F {
            self.both(a, Switch::Speaker, "SPKR");
        }
        const VIDEO: [(Flag, &str, &str); 4] = [
            (Flag::Text, "TXTCLR", "TXTSET"),
            (Flag::Mixed, "MIXCLR", "MIXSET"),
            (Flag::Page2, "TXTPAGE1", "TXTPAGE2"),
            (Flag::Hires, "LORES", "HIRES"),
        ];
        for (i, (flag, off, on)) in VIDEO.iter().enumerate() {
            let a = 0x50 + 2 * i as u8;
            self.both(a, Switch::Set(*flag, false), *off);
            self.both(a + 1, Switch::Set(*flag, true), *on);
        }
        const ANNUNCIATORS: [(&str, &str); 4] = [
            ("CLRAN0", "SETAN0"),
            ("CLRAN1", "SETAN1"),
            ("CLRAN2", "SETAN2"),
            ("CLRAN3", "SETAN3"),
        ];
        for (i, (off, on)) in ANNUNCIATORS.iter().enumerate() {
            let a = 0x58 + 2 * i as u8;
            self.both(a, Switch::Annunciator(i as u8, false), *off);
            self.both(a + 1, Switch::Annunciator(i as u8, true), *on);
        }
        for (i, name) in ["PB0", "PB1", "PB2"].iter().enumerate() {
            self.add_softswitch_read(0x61 + i as u8, Handler::BuiltIn(Switch::Button(i as u8)), *name);
        }
        for (i, name) in ["PADDL0", "PADDL1", "PADDL2", "PADDL3"].iter().enumerate() {
            self.add_softswitch_read(0x64 + i as u8, Handler::BuiltIn(Switch::Paddle(i as u8)), *name);
        }
        for a in 0x70..=0x7F {
            self.both(a, Switch::PaddleTrigger, "PTRIG");
        }
    }

    /// IIeで追加されるスイッチ
    fn install_iie(&mut self) {
        const MMU: [(Flag, &str, &str); 8] = [
            (Flag::Store80, "80STOREOFF", "80STOREON"),
            (Flag::RamRd, "RAMRDOFF", "RAMRDON"),
            (Flag::RamWrt, "RAMWRTOFF", "RAMWRTON"),
            (Flag::IntCxRom, "INTCXROMOFF", "INTCXROMON"),
            (Flag::AltZp, "ALTZPOFF", "ALTZPON"),
            (Flag::SlotC3Rom, "SLOTC3ROMOFF", "SLOTC3ROMON"),
            (Flag::Col80, "80COLOFF", "80COLON"),
            (Flag::AltChar, "ALTCHARSETOFF", "ALTCHARSETON"),
        ];
        for (i, (flag, off, on)) in MMU.iter().enumerate() {
            let a = 2 * i as u8;
            self.add_softswitch_write(a, Handler::BuiltIn(Switch::Set(*flag, false)), *off);
            self.add_softswitch_write(a + 1, Handler::BuiltIn(Switch::Set(*flag, true)), *on);
        }
        const STATUS: [(u8, Flag, &str); 14] = [
            (0x11, Flag::LcBank2, "RDLCBNK2"),
            (0x12, Flag::LcRam, "RDLCRAM"),
            (0x13, Flag::RamRd, "RDRAMRD"),
            (0x14, Flag::RamWrt, "RDRAMWRT"),
            (0x15, Flag::IntCxRom, "RDCXROM"),
            (0x16, Flag::AltZp, "RDALTZP"),
            (0x17, Flag::SlotC3Rom, "RDC3ROM"),
            (0x18, Flag::Store80, "RD80STORE"),
            (0x1A, Flag::Text, "RDTEXT"),
            (0x1B, Flag::Mixed, "RDMIXED"),
            (0x1C, Flag::Page2, "RDPAGE2"),
            (0x1D, Flag::Hires, "RDHIRES"),
            (0x1E, Flag::AltChar, "RDALTCHAR"),
            (0x1F, Flag::Col80, "RD80COL"),
        ];
        for (a, flag, name) in STATUS {
            self.add_softswitch_read(a, Handler::BuiltIn(Switch::Status(flag)), name);
        }
        for a in [0x71, 0x73, 0x75, 0x77] {
            self.add_softswitch_write(a, Handler::BuiltIn(Switch::RamWorksBank), "RAMWORKSBANK");
        }
        for a in 0x80..=0x8F {
            self.both(a, Switch::LanguageCard, "LANGCARD");
        }
    }

    /// 読み取りハンドラを登録
    pub fn add_softswitch_read(&mut self, address: u8, handler: Handler, name: &'static str) {
        self.read[address as usize] = handler;
        self.read_names[address as usize] = name;
    }

    /// 書き込みハンドラを登録
    pub fn add_softswitch_write(&mut self, address: u8, handler: Handler, name: &'static str) {
        self.write[address as usize] = handler;
        self.write_names[address as usize] = name;
    }

    /// スロットの16バイト窓（$C080+slot*16）をカードに割り当てる
    pub fn add_card_softswitches(&mut self, slot: usize, names: &[&'static str], card_name: &'static str) {
        for index in 0..16u8 {
            let address = 0x80 + (slot as u8 & 7) * 16 + index;
            let name = names.get(index as usize).copied().unwrap_or(card_name);
            let handler = Handler::Card { slot, index };
            self.add_softswitch_read(address, handler, name);
            self.add_softswitch_write(address, handler, name);
        }
        log::debug!("slot {} softswitches registered at $C0{:X}0", slot, 8 + slot);
    }

    /// スロットのソフトスイッチを外す
    pub fn remove_card_softswitches(&mut self, slot: usize) {
        for index in 0..16u8 {
            let address = 0x80 + (slot as u8 & 7) * 16 + index;
            self.add_softswitch_read(address, Handler::Unassigned, "");
            self.add_softswitch_write(address, Handler::Unassigned, "");
        }
    }

    pub fn read_handler(&self, address: u8) -> Handler {
        self.read[address as usize]
    }

    pub fn write_handler(&self, address: u8) -> Handler {
        self.write[address as usize]
    }

    pub fn read_name(&self, address: u8) -> &'static str {
        self.read_names[address as usize]
    }

    pub fn write_name(&self, address: u8) -> &'static str {
        self.write_names[address as usize]
    }
}

/// `cycle`がフレーム末尾の垂直帰線期間内か
pub fn in_vbl(cycle: u64) -> bool {
    cycle % CYCLES_PER_FRAME >= CYCLES_PER_FRAME - VBL_CYCLES
}

//--------------------------------------------------
// マシン側のディスパッチ
//--------------------------------------------------

impl Apple2 {
    /// $C000-$C0FFの読み取り
    pub(crate) fn io_read(&mut self, address: u16) -> u8 {
        let low = address as u8;
        let value = match self.io.read_handler(low) {
            Handler::Unassigned => self.cycles() as u8,
            Handler::BuiltIn(switch) => self.builtin_read(switch, low),
            Handler::Card { slot, index } => self.card_read(slot, index),
        };
        if self.io.trace {
            log::trace!(target: "io", "read  ${:04X} {:<12} -> ${:02X}", address, self.io.read_name(low), value);
        }
        self.mmu.invalidate_cache();
        value
    }

    /// $C000-$C0FFへの書き込み
    pub(crate) fn io_write(&mut self, address: u16, value: u8) {
        let low = address as u8;
        match self.io.write_handler(low) {
            Handler::Unassigned => {}
            Handler::BuiltIn(switch) => self.builtin_write(switch, low, value),
            Handler::Card { slot, index } => self.card_write(slot, index, value),
        }
        if self.io.trace {
            log::trace!(target: "io", "write ${:04X} {:<12} <- ${:02X}", address, self.io.write_name(low), value);
        }
        self.mmu.invalidate_cache();
    }

    fn builtin_read(&mut self, switch: Switch, address: u8) -> u8 {
        let floating = self.cycles() as u8;
        match switch {
            Switch::Keyboard => self.io.keyboard.value(),
            Switch::ClearStrobe => {
                let value = self.io.keyboard.value();
                self.io.keyboard.clear_strobe();
                value
            }
            Switch::Status(flag) => {
                let bit = if self.flag(flag) { 0x80 } else { 0 };
                bit | (self.io.keyboard.latch & 0x7F)
            }
            Switch::Vbl => {
                // IIe以外は極性が逆
                let bit = if in_vbl(self.cycles()) == self.mmu.is_iie { 0x80 } else { 0 };
                bit | (self.io.keyboard.latch & 0x7F)
            }
            Switch::Button(i) => {
                if self.io.joystick.buttons[i as usize] {
                    0x80
                } else {
                    0
                }
            }
            Switch::Paddle(i) => self.paddle_value(i),
            Switch::LanguageCard => {
                self.mmu.lc_softswitch(address & 0x0F, false);
                floating
            }
            _ => {
                self.builtin_write(switch, address, floating);
                floating
            }
        }
    }

    fn builtin_write(&mut self, switch: Switch, address: u8, value: u8) {
        match switch {
            Switch::ClearStrobe => self.io.keyboard.clear_strobe(),
            Switch::Speaker => {
                let cycle = self.cycles();
                self.io.speaker_clicks.push(cycle);
            }
            Switch::Set(flag, on) => self.set_flag(flag, on),
            Switch::Annunciator(i, on) => self.io.video.annunciators[i as usize] = on,
            Switch::PaddleTrigger => self.io.joystick.trigger_cycle = self.cycles(),
            Switch::RamWorksBank => self.mmu.select_ext_bank(value),
            Switch::LanguageCard => self.mmu.lc_softswitch(address & 0x0F, true),
            Switch::Keyboard | Switch::Status(_) | Switch::Vbl | Switch::Button(_) | Switch::Paddle(_) => {}
        }
    }

    fn paddle_value(&self, index: u8) -> u8 {
        let joystick = &self.io.joystick;
        if !joystick.connected {
            return 0xFF;
        }
        let elapsed = self.cycles().saturating_sub(joystick.trigger_cycle);
        let duration = PADDLE_CYCLES_PER_UNIT * joystick.paddles[index as usize] as u64;
        if elapsed < duration {
            0x80
        } else {
            0
        }
    }

    /// フラグの現在値
    pub fn flag(&self, flag: Flag) -> bool {
        let video = &self.io.video;
        match flag {
            Flag::Text => video.text,
            Flag::Mixed => video.mixed,
            Flag::Page2 => video.page2,
            Flag::Hires => video.hires,
            Flag::Col80 => video.col80,
            Flag::AltChar => video.alt_char,
            Flag::Store80 => self.mmu.store80,
            Flag::RamRd => self.mmu.alt_main_read,
            Flag::RamWrt => self.mmu.alt_main_write,
            Flag::IntCxRom => self.mmu.int_cx_rom,
            Flag::AltZp => self.mmu.alt_zp,
            Flag::SlotC3Rom => self.mmu.slot_c3_rom,
            Flag::LcBank2 => !self.mmu.lc_alt_bank,
            Flag::LcRam => self.mmu.lc_read,
        }
    }

    /// フラグを設定。PAGE2/HIRESはMMUの写しも更新する
    pub fn set_flag(&mut self, flag: Flag, on: bool) {
        match flag {
            Flag::Text => self.io.video.text = on,
            Flag::Mixed => self.io.video.mixed = on,
            Flag::Page2 => self.io.video.page2 = on,
            Flag::Hires => self.io.video.hires = on,
            Flag::Col80 => self.io.video.col80 = on,
            Flag::AltChar => self.io.video.alt_char = on,
            Flag::Store80 => self.mmu.store80 = on,
            Flag::RamRd => self.mmu.alt_main_read = on,
            Flag::RamWrt => self.mmu.alt_main_write = on,
            Flag::IntCxRom => self.mmu.int_cx_rom = on,
            Flag::AltZp => self.mmu.alt_zp = on,
            Flag::SlotC3Rom => self.mmu.slot_c3_rom = on,
            Flag::LcBank2 | Flag::LcRam => {}
        }
        let video = self.io.video;
        self.mmu.set_video_flags(video.page2, video.hires);
        self.mmu.invalidate_cache();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apple2::tests::test_machine;
    use crate::apple2::AppleModel;
    use crate::cpu::MemoryBus;

    #[test]
    fn test_keyboard_strobe() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        assert_eq!(m.read(0xC000) & 0x80, 0);
        m.io.keyboard.press(b'A');
        assert_eq!(m.read(0xC000), 0xC1);
        m.read(0xC010);
        assert_eq!(m.read(0xC000), 0x41);
        m.io.keyboard.press(b'B');
        m.write(0xC010, 0);
        assert_eq!(m.read(0xC000) & 0x80, 0);
    }

    #[test]
    fn test_type_ahead_and_force_caps() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        m.io.keyboard.force_caps = true;
        m.type_text("ab\n");
        assert_eq!(m.read(0xC000), 0xC1);
        m.read(0xC010);
        assert_eq!(m.read(0xC000), 0xC2);
        m.read(0xC010);
        assert_eq!(m.read(0xC000), 0x8D);
        m.read(0xC010);
        assert_eq!(m.read(0xC000) & 0x80, 0);
    }

    #[test]
    fn test_video_switches() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        assert!(m.io.video.text);
        m.read(0xC050);
        m.read(0xC053);
        m.write(0xC055, 0);
        m.read(0xC057);
        m.read(0xC05B);
        let v = m.io.video;
        assert!(!v.text && v.mixed && v.page2 && v.hires);
        assert!(v.annunciators[1]);
        m.read(0xC054);
        assert!(!m.io.video.page2);
    }

    #[test]
    fn test_speaker_clicks() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        let base = m.cycles();
        m.add_cycles(100);
        m.read(0xC030);
        m.add_cycles(50);
        m.write(0xC030, 0);
        assert_eq!(m.take_speaker_clicks(), vec![base + 100, base + 150]);
        assert!(m.take_speaker_clicks().is_empty());
    }

    #[test]
    fn test_paddles() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        assert_eq!(m.read(0xC064), 0xFF);
        m.connect_joystick(true);
        m.set_paddle(0, 10);
        m.set_button(1, true);
        m.read(0xC070);
        assert_eq!(m.read(0xC064), 0x80);
        m.add_cycles(109);
        assert_eq!(m.read(0xC064), 0x80);
        m.add_cycles(1);
        assert_eq!(m.read(0xC064), 0x00);
        assert_eq!(m.read(0xC062), 0x80);
        assert_eq!(m.read(0xC061), 0x00);
    }

    #[test]
    fn test_unassigned_returns_cycle_low_byte() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        m.add_cycles(0x1234);
        let expected = m.cycles() as u8;
        assert_eq!(m.read(0xC020), expected);
    }

    #[test]
    fn test_iie_mmu_switches_and_status() {
        let mut m = test_machine(AppleModel::AppleIIeEnhanced);
        m.write(0xC001, 0);
        m.write(0xC003, 0);
        m.write(0xC009, 0);
        assert!(m.mmu.store80 && m.mmu.alt_main_read && m.mmu.alt_zp);
        assert_eq!(m.read(0xC018) & 0x80, 0x80);
        assert_eq!(m.read(0xC013) & 0x80, 0x80);
        assert_eq!(m.read(0xC014) & 0x80, 0);
        m.write(0xC000, 0);
        assert!(!m.mmu.store80);
        // 読み取りではMMUスイッチは変わらない
        m.read(0xC001);
        assert!(!m.mmu.store80);
        m.write(0xC00D, 0);
        assert_eq!(m.read(0xC01F) & 0x80, 0x80);
    }

    #[test]
    fn test_vbl_flag_edges() {
        let mut m = test_machine(AppleModel::AppleIIe);
        let start = m.cycles();
        m.add_cycles(CYCLES_PER_FRAME - start % CYCLES_PER_FRAME);
        let base = m.cycles();
        m.add_cycles(12479);
        assert_eq!(m.read(0xC019) & 0x80, 0);
        m.add_cycles(1);
        assert_eq!(m.read(0xC019) & 0x80, 0x80);
        m.add_cycles(17029 - 12480);
        assert_eq!(m.read(0xC019) & 0x80, 0x80);
        m.add_cycles(1);
        assert_eq!(m.cycles() - base, 17030);
        assert_eq!(m.read(0xC019) & 0x80, 0);
    }

    #[test]
    fn test_vbl_flag_inverted_on_ii_plus() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        let start = m.cycles();
        m.add_cycles(CYCLES_PER_FRAME - start % CYCLES_PER_FRAME);
        m.add_cycles(12479);
        assert_eq!(m.read(0xC019) & 0x80, 0x80);
        m.add_cycles(1);
        assert_eq!(m.read(0xC019) & 0x80, 0);
        m.add_cycles(17030 - 12480);
        assert_eq!(m.read(0xC019) & 0x80, 0x80);
        // 隣のアドレスはストローブクリアのまま
        m.io.keyboard.press(b'A');
        m.read(0xC018);
        assert_eq!(m.read(0xC000) & 0x80, 0);
    }

    #[test]
    fn test_video_flag_toggle_keeps_vbl() {
        let mut m = test_machine(AppleModel::AppleIIe);
        let before = m.read(0xC019) & 0x80;
        m.read(0xC057);
        m.read(0xC056);
        m.write(0xC00F, 0);
        m.write(0xC00E, 0);
        assert_eq!(m.read(0xC019) & 0x80, before);
    }

    #[test]
    fn test_iie_language_card_and_ramworks() {
        let mut m = test_machine(AppleModel::AppleIIe);
        m.read(0xC08B);
        m.read(0xC08B);
        assert!(m.mmu.lc_read && m.mmu.lc_write && m.mmu.lc_alt_bank);
        assert_eq!(m.read(0xC011) & 0x80, 0);
        assert_eq!(m.read(0xC012) & 0x80, 0x80);
        m.write(0xC073, 0);
        assert_eq!(m.mmu.ext_ram_block, 0);
    }

    #[test]
    fn test_reset_keeps_text_and_keyboard() {
        let mut m = test_machine(AppleModel::AppleIIe);
        m.read(0xC050);
        m.read(0xC055);
        m.write(0xC00D, 0);
        m.io.keyboard.press(b'Q');
        m.reset();
        assert!(!m.io.video.text);
        assert!(!m.io.video.page2 && !m.io.video.col80);
        assert_eq!(m.read(0xC000), 0xD1);
    }
}
