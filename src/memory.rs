//! メモリ管理（MMU）
//!
//! 16ビットアドレスをソフトスイッチの状態に従って1つの格納先へ振り分ける。
//! メインRAM 48KB、補助RAM（RAMWorksで最大256バンク）、ランゲージカードRAM、
//! 内部ROM、スロットROMを保持する。$C000-$C0FFのI/Oページは所有者（`Apple2`）が処理する。

use crate::card::CardRom;
use crate::error::{EmuError, Result};

/// マップされていないアドレスを読んだときの値
pub const FLOATING_BUS: u8 = 0xF4;

/// ランゲージカード1ブロックの大きさ（$D000代替4KB + $D000 4KB + $E000-$FFFF 8KB）
pub const LC_BLOCK_SIZE: usize = 0x4000;

const MAIN_RAM_SIZE: usize = 0xC000;
const AUX_BANK_SIZE: usize = 0x10000;
const ROM_WINDOW: usize = 0x4000;
const MAX_AUX_BANKS: usize = 256;

/// アクセスの解決先
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Target {
    Main(usize),
    /// (バンク, オフセット)
    Aux(usize, usize),
    /// (ブロック, オフセット)
    Lc(usize, usize),
    /// $C000起点のオフセット
    Rom(usize),
    SlotRom(usize, usize),
    ExtRom(usize, usize),
    Inhibit(usize),
    Floating,
}

impl Target {
    /// ページ先頭の解決結果からページ内の下位バイト分ずらす
    fn at(self, low: u8) -> Target {
        let low = low as usize;
        match self {
            Target::Main(o) => Target::Main(o + low),
            Target::Aux(b, o) => Target::Aux(b, o + low),
            Target::Lc(b, o) => Target::Lc(b, o + low),
            Target::Rom(o) => Target::Rom(o + low),
            Target::SlotRom(s, o) => Target::SlotRom(s, o + low),
            Target::ExtRom(s, o) => Target::ExtRom(s, o + low),
            Target::Inhibit(o) => Target::Inhibit(o + low),
            Target::Floating => Target::Floating,
        }
    }
}

/// メモリ管理ユニット
pub struct Mmu {
    main_ram: Vec<u8>,
    /// 補助RAM。各バンク64KBで、$C000以降は補助側のランゲージカード領域
    aux: Vec<Vec<u8>>,
    /// ランゲージカードRAMブロック（Saturnは8ブロック）
    lc_main: Vec<Vec<u8>>,
    /// $C000-$FFFFの内部ROM
    rom: Vec<u8>,
    /// ROMイメージが始まるオフセット。これより下はFLOATING_BUS
    rom_start: usize,
    slot_roms: [Option<Box<[u8; 256]>>; 8],
    ext_roms: [Option<Box<[u8]>>; 8],
    /// カードが差し替える$D000-$FFFF
    rom_inhibit: Option<Box<[u8]>>,
    /// 命令フェッチ用キャッシュ（ページ, ページ先頭の解決先）
    code_cache: Option<(u8, Target)>,

    /// IIe系（補助メモリとIIe用スイッチがある）
    pub is_iie: bool,

    // ランゲージカード
    pub lc_read: bool,
    pub lc_write: bool,
    pub lc_prewrite: bool,
    /// $D000のバンク1（$C088-$C08F）を選択中
    pub lc_alt_bank: bool,
    pub lc_selected_block: usize,

    // IIe MMU
    pub alt_zp: bool,
    pub alt_main_read: bool,
    pub alt_main_write: bool,
    pub store80: bool,
    pub slot_c3_rom: bool,
    pub int_cx_rom: bool,
    pub int_c8_rom: bool,
    pub active_slot: usize,
    pub ext_ram_block: usize,

    // 80STOREの振り分けに使うビデオフラグの写し
    page2: bool,
    hires: bool,
}

impl Mmu {
    pub fn new(is_iie: bool) -> Self {
        Mmu {
            main_ram: vec![0; MAIN_RAM_SIZE],
            aux: Vec::new(),
            lc_main: Vec::new(),
            rom: vec![FLOATING_BUS; ROM_WINDOW],
            rom_start: ROM_WINDOW,
            slot_roms: Default::default(),
            ext_roms: Default::default(),
            rom_inhibit: None,
            code_cache: None,
            is_iie,
            lc_read: false,
            lc_write: true,
            lc_prewrite: false,
            lc_alt_bank: false,
            lc_selected_block: 0,
            alt_zp: false,
            alt_main_read: false,
            alt_main_write: false,
            store80: false,
            slot_c3_rom: false,
            int_cx_rom: false,
            int_c8_rom: false,
            active_slot: 0,
            ext_ram_block: 0,
            page2: false,
            hires: false,
        }
    }

    //--------------------------------------------------
    // 構成
    //--------------------------------------------------

    /// 内部ROMをロード
    ///
    /// 2KB〜16KBのイメージは$FFFFに末尾を合わせて配置する。
    /// 20KB（II+パッケージ）と32KB（IIeパッケージ）は該当部分を切り出す。
    pub fn load_rom(&mut self, data: &[u8]) -> Result<()> {
        let image: &[u8] = match data.len() {
            0x0800 | 0x1000 | 0x2000 | 0x3000 | 0x4000 => data,
            // $2000-$4FFF: Autostart Monitor + Applesoft
            0x5000 => &data[0x2000..0x5000],
            // 後半16KBがメインROM
            0x8000 => &data[0x4000..0x8000],
            n => {
                return Err(EmuError::ResourceMissing(format!(
                    "ROM image has unexpected size ({} bytes)",
                    n
                )))
            }
        };
        self.rom = vec![FLOATING_BUS; ROM_WINDOW];
        self.rom_start = ROM_WINDOW - image.len();
        self.rom[self.rom_start..].copy_from_slice(image);
        self.invalidate_cache();
        log::debug!(
            "ROM mapped at ${:04X}-$FFFF",
            0xC000 + self.rom_start
        );
        Ok(())
    }

    /// 補助RAMのバンク数を設定（0で補助RAMなし）
    pub fn set_aux_banks(&mut self, banks: usize) {
        let banks = banks.min(MAX_AUX_BANKS);
        self.aux = (0..banks).map(|_| vec![0; AUX_BANK_SIZE]).collect();
        self.ext_ram_block = 0;
        self.invalidate_cache();
    }

    pub fn aux_banks(&self) -> usize {
        self.aux.len()
    }

    /// ランゲージカードRAMを装着（ブロック数はLCなら1、Saturnなら8）
    pub fn install_language_card(&mut self, blocks: usize) {
        self.lc_main = (0..blocks).map(|_| vec![0; LC_BLOCK_SIZE]).collect();
        self.lc_selected_block = 0;
        self.invalidate_cache();
    }

    pub fn has_language_card(&self) -> bool {
        !self.lc_main.is_empty()
    }

    /// スロットROMと拡張ROMを取り付ける
    pub fn install_card_rom(&mut self, slot: usize, rom: &CardRom) {
        let slot = slot & 7;
        self.slot_roms[slot] = Some(Box::new(*rom.page()));
        self.ext_roms[slot] = rom.extended().map(|e| e.to_vec().into_boxed_slice());
        self.invalidate_cache();
    }

    pub fn remove_card_rom(&mut self, slot: usize) {
        self.slot_roms[slot & 7] = None;
        self.ext_roms[slot & 7] = None;
        self.invalidate_cache();
    }

    /// カードによる$D000-$FFFFの差し替え（Noneで解除）
    pub fn set_rom_inhibit(&mut self, image: Option<Box<[u8]>>) {
        self.rom_inhibit = image;
        self.invalidate_cache();
    }

    pub fn invalidate_cache(&mut self) {
        self.code_cache = None;
    }

    /// PAGE2/HIRESの写しを更新
    pub fn set_video_flags(&mut self, page2: bool, hires: bool) {
        if self.page2 != page2 || self.hires != hires {
            self.page2 = page2;
            self.hires = hires;
            self.invalidate_cache();
        }
    }

    //--------------------------------------------------
    // アクセス
    //--------------------------------------------------

    /// 1バイト読み取り（$C000-$C0FFはFLOATING_BUS）
    pub fn peek(&mut self, address: u16) -> u8 {
        let target = self.route(address, false);
        self.load(target)
    }

    /// 1バイト書き込み。ROMへの書き込みは無視する
    pub fn poke(&mut self, address: u16, value: u8) {
        let target = self.route(address, true);
        self.store(target, value);
    }

    /// 命令フェッチ用の読み取り。同じページが続く間は振り分けを省略する
    pub fn peek_code(&mut self, address: u16) -> u8 {
        let page = (address >> 8) as u8;
        if let Some((cached, base)) = self.code_cache {
            if cached == page {
                return self.load(base.at(address as u8));
            }
        }
        let target = self.route(address, false);
        if !(0xC0..=0xCF).contains(&page) {
            self.code_cache = Some((page, self.route(address & 0xFF00, false)));
        }
        self.load(target)
    }

    /// 副作用なしの読み取り（デバッグ表示用、$C100-$CFFFはアービトレーションを変えない）
    pub fn debug_peek(&self, address: u16) -> u8 {
        let target = match address {
            0xC000..=0xC0FF => Target::Floating,
            0xC100..=0xCFFF => Target::Rom((address - 0xC000) as usize),
            _ => self.route_ram_or_high(address, false),
        };
        self.load(target)
    }

    fn route(&mut self, address: u16, write: bool) -> Target {
        match address {
            0xC000..=0xC0FF => Target::Floating,
            0xC100..=0xCFFF => self.route_slot_area(address),
            _ => self.route_ram_or_high(address, write),
        }
    }

    fn route_ram_or_high(&self, address: u16, write: bool) -> Target {
        let addr = address as usize;
        match address {
            0x0000..=0x01FF => {
                if self.alt_zp {
                    self.aux_target(addr)
                } else {
                    Target::Main(addr)
                }
            }
            0x0200..=0xBFFF => {
                let steered_by_page2 = self.store80
                    && ((0x0400..=0x07FF).contains(&address)
                        || (self.hires && (0x2000..=0x3FFF).contains(&address)));
                let aux = if steered_by_page2 {
                    self.page2
                } else if write {
                    self.alt_main_write
                } else {
                    self.alt_main_read
                };
                if aux {
                    self.aux_target(addr)
                } else {
                    Target::Main(addr)
                }
            }
            0xD000..=0xFFFF => self.route_high(address, write),
            _ => Target::Floating,
        }
    }

    fn aux_target(&self, addr: usize) -> Target {
        if self.aux.is_empty() {
            Target::Main(addr)
        } else {
            Target::Aux(self.ext_ram_block, addr)
        }
    }

    /// $D000-$FFFFの振り分け
    fn route_high(&self, address: u16, write: bool) -> Target {
        if self.rom_inhibit.is_some() {
            return Target::Inhibit((address - 0xD000) as usize);
        }
        let enabled = if write { self.lc_write } else { self.lc_read };
        if enabled {
            let offset = self.lc_offset(address);
            if self.alt_zp && !self.aux.is_empty() {
                return Target::Aux(self.ext_ram_block, 0xC000 + offset);
            }
            if !self.lc_main.is_empty() {
                return Target::Lc(self.lc_selected_block, offset);
            }
        }
        Target::Rom((address - 0xC000) as usize)
    }

    /// ブロック内オフセット: 0x0000-0x0FFF 代替$D000, 0x1000-0x1FFF $D000, 0x2000-0x3FFF $E000-$FFFF
    fn lc_offset(&self, address: u16) -> usize {
        let offset = (address - 0xD000) as usize;
        if address < 0xE000 && self.lc_alt_bank {
            offset
        } else {
            offset + 0x1000
        }
    }

    /// $C100-$CFFFの振り分け（スロットアービトレーションを更新する）
    fn route_slot_area(&mut self, address: u16) -> Target {
        let internal = Target::Rom((address - 0xC000) as usize);
        let target = if address < 0xC800 {
            if self.int_cx_rom {
                internal
            } else if self.is_iie && (address >> 8) == 0xC3 && !self.slot_c3_rom {
                self.int_c8_rom = true;
                internal
            } else {
                let slot = ((address >> 8) & 7) as usize;
                self.active_slot = slot;
                self.int_c8_rom = false;
                Target::SlotRom(slot, (address & 0xFF) as usize)
            }
        } else if self.int_cx_rom || self.int_c8_rom {
            internal
        } else {
            Target::ExtRom(self.active_slot, (address - 0xC800) as usize)
        };
        if address == 0xCFFF {
            self.active_slot = 0;
            self.int_c8_rom = false;
        }
        target
    }

    fn load(&self, target: Target) -> u8 {
        match target {
            Target::Main(o) => self.main_ram[o],
            Target::Aux(b, o) => self.aux[b][o],
            Target::Lc(b, o) => self.lc_main[b][o],
            Target::Rom(o) => {
                if o >= self.rom_start {
                    self.rom[o]
                } else {
                    FLOATING_BUS
                }
            }
            Target::SlotRom(s, o) => self.slot_roms[s].as_ref().map_or(FLOATING_BUS, |r| r[o]),
            Target::ExtRom(s, o) => self.ext_roms[s]
                .as_ref()
                .and_then(|r| r.get(o).copied())
                .unwrap_or(FLOATING_BUS),
            Target::Inhibit(o) => self
                .rom_inhibit
                .as_ref()
                .and_then(|r| r.get(o).copied())
                .unwrap_or(FLOATING_BUS),
            Target::Floating => FLOATING_BUS,
        }
    }

    fn store(&mut self, target: Target, value: u8) {
        match target {
            Target::Main(o) => self.main_ram[o] = value,
            Target::Aux(b, o) => self.aux[b][o] = value,
            Target::Lc(b, o) => self.lc_main[b][o] = value,
            // ROM
            _ => {}
        }
    }

    //--------------------------------------------------
    // バンク切り替え
    //--------------------------------------------------

    /// ランゲージカードのソフトスイッチ（$C080-$C08Fの下位4ビット）
    ///
    /// | 下位2ビット | 読み出し | 書き込み |
    /// |---|---|---|
    /// | 0 | RAM | 禁止 |
    /// | 1 | ROM | 奇数読み出し2回で許可 |
    /// | 2 | ROM | 禁止 |
    /// | 3 | RAM | 奇数読み出し2回で許可 |
    ///
    /// ビット3はバンク1（代替$D000）を選ぶ。
    pub fn lc_softswitch(&mut self, index: u8, write: bool) {
        let index = index & 0x0F;
        self.lc_alt_bank = index & 0x08 != 0;
        self.lc_read = matches!(index & 0x03, 0 | 3);
        if index & 0x01 == 0 {
            self.lc_write = false;
            self.lc_prewrite = false;
        } else if write {
            self.lc_prewrite = false;
        } else {
            if self.lc_prewrite {
                self.lc_write = true;
            }
            self.lc_prewrite = true;
        }
        self.invalidate_cache();
    }

    /// Saturnの16KBブロック選択
    pub fn select_lc_block(&mut self, block: usize) {
        if !self.lc_main.is_empty() {
            self.lc_selected_block = block % self.lc_main.len();
            self.invalidate_cache();
        }
    }

    /// RAMWorksのバンク選択（$C071/$C073/$C075/$C077への書き込み値）
    pub fn select_ext_bank(&mut self, value: u8) {
        if !self.aux.is_empty() {
            self.ext_ram_block = value as usize % self.aux.len();
            self.invalidate_cache();
        }
    }

    /// CPUリセット時に解除されるスイッチ
    pub fn reset(&mut self) {
        self.store80 = false;
        self.alt_main_read = false;
        self.alt_main_write = false;
        self.int_cx_rom = false;
        self.alt_zp = false;
        self.int_c8_rom = false;
        self.page2 = false;
        self.hires = false;
        self.lc_read = false;
        self.lc_write = true;
        self.lc_prewrite = false;
        self.lc_alt_bank = false;
        self.invalidate_cache();
    }

    //--------------------------------------------------
    // ビデオ
    //--------------------------------------------------

    /// ビデオ用のメモリ切り出し。補助側は常に先頭バンク（RAMWorksの選択を無視）
    pub fn video_memory(&self, start: u16, len: usize, aux: bool) -> &[u8] {
        let start = (start as usize).min(MAIN_RAM_SIZE);
        let end = (start + len).min(MAIN_RAM_SIZE);
        match self.aux.first() {
            Some(bank) if aux => &bank[start..end],
            _ => &self.main_ram[start..end],
        }
    }

    /// テキスト/LoRes画面（1KB）
    pub fn text_page(&self, secondary: bool, aux: bool) -> &[u8] {
        self.video_memory(if secondary { 0x0800 } else { 0x0400 }, 0x400, aux)
    }

    /// HiRes画面（8KB）
    pub fn hires_page(&self, secondary: bool, aux: bool) -> &[u8] {
        self.video_memory(if secondary { 0x4000 } else { 0x2000 }, 0x2000, aux)
    }
}
