//! Disk II インターフェースカード（P6シーケンサー）
//!
//! P6 ROMが駆動する4ビットのステートマシンとシフトレジスタ（LS323）を2MHzで動かす。
//! シーケンサーは毎サイクル動かさず、ソフトスイッチへのアクセスごとに
//! 前回アクセスからの経過分をまとめて進める。
//!
//! ソフトスイッチ（$C080+s*16+n）は下位3ビット（a3..a1）で8個のラッチQ0〜Q7を選び、
//! a0が新しい値になる。
//!
//! | ラッチ | 機能 |
//! |---|---|
//! | Q0〜Q3 | ステッパーモーターのフェーズ |
//! | Q4 | モーター |
//! | Q5 | ドライブ選択 |
//! | Q6, Q7 | 読み取り/書き込みモード |

use std::path::Path;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::apple2::Apple2;
use crate::card::{Card, CardParams, CardRom};
use crate::disk_log::{self, log_drive_select, log_head, log_motor, DiskLogLevel, NibbleRing};
use crate::error::{read_file, EmuError, Result};
use crate::woz::WozImage;

/// 16セクター用P6 ROM（下位4ビット=命令、上位4ビット=次の状態）
///
/// アドレス = 状態<<4 | Q7<<3 | Q6<<2 | レジスタMSB<<1 | パルスなし
pub const P6_ROM: [u8; 256] = [
    0x18, 0x18, 0x18, 0x18, 0x0A, 0x0A, 0x0A, 0x0A, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18, 0x18,
    0x2D, 0x2D, 0x38, 0x38, 0x0A, 0x0A, 0x0A, 0x0A, 0x28, 0x28, 0x28, 0x28, 0x28, 0x28, 0x28, 0x28,
    0xD8, 0x38, 0x08, 0x28, 0x0A, 0x0A, 0x0A, 0x0A, 0x39, 0x39, 0x39, 0x39, 0x3B, 0x3B, 0x3B, 0x3B,
    0xD8, 0x48, 0x48, 0x48, 0x0A, 0x0A, 0x0A, 0x0A, 0x48, 0x48, 0x48, 0x48, 0x48, 0x48, 0x48, 0x48,
    0xD8, 0x58, 0xD8, 0x58, 0x0A, 0x0A, 0x0A, 0x0A, 0x58, 0x58, 0x58, 0x58, 0x58, 0x58, 0x58, 0x58,
    0xD8, 0x68, 0xD8, 0x68, 0x0A, 0x0A, 0x0A, 0x0A, 0x68, 0x68, 0x68, 0x68, 0x68, 0x68, 0x68, 0x68,
    0xD8, 0x78, 0xD8, 0x78, 0x0A, 0x0A, 0x0A, 0x0A, 0x78, 0x78, 0x78, 0x78, 0x78, 0x78, 0x78, 0x78,
    0xD8, 0x88, 0xD8, 0x88, 0x0A, 0x0A, 0x0A, 0x0A, 0x08, 0x08, 0x88, 0x88, 0x08, 0x08, 0x88, 0x88,
    0xD8, 0x98, 0xD8, 0x98, 0x0A, 0x0A, 0x0A, 0x0A, 0x98, 0x98, 0x98, 0x98, 0x98, 0x98, 0x98, 0x98,
    0xD8, 0x29, 0xD8, 0xA8, 0x0A, 0x0A, 0x0A, 0x0A, 0xA8, 0xA8, 0xA8, 0xA8, 0xA8, 0xA8, 0xA8, 0xA8,
    0xCD, 0xBD, 0xD8, 0xB8, 0x0A, 0x0A, 0x0A, 0x0A, 0xB9, 0xB9, 0xB9, 0xB9, 0xBB, 0xBB, 0xBB, 0xBB,
    0xD9, 0x59, 0xD8, 0xC8, 0x0A, 0x0A, 0x0A, 0x0A, 0xC8, 0xC8, 0xC8, 0xC8, 0xC8, 0xC8, 0xC8, 0xC8,
    0xD9, 0xD9, 0xD8, 0xA0, 0x0A, 0x0A, 0x0A, 0x0A, 0xD8, 0xD8, 0xD8, 0xD8, 0xD8, 0xD8, 0xD8, 0xD8,
    0xD8, 0x08, 0xE8, 0xE8, 0x0A, 0x0A, 0x0A, 0x0A, 0xE8, 0xE8, 0xE8, 0xE8, 0xE8, 0xE8, 0xE8, 0xE8,
    0xFD, 0xFD, 0xF8, 0xF8, 0x0A, 0x0A, 0x0A, 0x0A, 0xF8, 0xF8, 0xF8, 0xF8, 0xF8, 0xF8, 0xF8, 0xF8,
    0xDD, 0x4D, 0xE0, 0xE0, 0x0A, 0x0A, 0x0A, 0x0A, 0x88, 0x88, 0x08, 0x08, 0x88, 0x88, 0x08, 0x08,
];

/// モーター停止までの遅延（2MHzで1秒）
const MOTOR_DELAY_TICKS: u32 = 2_000_000;

/// これを超えて放置されたら同期を取り直す
const RESYNC_TICKS: u64 = 100_000;

/// ヘッドの最大位置（クォータートラック）
const MAX_QUARTER_TRACK: i32 = 140;

/// 弱いビット（4ビット連続0）で1を返す確率
const WEAK_BIT_PROBABILITY: f64 = 0.3;

/// フェーズパターン（Q3..Q0）→ 8位置サイクル内の歯の位置。-1は引き込み先なし
const COG_POSITIONS: [i8; 16] = [-1, 0, 2, 1, 4, -1, 3, 2, 6, 7, -1, 0, 5, 6, 4, -1];

const SOFTSWITCH_NAMES: [&str; 16] = [
    "PHASE0OFF", "PHASE0ON", "PHASE1OFF", "PHASE1ON", "PHASE2OFF", "PHASE2ON", "PHASE3OFF",
    "PHASE3ON", "MOTOROFF", "MOTORON", "DRIVE1", "DRIVE2", "Q6L", "Q6H", "Q7L", "Q7H",
];

/// ヘッド位置の通知先（ドライブ番号, クォータートラック）
pub type HeadTrace = Box<dyn FnMut(usize, u8) + Send>;

//--------------------------------------------------
// ドライブ
//--------------------------------------------------

/// フロッピードライブ1台
#[derive(Default)]
pub struct Drive {
    woz: Option<WozImage>,
    quarter_track: usize,
    /// 現在のトラック内のビット位置
    position: usize,
    /// MC3470の4ビットシフトバッファ
    mc3470: u8,
    enabled: bool,
}

impl Drive {
    pub fn image(&self) -> Option<&WozImage> {
        self.woz.as_ref()
    }

    pub fn quarter_track(&self) -> u8 {
        self.quarter_track as u8
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn write_protected(&self) -> bool {
        self.woz.as_ref().map_or(false, |w| w.write_protected)
    }

    fn is_13_sector(&self) -> bool {
        self.woz.as_ref().map_or(false, WozImage::is_13_sector)
    }

    fn track_bits(&self, quarter_track: usize) -> usize {
        self.woz
            .as_ref()
            .and_then(|w| w.track(quarter_track))
            .map_or(0, |t| t.bit_count())
    }

    fn insert(&mut self, woz: WozImage) {
        self.woz = Some(woz);
        self.position = 0;
        self.mc3470 = 0;
    }

    /// ヘッドを動かし、トラック長の比でビット位置を合わせる
    fn seek(&mut self, quarter_track: usize) {
        let old_len = self.track_bits(self.quarter_track);
        let new_len = self.track_bits(quarter_track);
        if old_len != 0 && new_len != 0 {
            self.position = self.position * new_len / old_len;
        }
        self.quarter_track = quarter_track;
    }

    /// 1ビットセル分進めてMC3470の出力を返す
    fn read_pulse(&mut self, rng: &mut StdRng) -> bool {
        let quarter_track = self.quarter_track;
        let bit = match self.woz.as_ref().and_then(|w| w.track(quarter_track)) {
            Some(track) => {
                self.position = (self.position + 1) % track.bit_count();
                track.bit(self.position)
            }
            None => false,
        };
        self.mc3470 = ((self.mc3470 << 1) | bit as u8) & 0x0F;
        if self.mc3470 == 0 {
            rng.gen_bool(WEAK_BIT_PROBABILITY)
        } else {
            self.mc3470 & 0x02 != 0
        }
    }

    /// 1ビットセル分進めて磁束反転の有無を書き込む
    fn write_pulse(&mut self, value: bool) {
        let quarter_track = self.quarter_track;
        let protected = self.write_protected();
        let Some(track) = self.woz.as_mut().and_then(|w| w.track_mut(quarter_track)) else {
            return;
        };
        self.position = (self.position + 1) % track.bit_count();
        if !protected {
            track.set_bit(self.position, value);
        }
    }
}

//--------------------------------------------------
// カード
//--------------------------------------------------

/// Disk IIインターフェースカード
pub struct DiskIICard {
    slot: usize,
    /// 16セクターP5ブートROM
    p5: [u8; 256],
    /// 13セクターP5ブートROM
    p5_13: Option<[u8; 256]>,
    /// 現在13セクターROMを載せているか
    sector13: bool,
    latches: [bool; 8],
    /// シフト/保持レジスタ（LS323）
    register: u8,
    /// シーケンサーの状態（LS174）
    sequence: u8,
    data_bus: u8,
    motor_delay: u32,
    last_write_value: bool,
    pending_write: bool,
    pulse_counter: u8,
    /// 最後に追いついた時刻（2MHzティック）
    last_tick: u64,
    drives: [Drive; 2],
    rng: StdRng,
    /// モーター回転中に高速モードを要求する
    fast: bool,
    fast_held: bool,
    head_trace: Option<HeadTrace>,
    /// このカードだけで有効なログカテゴリ
    log_level: DiskLogLevel,
    /// DATAログ用
    nibbles: NibbleRing,
    last_read: u8,
}

impl DiskIICard {
    pub fn new(p5: [u8; 256], p5_13: Option<[u8; 256]>, fast: bool) -> Self {
        DiskIICard {
            slot: 6,
            p5,
            p5_13,
            sector13: false,
            latches: [false; 8],
            register: 0,
            sequence: 0,
            data_bus: 0,
            motor_delay: 0,
            last_write_value: false,
            pending_write: false,
            pulse_counter: 0,
            last_tick: 0,
            drives: [Drive::default(), Drive::default()],
            rng: StdRng::from_entropy(),
            fast,
            fast_held: false,
            head_trace: None,
            log_level: DiskLogLevel::empty(),
            nibbles: NibbleRing::default(),
            last_read: 0,
        }
    }

    /// カードパラメータから生成
    pub fn build(params: &CardParams) -> Result<Box<dyn Card>> {
        let rom = params
            .get_path("rom")
            .ok_or_else(|| EmuError::ConfigInvalid("diskii: rom must not be empty".to_string()))?;
        let p5 = load_p5(&rom)?;
        let p5_13 = match params.get_path("rom13") {
            Some(path) if path.exists() => Some(load_p5(&path)?),
            Some(path) => {
                log::debug!("13-sector boot ROM {} not found", path.display());
                None
            }
            None => None,
        };

        let mut card = DiskIICard::new(p5, p5_13, params.get_bool("fast")?);
        for (drive, key) in ["disk1", "disk2"].iter().enumerate() {
            if let Some(path) = params.get_path(key) {
                card.insert_disk(drive, WozImage::load(&path)?);
                log::info!("drive {}: {}", drive + 1, path.display());
            }
        }
        if params.get_bool("trace")? {
            card.set_log_level(DiskLogLevel::all());
        }
        Ok(Box::new(card))
    }

    /// 乱数の種を固定（弱いビットの再現用）
    pub fn set_seed(&mut self, seed: u64) {
        self.rng = StdRng::seed_from_u64(seed);
    }

    /// カード個別のログカテゴリ（グローバルの設定に加算される）
    pub fn set_log_level(&mut self, level: DiskLogLevel) {
        self.log_level = level;
    }

    pub fn logs(&self, flag: DiskLogLevel) -> bool {
        disk_log::is_enabled_for(self.log_level, flag)
    }

    pub fn set_head_trace(&mut self, trace: HeadTrace) {
        self.head_trace = Some(trace);
    }

    pub fn insert_disk(&mut self, drive: usize, woz: WozImage) {
        if woz.is_13_sector() && self.p5_13.is_none() {
            log::warn!("13-sector disk in drive {} but no 13-sector boot ROM", drive + 1);
        }
        self.drives[drive & 1].insert(woz);
    }

    pub fn drive(&self, drive: usize) -> &Drive {
        &self.drives[drive & 1]
    }

    /// モーター回転中（Q4がオン、または停止遅延中）
    pub fn motor_on(&self) -> bool {
        self.latches[4] || self.motor_delay > 0
    }

    pub fn register(&self) -> u8 {
        self.register
    }

    //--------------------------------------------------
    // シーケンサー
    //--------------------------------------------------

    /// CPUサイクル`cycles`の時点まで進める
    fn catch_up(&mut self, cycles: u64) {
        let now = cycles * 2;
        let mut elapsed = now.saturating_sub(self.last_tick);
        self.last_tick = now;
        if elapsed > RESYNC_TICKS {
            let skipped = u32::try_from(elapsed).unwrap_or(u32::MAX);
            self.motor_delay = self.motor_delay.saturating_sub(skipped);
            elapsed = 2;
        }
        for i in 0..elapsed {
            self.tick(i == 0);
        }
    }

    fn tick(&mut self, first: bool) {
        if self.latches[4] {
            self.motor_delay = MOTOR_DELAY_TICKS;
        } else {
            self.motor_delay = self.motor_delay.saturating_sub(1);
        }
        if self.motor_delay == 0 {
            self.sequence = 0;
            self.drives[0].enabled = false;
            self.drives[1].enabled = false;
            return;
        }

        let selected = self.latches[5] as usize;
        self.drives[0].enabled = selected == 0;
        self.drives[1].enabled = selected == 1;
        if first {
            self.update_head(selected);
        }

        let q6 = self.latches[6];
        let q7 = self.latches[7];
        self.pulse_counter = (self.pulse_counter + 1) & 7;
        let mut pulse = false;
        if self.pulse_counter == 0 && !q7 {
            pulse = self.drives[selected].read_pulse(&mut self.rng);
        }

        let address = (self.sequence as usize) << 4
            | (q7 as usize) << 3
            | (q6 as usize) << 2
            | ((self.register >> 7) as usize) << 1
            | (!pulse) as usize;
        let instruction = P6_ROM[address];
        let op = instruction & 0x0F;
        let next = instruction >> 4;

        match op {
            0x0..=0x7 => self.register = 0,
            0x8 | 0xC => {}
            0x9 => self.register <<= 1,
            0xD => self.register = (self.register << 1) | 1,
            0xA | 0xE => {
                let wp = if self.drives[selected].write_protected() { 0x80 } else { 0 };
                self.register = (self.register >> 1) | wp;
            }
            _ => self.register = self.data_bus,
        }

        if q7 && op >= 8 {
            let bit = next & 0x08 != 0;
            if bit != self.last_write_value {
                self.pending_write = true;
            }
            self.last_write_value = bit;
        }
        if self.pulse_counter == 0 && q7 {
            let value = std::mem::take(&mut self.pending_write);
            self.drives[selected].write_pulse(value);
        }

        self.sequence = next;
    }

    /// Q0〜Q3の磁石パターンでヘッドを引き寄せる
    fn update_head(&mut self, drive: usize) {
        let pattern = (0..4).fold(0, |acc, i| acc | (self.latches[i] as usize) << i);
        let cog = COG_POSITIONS[pattern];
        if cog < 0 {
            return;
        }
        let current = self.drives[drive].quarter_track as i32;
        let delta = (cog as i32 - current % 8).rem_euclid(8);
        let target = match delta {
            0..=3 => current + delta,
            4 => current,
            _ => current - (8 - delta),
        }
        .clamp(0, MAX_QUARTER_TRACK);
        if target == current {
            return;
        }
        self.drives[drive].seek(target as usize);
        log_head(self.log_level, self.slot, drive, current as u8, target as u8);
        if let Some(trace) = self.head_trace.as_mut() {
            trace(drive, target as u8);
        }
    }

    /// ソフトスイッチアクセスの共通処理
    fn access(&mut self, index: u8, write: Option<u8>, machine: &mut Apple2) -> u8 {
        let was_running = self.motor_on();
        let previous_drive = self.latches[5];

        self.catch_up(machine.cycles());
        self.latches[((index >> 1) & 7) as usize] = index & 1 != 0;
        if let Some(value) = write {
            self.data_bus = value;
        }

        let selected = self.latches[5] as usize;
        if previous_drive != self.latches[5] {
            log_drive_select(self.log_level, self.slot, selected);
        }
        let running = self.motor_on();
        if running != was_running {
            log_motor(self.log_level, self.slot, selected, running);
            if !running {
                self.nibbles.dump(self.log_level, self.slot);
                self.nibbles.clear();
            }
        }
        self.update_fast_mode(running, machine);

        if index & 1 != 0 {
            return 0;
        }
        let value = self.register;
        if write.is_none() && self.logs(DiskLogLevel::DATA) {
            if value & 0x80 != 0 && self.last_read & 0x80 == 0 {
                self.nibbles.push(value);
            }
            self.last_read = value;
        }
        value
    }

    fn update_fast_mode(&mut self, running: bool, machine: &mut Apple2) {
        if !self.fast {
            return;
        }
        if running && !self.fast_held {
            machine.request_fast_mode();
            self.fast_held = true;
        } else if !running && self.fast_held {
            machine.release_fast_mode();
            self.fast_held = false;
        }
    }

    /// ドライブ1のディスクに合わせてP5 ROMを載せ替える
    fn install_boot_rom(&mut self, machine: &mut Apple2) {
        let sector13 = self.p5_13.is_some() && self.drives[0].is_13_sector();
        let rom = match self.p5_13 {
            Some(rom13) if sector13 => rom13,
            _ => self.p5,
        };
        machine.mmu.install_card_rom(self.slot, &CardRom::new(rom));
        if sector13 != self.sector13 {
            log::info!(
                "slot {}: {}-sector boot ROM",
                self.slot,
                if sector13 { 13 } else { 16 }
            );
        }
        self.sector13 = sector13;
    }
}

/// P5 ROMを読み込む（先頭256バイト）
fn load_p5(path: &Path) -> Result<[u8; 256]> {
    let data = read_file(path)?;
    if data.len() < 256 {
        return Err(EmuError::ResourceMissing(format!(
            "{}: boot ROM must be 256 bytes, got {}",
            path.display(),
            data.len()
        )));
    }
    let mut rom = [0u8; 256];
    rom.copy_from_slice(&data[..256]);
    Ok(rom)
}

impl Card for DiskIICard {
    fn name(&self) -> &str {
        "diskii"
    }

    fn assign(&mut self, slot: usize, machine: &mut Apple2) -> Result<()> {
        self.slot = slot;
        self.last_tick = machine.cycles() * 2;
        self.install_boot_rom(machine);
        machine.io.add_card_softswitches(slot, &SOFTSWITCH_NAMES, "DISKII");
        log::debug!("Disk II installed in slot {}", slot);
        Ok(())
    }

    fn reset(&mut self, machine: &mut Apple2) {
        self.catch_up(machine.cycles());
        self.latches = [false; 8];
        self.install_boot_rom(machine);
    }

    fn read_softswitch(&mut self, index: u8, machine: &mut Apple2) -> u8 {
        self.access(index, None, machine)
    }

    fn write_softswitch(&mut self, index: u8, value: u8, machine: &mut Apple2) {
        self.access(index, Some(value), machine);
    }

    fn load_disk(&mut self, drive: usize, path: &Path) -> Result<bool> {
        let woz = WozImage::load(path)?;
        self.insert_disk(drive, woz);
        log::info!("slot {} drive {}: {}", self.slot, drive + 1, path.display());
        Ok(true)
    }

    fn debug_info(&self) -> String {
        let latches: String = self
            .latches
            .iter()
            .map(|&q| if q { '1' } else { '0' })
            .collect();
        let drive = &self.drives[self.latches[5] as usize];
        format!(
            "S{} Disk II: motor={} drive={} qt={} pos={} seq={:X} reg=${:02X} Q0-7={}",
            self.slot,
            if self.motor_on() { "on" } else { "off" },
            self.latches[5] as usize + 1,
            drive.quarter_track,
            drive.position,
            self.sequence,
            self.register,
            latches
        )
    }
}
