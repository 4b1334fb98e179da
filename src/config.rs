//! マシン構成
//!
//! プリセット（`2`、`2plus`、`2e`、`2enh`）から始めて、キーごとに上書きする。
//! JSON形式のファイルからも読み込める。

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::apple2::{Apple2, AppleModel, CHAR_GEN_SIZE};
use crate::card::build_card;
use crate::cpu::{Cpu, CpuType};
use crate::disk_log::{self, DiskLogLevel};
use crate::error::{read_file, EmuError, Result};

/// NTSCのCPUクロック（MHz）
pub const NTSC_MHZ: f64 = 1.0227;
/// PALのCPUクロック（MHz）
pub const PAL_MHZ: f64 = 1.0159;

/// RAMWorksの最大容量（KiB）
const RAMWORKS_MAX_KIB: u32 = 16384;

/// 実行ファイルのディレクトリを取得
pub fn get_exe_dir() -> PathBuf {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.parent().map(|p| p.to_path_buf()))
        .unwrap_or_else(|| PathBuf::from("."))
}

/// 相対パスを指定されたベースディレクトリからの絶対パスに解決
///
/// ベースが空なら実行ファイルのディレクトリ、相対ならそこからの相対として扱う。
pub fn resolve_path_with_base(base: &str, relative: &str) -> PathBuf {
    let path = Path::new(relative);
    if path.is_absolute() {
        path.to_path_buf()
    } else if base.is_empty() {
        get_exe_dir().join(relative)
    } else {
        let base_path = Path::new(base);
        if base_path.is_absolute() {
            base_path.join(relative)
        } else {
            get_exe_dir().join(base).join(relative)
        }
    }
}

/// マシン構成
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// プリセット名
    pub model: String,
    /// 相対パスの基準（空なら実行ファイルのディレクトリ）
    pub home: String,
    pub rom: String,
    pub charrom: String,
    /// `6502`か`65c02`（空なら機種の既定）
    pub cpu: String,
    /// `ntsc`、`pal`、`full`、またはMHz
    pub speed: String,
    /// 拡張メモリ（KiB、0なら標準の64KiB）
    pub ramworks: u32,
    pub nsc: String,
    pub profile: bool,
    pub rgb: bool,
    pub romx: bool,
    pub mods: String,
    /// `cpu`、`disk`、`io`のカンマ区切り
    pub trace: String,
    #[serde(rename = "forceCaps")]
    pub force_caps: bool,
    /// スロット0〜7のカード指定（`card_name[,k=v]*`）
    pub slots: [String; 8],
}

impl Default for MachineConfig {
    fn default() -> Self {
        MachineConfig {
            model: "2enh".to_string(),
            home: String::new(),
            rom: "roms/Apple2e_Enhanced.rom".to_string(),
            charrom: "roms/Apple2eEnhancedCharGen.rom".to_string(),
            cpu: String::new(),
            speed: "ntsc".to_string(),
            ramworks: 0,
            nsc: String::new(),
            profile: false,
            rgb: false,
            romx: false,
            mods: String::new(),
            trace: String::new(),
            force_caps: false,
            slots: [
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                String::new(),
                "diskii".to_string(),
                String::new(),
            ],
        }
    }
}

/// プリセット名から機種を引く
fn preset_model(name: &str) -> Result<AppleModel> {
    match name {
        "2" => Ok(AppleModel::AppleII),
        "2plus" | "2plus-multirom" => Ok(AppleModel::AppleIIPlus),
        "2e" => Ok(AppleModel::AppleIIe),
        "2enh" => Ok(AppleModel::AppleIIeEnhanced),
        "base64a" | "basis108" | "swyft" | "cpm" => Err(EmuError::ConfigInvalid(
            format!("model '{}' needs ROMs or cards that are not available", name),
        )),
        _ => Err(EmuError::ConfigInvalid(format!("unknown model '{}'", name))),
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "on" | "1" | "yes" => Ok(true),
        "false" | "off" | "0" | "no" | "" => Ok(false),
        _ => Err(EmuError::ConfigInvalid(format!(
            "{} must be a boolean, got '{}'",
            key, value
        ))),
    }
}

impl MachineConfig {
    /// プリセットから構成を作る
    pub fn preset(name: &str) -> Result<Self> {
        let model = preset_model(name)?;
        let mut config = MachineConfig {
            model: name.to_string(),
            ..Default::default()
        };
        let (rom, charrom) = match model {
            AppleModel::AppleII => ("roms/Apple2.rom", "roms/Apple2rev7CharGen.rom"),
            AppleModel::AppleIIPlus => ("roms/Apple2_Plus.rom", "roms/Apple2rev7CharGen.rom"),
            AppleModel::AppleIIe => ("roms/Apple2e.rom", "roms/Apple2eCharGen.rom"),
            AppleModel::AppleIIeEnhanced => {
                ("roms/Apple2e_Enhanced.rom", "roms/Apple2eEnhancedCharGen.rom")
            }
        };
        config.rom = rom.to_string();
        config.charrom = charrom.to_string();
        if name == "2plus-multirom" {
            // モニタはバンク7、BASICはバンク0
            config.slots[0] = "multirom,bank=7,basic=0".to_string();
        } else if model == AppleModel::AppleIIPlus {
            config.slots[0] = "language".to_string();
        }
        Ok(config)
    }

    /// JSONファイルから読み込む
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| EmuError::io(path, e))?;
        let config: MachineConfig = serde_json::from_str(&content).map_err(|e| {
            EmuError::ConfigInvalid(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// JSONファイルに保存する
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let json = serde_json::to_string_pretty(self)
            .map_err(|e| EmuError::ConfigInvalid(format!("failed to serialize config: {}", e)))?;
        fs::write(path, json).map_err(|e| EmuError::io(path, e))
    }

    /// キー1つを上書きする
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        let value = value.trim();
        match key {
            "model" => {
                let home = std::mem::take(&mut self.home);
                *self = MachineConfig::preset(value)?;
                self.home = home;
            }
            "home" => self.home = value.to_string(),
            "rom" => self.rom = value.to_string(),
            "charrom" => self.charrom = value.to_string(),
            "cpu" => {
                Self::parse_cpu(value)?;
                self.cpu = value.to_ascii_lowercase();
            }
            "speed" => {
                Self::parse_speed(value)?;
                self.speed = value.to_ascii_lowercase();
            }
            "ramworks" => {
                let kib = value.parse().map_err(|_| {
                    EmuError::ConfigInvalid(format!("ramworks must be a size in KiB, got '{}'", value))
                })?;
                Self::check_ramworks(kib)?;
                self.ramworks = kib;
            }
            "nsc" => {
                Self::check_nsc(value)?;
                self.nsc = value.to_string();
            }
            "profile" => self.profile = parse_bool(key, value)?,
            "rgb" => self.rgb = parse_bool(key, value)?,
            "romx" => self.romx = parse_bool(key, value)?,
            "mods" => self.mods = value.to_string(),
            "trace" => {
                Self::parse_trace(value)?;
                self.trace = value.to_string();
            }
            "forceCaps" => self.force_caps = parse_bool(key, value)?,
            _ => match Self::slot_key(key) {
                Some(slot) => self.slots[slot] = value.to_string(),
                None => {
                    return Err(EmuError::ConfigInvalid(format!("unknown key '{}'", key)));
                }
            },
        }
        Ok(())
    }

    /// `key=value`形式の上書き
    pub fn apply(&mut self, assignment: &str) -> Result<()> {
        let (key, value) = assignment.split_once('=').ok_or_else(|| {
            EmuError::ConfigInvalid(format!("'{}' is not key=value", assignment))
        })?;
        self.set(key.trim(), value)
    }

    /// `s0`〜`s7`
    fn slot_key(key: &str) -> Option<usize> {
        let digit = key.strip_prefix('s')?;
        match digit.parse::<usize>() {
            Ok(slot) if slot < 8 && digit.len() == 1 => Some(slot),
            _ => None,
        }
    }

    pub fn apple_model(&self) -> Result<AppleModel> {
        preset_model(&self.model)
    }

    fn parse_cpu(value: &str) -> Result<Option<CpuType>> {
        match value.to_ascii_lowercase().as_str() {
            "" => Ok(None),
            "6502" => Ok(Some(CpuType::Cpu6502)),
            "65c02" => Ok(Some(CpuType::Cpu65C02)),
            other => Err(EmuError::ConfigInvalid(format!("unknown cpu '{}'", other))),
        }
    }

    /// MHzを返す（0なら最高速）
    fn parse_speed(value: &str) -> Result<f64> {
        match value.to_ascii_lowercase().as_str() {
            "" | "ntsc" => Ok(NTSC_MHZ),
            "pal" => Ok(PAL_MHZ),
            "full" => Ok(0.0),
            other => match other.parse::<f64>() {
                Ok(mhz) if mhz > 0.0 && mhz.is_finite() => Ok(mhz),
                _ => Err(EmuError::ConfigInvalid(format!("invalid speed '{}'", value))),
            },
        }
    }

    fn check_nsc(value: &str) -> Result<()> {
        match value {
            "" | "main" => Ok(()),
            slot if matches!(slot.parse::<usize>(), Ok(s) if s < 8) => Ok(()),
            _ => Err(EmuError::ConfigInvalid(format!(
                "nsc must be 'main' or a slot number, got '{}'",
                value
            ))),
        }
    }

    fn parse_trace(value: &str) -> Result<(bool, bool, bool)> {
        let mut flags = (false, false, false);
        for name in value.split(',').map(str::trim).filter(|n| !n.is_empty()) {
            match name.to_ascii_lowercase().as_str() {
                "cpu" => flags.0 = true,
                "disk" => flags.1 = true,
                "io" => flags.2 = true,
                other => {
                    return Err(EmuError::ConfigInvalid(format!("unknown trace '{}'", other)));
                }
            }
        }
        Ok(flags)
    }

    fn check_ramworks(kib: u32) -> Result<()> {
        if kib == 0 {
            return Ok(());
        }
        if kib % 64 != 0 || kib > RAMWORKS_MAX_KIB {
            return Err(EmuError::ConfigInvalid(format!(
                "ramworks must be a multiple of 64 up to {} KiB, got {}",
                RAMWORKS_MAX_KIB, kib
            )));
        }
        Ok(())
    }

    /// ファイルから読んだ値も含めて全体を検査する
    pub fn validate(&self) -> Result<()> {
        let model = self.apple_model()?;
        Self::parse_cpu(&self.cpu)?;
        Self::parse_speed(&self.speed)?;
        Self::check_nsc(&self.nsc)?;
        Self::parse_trace(&self.trace)?;
        Self::check_ramworks(self.ramworks)?;
        if self.ramworks != 0 && !model.is_iie() {
            return Err(EmuError::ConfigInvalid(format!(
                "ramworks needs an Apple IIe, not {}",
                model.name()
            )));
        }
        Ok(())
    }

    /// 実行ループに渡す速度（MHz、0なら最高速）
    pub fn speed_mhz(&self) -> Result<f64> {
        Self::parse_speed(&self.speed)
    }

    /// 相対パスをhomeからの絶対パスに解決
    pub fn resolve_path(&self, relative: &str) -> PathBuf {
        resolve_path_with_base(&self.home, relative)
    }

    /// 構成に従ってマシンを組み立て、リセットする
    pub fn build_machine(&self) -> Result<Apple2> {
        self.validate()?;
        let model = self.apple_model()?;
        self.warn_unavailable();

        let rom = read_file(&self.resolve_path(&self.rom))?;
        let mut machine = Apple2::new(model, &rom)?;

        if let Some(cpu_type) = Self::parse_cpu(&self.cpu)? {
            machine.cpu = Cpu::new(cpu_type);
        }
        if self.ramworks != 0 {
            machine.mmu.set_aux_banks((self.ramworks / 64) as usize);
        }
        if !self.charrom.is_empty() {
            let path = self.resolve_path(&self.charrom);
            let data = read_file(&path)?;
            if data.len() < CHAR_GEN_SIZE {
                return Err(EmuError::ResourceMissing(format!(
                    "{}: character ROM is {} bytes",
                    path.display(),
                    data.len()
                )));
            }
            machine.char_rom = data;
        }

        for (slot, spec) in self.slots.iter().enumerate() {
            if let Some(card) = build_card(spec, &self.home)? {
                machine.insert_card(slot, card)?;
            }
        }

        machine.io.keyboard.force_caps = self.force_caps;
        let (cpu_trace, disk_trace, io_trace) = Self::parse_trace(&self.trace)?;
        machine.cpu.trace = cpu_trace;
        machine.io.trace = io_trace;
        if disk_trace {
            disk_log::set_log_level(disk_log::get_log_level() | DiskLogLevel::all());
        }

        machine.reset();
        log::info!("machine '{}' ready", self.model);
        Ok(machine)
    }

    fn warn_unavailable(&self) {
        if !self.nsc.is_empty() {
            log::warn!("nsc={}: no-slot clock is not emulated", self.nsc);
        }
        if self.profile {
            log::warn!("profile: ProFile hard disk is not emulated");
        }
        if self.rgb {
            log::warn!("rgb: RGB card is not emulated");
        }
        if self.romx {
            log::warn!("romx: ROMX firmware switching is not emulated");
        }
        if !self.mods.is_empty() {
            log::warn!("mods={}: keyboard mods are not emulated", self.mods);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apple2::tests::test_rom;

    fn temp_dir(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("a2core-config-{}-{}", name, std::process::id()));
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_resolve_path_with_base() {
        let abs = if cfg!(windows) { "C:\\roms\\a.rom" } else { "/roms/a.rom" };
        assert_eq!(resolve_path_with_base("home", abs), PathBuf::from(abs));
        assert_eq!(
            resolve_path_with_base("", "roms/a.rom"),
            get_exe_dir().join("roms/a.rom")
        );
        let base = std::env::temp_dir();
        let base_str = base.to_string_lossy().to_string();
        assert_eq!(resolve_path_with_base(&base_str, "a.rom"), base.join("a.rom"));
    }

    #[test]
    fn test_presets() {
        let plus = MachineConfig::preset("2plus").unwrap();
        assert_eq!(plus.apple_model().unwrap(), AppleModel::AppleIIPlus);
        assert_eq!(plus.slots[0], "language");
        assert_eq!(plus.slots[6], "diskii");

        let enh = MachineConfig::preset("2enh").unwrap();
        assert_eq!(enh.apple_model().unwrap(), AppleModel::AppleIIeEnhanced);
        assert!(enh.slots[0].is_empty());

        let multirom = MachineConfig::preset("2plus-multirom").unwrap();
        assert_eq!(multirom.apple_model().unwrap(), AppleModel::AppleIIPlus);
        assert_eq!(multirom.slots[0], "multirom,bank=7,basic=0");
        assert_eq!(multirom.slots[6], "diskii");

        assert!(matches!(MachineConfig::preset("cpm"), Err(EmuError::ConfigInvalid(_))));
        assert!(matches!(MachineConfig::preset("2c"), Err(EmuError::ConfigInvalid(_))));
    }

    #[test]
    fn test_set_keys() {
        let mut c = MachineConfig::preset("2e").unwrap();
        c.set("speed", "pal").unwrap();
        assert_eq!(c.speed_mhz().unwrap(), PAL_MHZ);
        c.set("speed", "full").unwrap();
        assert_eq!(c.speed_mhz().unwrap(), 0.0);
        c.set("speed", "2.8").unwrap();
        assert_eq!(c.speed_mhz().unwrap(), 2.8);
        assert!(c.set("speed", "-1").is_err());
        assert!(c.set("speed", "warp").is_err());

        c.set("cpu", "65C02").unwrap();
        assert!(c.set("cpu", "z80").is_err());
        c.set("forceCaps", "true").unwrap();
        assert!(c.force_caps);
        c.apply("s4=saturn").unwrap();
        assert_eq!(c.slots[4], "saturn");
        assert!(c.set("s8", "diskii").is_err());
        assert!(c.set("volume", "3").is_err());
        assert!(c.set("trace", "cpu,video").is_err());
        assert!(c.set("nsc", "9").is_err());
        c.set("nsc", "main").unwrap();
    }

    #[test]
    fn test_ramworks_limits() {
        let mut c = MachineConfig::preset("2e").unwrap();
        c.set("ramworks", "8192").unwrap();
        assert!(c.validate().is_ok());
        assert!(c.set("ramworks", "100").is_err());
        assert!(c.set("ramworks", "16448").is_err());
        assert!(c.set("ramworks", "lots").is_err());

        let mut plus = MachineConfig::preset("2plus").unwrap();
        plus.set("ramworks", "128").unwrap();
        assert!(matches!(plus.validate(), Err(EmuError::ConfigInvalid(_))));
    }

    #[test]
    fn test_model_key_keeps_home() {
        let mut c = MachineConfig::default();
        c.set("home", "/opt/a2").unwrap();
        c.set("model", "2plus").unwrap();
        assert_eq!(c.home, "/opt/a2");
        assert_eq!(c.slots[0], "language");
    }

    #[test]
    fn test_json_round_trip_and_defaults() {
        let dir = temp_dir("json");
        let path = dir.join("machine.json");
        fs::write(&path, r#"{ "model": "2plus", "forceCaps": true, "speed": "full" }"#).unwrap();
        let c = MachineConfig::load_from(&path).unwrap();
        assert_eq!(c.model, "2plus");
        assert!(c.force_caps);
        assert_eq!(c.ramworks, 0);
        assert_eq!(c.slots[6], "diskii");

        c.save_to(&path).unwrap();
        assert_eq!(MachineConfig::load_from(&path).unwrap(), c);

        fs::write(&path, r#"{ "model": "2plus", "ramworks": 1024 }"#).unwrap();
        assert!(matches!(
            MachineConfig::load_from(&path),
            Err(EmuError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_build_machine() {
        let dir = temp_dir("build");
        fs::write(dir.join("plus.rom"), test_rom(0x3000)).unwrap();
        fs::write(dir.join("chars.rom"), vec![0u8; CHAR_GEN_SIZE * 2]).unwrap();

        let mut c = MachineConfig::preset("2plus").unwrap();
        c.set("home", &dir.to_string_lossy()).unwrap();
        c.set("rom", "plus.rom").unwrap();
        c.set("charrom", "chars.rom").unwrap();
        c.set("s6", "").unwrap();
        c.set("cpu", "65c02").unwrap();
        c.set("forceCaps", "on").unwrap();
        c.set("trace", "io").unwrap();

        let m = c.build_machine().unwrap();
        assert_eq!(m.model, AppleModel::AppleIIPlus);
        assert_eq!(m.cpu.cpu_type, CpuType::Cpu65C02);
        assert_eq!(m.cpu.regs.pc, 0xF000);
        assert_eq!(m.card_name(0), Some("language"));
        assert_eq!(m.card_name(6), None);
        assert_eq!(m.char_rom.len(), CHAR_GEN_SIZE * 2);
        assert!(m.io.keyboard.force_caps);
        assert!(m.io.trace);
    }

    #[test]
    fn test_build_multirom_machine() {
        let dir = temp_dir("multirom");
        fs::write(dir.join("plus.rom"), test_rom(0x3000)).unwrap();
        let mut banks = vec![0u8; 0x3000 * 7];
        banks.extend(test_rom(0x3000));
        fs::create_dir_all(dir.join("roms")).unwrap();
        fs::write(dir.join("roms/MultiROM.bin"), banks).unwrap();

        let mut c = MachineConfig::preset("2plus-multirom").unwrap();
        c.set("home", &dir.to_string_lossy()).unwrap();
        c.set("rom", "plus.rom").unwrap();
        c.set("charrom", "").unwrap();
        c.set("s6", "").unwrap();

        let mut m = c.build_machine().unwrap();
        assert_eq!(m.card_name(0), Some("multirom"));
        // リセットベクタはバンク7のモニタから
        assert_eq!(m.cpu.regs.pc, 0xF000);
        assert_eq!(m.mmu.peek(0xD000), 0x00);
    }

    #[test]
    fn test_build_machine_missing_resources() {
        let dir = temp_dir("missing");
        fs::write(dir.join("plus.rom"), test_rom(0x3000)).unwrap();
        fs::write(dir.join("short.rom"), vec![0u8; 100]).unwrap();

        let mut c = MachineConfig::preset("2plus").unwrap();
        c.set("home", &dir.to_string_lossy()).unwrap();
        c.set("rom", "absent.rom").unwrap();
        assert!(matches!(c.build_machine(), Err(EmuError::ResourceMissing(_))));

        c.set("rom", "plus.rom").unwrap();
        c.set("charrom", "short.rom").unwrap();
        assert!(matches!(c.build_machine(), Err(EmuError::ResourceMissing(_))));

        // Disk IIのP5 ROMがない
        c.set("charrom", "").unwrap();
        assert!(matches!(c.build_machine(), Err(EmuError::ResourceMissing(_))));

        c.set("s6", "").unwrap();
        c.set("s3", "mockingboard").unwrap();
        assert!(matches!(c.build_machine(), Err(EmuError::ConfigInvalid(_))));
    }

    #[test]
    fn test_language_card_rejected_on_iie_config() {
        let dir = temp_dir("iie");
        fs::write(dir.join("e.rom"), test_rom(0x4000)).unwrap();
        let mut c = MachineConfig::preset("2e").unwrap();
        c.set("home", &dir.to_string_lossy()).unwrap();
        c.set("rom", "e.rom").unwrap();
        c.set("charrom", "").unwrap();
        c.set("s6", "").unwrap();
        c.set("ramworks", "512").unwrap();
        let m = c.build_machine().unwrap();
        assert_eq!(m.mmu.aux_banks(), 8);

        c.set("s0", "language").unwrap();
        assert!(matches!(c.build_machine(), Err(EmuError::ConfigInvalid(_))));
    }
}
