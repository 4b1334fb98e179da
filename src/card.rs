//! 拡張カードの共通インターフェース
//!
//! カードはスロット0〜7に装着され、スロットROM（$Cs00）、拡張ROM（$C800-$CFFF）、
//! ソフトスイッチ（$C080+s*16〜+15）を持つ。カードは他のカードへの参照を持たず、
//! 呼び出し時に渡される`Apple2`を通してマシンにアクセスする。

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::apple2::Apple2;
use crate::config::resolve_path_with_base;
use crate::disk::DiskIICard;
use crate::error::{EmuError, Result};
use crate::language_card::{LanguageCard, SaturnCard};
use crate::multirom::MultiRomCard;

/// 拡張カード
pub trait Card: Send {
    /// カード名（ファクトリのキー）
    fn name(&self) -> &str;

    /// スロットへの装着。ROMの取り付けとソフトスイッチの登録を行う
    fn assign(&mut self, slot: usize, machine: &mut Apple2) -> Result<()>;

    /// スロットから外すときの後始末（ROMとソフトスイッチはマシン側が外す）
    fn unassign(&mut self, _machine: &mut Apple2) {}

    /// CPUリセット時の処理
    fn reset(&mut self, _machine: &mut Apple2) {}

    /// ソフトスイッチの読み取り（indexは0〜15）
    fn read_softswitch(&mut self, index: u8, machine: &mut Apple2) -> u8;

    /// ソフトスイッチへの書き込み
    fn write_softswitch(&mut self, index: u8, value: u8, machine: &mut Apple2);

    /// DMAでバスを握っている間、CPUの代わりに呼ばれる。サイクルはカードが加算する
    fn dma_cycle(&mut self, machine: &mut Apple2) {
        machine.add_cycles(1);
    }

    /// ディスクを扱うカードならイメージを差し替えてtrueを返す
    fn load_disk(&mut self, _drive: usize, _path: &Path) -> Result<bool> {
        Ok(false)
    }

    /// デバッグ表示用の状態
    fn debug_info(&self) -> String {
        String::new()
    }
}

//--------------------------------------------------
// カードROM
//--------------------------------------------------

/// カードROMの配置
///
/// - 256バイト: スロットページのみ
/// - 256+2048バイト: スロットページ + 拡張ROM
/// - 256+1024バイト: スロットページ + 拡張ROM（1KBを2回繰り返す）
/// - 4096バイト: $C000-$CFFF全体のイメージ（スロットページは$Cs00、拡張ROMは$C800から）
#[derive(Debug, Clone)]
pub struct CardRom {
    page: [u8; 256],
    extended: Option<Vec<u8>>,
}

impl CardRom {
    pub fn new(page: [u8; 256]) -> Self {
        CardRom {
            page,
            extended: None,
        }
    }

    /// 拡張ROM付き（1KBは$C800と$CC00に重ねる）
    pub fn with_extended(page: [u8; 256], extended: &[u8]) -> Result<Self> {
        let extended = match extended.len() {
            2048 => extended.to_vec(),
            1024 => [extended, extended].concat(),
            n => {
                return Err(EmuError::FormatUnsupported(format!(
                    "extended card ROM must be 1 KiB or 2 KiB, got {} bytes",
                    n
                )))
            }
        };
        Ok(CardRom {
            page,
            extended: Some(extended),
        })
    }

    /// イメージの大きさから配置を判定する
    pub fn from_image(data: &[u8], slot: usize) -> Result<Self> {
        let page_of = |bytes: &[u8]| {
            let mut page = [0u8; 256];
            page.copy_from_slice(&bytes[..256]);
            page
        };
        match data.len() {
            256 => Ok(CardRom::new(page_of(data))),
            1280 | 2304 => CardRom::with_extended(page_of(data), &data[256..]),
            4096 => {
                let base = (slot & 7) * 256;
                CardRom::with_extended(page_of(&data[base..]), &data[0x800..])
            }
            n => Err(EmuError::FormatUnsupported(format!(
                "card ROM has unsupported size ({} bytes)",
                n
            ))),
        }
    }

    pub fn page(&self) -> &[u8; 256] {
        &self.page
    }

    pub fn extended(&self) -> Option<&[u8]> {
        self.extended.as_deref()
    }
}

//--------------------------------------------------
// ファクトリ
//--------------------------------------------------

/// カードパラメータの定義
#[derive(Debug, Clone, Copy)]
pub struct ParamSpec {
    pub name: &'static str,
    pub description: &'static str,
    pub default: &'static str,
}

/// 名前からカードを生成するエントリ
pub struct CardFactory {
    pub name: &'static str,
    pub description: &'static str,
    pub params: &'static [ParamSpec],
    pub build: fn(&CardParams) -> Result<Box<dyn Card>>,
}

/// 既定値で補完済みのパラメータ
#[derive(Debug, Clone)]
pub struct CardParams {
    card: String,
    values: BTreeMap<String, String>,
    base_dir: String,
}

impl CardParams {
    pub fn get(&self, key: &str) -> &str {
        self.values.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn get_bool(&self, key: &str) -> Result<bool> {
        match self.get(key).to_ascii_lowercase().as_str() {
            "true" | "on" | "1" | "yes" => Ok(true),
            "false" | "off" | "0" | "no" | "" => Ok(false),
            other => Err(EmuError::ConfigInvalid(format!(
                "{}: {} must be a boolean, got '{}'",
                self.card, key, other
            ))),
        }
    }

    /// 空なら`None`、相対パスはホームディレクトリ基準で解決
    pub fn get_path(&self, key: &str) -> Option<PathBuf> {
        let value = self.get(key);
        if value.is_empty() {
            None
        } else {
            Some(resolve_path_with_base(&self.base_dir, value))
        }
    }
}

static DISKII_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "disk1", description: "Disk image for drive 1", default: "" },
    ParamSpec { name: "disk2", description: "Disk image for drive 2", default: "" },
    ParamSpec { name: "rom", description: "P5 boot ROM (16 sector)", default: "roms/DISK2.rom" },
    ParamSpec { name: "rom13", description: "P5 boot ROM (13 sector)", default: "roms/DISK2-13sector.rom" },
    ParamSpec { name: "fast", description: "Run unthrottled while the motor is on", default: "true" },
    ParamSpec { name: "trace", description: "Log motor, head and data events of this card", default: "false" },
];

static MULTIROM_PARAMS: &[ParamSpec] = &[
    ParamSpec { name: "rom", description: "ROM image made of 12 KiB $D000-$FFFF banks", default: "roms/MultiROM.bin" },
    ParamSpec { name: "bank", description: "Bank supplying the monitor ($F800-$FFFF)", default: "0" },
    ParamSpec { name: "basic", description: "Bank supplying BASIC ($D000-$F7FF)", default: "0" },
];

static NO_PARAMS: &[ParamSpec] = &[];

static FACTORIES: &[CardFactory] = &[
    CardFactory {
        name: "diskii",
        description: "Disk II interface card with the P6 sequencer",
        params: DISKII_PARAMS,
        build: DiskIICard::build,
    },
    CardFactory {
        name: "language",
        description: "16 KiB language card (II/II+ slot 0)",
        params: NO_PARAMS,
        build: LanguageCard::build,
    },
    CardFactory {
        name: "saturn",
        description: "Saturn 128K RAM card",
        params: NO_PARAMS,
        build: SaturnCard::build,
    },
    CardFactory {
        name: "multirom",
        description: "Multi-ROM card replacing the motherboard ROM (II/II+ slot 0)",
        params: MULTIROM_PARAMS,
        build: MultiRomCard::build,
    },
];

/// 登録済みのカード一覧
pub fn card_factories() -> &'static [CardFactory] {
    FACTORIES
}

/// `card_name[,key=value]*`を分解する。値は"..."で囲むとカンマを含められる
pub fn parse_card_spec(spec: &str) -> Result<(String, Vec<(String, String)>)> {
    let mut fields = Vec::new();
    let mut current = String::new();
    let mut quoted = false;
    for c in spec.chars() {
        match c {
            '"' => quoted = !quoted,
            ',' if !quoted => fields.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    if quoted {
        return Err(EmuError::ConfigInvalid(format!(
            "unterminated quote in '{}'",
            spec
        )));
    }
    fields.push(current);

    let mut fields = fields.into_iter();
    let name = fields.next().unwrap_or_default().trim().to_string();
    let mut pairs = Vec::new();
    for field in fields {
        if field.trim().is_empty() {
            continue;
        }
        let (key, value) = field.split_once('=').ok_or_else(|| {
            EmuError::ConfigInvalid(format!("parameter '{}' is not key=value", field))
        })?;
        pairs.push((key.trim().to_string(), value.trim().to_string()));
    }
    Ok((name, pairs))
}

/// 設定文字列からカードを生成する。空文字列または`empty`ならNone
pub fn build_card(spec: &str, base_dir: &str) -> Result<Option<Box<dyn Card>>> {
    let (name, pairs) = parse_card_spec(spec)?;
    if name.is_empty() || name == "empty" {
        return Ok(None);
    }
    let factory = FACTORIES
        .iter()
        .find(|f| f.name == name)
        .ok_or_else(|| EmuError::ConfigInvalid(format!("unknown card '{}'", name)))?;

    let mut values: BTreeMap<String, String> = factory
        .params
        .iter()
        .map(|p| (p.name.to_string(), p.default.to_string()))
        .collect();
    for (key, value) in pairs {
        if !values.contains_key(&key) {
            return Err(EmuError::ConfigInvalid(format!(
                "card '{}' has no parameter '{}'",
                name, key
            )));
        }
        values.insert(key, value);
    }
    let params = CardParams {
        card: name,
        values,
        base_dir: base_dir.to_string(),
    };
    (factory.build)(&params).map(Some)
}
