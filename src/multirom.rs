//! マルチROMカード（II/II+のスロット0）
//!
//! 12KBのROMセット（$D000-$FFFF）を複数持つイメージから、BASIC部分
//! （$D000-$F7FF）とモニタ部分（$F800-$FFFF）を別々のバンクから選んで
//! マザーボードのROMの代わりに見せる。

use crate::apple2::Apple2;
use crate::card::{Card, CardParams};
use crate::error::{read_file, EmuError, Result};

/// 1バンクの大きさ（$D000-$FFFF）
pub const BANK_SIZE: usize = 0x3000;
/// BASIC部分の大きさ（$D000-$F7FF）
const BASIC_SIZE: usize = 0x2800;
const MAX_BANKS: usize = 16;

#[derive(Debug)]
pub struct MultiRomCard {
    image: Vec<u8>,
    /// モニタ（$F800-$FFFF）のバンク
    bank: usize,
    /// BASIC（$D000-$F7FF）のバンク
    basic: usize,
}

impl MultiRomCard {
    pub fn new(image: Vec<u8>, bank: usize, basic: usize) -> Result<Self> {
        if image.is_empty() || image.len() % BANK_SIZE != 0 || image.len() > BANK_SIZE * MAX_BANKS {
            return Err(EmuError::FormatUnsupported(format!(
                "multi-ROM image must be 1 to {} banks of 12 KiB, got {} bytes",
                MAX_BANKS,
                image.len()
            )));
        }
        let banks = image.len() / BANK_SIZE;
        for (key, value) in [("bank", bank), ("basic", basic)] {
            if value >= banks {
                return Err(EmuError::ConfigInvalid(format!(
                    "multirom: {} {} out of range (image has {} banks)",
                    key, value, banks
                )));
            }
        }
        Ok(MultiRomCard { image, bank, basic })
    }

    /// カードパラメータから生成
    pub fn build(params: &CardParams) -> Result<Box<dyn Card>> {
        let path = params
            .get_path("rom")
            .ok_or_else(|| EmuError::ConfigInvalid("multirom: rom must not be empty".to_string()))?;
        let image = read_file(&path)?;
        let card = MultiRomCard::new(image, parse_bank(params, "bank")?, parse_bank(params, "basic")?)?;
        log::info!(
            "multi-ROM {}: {} banks, monitor bank {}, BASIC bank {}",
            path.display(),
            card.banks(),
            card.bank,
            card.basic
        );
        Ok(Box::new(card))
    }

    pub fn banks(&self) -> usize {
        self.image.len() / BANK_SIZE
    }

    /// 選択中のバンクから$D000-$FFFFのイメージを組み立てる
    pub fn compose(&self) -> Box<[u8]> {
        let basic = &self.image[self.basic * BANK_SIZE..][..BASIC_SIZE];
        let monitor = &self.image[self.bank * BANK_SIZE + BASIC_SIZE..][..BANK_SIZE - BASIC_SIZE];
        [basic, monitor].concat().into_boxed_slice()
    }
}

fn parse_bank(params: &CardParams, key: &str) -> Result<usize> {
    let value = params.get(key);
    value.parse().map_err(|_| {
        EmuError::ConfigInvalid(format!("multirom: {} must be a number, got '{}'", key, value))
    })
}

impl Card for MultiRomCard {
    fn name(&self) -> &str {
        "multirom"
    }

    fn assign(&mut self, slot: usize, machine: &mut Apple2) -> Result<()> {
        if machine.mmu.is_iie {
            return Err(EmuError::ConfigInvalid(
                "multirom card is for the Apple II/II+".to_string(),
            ));
        }
        machine.mmu.set_rom_inhibit(Some(self.compose()));
        log::debug!("multi-ROM installed in slot {}", slot);
        Ok(())
    }

    fn unassign(&mut self, machine: &mut Apple2) {
        machine.mmu.set_rom_inhibit(None);
    }

    // ソフトスイッチは持たない
    fn read_softswitch(&mut self, _index: u8, machine: &mut Apple2) -> u8 {
        machine.cycles() as u8
    }

    fn write_softswitch(&mut self, _index: u8, _value: u8, _machine: &mut Apple2) {}

    fn debug_info(&self) -> String {
        format!(
            "multi-ROM: {} banks, monitor bank {}, BASIC bank {}",
            self.banks(),
            self.bank,
            self.basic
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apple2::tests::test_machine;
    use crate::apple2::AppleModel;
    use crate::cpu::MemoryBus;

    /// バンク番号で埋めたイメージ
    fn image(banks: usize) -> Vec<u8> {
        (0..banks).flat_map(|b| vec![b as u8; BANK_SIZE]).collect()
    }

    #[test]
    fn test_compose_mixes_basic_and_monitor() {
        let card = MultiRomCard::new(image(8), 7, 0).unwrap();
        let rom = card.compose();
        assert_eq!(rom.len(), BANK_SIZE);
        assert_eq!(rom[0], 0);
        assert_eq!(rom[BASIC_SIZE - 1], 0);
        assert_eq!(rom[BASIC_SIZE], 7);
        assert_eq!(rom[BANK_SIZE - 1], 7);
    }

    #[test]
    fn test_rejects_bad_images_and_banks() {
        assert!(matches!(
            MultiRomCard::new(vec![0; 0x2000], 0, 0),
            Err(EmuError::FormatUnsupported(_))
        ));
        assert!(matches!(
            MultiRomCard::new(image(2), 2, 0),
            Err(EmuError::ConfigInvalid(_))
        ));
        assert!(matches!(
            MultiRomCard::new(image(2), 0, 5),
            Err(EmuError::ConfigInvalid(_))
        ));
    }

    #[test]
    fn test_replaces_motherboard_rom() {
        let mut m = test_machine(AppleModel::AppleIIPlus);
        assert_eq!(m.read(0xD000), 0xEA);
        m.insert_card(0, Box::new(MultiRomCard::new(image(8), 3, 1).unwrap()))
            .unwrap();
        assert_eq!(m.read(0xD000), 1);
        assert_eq!(m.read(0xF7FF), 1);
        assert_eq!(m.read(0xF800), 3);
        assert_eq!(m.read(0xFFFF), 3);
        // 書き込みは無視
        m.write(0xE000, 0x55);
        assert_eq!(m.read(0xE000), 1);

        m.remove_card(0);
        assert_eq!(m.read(0xD000), 0xEA);
    }

    #[test]
    fn test_rejected_on_iie() {
        let mut m = test_machine(AppleModel::AppleIIe);
        let card = MultiRomCard::new(image(1), 0, 0).unwrap();
        assert!(matches!(m.insert_card(0, Box::new(card)), Err(EmuError::ConfigInvalid(_))));
    }

    #[test]
    fn test_build_from_params() {
        let path = std::env::temp_dir().join(format!("a2core-multirom-{}.bin", std::process::id()));
        std::fs::write(&path, image(8)).unwrap();
        let spec = format!("multirom,rom=\"{}\",bank=7,basic=0", path.display());
        let card = crate::card::build_card(&spec, "").unwrap().unwrap();
        assert_eq!(card.name(), "multirom");
        assert!(card.debug_info().contains("monitor bank 7"));

        let bad = format!("multirom,rom=\"{}\",bank=seven", path.display());
        assert!(matches!(
            crate::card::build_card(&bad, ""),
            Err(EmuError::ConfigInvalid(_))
        ));
        std::fs::remove_file(&path).unwrap();
    }
}
