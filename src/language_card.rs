//! ランゲージカードとSaturn 128Kカード
//!
//! どちらもバンク切り替えの状態はMMUが持ち、カードはスロットのソフトスイッチを
//! MMUのランゲージカード処理へ渡すだけ。

use crate::apple2::Apple2;
use crate::card::{Card, CardParams};
use crate::error::{EmuError, Result};

fn check_model(name: &str, machine: &Apple2) -> Result<()> {
    if machine.mmu.is_iie {
        return Err(EmuError::ConfigInvalid(format!(
            "{} card is for the Apple II/II+ (the IIe has a built-in language card)",
            name
        )));
    }
    Ok(())
}

/// 16KBランゲージカード（II/II+のスロット0）
#[derive(Debug, Default)]
pub struct LanguageCard;

impl LanguageCard {
    pub fn build(_params: &CardParams) -> Result<Box<dyn Card>> {
        Ok(Box::new(LanguageCard))
    }
}

impl Card for LanguageCard {
    fn name(&self) -> &str {
        "language"
    }

    fn assign(&mut self, slot: usize, machine: &mut Apple2) -> Result<()> {
        check_model("language", machine)?;
        machine.mmu.install_language_card(1);
        machine.io.add_card_softswitches(slot, &[], "LANGCARD");
        log::debug!("language card installed in slot {}", slot);
        Ok(())
    }

    fn read_softswitch(&mut self, index: u8, machine: &mut Apple2) -> u8 {
        machine.mmu.lc_softswitch(index, false);
        machine.cycles() as u8
    }

    fn write_softswitch(&mut self, index: u8, _value: u8, machine: &mut Apple2) {
        machine.mmu.lc_softswitch(index, true);
    }

    fn debug_info(&self) -> String {
        "language card".to_string()
    }
}

/// Saturn 128Kカード（16KBブロック×8）
///
/// $C0x4-$C0x7と$C0xC-$C0xFはブロック選択、それ以外は通常のランゲージカード。
#[derive(Debug, Default)]
pub struct SaturnCard {
    block: usize,
}

/// Saturnのブロック数
const SATURN_BLOCKS: usize = 8;

impl SaturnCard {
    pub fn build(_params: &CardParams) -> Result<Box<dyn Card>> {
        Ok(Box::new(SaturnCard::default()))
    }

    fn switch(&mut self, index: u8, write: bool, machine: &mut Apple2) {
        if index & 0x04 != 0 {
            self.block = ((index & 0x03) | ((index >> 1) & 0x04)) as usize;
            machine.mmu.select_lc_block(self.block);
        } else {
            machine.mmu.lc_softswitch(index, write);
        }
    }
}

impl Card for SaturnCard {
    fn name(&self) -> &str {
        "saturn"
    }

    fn assign(&mut self, slot: usize, machine: &mut Apple2) -> Result<()> {
        check_model("saturn", machine)?;
        machine.mmu.install_language_card(SATURN_BLOCKS);
        machine.io.add_card_softswitches(slot, &[], "SATURN");
        log::debug!("Saturn 128K installed in slot {}", slot);
        Ok(())
    }

    fn reset(&mut self, machine: &mut Apple2) {
        self.block = 0;
        machine.mmu.select_lc_block(0);
    }

    fn read_softswitch(&mut self, index: u8, machine: &mut Apple2) -> u8 {
        self.switch(index, false, machine);
        machine.cycles() as u8
    }

    fn write_softswitch(&mut self, index: u8, _value: u8, machine: &mut Apple2) {
        self.switch(index, true, machine);
    }

    fn debug_info(&self) -> String {
        format!("Saturn 128K: block {}", self.block)
    }
}
