//! Disk II ログシステム
//!
//! 原則:
//! 1. 状態遷移のみ記録（毎回のI/Oは記録しない）
//! 2. カテゴリ分離: MOTOR / HEAD / DATA
//! 3. DATAはリングバッファに溜めてモーター停止時にまとめて出す

use std::sync::atomic::{AtomicU32, Ordering};

bitflags::bitflags! {
    /// ログカテゴリ
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct DiskLogLevel: u32 {
        /// モーターのON/OFFとドライブ選択
        const MOTOR = 0b0001;
        /// ヘッド位置（クォータートラック）の変化
        const HEAD  = 0b0010;
        /// ラッチされたデータバイト
        const DATA  = 0b0100;
    }
}

impl DiskLogLevel {
    /// `motor+head`形式の文字列を解析（`all`は全カテゴリ）
    pub fn parse(text: &str) -> Option<Self> {
        let mut level = DiskLogLevel::empty();
        for part in text.split('+').map(str::trim).filter(|p| !p.is_empty()) {
            level |= match part.to_ascii_lowercase().as_str() {
                "motor" => DiskLogLevel::MOTOR,
                "head" => DiskLogLevel::HEAD,
                "data" => DiskLogLevel::DATA,
                "all" => DiskLogLevel::all(),
                _ => return None,
            };
        }
        Some(level)
    }
}

/// グローバルログレベル
static LOG_LEVEL: AtomicU32 = AtomicU32::new(0);

/// ログレベルを設定
pub fn set_log_level(level: DiskLogLevel) {
    LOG_LEVEL.store(level.bits(), Ordering::Relaxed);
}

/// 現在のログレベルを取得
pub fn get_log_level() -> DiskLogLevel {
    DiskLogLevel::from_bits_truncate(LOG_LEVEL.load(Ordering::Relaxed))
}

/// ログレベルが有効かチェック
#[inline]
pub fn is_enabled(flag: DiskLogLevel) -> bool {
    (LOG_LEVEL.load(Ordering::Relaxed) & flag.bits()) != 0
}

/// グローバルかカード個別のレベルのどちらかで有効か
#[inline]
pub fn is_enabled_for(local: DiskLogLevel, flag: DiskLogLevel) -> bool {
    local.intersects(flag) || is_enabled(flag)
}

/// ニブルリングバッファ（最後のN個を保持）
pub struct NibbleRing {
    buf: Vec<u8>,
    pos: usize,
    capacity: usize,
}

impl NibbleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            pos: 0,
            capacity,
        }
    }

    pub fn push(&mut self, nibble: u8) {
        self.buf[self.pos % self.capacity] = nibble;
        self.pos += 1;
    }

    /// 最新からN個を取得（古い順）
    pub fn last_n(&self, n: usize) -> Vec<u8> {
        let n = n.min(self.capacity).min(self.pos);
        (0..n)
            .map(|i| self.buf[(self.pos - n + i) % self.capacity])
            .collect()
    }

    pub fn clear(&mut self) {
        self.pos = 0;
    }

    /// 溜まったニブルを16個ずつログに出す
    pub fn dump(&self, local: DiskLogLevel, slot: usize) {
        if !is_enabled_for(local, DiskLogLevel::DATA) {
            return;
        }
        let data = self.last_n(self.capacity);
        for line in data.chunks(16) {
            let hex: Vec<String> = line.iter().map(|b| format!("{:02X}", b)).collect();
            log::info!(target: "disk", "S{} data {}", slot, hex.join(" "));
        }
    }
}

impl Default for NibbleRing {
    fn default() -> Self {
        Self::new(256)
    }
}

// ============================================================
// ログ出力関数
// ============================================================

/// [MOTOR] モーターON/OFF
pub fn log_motor(local: DiskLogLevel, slot: usize, drive: usize, on: bool) {
    if is_enabled_for(local, DiskLogLevel::MOTOR) {
        log::info!(
            target: "disk",
            "S{}D{} motor {}",
            slot,
            drive + 1,
            if on { "ON" } else { "OFF" }
        );
    }
}

/// [MOTOR] ドライブ選択
pub fn log_drive_select(local: DiskLogLevel, slot: usize, drive: usize) {
    if is_enabled_for(local, DiskLogLevel::MOTOR) {
        log::info!(target: "disk", "S{} drive {} selected", slot, drive + 1);
    }
}

/// [HEAD] クォータートラック変更
pub fn log_head(local: DiskLogLevel, slot: usize, drive: usize, from: u8, to: u8) {
    if is_enabled_for(local, DiskLogLevel::HEAD) {
        log::info!(
            target: "disk",
            "S{}D{} quarter-track {} -> {} (track {:.2})",
            slot,
            drive + 1,
            from,
            to,
            to as f32 / 4.0
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nibble_ring() {
        let mut ring = NibbleRing::new(8);
        for i in 0..10 {
            ring.push(i as u8);
        }
        let last4 = ring.last_n(4);
        assert_eq!(last4, vec![6, 7, 8, 9]);
        ring.clear();
        assert!(ring.last_n(4).is_empty());
    }

    #[test]
    fn test_log_level() {
        set_log_level(DiskLogLevel::MOTOR | DiskLogLevel::HEAD);
        assert!(is_enabled(DiskLogLevel::MOTOR));
        assert!(is_enabled(DiskLogLevel::HEAD));
        assert!(!is_enabled(DiskLogLevel::DATA));
        set_log_level(DiskLogLevel::empty());
        assert_eq!(get_log_level(), DiskLogLevel::empty());
    }

    #[test]
    fn test_local_level() {
        assert!(is_enabled_for(DiskLogLevel::all(), DiskLogLevel::DATA));
        assert!(is_enabled_for(DiskLogLevel::HEAD, DiskLogLevel::HEAD));
        // DATAはグローバルでは立てない
        assert!(!is_enabled_for(DiskLogLevel::HEAD, DiskLogLevel::DATA));
    }

    #[test]
    fn test_parse_level() {
        assert_eq!(
            DiskLogLevel::parse("motor+head"),
            Some(DiskLogLevel::MOTOR | DiskLogLevel::HEAD)
        );
        assert_eq!(DiskLogLevel::parse("all"), Some(DiskLogLevel::all()));
        assert_eq!(DiskLogLevel::parse(""), Some(DiskLogLevel::empty()));
        assert_eq!(DiskLogLevel::parse("motor+sector"), None);
    }
}
