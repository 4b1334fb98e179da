//! エミュレータのエラー分類
//!
//! セットアップ時のエラーはマシン構築を中断して呼び出し元へ返す。
//! CPU自体はエラーを返さない。

use std::path::PathBuf;
use thiserror::Error;

/// コアが報告するエラー
#[derive(Debug, Error)]
pub enum EmuError {
    /// 不明なモデル・カード、不正なパラメータ、範囲外のRAMWorksサイズなど
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),

    /// ROM・キャラクタROM・ディスクイメージが見つからない、またはサイズ不足
    #[error("missing resource: {0}")]
    ResourceMissing(String),

    /// 未対応のWOZバージョン、イメージサイズ、両面ディスク
    #[error("unsupported format: {0}")]
    FormatUnsupported(String),

    /// ホストファイルの読み書き失敗
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// 2枚目のカードがDMAを要求した（致命的）
    #[error("bus conflict: slot {requester} requested DMA while slot {holder} holds the bus")]
    BusConflict { holder: usize, requester: usize },
}

pub type Result<T> = std::result::Result<T, EmuError>;

impl EmuError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EmuError::Io {
            path: path.into(),
            source,
        }
    }
}

/// ファイルを読み込む。存在しない場合はResourceMissingとして扱う
pub fn read_file(path: &std::path::Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            EmuError::ResourceMissing(format!("{} not found", path.display()))
        } else {
            EmuError::io(path, e)
        }
    })
}
