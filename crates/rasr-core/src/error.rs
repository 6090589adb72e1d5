//! 学習データ層のエラー型
//!
//! セットアップ時の致命的エラーと、バッチ単位で隔離できるエラーを区別する。

use std::path::PathBuf;

/// rasr-core 共通のエラー
#[derive(thiserror::Error, Debug)]
pub enum RasrError {
    /// 設定値が不正・矛盾している（セットアップ時に検出、致命的）
    #[error("Invalid config: {0}")]
    InvalidConfig(String),

    /// 必須ファイル・ハンドルが存在しない／開けない
    #[error("Resource unavailable: {}: {source}", path.display())]
    ResourceUnavailable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// ストアに要求されたキーが存在しない（レコード単位）
    #[error("Not found: {0}")]
    NotFound(String),

    /// 特徴量・テキストをデコードできない（レコード単位）
    #[error("Decode error in {what}: {reason}")]
    Decode { what: String, reason: String },

    /// 勾配ノルムが有限でない（該当ステップのみスキップ）
    #[error("Non-finite gradient norm: {norm}")]
    NumericInstability { norm: f32 },

    /// File I/O error
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON parse/serialize error
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl RasrError {
    /// パス付きの `ResourceUnavailable` を作る
    pub fn unavailable(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        RasrError::ResourceUnavailable {
            path: path.into(),
            source,
        }
    }

    pub fn decode(what: impl Into<String>, reason: impl Into<String>) -> Self {
        RasrError::Decode {
            what: what.into(),
            reason: reason.into(),
        }
    }

    /// バッチ単位で隔離できる（ログを残してスキップしてよい）エラーか
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RasrError::NotFound(_) | RasrError::Decode { .. } | RasrError::NumericInstability { .. }
        )
    }
}

/// Result type for rasr-core operations
pub type RasrResult<T> = Result<T, RasrError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(RasrError::NotFound("utt1".into()).is_recoverable());
        assert!(RasrError::decode("utt1", "short read").is_recoverable());
        assert!(RasrError::NumericInstability { norm: f32::NAN }.is_recoverable());
        assert!(!RasrError::InvalidConfig("ratio".into()).is_recoverable());
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        assert!(!RasrError::unavailable("/tmp/x", io).is_recoverable());
    }

    #[test]
    fn test_display_contains_path() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let msg = RasrError::unavailable("/data/feats.ark", io).to_string();
        assert!(msg.contains("/data/feats.ark"));
    }
}
