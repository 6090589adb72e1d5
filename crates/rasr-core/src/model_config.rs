//! 学習時と認識時で共有するモデル設定（`model.json`）

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{RasrError, RasrResult};

pub const MODEL_CONFIG_VERSION: u32 = 1;
pub const MODEL_CONFIG_FILE: &str = "model.json";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ModelConfig {
    pub version: u32,
    /// 音響特徴量の次元
    pub idim: usize,
    /// 出力語彙サイズ
    pub odim: usize,
    /// テキスト拡張の入力語彙サイズ（拡張なしなら `None`）
    #[serde(default)]
    pub augment_idim: Option<usize>,
    /// 出力トークン表（ID順）
    #[serde(default)]
    pub char_list: Vec<String>,
    /// 学習時の設定一式
    pub train: Value,
}

impl ModelConfig {
    pub fn new(idim: usize, odim: usize, augment_idim: Option<usize>, char_list: Vec<String>, train: Value) -> Self {
        Self {
            version: MODEL_CONFIG_VERSION,
            idim,
            odim,
            augment_idim,
            char_list,
            train,
        }
    }

    pub fn save(&self, path: &Path) -> RasrResult<()> {
        let file = File::create(path).map_err(|e| RasrError::unavailable(path, e))?;
        let mut w = BufWriter::new(file);
        serde_json::to_writer_pretty(&mut w, self)?;
        w.write_all(b"\n")?;
        w.flush()?;
        log::info!("Wrote model config {}", path.display());
        Ok(())
    }

    /// 読み込み。未知のバージョンは中身を見る前に拒否する
    pub fn load(path: &Path) -> RasrResult<Self> {
        let file = File::open(path).map_err(|e| RasrError::unavailable(path, e))?;
        let raw: Value = serde_json::from_reader(BufReader::new(file))?;
        Self::from_value(raw)
    }

    pub fn from_value(raw: Value) -> RasrResult<Self> {
        match raw.get("version").and_then(Value::as_u64) {
            Some(v) if v == MODEL_CONFIG_VERSION as u64 => {}
            Some(v) => {
                return Err(RasrError::InvalidConfig(format!(
                    "unsupported model config version {v} (expected {MODEL_CONFIG_VERSION})"
                )));
            }
            None => return Err(RasrError::InvalidConfig("model config has no version".into())),
        }
        serde_json::from_value(raw).map_err(|e| RasrError::InvalidConfig(format!("model config: {e}")))
    }

    /// `train` を具体的な設定型として取り出す
    pub fn train_settings<T: DeserializeOwned>(&self) -> RasrResult<T> {
        serde_json::from_value(self.train.clone())
            .map_err(|e| RasrError::InvalidConfig(format!("model config train section: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MODEL_CONFIG_FILE);
        let conf = ModelConfig::new(83, 52, Some(30), vec!["<blank>".into(), "a".into()], json!({"seed": 1}));
        conf.save(&path).unwrap();
        assert_eq!(ModelConfig::load(&path).unwrap(), conf);
    }

    #[test]
    fn test_unknown_version_fails_fast() {
        let err = ModelConfig::from_value(json!({"version": 2, "whatever": true})).unwrap_err();
        assert!(matches!(err, RasrError::InvalidConfig(_)));
        assert!(ModelConfig::from_value(json!({"idim": 1})).is_err());
    }

    #[test]
    fn test_unknown_field_rejected() {
        let raw = json!({"version": 1, "idim": 1, "odim": 2, "train": {}, "extra": 0});
        assert!(matches!(ModelConfig::from_value(raw), Err(RasrError::InvalidConfig(_))));
    }
}
