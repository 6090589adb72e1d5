//! 遅延読み込みの音響特徴量ストア
//!
//! キー → (ファイル, オフセット) の表だけを保持し、バッチが要求した時点で
//! 該当発話だけをデコードする。開いたファイルはパス毎にキャッシュして使い回す。

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::batching::Batch;
use crate::codec::{FeatureCodec, FeatureMatrix, KaldiBinaryCodec};
use crate::error::{RasrError, RasrResult};
use crate::manifest::Manifest;

/// 特徴量の格納位置（`<path>:<offset>`）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FeatureLocation {
    pub path: PathBuf,
    pub offset: u64,
}

impl FromStr for FeatureLocation {
    type Err = RasrError;

    fn from_str(s: &str) -> RasrResult<Self> {
        // パス自体に ':' が含まれうるので最後の ':' で分ける
        let (path, offset) = s
            .rsplit_once(':')
            .ok_or_else(|| RasrError::decode(format!("location '{s}'"), "expected <path>:<offset>"))?;
        let offset = offset
            .parse::<u64>()
            .map_err(|e| RasrError::decode(format!("location '{s}'"), e.to_string()))?;
        Ok(Self {
            path: PathBuf::from(path),
            offset,
        })
    }
}

/// 解決済みの1発話（バッファはバッチと共に破棄される）
#[derive(Debug)]
pub struct AcousticItem {
    /// マニフェスト内のインデックス
    pub index: usize,
    pub feats: FeatureMatrix,
    pub targets: Vec<u32>,
}

/// 解決済みの音響バッチ
#[derive(Debug, Default)]
pub struct AcousticBatch {
    pub items: Vec<AcousticItem>,
}

impl AcousticBatch {
    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

pub struct LazyFeatureStore<C: FeatureCodec = KaldiBinaryCodec> {
    table: HashMap<String, FeatureLocation>,
    handles: HashMap<PathBuf, BufReader<File>>,
    codec: C,
}

impl LazyFeatureStore<KaldiBinaryCodec> {
    /// scp ファイル（`<key> <path>:<offset>` / 行）から作る
    pub fn from_scp<P: AsRef<Path>>(path: P) -> RasrResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RasrError::unavailable(path, e))?;
        let mut table = HashMap::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (key, loc) = line.split_once(char::is_whitespace).ok_or_else(|| {
                RasrError::decode(format!("{}:{}", path.display(), i + 1), "expected '<key> <location>'")
            })?;
            table.insert(key.to_string(), loc.trim().parse()?);
        }
        log::info!("Feature table {}: {} entries", path.display(), table.len());
        Ok(Self::with_codec(table, KaldiBinaryCodec))
    }

    /// マニフェストの `feat` フィールドから作る（`feat` のない発話は登録しない）
    pub fn from_manifest(manifest: &Manifest) -> RasrResult<Self> {
        let mut table = HashMap::new();
        for utt in &manifest.utts {
            if let Some(loc) = utt.feat_location() {
                table.insert(utt.key.clone(), loc.parse()?);
            }
        }
        Ok(Self::with_codec(table, KaldiBinaryCodec))
    }
}

impl<C: FeatureCodec> LazyFeatureStore<C> {
    pub fn with_codec(table: HashMap<String, FeatureLocation>, codec: C) -> Self {
        Self {
            table,
            handles: HashMap::new(),
            codec,
        }
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.table.contains_key(key)
    }

    /// キャッシュ中のファイルハンドル数
    pub fn open_handles(&self) -> usize {
        self.handles.len()
    }

    /// 1発話分の特徴量を読み出す
    pub fn resolve(&mut self, key: &str) -> RasrResult<FeatureMatrix> {
        let loc = self
            .table
            .get(key)
            .ok_or_else(|| RasrError::NotFound(format!("features for {key}")))?;

        if !self.handles.contains_key(&loc.path) {
            let file = File::open(&loc.path).map_err(|e| RasrError::unavailable(&loc.path, e))?;
            self.handles.insert(loc.path.clone(), BufReader::new(file));
        }
        let Some(reader) = self.handles.get_mut(&loc.path) else {
            return Err(RasrError::NotFound(loc.path.display().to_string()));
        };

        reader.seek(SeekFrom::Start(loc.offset))?;
        self.codec.decode(reader).map_err(|e| match e {
            RasrError::Decode { reason, .. } => RasrError::decode(key, reason),
            other => other,
        })
    }

    /// バッチの全メンバを解決し、学習ターゲット（`tokenid`）と組にする
    pub fn resolve_batch(&mut self, manifest: &Manifest, batch: &Batch) -> RasrResult<AcousticBatch> {
        let mut items = Vec::with_capacity(batch.len());
        for &index in &batch.members {
            let utt = manifest
                .get(index)
                .ok_or_else(|| RasrError::NotFound(format!("utterance #{index}")))?;
            let feats = self.resolve(&utt.key)?;
            let targets = utt.token_ids()?;
            items.push(AcousticItem {
                index,
                feats,
                targets,
            });
        }
        Ok(AcousticBatch { items })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_location_parse() {
        let loc: FeatureLocation = "/data/raw_fbank.1.ark:1234".parse().unwrap();
        assert_eq!(loc.path, PathBuf::from("/data/raw_fbank.1.ark"));
        assert_eq!(loc.offset, 1234);

        let loc: FeatureLocation = "C:/feats.ark:9".parse().unwrap();
        assert_eq!(loc.path, PathBuf::from("C:/feats.ark"));

        assert!("feats.ark".parse::<FeatureLocation>().is_err());
        assert!("feats.ark:abc".parse::<FeatureLocation>().is_err());
    }

    #[test]
    fn test_unknown_key_is_not_found() {
        let mut store = LazyFeatureStore::with_codec(HashMap::new(), KaldiBinaryCodec);
        assert!(matches!(store.resolve("nope"), Err(RasrError::NotFound(_))));
        assert_eq!(store.open_handles(), 0);
    }
}
