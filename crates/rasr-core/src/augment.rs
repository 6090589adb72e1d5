//! テキスト拡張データ（並列テキスト）ソース
//!
//! 索引のオフセットへシークして source/target を1行ずつ読み、
//! トークン辞書でID列に変換する。ファイルハンドルは学習中ずっと開いたまま共有する。

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::batching::Batch;
use crate::error::{RasrError, RasrResult};
use crate::manifest::AugmentManifest;
use crate::text_index::{AugmentationIndexEntry, read_line_at};

/// 未知語トークン
pub const UNK_TOKEN: &str = "<unk>";

/// トークン → ID の辞書
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TokenDict {
    map: BTreeMap<String, u32>,
}

impl TokenDict {
    pub fn from_pairs<I, S>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (S, u32)>,
        S: Into<String>,
    {
        Self {
            map: pairs.into_iter().map(|(t, id)| (t.into(), id)).collect(),
        }
    }

    /// `<token> <id>` 形式の辞書ファイルを読む（空行は無視）
    pub fn load<P: AsRef<Path>>(path: P) -> RasrResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RasrError::unavailable(path, e))?;
        let mut map = BTreeMap::new();
        for (i, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let mut cols = line.split_whitespace();
            let (Some(token), Some(id)) = (cols.next(), cols.next()) else {
                if line.trim().is_empty() {
                    continue;
                }
                return Err(RasrError::decode(
                    format!("{}:{}", path.display(), i + 1),
                    "expected '<token> <id>'",
                ));
            };
            let id = id.parse::<u32>().map_err(|e| {
                RasrError::decode(format!("{}:{}", path.display(), i + 1), e.to_string())
            })?;
            map.insert(token.to_string(), id);
        }
        Ok(Self { map })
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, token: &str) -> Option<u32> {
        self.map.get(token).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u32)> {
        self.map.iter().map(|(t, &id)| (t.as_str(), id))
    }

    /// 最大ID + 1（埋め込みテーブルの行数に使う）
    pub fn vocab_size(&self) -> usize {
        self.map.values().max().map_or(0, |&m| m as usize + 1)
    }

    /// 1行を空白で区切ってID列にする。未知語は `<unk>` があればそれに置き換える
    pub fn encode(&self, line: &str) -> RasrResult<Vec<u32>> {
        let unk = self.get(UNK_TOKEN);
        line.split_whitespace()
            .map(|tok| {
                self.get(tok)
                    .or(unk)
                    .ok_or_else(|| RasrError::decode(format!("token '{tok}'"), "not in dictionary"))
            })
            .collect()
    }
}

/// 拡張データの1文ペア（ID化済み）
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TextPair {
    pub line: u64,
    pub src: Vec<u32>,
    pub tgt: Vec<u32>,
}

/// 拡張データの1バッチ
#[derive(Clone, Debug, Default)]
pub struct TextBatch {
    pub pairs: Vec<TextPair>,
}

/// 学習中ずっと開いておく source/target ハンドルと辞書
pub struct AugmentationSource {
    src_path: PathBuf,
    tgt_path: PathBuf,
    src: BufReader<File>,
    tgt: BufReader<File>,
    idict: TokenDict,
    odict: TokenDict,
}

impl AugmentationSource {
    pub fn open(meta: &AugmentManifest) -> RasrResult<Self> {
        let src = File::open(&meta.ifilename).map_err(|e| RasrError::unavailable(&meta.ifilename, e))?;
        let tgt = File::open(&meta.ofilename).map_err(|e| RasrError::unavailable(&meta.ofilename, e))?;
        if meta.idict.is_empty() || meta.odict.is_empty() {
            return Err(RasrError::InvalidConfig(
                "augmentation block needs both idict and odict".into(),
            ));
        }
        Ok(Self {
            src_path: meta.ifilename.clone(),
            tgt_path: meta.ofilename.clone(),
            src: BufReader::new(src),
            tgt: BufReader::new(tgt),
            idict: meta.idict.clone(),
            odict: meta.odict.clone(),
        })
    }

    pub fn idict(&self) -> &TokenDict {
        &self.idict
    }

    pub fn odict(&self) -> &TokenDict {
        &self.odict
    }

    /// 索引エントリ1件を読み出してID化する
    pub fn read_pair(&mut self, entry: &AugmentationIndexEntry) -> RasrResult<TextPair> {
        let src_line = read_line_at(&mut self.src, entry.ioffset)?;
        let tgt_line = read_line_at(&mut self.tgt, entry.ooffset)?;
        let src = self.idict.encode(&src_line).map_err(|e| self.locate(e, entry, true))?;
        let tgt = self.odict.encode(&tgt_line).map_err(|e| self.locate(e, entry, false))?;
        Ok(TextPair {
            line: entry.line,
            src,
            tgt,
        })
    }

    /// バッチのメンバ（索引へのインデックス）をまとめて読む
    pub fn read_batch(
        &mut self,
        entries: &[AugmentationIndexEntry],
        batch: &Batch,
    ) -> RasrResult<TextBatch> {
        let mut pairs = Vec::with_capacity(batch.len());
        for &i in &batch.members {
            let entry = entries
                .get(i)
                .ok_or_else(|| RasrError::NotFound(format!("augmentation entry #{i}")))?;
            pairs.push(self.read_pair(entry)?);
        }
        Ok(TextBatch { pairs })
    }

    /// 学習終了時に明示的に閉じる
    pub fn close(self) {
        log::debug!(
            "Closing augmentation files {} / {}",
            self.src_path.display(),
            self.tgt_path.display()
        );
    }

    fn locate(&self, err: RasrError, entry: &AugmentationIndexEntry, source_side: bool) -> RasrError {
        match err {
            RasrError::Decode { what, reason } => {
                let path = if source_side { &self.src_path } else { &self.tgt_path };
                RasrError::decode(format!("{}:{} {what}", path.display(), entry.line + 1), reason)
            }
            other => other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_with_unk_fallback() {
        let dict = TokenDict::from_pairs([("<unk>", 1), ("a", 2), ("b", 3)]);
        assert_eq!(dict.encode("a c b").unwrap(), vec![2, 1, 3]);
        assert_eq!(dict.vocab_size(), 4);
    }

    #[test]
    fn test_encode_without_unk_fails() {
        let dict = TokenDict::from_pairs([("a", 0)]);
        assert!(matches!(dict.encode("a z"), Err(RasrError::Decode { .. })));
        assert_eq!(dict.encode("").unwrap(), Vec::<u32>::new());
    }
}
