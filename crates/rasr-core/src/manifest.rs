//! データセットマニフェスト（JSON）
//!
//! `{"utts": {<id>: {"ilen", "olen", ...}}, "aug": {...}}` 形式を読み込む。
//! `utts` のキー順はファイル上の順序のまま保持する（バッチ構築の同値タイブレークに使う）。

use std::fmt;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use serde::de::{self, Deserializer, MapAccess, Visitor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::augment::TokenDict;
use crate::batching::SequenceLengths;
use crate::error::{RasrError, RasrResult};
use crate::text_index::AugmentationIndexEntry;

/// 発話1件分のレコード
///
/// マニフェストが所有し、バッチからはインデックスで参照される。
#[derive(Clone, Debug, PartialEq)]
pub struct UtteranceRecord {
    pub key: String,
    /// 入力系列長（フレーム数）
    pub ilen: usize,
    /// 出力系列長（トークン数）
    pub olen: usize,
    /// `ilen`/`olen` 以外のフィールド（`feat`, `tokenid`, `idim` など）
    pub info: Map<String, Value>,
}

impl UtteranceRecord {
    /// `tokenid`（空白区切りのID列）を取り出す
    pub fn token_ids(&self) -> RasrResult<Vec<u32>> {
        let Some(raw) = self.info.get("tokenid") else {
            return Err(RasrError::NotFound(format!("tokenid for {}", self.key)));
        };
        let Some(raw) = raw.as_str() else {
            return Err(RasrError::decode(&self.key, "tokenid is not a string"));
        };
        raw.split_whitespace()
            .map(|t| {
                t.parse::<u32>()
                    .map_err(|e| RasrError::decode(&self.key, format!("tokenid '{t}': {e}")))
            })
            .collect()
    }

    /// `feat` フィールド（`<path>:<offset>`）
    pub fn feat_location(&self) -> Option<&str> {
        self.info.get("feat").and_then(Value::as_str)
    }

    fn dim(&self, name: &str) -> Option<usize> {
        match self.info.get(name)? {
            Value::Number(n) => n.as_u64().map(|v| v as usize),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }
}

impl SequenceLengths for UtteranceRecord {
    fn input_len(&self) -> usize {
        self.ilen
    }

    fn output_len(&self) -> usize {
        self.olen
    }
}

/// マニフェストの `aug` ブロック
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct AugmentManifest {
    /// source 側テキスト
    pub ifilename: PathBuf,
    /// target 側テキスト
    pub ofilename: PathBuf,
    #[serde(default)]
    pub idict: TokenDict,
    #[serde(default)]
    pub odict: TokenDict,
    #[serde(deserialize_with = "deserialize_sentences")]
    pub sentences: Vec<AugmentationIndexEntry>,
}

/// 読み込み済みマニフェスト
#[derive(Clone, Debug, Default)]
pub struct Manifest {
    pub utts: Vec<UtteranceRecord>,
    pub aug: Option<AugmentManifest>,
}

#[derive(Deserialize)]
struct RawManifest {
    utts: OrderedUtts,
    #[serde(default)]
    aug: Option<AugmentManifest>,
}

#[derive(Deserialize)]
struct RawUtt {
    #[serde(deserialize_with = "deserialize_len")]
    ilen: usize,
    #[serde(deserialize_with = "deserialize_len")]
    olen: usize,
    #[serde(flatten)]
    info: Map<String, Value>,
}

/// JSON オブジェクトの順序を保ったまま読む
struct OrderedUtts(Vec<UtteranceRecord>);

impl<'de> Deserialize<'de> for OrderedUtts {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct UttsVisitor;

        impl<'de> Visitor<'de> for UttsVisitor {
            type Value = OrderedUtts;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("an object keyed by utterance id")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<OrderedUtts, A::Error> {
                let mut utts = Vec::with_capacity(map.size_hint().unwrap_or(0));
                while let Some((key, raw)) = map.next_entry::<String, RawUtt>()? {
                    utts.push(UtteranceRecord {
                        key,
                        ilen: raw.ilen,
                        olen: raw.olen,
                        info: raw.info,
                    });
                }
                Ok(OrderedUtts(utts))
            }
        }

        deserializer.deserialize_map(UttsVisitor)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum LenRepr {
    Num(u64),
    Text(String),
}

// 旧形式のマニフェストは長さを文字列で持つことがある
fn deserialize_len<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    match LenRepr::deserialize(deserializer)? {
        LenRepr::Num(n) => Ok(n as usize),
        LenRepr::Text(s) => s
            .trim()
            .parse::<usize>()
            .map_err(|e| de::Error::custom(format!("invalid length '{s}': {e}"))),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SentencesRepr {
    List(Vec<AugmentationIndexEntry>),
    Map(Map<String, Value>),
}

#[derive(Deserialize)]
struct KeyedEntry {
    ilen: usize,
    olen: usize,
    ioffset: u64,
    ooffset: u64,
}

// 行番号をキーにしたオブジェクト形式も受け付ける
fn deserialize_sentences<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Vec<AugmentationIndexEntry>, D::Error> {
    match SentencesRepr::deserialize(deserializer)? {
        SentencesRepr::List(entries) => Ok(entries),
        SentencesRepr::Map(map) => {
            let mut entries = Vec::with_capacity(map.len());
            for (key, value) in map {
                let line = key
                    .parse::<u64>()
                    .map_err(|e| de::Error::custom(format!("invalid line key '{key}': {e}")))?;
                let e: KeyedEntry = serde_json::from_value(value).map_err(de::Error::custom)?;
                entries.push(AugmentationIndexEntry {
                    line,
                    ilen: e.ilen,
                    olen: e.olen,
                    ioffset: e.ioffset,
                    ooffset: e.ooffset,
                });
            }
            entries.sort_by_key(|e| e.line);
            Ok(entries)
        }
    }
}

impl Manifest {
    /// ファイルから読み込む。開けない場合は `ResourceUnavailable`
    pub fn load<P: AsRef<Path>>(path: P) -> RasrResult<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| RasrError::unavailable(path, e))?;
        let manifest = Self::from_reader(BufReader::new(file))?;
        log::info!("Loaded manifest {}: {} utterances", path.display(), manifest.len());
        Ok(manifest)
    }

    pub fn from_reader<R: Read>(reader: R) -> RasrResult<Self> {
        let raw: RawManifest = serde_json::from_reader(reader)?;
        Ok(Self {
            utts: raw.utts.0,
            aug: raw.aug,
        })
    }

    pub fn from_json_str(s: &str) -> RasrResult<Self> {
        Self::from_reader(s.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.utts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.utts.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&UtteranceRecord> {
        self.utts.get(index)
    }

    /// 先頭発話の `idim`/`odim`
    pub fn dims(&self) -> RasrResult<(usize, usize)> {
        let first = self
            .utts
            .first()
            .ok_or_else(|| RasrError::InvalidConfig("manifest has no utterances".into()))?;
        match (first.dim("idim"), first.dim("odim")) {
            (Some(idim), Some(odim)) => Ok((idim, odim)),
            _ => Err(RasrError::InvalidConfig(format!(
                "utterance {} lacks idim/odim",
                first.key
            ))),
        }
    }
}
