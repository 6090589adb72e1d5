//! 学習対象モデルのインターフェース
//!
//! 順伝播・逆伝播と損失の定義はモデル側の責務。
//! 学習ループはここで定義するトレイト経由でのみモデルに触れる。

use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::augment::TextBatch;
use crate::codec::FeatureMatrix;
use crate::error::RasrResult;
use crate::feature_store::AcousticBatch;

/// 学習可能パラメータ1つ分（値と勾配）
#[derive(Clone, Debug, PartialEq)]
pub struct Param {
    pub name: String,
    pub value: Vec<f32>,
    pub grad: Vec<f32>,
}

impl Param {
    pub fn new(name: impl Into<String>, value: Vec<f32>) -> Self {
        let grad = vec![0.0; value.len()];
        Self {
            name: name.into(),
            value,
            grad,
        }
    }

    pub fn len(&self) -> usize {
        self.value.len()
    }

    pub fn is_empty(&self) -> bool {
        self.value.is_empty()
    }
}

/// 1ステップ分の入力
#[derive(Clone, Copy, Debug)]
pub enum TrainingExample<'a> {
    Acoustic(&'a AcousticBatch),
    Text(&'a TextBatch),
}

impl TrainingExample<'_> {
    pub fn len(&self) -> usize {
        match self {
            Self::Acoustic(b) => b.len(),
            Self::Text(b) => b.pairs.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// バッチ1つ分の観測値（`main/loss`, `main/acc`）
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct BatchObservation {
    pub loss: f32,
    pub acc: f32,
}

pub trait TrainableModel {
    /// 損失を計算し、勾配を `Param::grad` に書き込む
    fn forward_backward(&mut self, example: TrainingExample<'_>) -> RasrResult<BatchObservation>;

    /// 勾配を計算せずに損失と精度だけを求める
    fn evaluate(&self, batch: &AcousticBatch) -> RasrResult<BatchObservation>;

    fn zero_grad(&mut self) {
        for p in self.params_mut() {
            p.grad.iter_mut().for_each(|g| *g = 0.0);
        }
    }

    fn params(&self) -> &[Param];
    fn params_mut(&mut self) -> &mut [Param];

    fn set_training(&mut self, training: bool);
    fn is_training(&self) -> bool;

    /// パラメータ全体のスナップショット
    fn save(&self, writer: &mut dyn Write) -> RasrResult<()>;
    fn load(&mut self, reader: &mut dyn Read) -> RasrResult<()>;
}

/// 推論時の探索（出力トークンID列を返す）
pub trait Recognizer {
    fn recognize(&self, feats: &FeatureMatrix, maxlen: usize) -> RasrResult<Vec<u32>>;
}
