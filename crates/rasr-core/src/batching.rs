//! 系列長でバケット化した可変長ミニバッチ
//!
//! 長い発話ほどバッチに入る件数を減らしてメモリ使用量を抑える。
//! 学習時はバッチの「順序」だけをエポック毎にシャッフルし、バッチの中身は固定する。

use rand::Rng;
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};

use crate::error::{RasrError, RasrResult};

/// 入出力系列長を持つレコード
pub trait SequenceLengths {
    fn input_len(&self) -> usize;
    fn output_len(&self) -> usize;
}

/// ミニバッチ（元配列へのインデックス列）
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Batch {
    pub members: Vec<usize>,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }
}

/// バッチ構築パラメータ
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchConfig {
    /// 1バッチの最大件数（短い系列のとき）
    pub batch_size: usize,
    /// これを超える入力長で件数を縮小する
    pub maxlen_in: usize,
    /// これを超える出力長で件数を縮小する
    pub maxlen_out: usize,
    /// バッチ数の上限（0 = 無制限）
    pub max_batches: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            maxlen_in: 800,
            maxlen_out: 150,
            max_batches: 0,
        }
    }
}

impl BatchConfig {
    pub fn validate(&self) -> RasrResult<()> {
        if self.batch_size == 0 {
            return Err(RasrError::InvalidConfig("batch_size must be positive".into()));
        }
        if self.maxlen_in == 0 || self.maxlen_out == 0 {
            return Err(RasrError::InvalidConfig(format!(
                "maxlen_in/maxlen_out must be positive (got {}/{})",
                self.maxlen_in, self.maxlen_out
            )));
        }
        Ok(())
    }

    /// 先頭（最長）レコードから決まるバッチ容量
    fn capacity_for<T: SequenceLengths>(&self, head: &T) -> usize {
        let factor = (head.input_len() / self.maxlen_in).max(head.output_len() / self.maxlen_out);
        (self.batch_size / (1 + factor)).max(1)
    }
}

/// レコード列をバッチに分割する
///
/// 1. 入出力長の和の降順で安定ソート（同値は元の順序）
/// 2. 先頭から貪欲に詰め、容量を超える時点で次のバッチを開始
/// 3. `max_batches` を超える分は末尾から、最も大きいバッチ（同数なら先頭側）へ併合
///
/// 全レコードがちょうど1回ずつどれかのバッチに入る。
pub fn build_batches<T: SequenceLengths>(items: &[T], cfg: &BatchConfig) -> RasrResult<Vec<Batch>> {
    cfg.validate()?;

    let mut order: Vec<usize> = (0..items.len()).collect();
    order.sort_by_key(|&i| std::cmp::Reverse(items[i].input_len() + items[i].output_len()));

    let mut batches: Vec<Batch> = Vec::new();
    let mut capacity = 0;
    for idx in order {
        match batches.last_mut() {
            Some(b) if b.len() < capacity => b.members.push(idx),
            _ => {
                capacity = cfg.capacity_for(&items[idx]);
                batches.push(Batch { members: vec![idx] });
            }
        }
    }

    if cfg.max_batches > 0 && batches.len() > cfg.max_batches {
        let excess = batches.len() - cfg.max_batches;
        log::debug!("merging {excess} excess batches (limit {})", cfg.max_batches);
        while batches.len() > cfg.max_batches {
            let Some(tail) = batches.pop() else { break };
            let target = largest_batch(&batches);
            batches[target].members.extend(tail.members);
        }
    }

    Ok(batches)
}

// 件数最大のバッチ。同数なら先頭側
fn largest_batch(batches: &[Batch]) -> usize {
    let mut best = 0;
    for (i, b) in batches.iter().enumerate() {
        if b.len() > batches[best].len() {
            best = i;
        }
    }
    best
}

/// バッチ列の走査順を管理するローダ
///
/// - 学習: エポック毎に順序をシャッフル（`reset`）
/// - 評価: シャッフルなし・1周のみ
/// - 拡張データ: 周回毎にシャッフルしつつ無限に繰り返す（`next_cycling`）
pub struct BatchLoader {
    order: Vec<usize>,
    position: usize,
    epoch: usize,
    shuffle: bool,
}

impl BatchLoader {
    pub fn new<R: Rng>(num_batches: usize, shuffle: bool, rng: &mut R) -> Self {
        let mut order: Vec<usize> = (0..num_batches).collect();
        if shuffle {
            order.shuffle(rng);
        }
        Self {
            order,
            position: 0,
            epoch: 0,
            shuffle,
        }
    }

    /// 決定的な順序（評価・認識用）
    pub fn sequential(num_batches: usize) -> Self {
        Self {
            order: (0..num_batches).collect(),
            position: 0,
            epoch: 0,
            shuffle: false,
        }
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// 完了した周回数
    pub fn epoch(&self) -> usize {
        self.epoch
    }

    /// 現在の周回で次に返すバッチ番号。周回の終端なら `None`
    pub fn next_batch(&mut self) -> Option<usize> {
        let idx = *self.order.get(self.position)?;
        self.position += 1;
        Some(idx)
    }

    /// 周回の終端で自動的に `reset` して次のバッチ番号を返す。空なら `None`
    pub fn next_cycling<R: Rng>(&mut self, rng: &mut R) -> Option<usize> {
        if self.order.is_empty() {
            return None;
        }
        if self.position >= self.order.len() {
            self.reset(rng);
        }
        self.next_batch()
    }

    /// 次の周回の準備（シャッフル有効なら順序を引き直す）
    pub fn reset<R: Rng>(&mut self, rng: &mut R) {
        self.position = 0;
        self.epoch += 1;
        if self.shuffle {
            self.order.shuffle(rng);
        }
    }
}
