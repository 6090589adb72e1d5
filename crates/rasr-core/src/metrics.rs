//! 指標の受け渡し
//!
//! 学習ループと評価ループは `MetricsSink` に `record(name, value)` するだけで、
//! 集計や出力先は呼び出し側が決める。

use std::collections::BTreeMap;

pub const MAIN_LOSS: &str = "main/loss";
pub const MAIN_ACC: &str = "main/acc";
pub const GRAD_NORM: &str = "grad_norm";
/// テキスト拡張ステップの損失
pub const AUG_LOSS: &str = "aug/loss";
/// 見送られた更新（0/1 の平均 = 見送り率）
pub const SKIPPED: &str = "skipped";
pub const VALIDATION_PREFIX: &str = "validation/";

pub trait MetricsSink {
    fn record(&mut self, name: &str, value: f32);
}

impl<S: MetricsSink + ?Sized> MetricsSink for &mut S {
    fn record(&mut self, name: &str, value: f32) {
        (**self).record(name, value);
    }
}

/// 何もしない sink
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSink;

impl MetricsSink for NullSink {
    fn record(&mut self, _name: &str, _value: f32) {}
}

/// 指標ごとの単純平均（観測1件を重み1とする）
#[derive(Clone, Debug, Default)]
pub struct MetricSummary {
    sums: BTreeMap<String, (f64, u64)>,
}

impl MetricSummary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, name: &str, value: f32) {
        let e = self.sums.entry(name.to_string()).or_insert((0.0, 0));
        e.0 += value as f64;
        e.1 += 1;
    }

    pub fn mean(&self, name: &str) -> Option<f32> {
        self.sums
            .get(name)
            .filter(|(_, n)| *n > 0)
            .map(|(s, n)| (*s / *n as f64) as f32)
    }

    pub fn count(&self, name: &str) -> u64 {
        self.sums.get(name).map_or(0, |(_, n)| *n)
    }

    pub fn means(&self) -> BTreeMap<String, f32> {
        self.sums
            .iter()
            .filter(|(_, (_, n))| *n > 0)
            .map(|(k, (s, n))| (k.clone(), (*s / *n as f64) as f32))
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.sums.is_empty()
    }

    pub fn clear(&mut self) {
        self.sums.clear();
    }
}

impl MetricsSink for MetricSummary {
    fn record(&mut self, name: &str, value: f32) {
        self.add(name, value);
    }
}

/// 一定イテレーション毎に平均を吐き出す集計器
#[derive(Clone, Debug)]
pub struct IntervalReporter {
    interval: u64,
    iteration: u64,
    window: MetricSummary,
}

impl IntervalReporter {
    /// `interval == 0` なら報告しない
    pub fn new(interval: u64) -> Self {
        Self {
            interval,
            iteration: 0,
            window: MetricSummary::new(),
        }
    }

    pub fn iteration(&self) -> u64 {
        self.iteration
    }

    /// 1イテレーションを締める。報告タイミングなら窓の平均を返してリセット
    pub fn tick(&mut self) -> Option<BTreeMap<String, f32>> {
        self.iteration += 1;
        if self.interval == 0 || self.iteration % self.interval != 0 {
            return None;
        }
        let means = self.window.means();
        self.window.clear();
        Some(means)
    }

    /// 報告前の残りを取り出す（エポック末など）
    pub fn flush(&mut self) -> BTreeMap<String, f32> {
        let means = self.window.means();
        self.window.clear();
        means
    }
}

impl MetricsSink for IntervalReporter {
    fn record(&mut self, name: &str, value: f32) {
        self.window.add(name, value);
    }
}
