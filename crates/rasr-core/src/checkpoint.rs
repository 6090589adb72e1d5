//! 指標ごとのベストチェックポイント管理
//!
//! - 改善時: 指標名ごとのファイル（`model.loss.best` など）へスナップショットを書き出す
//! - 悪化時: 直前の値より悪化したらベストへ巻き戻し、オプティマイザの eps を減衰させる
//!
//! 書き出しは一時ファイル + rename で行い、途中で落ちても既存のベストを壊さない。

use std::fs::File;
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{RasrError, RasrResult};
use crate::model::TrainableModel;
use crate::optim::Optimizer;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Comparator {
    GreaterIsBetter,
    LesserIsBetter,
}

impl Comparator {
    /// まだ何も観測していないときのベスト値
    pub fn initial(self) -> f32 {
        match self {
            Self::GreaterIsBetter => f32::NEG_INFINITY,
            Self::LesserIsBetter => f32::INFINITY,
        }
    }

    pub fn is_better(self, candidate: f32, best: f32) -> bool {
        match self {
            Self::GreaterIsBetter => candidate > best,
            Self::LesserIsBetter => candidate < best,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct CheckpointRecord {
    pub metric: String,
    pub comparator: Comparator,
    pub best: f32,
    pub snapshot: PathBuf,
}

/// 悪化検出トリガ
///
/// 最初の観測では発火しない。発火しなかったときだけ基準値を現在値に更新する。
#[derive(Clone, Debug, Default)]
struct RegressionTrigger {
    last: Option<f32>,
    decay: f32,
}

impl RegressionTrigger {
    fn observe(&mut self, comparator: Comparator, value: f32) -> bool {
        match self.last {
            Some(last) if comparator.is_better(last, value) => true,
            _ => {
                self.last = Some(value);
                false
            }
        }
    }
}

struct Tracked {
    record: CheckpointRecord,
    trigger: Option<RegressionTrigger>,
}

/// `update` の結果
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct CheckpointUpdate {
    /// ベストを更新してスナップショットを書いた
    pub improved: bool,
    /// 悪化を検出し、ベストへ巻き戻した
    pub regression: bool,
}

pub struct CheckpointTracker {
    outdir: PathBuf,
    tracked: Vec<Tracked>,
}

impl CheckpointTracker {
    pub fn new<P: Into<PathBuf>>(outdir: P) -> Self {
        Self {
            outdir: outdir.into(),
            tracked: Vec::new(),
        }
    }

    /// 指標を登録する。スナップショット名は指標名の末尾要素から作る
    /// （`validation/main/loss` → `model.loss.best`）
    pub fn track(&mut self, metric: &str, comparator: Comparator) -> &mut Self {
        let short = metric.rsplit('/').next().unwrap_or(metric);
        let snapshot = self.outdir.join(format!("model.{short}.best"));
        self.tracked.push(Tracked {
            record: CheckpointRecord {
                metric: metric.to_string(),
                comparator,
                best: comparator.initial(),
                snapshot,
            },
            trigger: None,
        });
        self
    }

    /// 悪化時の巻き戻しと eps 減衰（`eps *= decay`）を有効にする
    pub fn watch_regression(&mut self, metric: &str, decay: f32) -> RasrResult<&mut Self> {
        if !decay.is_finite() || decay <= 0.0 {
            return Err(RasrError::InvalidConfig(format!("eps decay must be positive (got {decay})")));
        }
        let tracked = self
            .tracked
            .iter_mut()
            .find(|t| t.record.metric == metric)
            .ok_or_else(|| RasrError::InvalidConfig(format!("metric {metric} is not tracked")))?;
        tracked.trigger = Some(RegressionTrigger { last: None, decay });
        Ok(self)
    }

    pub fn record(&self, metric: &str) -> Option<&CheckpointRecord> {
        self.tracked.iter().find(|t| t.record.metric == metric).map(|t| &t.record)
    }

    pub fn records(&self) -> impl Iterator<Item = &CheckpointRecord> {
        self.tracked.iter().map(|t| &t.record)
    }

    pub fn best(&self, metric: &str) -> Option<f32> {
        self.record(metric).map(|r| r.best)
    }

    /// 評価後に1指標分の値を反映する
    ///
    /// 未登録の指標は無視する。非有限値は警告して無視する。
    pub fn update<M: TrainableModel + ?Sized>(
        &mut self,
        metric: &str,
        value: f32,
        model: &mut M,
        optimizer: &mut dyn Optimizer,
    ) -> RasrResult<CheckpointUpdate> {
        let mut outcome = CheckpointUpdate::default();
        let Some(tracked) = self.tracked.iter_mut().find(|t| t.record.metric == metric) else {
            return Ok(outcome);
        };
        if !value.is_finite() {
            log::warn!("Ignoring non-finite {metric} = {value}");
            return Ok(outcome);
        }

        let record = &mut tracked.record;
        if record.comparator.is_better(value, record.best) {
            save_snapshot(&*model, &record.snapshot)?;
            log::info!(
                "{metric} improved {} -> {value}, saved {}",
                record.best,
                record.snapshot.display()
            );
            record.best = value;
            outcome.improved = true;
        }

        let Some(trigger) = tracked.trigger.as_mut() else {
            return Ok(outcome);
        };
        if trigger.observe(record.comparator, value) {
            log::info!("{metric} regressed to {value}; restoring {}", record.snapshot.display());
            load_snapshot(model, &record.snapshot)?;
            optimizer.scale_eps(trigger.decay);
            log::info!("eps decayed to {:e}", optimizer.eps());
            outcome.regression = true;
        }

        Ok(outcome)
    }
}

/// モデル全体を `path` へ原子的に書き出す
pub fn save_snapshot<M: TrainableModel + ?Sized>(model: &M, path: &Path) -> RasrResult<()> {
    let dir = match path.parent() {
        Some(d) if !d.as_os_str().is_empty() => d,
        _ => Path::new("."),
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(|e| RasrError::unavailable(dir, e))?;
    {
        let mut w = BufWriter::new(&mut tmp);
        model.save(&mut w)?;
        w.flush()?;
    }
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| RasrError::unavailable(path, e.error))?;
    Ok(())
}

pub fn load_snapshot<M: TrainableModel + ?Sized>(model: &mut M, path: &Path) -> RasrResult<()> {
    let file = File::open(path).map_err(|e| RasrError::unavailable(path, e))?;
    model.load(&mut BufReader::new(file))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trigger_first_observation_never_fires() {
        let mut t = RegressionTrigger { last: None, decay: 0.01 };
        assert!(!t.observe(Comparator::LesserIsBetter, 100.0));
        assert!(!t.observe(Comparator::LesserIsBetter, 90.0));
        assert!(t.observe(Comparator::LesserIsBetter, 95.0));
        // 発火時は基準値を更新しない
        assert!(t.observe(Comparator::LesserIsBetter, 91.0));
        assert!(!t.observe(Comparator::LesserIsBetter, 90.0));
    }

    #[test]
    fn test_trigger_greater_is_better() {
        let mut t = RegressionTrigger { last: None, decay: 0.01 };
        assert!(!t.observe(Comparator::GreaterIsBetter, 0.5));
        assert!(t.observe(Comparator::GreaterIsBetter, 0.4));
        assert!(!t.observe(Comparator::GreaterIsBetter, 0.5));
    }

    #[test]
    fn test_snapshot_names() {
        let mut tracker = CheckpointTracker::new("/out");
        tracker
            .track("validation/main/loss", Comparator::LesserIsBetter)
            .track("validation/main/acc", Comparator::GreaterIsBetter);
        let names: Vec<_> = tracker.records().map(|r| r.snapshot.clone()).collect();
        assert_eq!(names, [PathBuf::from("/out/model.loss.best"), PathBuf::from("/out/model.acc.best")]);
        assert_eq!(tracker.best("validation/main/loss"), Some(f32::INFINITY));
        assert!(tracker.watch_regression("main/loss", 0.01).is_err());
        assert!(tracker.watch_regression("validation/main/loss", 0.0).is_err());
    }
}
