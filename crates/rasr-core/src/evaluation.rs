//! 検証データでの評価ループ
//!
//! 検証バッチを決定的な順序で1周し、バッチ毎の指標を単純平均する。
//! 評価中はモデルを推論モードにし、抜けるときは結果にかかわらず元のモードへ戻す。

use std::ops::{Deref, DerefMut};

use crate::batching::{Batch, BatchConfig, BatchLoader, build_batches};
use crate::codec::{FeatureCodec, KaldiBinaryCodec};
use crate::error::RasrResult;
use crate::feature_store::LazyFeatureStore;
use crate::manifest::Manifest;
use crate::metrics::{MAIN_ACC, MAIN_LOSS, MetricSummary, MetricsSink, VALIDATION_PREFIX};
use crate::model::TrainableModel;

/// スコープ中だけモデルを推論モードにするガード
pub struct EvalMode<'a, M: TrainableModel + ?Sized> {
    model: &'a mut M,
    was_training: bool,
}

impl<'a, M: TrainableModel + ?Sized> EvalMode<'a, M> {
    pub fn enter(model: &'a mut M) -> Self {
        let was_training = model.is_training();
        model.set_training(false);
        Self { model, was_training }
    }
}

impl<M: TrainableModel + ?Sized> Drop for EvalMode<'_, M> {
    fn drop(&mut self) {
        self.model.set_training(self.was_training);
    }
}

impl<M: TrainableModel + ?Sized> Deref for EvalMode<'_, M> {
    type Target = M;

    fn deref(&self) -> &M {
        self.model
    }
}

impl<M: TrainableModel + ?Sized> DerefMut for EvalMode<'_, M> {
    fn deref_mut(&mut self) -> &mut M {
        self.model
    }
}

/// 検証セット（マニフェスト + 特徴量ストア + 固定バッチ）
pub struct ValidationSet<C: FeatureCodec = KaldiBinaryCodec> {
    manifest: Manifest,
    store: LazyFeatureStore<C>,
    batches: Vec<Batch>,
}

impl<C: FeatureCodec> ValidationSet<C> {
    pub fn new(manifest: Manifest, store: LazyFeatureStore<C>, batch_cfg: &BatchConfig) -> RasrResult<Self> {
        let batches = build_batches(&manifest.utts, batch_cfg)?;
        log::info!("Validation batches: {} ({} utterances)", batches.len(), manifest.len());
        Ok(Self {
            manifest,
            store,
            batches,
        })
    }

    pub fn num_batches(&self) -> usize {
        self.batches.len()
    }

    /// 全検証バッチを1周評価し、`validation/main/*` の平均を `sink` に記録する
    ///
    /// 特徴量の欠損・破損などレコード単位のエラーはそのバッチだけ飛ばす。
    pub fn evaluate<M: TrainableModel + ?Sized>(
        &mut self,
        model: &mut M,
        sink: &mut dyn MetricsSink,
    ) -> RasrResult<MetricSummary> {
        let model = EvalMode::enter(model);
        let loss_key = format!("{VALIDATION_PREFIX}{MAIN_LOSS}");
        let acc_key = format!("{VALIDATION_PREFIX}{MAIN_ACC}");
        let mut summary = MetricSummary::new();
        let mut skipped = 0usize;

        let mut loader = BatchLoader::sequential(self.batches.len());
        while let Some(b) = loader.next_batch() {
            let result = self
                .store
                .resolve_batch(&self.manifest, &self.batches[b])
                .and_then(|batch| model.evaluate(&batch));
            match result {
                Ok(obs) => {
                    summary.add(&loss_key, obs.loss);
                    summary.add(&acc_key, obs.acc);
                }
                Err(e) if e.is_recoverable() => {
                    skipped += 1;
                    log::warn!("Skipping validation batch {b}: {e}");
                }
                Err(e) => return Err(e),
            }
        }

        if skipped > 0 {
            log::warn!("{skipped} validation batches skipped");
        }
        for (name, mean) in summary.means() {
            sink.record(&name, mean);
        }
        Ok(summary)
    }
}
