//! 音響データとテキスト拡張データのインターリーブ
//!
//! 1回の呼び出しでどちらか一方のストリームだけを1バッチ進める。
//! エポックは音響（主）ストリームで定義し、拡張ストリームは独立に周回する。

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;

use crate::augment::{AugmentationSource, TextBatch};
use crate::batching::{Batch, BatchConfig, BatchLoader, build_batches};
use crate::codec::{FeatureCodec, KaldiBinaryCodec};
use crate::error::{RasrError, RasrResult};
use crate::feature_store::{AcousticBatch, LazyFeatureStore};
use crate::guard::GuardedStep;
use crate::manifest::Manifest;
use crate::metrics::{AUG_LOSS, GRAD_NORM, MAIN_ACC, MAIN_LOSS, MetricsSink, SKIPPED};
use crate::model::BatchObservation;
use crate::text_index::AugmentationIndexEntry;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StepKind {
    Regular,
    Augment,
}

/// 拡張ステップの挿入タイミングを決める状態機械
///
/// `done_augment` は直前の拡張ステップ以降に完了した通常ステップ数。
/// `ratio` 回の通常ステップの後に1回だけ拡張ステップを挟む。
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SchedulerState {
    done_augment: usize,
    ratio: usize,
}

impl SchedulerState {
    pub fn new(ratio: usize) -> RasrResult<Self> {
        if ratio == 0 {
            return Err(RasrError::InvalidConfig("augment ratio must be positive".into()));
        }
        Ok(Self {
            done_augment: 0,
            ratio,
        })
    }

    pub fn ratio(&self) -> usize {
        self.ratio
    }

    pub fn done_augment(&self) -> usize {
        self.done_augment
    }

    /// 次に実行すべきステップ（状態は変えない）
    pub fn peek(&self) -> StepKind {
        if self.done_augment >= self.ratio {
            StepKind::Augment
        } else {
            StepKind::Regular
        }
    }

    /// `kind` のステップが完了したことを記録する
    pub fn advance(&mut self, kind: StepKind) {
        match kind {
            StepKind::Augment => self.done_augment = 0,
            StepKind::Regular => self.done_augment = (self.done_augment + 1).min(self.ratio),
        }
    }

    pub fn next_kind(&mut self) -> StepKind {
        let kind = self.peek();
        self.advance(kind);
        kind
    }
}

/// スケジューラが返す1ステップ分の入力
#[derive(Debug)]
pub enum ScheduledStep {
    Regular(AcousticBatch),
    Augment(TextBatch),
    /// 主ストリームの1エポックが終わった。次の呼び出しから新しいエポック
    EndOfEpoch,
}

/// 完了したステップの観測値を種類別に `sink` へ記録する
///
/// 通常ステップは `main/loss` と `main/acc`、拡張ステップは `aug/loss`。
/// 非有限の勾配ノルムは記録せず、見送りとして `skipped` に数える。
pub fn record_step(sink: &mut dyn MetricsSink, kind: StepKind, obs: &BatchObservation, guarded: &GuardedStep) {
    match kind {
        StepKind::Regular => {
            sink.record(MAIN_LOSS, obs.loss);
            sink.record(MAIN_ACC, obs.acc);
        }
        StepKind::Augment => sink.record(AUG_LOSS, obs.loss),
    }
    if guarded.norm.is_finite() {
        sink.record(GRAD_NORM, guarded.norm);
    }
    sink.record(SKIPPED, if guarded.applied { 0.0 } else { 1.0 });
}

struct AugmentStream {
    source: AugmentationSource,
    entries: Vec<AugmentationIndexEntry>,
    batches: Vec<Batch>,
    loader: BatchLoader,
    state: SchedulerState,
}

pub struct InterleavedScheduler<C: FeatureCodec = KaldiBinaryCodec> {
    manifest: Manifest,
    store: LazyFeatureStore<C>,
    batches: Vec<Batch>,
    loader: BatchLoader,
    augment: Option<AugmentStream>,
    rng: Xoshiro256PlusPlus,
}

impl<C: FeatureCodec> InterleavedScheduler<C> {
    /// 音響ストリームのみのスケジューラ
    pub fn new(
        manifest: Manifest,
        store: LazyFeatureStore<C>,
        batch_cfg: &BatchConfig,
        seed: u64,
    ) -> RasrResult<Self> {
        let batches = build_batches(&manifest.utts, batch_cfg)?;
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(seed);
        let loader = BatchLoader::new(batches.len(), true, &mut rng);
        log::info!("Training batches: {} ({} utterances)", batches.len(), manifest.len());
        Ok(Self {
            manifest,
            store,
            batches,
            loader,
            augment: None,
            rng,
        })
    }

    /// テキスト拡張ストリームを追加する
    ///
    /// 索引が空の場合は警告して通常ステップのみで動く。
    pub fn with_augmentation(
        mut self,
        source: AugmentationSource,
        entries: Vec<AugmentationIndexEntry>,
        batch_cfg: &BatchConfig,
        ratio: usize,
    ) -> RasrResult<Self> {
        let state = SchedulerState::new(ratio)?;
        if entries.is_empty() {
            log::warn!("Augmentation index is empty; training on acoustic data only");
            source.close();
            return Ok(self);
        }
        let batches = build_batches(&entries, batch_cfg)?;
        let loader = BatchLoader::new(batches.len(), true, &mut self.rng);
        log::info!(
            "Augmentation batches: {} ({} sentences), ratio {}",
            batches.len(),
            entries.len(),
            ratio
        );
        self.augment = Some(AugmentStream {
            source,
            entries,
            batches,
            loader,
            state,
        });
        Ok(self)
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    /// 1エポックあたりの音響バッチ数
    pub fn batches_per_epoch(&self) -> usize {
        self.batches.len()
    }

    /// 完了した音響エポック数
    pub fn epoch(&self) -> usize {
        self.loader.epoch()
    }

    pub fn state(&self) -> Option<&SchedulerState> {
        self.augment.as_ref().map(|a| &a.state)
    }

    pub fn has_augmentation(&self) -> bool {
        self.augment.is_some()
    }

    /// 次のステップを1つ取り出す
    ///
    /// 読み出しに失敗した場合もバッチは消費済み（カウンタも進む）なので、
    /// 呼び出し側はエラーを記録してそのまま次へ進めばよい。
    pub fn next_step(&mut self) -> RasrResult<ScheduledStep> {
        let kind = self
            .augment
            .as_ref()
            .map_or(StepKind::Regular, |a| a.state.peek());

        match kind {
            StepKind::Regular => {
                let Some(b) = self.loader.next_batch() else {
                    self.loader.reset(&mut self.rng);
                    return Ok(ScheduledStep::EndOfEpoch);
                };
                if let Some(aug) = self.augment.as_mut() {
                    aug.state.advance(StepKind::Regular);
                }
                let batch = self.store.resolve_batch(&self.manifest, &self.batches[b])?;
                Ok(ScheduledStep::Regular(batch))
            }
            StepKind::Augment => {
                let Some(aug) = self.augment.as_mut() else {
                    return Err(RasrError::InvalidConfig("no augmentation source".into()));
                };
                aug.state.advance(StepKind::Augment);
                let Some(b) = aug.loader.next_cycling(&mut self.rng) else {
                    return Err(RasrError::NotFound("augmentation batch".into()));
                };
                let batch = aug.source.read_batch(&aug.entries, &aug.batches[b])?;
                Ok(ScheduledStep::Augment(batch))
            }
        }
    }

    /// 学習終了時に拡張ファイルを閉じる
    pub fn close(self) {
        if let Some(aug) = self.augment {
            aug.source.close();
        }
    }
}
