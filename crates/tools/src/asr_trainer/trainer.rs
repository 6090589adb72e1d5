//! 学習ループ
//!
//! マニフェスト・特徴量ストア・スケジューラ・モデルを組み立て、
//! エポック毎に検証とチェックポイント更新を行う。
//! Ctrl-C はステップの合間にだけ確認する（実行中のステップは中断しない）。

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_json::{Map, Value, json};

use rasr_core::augment::{AugmentationSource, TokenDict};
use rasr_core::checkpoint::{CheckpointTracker, save_snapshot};
use rasr_core::error::RasrResult;
use rasr_core::evaluation::ValidationSet;
use rasr_core::feature_store::LazyFeatureStore;
use rasr_core::guard::{GradientGuard, GuardedStep};
use rasr_core::linear::{LinearBagDims, LinearBagModel};
use rasr_core::manifest::Manifest;
use rasr_core::metrics::{IntervalReporter, MAIN_LOSS, MetricSummary};
use rasr_core::model::{BatchObservation, TrainableModel, TrainingExample};
use rasr_core::model_config::{MODEL_CONFIG_FILE, ModelConfig};
use rasr_core::optim::{Optimizer, OptimizerKind, build_optimizer};
use rasr_core::scheduler::{InterleavedScheduler, ScheduledStep, StepKind, record_step};

use super::logging::StructuredLogger;
use super::settings::{Criterion, TrainSettings};

pub const FINAL_MODEL_FILE: &str = "model.final";

pub fn epoch_snapshot_name(epoch: usize) -> String {
    format!("snapshot.ep.{epoch}")
}

/// 学習結果のまとめ
#[derive(Clone, Debug, Default)]
pub struct TrainSummary {
    /// 完了したエポック数
    pub epochs: usize,
    pub iterations: u64,
    /// 読み出し・計算に失敗して飛ばしたバッチ数
    pub failed_batches: u64,
    /// 勾配ノルムが非有限で更新を見送った回数
    pub skipped_updates: u64,
    pub regressions: usize,
    pub best: BTreeMap<String, f32>,
    pub final_eps: f32,
    pub interrupted: bool,
}

/// トレーナー
pub struct Trainer {
    settings: TrainSettings,
    interrupted: Arc<AtomicBool>,
    show_progress: bool,
}

impl Trainer {
    pub fn new(settings: TrainSettings) -> RasrResult<Self> {
        settings.validate()?;
        Ok(Self {
            settings,
            interrupted: Arc::new(AtomicBool::new(false)),
            show_progress: true,
        })
    }

    /// 中断フラグを取得
    pub fn interrupted(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.interrupted)
    }

    pub fn with_progress(mut self, show: bool) -> Self {
        self.show_progress = show;
        self
    }

    pub fn settings(&self) -> &TrainSettings {
        &self.settings
    }

    /// 学習を実行
    pub fn run(&self) -> Result<TrainSummary> {
        let s = &self.settings;
        fs::create_dir_all(&s.outdir)
            .with_context(|| format!("failed to create {}", s.outdir.display()))?;
        s.log_args();

        let structured = match &s.log_jsonl {
            Some(path) => Some(
                StructuredLogger::new(path)
                    .with_context(|| format!("failed to open {}", path.display()))?,
            ),
            None => None,
        };

        // データ
        let mut train_manifest = Manifest::load(&s.train_json)?;
        let valid_manifest = Manifest::load(&s.valid_json)?;
        if train_manifest.is_empty() {
            anyhow::bail!("training manifest {} has no utterances", s.train_json.display());
        }
        let (idim, odim) = train_manifest.dims()?;
        log::info!("#input dims: {idim}");
        log::info!("#output dims: {odim}");

        let aug_meta = train_manifest.aug.take();
        let train_store = open_store(s.train_feat.as_deref(), &train_manifest)?;
        let valid_store = open_store(s.valid_feat.as_deref(), &valid_manifest)?;

        let batch_cfg = s.batch_config();
        let mut scheduler = InterleavedScheduler::new(train_manifest, train_store, &batch_cfg, s.seed)?;
        let mut augment_idim = None;
        if let Some(meta) = aug_meta {
            let source = AugmentationSource::open(&meta)?;
            let vocab = source.idict().vocab_size();
            scheduler = scheduler.with_augmentation(source, meta.sentences, &batch_cfg, s.augment_ratio)?;
            augment_idim = scheduler.has_augmentation().then_some(vocab);
        }
        if scheduler.batches_per_epoch() == 0 {
            anyhow::bail!("no training batch fits maxlen-in {} / maxlen-out {}", s.maxlen_in, s.maxlen_out);
        }
        let mut validation = ValidationSet::new(valid_manifest, valid_store, &batch_cfg)?;

        let char_list = match &s.dict {
            Some(path) => build_char_list(&TokenDict::load(path)?, odim),
            None => Vec::new(),
        };

        ModelConfig::new(idim, odim, augment_idim, char_list, serde_json::to_value(s)?)
            .save(&s.outdir.join(MODEL_CONFIG_FILE))?;

        // モデル・オプティマイザ
        let mut rng = Xoshiro256PlusPlus::seed_from_u64(s.seed);
        let dims = LinearBagDims {
            idim,
            hidden: s.hidden_units,
            odim,
            vocab_in: augment_idim.unwrap_or(0),
        };
        let mut model = LinearBagModel::new(dims, &mut rng)?;
        let mut optimizer = build_optimizer(s.opt, s.eps)?;
        let mut guard = GradientGuard::new(s.grad_clip)?;
        log::info!(
            "Model: {} parameters, optimizer {}",
            model.params().iter().map(|p| p.len()).sum::<usize>(),
            s.opt
        );

        let mut tracker = CheckpointTracker::new(s.outdir.clone());
        for c in [Criterion::Loss, Criterion::Acc] {
            tracker.track(c.metric(), c.comparator());
        }
        if s.opt == OptimizerKind::Adadelta {
            tracker.watch_regression(s.criterion.metric(), s.eps_decay)?;
        }

        let mut reporter = IntervalReporter::new(s.report_interval);
        let mut summary = TrainSummary::default();
        let start = Instant::now();

        'epochs: for epoch in 1..=s.epochs {
            let progress = self.progress_bar(scheduler.batches_per_epoch() as u64)?;

            loop {
                if self.interrupted.load(Ordering::SeqCst) {
                    progress.abandon_with_message("interrupted");
                    log::warn!("Interrupted during epoch {epoch}");
                    summary.interrupted = true;
                    break 'epochs;
                }

                let due = scheduler.state().map_or(StepKind::Regular, |st| st.peek());
                let result = match scheduler.next_step() {
                    Ok(ScheduledStep::EndOfEpoch) => break,
                    Ok(ScheduledStep::Regular(batch)) => {
                        train_step(&mut model, optimizer.as_mut(), &mut guard, TrainingExample::Acoustic(&batch))
                    }
                    Ok(ScheduledStep::Augment(batch)) => {
                        train_step(&mut model, optimizer.as_mut(), &mut guard, TrainingExample::Text(&batch))
                    }
                    Err(e) => Err(e),
                };
                if due == StepKind::Regular {
                    progress.inc(1);
                }

                match result {
                    Ok((obs, guarded)) => {
                        record_step(&mut reporter, due, &obs, &guarded);
                    }
                    Err(e) if e.is_recoverable() => {
                        log::warn!("Skipping {due:?} batch in epoch {epoch}: {e}");
                        summary.failed_batches += 1;
                    }
                    Err(e) => return Err(e).context("training step failed"),
                }

                summary.iterations += 1;
                if let Some(means) = reporter.tick() {
                    if let Some(loss) = means.get(MAIN_LOSS) {
                        progress.set_message(format!("{loss:.6}"));
                    }
                    let fields = report_fields(epoch, summary.iterations, &means, optimizer.as_ref(), &start);
                    log_report("report", &fields);
                    if let Some(lg) = &structured {
                        lg.event("report", fields);
                    }
                }
            }
            progress.finish();

            // 検証とチェックポイント
            let mut epoch_metrics = MetricSummary::new();
            let train_means = reporter.flush();
            let valid = validation.evaluate(&mut model, &mut epoch_metrics)?;
            for (name, value) in valid.means() {
                let update = tracker.update(&name, value, &mut model, optimizer.as_mut())?;
                if update.regression {
                    summary.regressions += 1;
                }
            }
            save_snapshot(&model, &s.outdir.join(epoch_snapshot_name(epoch)))?;

            let mut means = train_means;
            means.extend(epoch_metrics.means());
            let fields = report_fields(epoch, summary.iterations, &means, optimizer.as_ref(), &start);
            log_report("epoch", &fields);
            if let Some(lg) = &structured {
                lg.event("epoch", fields);
            }
            summary.epochs = epoch;
        }

        save_snapshot(&model, &s.outdir.join(FINAL_MODEL_FILE))?;
        scheduler.close();

        summary.skipped_updates = guard.skipped();
        summary.final_eps = optimizer.eps();
        summary.best = tracker.records().map(|r| (r.metric.clone(), r.best)).collect();
        if let Some(lg) = &structured {
            let mut fields = Map::new();
            fields.insert("epochs".into(), json!(summary.epochs));
            fields.insert("iteration".into(), json!(summary.iterations));
            fields.insert("interrupted".into(), json!(summary.interrupted));
            lg.event("done", fields);
            lg.flush()?;
        }
        log::info!(
            "Training finished: {} epochs, {} iterations, {} failed batches, {} skipped updates",
            summary.epochs,
            summary.iterations,
            summary.failed_batches,
            summary.skipped_updates
        );
        Ok(summary)
    }

    fn progress_bar(&self, len: u64) -> Result<ProgressBar> {
        if !self.show_progress {
            return Ok(ProgressBar::hidden());
        }
        let progress = ProgressBar::new(len);
        progress.set_style(
            ProgressStyle::default_bar()
                .template("[{elapsed_precise}] {bar:40.cyan/blue} {pos}/{len} loss:{msg}")?,
        );
        Ok(progress)
    }
}

fn open_store(scp: Option<&Path>, manifest: &Manifest) -> RasrResult<LazyFeatureStore> {
    match scp {
        Some(path) => LazyFeatureStore::from_scp(path),
        None => LazyFeatureStore::from_manifest(manifest),
    }
}

fn train_step<M: TrainableModel + ?Sized>(
    model: &mut M,
    optimizer: &mut dyn Optimizer,
    guard: &mut GradientGuard,
    example: TrainingExample<'_>,
) -> RasrResult<(BatchObservation, GuardedStep)> {
    model.zero_grad();
    let obs = model.forward_backward(example)?;
    let guarded = guard.step(model.params_mut(), optimizer);
    Ok((obs, guarded))
}

fn report_fields(
    epoch: usize,
    iteration: u64,
    means: &BTreeMap<String, f32>,
    optimizer: &dyn Optimizer,
    start: &Instant,
) -> Map<String, Value> {
    let mut fields = Map::new();
    fields.insert("epoch".into(), json!(epoch));
    fields.insert("iteration".into(), json!(iteration));
    for (name, value) in means {
        fields.insert(name.clone(), json!(value));
    }
    if optimizer.kind() == OptimizerKind::Adadelta {
        fields.insert("eps".into(), json!(optimizer.eps()));
    }
    fields.insert("elapsed_time".into(), json!(start.elapsed().as_secs_f64()));
    fields
}

fn log_report(label: &str, fields: &Map<String, Value>) {
    let line = fields
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(" ");
    log::info!("[{label}] {line}");
}

/// `<token> <id>` 辞書から ID 順のトークン表を作る
///
/// 0 番は `<blank>`、末尾は `<eos>`。辞書にない ID は数字のまま。
pub fn build_char_list(dict: &TokenDict, odim: usize) -> Vec<String> {
    let mut list: Vec<String> = (0..odim).map(|i| i.to_string()).collect();
    if let Some(first) = list.first_mut() {
        *first = "<blank>".to_string();
    }
    if odim > 1 {
        list[odim - 1] = "<eos>".to_string();
    }
    let mut out_of_range = 0usize;
    for (token, id) in dict.iter() {
        match list.get_mut(id as usize) {
            Some(slot) => *slot = token.to_string(),
            None => out_of_range += 1,
        }
    }
    if out_of_range > 0 {
        log::warn!("{out_of_range} dictionary entries exceed odim {odim} and were ignored");
    }
    list
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_char_list_layout() {
        let dict = TokenDict::from_pairs([("a", 1), ("<space>", 2), ("zz", 9)]);
        let list = build_char_list(&dict, 5);
        assert_eq!(list, vec!["<blank>", "a", "<space>", "3", "<eos>"]);
    }
}
