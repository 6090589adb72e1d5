//! スケジューラ・評価・チェックポイントを組み合わせたテスト

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_json::{Map, json};
use tempfile::TempDir;

use rasr_core::augment::{AugmentationSource, TokenDict};
use rasr_core::batching::BatchConfig;
use rasr_core::checkpoint::{CheckpointTracker, Comparator};
use rasr_core::codec::{ArkWriter, FeatureMatrix};
use rasr_core::evaluation::ValidationSet;
use rasr_core::feature_store::LazyFeatureStore;
use rasr_core::linear::{LinearBagDims, LinearBagModel};
use rasr_core::manifest::{AugmentManifest, Manifest};
use rasr_core::metrics::{MetricSummary, NullSink};
use rasr_core::model::TrainableModel;
use rasr_core::optim::{Adadelta, Optimizer};
use rasr_core::scheduler::{InterleavedScheduler, ScheduledStep};
use rasr_core::text_index::{RaggedPolicy, index_parallel_text};

const IDIM: usize = 3;
const ODIM: usize = 6;

/// `n` 発話分の ark とマニフェストを作る
fn acoustic_fixture(dir: &Path, n: usize) -> Manifest {
    let ark_path = dir.join("feats.ark");
    let mut ark = ArkWriter::new(BufWriter::new(File::create(&ark_path).unwrap()));
    let mut utts = Map::new();
    for i in 0..n {
        let frames = 2 + i % 3;
        let m = FeatureMatrix::new(
            frames,
            IDIM,
            (0..frames * IDIM).map(|k| ((i * 7 + k) % 5) as f32 * 0.2 - 0.4).collect(),
        );
        let key = format!("utt{i:03}");
        let off = ark.write_entry(&key, &m).unwrap();
        utts.insert(
            key,
            json!({
                "ilen": frames,
                "olen": 2,
                "idim": IDIM,
                "odim": ODIM,
                "feat": format!("{}:{off}", ark_path.display()),
                "tokenid": format!("{} {}", 1 + i % (ODIM - 1), 1 + (i + 2) % (ODIM - 1)),
            }),
        );
    }
    ark.into_inner().flush().unwrap();
    Manifest::from_json_str(&json!({ "utts": utts }).to_string()).unwrap()
}

fn one_per_batch() -> BatchConfig {
    BatchConfig {
        batch_size: 1,
        maxlen_in: 100,
        maxlen_out: 100,
        max_batches: 0,
    }
}

fn model(seed: u64) -> LinearBagModel {
    let dims = LinearBagDims {
        idim: IDIM,
        hidden: 4,
        odim: ODIM,
        vocab_in: 4,
    };
    LinearBagModel::new(dims, &mut Xoshiro256PlusPlus::seed_from_u64(seed)).unwrap()
}

fn kind_char(step: &ScheduledStep) -> char {
    match step {
        ScheduledStep::Regular(_) => 'R',
        ScheduledStep::Augment(_) => 'A',
        ScheduledStep::EndOfEpoch => '|',
    }
}

#[test]
fn test_interleaving_across_epochs() {
    let dir = TempDir::new().unwrap();
    let manifest = acoustic_fixture(dir.path(), 6);
    let store = LazyFeatureStore::from_manifest(&manifest).unwrap();

    fs::write(dir.path().join("aug.src"), "a b\nb c\nc\n").unwrap();
    fs::write(dir.path().join("aug.tgt"), "1\n2 3\nq\n").unwrap();
    let src = dir.path().join("aug.src");
    let tgt = dir.path().join("aug.tgt");
    let entries = index_parallel_text(&src, &tgt, RaggedPolicy::Reject).unwrap();
    let meta = AugmentManifest {
        ifilename: src,
        ofilename: tgt,
        idict: TokenDict::from_pairs([("<unk>", 0), ("a", 1), ("b", 2), ("c", 3)]),
        odict: TokenDict::from_pairs([("<unk>", 0), ("1", 1), ("2", 2), ("3", 3)]),
        sentences: entries.clone(),
    };
    let source = AugmentationSource::open(&meta).unwrap();

    let mut sched = InterleavedScheduler::new(manifest, store, &one_per_batch(), 11)
        .unwrap()
        .with_augmentation(source, entries, &one_per_batch(), 2)
        .unwrap();

    let mut trace = String::new();
    let mut seen_regular = Vec::new();
    for _ in 0..14 {
        let step = sched.next_step().unwrap();
        trace.push(kind_char(&step));
        match step {
            ScheduledStep::Regular(b) => seen_regular.extend(b.items.iter().map(|it| it.index)),
            ScheduledStep::Augment(b) => {
                assert_eq!(b.pairs.len(), 1);
                // 未知語 "q" は <unk> に落ちる
                assert!(b.pairs[0].tgt.iter().all(|&t| t <= 3));
            }
            ScheduledStep::EndOfEpoch => {}
        }
    }
    // 6 バッチ / ratio 2: カウンタはエポックをまたいで持ち越される
    assert_eq!(trace, "RRARRARRA|RRAR");
    assert_eq!(sched.epoch(), 1);

    seen_regular.truncate(6);
    seen_regular.sort_unstable();
    assert_eq!(seen_regular, (0..6).collect::<Vec<_>>());
    sched.close();
}

#[test]
fn test_scheduler_without_augmentation_is_regular_only() {
    let dir = TempDir::new().unwrap();
    let manifest = acoustic_fixture(dir.path(), 3);
    let store = LazyFeatureStore::from_manifest(&manifest).unwrap();
    let mut sched = InterleavedScheduler::new(manifest, store, &one_per_batch(), 0).unwrap();
    let trace: String = (0..8).map(|_| kind_char(&sched.next_step().unwrap())).collect();
    assert_eq!(trace, "RRR|RRR|");
    assert!(sched.state().is_none());
}

#[test]
fn test_validation_skips_unresolvable_batch_and_restores_mode() {
    let dir = TempDir::new().unwrap();
    let mut manifest = acoustic_fixture(dir.path(), 4);
    manifest.utts[2].info.remove("feat");
    let store = LazyFeatureStore::from_manifest(&manifest).unwrap();
    let mut valid = ValidationSet::new(manifest, store, &one_per_batch()).unwrap();

    let mut m = model(5);
    let mut sink = MetricSummary::new();
    let summary = valid.evaluate(&mut m, &mut sink).unwrap();
    assert!(m.is_training());
    assert_eq!(summary.count("validation/main/loss"), 3);
    assert_eq!(sink.count("validation/main/loss"), 1);
    assert_eq!(sink.mean("validation/main/loss"), summary.mean("validation/main/loss"));
}

#[test]
fn test_validation_with_discarding_sink() {
    let dir = TempDir::new().unwrap();
    let manifest = acoustic_fixture(dir.path(), 3);
    let store = LazyFeatureStore::from_manifest(&manifest).unwrap();
    let mut valid = ValidationSet::new(manifest, store, &one_per_batch()).unwrap();

    let mut m = model(5);
    let summary = valid.evaluate(&mut m, &mut NullSink).unwrap();
    assert!(m.is_training());
    assert_eq!(summary.count("validation/main/loss"), 3);
    assert_eq!(summary.count("validation/main/acc"), 3);
}

#[test]
fn test_checkpoint_best_is_monotone_and_regression_restores() {
    let dir = TempDir::new().unwrap();
    let mut tracker = CheckpointTracker::new(dir.path());
    tracker
        .track("validation/main/loss", Comparator::LesserIsBetter)
        .track("validation/main/acc", Comparator::GreaterIsBetter);
    tracker.watch_regression("validation/main/loss", 0.01).unwrap();

    let mut m = model(1);
    let mut opt = Adadelta::new(1e-8);
    let losses = [3.0f32, 2.5, 2.7, 2.0, 2.2];
    let mut improved = Vec::new();
    let mut regressed = Vec::new();
    let mut at_best = Vec::new();
    let mut prev_best = f32::INFINITY;

    for (epoch, &loss) in losses.iter().enumerate() {
        // 学習でパラメータが動いた想定
        for p in m.params_mut() {
            p.value.iter_mut().for_each(|v| *v += 0.1 * (epoch as f32 + 1.0));
        }
        let before: Vec<Vec<f32>> = m.params().iter().map(|p| p.value.clone()).collect();
        let out = tracker.update("validation/main/loss", loss, &mut m, &mut opt).unwrap();
        if out.improved {
            at_best = before.clone();
        }
        if out.regression {
            let now: Vec<Vec<f32>> = m.params().iter().map(|p| p.value.clone()).collect();
            assert_eq!(now, at_best);
        }
        improved.push(out.improved);
        regressed.push(out.regression);

        let best = tracker.best("validation/main/loss").unwrap();
        assert!(best <= prev_best);
        prev_best = best;
    }

    assert_eq!(improved, [true, true, false, true, false]);
    assert_eq!(regressed, [false, false, true, false, true]);
    assert_eq!(tracker.best("validation/main/loss"), Some(2.0));
    assert!((opt.eps() - 1e-12).abs() < 1e-15);
    assert!(dir.path().join("model.loss.best").exists());
    assert!(!dir.path().join("model.acc.best").exists());
}
