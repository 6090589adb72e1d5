//! 学習済みモデルによる認識
//!
//! マニフェストの各発話に `rec_tokenid` / `rec_token` / `rec_text` を付けて書き出す。
//! 特徴量の欠損などで失敗した発話は落とさず `rec_error` を付ける。

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use rand::SeedableRng;
use rand_xoshiro::Xoshiro256PlusPlus;
use serde_json::{Value, json};

use rasr_core::checkpoint::load_snapshot;
use rasr_core::feature_store::LazyFeatureStore;
use rasr_core::linear::{LinearBagDims, LinearBagModel};
use rasr_core::manifest::Manifest;
use rasr_core::model::{Recognizer, TrainableModel};
use rasr_core::model_config::ModelConfig;

use super::settings::TrainSettings;
use crate::common::io::{read_json, write_json_pretty};

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Decode utterances with a trained model")]
pub struct RecogArgs {
    /// 学習時に書き出した model.json
    #[arg(long)]
    pub model_conf: PathBuf,

    /// モデルのスナップショット（model.acc.best など）
    #[arg(long)]
    pub model: PathBuf,

    /// 認識対象のマニフェスト（`-` で標準入力、`.gz` 可）
    #[arg(long)]
    pub recog_json: PathBuf,

    /// 特徴量の scp（省略時はマニフェストの `feat`）
    #[arg(long)]
    pub recog_feat: Option<PathBuf>,

    /// 結果の出力先（`-` で標準出力、`.gz` 可）
    #[arg(long)]
    pub result_label: PathBuf,

    /// 1発話あたりの最大出力トークン数（0 = 制限なし）
    #[arg(long, default_value_t = 0)]
    pub maxlen: usize,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct RecogSummary {
    pub utterances: usize,
    pub failed: usize,
}

/// ID 列をトークン列に戻す
fn tokens_of(char_list: &[String], ids: &[u32]) -> Vec<String> {
    ids.iter()
        .map(|&id| char_list.get(id as usize).cloned().unwrap_or_else(|| id.to_string()))
        .collect()
}

fn text_of(tokens: &[String]) -> String {
    tokens.concat().replace("<space>", " ")
}

fn join_ids(ids: &[u32]) -> String {
    ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(" ")
}

pub fn run_recognition(args: &RecogArgs) -> Result<RecogSummary> {
    let conf = ModelConfig::load(&args.model_conf)?;
    let settings: TrainSettings = conf.train_settings()?;
    let dims = LinearBagDims {
        idim: conf.idim,
        hidden: settings.hidden_units,
        odim: conf.odim,
        vocab_in: conf.augment_idim.unwrap_or(0),
    };
    // 値はスナップショットで上書きされる
    let mut model = LinearBagModel::new(dims, &mut Xoshiro256PlusPlus::seed_from_u64(0))?;
    load_snapshot(&mut model, &args.model)
        .with_context(|| format!("failed to load model {}", args.model.display()))?;
    model.set_training(false);
    log::info!("Loaded model {} ({:?})", args.model.display(), dims);

    let mut raw: Value = read_json(&args.recog_json)?;
    let manifest = Manifest::from_json_str(&raw.to_string())
        .with_context(|| format!("invalid manifest {}", args.recog_json.display()))?;
    let mut store = match &args.recog_feat {
        Some(scp) => LazyFeatureStore::from_scp(scp)?,
        None => LazyFeatureStore::from_manifest(&manifest)?,
    };
    let maxlen = if args.maxlen == 0 { usize::MAX } else { args.maxlen };

    let Some(utts) = raw.get_mut("utts").and_then(Value::as_object_mut) else {
        anyhow::bail!("{} has no utts object", args.recog_json.display());
    };

    let mut summary = RecogSummary::default();
    for (i, rec) in manifest.utts.iter().enumerate() {
        log::info!("({}/{}) decoding {}", i + 1, manifest.len(), rec.key);
        summary.utterances += 1;
        let Some(entry) = utts.get_mut(&rec.key).and_then(Value::as_object_mut) else {
            continue;
        };

        let decoded = store.resolve(&rec.key).and_then(|feats| model.recognize(&feats, maxlen));
        match decoded {
            Ok(ids) => {
                let tokens = tokens_of(&conf.char_list, &ids);
                if let Ok(truth) = rec.token_ids() {
                    log::info!("groundtruth[{}]: {}", rec.key, text_of(&tokens_of(&conf.char_list, &truth)));
                }
                log::info!("prediction [{}]: {}", rec.key, text_of(&tokens));
                entry.insert("rec_tokenid".into(), json!(join_ids(&ids)));
                entry.insert("rec_token".into(), json!(tokens.join(" ")));
                entry.insert("rec_text".into(), json!(text_of(&tokens)));
            }
            Err(e) if e.is_recoverable() => {
                log::warn!("Failed to decode {}: {e}", rec.key);
                entry.insert("rec_error".into(), json!(e.to_string()));
                summary.failed += 1;
            }
            Err(e) => return Err(e).with_context(|| format!("decoding {}", rec.key)),
        }
    }

    write_json_pretty(&args.result_label, &raw)?;
    log::info!(
        "Wrote {} ({} utterances, {} failed)",
        args.result_label.display(),
        summary.utterances,
        summary.failed
    );
    Ok(summary)
}
