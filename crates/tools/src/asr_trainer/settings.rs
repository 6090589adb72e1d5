//! 学習設定（CLI + 設定ファイル）
//!
//! CLI で明示指定された値 > 設定ファイルの値 > CLI のデフォルト値 の順で採用する。
//! 明示指定かどうかは `clap::parser::ValueSource` で判定する。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use clap::ArgMatches;
use clap::parser::ValueSource;
use clap::Parser;
use serde::{Deserialize, Serialize};

use rasr_core::batching::BatchConfig;
use rasr_core::checkpoint::Comparator;
use rasr_core::error::{RasrError, RasrResult};
use rasr_core::optim::OptimizerKind;

/// 巻き戻し判定に使う検証指標
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Criterion {
    Loss,
    Acc,
}

impl Criterion {
    pub fn metric(self) -> &'static str {
        match self {
            Self::Loss => "validation/main/loss",
            Self::Acc => "validation/main/acc",
        }
    }

    pub fn comparator(self) -> Comparator {
        match self {
            Self::Loss => Comparator::LesserIsBetter,
            Self::Acc => Comparator::GreaterIsBetter,
        }
    }
}

impl FromStr for Criterion {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "loss" => Ok(Self::Loss),
            "acc" => Ok(Self::Acc),
            other => Err(format!("unknown criterion '{other}' (expected loss|acc)")),
        }
    }
}

impl fmt::Display for Criterion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Loss => "loss",
            Self::Acc => "acc",
        })
    }
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Train a speech recognizer with interleaved text augmentation")]
pub struct TrainArgs {
    /// 学習マニフェスト（`aug` ブロックがあればテキスト拡張を使う）
    #[arg(long)]
    pub train_json: Option<PathBuf>,

    /// 検証マニフェスト
    #[arg(long)]
    pub valid_json: Option<PathBuf>,

    /// 学習用特徴量の scp（省略時はマニフェストの `feat`）
    #[arg(long)]
    pub train_feat: Option<PathBuf>,

    /// 検証用特徴量の scp（省略時はマニフェストの `feat`）
    #[arg(long)]
    pub valid_feat: Option<PathBuf>,

    /// 出力ディレクトリ
    #[arg(long)]
    pub outdir: Option<PathBuf>,

    /// 出力トークン辞書（`<token> <id>`）
    #[arg(long)]
    pub dict: Option<PathBuf>,

    #[arg(long, default_value_t = 32)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 800)]
    pub maxlen_in: usize,

    #[arg(long, default_value_t = 150)]
    pub maxlen_out: usize,

    /// バッチ数の上限（0 = 無制限）
    #[arg(long, default_value_t = 0)]
    pub minibatches: usize,

    /// adadelta | adam
    #[arg(long, default_value_t = OptimizerKind::Adadelta)]
    pub opt: OptimizerKind,

    #[arg(long, default_value_t = 1e-8)]
    pub eps: f32,

    /// 悪化時に eps に掛ける係数（adadelta のみ）
    #[arg(long, default_value_t = 0.01)]
    pub eps_decay: f32,

    /// 巻き戻し判定の指標 loss | acc
    #[arg(long, default_value_t = Criterion::Acc)]
    pub criterion: Criterion,

    /// 勾配ノルムの上限
    #[arg(long, default_value_t = 5.0)]
    pub grad_clip: f32,

    /// 拡張ステップ1回あたりの通常ステップ数
    #[arg(long, default_value_t = 1)]
    pub augment_ratio: usize,

    #[arg(long, default_value_t = 20)]
    pub epochs: usize,

    #[arg(long, default_value_t = 1)]
    pub seed: u64,

    /// 学習指標を報告するイテレーション間隔（0 = 報告しない）
    #[arg(long, default_value_t = 100)]
    pub report_interval: u64,

    /// 参照モデルの隠れ層ユニット数
    #[arg(long, default_value_t = 64)]
    pub hidden_units: usize,

    /// 構造化ログ（JSONL）の出力先。`-` で標準出力
    #[arg(long)]
    pub log_jsonl: Option<PathBuf>,

    /// 設定ファイル（.toml / .yaml / .json）
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// スナップショットからの再開（未対応）
    #[arg(long)]
    pub resume: Option<PathBuf>,
}

/// 設定ファイルの内容（全項目省略可）
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TrainConfigFile {
    #[serde(default)]
    pub train_json: Option<PathBuf>,
    #[serde(default)]
    pub valid_json: Option<PathBuf>,
    #[serde(default)]
    pub train_feat: Option<PathBuf>,
    #[serde(default)]
    pub valid_feat: Option<PathBuf>,
    #[serde(default)]
    pub outdir: Option<PathBuf>,
    #[serde(default)]
    pub dict: Option<PathBuf>,
    #[serde(default)]
    pub batch_size: Option<usize>,
    #[serde(default)]
    pub maxlen_in: Option<usize>,
    #[serde(default)]
    pub maxlen_out: Option<usize>,
    #[serde(default)]
    pub minibatches: Option<usize>,
    #[serde(default)]
    pub opt: Option<OptimizerKind>,
    #[serde(default)]
    pub eps: Option<f32>,
    #[serde(default)]
    pub eps_decay: Option<f32>,
    #[serde(default)]
    pub criterion: Option<Criterion>,
    #[serde(default)]
    pub grad_clip: Option<f32>,
    #[serde(default)]
    pub augment_ratio: Option<usize>,
    #[serde(default)]
    pub epochs: Option<usize>,
    #[serde(default)]
    pub seed: Option<u64>,
    #[serde(default)]
    pub report_interval: Option<u64>,
    #[serde(default)]
    pub hidden_units: Option<usize>,
    #[serde(default)]
    pub log_jsonl: Option<PathBuf>,
}

pub fn load_config_file<P: AsRef<Path>>(path: P) -> anyhow::Result<TrainConfigFile> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)?;
    let ext = path.extension().and_then(|s| s.to_str()).map(|s| s.to_ascii_lowercase());
    match ext.as_deref() {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(&data)?),
        Some("json") => Ok(serde_json::from_str(&data)?),
        Some("toml") => Ok(toml::from_str(&data)?),
        _ => serde_json::from_str(&data)
            .or_else(|_| serde_yaml::from_str(&data))
            .map_err(|e| e.into()),
    }
}

/// 確定した学習設定（`model.json` の `train` に保存される）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrainSettings {
    pub train_json: PathBuf,
    pub valid_json: PathBuf,
    pub train_feat: Option<PathBuf>,
    pub valid_feat: Option<PathBuf>,
    pub outdir: PathBuf,
    pub dict: Option<PathBuf>,
    pub batch_size: usize,
    pub maxlen_in: usize,
    pub maxlen_out: usize,
    pub minibatches: usize,
    pub opt: OptimizerKind,
    pub eps: f32,
    pub eps_decay: f32,
    pub criterion: Criterion,
    pub grad_clip: f32,
    pub augment_ratio: usize,
    pub epochs: usize,
    pub seed: u64,
    pub report_interval: u64,
    pub hidden_units: usize,
    pub log_jsonl: Option<PathBuf>,
}

fn required(value: Option<PathBuf>, flag: &str) -> RasrResult<PathBuf> {
    value.ok_or_else(|| RasrError::InvalidConfig(format!("--{flag} is required (CLI or config file)")))
}

impl TrainArgs {
    /// 設定ファイルとマージして確定させる
    pub fn into_settings(self, matches: &ArgMatches, file: Option<TrainConfigFile>) -> RasrResult<TrainSettings> {
        if let Some(path) = &self.resume {
            return Err(RasrError::InvalidConfig(format!(
                "resuming from a snapshot is not supported ({})",
                path.display()
            )));
        }
        let file = file.unwrap_or_default();

        // CLI 明示指定でなければファイルの値を優先
        macro_rules! pick {
            ($name:ident) => {
                match (matches.value_source(stringify!($name)), file.$name) {
                    (Some(ValueSource::CommandLine), _) | (_, None) => self.$name,
                    (_, Some(v)) => v,
                }
            };
        }

        Ok(TrainSettings {
            train_json: required(self.train_json.clone().or(file.train_json.clone()), "train-json")?,
            valid_json: required(self.valid_json.clone().or(file.valid_json.clone()), "valid-json")?,
            outdir: required(self.outdir.clone().or(file.outdir.clone()), "outdir")?,
            train_feat: self.train_feat.clone().or(file.train_feat.clone()),
            valid_feat: self.valid_feat.clone().or(file.valid_feat.clone()),
            dict: self.dict.clone().or(file.dict.clone()),
            log_jsonl: self.log_jsonl.clone().or(file.log_jsonl.clone()),
            batch_size: pick!(batch_size),
            maxlen_in: pick!(maxlen_in),
            maxlen_out: pick!(maxlen_out),
            minibatches: pick!(minibatches),
            opt: pick!(opt),
            eps: pick!(eps),
            eps_decay: pick!(eps_decay),
            criterion: pick!(criterion),
            grad_clip: pick!(grad_clip),
            augment_ratio: pick!(augment_ratio),
            epochs: pick!(epochs),
            seed: pick!(seed),
            report_interval: pick!(report_interval),
            hidden_units: pick!(hidden_units),
        })
    }
}

impl TrainSettings {
    pub fn batch_config(&self) -> BatchConfig {
        BatchConfig {
            batch_size: self.batch_size,
            maxlen_in: self.maxlen_in,
            maxlen_out: self.maxlen_out,
            max_batches: self.minibatches,
        }
    }

    /// 学習開始前の検証（ステップを1つも実行しないうちに失敗させる）
    pub fn validate(&self) -> RasrResult<()> {
        self.batch_config().validate()?;
        if self.augment_ratio == 0 {
            return Err(RasrError::InvalidConfig("--augment-ratio must be positive".into()));
        }
        if self.epochs == 0 {
            return Err(RasrError::InvalidConfig("--epochs must be >= 1".into()));
        }
        if self.hidden_units == 0 {
            return Err(RasrError::InvalidConfig("--hidden-units must be >= 1".into()));
        }
        if !self.grad_clip.is_finite() || self.grad_clip <= 0.0 {
            return Err(RasrError::InvalidConfig(format!(
                "--grad-clip must be positive (got {})",
                self.grad_clip
            )));
        }
        if !self.eps.is_finite() || self.eps <= 0.0 {
            return Err(RasrError::InvalidConfig(format!("--eps must be positive (got {})", self.eps)));
        }
        if !self.eps_decay.is_finite() || self.eps_decay <= 0.0 || self.eps_decay > 1.0 {
            return Err(RasrError::InvalidConfig(format!(
                "--eps-decay must be in (0, 1] (got {})",
                self.eps_decay
            )));
        }
        Ok(())
    }

    /// `ARGS: key: value` 形式でキー順に全設定を出力
    pub fn log_args(&self) {
        let Ok(serde_json::Value::Object(map)) = serde_json::to_value(self) else {
            return;
        };
        for (k, v) in map {
            log::info!("ARGS: {k}: {v}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::{CommandFactory, FromArgMatches};

    fn parse(args: &[&str]) -> (TrainArgs, ArgMatches) {
        let argv = std::iter::once("rasr_train").chain(args.iter().copied());
        let matches = TrainArgs::command().try_get_matches_from(argv).unwrap();
        let parsed = TrainArgs::from_arg_matches(&matches).unwrap();
        (parsed, matches)
    }

    const PATHS: [&str; 6] = ["--train-json", "t.json", "--valid-json", "v.json", "--outdir", "exp"];

    #[test]
    fn test_defaults() {
        let (args, m) = parse(&PATHS);
        let s = args.into_settings(&m, None).unwrap();
        assert_eq!(s.opt, OptimizerKind::Adadelta);
        assert_eq!(s.criterion, Criterion::Acc);
        assert_eq!(s.batch_config(), BatchConfig { batch_size: 32, maxlen_in: 800, maxlen_out: 150, max_batches: 0 });
        assert!(s.validate().is_ok());
    }

    #[test]
    fn test_file_fills_unset_flags_only() {
        let mut argv = PATHS.to_vec();
        argv.extend(["--batch-size", "8"]);
        let (args, m) = parse(&argv);
        let file = TrainConfigFile {
            batch_size: Some(64),
            epochs: Some(3),
            opt: Some(OptimizerKind::Adam),
            dict: Some(PathBuf::from("units.txt")),
            ..Default::default()
        };
        let s = args.into_settings(&m, Some(file)).unwrap();
        assert_eq!(s.batch_size, 8);
        assert_eq!(s.epochs, 3);
        assert_eq!(s.opt, OptimizerKind::Adam);
        assert_eq!(s.dict, Some(PathBuf::from("units.txt")));
    }

    #[test]
    fn test_paths_from_file_and_missing_paths() {
        let (args, m) = parse(&[]);
        let file = TrainConfigFile {
            train_json: Some("a.json".into()),
            valid_json: Some("b.json".into()),
            outdir: Some("out".into()),
            ..Default::default()
        };
        assert_eq!(args.clone().into_settings(&m, Some(file)).unwrap().outdir, PathBuf::from("out"));
        assert!(matches!(args.into_settings(&m, None), Err(RasrError::InvalidConfig(_))));
    }

    #[test]
    fn test_resume_rejected() {
        let mut argv = PATHS.to_vec();
        argv.extend(["--resume", "exp/snapshot.ep.3"]);
        let (args, m) = parse(&argv);
        let err = args.into_settings(&m, None).unwrap_err();
        assert!(err.to_string().contains("not supported"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let (args, m) = parse(&PATHS);
        let base = args.into_settings(&m, None).unwrap();
        for bad in [
            TrainSettings { augment_ratio: 0, ..base.clone() },
            TrainSettings { grad_clip: 0.0, ..base.clone() },
            TrainSettings { batch_size: 0, ..base.clone() },
            TrainSettings { eps_decay: 1.5, ..base.clone() },
        ] {
            assert!(matches!(bad.validate(), Err(RasrError::InvalidConfig(_))));
        }
    }

    #[test]
    fn test_config_file_formats() {
        let dir = tempfile::tempdir().unwrap();
        let toml_path = dir.path().join("train.toml");
        std::fs::write(&toml_path, "batch_size = 4\nopt = \"adam\"\n").unwrap();
        let f = load_config_file(&toml_path).unwrap();
        assert_eq!(f.batch_size, Some(4));
        assert_eq!(f.opt, Some(OptimizerKind::Adam));

        let yaml_path = dir.path().join("train.yaml");
        std::fs::write(&yaml_path, "criterion: loss\nunknown_key: 1\n").unwrap();
        assert!(load_config_file(&yaml_path).is_err());
    }
}
