//! 音声認識モデルの学習・認識ドライバ

pub mod logging;
pub mod recog;
pub mod settings;
pub mod trainer;

pub use recog::{RecogArgs, RecogSummary, run_recognition};
pub use settings::{Criterion, TrainArgs, TrainConfigFile, TrainSettings, load_config_file};
pub use trainer::{TrainSummary, Trainer};
