//! 学習済みモデルでマニフェストを認識し、結果を JSON で書き出す

use anyhow::Result;
use clap::Parser;

use tools::asr_trainer::{RecogArgs, run_recognition};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let args = RecogArgs::parse();
    let summary = run_recognition(&args)?;
    if summary.failed > 0 {
        log::warn!("{} of {} utterances failed", summary.failed, summary.utterances);
    }
    Ok(())
}
