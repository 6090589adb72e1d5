//! 音声認識モデルの学習
//!
//! 例:
//! ```bash
//! rasr_train --train-json data/train.json --valid-json data/dev.json \
//!     --outdir exp/train --dict data/units.txt --augment-ratio 2 --log-jsonl exp/train/log.jsonl
//! ```

use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::{CommandFactory, FromArgMatches};

use tools::asr_trainer::{TrainArgs, Trainer, load_config_file};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let matches = TrainArgs::command().get_matches();
    let args = TrainArgs::from_arg_matches(&matches)?;
    let file = match &args.config {
        Some(path) => Some(
            load_config_file(path)
                .with_context(|| format!("failed to load config {}", path.display()))?,
        ),
        None => None,
    };
    let settings = args.into_settings(&matches, file)?;
    let trainer = Trainer::new(settings)?;

    // Ctrl-C ハンドラ
    {
        let interrupted = trainer.interrupted();
        ctrlc::set_handler(move || {
            eprintln!("\nInterrupted; finishing the current step...");
            interrupted.store(true, Ordering::SeqCst);
        })
        .context("Failed to set Ctrl-C handler")?;
    }

    let summary = trainer.run()?;
    for (metric, best) in &summary.best {
        log::info!("best {metric}: {best}");
    }
    if summary.interrupted {
        log::warn!("Training was interrupted after {} epochs", summary.epochs);
    }
    Ok(())
}
