//! 並列テキスト `<prefix>.src` / `<prefix>.tgt` を索引化し、
//! マニフェストの `aug` ブロックとして書き込む
//!
//! 例:
//! ```bash
//! make_aug_index --aug data/text/aug --json data/train.json \
//!     --idict data/text/src_units.txt --odict data/units.txt
//! ```

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use serde_json::Value;

use rasr_core::augment::TokenDict;
use rasr_core::manifest::AugmentManifest;
use rasr_core::text_index::{RaggedPolicy, index_parallel_text};
use tools::common::io::{read_json, write_json_pretty};

fn parse_ragged(s: &str) -> Result<RaggedPolicy, String> {
    match s.to_ascii_lowercase().as_str() {
        "truncate" => Ok(RaggedPolicy::Truncate),
        "reject" => Ok(RaggedPolicy::Reject),
        other => Err(format!("unknown policy '{other}' (expected truncate|reject)")),
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Index parallel text and attach it to a manifest")]
struct Cli {
    /// 並列テキストの接頭辞（`<prefix>.src` と `<prefix>.tgt` を読む）
    #[arg(long)]
    aug: PathBuf,

    /// 書き換えるマニフェスト
    #[arg(long)]
    json: PathBuf,

    /// 出力先（省略時は --json を上書き）
    #[arg(long)]
    out: Option<PathBuf>,

    /// source 側トークン辞書（`<token> <id>`）
    #[arg(long)]
    idict: Option<PathBuf>,

    /// target 側トークン辞書（`<token> <id>`）
    #[arg(long)]
    odict: Option<PathBuf>,

    /// 行数が揃わないときの扱い truncate | reject
    #[arg(long, value_parser = parse_ragged, default_value = "truncate")]
    ragged: RaggedPolicy,
}

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut s = prefix.as_os_str().to_owned();
    s.push(suffix);
    PathBuf::from(s)
}

fn load_dict(path: Option<&Path>, side: &str) -> Result<TokenDict> {
    match path {
        Some(p) => {
            let dict = TokenDict::load(p).with_context(|| format!("failed to load {side} dictionary"))?;
            log::info!("{side} dictionary {}: {} tokens", p.display(), dict.len());
            Ok(dict)
        }
        None => {
            log::warn!("no {side} dictionary given; training will reject this augmentation block");
            Ok(TokenDict::default())
        }
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Stderr)
        .init();

    let cli = Cli::parse();
    let src = with_suffix(&cli.aug, ".src");
    let tgt = with_suffix(&cli.aug, ".tgt");
    let sentences = index_parallel_text(&src, &tgt, cli.ragged)?;

    let block = AugmentManifest {
        ifilename: src,
        ofilename: tgt,
        idict: load_dict(cli.idict.as_deref(), "source")?,
        odict: load_dict(cli.odict.as_deref(), "target")?,
        sentences,
    };

    let mut manifest: Value = read_json(&cli.json)?;
    let Some(obj) = manifest.as_object_mut() else {
        anyhow::bail!("{} is not a JSON object", cli.json.display());
    };
    if !obj.contains_key("utts") {
        anyhow::bail!("{} has no utts object", cli.json.display());
    }
    if obj.contains_key("aug") {
        log::warn!("replacing existing aug block in {}", cli.json.display());
    }
    obj.insert("aug".into(), serde_json::to_value(&block)?);

    let out = cli.out.as_ref().unwrap_or(&cli.json);
    write_json_pretty(out, &manifest)?;
    log::info!("Wrote {} ({} sentence pairs)", out.display(), block.sentences.len());
    Ok(())
}
