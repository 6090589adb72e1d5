//! ファイルI/Oユーティリティ（gzip・標準入出力対応）
//!
//! パス `-` は標準入出力、拡張子 `.gz` は透過的に伸長・圧縮する。
//! マニフェストや認識結果の JSON はすべてここを通して読み書きする。

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;

const READER_BUF_CAP: usize = 128 * 1024; // 128 KiB

fn is_stdio(p: &Path) -> bool {
    p.as_os_str() == "-"
}

fn is_gzip(p: &Path) -> bool {
    p.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("gz"))
}

pub fn open_reader<P: AsRef<Path>>(path: P) -> io::Result<Box<dyn BufRead>> {
    let p = path.as_ref();
    if is_stdio(p) {
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, io::stdin())));
    }
    let f = File::open(p)?;
    if is_gzip(p) {
        let dec = flate2::read::GzDecoder::new(f);
        return Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, dec)));
    }
    Ok(Box::new(BufReader::with_capacity(READER_BUF_CAP, f)))
}

/// 圧縮ストリームの終端処理エラーを取りこぼさないための Writer
#[must_use = "call .close() to propagate compression/IO errors"]
pub enum Writer {
    Plain(BufWriter<File>),
    Stdout(io::Stdout),
    Gz(flate2::write::GzEncoder<File>),
}

impl Write for Writer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Writer::Plain(f) => f.write(buf),
            Writer::Stdout(s) => s.write(buf),
            Writer::Gz(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Writer::Plain(f) => f.flush(),
            Writer::Stdout(s) => s.flush(),
            Writer::Gz(e) => e.flush(),
        }
    }
}

impl Writer {
    /// ストリームを閉じ、バッファと gzip フッタを書き切る
    pub fn close(self) -> io::Result<()> {
        match self {
            Writer::Plain(f) => {
                let file = f.into_inner().map_err(|e| e.into_error())?;
                file.sync_all()
            }
            Writer::Stdout(mut s) => s.flush(),
            Writer::Gz(e) => e.finish()?.sync_all(),
        }
    }
}

pub fn open_writer<P: AsRef<Path>>(path: P) -> io::Result<Writer> {
    let p = path.as_ref();
    if is_stdio(p) {
        return Ok(Writer::Stdout(io::stdout()));
    }
    let f = File::create(p)?;
    if is_gzip(p) {
        let enc = flate2::write::GzEncoder::new(f, flate2::Compression::default());
        return Ok(Writer::Gz(enc));
    }
    Ok(Writer::Plain(BufWriter::new(f)))
}

/// JSON ファイル（`.gz` / `-` 可）を読み込む
pub fn read_json<T: DeserializeOwned, P: AsRef<Path>>(path: P) -> Result<T> {
    let p = path.as_ref();
    let reader = open_reader(p).with_context(|| format!("failed to open {}", p.display()))?;
    serde_json::from_reader(reader).with_context(|| format!("failed to parse {}", p.display()))
}

/// 4スペースインデントの JSON として書き出す
pub fn write_json_pretty<T: Serialize, P: AsRef<Path>>(path: P, value: &T) -> Result<()> {
    let p = path.as_ref();
    let mut w = open_writer(p).with_context(|| format!("failed to create {}", p.display()))?;
    let fmt = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut w, fmt);
    value
        .serialize(&mut ser)
        .with_context(|| format!("failed to write {}", p.display()))?;
    w.write_all(b"\n")?;
    w.close().with_context(|| format!("failed to close {}", p.display()))
}
