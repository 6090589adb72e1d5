//! 並列テキストファイルのバイトオフセット索引
//!
//! 行対応の source/target ファイルを一度だけ走査し、各行の開始オフセットと
//! トークン数を記録する。学習中は索引からシークして1行ずつ読むため、
//! ファイル全体をメモリに載せる必要がない。

use std::fs::File;
use std::io::{BufRead, BufReader, Seek, SeekFrom};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::batching::SequenceLengths;
use crate::error::{RasrError, RasrResult};

const LINE_BUFFER_CAPACITY: usize = 64 * 1024;

/// 索引の1エントリ（1行ペア）
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AugmentationIndexEntry {
    /// 0始まりの行番号
    pub line: u64,
    /// source 行の空白区切りトークン数
    pub ilen: usize,
    /// target 行の空白区切りトークン数
    pub olen: usize,
    /// source ファイル内の行頭オフセット
    pub ioffset: u64,
    /// target ファイル内の行頭オフセット
    pub ooffset: u64,
}

impl SequenceLengths for AugmentationIndexEntry {
    fn input_len(&self) -> usize {
        self.ilen
    }

    fn output_len(&self) -> usize {
        self.olen
    }
}

/// 行数の異なるファイルペアの扱い
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RaggedPolicy {
    /// 短い方に合わせて切り詰める（警告ログのみ）
    #[default]
    Truncate,
    /// `InvalidConfig` として拒否する
    Reject,
}

/// source/target ファイルペアを索引化する
pub fn index_parallel_text(
    src: &Path,
    tgt: &Path,
    policy: RaggedPolicy,
) -> RasrResult<Vec<AugmentationIndexEntry>> {
    let src_file = File::open(src).map_err(|e| RasrError::unavailable(src, e))?;
    let tgt_file = File::open(tgt).map_err(|e| RasrError::unavailable(tgt, e))?;
    let entries = index_parallel_readers(
        BufReader::with_capacity(LINE_BUFFER_CAPACITY, src_file),
        BufReader::with_capacity(LINE_BUFFER_CAPACITY, tgt_file),
        policy,
    )?;
    log::info!(
        "Indexed {} sentence pairs from {} / {}",
        entries.len(),
        src.display(),
        tgt.display()
    );
    Ok(entries)
}

/// 任意の `BufRead` ペアを索引化する
///
/// オフセットは各行を読む「前」に記録するので、後でそこへシークすれば
/// 同じ行が再現される。
pub fn index_parallel_readers<A: BufRead, B: BufRead>(
    mut src: A,
    mut tgt: B,
    policy: RaggedPolicy,
) -> RasrResult<Vec<AugmentationIndexEntry>> {
    let mut entries = Vec::new();
    let mut ioffset = 0u64;
    let mut ooffset = 0u64;
    let mut iline: Vec<u8> = Vec::with_capacity(LINE_BUFFER_CAPACITY);
    let mut oline: Vec<u8> = Vec::with_capacity(LINE_BUFFER_CAPACITY);

    loop {
        iline.clear();
        oline.clear();
        let ni = src.read_until(b'\n', &mut iline)?;
        let no = tgt.read_until(b'\n', &mut oline)?;

        if ni == 0 || no == 0 {
            if ni != no {
                let (longer, rest) = if ni > 0 {
                    ("source", 1 + count_lines(&mut src)?)
                } else {
                    ("target", 1 + count_lines(&mut tgt)?)
                };
                let msg = format!(
                    "parallel files differ in length: {} common lines, {longer} has {rest} more",
                    entries.len()
                );
                match policy {
                    RaggedPolicy::Truncate => log::warn!("{msg}; truncating to the shorter file"),
                    RaggedPolicy::Reject => return Err(RasrError::InvalidConfig(msg)),
                }
            }
            break;
        }

        entries.push(AugmentationIndexEntry {
            line: entries.len() as u64,
            ilen: count_tokens(&iline),
            olen: count_tokens(&oline),
            ioffset,
            ooffset,
        });
        ioffset += ni as u64;
        ooffset += no as u64;
    }

    Ok(entries)
}

/// 指定オフセットから1行だけ読み、改行を除いて返す
pub fn read_line_at<R: BufRead + Seek>(reader: &mut R, offset: u64) -> RasrResult<String> {
    reader.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    let n = reader.read_until(b'\n', &mut buf)?;
    if n == 0 {
        return Err(RasrError::decode(
            format!("line at offset {offset}"),
            "offset is at or past end of file",
        ));
    }
    while matches!(buf.last(), Some(b'\n' | b'\r')) {
        buf.pop();
    }
    String::from_utf8(buf)
        .map_err(|e| RasrError::decode(format!("line at offset {offset}"), e.to_string()))
}

fn count_tokens(line: &[u8]) -> usize {
    String::from_utf8_lossy(line).split_whitespace().count()
}

fn count_lines<R: BufRead>(reader: &mut R) -> RasrResult<usize> {
    let mut n = 0;
    let mut buf = Vec::new();
    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            return Ok(n);
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_offsets_point_to_line_starts() {
        let src = "a b c\nd e\n\nf\n";
        let tgt = "x\ny y\nz z z\nw w w w\n";
        let entries =
            index_parallel_readers(Cursor::new(src), Cursor::new(tgt), RaggedPolicy::Reject)
                .unwrap();

        assert_eq!(entries.len(), 4);
        assert_eq!(entries[0].ioffset, 0);
        assert_eq!(entries[1].ioffset, 6);
        assert_eq!(entries[2].ioffset, 10);
        assert_eq!(entries[3].ioffset, 11);
        assert_eq!(entries[3].ooffset, 12);

        // 空行もエントリとして残る（トークン数0）
        assert_eq!(entries[2].ilen, 0);
        assert_eq!(entries[2].olen, 3);
    }

    #[test]
    fn test_last_line_without_newline() {
        let entries =
            index_parallel_readers(Cursor::new("a\nb c"), Cursor::new("x\ny"), RaggedPolicy::Reject)
                .unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].ilen, 2);
    }

    #[test]
    fn test_ragged_truncate_keeps_common_prefix() {
        let entries = index_parallel_readers(
            Cursor::new("a\nb\nc\n"),
            Cursor::new("x\n"),
            RaggedPolicy::Truncate,
        )
        .unwrap();
        assert_eq!(entries.len(), 1);
    }

    #[test]
    fn test_ragged_reject_fails() {
        let err = index_parallel_readers(
            Cursor::new("a\n"),
            Cursor::new("x\ny\n"),
            RaggedPolicy::Reject,
        )
        .unwrap_err();
        assert!(matches!(err, RasrError::InvalidConfig(ref m) if m.contains("target has 1 more")));
    }

    #[test]
    fn test_read_line_at_strips_crlf() {
        let mut cur = Cursor::new(b"one\r\ntwo three\r\n".to_vec());
        assert_eq!(read_line_at(&mut cur, 5).unwrap(), "two three");
        assert_eq!(read_line_at(&mut cur, 0).unwrap(), "one");
        assert!(matches!(read_line_at(&mut cur, 99), Err(RasrError::Decode { .. })));
    }
}
