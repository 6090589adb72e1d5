//! 並列テキスト索引の往復・冪等性テスト

use std::fs::{self, File};
use std::io::BufReader;

use rasr_core::error::RasrError;
use rasr_core::text_index::{RaggedPolicy, index_parallel_text, read_line_at};
use tempfile::TempDir;

const SRC: &str = "the cat sat\non the mat\n\nend of text\r\n";
const TGT: &str = "le chat\nsur le tapis\nvide\nfin\n";

#[test]
fn test_offsets_reproduce_every_line() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("aug.src");
    let tgt = dir.path().join("aug.tgt");
    fs::write(&src, SRC).unwrap();
    fs::write(&tgt, TGT).unwrap();

    let entries = index_parallel_text(&src, &tgt, RaggedPolicy::Reject).unwrap();
    assert_eq!(entries.len(), 4);

    let mut src_reader = BufReader::new(File::open(&src).unwrap());
    let mut tgt_reader = BufReader::new(File::open(&tgt).unwrap());
    let src_lines: Vec<&str> = SRC.lines().collect();
    let tgt_lines: Vec<&str> = TGT.lines().collect();

    // 逆順に読んでもシークで同じ行が得られる
    for e in entries.iter().rev() {
        let i = e.line as usize;
        assert_eq!(read_line_at(&mut src_reader, e.ioffset).unwrap(), src_lines[i]);
        assert_eq!(read_line_at(&mut tgt_reader, e.ooffset).unwrap(), tgt_lines[i]);
        assert_eq!(e.ilen, src_lines[i].split_whitespace().count());
        assert_eq!(e.olen, tgt_lines[i].split_whitespace().count());
    }
    assert_eq!(entries[2].ilen, 0);
}

#[test]
fn test_indexing_is_idempotent() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("a.src");
    let tgt = dir.path().join("a.tgt");
    fs::write(&src, SRC).unwrap();
    fs::write(&tgt, TGT).unwrap();

    let first = index_parallel_text(&src, &tgt, RaggedPolicy::Truncate).unwrap();
    let second = index_parallel_text(&src, &tgt, RaggedPolicy::Truncate).unwrap();
    assert_eq!(first, second);
    assert_eq!(fs::read_to_string(&src).unwrap(), SRC);
}

#[test]
fn test_ragged_files_follow_policy() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("r.src");
    let tgt = dir.path().join("r.tgt");
    fs::write(&src, "a\nb\nc\n").unwrap();
    fs::write(&tgt, "x\ny\n").unwrap();

    let truncated = index_parallel_text(&src, &tgt, RaggedPolicy::Truncate).unwrap();
    assert_eq!(truncated.len(), 2);

    let rejected = index_parallel_text(&src, &tgt, RaggedPolicy::Reject);
    assert!(matches!(rejected, Err(RasrError::InvalidConfig(_))));
}

#[test]
fn test_missing_file_is_resource_unavailable() {
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("present.src");
    fs::write(&src, "a\n").unwrap();
    let err = index_parallel_text(&src, &dir.path().join("absent.tgt"), RaggedPolicy::Truncate).unwrap_err();
    assert!(matches!(err, RasrError::ResourceUnavailable { .. }));
}
