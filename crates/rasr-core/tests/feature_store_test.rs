//! 特徴量ストアの遅延読み込みテスト

use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use rasr_core::codec::{ArkWriter, FeatureMatrix};
use rasr_core::error::RasrError;
use rasr_core::feature_store::LazyFeatureStore;
use tempfile::TempDir;

fn matrix(rows: usize, cols: usize, seed: f32) -> FeatureMatrix {
    FeatureMatrix::new(rows, cols, (0..rows * cols).map(|i| seed + i as f32 * 0.25).collect())
}

/// ark を書き、`<key> <path>:<offset>` の scp 行を返す
fn write_ark(path: &Path, entries: &[(&str, FeatureMatrix)]) -> Vec<String> {
    let mut ark = ArkWriter::new(BufWriter::new(File::create(path).unwrap()));
    let mut scp = Vec::new();
    for (key, m) in entries {
        let off = ark.write_entry(key, m).unwrap();
        scp.push(format!("{key} {}:{off}", path.display()));
    }
    ark.into_inner().flush().unwrap();
    scp
}

#[test]
fn test_resolve_from_scp_shares_handles() {
    let dir = TempDir::new().unwrap();
    let a = matrix(3, 4, 0.0);
    let b = matrix(1, 4, 10.0);
    let c = matrix(2, 4, -5.0);
    let mut lines = write_ark(&dir.path().join("feats.1.ark"), &[("utt1", a.clone()), ("utt2", b.clone())]);
    lines.extend(write_ark(&dir.path().join("feats.2.ark"), &[("utt3", c.clone())]));

    let scp = dir.path().join("feats.scp");
    let body = format!("# generated\n\n{}\n", lines.join("\n"));
    fs::write(&scp, body).unwrap();

    let mut store = LazyFeatureStore::from_scp(&scp).unwrap();
    assert_eq!(store.len(), 3);
    assert!(store.contains("utt2"));
    assert_eq!(store.open_handles(), 0);

    assert_eq!(store.resolve("utt2").unwrap(), b);
    assert_eq!(store.resolve("utt1").unwrap(), a);
    assert_eq!(store.open_handles(), 1);
    assert_eq!(store.resolve("utt3").unwrap(), c);
    assert_eq!(store.open_handles(), 2);
    // 同じキーを再度読んでも結果は変わらない
    assert_eq!(store.resolve("utt1").unwrap(), a);
}

#[test]
fn test_unknown_key_and_corrupt_entry() {
    let dir = TempDir::new().unwrap();
    let ark = dir.path().join("feats.ark");
    let mut lines = write_ark(&ark, &[("good", matrix(2, 2, 1.0))]);
    // 末尾（行列が存在しない位置）を指すエントリ
    let len = fs::metadata(&ark).unwrap().len();
    lines.push(format!("broken {}:{}", ark.display(), len - 4));
    let scp = dir.path().join("feats.scp");
    fs::write(&scp, lines.join("\n")).unwrap();

    let mut store = LazyFeatureStore::from_scp(&scp).unwrap();
    assert!(matches!(store.resolve("missing"), Err(RasrError::NotFound(_))));
    let err = store.resolve("broken").unwrap_err();
    assert!(matches!(err, RasrError::Decode { .. }));
    assert!(err.is_recoverable());
    // 破損エントリの後も他のキーは読める
    assert_eq!(store.resolve("good").unwrap().rows, 2);
}

#[test]
fn test_missing_backing_file() {
    let dir = TempDir::new().unwrap();
    let scp = dir.path().join("feats.scp");
    fs::write(&scp, format!("utt1 {}:0\n", dir.path().join("nope.ark").display())).unwrap();
    let mut store = LazyFeatureStore::from_scp(&scp).unwrap();
    assert!(matches!(store.resolve("utt1"), Err(RasrError::ResourceUnavailable { .. })));
}
