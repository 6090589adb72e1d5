//! 音響特徴量のバイナリコーデック
//!
//! Kaldi のバイナリ行列形式（`\0B` + `FM `/`DM ` + 行数・列数 + リトルエンディアンの本体）を扱う。
//! 圧縮行列（`CM`）には対応しない。

use std::io::{self, Read, Write};

use crate::error::{RasrError, RasrResult};

const BINARY_MARKER: &[u8; 2] = b"\0B";
const FLOAT_MATRIX: &[u8; 3] = b"FM ";
const DOUBLE_MATRIX: &[u8; 3] = b"DM ";
const INT32_SIZE_MARKER: u8 = 4;
/// 1発話あたりの要素数の上限（破損ファイルで巨大確保しないため）
const MAX_ELEMENTS: usize = 1 << 28;

/// 行優先の特徴量行列（フレーム × 次元）
#[derive(Clone, Debug, Default, PartialEq)]
pub struct FeatureMatrix {
    pub rows: usize,
    pub cols: usize,
    pub data: Vec<f32>,
}

impl FeatureMatrix {
    pub fn new(rows: usize, cols: usize, data: Vec<f32>) -> Self {
        debug_assert_eq!(rows * cols, data.len());
        Self { rows, cols, data }
    }

    pub fn row(&self, i: usize) -> &[f32] {
        &self.data[i * self.cols..(i + 1) * self.cols]
    }

    /// 全フレームの平均ベクトル。フレーム0なら0ベクトル
    pub fn mean_row(&self) -> Vec<f32> {
        let mut mean = vec![0.0f32; self.cols];
        if self.rows == 0 {
            return mean;
        }
        for r in 0..self.rows {
            for (m, &x) in mean.iter_mut().zip(self.row(r)) {
                *m += x;
            }
        }
        let inv = 1.0 / self.rows as f32;
        for m in mean.iter_mut() {
            *m *= inv;
        }
        mean
    }
}

/// 特徴量のデコーダ
pub trait FeatureCodec {
    /// `reader` の現在位置から1行列を読む
    fn decode(&self, reader: &mut dyn Read) -> RasrResult<FeatureMatrix>;
}

/// Kaldi バイナリ行列
#[derive(Clone, Copy, Debug, Default)]
pub struct KaldiBinaryCodec;

impl FeatureCodec for KaldiBinaryCodec {
    fn decode(&self, reader: &mut dyn Read) -> RasrResult<FeatureMatrix> {
        let mut marker = [0u8; 2];
        read_exact(reader, &mut marker)?;
        if &marker != BINARY_MARKER {
            return Err(RasrError::decode("feature matrix", "missing binary marker"));
        }

        let mut kind = [0u8; 3];
        read_exact(reader, &mut kind)?;
        let is_double = match &kind {
            FLOAT_MATRIX => false,
            DOUBLE_MATRIX => true,
            other => {
                return Err(RasrError::decode(
                    "feature matrix",
                    format!("unsupported matrix type {:?}", String::from_utf8_lossy(other)),
                ));
            }
        };

        let rows = read_dim(reader)?;
        let cols = read_dim(reader)?;
        let n = rows
            .checked_mul(cols)
            .filter(|&n| n <= MAX_ELEMENTS)
            .ok_or_else(|| RasrError::decode("feature matrix", format!("unreasonable shape {rows}x{cols}")))?;

        let data = if is_double {
            let buf = read_payload(reader, n * 8)?;
            buf.chunks_exact(8)
                .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]) as f32)
                .collect()
        } else {
            let buf = read_payload(reader, n * 4)?;
            buf.chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect()
        };

        Ok(FeatureMatrix { rows, cols, data })
    }
}

fn read_exact(reader: &mut dyn Read, buf: &mut [u8]) -> RasrResult<()> {
    reader.read_exact(buf).map_err(|e| match e.kind() {
        io::ErrorKind::UnexpectedEof => RasrError::decode("feature matrix", "truncated data"),
        _ => RasrError::Io(e),
    })
}

// 確保量はヘッダの寸法ではなく実際に読めたバイト数で決まる
fn read_payload(reader: &mut dyn Read, len: usize) -> RasrResult<Vec<u8>> {
    let mut buf = Vec::new();
    (&mut *reader).take(len as u64).read_to_end(&mut buf).map_err(RasrError::Io)?;
    if buf.len() < len {
        return Err(RasrError::decode(
            "feature matrix",
            format!("truncated data ({} of {len} bytes)", buf.len()),
        ));
    }
    Ok(buf)
}

fn read_dim(reader: &mut dyn Read) -> RasrResult<usize> {
    let mut b = [0u8; 5];
    read_exact(reader, &mut b)?;
    if b[0] != INT32_SIZE_MARKER {
        return Err(RasrError::decode("feature matrix", format!("bad int32 size marker {}", b[0])));
    }
    let v = i32::from_le_bytes([b[1], b[2], b[3], b[4]]);
    usize::try_from(v)
        .map_err(|_| RasrError::decode("feature matrix", format!("negative dimension {v}")))
}

/// Kaldi バイナリ float 行列として書き出す
pub fn write_matrix<W: Write>(w: &mut W, m: &FeatureMatrix) -> io::Result<()> {
    w.write_all(BINARY_MARKER)?;
    w.write_all(FLOAT_MATRIX)?;
    w.write_all(&[INT32_SIZE_MARKER])?;
    w.write_all(&(m.rows as i32).to_le_bytes())?;
    w.write_all(&[INT32_SIZE_MARKER])?;
    w.write_all(&(m.cols as i32).to_le_bytes())?;
    for v in &m.data {
        w.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// ark ファイル書き出し（`<key> ` + 行列の連続）
///
/// 各行列の開始オフセットを返すので、そのまま scp に書ける。
pub struct ArkWriter<W: Write> {
    inner: W,
    position: u64,
}

impl<W: Write> ArkWriter<W> {
    pub fn new(inner: W) -> Self {
        Self { inner, position: 0 }
    }

    pub fn write_entry(&mut self, key: &str, m: &FeatureMatrix) -> io::Result<u64> {
        self.inner.write_all(key.as_bytes())?;
        self.inner.write_all(b" ")?;
        let offset = self.position + key.len() as u64 + 1;
        write_matrix(&mut self.inner, m)?;
        self.position = offset + 2 + 3 + 10 + 4 * m.data.len() as u64;
        Ok(offset)
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}
