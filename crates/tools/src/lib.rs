//! rasr の学習・認識・データ準備ツール群
//!
//! - `asr_trainer`: 学習ループ、認識、設定、構造化ログ
//! - `common`: gzip・標準入出力対応のファイルI/O

pub mod asr_trainer;
pub mod common;
