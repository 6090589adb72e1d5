//! # rasr-core
//!
//! attention/CTC 音声認識モデル学習のためのデータ供給・学習制御ライブラリ。
//! ネットワーク本体（順伝播・逆伝播）はトレイト越しの外部コンポーネントとして扱う。
//!
//! ## モジュール構成
//!
//! - `text_index`: 並列テキストのバイトオフセット索引
//! - `feature_store`: 遅延読み込みの特徴量ストア（`codec` で復号）
//! - `batching`: 系列長バケットのミニバッチ構築とローダ
//! - `scheduler`: 音響データとテキスト拡張データのインターリーブ
//! - `guard`: 勾配ノルムのクリップと非有限値スキップ（`optim` で更新）
//! - `checkpoint`: 指標別ベストチェックポイントと巻き戻し
//! - `evaluation`: 検証ループ
//!

pub mod error;

// 入力データ
pub mod augment;
pub mod codec;
pub mod feature_store;
pub mod manifest;
pub mod text_index;

// バッチ構築・供給
pub mod batching;
pub mod scheduler;

// モデル・更新
pub mod guard;
pub mod linear;
pub mod model;
pub mod optim;

// 学習制御
pub mod checkpoint;
pub mod evaluation;
pub mod metrics;
pub mod model_config;

pub use error::{RasrError, RasrResult};
