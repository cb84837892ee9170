//! 猫・犬写真分類器
//!
//! - `scan`: データセット内の壊れた画像の検出・削除
//! - `dataset`: クラスごとのディレクトリからの読み込み、分割、データ拡張
//! - `ml`: CNNモデル、学習ループ、推論
//! - `model`: 学習設定、メタデータ、バンドル・チェックポイントの保存

pub mod logging;
pub mod model;
pub mod scan;

#[cfg(feature = "ml")]
pub mod dataset;
#[cfg(feature = "ml")]
pub mod ml;
