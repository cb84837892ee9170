//! モデルメタデータの定義
//!
//! バンドル (tar.gz) の `metadata.json` として保存され、
//! 推論側はこれだけでモデルを再構築できます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::ml::ClassifierConfig;

/// 重みの保存精度
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WeightPrecision {
    /// f32
    #[default]
    Full,
    /// f16（モバイル向けに最適化した形式）
    Half,
}

impl WeightPrecision {
    pub fn from_optimize(optimize: bool) -> Self {
        if optimize {
            WeightPrecision::Half
        } else {
            WeightPrecision::Full
        }
    }
}

impl std::fmt::Display for WeightPrecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            WeightPrecision::Full => write!(f, "f32"),
            WeightPrecision::Half => write!(f, "f16 (optimized)"),
        }
    }
}

/// モデルメタデータ
///
/// tar.gz形式で保存される情報：
/// - metadata.json: このメタデータ（JSON形式）
/// - model.bin: モデルの重み（バイナリ）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMetadata {
    /// クラス名（インデックス順、ディレクトリ名の昇順）
    pub class_names: Vec<String>,

    /// クラス数
    pub num_classes: usize,

    /// 入力形状 [高さ, 幅, チャネル]
    pub input_shape: [usize; 3],

    /// モデル再構築用の設定
    pub model_config: ClassifierConfig,

    /// 重みの精度
    #[serde(default)]
    pub precision: WeightPrecision,

    /// 実際に学習したエポック数
    pub epochs_run: usize,

    /// 最良の検証精度
    #[serde(default)]
    pub best_val_accuracy: Option<f64>,

    /// モデルの学習時刻（ISO8601形式）
    pub trained_at: String,
}

impl ModelMetadata {
    /// 新しいメタデータを作成
    pub fn new(
        class_names: Vec<String>,
        model_config: ClassifierConfig,
        precision: WeightPrecision,
        epochs_run: usize,
        best_val_accuracy: Option<f64>,
    ) -> Self {
        let trained_at = chrono::Local::now().to_rfc3339();
        let size = model_config.image_size;

        Self {
            num_classes: class_names.len(),
            class_names,
            input_shape: [size, size, crate::ml::ml_model::INPUT_CHANNELS],
            model_config,
            precision,
            epochs_run,
            best_val_accuracy,
            trained_at,
        }
    }

    /// 精度だけを差し替えたコピー
    pub fn with_precision(mut self, precision: WeightPrecision) -> Self {
        self.precision = precision;
        self
    }

    /// クラスインデックスからクラス名を取得
    pub fn class_name(&self, index: usize) -> Option<&str> {
        self.class_names.get(index).map(String::as_str)
    }

    /// メタデータをJSON文字列に変換
    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("Failed to serialize metadata to JSON")
    }

    /// JSON文字列からメタデータを生成
    pub fn from_json_string(json: &str) -> Result<Self> {
        let metadata: Self =
            serde_json::from_str(json).context("Failed to deserialize metadata from JSON")?;
        if metadata.num_classes != metadata.class_names.len() {
            anyhow::bail!(
                "metadata.json is inconsistent: num_classes={} but {} class names",
                metadata.num_classes,
                metadata.class_names.len()
            );
        }
        Ok(metadata)
    }
}
