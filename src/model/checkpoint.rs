//! 学習途中・学習後のチェックポイント
//!
//! 重みは `DefaultFileRecorder` (f32, `.mpk`) で、モデル設定とクラス名は
//! 同名の `.json` に保存します。後からバンドルへ書き出し直すことができます。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{DefaultFileRecorder, FullPrecisionSettings},
    tensor::backend::Backend,
};
use tracing::info;

use crate::ml::{CatDogClassifier, ClassifierConfig};
use crate::model::model_metadata::{ModelMetadata, WeightPrecision};
use crate::model::model_storage::export_bundle;

/// チェックポイントの付随情報
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointInfo {
    pub class_names: Vec<String>,
    pub model_config: ClassifierConfig,
    pub epochs_run: usize,
    #[serde(default)]
    pub best_val_accuracy: Option<f64>,
}

fn sidecar_path(path: &Path) -> PathBuf {
    path.with_extension("json")
}

/// モデルとその設定を保存する
///
/// `path` の拡張子は `.mpk` / `.json` に置き換えられます。重みファイルのパスを返します。
pub fn save_checkpoint<B: Backend>(
    model: &CatDogClassifier<B>,
    info: &CheckpointInfo,
    path: &Path,
) -> Result<PathBuf> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    model
        .clone()
        .save_file(path, &DefaultFileRecorder::<FullPrecisionSettings>::new())
        .map_err(|e| anyhow::anyhow!("チェックポイントの保存エラー: {:?}", e))?;

    let json = serde_json::to_string_pretty(info)?;
    let sidecar = sidecar_path(path);
    std::fs::write(&sidecar, json)
        .with_context(|| format!("Failed to write {}", sidecar.display()))?;

    let weights = path.with_extension("mpk");
    info!("チェックポイントを保存しました: {}", weights.display());
    Ok(weights)
}

/// チェックポイントを読み込んでモデルを復元する
pub fn load_checkpoint<B: Backend>(
    path: &Path,
    device: &B::Device,
) -> Result<(CheckpointInfo, CatDogClassifier<B>)> {
    let sidecar = sidecar_path(path);
    let json = std::fs::read_to_string(&sidecar)
        .with_context(|| format!("Failed to read checkpoint info: {}", sidecar.display()))?;
    let info: CheckpointInfo = serde_json::from_str(&json)
        .with_context(|| format!("Failed to parse checkpoint info: {}", sidecar.display()))?;

    let model = info
        .model_config
        .try_init::<B>(device)
        .with_context(|| format!("Invalid model config in {}", sidecar.display()))?
        .load_file(path, &DefaultFileRecorder::<FullPrecisionSettings>::new(), device)
        .map_err(|e| anyhow::anyhow!("チェックポイントの読み込みエラー: {:?}", e))?;

    Ok((info, model))
}

/// 保存済みチェックポイントをバンドル形式に書き出す
///
/// `optimize` が真なら重みを半精度で保存します。
pub fn export_checkpoint<B: Backend>(
    checkpoint: &Path,
    output: &Path,
    optimize: bool,
    device: &B::Device,
) -> Result<PathBuf> {
    let (info, model) = load_checkpoint::<B>(checkpoint, device)?;
    let metadata = ModelMetadata::new(
        info.class_names,
        info.model_config,
        WeightPrecision::from_optimize(optimize),
        info.epochs_run,
        info.best_val_accuracy,
    );
    export_bundle(&model, &metadata, output)
}
