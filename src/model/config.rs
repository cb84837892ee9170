//! 学習設定管理モジュール
//!
//! データセット・モデル構成・学習ループ・出力先などをJSON形式で保存・読み込みします。
//! 旧スクリプトごとにばらばらだった値は [`TrainingConfig::preset`] のプリセットとして提供します。

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::scan::ScanAction;

/// 計算デバイスの種類
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// WGPU (GPU) バックエンド
    #[default]
    Wgpu,
    /// NdArray (CPU) バックエンド
    Cpu,
}

impl std::fmt::Display for DeviceType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeviceType::Wgpu => write!(f, "WGPU (GPU)"),
            DeviceType::Cpu => write!(f, "CPU (NdArray)"),
        }
    }
}

/// ネットワーク構成
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchitectureSettings {
    /// 畳み込みブロックごとのフィルタ数
    pub filters: Vec<usize>,
    /// 全結合層のユニット数
    pub dense_units: usize,
    /// 畳み込みごとにBatchNormを挟むか
    pub batch_norm: bool,
    /// ブロックごとのドロップアウト率（0.0 は無し）
    pub block_dropout: Vec<f64>,
    /// 全結合層後のドロップアウト率
    pub dense_dropout: f64,
}

impl Default for ArchitectureSettings {
    fn default() -> Self {
        Self {
            filters: vec![32, 64, 128],
            dense_units: 128,
            batch_norm: false,
            block_dropout: vec![0.0, 0.0, 0.0],
            dense_dropout: 0.0,
        }
    }
}

/// データ拡張設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AugmentationSettings {
    /// 回転範囲（度）
    pub rotation_range: f32,
    /// 横方向シフト（画像幅に対する割合）
    pub width_shift_range: f32,
    /// 縦方向シフト（画像高さに対する割合）
    pub height_shift_range: f32,
    /// せん断角度（度）
    pub shear_range: f32,
    /// ズーム範囲 (1 ± zoom_range)
    pub zoom_range: f32,
    /// 左右反転
    pub horizontal_flip: bool,
    /// 明るさ倍率の範囲
    #[serde(default)]
    pub brightness_range: Option<(f32, f32)>,
    /// チャネルシフト量（0-255スケール）
    #[serde(default)]
    pub channel_shift_range: f32,
}

impl Default for AugmentationSettings {
    fn default() -> Self {
        Self {
            rotation_range: 30.0,
            width_shift_range: 0.2,
            height_shift_range: 0.2,
            shear_range: 0.2,
            zoom_range: 0.2,
            horizontal_flip: true,
            brightness_range: None,
            channel_shift_range: 0.0,
        }
    }
}

/// 早期終了設定（検証精度を監視）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EarlyStoppingSettings {
    /// 改善が無いまま待つエポック数
    pub patience: usize,
    /// 停止時に最良エポックの重みへ戻すか
    pub restore_best_weights: bool,
}

/// 学習率減衰設定（検証損失を監視）
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PlateauSettings {
    /// 減衰率
    pub factor: f64,
    /// 改善が無いまま待つエポック数
    pub patience: usize,
    /// 学習率の下限
    pub min_lr: f64,
    /// 改善とみなす最小変化量
    #[serde(default = "default_min_delta")]
    pub min_delta: f64,
}

fn default_min_delta() -> f64 {
    1e-4
}

/// 学習設定
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingConfig {
    /// クラスごとのサブディレクトリを含むデータセットルート
    pub data_dir: PathBuf,
    /// 学習前の画像検証の動作（None でも壊れた画像は学習対象から外す。削除はしない）
    pub scan: Option<ScanAction>,
    /// 入力画像サイズ（正方形）
    pub image_size: usize,
    /// バッチサイズ
    pub batch_size: usize,
    /// 検証用に確保する割合
    pub validation_split: f64,
    /// エポック数
    pub num_epochs: usize,
    /// 学習率
    pub learning_rate: f64,
    /// ランダムシード
    pub seed: u64,
    /// データローダーのワーカー数
    pub num_workers: usize,
    /// 計算デバイス
    pub device_type: DeviceType,
    /// ネットワーク構成
    pub architecture: ArchitectureSettings,
    /// データ拡張
    pub augmentation: AugmentationSettings,
    /// L2正則化係数（0.0 は無し）
    pub l2_penalty: f64,
    /// 早期終了
    pub early_stopping: Option<EarlyStoppingSettings>,
    /// 学習率減衰
    pub reduce_lr_on_plateau: Option<PlateauSettings>,
    /// エポックごとの指標を書き出すディレクトリ
    pub log_dir: Option<PathBuf>,
    /// 出力バンドルのパス
    pub output_path: PathBuf,
    /// 重みを半精度で書き出すか
    pub optimize_export: bool,
    /// 学習後に保存するチェックポイント（拡張子なし）
    #[serde(default)]
    pub checkpoint_path: Option<PathBuf>,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self::baseline()
    }
}

impl TrainingConfig {
    /// 利用可能なプリセット名
    pub const PRESETS: [&'static str; 3] = ["baseline", "dog-photos", "regularized"];

    /// 設定ファイルのデフォルトパス
    pub fn default_path() -> PathBuf {
        PathBuf::from("training_config.json")
    }

    /// 猫と犬の写真で学習する基本構成
    pub fn baseline() -> Self {
        Self {
            data_dir: PathBuf::from("cat_and_dog_photos"),
            scan: Some(ScanAction::Report),
            image_size: 224,
            batch_size: 32,
            validation_split: 0.2,
            num_epochs: 20,
            learning_rate: 1e-3,
            seed: 42,
            num_workers: 4,
            device_type: DeviceType::default(),
            architecture: ArchitectureSettings::default(),
            augmentation: AugmentationSettings::default(),
            l2_penalty: 0.0,
            early_stopping: None,
            reduce_lr_on_plateau: None,
            log_dir: None,
            output_path: PathBuf::from("trained_model_cat_and_dog.tar.gz"),
            optimize_export: false,
            checkpoint_path: None,
        }
    }

    /// 犬の写真のみの構成（画像検証なし）
    pub fn dog_photos() -> Self {
        Self {
            data_dir: PathBuf::from("dog_photos"),
            scan: None,
            num_epochs: 10,
            output_path: PathBuf::from("trained_model_dog_photos.tar.gz"),
            ..Self::baseline()
        }
    }

    /// BatchNorm・ドロップアウト・L2・早期終了・学習率減衰を加えた構成
    pub fn regularized() -> Self {
        Self {
            scan: Some(ScanAction::Delete),
            num_epochs: 150,
            learning_rate: 5e-4,
            architecture: ArchitectureSettings {
                filters: vec![64, 128, 256],
                dense_units: 512,
                batch_norm: true,
                block_dropout: vec![0.3, 0.3, 0.0],
                dense_dropout: 0.5,
            },
            augmentation: AugmentationSettings {
                brightness_range: Some((0.8, 1.2)),
                channel_shift_range: 20.0,
                ..AugmentationSettings::default()
            },
            l2_penalty: 1e-4,
            early_stopping: Some(EarlyStoppingSettings {
                patience: 15,
                restore_best_weights: true,
            }),
            reduce_lr_on_plateau: Some(PlateauSettings {
                factor: 0.5,
                patience: 5,
                min_lr: 1e-7,
                min_delta: default_min_delta(),
            }),
            log_dir: Some(PathBuf::from("logs")),
            output_path: PathBuf::from("trained_model_cat_and_dog_v5.tar.gz"),
            optimize_export: true,
            ..Self::baseline()
        }
    }

    /// 名前からプリセットを取得
    pub fn preset(name: &str) -> Result<Self> {
        match name {
            "baseline" => Ok(Self::baseline()),
            "dog-photos" => Ok(Self::dog_photos()),
            "regularized" => Ok(Self::regularized()),
            other => anyhow::bail!(
                "Unknown preset '{}' (available: {})",
                other,
                Self::PRESETS.join(", ")
            ),
        }
    }

    /// 設定を読み込む
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config: {}", path.display()))?;
        let config: TrainingConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config: {}", path.display()))?;
        Ok(config)
    }

    /// 設定を保存する
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        fs::write(path.as_ref(), content)
            .with_context(|| format!("Failed to write config: {}", path.as_ref().display()))?;
        Ok(())
    }

    /// 値の整合性を確認する
    pub fn validate(&self) -> Result<()> {
        let arch = &self.architecture;
        if arch.filters.is_empty() {
            anyhow::bail!("architecture.filters must not be empty");
        }
        if arch.block_dropout.len() != arch.filters.len() {
            anyhow::bail!(
                "architecture.block_dropout has {} entries but there are {} conv blocks",
                arch.block_dropout.len(),
                arch.filters.len()
            );
        }
        for &p in arch.block_dropout.iter().chain(std::iter::once(&arch.dense_dropout)) {
            if !(0.0..1.0).contains(&p) {
                anyhow::bail!("dropout rate {} is outside [0, 1)", p);
            }
        }
        if arch.dense_units == 0 {
            anyhow::bail!("architecture.dense_units must be positive");
        }

        // 3x3 畳み込み (padding無し) と 2x2 プーリングでサイズが 0 にならないこと
        let mut size = self.image_size;
        for _ in &arch.filters {
            size = size.saturating_sub(2) / 2;
        }
        if size == 0 {
            anyhow::bail!(
                "image_size {} is too small for {} conv blocks",
                self.image_size,
                arch.filters.len()
            );
        }

        if self.batch_size == 0 {
            anyhow::bail!("batch_size must be positive");
        }
        if !(self.validation_split > 0.0 && self.validation_split < 1.0) {
            anyhow::bail!("validation_split must be in (0, 1), got {}", self.validation_split);
        }
        if self.num_epochs == 0 {
            anyhow::bail!("num_epochs must be positive");
        }
        if !(self.learning_rate > 0.0) {
            anyhow::bail!("learning_rate must be positive");
        }
        if self.l2_penalty < 0.0 {
            anyhow::bail!("l2_penalty must not be negative");
        }
        if let Some((low, high)) = self.augmentation.brightness_range {
            if !(low > 0.0 && low <= high) {
                anyhow::bail!("brightness_range ({}, {}) is invalid", low, high);
            }
        }
        if let Some(plateau) = &self.reduce_lr_on_plateau {
            if !(plateau.factor > 0.0 && plateau.factor < 1.0) {
                anyhow::bail!("reduce_lr_on_plateau.factor must be in (0, 1)");
            }
        }
        Ok(())
    }

    /// 設定情報を表示
    pub fn display(&self) {
        println!("=== 学習設定 ===");
        println!("データセット: {}", self.data_dir.display());
        match self.scan {
            Some(action) => println!("画像検証: {}", action),
            None => println!("画像検証: 除外のみ"),
        }
        println!("計算デバイス: {}", self.device_type);
        println!("入力サイズ: {}x{}", self.image_size, self.image_size);
        println!("\n--- ネットワーク ---");
        println!("フィルタ数: {:?}", self.architecture.filters);
        println!("全結合ユニット数: {}", self.architecture.dense_units);
        println!("BatchNorm: {}", self.architecture.batch_norm);
        println!("ブロックドロップアウト: {:?}", self.architecture.block_dropout);
        println!("全結合ドロップアウト: {}", self.architecture.dense_dropout);
        println!("\n--- トレーニング設定 ---");
        println!("エポック数: {}", self.num_epochs);
        println!("バッチサイズ: {}", self.batch_size);
        println!("学習率: {}", self.learning_rate);
        println!("検証割合: {}", self.validation_split);
        println!("L2係数: {}", self.l2_penalty);
        println!("シード: {}", self.seed);
        if let Some(es) = &self.early_stopping {
            println!("早期終了: patience={}, restore_best_weights={}", es.patience, es.restore_best_weights);
        }
        if let Some(p) = &self.reduce_lr_on_plateau {
            println!("学習率減衰: factor={}, patience={}, min_lr={}", p.factor, p.patience, p.min_lr);
        }
        if let Some(dir) = &self.log_dir {
            println!("ログ出力先: {}", dir.display());
        }
        println!("\n出力先: {} (最適化: {})", self.output_path.display(), self.optimize_export);
        println!("========================\n");
    }
}
