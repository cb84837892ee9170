//! モデル学習
//!
//! 画像検証 → データセット構築 → 分割 → 学習 → チェックポイント → バンドル書き出し
//! までを [`run_training`] で一括実行します。

use anyhow::Result;
use std::path::PathBuf;

use burn::{
    backend::{Autodiff, Wgpu},
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{decay::WeightDecayConfig, AdamConfig, GradientsParams, Optimizer},
    tensor::{
        backend::{AutodiffBackend, Backend},
        ElementConversion, Int, Tensor,
    },
};
use burn_ndarray::{NdArray, NdArrayDevice};
use burn_wgpu::WgpuDevice;
use tracing::{info, warn};

use crate::dataset::{Augmenter, PhotoBatcher, PhotoDataset};
use crate::ml::callbacks::{EarlyStopping, ReduceLrOnPlateau, StopDecision};
use crate::ml::ml_model::{CatDogClassifier, ClassifierConfig};
use crate::ml::run_log::{EpochMetrics, RunLogger};
use crate::model::checkpoint::{save_checkpoint, CheckpointInfo};
use crate::model::config::{DeviceType, TrainingConfig};
use crate::model::model_metadata::{ModelMetadata, WeightPrecision};
use crate::model::model_storage::export_bundle;
use crate::scan::{scan_directory, ScanAction};

/// 学習ループの結果
pub struct TrainingOutcome<B: Backend> {
    /// 学習済みモデル（早期終了で復元した場合は最良エポックの重み）
    pub model: CatDogClassifier<B>,
    pub history: Vec<EpochMetrics>,
    pub best_val_accuracy: Option<f64>,
    pub stopped_early: bool,
    /// 指標CSVのパス
    pub log_path: Option<PathBuf>,
}

impl<B: Backend> TrainingOutcome<B> {
    pub fn epochs_run(&self) -> usize {
        self.history.len()
    }
}

/// [`run_training`] の結果
#[derive(Debug, Clone)]
pub struct TrainingSummary {
    /// 書き出したバンドル
    pub output_path: PathBuf,
    pub checkpoint_path: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub class_names: Vec<String>,
    pub train_samples: usize,
    pub valid_samples: usize,
    /// 検証で不正と判定された画像数
    pub invalid_images: usize,
    pub epochs_run: usize,
    pub best_val_accuracy: Option<f64>,
    pub stopped_early: bool,
}

/// エポック内の損失・正解数の集計
#[derive(Debug, Default)]
struct EpochTotals {
    loss_sum: f64,
    correct: usize,
    seen: usize,
}

impl EpochTotals {
    fn add<B: Backend>(&mut self, loss: f64, logits: Tensor<B, 2>, targets: Tensor<B, 1, Int>) {
        let n = targets.dims()[0];
        let correct = logits
            .argmax(1)
            .reshape([n])
            .equal(targets)
            .int()
            .sum()
            .into_scalar()
            .elem::<i64>();

        // バッチ平均の損失をサンプル数で重み付け
        self.loss_sum += loss * n as f64;
        self.correct += correct as usize;
        self.seen += n;
    }

    fn loss(&self) -> f64 {
        self.loss_sum / self.seen.max(1) as f64
    }

    fn accuracy(&self) -> f64 {
        self.correct as f64 / self.seen.max(1) as f64
    }
}

/// 分類器を学習する
///
/// 学習は `B` (Autodiff) 上、検証は `B::InnerBackend` 上で行います。
/// 学習率減衰と早期終了は設定されている場合のみ有効です。
pub fn train_classifier<B: AutodiffBackend>(
    config: &TrainingConfig,
    model_config: &ClassifierConfig,
    train_set: PhotoDataset,
    valid_set: PhotoDataset,
    device: &B::Device,
) -> Result<TrainingOutcome<B::InnerBackend>> {
    if train_set.is_empty() {
        anyhow::bail!("Training subset is empty");
    }
    if valid_set.is_empty() {
        anyhow::bail!(
            "Validation subset is empty: each class needs at least {} images for validation_split={}",
            (1.0 / config.validation_split).ceil() as usize,
            config.validation_split
        );
    }

    let batcher_train = PhotoBatcher::<B>::new(device.clone(), config.image_size)
        .with_augmenter(Augmenter::new(config.augmentation.clone()));
    let batcher_valid = PhotoBatcher::<B::InnerBackend>::new(device.clone(), config.image_size);

    let dataloader_train = DataLoaderBuilder::new(batcher_train)
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers.max(1))
        .build(train_set);

    let dataloader_valid = DataLoaderBuilder::new(batcher_valid)
        .batch_size(config.batch_size)
        .num_workers(config.num_workers.max(1))
        .build(valid_set);

    let mut optimizer_config = AdamConfig::new();
    if config.l2_penalty > 0.0 {
        // 損失に l2 * ||w||^2 を加えるのと同じ勾配になる
        optimizer_config = optimizer_config
            .with_weight_decay(Some(WeightDecayConfig::new((2.0 * config.l2_penalty) as f32)));
    }
    let mut optimizer = optimizer_config.init();

    let mut model = model_config.init::<B>(device);
    let mut lr = config.learning_rate;
    let mut early_stopping: Option<EarlyStopping<CatDogClassifier<B::InnerBackend>>> =
        config.early_stopping.as_ref().map(EarlyStopping::new);
    let mut plateau = config
        .reduce_lr_on_plateau
        .as_ref()
        .map(|settings| ReduceLrOnPlateau::new(settings, config.learning_rate));
    let mut run_logger = match &config.log_dir {
        Some(dir) => Some(RunLogger::create(dir)?),
        None => None,
    };

    let mut history = Vec::with_capacity(config.num_epochs);
    let mut best_val_accuracy: Option<f64> = None;

    info!("学習を開始します...");
    info!("エポック数: {}, バッチサイズ: {}, 学習率: {}", config.num_epochs, config.batch_size, lr);

    for epoch in 1..=config.num_epochs {
        let mut train_totals = EpochTotals::default();
        for batch in dataloader_train.iter() {
            let output = model.forward_classification(batch.images, batch.targets);
            let loss_value = output.loss.clone().into_scalar().elem::<f64>();
            train_totals.add(loss_value, output.output, output.targets);

            let grads = output.loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = optimizer.step(lr, model, grads);
        }

        let model_valid = model.valid();
        let mut valid_totals = EpochTotals::default();
        for batch in dataloader_valid.iter() {
            let output = model_valid.forward_classification(batch.images, batch.targets);
            let loss_value = output.loss.into_scalar().elem::<f64>();
            valid_totals.add(loss_value, output.output, output.targets);
        }

        let metrics = EpochMetrics {
            epoch,
            train_loss: train_totals.loss(),
            train_accuracy: train_totals.accuracy(),
            val_loss: valid_totals.loss(),
            val_accuracy: valid_totals.accuracy(),
            learning_rate: lr,
        };
        info!(
            "Epoch {}/{} - loss: {:.4} - accuracy: {:.4} - val_loss: {:.4} - val_accuracy: {:.4} - lr: {:.2e}",
            epoch,
            config.num_epochs,
            metrics.train_loss,
            metrics.train_accuracy,
            metrics.val_loss,
            metrics.val_accuracy,
            lr
        );
        if let Some(logger) = run_logger.as_mut() {
            logger.log(&metrics)?;
        }

        if best_val_accuracy.map_or(true, |best| metrics.val_accuracy > best) {
            best_val_accuracy = Some(metrics.val_accuracy);
        }

        if let Some(plateau) = plateau.as_mut() {
            let next_lr = plateau.step(metrics.val_loss);
            if next_lr < lr {
                info!("ReduceLROnPlateau: 学習率を {:.2e} に下げます", next_lr);
            }
            lr = next_lr;
        }

        let val_accuracy = metrics.val_accuracy;
        history.push(metrics);

        if let Some(es) = early_stopping.as_mut() {
            if es.step(epoch, val_accuracy, || model_valid.clone()) == StopDecision::Stop {
                info!("早期終了: {} エポックで停止しました", epoch);
                break;
            }
        }
    }

    let last = model.valid();
    let (model, stopped_early) = match early_stopping {
        Some(es) => {
            let stopped = es.stopped();
            if stopped && es.restore_best_weights() {
                if let Some((epoch, acc)) = es.best() {
                    info!("エポック {} の重みを復元します (val_accuracy: {:.4})", epoch, acc);
                }
            }
            (es.finish(last), stopped)
        }
        None => (last, false),
    };

    Ok(TrainingOutcome {
        model,
        history,
        best_val_accuracy,
        stopped_early,
        log_path: run_logger.map(|logger| logger.path().to_path_buf()),
    })
}

/// 設定に従って学習全体を実行する
pub fn run_training(config: &TrainingConfig) -> Result<TrainingSummary> {
    config.validate()?;

    // scan が未設定でも、デコードできない画像はローダーに渡さない
    let action = config.scan.unwrap_or(ScanAction::Report);
    let report = scan_directory(&config.data_dir, action)?;
    if !report.delete_failures.is_empty() {
        warn!("{} 件の不正画像を削除できませんでした", report.delete_failures.len());
    }
    let excluded = report.excluded();
    let invalid_images = report.invalid.len();

    let dataset = PhotoDataset::from_directory(&config.data_dir, &excluded)?;
    let class_names = dataset.class_names().to_vec();
    for (name, count) in class_names.iter().zip(dataset.class_counts()) {
        info!("  クラス '{}': {} 枚", name, count);
    }

    let (train_set, valid_set) = dataset.split(config.validation_split);
    info!("学習データ: {} 枚", train_set.len());
    info!("検証データ: {} 枚", valid_set.len());

    let model_config =
        ClassifierConfig::from_settings(&config.architecture, config.image_size, class_names.len());

    info!("使用デバイス: {}", config.device_type);
    let mut summary = match config.device_type {
        DeviceType::Wgpu => {
            let device = WgpuDevice::default();
            train_and_export::<Autodiff<Wgpu>>(config, model_config, class_names, train_set, valid_set, &device)?
        }
        DeviceType::Cpu => {
            let device = NdArrayDevice::Cpu;
            train_and_export::<Autodiff<NdArray>>(config, model_config, class_names, train_set, valid_set, &device)?
        }
    };
    summary.invalid_images = invalid_images;
    Ok(summary)
}

fn train_and_export<B: AutodiffBackend>(
    config: &TrainingConfig,
    model_config: ClassifierConfig,
    class_names: Vec<String>,
    train_set: PhotoDataset,
    valid_set: PhotoDataset,
    device: &B::Device,
) -> Result<TrainingSummary> {
    let train_samples = train_set.len();
    let valid_samples = valid_set.len();

    let outcome = train_classifier::<B>(config, &model_config, train_set, valid_set, device)?;
    let epochs_run = outcome.epochs_run();

    let checkpoint_path = match &config.checkpoint_path {
        Some(path) => {
            let info = CheckpointInfo {
                class_names: class_names.clone(),
                model_config: model_config.clone(),
                epochs_run,
                best_val_accuracy: outcome.best_val_accuracy,
            };
            Some(save_checkpoint(&outcome.model, &info, path)?)
        }
        None => None,
    };

    let metadata = ModelMetadata::new(
        class_names.clone(),
        model_config,
        WeightPrecision::from_optimize(config.optimize_export),
        epochs_run,
        outcome.best_val_accuracy,
    );
    let output_path = export_bundle(&outcome.model, &metadata, &config.output_path)?;

    Ok(TrainingSummary {
        output_path,
        checkpoint_path,
        log_path: outcome.log_path,
        class_names,
        train_samples,
        valid_samples,
        invalid_images: 0,
        epochs_run,
        best_val_accuracy: outcome.best_val_accuracy,
        stopped_early: outcome.stopped_early,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::config::{ArchitectureSettings, EarlyStoppingSettings, PlateauSettings};
    use crate::model::model_storage::load_bundle;
    use image::{Rgb, RgbImage};
    use std::collections::HashSet;
    use std::fs;
    use std::path::Path;

    type TestBackend = Autodiff<NdArray<f32>>;

    fn make_photos(root: &Path, per_class: usize) {
        for (c, class) in ["cats", "dogs"].iter().enumerate() {
            let dir = root.join(class);
            fs::create_dir_all(&dir).unwrap();
            for i in 0..per_class {
                let shade = (i * 20) as u8;
                let color = if c == 0 { Rgb([shade, 10, 200]) } else { Rgb([200, shade, 10]) };
                RgbImage::from_pixel(40, 36, color)
                    .save(dir.join(format!("{:03}.png", i)))
                    .unwrap();
            }
        }
    }

    fn tiny_config(root: &Path) -> TrainingConfig {
        TrainingConfig {
            data_dir: root.join("photos"),
            image_size: 32,
            batch_size: 4,
            num_epochs: 2,
            num_workers: 1,
            device_type: DeviceType::Cpu,
            architecture: ArchitectureSettings {
                filters: vec![4, 4],
                dense_units: 8,
                batch_norm: false,
                block_dropout: vec![0.0, 0.0],
                dense_dropout: 0.0,
            },
            output_path: root.join("out").join("model"),
            ..TrainingConfig::baseline()
        }
    }

    #[test]
    fn test_run_training_end_to_end() {
        let tmp = tempfile::TempDir::new().unwrap();
        make_photos(&tmp.path().join("photos"), 10);
        fs::write(tmp.path().join("photos").join("cats").join("broken.jpg"), b"not a jpeg").unwrap();

        let mut config = tiny_config(tmp.path());
        config.scan = Some(ScanAction::Report);
        config.checkpoint_path = Some(tmp.path().join("ckpt").join("model"));
        config.log_dir = Some(tmp.path().join("logs"));

        let summary = run_training(&config).unwrap();

        assert_eq!(summary.invalid_images, 1);
        assert_eq!(summary.class_names, vec!["cats", "dogs"]);
        assert_eq!(summary.train_samples + summary.valid_samples, 20);
        assert_eq!(summary.valid_samples, 4);
        assert_eq!(summary.epochs_run, 2);
        assert!(summary.output_path.exists());
        assert!(summary.checkpoint_path.as_ref().unwrap().exists());
        // 壊れた画像は report モードでは残る
        assert!(tmp.path().join("photos").join("cats").join("broken.jpg").exists());

        let log = fs::read_to_string(summary.log_path.unwrap()).unwrap();
        assert_eq!(log.lines().count(), 3);

        let (metadata, model) =
            load_bundle::<NdArray<f32>>(&summary.output_path, &Default::default()).unwrap();
        assert_eq!(metadata.num_classes, 2);
        assert_eq!(metadata.input_shape, [32, 32, 3]);
        assert_eq!(model.num_classes(), 2);
    }

    #[test]
    fn test_train_classifier_with_callbacks() {
        let tmp = tempfile::TempDir::new().unwrap();
        make_photos(&tmp.path().join("photos"), 5);

        let mut config = tiny_config(tmp.path());
        config.num_epochs = 4;
        config.l2_penalty = 1e-4;
        config.early_stopping = Some(EarlyStoppingSettings {
            patience: 1,
            restore_best_weights: true,
        });
        config.reduce_lr_on_plateau = Some(PlateauSettings {
            factor: 0.5,
            patience: 1,
            min_lr: 1e-7,
            min_delta: 1e-4,
        });

        let dataset = PhotoDataset::from_directory(&config.data_dir, &HashSet::new()).unwrap();
        let (train_set, valid_set) = dataset.split(config.validation_split);
        let model_config = ClassifierConfig::from_settings(&config.architecture, config.image_size, 2);

        let outcome =
            train_classifier::<TestBackend>(&config, &model_config, train_set, valid_set, &Default::default())
                .unwrap();

        assert!(outcome.epochs_run() >= 1 && outcome.epochs_run() <= 4);
        assert!(outcome.best_val_accuracy.is_some());
        for metrics in &outcome.history {
            assert!(metrics.val_accuracy >= 0.0 && metrics.val_accuracy <= 1.0);
            assert!(metrics.learning_rate <= config.learning_rate);
        }
        if !outcome.stopped_early {
            assert_eq!(outcome.epochs_run(), 4);
        }
    }

    #[test]
    fn test_broken_images_excluded_without_scan() {
        let tmp = tempfile::TempDir::new().unwrap();
        make_photos(&tmp.path().join("photos"), 10);
        let broken = tmp.path().join("photos").join("dogs").join("broken.jpg");
        fs::write(&broken, b"\xff\xd8 truncated").unwrap();

        let mut config = TrainingConfig {
            num_epochs: 1,
            ..tiny_config(tmp.path())
        };
        config.scan = TrainingConfig::dog_photos().scan;
        assert_eq!(config.scan, None);

        let summary = run_training(&config).unwrap();

        assert_eq!(summary.invalid_images, 1);
        assert_eq!(summary.train_samples + summary.valid_samples, 20);
        // 削除はしない
        assert!(broken.exists());
    }

    #[test]
    fn test_early_stop_restores_and_lowers_lr() {
        let tmp = tempfile::TempDir::new().unwrap();
        make_photos(&tmp.path().join("photos"), 5);

        // 学習率がほぼ 0 なので検証指標は変化しない
        let mut config = tiny_config(tmp.path());
        config.num_epochs = 6;
        config.learning_rate = 1e-12;
        config.l2_penalty = 0.0;
        config.early_stopping = Some(EarlyStoppingSettings {
            patience: 2,
            restore_best_weights: true,
        });
        config.reduce_lr_on_plateau = Some(PlateauSettings {
            factor: 0.5,
            patience: 1,
            min_lr: 1e-15,
            min_delta: 1e-4,
        });

        let dataset = PhotoDataset::from_directory(&config.data_dir, &HashSet::new()).unwrap();
        let (train_set, valid_set) = dataset.split(config.validation_split);
        let model_config = ClassifierConfig::from_settings(&config.architecture, config.image_size, 2);

        let outcome =
            train_classifier::<TestBackend>(&config, &model_config, train_set, valid_set, &Default::default())
                .unwrap();

        assert!(outcome.stopped_early);
        assert_eq!(outcome.epochs_run(), 3);
        // 各エポックの記録はそのエポックで使った学習率
        assert_eq!(outcome.history[0].learning_rate, 1e-12);
        assert_eq!(outcome.history[1].learning_rate, 1e-12);
        assert!(outcome.history[2].learning_rate < outcome.history[0].learning_rate);
        assert_eq!(outcome.best_val_accuracy, Some(outcome.history[0].val_accuracy));
        assert_eq!(outcome.model.num_classes(), 2);
    }

    #[test]
    fn test_empty_validation_subset_is_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        make_photos(&tmp.path().join("photos"), 4);

        // 1クラス4枚では floor(4 * 0.2) = 0 枚
        let config = tiny_config(tmp.path());
        let err = run_training(&config).unwrap_err();
        assert!(err.to_string().contains("Validation subset is empty"));
    }
}
