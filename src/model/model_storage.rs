//! モデルとメタデータの永続化
//!
//! Tar.gz形式でモデルとメタデータを1ファイルに統合して保存・読み込みします。
//!
//! ファイル構成（tar.gz内部）:
//! - metadata.json   - メタデータ（クラス名、入力形状、モデル設定など）
//! - model.bin       - モデルの重み（BinBytesRecorder、f32 または f16）

use anyhow::{Context, Result};
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use burn::{
    module::Module,
    record::{BinBytesRecorder, FullPrecisionSettings, HalfPrecisionSettings, Recorder},
    tensor::backend::Backend,
};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tar::{Archive, Builder};
use tracing::{debug, info};

use crate::ml::CatDogClassifier;
use crate::model::model_metadata::{ModelMetadata, WeightPrecision};

const METADATA_ENTRY: &str = "metadata.json";
const MODEL_ENTRY: &str = "model.bin";

/// 出力パスを .tar.gz に揃える
pub fn bundle_path(output_path: &Path) -> PathBuf {
    if output_path.extension().and_then(|s| s.to_str()) == Some("gz") {
        output_path.to_path_buf()
    } else {
        output_path.with_extension("tar.gz")
    }
}

/// モデルの重みをバイト列に変換
pub fn encode_weights<B: Backend>(
    model: &CatDogClassifier<B>,
    precision: WeightPrecision,
) -> Result<Vec<u8>> {
    let record = model.clone().into_record();
    let bytes = match precision {
        WeightPrecision::Full => BinBytesRecorder::<FullPrecisionSettings>::default().record(record, ()),
        WeightPrecision::Half => BinBytesRecorder::<HalfPrecisionSettings>::default().record(record, ()),
    };
    bytes.map_err(|e| anyhow::anyhow!("モデル重みのシリアライズエラー: {:?}", e))
}

/// バイト列から重みを復元したモデルを作成
pub fn decode_weights<B: Backend>(
    metadata: &ModelMetadata,
    model_binary: Vec<u8>,
    device: &B::Device,
) -> Result<CatDogClassifier<B>> {
    let model = metadata
        .model_config
        .try_init::<B>(device)
        .context("バンドルのモデル設定が不正です")?;
    let record = match metadata.precision {
        WeightPrecision::Full => BinBytesRecorder::<FullPrecisionSettings>::default().load(model_binary, device),
        WeightPrecision::Half => BinBytesRecorder::<HalfPrecisionSettings>::default().load(model_binary, device),
    }
    .map_err(|e| anyhow::anyhow!("モデル重みの読み込みエラー: {:?}", e))?;

    Ok(model.load_record(record))
}

/// 学習済みモデルをメタデータと共にTar.gz形式で書き出す
///
/// 重みは `metadata.precision` の精度で保存します。書き出したパスを返します。
pub fn export_bundle<B: Backend>(
    model: &CatDogClassifier<B>,
    metadata: &ModelMetadata,
    output_path: &Path,
) -> Result<PathBuf> {
    let model_binary = encode_weights(model, metadata.precision)?;
    debug!(
        "モデルバイナリサイズ: {} バイト ({:.2} MB, {})",
        model_binary.len(),
        model_binary.len() as f64 / 1024.0 / 1024.0,
        metadata.precision
    );
    save_model_with_metadata(output_path, metadata, &model_binary)
}

/// メタデータと共にモデルバイナリをTar.gz形式で保存
pub fn save_model_with_metadata(
    output_path: &Path,
    metadata: &ModelMetadata,
    model_binary: &[u8],
) -> Result<PathBuf> {
    let tar_gz_path = bundle_path(output_path);

    if let Some(parent) = tar_gz_path.parent() {
        std::fs::create_dir_all(parent)
            .context(format!("Failed to create parent directory: {:?}", parent))?;
    }

    let tar_gz_file = File::create(&tar_gz_path)
        .context(format!("Failed to create tar.gz file: {:?}", tar_gz_path))?;

    let encoder = GzEncoder::new(tar_gz_file, Compression::default());
    let mut tar_builder = Builder::new(encoder);

    let json_str = metadata.to_json_string()?;
    append_entry(&mut tar_builder, METADATA_ENTRY, json_str.as_bytes())?;
    append_entry(&mut tar_builder, MODEL_ENTRY, model_binary)?;

    tar_builder
        .into_inner()
        .context("Failed to finalize tar.gz archive")?
        .finish()
        .context("Failed to finish gzip stream")?;

    info!("モデルを保存しました: {}", tar_gz_path.display());
    Ok(tar_gz_path)
}

fn append_entry<W: std::io::Write>(builder: &mut Builder<W>, name: &str, data: &[u8]) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(name)?;
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append(&header, data)
        .with_context(|| format!("Failed to add {} to tar", name))
}

fn open_archive(tar_gz_path: &Path) -> Result<Archive<GzDecoder<File>>> {
    let tar_gz_file = File::open(tar_gz_path)
        .context(format!("Failed to open tar.gz file: {:?}", tar_gz_path))?;
    Ok(Archive::new(GzDecoder::new(tar_gz_file)))
}

/// Tar.gzからモデルメタデータを読み込む
pub fn load_metadata(tar_gz_path: &Path) -> Result<ModelMetadata> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(METADATA_ENTRY) {
            let mut json_str = String::new();
            entry.read_to_string(&mut json_str)?;
            return ModelMetadata::from_json_string(&json_str);
        }
    }

    Err(anyhow::anyhow!("metadata.json not found in tar.gz archive"))
}

/// Tar.gzからモデルバイナリを読み込む
pub fn load_model_binary(tar_gz_path: &Path) -> Result<Vec<u8>> {
    let mut archive = open_archive(tar_gz_path)?;

    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.path()?.to_str() == Some(MODEL_ENTRY) {
            let mut buffer = Vec::new();
            entry.read_to_end(&mut buffer)?;
            return Ok(buffer);
        }
    }

    Err(anyhow::anyhow!("model.bin not found in tar.gz archive"))
}

/// メタデータとモデルバイナリを共に読み込む
pub fn load_model_with_metadata(tar_gz_path: &Path) -> Result<(ModelMetadata, Vec<u8>)> {
    let mut archive = open_archive(tar_gz_path)?;

    let mut metadata_opt: Option<ModelMetadata> = None;
    let mut model_binary_opt: Option<Vec<u8>> = None;

    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_path_buf();

        match path.to_str() {
            Some(METADATA_ENTRY) => {
                let mut json_str = String::new();
                entry.read_to_string(&mut json_str)?;
                metadata_opt = Some(ModelMetadata::from_json_string(&json_str)?);
            }
            Some(MODEL_ENTRY) => {
                let mut buffer = Vec::new();
                entry.read_to_end(&mut buffer)?;
                model_binary_opt = Some(buffer);
            }
            _ => {}
        }
    }

    match (metadata_opt, model_binary_opt) {
        (Some(metadata), Some(binary)) => Ok((metadata, binary)),
        (None, _) => Err(anyhow::anyhow!("metadata.json not found in tar.gz archive")),
        (_, None) => Err(anyhow::anyhow!("model.bin not found in tar.gz archive")),
    }
}

/// バンドルを読み込んでモデルを復元する
pub fn load_bundle<B: Backend>(
    tar_gz_path: &Path,
    device: &B::Device,
) -> Result<(ModelMetadata, CatDogClassifier<B>)> {
    let (metadata, model_binary) = load_model_with_metadata(tar_gz_path)?;
    let model = decode_weights(&metadata, model_binary, device)
        .with_context(|| format!("Failed to restore weights from {}", tar_gz_path.display()))?;
    Ok((metadata, model))
}

/// メタデータをコンソールに表示
pub fn print_metadata_info(metadata: &ModelMetadata) {
    println!("\n=== モデルメタデータ ===");
    println!("クラス ({}): {}", metadata.num_classes, metadata.class_names.join(", "));
    println!(
        "入力形状: {}x{}x{}",
        metadata.input_shape[0], metadata.input_shape[1], metadata.input_shape[2]
    );
    println!("フィルタ数: {:?}", metadata.model_config.filters);
    println!("全結合ユニット数: {}", metadata.model_config.dense_units);
    println!("BatchNorm: {}", metadata.model_config.batch_norm);
    println!("重み精度: {}", metadata.precision);
    println!("学習エポック数: {}", metadata.epochs_run);
    if let Some(acc) = metadata.best_val_accuracy {
        println!("最良検証精度: {:.4}", acc);
    }
    println!("学習日時: {}", metadata.trained_at);
    println!("========================");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{ClassifierConfig, IMAGE_SIZE};
    use burn::tensor::Tensor;
    use burn_ndarray::NdArray;

    type TestBackend = NdArray<f32>;

    fn small_model(num_classes: usize) -> (ClassifierConfig, CatDogClassifier<TestBackend>) {
        let config = ClassifierConfig::new(num_classes, vec![4, 8, 8], vec![0.0; 3], 16);
        let model = config.init::<TestBackend>(&Default::default());
        (config, model)
    }

    fn classes(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("class_{}", i)).collect()
    }

    #[test]
    fn test_bundle_path_extension() {
        assert_eq!(bundle_path(Path::new("out/model")), PathBuf::from("out/model.tar.gz"));
        assert_eq!(bundle_path(Path::new("model.tar.gz")), PathBuf::from("model.tar.gz"));
    }

    #[test]
    fn test_export_and_reload_full_precision() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let (config, model) = small_model(2);
        let metadata = ModelMetadata::new(classes(2), config, WeightPrecision::Full, 3, Some(0.5));

        let written = export_bundle(&model, &metadata, &tmp.path().join("nested").join("model")).unwrap();
        assert!(written.ends_with("model.tar.gz"));

        let loaded_meta = load_metadata(&written).unwrap();
        assert_eq!(loaded_meta.num_classes, 2);
        assert!(!load_model_binary(&written).unwrap().is_empty());

        let (_, reloaded) = load_bundle::<TestBackend>(&written, &device).unwrap();
        let input = Tensor::<TestBackend, 4>::ones([1, 3, IMAGE_SIZE, IMAGE_SIZE], &device);
        let original = model.forward(input.clone()).into_data().to_vec::<f32>().unwrap();
        let restored = reloaded.forward(input).into_data().to_vec::<f32>().unwrap();

        assert_eq!(restored.len(), 2);
        for (a, b) in original.iter().zip(&restored) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_half_precision_bundle_is_smaller_and_close() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let (config, model) = small_model(3);
        let full = ModelMetadata::new(classes(3), config, WeightPrecision::Full, 1, None);
        let half = full.clone().with_precision(WeightPrecision::Half);

        let full_bytes = encode_weights(&model, WeightPrecision::Full).unwrap();
        let half_bytes = encode_weights(&model, WeightPrecision::Half).unwrap();
        assert!(half_bytes.len() < full_bytes.len());

        let written = export_bundle(&model, &half, &tmp.path().join("optimized.tar.gz")).unwrap();
        let (meta, reloaded) = load_bundle::<TestBackend>(&written, &device).unwrap();
        assert_eq!(meta.precision, WeightPrecision::Half);
        assert_eq!(reloaded.num_classes(), 3);

        let input = Tensor::<TestBackend, 4>::ones([1, 3, IMAGE_SIZE, IMAGE_SIZE], &device);
        let original = model.forward_softmax(input.clone()).into_data().to_vec::<f32>().unwrap();
        let restored = reloaded.forward_softmax(input).into_data().to_vec::<f32>().unwrap();
        for (a, b) in original.iter().zip(&restored) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn test_unbuildable_model_config_is_error() {
        let (config, model) = small_model(2);
        let mut metadata = ModelMetadata::new(classes(2), config, WeightPrecision::Full, 1, None);
        let bytes = encode_weights(&model, metadata.precision).unwrap();

        metadata.model_config.image_size = 8;
        let result = decode_weights::<TestBackend>(&metadata, bytes, &Default::default());
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_entries_are_errors() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("empty.tar.gz");
        let encoder = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        let builder = Builder::new(encoder);
        builder.into_inner().unwrap().finish().unwrap();

        assert!(load_metadata(&path).is_err());
        assert!(load_model_binary(&path).is_err());
        assert!(load_bundle::<TestBackend>(&path, &Default::default()).is_err());
    }
}
