//! モデル推論機能

use anyhow::Result;
use std::path::Path;

use burn::tensor::{backend::Backend, Tensor};

use crate::dataset::{batcher::push_chw, load_image};
use crate::ml::ml_model::{CatDogClassifier, INPUT_CHANNELS};
use crate::model::{load_bundle, ModelMetadata};

/// 1枚分の分類結果
#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_name: String,
    pub class_index: usize,
    /// softmax 確率
    pub confidence: f32,
}

/// 推論エンジン
pub struct InferenceEngine<B: Backend> {
    model: CatDogClassifier<B>,
    metadata: ModelMetadata,
    device: B::Device,
}

impl<B: Backend> InferenceEngine<B> {
    /// バンドルを読み込んで推論エンジンを初期化
    pub fn load<P: AsRef<Path>>(model_path: P, device: B::Device) -> Result<Self> {
        let (metadata, model) = load_bundle::<B>(model_path.as_ref(), &device)?;
        Ok(Self {
            model,
            metadata,
            device,
        })
    }

    /// 入力形状 [バッチ, チャネル, 高さ, 幅]
    pub fn input_shape(&self) -> [usize; 4] {
        let [height, width, _] = self.metadata.input_shape;
        [1, INPUT_CHANNELS, height, width]
    }

    pub fn num_classes(&self) -> usize {
        self.model.num_classes()
    }

    pub fn metadata(&self) -> &ModelMetadata {
        &self.metadata
    }

    /// 前処理済みテンソル [N, 3, H, W] のクラス確率
    pub fn predict_tensor(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        self.model.forward_softmax(images)
    }

    /// 単一画像を分類
    pub fn classify_image<P: AsRef<Path>>(&self, image_path: P) -> Result<Prediction> {
        let [_, channels, size, _] = self.input_shape();

        // 学習時と同じ前処理（リサイズ + 1/255）
        let img = load_image(image_path.as_ref(), size)?;
        let mut pixels = Vec::with_capacity(channels * size * size);
        push_chw(&img, &mut pixels);

        let tensor = Tensor::<B, 1>::from_floats(pixels.as_slice(), &self.device)
            .reshape([1, channels, size, size]);

        let probs = self
            .predict_tensor(tensor)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| anyhow::anyhow!("推論結果の取得エラー: {:?}", e))?;

        let (class_index, confidence) = probs
            .iter()
            .copied()
            .enumerate()
            .max_by(|a, b| a.1.total_cmp(&b.1))
            .ok_or_else(|| anyhow::anyhow!("モデル出力が空です"))?;

        let class_name = self
            .metadata
            .class_name(class_index)
            .ok_or_else(|| anyhow::anyhow!("クラスインデックス {} は範囲外です", class_index))?
            .to_string();

        Ok(Prediction {
            class_name,
            class_index,
            confidence,
        })
    }

    /// 複数画像をバッチ分類
    pub fn classify_batch(&self, image_paths: &[impl AsRef<Path>]) -> Result<Vec<Prediction>> {
        image_paths.iter().map(|path| self.classify_image(path)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ml::{ClassifierConfig, IMAGE_SIZE};
    use crate::model::{export_bundle, WeightPrecision};
    use burn_ndarray::NdArray;
    use image::{Rgb, RgbImage};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_classify_exported_bundle() {
        let tmp = tempfile::TempDir::new().unwrap();
        let device = Default::default();
        let config = ClassifierConfig::new(2, vec![4, 8, 8], vec![0.0; 3], 16);
        let model = config.init::<TestBackend>(&device);
        let metadata = ModelMetadata::new(
            vec!["cats".to_string(), "dogs".to_string()],
            config,
            WeightPrecision::Full,
            1,
            None,
        );
        let bundle = export_bundle(&model, &metadata, &tmp.path().join("model")).unwrap();

        let engine = InferenceEngine::<TestBackend>::load(&bundle, device).unwrap();
        assert_eq!(engine.input_shape(), [1, 3, IMAGE_SIZE, IMAGE_SIZE]);
        assert_eq!(engine.num_classes(), 2);
        assert_eq!(engine.metadata().class_names, vec!["cats", "dogs"]);

        let image_path = tmp.path().join("pet.png");
        RgbImage::from_pixel(300, 200, Rgb([120, 80, 40])).save(&image_path).unwrap();

        let prediction = engine.classify_image(&image_path).unwrap();
        assert!(prediction.class_index < 2);
        assert!(["cats", "dogs"].contains(&prediction.class_name.as_str()));
        assert!(prediction.confidence >= 0.5 && prediction.confidence <= 1.0);

        let batch = engine.classify_batch(&[&image_path, &image_path]).unwrap();
        assert_eq!(batch[0], batch[1]);
        assert!(engine.classify_image(tmp.path().join("missing.png")).is_err());
    }
}
