//! 機械学習モデルの共通定義
//!
//! 猫・犬写真分類用のCNNモデルと関連する設定を提供します。

use burn::{
    config::Config,
    module::Module,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, Relu,
    },
    tensor::{activation::softmax, backend::Backend, Int, Tensor},
    train::ClassificationOutput,
};
use tracing::debug;

use crate::model::config::ArchitectureSettings;

/// 入力チャネル数 (RGB)
pub const INPUT_CHANNELS: usize = 3;

/// デフォルトの入力画像サイズ
pub const IMAGE_SIZE: usize = 224;

/// モデル設定
#[derive(Config, Debug)]
pub struct ClassifierConfig {
    /// 分類クラス数
    pub num_classes: usize,
    /// 畳み込みブロックごとのフィルタ数
    pub filters: Vec<usize>,
    /// ブロックごとのドロップアウト率（0.0 は無し）
    pub block_dropout: Vec<f64>,
    /// 全結合層のユニット数
    pub dense_units: usize,
    /// 入力画像サイズ（正方形）
    #[config(default = 224)]
    pub image_size: usize,
    /// 畳み込み後にBatchNormを入れるか
    #[config(default = false)]
    pub batch_norm: bool,
    /// 全結合層後のドロップアウト率
    #[config(default = 0.0)]
    pub dense_dropout: f64,
}

impl ClassifierConfig {
    /// 学習設定のネットワーク構成から作成
    pub fn from_settings(arch: &ArchitectureSettings, image_size: usize, num_classes: usize) -> Self {
        ClassifierConfig::new(
            num_classes,
            arch.filters.clone(),
            arch.block_dropout.clone(),
            arch.dense_units,
        )
        .with_image_size(image_size)
        .with_batch_norm(arch.batch_norm)
        .with_dense_dropout(arch.dense_dropout)
    }

    /// 最後のブロック出力の一辺のサイズ
    ///
    /// 各ブロックは Conv 3x3 (padding無し) で 2 減り、MaxPool 2x2 で半分（切り捨て）になります。
    /// 224 → 222 → 111 → 109 → 54 → 52 → 26
    pub fn feature_map_size(&self) -> Option<usize> {
        let mut size = self.image_size;
        for _ in &self.filters {
            size = size.saturating_sub(2) / 2;
        }
        (size > 0).then_some(size)
    }

    /// Flatten後の特徴次元
    pub fn flattened_features(&self) -> Option<usize> {
        let last = *self.filters.last()?;
        self.feature_map_size().map(|s| last * s * s)
    }

    /// 構造として成立する設定か確認する
    ///
    /// ファイルから読んだ設定は [`init`](Self::init) の前にこれを通します。
    pub fn check(&self) -> anyhow::Result<()> {
        if self.num_classes == 0 {
            anyhow::bail!("num_classes must be positive");
        }
        if self.dense_units == 0 {
            anyhow::bail!("dense_units must be positive");
        }
        if self.filters.is_empty() || self.filters.contains(&0) {
            anyhow::bail!("filters must be non-empty and positive: {:?}", self.filters);
        }
        if self.flattened_features().is_none() {
            anyhow::bail!(
                "image_size {} is too small for {} conv blocks",
                self.image_size,
                self.filters.len()
            );
        }
        Ok(())
    }

    /// [`check`](Self::check) してからモデルを初期化
    pub fn try_init<B: Backend>(&self, device: &B::Device) -> anyhow::Result<CatDogClassifier<B>> {
        self.check()?;
        Ok(self.init(device))
    }

    /// モデルを初期化
    ///
    /// # Panics
    ///
    /// 入力サイズがブロック数に対して小さすぎる場合。
    pub fn init<B: Backend>(&self, device: &B::Device) -> CatDogClassifier<B> {
        let d = self.flattened_features().unwrap_or_else(|| {
            panic!(
                "入力サイズが小さすぎます: {} ({} ブロック)",
                self.image_size,
                self.filters.len()
            )
        });

        let mut blocks = Vec::with_capacity(self.filters.len());
        let mut in_channels = INPUT_CHANNELS;
        for (i, &out_channels) in self.filters.iter().enumerate() {
            let dropout = self.block_dropout.get(i).copied().unwrap_or(0.0);
            blocks.push(ConvBlock::new(in_channels, out_channels, self.batch_norm, dropout, device));
            in_channels = out_channels;
        }

        debug!("[Model] 入力サイズ: {}x{}", self.image_size, self.image_size);
        debug!("[Model] フィルタ: {:?}", self.filters);
        debug!("[Model] Flatten後の特徴次元 d: {}", d);
        debug!("[Model] FC1: {} -> {}", d, self.dense_units);
        debug!("[Model] FC2: {} -> {}", self.dense_units, self.num_classes);

        CatDogClassifier {
            blocks,
            fc1: LinearConfig::new(d, self.dense_units).init(device),
            dense_dropout: (self.dense_dropout > 0.0)
                .then(|| DropoutConfig::new(self.dense_dropout).init()),
            fc2: LinearConfig::new(self.dense_units, self.num_classes).init(device),
            activation: Relu::new(),
        }
    }
}

/// Conv 3x3 + ReLU → [BatchNorm] → MaxPool 2x2 → [Dropout]
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    conv: Conv2d<B>,
    norm: Option<BatchNorm<B>>,
    pool: MaxPool2d,
    dropout: Option<Dropout>,
    activation: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        batch_norm: bool,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        Self {
            conv: Conv2dConfig::new([in_channels, out_channels], [3, 3])
                .with_stride([1, 1])
                .init(device),
            norm: batch_norm.then(|| BatchNormConfig::new(out_channels).init(device)),
            pool: MaxPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            dropout: (dropout > 0.0).then(|| DropoutConfig::new(dropout).init()),
            activation: Relu::new(),
        }
    }

    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.activation.forward(x);
        let x = match &self.norm {
            Some(norm) => norm.forward(x),
            None => x,
        };
        let x = self.pool.forward(x);
        match &self.dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        }
    }
}

/// 猫・犬写真分類用CNNモデル
///
/// # アーキテクチャ
/// - {Conv 3x3 + ReLU → [BatchNorm] → MaxPool 2x2 → [Dropout]} x ブロック数
/// - Flatten
/// - FC: d -> dense_units + ReLU → [Dropout]
/// - FC: dense_units -> num_classes
/// - Softmax (分類時)
#[derive(Module, Debug)]
pub struct CatDogClassifier<B: Backend> {
    blocks: Vec<ConvBlock<B>>,
    fc1: Linear<B>,
    dense_dropout: Option<Dropout>,
    fc2: Linear<B>,
    activation: Relu,
}

impl<B: Backend> CatDogClassifier<B> {
    /// 順伝播
    ///
    /// # 引数
    /// - `images`: バッチ画像 [batch_size, 3, size, size]
    ///
    /// # 戻り値
    /// - クラスごとのロジット [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, _, _, _] = images.dims();

        let mut x = images;
        for block in &self.blocks {
            x = block.forward(x);
        }

        let [_, c, h, w] = x.dims();
        let x = x.reshape([batch_size, c * h * w]);

        let x = self.fc1.forward(x);
        let x = self.activation.forward(x);
        let x = match &self.dense_dropout {
            Some(dropout) => dropout.forward(x),
            None => x,
        };

        self.fc2.forward(x)
    }

    /// クラス確率 [batch_size, num_classes]
    pub fn forward_softmax(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        softmax(self.forward(images), 1)
    }

    /// 順伝播と損失計算（学習用）
    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// 出力クラス数
    pub fn num_classes(&self) -> usize {
        self.fc2.weight.val().dims()[1]
    }

    /// 畳み込みブロック数
    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }
}
