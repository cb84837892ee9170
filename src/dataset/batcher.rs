//! 画像パスのバッチをテンソルに変換する

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{backend::Backend, Int, Tensor},
};
use image::RgbImage;
use tracing::warn;

use crate::dataset::augmentation::{load_image, Augmenter};
use crate::dataset::photo_dataset::PhotoItem;

/// バッチデータ
#[derive(Clone, Debug)]
pub struct PhotoBatch<B: Backend> {
    /// [batch_size, 3, size, size]、値域 0.0〜1.0
    pub images: Tensor<B, 4>,
    pub targets: Tensor<B, 1, Int>,
}

/// バッチャー
///
/// `augmenter` を持つのは学習用のみ。検証用は読み込みとリサイズだけ行います。
#[derive(Clone)]
pub struct PhotoBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
    augmenter: Option<Augmenter>,
}

impl<B: Backend> PhotoBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self {
            device,
            image_size,
            augmenter: None,
        }
    }

    pub fn with_augmenter(mut self, augmenter: Augmenter) -> Self {
        self.augmenter = Some(augmenter);
        self
    }
}

/// RGB画像を 1/255 でスケーリングし (C, H, W) の順で平坦化して追加
pub fn push_chw(img: &RgbImage, out: &mut Vec<f32>) {
    let (width, height) = img.dimensions();
    for channel in 0..3 {
        for y in 0..height {
            for x in 0..width {
                out.push(img.get_pixel(x, y)[channel] as f32 / 255.0);
            }
        }
    }
}

impl<B: Backend> Batcher<B, PhotoItem, PhotoBatch<B>> for PhotoBatcher<B> {
    fn batch(&self, items: Vec<PhotoItem>, _device: &B::Device) -> PhotoBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;
        let mut all_pixels = Vec::with_capacity(batch_size * 3 * size * size);
        let mut targets_vec = Vec::with_capacity(batch_size);
        let mut rng = rand::thread_rng();

        for item in items {
            match load_image(&item.path, size) {
                Ok(img) => {
                    let img = match &self.augmenter {
                        Some(augmenter) => augmenter.augment(&img, &mut rng),
                        None => img,
                    };
                    push_chw(&img, &mut all_pixels);
                }
                Err(e) => {
                    warn!("画像読み込み失敗 {}: {}", item.path.display(), e);
                    // エラーの場合はゼロで埋める
                    all_pixels.extend(std::iter::repeat(0.0f32).take(3 * size * size));
                }
            }
            targets_vec.push(item.label as i64);
        }

        let images = Tensor::<B, 1>::from_floats(all_pixels.as_slice(), &self.device)
            .reshape([batch_size, 3, size, size]);
        let targets = Tensor::<B, 1, Int>::from_ints(targets_vec.as_slice(), &self.device);

        PhotoBatch { images, targets }
    }
}
