//! 画像の読み込みとデータ拡張
//!
//! 学習サブセットにだけ適用するランダム変換を提供します。
//! 変換の順序は アフィン変換 → チャネルシフト → 左右反転 → 明るさ です。

use anyhow::{Context, Result};
use image::{imageops::FilterType, Rgb, RgbImage};
use rand::Rng;
use std::path::Path;

use crate::model::config::AugmentationSettings;

type Mat3 = [[f32; 3]; 3];

const IDENTITY: Mat3 = [[1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]];

fn mat_mul(a: &Mat3, b: &Mat3) -> Mat3 {
    let mut out = [[0.0f32; 3]; 3];
    for i in 0..3 {
        for j in 0..3 {
            out[i][j] = (0..3).map(|k| a[i][k] * b[k][j]).sum();
        }
    }
    out
}

/// 画像を読み込んで正方形にリサイズ
///
/// 最近傍補間で `size x size` に変換し、RGBに揃えます。
pub fn load_image(path: &Path, size: usize) -> Result<RgbImage> {
    let img = image::open(path)
        .with_context(|| format!("Failed to open image: {}", path.display()))?;
    let size = size as u32;
    Ok(img.resize_exact(size, size, FilterType::Nearest).to_rgb8())
}

/// 出力座標 (行, 列) から入力座標への写像
///
/// 画像中心を原点にした 回転・平行移動・せん断・ズーム の合成です。
#[derive(Debug, Clone, PartialEq)]
pub struct AffineTransform {
    matrix: Mat3,
}

impl AffineTransform {
    /// 各パラメータから変換を作る
    ///
    /// - `theta_deg`: 回転角（度）
    /// - `shift_rows` / `shift_cols`: 平行移動（ピクセル）
    /// - `shear_deg`: せん断角（度）
    /// - `zoom_rows` / `zoom_cols`: 拡大率
    pub fn new(
        theta_deg: f32,
        shift_rows: f32,
        shift_cols: f32,
        shear_deg: f32,
        zoom_rows: f32,
        zoom_cols: f32,
    ) -> Self {
        let theta = theta_deg.to_radians();
        let shear = shear_deg.to_radians();

        let rotation = [
            [theta.cos(), -theta.sin(), 0.0],
            [theta.sin(), theta.cos(), 0.0],
            [0.0, 0.0, 1.0],
        ];
        let shift = [[1.0, 0.0, shift_rows], [0.0, 1.0, shift_cols], [0.0, 0.0, 1.0]];
        let shear = [[1.0, -shear.sin(), 0.0], [0.0, shear.cos(), 0.0], [0.0, 0.0, 1.0]];
        let zoom = [[zoom_rows, 0.0, 0.0], [0.0, zoom_cols, 0.0], [0.0, 0.0, 1.0]];

        let matrix = mat_mul(&mat_mul(&mat_mul(&rotation, &shift), &shear), &zoom);
        Self { matrix }
    }

    pub fn is_identity(&self) -> bool {
        self.matrix == IDENTITY
    }

    /// 画像中心を基準に変換を適用する
    ///
    /// 双一次補間でサンプリングし、範囲外は最も近い端の画素で埋めます。
    pub fn warp(&self, img: &RgbImage) -> RgbImage {
        let (width, height) = img.dimensions();
        if self.is_identity() || width == 0 || height == 0 {
            return img.clone();
        }

        let o_r = height as f32 / 2.0 - 0.5;
        let o_c = width as f32 / 2.0 - 0.5;
        let to_center = [[1.0, 0.0, o_r], [0.0, 1.0, o_c], [0.0, 0.0, 1.0]];
        let from_center = [[1.0, 0.0, -o_r], [0.0, 1.0, -o_c], [0.0, 0.0, 1.0]];
        let m = mat_mul(&mat_mul(&to_center, &self.matrix), &from_center);

        let max_r = (height - 1) as f32;
        let max_c = (width - 1) as f32;

        RgbImage::from_fn(width, height, |c, r| {
            let (r, c) = (r as f32, c as f32);
            let src_r = (m[0][0] * r + m[0][1] * c + m[0][2]).clamp(0.0, max_r);
            let src_c = (m[1][0] * r + m[1][1] * c + m[1][2]).clamp(0.0, max_c);
            sample_bilinear(img, src_r, src_c)
        })
    }
}

fn sample_bilinear(img: &RgbImage, r: f32, c: f32) -> Rgb<u8> {
    let (width, height) = img.dimensions();
    let r0 = r.floor() as u32;
    let c0 = c.floor() as u32;
    let r1 = (r0 + 1).min(height - 1);
    let c1 = (c0 + 1).min(width - 1);
    let fr = r - r0 as f32;
    let fc = c - c0 as f32;

    let p00 = img.get_pixel(c0, r0);
    let p01 = img.get_pixel(c1, r0);
    let p10 = img.get_pixel(c0, r1);
    let p11 = img.get_pixel(c1, r1);

    let mut out = [0u8; 3];
    for ch in 0..3 {
        let top = p00[ch] as f32 * (1.0 - fc) + p01[ch] as f32 * fc;
        let bottom = p10[ch] as f32 * (1.0 - fc) + p11[ch] as f32 * fc;
        out[ch] = (top * (1.0 - fr) + bottom * fr).round().clamp(0.0, 255.0) as u8;
    }
    Rgb(out)
}

/// 全チャネルに同じ量を加算し、元画像の最小値・最大値の範囲に収める
pub fn channel_shift(img: &mut RgbImage, intensity: f32) {
    let (min, max) = img
        .as_raw()
        .iter()
        .fold((u8::MAX, u8::MIN), |(lo, hi), &v| (lo.min(v), hi.max(v)));
    let (min, max) = (min as f32, max as f32);

    for v in img.iter_mut() {
        *v = (*v as f32 + intensity).clamp(min, max).round() as u8;
    }
}

/// 明るさを倍率で変更する
pub fn scale_brightness(img: &mut RgbImage, factor: f32) {
    for v in img.iter_mut() {
        *v = (*v as f32 * factor).round().clamp(0.0, 255.0) as u8;
    }
}

/// 学習用のランダムデータ拡張
#[derive(Debug, Clone)]
pub struct Augmenter {
    settings: AugmentationSettings,
}

impl Augmenter {
    pub fn new(settings: AugmentationSettings) -> Self {
        Self { settings }
    }

    /// 設定範囲からアフィン変換をランダムに選ぶ
    pub fn random_transform<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> AffineTransform {
        let s = &self.settings;
        let theta = symmetric(rng, s.rotation_range);
        let shift_rows = symmetric(rng, s.height_shift_range) * height as f32;
        let shift_cols = symmetric(rng, s.width_shift_range) * width as f32;
        let shear = symmetric(rng, s.shear_range);
        let (zoom_rows, zoom_cols) = if s.zoom_range > 0.0 {
            (
                rng.gen_range((1.0 - s.zoom_range)..=(1.0 + s.zoom_range)),
                rng.gen_range((1.0 - s.zoom_range)..=(1.0 + s.zoom_range)),
            )
        } else {
            (1.0, 1.0)
        };
        AffineTransform::new(theta, shift_rows, shift_cols, shear, zoom_rows, zoom_cols)
    }

    /// 画像にランダム変換を適用する
    pub fn augment<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> RgbImage {
        let (width, height) = img.dimensions();
        let mut out = self.random_transform(width, height, rng).warp(img);

        if self.settings.channel_shift_range > 0.0 {
            let intensity = symmetric(rng, self.settings.channel_shift_range);
            channel_shift(&mut out, intensity);
        }

        if self.settings.horizontal_flip && rng.gen_bool(0.5) {
            image::imageops::flip_horizontal_in_place(&mut out);
        }

        if let Some((low, high)) = self.settings.brightness_range {
            let factor = rng.gen_range(low..=high);
            scale_brightness(&mut out, factor);
        }

        out
    }
}

fn symmetric<R: Rng + ?Sized>(rng: &mut R, range: f32) -> f32 {
    if range > 0.0 {
        rng.gen_range(-range..=range)
    } else {
        0.0
    }
}
