//! クラスごとのサブディレクトリから学習データを構築する

use anyhow::{Context, Result};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info};
use walkdir::WalkDir;

use burn::data::dataset::Dataset;

use crate::scan::is_image_path;

/// データセットルート直下のサブディレクトリ名を昇順で返す
///
/// ディレクトリ名がそのままクラス名、並び順がクラスIDになります。
pub fn discover_classes(data_dir: &Path) -> Result<Vec<String>> {
    if !data_dir.is_dir() {
        anyhow::bail!("Dataset directory does not exist: {}", data_dir.display());
    }

    let mut class_names = Vec::new();
    for entry in std::fs::read_dir(data_dir)
        .with_context(|| format!("Failed to read {}", data_dir.display()))?
    {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry
            .file_name()
            .to_str()
            .ok_or_else(|| anyhow::anyhow!("Invalid directory name in {}", data_dir.display()))?
            .to_string();
        class_names.push(name);
    }
    class_names.sort();

    if class_names.is_empty() {
        anyhow::bail!("No class directories found in {}", data_dir.display());
    }
    Ok(class_names)
}

/// 学習データセット（パスとクラスIDのみ保持）
#[derive(Debug, Clone)]
pub struct PhotoDataset {
    samples: Vec<(PathBuf, usize)>,
    class_names: Vec<String>,
}

/// データセットアイテム（画像パスのみ保持）
#[derive(Clone, Debug)]
pub struct PhotoItem {
    pub path: PathBuf,
    pub label: usize,
}

impl PhotoDataset {
    /// ディレクトリから学習データを読み込む
    ///
    /// `excluded` に含まれるパス（検証で不正と判定された画像）は読み込みません。
    /// 画像が1枚も無いクラスがある場合はエラーになります。
    pub fn from_directory(data_dir: &Path, excluded: &HashSet<PathBuf>) -> Result<Self> {
        let class_names = discover_classes(data_dir)?;
        let mut samples = Vec::new();
        let mut empty_classes = Vec::new();

        for (class_id, class_name) in class_names.iter().enumerate() {
            let class_dir = data_dir.join(class_name);
            let mut files: Vec<PathBuf> = WalkDir::new(&class_dir)
                .min_depth(1)
                .into_iter()
                .filter_map(|e| e.ok())
                .filter(|e| e.file_type().is_file())
                .map(|e| e.into_path())
                .filter(|p| is_image_path(p) && !excluded.contains(p))
                .collect();
            files.sort();

            if files.is_empty() {
                empty_classes.push(class_name.clone());
            }
            debug!("クラス '{}' (ID {}): {} 枚", class_name, class_id, files.len());
            samples.extend(files.into_iter().map(|path| (path, class_id)));
        }

        if !empty_classes.is_empty() {
            anyhow::bail!(
                "The following class directories contain no images: {}",
                empty_classes.join(", ")
            );
        }

        info!("{} クラスから {} 枚を読み込みました", class_names.len(), samples.len());
        Ok(Self { samples, class_names })
    }

    pub fn from_samples(samples: Vec<(PathBuf, usize)>, class_names: Vec<String>) -> Self {
        Self { samples, class_names }
    }

    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    pub fn samples(&self) -> &[(PathBuf, usize)] {
        &self.samples
    }

    /// クラスごとの枚数
    pub fn class_counts(&self) -> Vec<usize> {
        let mut counts = vec![0; self.class_names.len()];
        for (_, label) in &self.samples {
            counts[*label] += 1;
        }
        counts
    }

    /// データセットを学習用と検証用に分割
    ///
    /// クラスごとにパス順で並べ、先頭 `floor(n * validation_split)` 枚を検証用、
    /// 残りを学習用にします。乱数を使わないため毎回同じ分割になります。
    pub fn split(self, validation_split: f64) -> (Self, Self) {
        let mut per_class: Vec<Vec<PathBuf>> = vec![Vec::new(); self.class_names.len()];
        for (path, label) in self.samples {
            per_class[label].push(path);
        }

        let mut train = Vec::new();
        let mut valid = Vec::new();
        for (label, mut files) in per_class.into_iter().enumerate() {
            files.sort();
            let n_valid = (files.len() as f64 * validation_split) as usize;
            for (i, path) in files.into_iter().enumerate() {
                if i < n_valid {
                    valid.push((path, label));
                } else {
                    train.push((path, label));
                }
            }
        }

        (
            Self { samples: train, class_names: self.class_names.clone() },
            Self { samples: valid, class_names: self.class_names },
        )
    }
}

impl Dataset<PhotoItem> for PhotoDataset {
    fn get(&self, index: usize) -> Option<PhotoItem> {
        let (path, label) = self.samples.get(index)?;
        Some(PhotoItem {
            path: path.clone(),
            label: *label,
        })
    }

    fn len(&self) -> usize {
        self.samples.len()
    }
}
