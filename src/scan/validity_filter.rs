//! 画像ファイルの妥当性チェック
//!
//! データセットディレクトリを再帰的に走査し、デコードできない画像を
//! 一覧表示または削除します。学習ローダーに壊れた画像を渡さないための前処理です。

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// 画像として扱う拡張子（小文字で比較）
pub const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

/// 不正な画像を見つけたときの動作
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ScanAction {
    /// ログに出力するだけ
    Report,
    /// ディスクから削除する
    Delete,
}

impl std::fmt::Display for ScanAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ScanAction::Report => write!(f, "report"),
            ScanAction::Delete => write!(f, "delete"),
        }
    }
}

/// 走査結果
#[derive(Debug, Clone, Default)]
pub struct ScanReport {
    /// デコードに成功した画像
    pub valid: Vec<PathBuf>,
    /// デコードに失敗した画像
    pub invalid: Vec<PathBuf>,
    /// 削除モードで実際に削除した画像
    pub deleted: Vec<PathBuf>,
    /// 削除に失敗した画像とエラー内容
    pub delete_failures: Vec<(PathBuf, String)>,
    /// 画像拡張子でないため判定しなかったファイル数
    pub skipped: usize,
    /// 読み取れずに飛ばしたエントリ数
    pub unreadable: usize,
}

impl ScanReport {
    /// 判定対象になった画像の総数
    pub fn checked(&self) -> usize {
        self.valid.len() + self.invalid.len()
    }

    /// 学習ローダーから除外すべきパス
    pub fn excluded(&self) -> HashSet<PathBuf> {
        self.invalid.iter().cloned().collect()
    }
}

/// 拡張子が画像として認識されるか
pub fn is_image_path(path: &Path) -> bool {
    path.extension()
        .map(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            IMAGE_EXTENSIONS.contains(&ext.as_str())
        })
        .unwrap_or(false)
}

/// 画像をデコードして妥当性を確認する
///
/// オープン・フォーマット判定・デコードのいずれかで失敗した場合は `false`。
/// エラーは呼び出し元に伝播しません。
pub fn verify_image(path: &Path) -> bool {
    let reader = match image::ImageReader::open(path) {
        Ok(reader) => reader,
        Err(e) => {
            debug!("open failed {}: {}", path.display(), e);
            return false;
        }
    };

    let reader = match reader.with_guessed_format() {
        Ok(reader) => reader,
        Err(e) => {
            debug!("format detection failed {}: {}", path.display(), e);
            return false;
        }
    };

    match reader.decode() {
        Ok(_) => true,
        Err(e) => {
            debug!("decode failed {}: {}", path.display(), e);
            false
        }
    }
}

/// ディレクトリを走査して不正な画像を検出する
///
/// 画像拡張子でないファイルは判定せず `skipped` に数えるだけです。
/// `ScanAction::Delete` の場合のみファイルシステムを変更します。
pub fn scan_directory(root: &Path, action: ScanAction) -> Result<ScanReport> {
    if !root.is_dir() {
        anyhow::bail!("Dataset directory does not exist: {}", root.display());
    }

    info!("画像の検証を開始します: {} (モード: {})", root.display(), action);

    let mut report = ScanReport::default();

    for entry in WalkDir::new(root).min_depth(1) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!("読み取れないエントリをスキップします: {}", e);
                report.unreadable += 1;
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.into_path();
        if !is_image_path(&path) {
            report.skipped += 1;
            continue;
        }

        if verify_image(&path) {
            report.valid.push(path);
            continue;
        }

        match action {
            ScanAction::Report => {
                warn!("Invalid image file: {}", path.display());
            }
            ScanAction::Delete => {
                warn!("Deleting invalid image file: {}", path.display());
                match std::fs::remove_file(&path) {
                    Ok(()) => report.deleted.push(path.clone()),
                    Err(e) => {
                        warn!("削除に失敗しました {}: {}", path.display(), e);
                        report.delete_failures.push((path.clone(), e.to_string()));
                    }
                }
            }
        }
        report.invalid.push(path);
    }

    info!(
        "検証完了: 有効 {} 枚, 不正 {} 枚, 対象外 {} 件, 読み取り不可 {} 件",
        report.valid.len(),
        report.invalid.len(),
        report.skipped,
        report.unreadable
    );

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::fs;
    use tempfile::TempDir;

    fn write_jpeg(path: &Path, shade: u8) {
        let img = RgbImage::from_pixel(16, 16, Rgb([shade, 255 - shade, 128]));
        img.save_with_format(path, ImageFormat::Jpeg).unwrap();
    }

    fn write_garbage(path: &Path, seed: u8) {
        let bytes: Vec<u8> = (0..512u32).map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed)).collect();
        fs::write(path, bytes).unwrap();
    }

    /// cats/ に 4 枚、dogs/ に 4 枚の正常な JPEG と、壊れた .jpg を 2 枚置く
    fn populate(dir: &Path) -> (Vec<PathBuf>, Vec<PathBuf>) {
        let mut valid = Vec::new();
        for class in ["cats", "dogs"] {
            let class_dir = dir.join(class);
            fs::create_dir_all(&class_dir).unwrap();
            for i in 0..4 {
                let path = class_dir.join(format!("{}_{}.jpg", class, i));
                write_jpeg(&path, i * 40);
                valid.push(path);
            }
        }
        let invalid = vec![dir.join("cats").join("broken.jpg"), dir.join("dogs").join("noise.jpg")];
        write_garbage(&invalid[0], 1);
        write_garbage(&invalid[1], 7);
        (valid, invalid)
    }

    fn count_files(dir: &Path) -> usize {
        WalkDir::new(dir)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .count()
    }

    #[test]
    fn test_is_image_path() {
        assert!(is_image_path(Path::new("a/b/cat.jpg")));
        assert!(is_image_path(Path::new("cat.JPEG")));
        assert!(is_image_path(Path::new("dog.png")));
        assert!(!is_image_path(Path::new("notes.txt")));
        assert!(!is_image_path(Path::new("no_extension")));
    }

    #[test]
    fn test_verify_image_detects_corruption() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.jpg");
        let bad = tmp.path().join("bad.jpg");
        write_jpeg(&good, 10);
        write_garbage(&bad, 3);

        assert!(verify_image(&good));
        assert!(!verify_image(&bad));
        assert!(!verify_image(&tmp.path().join("missing.jpg")));
    }

    #[test]
    fn test_truncated_jpeg_is_invalid() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("truncated.jpg");
        write_jpeg(&path, 200);
        let bytes = fs::read(&path).unwrap();
        fs::write(&path, &bytes[..bytes.len().min(100)]).unwrap();

        assert!(!verify_image(&path));
    }

    #[test]
    fn test_report_mode_lists_invalid_and_keeps_files() {
        let tmp = TempDir::new().unwrap();
        let (valid, invalid) = populate(tmp.path());

        let report = scan_directory(tmp.path(), ScanAction::Report).unwrap();

        let mut found = report.invalid.clone();
        found.sort();
        let mut expected = invalid.clone();
        expected.sort();
        assert_eq!(found, expected);
        assert_eq!(report.valid.len(), valid.len());
        assert!(report.deleted.is_empty());
        assert_eq!(count_files(tmp.path()), 10);
    }

    #[test]
    fn test_delete_mode_removes_only_invalid() {
        let tmp = TempDir::new().unwrap();
        let (valid, invalid) = populate(tmp.path());

        let report = scan_directory(tmp.path(), ScanAction::Delete).unwrap();

        assert_eq!(report.invalid.len(), 2);
        assert_eq!(report.deleted.len(), 2);
        assert!(report.delete_failures.is_empty());
        for path in &invalid {
            assert!(!path.exists(), "{} should be deleted", path.display());
        }
        for path in &valid {
            assert!(path.exists(), "{} should be kept", path.display());
        }
        assert_eq!(count_files(tmp.path()), 8);
    }

    #[test]
    fn test_non_image_files_are_not_classified() {
        let tmp = TempDir::new().unwrap();
        let (_, _) = populate(tmp.path());
        let readme = tmp.path().join("README.txt");
        fs::write(&readme, b"not an image").unwrap();
        fs::write(tmp.path().join("cats").join("labels.csv"), b"a,b").unwrap();

        let report = scan_directory(tmp.path(), ScanAction::Delete).unwrap();

        assert_eq!(report.skipped, 2);
        assert_eq!(report.checked(), 10);
        assert!(!report.invalid.contains(&readme));
        assert!(readme.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_directory_does_not_abort_scan() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = TempDir::new().unwrap();
        let (valid, invalid) = populate(tmp.path());
        let locked = tmp.path().join("locked");
        fs::create_dir(&locked).unwrap();
        write_jpeg(&locked.join("hidden.jpg"), 10);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        // root 権限では読めてしまう
        let denied = fs::read_dir(&locked).is_err();

        let result = scan_directory(tmp.path(), ScanAction::Report);
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();

        let report = result.unwrap();
        assert_eq!(report.invalid.len(), invalid.len());
        if denied {
            assert_eq!(report.unreadable, 1);
            assert_eq!(report.valid.len(), valid.len());
        } else {
            assert_eq!(report.unreadable, 0);
            assert_eq!(report.valid.len(), valid.len() + 1);
        }
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let tmp = TempDir::new().unwrap();
        assert!(scan_directory(&tmp.path().join("nope"), ScanAction::Report).is_err());
    }
}
