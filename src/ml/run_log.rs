//! エポックごとの学習指標をCSVに書き出す

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::info;

/// 1エポック分の指標
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochMetrics {
    pub epoch: usize,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub val_loss: f64,
    pub val_accuracy: f64,
    pub learning_rate: f64,
}

/// 学習実行ごとのCSVロガー
///
/// `<log_dir>/<タイムスタンプ>/metrics.csv` に追記します。
pub struct RunLogger {
    writer: csv::Writer<File>,
    path: PathBuf,
}

impl RunLogger {
    /// 新しい実行ディレクトリを作成してロガーを開く
    pub fn create(log_dir: &Path) -> Result<Self> {
        let run_name = chrono::Local::now().format("%Y%m%d-%H%M%S").to_string();
        let run_dir = log_dir.join(run_name);
        std::fs::create_dir_all(&run_dir)
            .with_context(|| format!("Failed to create log directory: {}", run_dir.display()))?;

        let path = run_dir.join("metrics.csv");
        let writer = csv::Writer::from_path(&path)
            .with_context(|| format!("Failed to create {}", path.display()))?;

        info!("学習ログ: {}", path.display());
        Ok(Self { writer, path })
    }

    pub fn log(&mut self, metrics: &EpochMetrics) -> Result<()> {
        self.writer.serialize(metrics)?;
        // 途中で中断しても残るようにエポックごとに書き出す
        self.writer.flush()?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_writes_header_and_rows() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut logger = RunLogger::create(tmp.path()).unwrap();
        for epoch in 1..=2 {
            logger
                .log(&EpochMetrics {
                    epoch,
                    train_loss: 0.7,
                    train_accuracy: 0.5,
                    val_loss: 0.69,
                    val_accuracy: 0.55,
                    learning_rate: 1e-3,
                })
                .unwrap();
        }

        let path = logger.path().to_path_buf();
        assert!(path.starts_with(tmp.path()));
        assert_eq!(path.file_name().unwrap(), "metrics.csv");

        let mut reader = csv::Reader::from_path(&path).unwrap();
        let headers = reader.headers().unwrap().clone();
        assert_eq!(&headers[0], "epoch");
        assert_eq!(&headers[5], "learning_rate");

        let rows: Vec<EpochMetrics> = reader.deserialize().map(|r| r.unwrap()).collect();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].epoch, 2);
    }
}
