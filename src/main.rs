//! 猫・犬写真分類器のコマンドライン

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::info;

use pet_classifier_lib::logging::{init_logging, LogConfig};
use pet_classifier_lib::model::{DeviceType, TrainingConfig};
use pet_classifier_lib::scan::{scan_directory, ScanAction};

#[derive(Parser)]
#[command(name = "pet_classifier")]
#[command(about = "Clean cat/dog photo folders, train a CNN and export it for mobile inference")]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Check every image under DIR and report (or delete) undecodable files
    Scan {
        #[arg(value_name = "DIR")]
        dir: PathBuf,

        /// Delete invalid files instead of only listing them
        #[arg(long)]
        delete: bool,
    },

    /// Train the classifier and export a bundle
    #[cfg(feature = "ml")]
    Train {
        /// Preset to start from (baseline, dog-photos, regularized)
        #[arg(long, default_value = "baseline")]
        preset: String,

        /// JSON config file (replaces the preset; must exist)
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        #[arg(long, value_name = "DIR")]
        data_dir: Option<PathBuf>,

        #[arg(long, value_name = "FILE")]
        output: Option<PathBuf>,

        #[arg(long)]
        epochs: Option<usize>,

        #[arg(long, value_enum)]
        device: Option<DeviceArg>,

        /// Also save a checkpoint at PATH (.mpk + .json)
        #[arg(long, value_name = "PATH")]
        checkpoint: Option<PathBuf>,
    },

    /// Reload a saved checkpoint and export it as a bundle
    #[cfg(feature = "ml")]
    ExportCheckpoint {
        #[arg(value_name = "CHECKPOINT")]
        checkpoint: PathBuf,

        #[arg(value_name = "OUTPUT")]
        output: PathBuf,

        /// Store weights in half precision
        #[arg(long)]
        optimize: bool,
    },

    /// Classify images with an exported bundle
    #[cfg(feature = "ml")]
    Predict {
        #[arg(value_name = "BUNDLE")]
        bundle: PathBuf,

        #[arg(value_name = "IMAGE", required = true)]
        images: Vec<PathBuf>,
    },

    /// Write a preset as a JSON config file
    Config {
        #[arg(value_name = "PRESET")]
        preset: String,

        #[arg(long, value_name = "FILE")]
        out: Option<PathBuf>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum DeviceArg {
    Cpu,
    Wgpu,
}

impl From<DeviceArg> for DeviceType {
    fn from(arg: DeviceArg) -> Self {
        match arg {
            DeviceArg::Cpu => DeviceType::Cpu,
            DeviceArg::Wgpu => DeviceType::Wgpu,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&LogConfig::from_verbose_flag(cli.verbose))?;

    match cli.command {
        Command::Scan { dir, delete } => {
            let action = if delete { ScanAction::Delete } else { ScanAction::Report };
            let report = scan_directory(&dir, action)?;
            println!(
                "Checked {} images: {} invalid, {} deleted",
                report.checked(),
                report.invalid.len(),
                report.deleted.len()
            );
        }

        #[cfg(feature = "ml")]
        Command::Train {
            preset,
            config,
            data_dir,
            output,
            epochs,
            device,
            checkpoint,
        } => {
            let mut training_config = match config {
                Some(path) => {
                    let loaded = TrainingConfig::load(&path)?;
                    info!("設定ファイルを読み込みました: {}", path.display());
                    loaded
                }
                None => TrainingConfig::preset(&preset)?,
            };
            if let Some(dir) = data_dir {
                training_config.data_dir = dir;
            }
            if let Some(path) = output {
                training_config.output_path = path;
            }
            if let Some(n) = epochs {
                training_config.num_epochs = n;
            }
            if let Some(device) = device {
                training_config.device_type = device.into();
            }
            if checkpoint.is_some() {
                training_config.checkpoint_path = checkpoint;
            }
            training_config.display();

            let summary = pet_classifier_lib::ml::run_training(&training_config)?;
            if let Some(path) = &summary.checkpoint_path {
                info!("チェックポイント: {}", path.display());
            }
            if let Some(acc) = summary.best_val_accuracy {
                info!("最良検証精度: {:.4} ({} エポック)", acc, summary.epochs_run);
            }
            println!("Model saved as {}", summary.output_path.display());
        }

        #[cfg(feature = "ml")]
        Command::ExportCheckpoint {
            checkpoint,
            output,
            optimize,
        } => {
            let device = burn_ndarray::NdArrayDevice::Cpu;
            let path = pet_classifier_lib::model::export_checkpoint::<burn_ndarray::NdArray>(
                &checkpoint,
                &output,
                optimize,
                &device,
            )?;
            println!("Model saved as {}", path.display());
        }

        #[cfg(feature = "ml")]
        Command::Predict { bundle, images } => {
            let device = burn_ndarray::NdArrayDevice::Cpu;
            let engine =
                pet_classifier_lib::ml::InferenceEngine::<burn_ndarray::NdArray>::load(&bundle, device)?;
            info!("クラス: {:?}", engine.metadata().class_names);
            for (path, prediction) in images.iter().zip(engine.classify_batch(&images)?) {
                println!(
                    "{}: {} ({:.1}%)",
                    path.display(),
                    prediction.class_name,
                    prediction.confidence * 100.0
                );
            }
        }

        Command::Config { preset, out } => {
            let config = TrainingConfig::preset(&preset)?;
            let path = out.unwrap_or_else(TrainingConfig::default_path);
            config.save(&path)?;
            println!("Config written to {}", path.display());
        }
    }

    Ok(())
}
