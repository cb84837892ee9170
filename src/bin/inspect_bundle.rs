//! バンドルのメタデータを表示する

use std::path::PathBuf;

use pet_classifier_lib::model::{load_metadata, load_model_binary, print_metadata_info};

fn main() {
    let args: Vec<String> = std::env::args().collect();
    let model_path = match args.get(1) {
        Some(path) => PathBuf::from(path),
        None => {
            eprintln!("使い方: inspect_bundle <BUNDLE>");
            std::process::exit(2);
        }
    };

    match load_metadata(&model_path) {
        Ok(metadata) => {
            println!("✓ モデルメタデータ読み込み成功:");
            print_metadata_info(&metadata);
        }
        Err(e) => {
            eprintln!("✗ エラー: {}", e);
            std::process::exit(1);
        }
    }

    match load_model_binary(&model_path) {
        Ok(binary) => {
            println!(
                "モデルバイナリサイズ: {} バイト ({:.2} MB)",
                binary.len(),
                binary.len() as f64 / 1024.0 / 1024.0
            );
        }
        Err(e) => {
            eprintln!("✗ エラー: {}", e);
            std::process::exit(1);
        }
    }
}
