pub mod augmentation;
pub mod batcher;
pub mod photo_dataset;

pub use augmentation::{load_image, AffineTransform, Augmenter};
pub use batcher::{PhotoBatch, PhotoBatcher};
pub use photo_dataset::{discover_classes, PhotoDataset, PhotoItem};
