pub mod config;
#[cfg(feature = "ml")]
pub mod checkpoint;
#[cfg(feature = "ml")]
pub mod model_metadata;
#[cfg(feature = "ml")]
pub mod model_storage;

pub use config::{
    ArchitectureSettings, AugmentationSettings, DeviceType, EarlyStoppingSettings, PlateauSettings,
    TrainingConfig,
};
#[cfg(feature = "ml")]
pub use checkpoint::{export_checkpoint, load_checkpoint, save_checkpoint, CheckpointInfo};
#[cfg(feature = "ml")]
pub use model_metadata::{ModelMetadata, WeightPrecision};
#[cfg(feature = "ml")]
pub use model_storage::{
    export_bundle, load_bundle, load_metadata, load_model_binary, load_model_with_metadata,
    print_metadata_info,
};
