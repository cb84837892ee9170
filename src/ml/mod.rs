pub mod callbacks;
pub mod inference;
pub mod ml_model;
pub mod run_log;
pub mod training;

pub use callbacks::{EarlyStopping, ReduceLrOnPlateau, StopDecision};
pub use inference::{InferenceEngine, Prediction};
pub use ml_model::{CatDogClassifier, ClassifierConfig, IMAGE_SIZE};
pub use run_log::{EpochMetrics, RunLogger};
pub use training::{run_training, train_classifier, TrainingOutcome, TrainingSummary};
