pub mod validity_filter;

pub use validity_filter::{
    is_image_path, scan_directory, verify_image, ScanAction, ScanReport, IMAGE_EXTENSIONS,
};
