pub mod cam;
pub mod classifier;
pub mod conv_classifier;
pub mod feature_map;
pub mod grid_encoder;
pub mod metrics_extractor;
pub mod normalizer;
pub mod result_assembler;
pub mod runtime;
pub mod utils;
