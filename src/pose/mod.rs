pub mod detector;
pub mod keypoint;
pub mod preprocess;

pub use detector::{MoveNetDetector, PoseEstimator};
pub use keypoint::{Keypoint, KeypointIndex, Pose};
pub use preprocess::{downscale_to_width, preprocess_for_movenet, scaled_size};
