pub mod counter;
pub mod geometry;
pub mod profile;
pub mod smooth;

pub use counter::{ExerciseEngine, Observation, RepMachine, Stage, DEFAULT_MIN_REP_INTERVAL};
pub use geometry::{joint_angle, Point2};
pub use profile::{ExerciseKind, ExerciseProfile, ProfileSet};
pub use smooth::{AngleSmoother, DEFAULT_SMOOTHING_WINDOW};
