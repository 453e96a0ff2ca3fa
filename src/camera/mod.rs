pub mod source;

pub use source::{
    ConnectionState, ErrorCallback, FrameCallback, FrameGrabber, FrameSource, FrameSourceOptions,
    FrameSourceStats, OpenCvGrabber, VideoSource,
};
