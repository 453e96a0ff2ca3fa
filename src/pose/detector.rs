use anyhow::{Context, Result};
use opencv::core::Mat;
use opencv::prelude::*;
use ort::session::builder::GraphOptimizationLevel;
use ort::session::Session;
use ort::value::Tensor;
use std::path::Path;

use super::keypoint::{Keypoint, KeypointIndex, Pose};
use super::preprocess::preprocess_for_movenet;

/// 姿勢推定の境界
///
/// フレーム1枚を受け取り、検出された人物ごとの17キーポイントを返す。
/// モデルの中身（アーキテクチャ・バックエンド）はこの境界の外。
pub trait PoseEstimator: Send {
    fn estimate(&mut self, frame: &Mat) -> Result<Vec<Pose>>;
}

/// MoveNet (single pose) を使用した姿勢検出器
pub struct MoveNetDetector {
    session: Session,
}

impl MoveNetDetector {
    /// ONNXモデルを読み込んで初期化
    pub fn new<P: AsRef<Path>>(model_path: P) -> Result<Self> {
        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .commit_from_file(model_path.as_ref())
            .context("Failed to load ONNX model")?;

        Ok(Self { session })
    }
}

impl PoseEstimator for MoveNetDetector {
    /// フレームから姿勢を検出する
    ///
    /// MoveNet の出力は [1, 1, 17, 3] (y, x, confidence)、座標は正規化値。
    /// フレームのピクセル座標に変換して返す。
    fn estimate(&mut self, frame: &Mat) -> Result<Vec<Pose>> {
        let (width, height) = (frame.cols() as f32, frame.rows() as f32);
        let input = preprocess_for_movenet(frame)?;

        let input_tensor = Tensor::from_array(input)?;
        let outputs = self
            .session
            .run(ort::inputs!["serving_default_input_0" => input_tensor])
            .context("Inference failed")?;

        let output: ndarray::ArrayViewD<f32> = outputs["StatefulPartitionedCall_0"]
            .try_extract_array()
            .context("Failed to extract output tensor")?;

        let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
        for i in 0..KeypointIndex::COUNT {
            let y = output[[0, 0, i, 0]];
            let x = output[[0, 0, i, 1]];
            let confidence = output[[0, 0, i, 2]];

            keypoints[i] = Keypoint::new(x * width, y * height, confidence);
        }

        Ok(vec![Pose::new(keypoints)])
    }
}
