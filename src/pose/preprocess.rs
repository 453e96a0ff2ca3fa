use anyhow::Result;
use ndarray::Array4;
use opencv::{
    core::{AlgorithmHint, Mat, Size, CV_32FC3},
    imgproc,
    prelude::*,
};

/// MoveNet用の入力サイズ
pub const MOVENET_INPUT_SIZE: i32 = 192;

/// OpenCV Mat を MoveNet用の入力テンソルに変換
///
/// - BGR -> RGB
/// - 192x192 にリサイズ
/// - [1, 192, 192, 3] の f32 テンソルに変換 (0.0-255.0)
pub fn preprocess_for_movenet(frame: &Mat) -> Result<Array4<f32>> {
    let mut rgb = Mat::default();
    imgproc::cvt_color(
        frame,
        &mut rgb,
        imgproc::COLOR_BGR2RGB,
        0,
        AlgorithmHint::ALGO_HINT_DEFAULT,
    )?;

    let mut resized = Mat::default();
    imgproc::resize(
        &rgb,
        &mut resized,
        Size::new(MOVENET_INPUT_SIZE, MOVENET_INPUT_SIZE),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    let mut float_mat = Mat::default();
    resized.convert_to(&mut float_mat, CV_32FC3, 1.0, 0.0)?;

    let size = MOVENET_INPUT_SIZE as usize;
    let mut tensor = Array4::<f32>::zeros((1, size, size, 3));
    for y in 0..MOVENET_INPUT_SIZE {
        for x in 0..MOVENET_INPUT_SIZE {
            let pixel = float_mat.at_2d::<opencv::core::Vec3f>(y, x)?;
            tensor[[0, y as usize, x as usize, 0]] = pixel[0];
            tensor[[0, y as usize, x as usize, 1]] = pixel[1];
            tensor[[0, y as usize, x as usize, 2]] = pixel[2];
        }
    }

    Ok(tensor)
}

/// 幅上限に収まる縮小後サイズを計算する（アスペクト比維持）
///
/// 上限以下のフレームはそのままのサイズを返す。
pub fn scaled_size(width: i32, height: i32, max_width: i32) -> (i32, i32) {
    if width <= max_width || max_width <= 0 {
        return (width, height);
    }
    let scale = max_width as f64 / width as f64;
    let new_height = ((height as f64 * scale).round() as i32).max(1);
    (max_width, new_height)
}

/// フレームを幅上限まで縮小する。上限以下ならコピーを返す。
///
/// 推論コスト削減用。角度計算はスケール不変なので縮小後の
/// ピクセル座標をそのまま使ってよい。
pub fn downscale_to_width(frame: &Mat, max_width: i32) -> Result<Mat> {
    let (width, height) = (frame.cols(), frame.rows());
    let (new_width, new_height) = scaled_size(width, height, max_width);
    if new_width == width {
        return Ok(frame.clone());
    }

    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(new_width, new_height),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;
    Ok(resized)
}
