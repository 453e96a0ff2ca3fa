use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::exercise::ExerciseKind;
use crate::publish::DEFAULT_PUBLISH_ADDR;

#[derive(Debug, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub video: VideoConfig,
    #[serde(default)]
    pub detection: DetectionConfig,
    #[serde(default)]
    pub publish: PublishConfig,
    #[serde(default)]
    pub app: AppConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct VideoConfig {
    /// 映像ソース。数値ならカメラ番号、それ以外はURL/ファイルパス
    #[serde(default = "default_video_source")]
    pub source: String,
    /// 再接続までのバックオフ（秒）
    #[serde(default = "default_reconnect_interval_secs")]
    pub reconnect_interval_secs: u64,
    /// 連続再接続失敗の上限
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    /// 強制切断までの連続読み込み失敗数
    #[serde(default = "default_max_read_errors")]
    pub max_read_errors: u32,
    #[serde(default = "default_open_timeout_ms")]
    pub open_timeout_ms: u64,
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DetectionConfig {
    /// 追跡する種目
    #[serde(default = "default_exercise_type")]
    pub exercise_type: String,
    #[serde(default = "default_model_path")]
    pub model_path: String,
    /// 種目定義の外部ファイル。未指定なら埋め込みテーブル。
    #[serde(default)]
    pub exercises_file: Option<String>,
    /// Nフレームに1回だけ処理する
    #[serde(default = "default_frame_skip")]
    pub frame_skip: u64,
    /// 推論前の縮小幅上限。0で無効。
    #[serde(default = "default_max_width")]
    pub max_width: i32,
    /// キーポイント信頼度の閾値
    #[serde(default = "default_confidence_threshold")]
    pub confidence_threshold: f32,
    #[serde(default = "default_smoothing_window")]
    pub smoothing_window: usize,
    /// レップ間の最小間隔（ミリ秒）
    #[serde(default = "default_min_rep_interval_ms")]
    pub min_rep_interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct PublishConfig {
    /// 配信先 (UDPリレー)
    #[serde(default = "default_publish_addr")]
    pub addr: String,
    #[serde(default = "default_topic_prefix")]
    pub topic_prefix: String,
    /// カウント変化がないときの最大配信間隔（ミリ秒）
    #[serde(default = "default_publish_interval_ms")]
    pub interval_ms: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    #[serde(default)]
    pub debug: bool,
    /// 処理Nフレームごとにステータス行を出力
    #[serde(default = "default_status_interval_frames")]
    pub status_interval_frames: u64,
}

fn default_video_source() -> String { "0".to_string() }
fn default_reconnect_interval_secs() -> u64 { 5 }
fn default_max_reconnect_attempts() -> u32 { 10 }
fn default_max_read_errors() -> u32 { 10 }
fn default_open_timeout_ms() -> u64 { 10_000 }
fn default_read_timeout_ms() -> u64 { 10_000 }
fn default_exercise_type() -> String { "squat".to_string() }
fn default_model_path() -> String { "models/movenet_lightning.onnx".to_string() }
fn default_frame_skip() -> u64 { 1 }
fn default_max_width() -> i32 { 640 }
fn default_confidence_threshold() -> f32 { 0.5 }
fn default_smoothing_window() -> usize { 5 }
fn default_min_rep_interval_ms() -> u64 { 500 }
fn default_publish_addr() -> String { DEFAULT_PUBLISH_ADDR.to_string() }
fn default_topic_prefix() -> String { "homeassistant/sensor/taiso".to_string() }
fn default_publish_interval_ms() -> u64 { 500 }
fn default_status_interval_frames() -> u64 { 300 }

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            source: default_video_source(),
            reconnect_interval_secs: default_reconnect_interval_secs(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            max_read_errors: default_max_read_errors(),
            open_timeout_ms: default_open_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            exercise_type: default_exercise_type(),
            model_path: default_model_path(),
            exercises_file: None,
            frame_skip: default_frame_skip(),
            max_width: default_max_width(),
            confidence_threshold: default_confidence_threshold(),
            smoothing_window: default_smoothing_window(),
            min_rep_interval_ms: default_min_rep_interval_ms(),
        }
    }
}

impl Default for PublishConfig {
    fn default() -> Self {
        Self {
            addr: default_publish_addr(),
            topic_prefix: default_topic_prefix(),
            interval_ms: default_publish_interval_ms(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            debug: false,
            status_interval_frames: default_status_interval_frames(),
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("failed to read {}", path.as_ref().display()))?;
        let config: Config = toml::from_str(&content).context("failed to parse config")?;
        Ok(config)
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        if !path.as_ref().exists() {
            println!("No config file at {}, using defaults", path.as_ref().display());
            return Self::default();
        }
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Config error: {e:#}, using defaults");
                Self::default()
            }
        }
    }

    /// 起動時検証。設定ミスは実行中に発覚させず、ここで落とす。
    pub fn validate(&self) -> Result<()> {
        self.exercise_kind()?;
        if self.detection.frame_skip == 0 {
            bail!("detection.frame_skip must be at least 1");
        }
        if self.detection.smoothing_window == 0 {
            bail!("detection.smoothing_window must be at least 1");
        }
        if !(0.0..=1.0).contains(&self.detection.confidence_threshold) {
            bail!(
                "detection.confidence_threshold must be in [0, 1], got {}",
                self.detection.confidence_threshold
            );
        }
        if self.publish.interval_ms == 0 {
            bail!("publish.interval_ms must be positive");
        }
        Ok(())
    }

    pub fn exercise_kind(&self) -> Result<ExerciseKind> {
        let name = &self.detection.exercise_type;
        ExerciseKind::from_name(name).with_context(|| {
            let valid: Vec<&str> = ExerciseKind::ALL.iter().map(|k| k.name()).collect();
            format!(
                "invalid exercise_type '{}'. Valid options: {}",
                name,
                valid.join(", ")
            )
        })
    }
}
