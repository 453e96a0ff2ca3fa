use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;

use crate::pose::KeypointIndex;

/// バイナリに埋め込むデフォルトの種目定義テーブル
pub const DEFAULT_EXERCISES_JSON: &str = include_str!("../../data/exercises.json");

/// 対応する種目
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(usize)]
pub enum ExerciseKind {
    Squat = 0,
    Pushup = 1,
    Situp = 2,
    BicepCurl = 3,
    LateralRaise = 4,
    OverheadPress = 5,
    LegRaise = 6,
    KneeRaise = 7,
    KneePress = 8,
    Crunch = 9,
}

impl ExerciseKind {
    pub const COUNT: usize = 10;

    pub const ALL: [ExerciseKind; Self::COUNT] = [
        Self::Squat,
        Self::Pushup,
        Self::Situp,
        Self::BicepCurl,
        Self::LateralRaise,
        Self::OverheadPress,
        Self::LegRaise,
        Self::KneeRaise,
        Self::KneePress,
        Self::Crunch,
    ];

    /// 設定ファイル上の名前から変換
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "squat" => Some(Self::Squat),
            "pushup" => Some(Self::Pushup),
            "situp" => Some(Self::Situp),
            "bicep_curl" => Some(Self::BicepCurl),
            "lateral_raise" => Some(Self::LateralRaise),
            "overhead_press" => Some(Self::OverheadPress),
            "leg_raise" => Some(Self::LegRaise),
            "knee_raise" => Some(Self::KneeRaise),
            "knee_press" => Some(Self::KneePress),
            "crunch" => Some(Self::Crunch),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Squat => "squat",
            Self::Pushup => "pushup",
            Self::Situp => "situp",
            Self::BicepCurl => "bicep_curl",
            Self::LateralRaise => "lateral_raise",
            Self::OverheadPress => "overhead_press",
            Self::LegRaise => "leg_raise",
            Self::KneeRaise => "knee_raise",
            Self::KneePress => "knee_press",
            Self::Crunch => "crunch",
        }
    }

    /// 表示用の名前
    pub fn display_name(self) -> &'static str {
        match self {
            Self::Squat => "Squat",
            Self::Pushup => "Push-up",
            Self::Situp => "Sit-up",
            Self::BicepCurl => "Bicep Curl",
            Self::LateralRaise => "Lateral Raise",
            Self::OverheadPress => "Overhead Press",
            Self::LegRaise => "Leg Raise",
            Self::KneeRaise => "Knee Raise",
            Self::KneePress => "Knee Press",
            Self::Crunch => "Crunch",
        }
    }
}

/// 左右それぞれの角度計算に使う3キーポイントのインデックス
#[derive(Debug, Clone, Deserialize)]
pub struct LimbTriples {
    pub left: [usize; 3],
    pub right: [usize; 3],
}

/// 種目ごとの静的設定。起動時に一度だけ読み込み、以後不変。
#[derive(Debug, Clone, Deserialize)]
pub struct ExerciseProfile {
    pub down_angle: f32,
    pub up_angle: f32,
    pub keypoints: LimbTriples,
    #[serde(default)]
    pub is_leg_exercise: bool,
}

#[derive(Debug, Deserialize)]
struct ProfileFile {
    exercises: HashMap<String, ExerciseProfile>,
}

/// 全種目のプロファイル一式
///
/// 読み込み時に全種目が揃っていること・閾値/インデックスが正しいことを
/// 検証するため、以後の参照は失敗しない。
pub struct ProfileSet {
    profiles: Vec<ExerciseProfile>,
}

impl ProfileSet {
    /// 埋め込みのデフォルトテーブルを読み込む
    pub fn load_default() -> Result<Self> {
        Self::from_json(DEFAULT_EXERCISES_JSON)
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref()).with_context(|| {
            format!("failed to read exercises file {}", path.as_ref().display())
        })?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        let file: ProfileFile =
            serde_json::from_str(text).context("failed to parse exercise profiles")?;

        let mut slots: Vec<Option<ExerciseProfile>> = vec![None; ExerciseKind::COUNT];
        for (name, profile) in file.exercises {
            let kind = ExerciseKind::from_name(&name)
                .with_context(|| format!("unknown exercise '{name}' in profile table"))?;
            validate_profile(kind, &profile)?;
            slots[kind as usize] = Some(profile);
        }

        for kind in ExerciseKind::ALL {
            if slots[kind as usize].is_none() {
                bail!("missing profile for exercise '{}'", kind.name());
            }
        }

        Ok(Self {
            profiles: slots.into_iter().flatten().collect(),
        })
    }

    pub fn get(&self, kind: ExerciseKind) -> &ExerciseProfile {
        &self.profiles[kind as usize]
    }
}

fn validate_profile(kind: ExerciseKind, profile: &ExerciseProfile) -> Result<()> {
    if !(profile.up_angle > profile.down_angle) {
        bail!(
            "exercise '{}': up_angle ({}) must be greater than down_angle ({})",
            kind.name(),
            profile.up_angle,
            profile.down_angle
        );
    }
    for &i in profile
        .keypoints
        .left
        .iter()
        .chain(profile.keypoints.right.iter())
    {
        if i >= KeypointIndex::COUNT {
            bail!(
                "exercise '{}': keypoint index {} out of range (max {})",
                kind.name(),
                i,
                KeypointIndex::COUNT - 1
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_table_is_complete() {
        let set = ProfileSet::load_default().unwrap();
        for kind in ExerciseKind::ALL {
            let profile = set.get(kind);
            assert!(profile.up_angle > profile.down_angle, "{}", kind.name());
        }
    }

    #[test]
    fn test_squat_thresholds() {
        let set = ProfileSet::load_default().unwrap();
        let squat = set.get(ExerciseKind::Squat);
        assert_eq!(squat.up_angle, 170.0);
        assert_eq!(squat.down_angle, 90.0);
        assert!(!squat.is_leg_exercise);
        // 股関節-膝-足首
        assert_eq!(squat.keypoints.left, [11, 13, 15]);
        assert_eq!(squat.keypoints.right, [12, 14, 16]);
    }

    #[test]
    fn test_leg_exercises_flagged() {
        let set = ProfileSet::load_default().unwrap();
        assert!(set.get(ExerciseKind::LegRaise).is_leg_exercise);
        assert!(set.get(ExerciseKind::KneeRaise).is_leg_exercise);
        assert!(set.get(ExerciseKind::KneePress).is_leg_exercise);
        assert!(!set.get(ExerciseKind::Squat).is_leg_exercise);
    }

    #[test]
    fn test_kind_name_roundtrip() {
        for kind in ExerciseKind::ALL {
            assert_eq!(ExerciseKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(ExerciseKind::from_name("jumping_jack"), None);
    }

    #[test]
    fn test_unknown_exercise_rejected() {
        let json = r#"{"exercises": {"handstand": {
            "down_angle": 10, "up_angle": 20,
            "keypoints": {"left": [0,1,2], "right": [0,1,2]}
        }}}"#;
        assert!(ProfileSet::from_json(json).is_err());
    }

    #[test]
    fn test_missing_exercise_rejected() {
        let json = r#"{"exercises": {"squat": {
            "down_angle": 90, "up_angle": 170,
            "keypoints": {"left": [11,13,15], "right": [12,14,16]}
        }}}"#;
        let err = ProfileSet::from_json(json).unwrap_err();
        assert!(err.to_string().contains("missing profile"));
    }

    #[test]
    fn test_inverted_thresholds_rejected() {
        let mut json: serde_json::Value =
            serde_json::from_str(DEFAULT_EXERCISES_JSON).unwrap();
        json["exercises"]["squat"]["up_angle"] = serde_json::json!(50);
        assert!(ProfileSet::from_json(&json.to_string()).is_err());
    }

    #[test]
    fn test_out_of_range_keypoint_rejected() {
        let mut json: serde_json::Value =
            serde_json::from_str(DEFAULT_EXERCISES_JSON).unwrap();
        json["exercises"]["squat"]["keypoints"]["left"] = serde_json::json!([11, 13, 17]);
        assert!(ProfileSet::from_json(&json.to_string()).is_err());
    }
}
