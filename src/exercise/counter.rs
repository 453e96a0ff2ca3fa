use std::time::{Duration, Instant};

use crate::pose::Pose;

use super::geometry::{joint_angle, Point2};
use super::profile::{ExerciseKind, ExerciseProfile, ProfileSet};
use super::smooth::AngleSmoother;

/// 連続カウント抑止の最小レップ間隔
pub const DEFAULT_MIN_REP_INTERVAL: Duration = Duration::from_millis(500);

/// レップサイクル内の位相
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Unset,
    Up,
    Down,
}

impl Stage {
    /// 配信メッセージ用の文字列表現
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unset => "unknown",
            Self::Up => "up",
            Self::Down => "down",
        }
    }
}

/// 1レーン分のレップ状態機械
///
/// 角度が up_angle を超えると Up、Up 状態から down_angle を下回ると
/// Down に遷移してカウントする。直前のカウントから最小間隔が経って
/// いない場合は遷移ごと抑止する（ノイズの往復による二重カウント防止）。
#[derive(Debug)]
pub struct RepMachine {
    up_angle: f32,
    down_angle: f32,
    min_rep_interval: Duration,
    stage: Stage,
    count: u32,
    last_rep: Option<Instant>,
}

impl RepMachine {
    pub fn new(up_angle: f32, down_angle: f32, min_rep_interval: Duration) -> Self {
        Self {
            up_angle,
            down_angle,
            min_rep_interval,
            stage: Stage::Unset,
            count: 0,
            last_rep: None,
        }
    }

    /// 角度を1観測ぶん進める。カウントが発生したら true。
    pub fn advance(&mut self, angle: f32, now: Instant) -> bool {
        if angle > self.up_angle {
            // 冪等: 既に Up でも何も起きない
            self.stage = Stage::Up;
            false
        } else if angle < self.down_angle
            && self.stage == Stage::Up
            && self.interval_elapsed(now)
        {
            self.stage = Stage::Down;
            self.count += 1;
            self.last_rep = Some(now);
            true
        } else {
            false
        }
    }

    fn interval_elapsed(&self, now: Instant) -> bool {
        match self.last_rep {
            None => true,
            Some(last) => now.duration_since(last) >= self.min_rep_interval,
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn reset(&mut self) {
        self.stage = Stage::Unset;
        self.count = 0;
        self.last_rep = None;
    }
}

/// 種目に応じたレーン構成
///
/// 通常種目は左右の角度を平均して平滑化し、1つの状態機械で数える。
/// 脚系の種目は左右を独立に数える（平滑化なし・片脚ごとに1レップ）。
enum Lanes {
    Averaged {
        machine: RepMachine,
        smoother: AngleSmoother,
    },
    PerLimb {
        left: RepMachine,
        right: RepMachine,
    },
}

/// 1観測の結果
#[derive(Debug, Clone, Copy)]
pub struct Observation {
    /// 表示用角度。平均種目は平滑化後、独立種目は左右の算術平均。
    pub angle: f32,
    pub count: u32,
    pub stage: Stage,
    /// この観測で加算されたレップ数（独立種目では最大2）
    pub reps_added: u32,
}

/// 種目カウントエンジン
///
/// 検証済みプロファイル一式と種目を受け取って構築するため、
/// 実行中に「未知の種目」が現れることはない。
pub struct ExerciseEngine {
    kind: ExerciseKind,
    profile: ExerciseProfile,
    lanes: Lanes,
}

impl ExerciseEngine {
    pub fn new(
        profiles: &ProfileSet,
        kind: ExerciseKind,
        smoothing_window: usize,
        min_rep_interval: Duration,
    ) -> Self {
        let profile = profiles.get(kind).clone();
        let lanes = if profile.is_leg_exercise {
            Lanes::PerLimb {
                left: RepMachine::new(profile.up_angle, profile.down_angle, min_rep_interval),
                right: RepMachine::new(profile.up_angle, profile.down_angle, min_rep_interval),
            }
        } else {
            Lanes::Averaged {
                machine: RepMachine::new(profile.up_angle, profile.down_angle, min_rep_interval),
                smoother: AngleSmoother::new(smoothing_window),
            }
        };
        Self {
            kind,
            profile,
            lanes,
        }
    }

    /// キーポイント1式を1観測として処理する
    ///
    /// 左右どちらかの角度が計算不能（無効キーポイント・縮退ジオメトリ）
    /// なら None を返し、状態には一切触れない。部分的な更新はしない。
    pub fn observe(&mut self, pose: &Pose, now: Instant) -> Option<Observation> {
        let triples = &self.profile.keypoints;
        let left = triple_angle(pose, &triples.left)?;
        let right = triple_angle(pose, &triples.right)?;

        let before = self.count();
        let angle = match &mut self.lanes {
            Lanes::Averaged { machine, smoother } => {
                let smoothed = smoother.push((left + right) / 2.0);
                machine.advance(smoothed, now);
                smoothed
            }
            Lanes::PerLimb {
                left: left_machine,
                right: right_machine,
            } => {
                left_machine.advance(left, now);
                right_machine.advance(right, now);
                (left + right) / 2.0
            }
        };

        let count = self.count();
        Some(Observation {
            angle,
            count,
            stage: self.stage(),
            reps_added: count - before,
        })
    }

    pub fn kind(&self) -> ExerciseKind {
        self.kind
    }

    /// 現在のカウント。独立レーン種目は左右の合計。
    pub fn count(&self) -> u32 {
        match &self.lanes {
            Lanes::Averaged { machine, .. } => machine.count(),
            Lanes::PerLimb { left, right } => left.count() + right.count(),
        }
    }

    /// 現在のステージ。独立レーン種目は左右それぞれが位相を持つため
    /// 合成ステージは Unset のまま（limb_stages を参照）。
    pub fn stage(&self) -> Stage {
        match &self.lanes {
            Lanes::Averaged { machine, .. } => machine.stage(),
            Lanes::PerLimb { .. } => Stage::Unset,
        }
    }

    /// 独立レーン種目の (左, 右) ステージ
    pub fn limb_stages(&self) -> Option<(Stage, Stage)> {
        match &self.lanes {
            Lanes::Averaged { .. } => None,
            Lanes::PerLimb { left, right } => Some((left.stage(), right.stage())),
        }
    }

    /// 全状態をクリアする。カウントを下げる唯一の操作。
    pub fn reset(&mut self) {
        match &mut self.lanes {
            Lanes::Averaged { machine, smoother } => {
                machine.reset();
                smoother.reset();
            }
            Lanes::PerLimb { left, right } => {
                left.reset();
                right.reset();
            }
        }
    }
}

fn triple_angle(pose: &Pose, triple: &[usize; 3]) -> Option<f32> {
    let point = |i: usize| {
        let kp = &pose.keypoints[i];
        Point2::new(kp.x, kp.y)
    };
    joint_angle(point(triple[0]), point(triple[1]), point(triple[2]))
}
