use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use opencv::core::Mat;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::camera::{ConnectionState, ErrorCallback, FrameSource};
use crate::config::Config;
use crate::exercise::ExerciseEngine;
use crate::pose::{downscale_to_width, Pose, PoseEstimator};
use crate::publish::{StatePublisher, StateRecord, StatusRecord};

/// カウント変化がない場合の最大配信間隔
pub const DEFAULT_PUBLISH_INTERVAL: Duration = Duration::from_millis(500);

/// 配信ゲート
///
/// カウントが変化したら即時配信、変化がなくても一定間隔ごとに
/// ハートビートとして配信、それ以外は抑制する。定常状態の配信量を
/// 抑えつつ、カウント変化は遅延ゼロで伝える。
pub struct PublishGate {
    interval: Duration,
    last_count: Option<u32>,
    last_publish: Option<Instant>,
}

impl PublishGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_count: None,
            last_publish: None,
        }
    }

    /// 処理済みフレームごとに呼ぶ。配信すべきなら true。
    pub fn evaluate(&mut self, count: u32, now: Instant) -> bool {
        let count_changed = self.last_count != Some(count);
        let heartbeat_due = match self.last_publish {
            None => true,
            Some(last) => now.duration_since(last) >= self.interval,
        };

        if count_changed || heartbeat_due {
            self.last_count = Some(count);
            self.last_publish = Some(now);
            true
        } else {
            false
        }
    }
}

/// フレームソースの致命エラーを処理ループへ渡すスロットとコールバックの対
pub fn fatal_slot() -> (Arc<Mutex<Option<String>>>, ErrorCallback) {
    let slot: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let writer = slot.clone();
    let callback: ErrorCallback = Box::new(move |message| {
        *writer.lock().unwrap() = Some(message);
    });
    (slot, callback)
}

/// 取り込みパイプライン
///
/// フレームソースをポーリングし、スキップ・縮小・姿勢推定・カウント・
/// 配信ゲートの順に1フレームずつ処理する。エンジンと配信ゲートに
/// 触れるのはこのループだけで、キャプチャスレッドとの共有は
/// フレームソース内部に閉じている。
pub struct Service {
    engine: ExerciseEngine,
    detector: Box<dyn PoseEstimator>,
    publisher: Box<dyn StatePublisher>,
    source: FrameSource,
    gate: PublishGate,
    fatal: Arc<Mutex<Option<String>>>,
    running: Arc<AtomicBool>,
    session_start: DateTime<Utc>,
    frame_skip: u64,
    max_width: i32,
    confidence_threshold: f32,
    debug: bool,
    status_interval_frames: u64,
    processed: u64,
    last_seq: u64,
    last_count: u32,
    last_angle: Option<f32>,
}

impl Service {
    pub fn new(
        config: &Config,
        engine: ExerciseEngine,
        detector: Box<dyn PoseEstimator>,
        publisher: Box<dyn StatePublisher>,
        source: FrameSource,
        fatal: Arc<Mutex<Option<String>>>,
    ) -> Self {
        Self {
            engine,
            detector,
            publisher,
            source,
            gate: PublishGate::new(Duration::from_millis(config.publish.interval_ms)),
            fatal,
            running: Arc::new(AtomicBool::new(true)),
            session_start: Utc::now(),
            frame_skip: config.detection.frame_skip,
            max_width: config.detection.max_width,
            confidence_threshold: config.detection.confidence_threshold,
            debug: config.app.debug,
            status_interval_frames: config.app.status_interval_frames.max(1),
            processed: 0,
            last_seq: 0,
            last_count: 0,
            last_angle: None,
        }
    }

    /// 外部から停止要求を出すためのフラグ
    pub fn stop_handle(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// カウンタをゼロに戻し、セッション開始時刻を更新する
    pub fn reset(&mut self) {
        self.engine.reset();
        self.session_start = Utc::now();
        println!("Counter reset");
    }

    /// メインの処理ループ。停止要求かソースの致命エラーまでブロックする。
    pub fn run(&mut self) -> Result<()> {
        let kind = self.engine.kind();
        self.publish_status(StatusRecord::online(format!("Tracking {}", kind.name())));
        if let Err(e) = self.publisher.publish_discovery(kind) {
            eprintln!("Discovery publish failed: {e:#}");
        }

        while self.running.load(Ordering::Acquire) {
            if self.source.state() == ConnectionState::Stopped {
                let message = self
                    .fatal
                    .lock()
                    .unwrap()
                    .take()
                    .unwrap_or_else(|| "frame source stopped".to_string());
                self.finish(&message);
                bail!("frame source stopped: {message}");
            }

            let seq = self.source.frame_seq();
            if seq == self.last_seq {
                thread::sleep(Duration::from_millis(5));
                continue;
            }
            self.last_seq = seq;

            if self.frame_skip > 1 && seq % self.frame_skip != 0 {
                continue;
            }
            let Some(frame) = self.source.latest_frame() else {
                continue;
            };
            self.process_frame(&frame);
        }

        self.finish("Service stopped");
        Ok(())
    }

    fn process_frame(&mut self, frame: &Mat) {
        self.processed += 1;
        let now = Instant::now();

        let frame = match downscale_to_width(frame, self.max_width) {
            Ok(f) => f,
            Err(e) => {
                eprintln!("Downscale failed: {e:#}");
                return;
            }
        };

        // 推論失敗は一時的なものとして読み飛ばす。カウント状態は変えない。
        match self.detector.estimate(&frame) {
            Ok(poses) => {
                if let Some(mut pose) = Pose::select_best(poses) {
                    pose.zero_low_confidence(self.confidence_threshold);
                    if let Some(observation) = self.engine.observe(&pose, now) {
                        self.last_angle = Some(observation.angle);
                    }
                }
            }
            Err(e) => eprintln!("Pose inference failed: {e:#}"),
        }

        let count = self.engine.count();
        if self.gate.evaluate(count, now) {
            let record = StateRecord::new(
                count,
                self.engine.stage(),
                self.last_angle,
                self.engine.kind(),
                self.session_start,
            );
            if let Err(e) = self.publisher.publish_state(&record) {
                eprintln!("State publish failed: {e:#}");
            }
        }

        if count != self.last_count {
            println!(
                "Count updated: {} reps (stage: {})",
                count,
                self.engine.stage().as_str()
            );
            self.last_count = count;
        }

        if self.processed % self.status_interval_frames == 0 {
            let stats = self.source.stats();
            println!(
                "Status - processed: {} | count: {} | source frames: {} errors: {}",
                self.processed, count, stats.frame_count, stats.error_count
            );
        }
        if self.debug && self.processed % 100 == 0 {
            println!(
                "Processed {} frames | count: {} | stage: {}",
                self.processed,
                count,
                self.engine.stage().as_str()
            );
        }
    }

    /// 最終状態とオフライン通知を配信してキャプチャを止める
    fn finish(&mut self, message: &str) {
        let record = StateRecord::new(
            self.engine.count(),
            self.engine.stage(),
            self.last_angle,
            self.engine.kind(),
            self.session_start,
        );
        if let Err(e) = self.publisher.publish_state(&record) {
            eprintln!("Final state publish failed: {e:#}");
        }
        self.publish_status(StatusRecord::offline(message));
        self.source.stop();
    }

    fn publish_status(&mut self, record: StatusRecord) {
        if let Err(e) = self.publisher.publish_status(&record) {
            eprintln!("Status publish failed: {e:#}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FrameGrabber, FrameSourceOptions};
    use crate::exercise::{ExerciseKind, ProfileSet};
    use crate::pose::{Keypoint, KeypointIndex};

    fn at(base: Instant, millis: u64) -> Instant {
        base + Duration::from_millis(millis)
    }

    #[test]
    fn test_gate_first_evaluation_publishes() {
        let base = Instant::now();
        let mut gate = PublishGate::new(Duration::from_millis(500));
        assert!(gate.evaluate(0, base));
    }

    #[test]
    fn test_gate_heartbeat_cadence() {
        let base = Instant::now();
        let mut gate = PublishGate::new(Duration::from_millis(500));

        // カウント不変・10ms間隔の100観測: 初回 + 500msごとのハートビートのみ
        let mut publishes = 0;
        for i in 0..100u64 {
            if gate.evaluate(7, at(base, i * 10)) {
                publishes += 1;
            }
        }
        assert_eq!(publishes, 2, "t=0 and t=500 only");
    }

    #[test]
    fn test_gate_count_change_publishes_immediately() {
        let base = Instant::now();
        let mut gate = PublishGate::new(Duration::from_millis(500));

        assert!(gate.evaluate(0, at(base, 0)));
        assert!(!gate.evaluate(0, at(base, 100)));
        // 間隔内でもカウントが変われば即配信
        assert!(gate.evaluate(1, at(base, 110)));
        assert!(!gate.evaluate(1, at(base, 120)));
    }

    #[test]
    fn test_gate_suppresses_within_interval() {
        let base = Instant::now();
        let mut gate = PublishGate::new(Duration::from_millis(500));
        gate.evaluate(3, at(base, 0));
        for millis in [10u64, 100, 250, 499] {
            assert!(!gate.evaluate(3, at(base, millis)));
        }
        assert!(gate.evaluate(3, at(base, 500)));
    }

    // --- サービス全体のスモークテスト ---

    struct AlwaysOnGrabber;

    impl FrameGrabber for AlwaysOnGrabber {
        fn open(&mut self) -> Result<()> {
            Ok(())
        }
        fn read(&mut self) -> Result<Mat> {
            Ok(Mat::default())
        }
        fn release(&mut self) {}
    }

    /// 台本の膝角度列を順に返す偽検出器。台本が尽きたら最後の角度を繰り返す。
    struct ScriptedDetector {
        angles: Vec<f32>,
        pos: usize,
    }

    impl ScriptedDetector {
        fn pose_with_knee_angle(angle_deg: f32) -> Pose {
            let mut keypoints = [Keypoint::default(); KeypointIndex::COUNT];
            let rad = angle_deg.to_radians();
            for (hip, knee, ankle, x0) in
                [(11usize, 13usize, 15usize, 100.0f32), (12, 14, 16, 200.0)]
            {
                keypoints[knee] = Keypoint::new(x0, 100.0, 0.9);
                keypoints[hip] = Keypoint::new(x0, 50.0, 0.9);
                keypoints[ankle] =
                    Keypoint::new(x0 + 50.0 * rad.sin(), 100.0 - 50.0 * rad.cos(), 0.9);
            }
            Pose::new(keypoints)
        }
    }

    impl PoseEstimator for ScriptedDetector {
        fn estimate(&mut self, _frame: &Mat) -> Result<Vec<Pose>> {
            let angle = *self
                .angles
                .get(self.pos)
                .unwrap_or_else(|| self.angles.last().expect("script must not be empty"));
            self.pos += 1;
            Ok(vec![Self::pose_with_knee_angle(angle)])
        }
    }

    #[derive(Clone, Default)]
    struct RecordingPublisher {
        states: Arc<Mutex<Vec<StateRecord>>>,
        statuses: Arc<Mutex<Vec<&'static str>>>,
    }

    impl StatePublisher for RecordingPublisher {
        fn publish_state(&mut self, record: &StateRecord) -> Result<()> {
            self.states.lock().unwrap().push(record.clone());
            Ok(())
        }
        fn publish_status(&mut self, record: &StatusRecord) -> Result<()> {
            self.statuses.lock().unwrap().push(record.status);
            Ok(())
        }
        fn publish_discovery(&mut self, _kind: ExerciseKind) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_service_counts_one_squat() {
        let profiles = ProfileSet::load_default().unwrap();
        let engine = ExerciseEngine::new(&profiles, ExerciseKind::Squat, 5, Duration::ZERO);

        let detector = ScriptedDetector {
            // 立位で履歴を満たしてから沈み込み、立ち上がる
            angles: vec![
                175.0, 175.0, 175.0, 175.0, 175.0, 90.0, 88.0, 86.0, 85.0, 175.0, 175.0, 175.0,
            ],
            pos: 0,
        };
        let publisher = RecordingPublisher::default();
        let states = publisher.states.clone();
        let statuses = publisher.statuses.clone();

        let source = FrameSource::start(
            Box::new(AlwaysOnGrabber),
            FrameSourceOptions {
                reconnect_interval: Duration::from_millis(1),
                max_reconnect_attempts: 3,
                max_read_errors: 10,
                read_interval: Some(Duration::from_millis(1)),
                join_timeout: Duration::from_secs(2),
            },
            None,
            None,
        );

        let (fatal, _callback) = fatal_slot();
        let config = Config::default();
        let mut service = Service::new(
            &config,
            engine,
            Box::new(detector),
            Box::new(publisher),
            source,
            fatal,
        );
        let stop = service.stop_handle();

        let handle = thread::spawn(move || service.run());

        // カウント1の配信が現れるまで待つ
        let deadline = Instant::now() + Duration::from_secs(5);
        let mut counted = false;
        while Instant::now() < deadline {
            if states.lock().unwrap().iter().any(|r| r.count == 1) {
                counted = true;
                break;
            }
            thread::sleep(Duration::from_millis(10));
        }
        stop.store(false, Ordering::Release);
        handle.join().unwrap().unwrap();

        assert!(counted, "count never reached 1");
        {
            let states = states.lock().unwrap();
            assert!(states.iter().all(|r| r.exercise_type == "squat"));
            // カウントは単調非減少
            let counts: Vec<u32> = states.iter().map(|r| r.count).collect();
            assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
        }
        let statuses = statuses.lock().unwrap();
        assert_eq!(statuses.first(), Some(&"online"));
        assert_eq!(statuses.last(), Some(&"offline"));
    }

    #[test]
    fn test_service_halts_on_source_stop() {
        struct DeadGrabber;
        impl FrameGrabber for DeadGrabber {
            fn open(&mut self) -> Result<()> {
                bail!("no camera")
            }
            fn read(&mut self) -> Result<Mat> {
                bail!("no camera")
            }
            fn release(&mut self) {}
        }

        let profiles = ProfileSet::load_default().unwrap();
        let engine = ExerciseEngine::new(&profiles, ExerciseKind::Squat, 5, Duration::ZERO);
        let publisher = RecordingPublisher::default();
        let statuses = publisher.statuses.clone();

        let (fatal, callback) = fatal_slot();
        let source = FrameSource::start(
            Box::new(DeadGrabber),
            FrameSourceOptions {
                reconnect_interval: Duration::from_millis(1),
                max_reconnect_attempts: 2,
                max_read_errors: 2,
                read_interval: None,
                join_timeout: Duration::from_secs(2),
            },
            None,
            Some(callback),
        );

        let config = Config::default();
        let mut service = Service::new(
            &config,
            engine,
            Box::new(ScriptedDetector {
                angles: vec![175.0],
                pos: 0,
            }),
            Box::new(publisher),
            source,
            fatal,
        );

        // 再接続上限に達するとエラーで抜け、オフラインを配信している
        let err = service.run().unwrap_err();
        assert!(err.to_string().contains("frame source stopped"));
        assert_eq!(statuses.lock().unwrap().last(), Some(&"offline"));
    }
}
