use anyhow::{bail, Context, Result};
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture, VideoCaptureAPIs, VideoCaptureTrait},
};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// 映像ソースの指定
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VideoSource {
    /// ローカルカメラのデバイス番号
    Device(i32),
    /// ストリームURL または動画ファイルパス (rtsp://, http://, *.mp4 など)
    Url(String),
}

impl VideoSource {
    /// 設定文字列から変換。数値ならデバイス番号、それ以外はURL扱い。
    pub fn parse(s: &str) -> Self {
        match s.trim().parse::<i32>() {
            Ok(index) => Self::Device(index),
            Err(_) => Self::Url(s.to_string()),
        }
    }
}

impl fmt::Display for VideoSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(index) => write!(f, "device {index}"),
            Self::Url(url) => write!(f, "{url}"),
        }
    }
}

/// フレーム取得のシーム
///
/// キャプチャループはこのトレイト越しにソースを扱うため、
/// 再接続ロジックを実デバイスなしでテストできる。
pub trait FrameGrabber: Send {
    /// ソースを開き、検証読みまで行う。失敗したら Err。
    fn open(&mut self) -> Result<()>;
    /// 次のフレームを読む
    fn read(&mut self) -> Result<Mat>;
    /// ソースを解放する（冪等）
    fn release(&mut self);
}

/// OpenCV VideoCapture によるフレーム取得
pub struct OpenCvGrabber {
    source: VideoSource,
    open_timeout_ms: u64,
    read_timeout_ms: u64,
    capture: Option<VideoCapture>,
}

impl OpenCvGrabber {
    pub fn new(source: VideoSource, open_timeout_ms: u64, read_timeout_ms: u64) -> Self {
        Self {
            source,
            open_timeout_ms,
            read_timeout_ms,
            capture: None,
        }
    }
}

impl FrameGrabber for OpenCvGrabber {
    fn open(&mut self) -> Result<()> {
        // 既存の接続があれば先に解放する
        self.release();

        let mut capture = match &self.source {
            VideoSource::Device(index) => {
                VideoCapture::new(*index, VideoCaptureAPIs::CAP_ANY as i32)
                    .context("Failed to open camera")?
            }
            VideoSource::Url(url) => {
                VideoCapture::from_file(url, VideoCaptureAPIs::CAP_FFMPEG as i32)
                    .context("Failed to open stream")?
            }
        };

        if !capture.is_opened()? {
            bail!("Video source {} is not available", self.source);
        }

        capture.set(videoio::CAP_PROP_OPEN_TIMEOUT_MSEC, self.open_timeout_ms as f64)?;
        capture.set(videoio::CAP_PROP_READ_TIMEOUT_MSEC, self.read_timeout_ms as f64)?;
        // 遅延最小化のためバッファは1フレーム
        capture.set(videoio::CAP_PROP_BUFFERSIZE, 1.0)?;

        // 検証読み: 1フレーム読めて初めて接続成立とみなす
        let mut frame = Mat::default();
        if !capture.read(&mut frame)? || frame.empty() {
            bail!("Validation read from {} failed", self.source);
        }

        let width = capture.get(videoio::CAP_PROP_FRAME_WIDTH)? as u32;
        let height = capture.get(videoio::CAP_PROP_FRAME_HEIGHT)? as u32;
        println!("Connected to {} ({}x{})", self.source, width, height);

        self.capture = Some(capture);
        Ok(())
    }

    fn read(&mut self) -> Result<Mat> {
        let capture = self.capture.as_mut().context("Not connected")?;
        let mut frame = Mat::default();
        if !capture.read(&mut frame)? {
            bail!("Failed to read frame");
        }
        if frame.empty() {
            bail!("Empty frame received");
        }
        Ok(frame)
    }

    fn release(&mut self) {
        if let Some(mut capture) = self.capture.take() {
            let _ = capture.release();
        }
    }
}

/// 接続状態
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// 再接続上限に達して停止。以後キャプチャは行われない。
    Stopped,
}

/// キャプチャ統計のスナップショット
#[derive(Debug, Clone, Copy)]
pub struct FrameSourceStats {
    pub state: ConnectionState,
    /// 読み込みに成功したフレームの累計
    pub frame_count: u64,
    /// 連続読み込み失敗数。成功のたびに0へ戻る。
    pub error_count: u32,
    pub reconnect_attempts: u32,
}

/// キャプチャループの動作設定
#[derive(Debug, Clone)]
pub struct FrameSourceOptions {
    /// 接続失敗・強制切断後のバックオフ
    pub reconnect_interval: Duration,
    /// 連続再接続失敗の上限。超えたら Stopped。
    pub max_reconnect_attempts: u32,
    /// 強制切断までの連続読み込み失敗数
    pub max_read_errors: u32,
    /// 固定レートソース用の読み込み間隔（None なら全速）
    pub read_interval: Option<Duration>,
    /// stop() がキャプチャスレッドの終了を待つ上限
    pub join_timeout: Duration,
}

impl Default for FrameSourceOptions {
    fn default() -> Self {
        Self {
            reconnect_interval: Duration::from_secs(5),
            max_reconnect_attempts: 10,
            max_read_errors: 10,
            read_interval: None,
            join_timeout: Duration::from_secs(5),
        }
    }
}

pub type FrameCallback = Box<dyn FnMut(&Mat, u64) + Send>;
pub type ErrorCallback = Box<dyn FnOnce(String) + Send>;

struct Shared {
    state: ConnectionState,
    frame_count: u64,
    error_count: u32,
    reconnect_attempts: u32,
    last_frame: Option<Mat>,
}

/// 別スレッドでキャプチャを行い、切断時は自動で再接続するフレームソース
///
/// 共有されるのは最新フレームと統計のみで、どちらも単一のミューテックスで
/// 守る。ロックはコピーの間だけ保持し、推論やカウント処理はロック外で行う
/// こと。再接続の待ち時間はキャプチャスレッドだけが負担し、公開APIは
/// ブロックしない。
pub struct FrameSource {
    shared: Arc<Mutex<Shared>>,
    seq: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    join_timeout: Duration,
    handle: Option<thread::JoinHandle<()>>,
}

impl FrameSource {
    /// キャプチャスレッドを起動する
    ///
    /// on_frame はフレームごとに (フレーム, 通し番号) で呼ばれる。
    /// on_error は再接続上限に達したとき一度だけ呼ばれる。
    pub fn start(
        grabber: Box<dyn FrameGrabber>,
        options: FrameSourceOptions,
        on_frame: Option<FrameCallback>,
        on_error: Option<ErrorCallback>,
    ) -> Self {
        let shared = Arc::new(Mutex::new(Shared {
            state: ConnectionState::Disconnected,
            frame_count: 0,
            error_count: 0,
            reconnect_attempts: 0,
            last_frame: None,
        }));
        let seq = Arc::new(AtomicU64::new(0));
        let running = Arc::new(AtomicBool::new(true));

        let join_timeout = options.join_timeout;
        let handle = {
            let shared = shared.clone();
            let seq = seq.clone();
            let running = running.clone();
            thread::spawn(move || {
                capture_loop(grabber, shared, seq, running, options, on_frame, on_error);
            })
        };

        Self {
            shared,
            seq,
            running,
            join_timeout,
            handle: Some(handle),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.shared.lock().unwrap().state
    }

    pub fn stats(&self) -> FrameSourceStats {
        let shared = self.shared.lock().unwrap();
        FrameSourceStats {
            state: shared.state,
            frame_count: shared.frame_count,
            error_count: shared.error_count,
            reconnect_attempts: shared.reconnect_attempts,
        }
    }

    /// 最新フレームの通し番号。新フレーム到着のたびに増える。
    pub fn frame_seq(&self) -> u64 {
        self.seq.load(Ordering::Acquire)
    }

    /// 最新フレームのコピーを取得する
    ///
    /// 返るのは常にコピーで、キャプチャスレッドが書き込み中のバッファを
    /// 呼び出し側が観測することはない。
    pub fn latest_frame(&self) -> Option<Mat> {
        let shared = self.shared.lock().unwrap();
        shared.last_frame.as_ref().map(|m| m.clone())
    }

    /// キャプチャを停止してスレッドの終了を待つ（上限つき）
    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            // std のスレッドにタイムアウトつき join はないため、
            // 終了をポーリングして上限を超えたら切り離す
            let deadline = Instant::now() + self.join_timeout;
            while !handle.is_finished() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(10));
            }
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                eprintln!("Capture thread did not stop within {:?}, detaching", self.join_timeout);
            }
        }
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn capture_loop(
    mut grabber: Box<dyn FrameGrabber>,
    shared: Arc<Mutex<Shared>>,
    seq: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    options: FrameSourceOptions,
    mut on_frame: Option<FrameCallback>,
    mut on_error: Option<ErrorCallback>,
) {
    let mut reconnect_attempts: u32 = 0;

    while running.load(Ordering::Acquire) {
        let connected = shared.lock().unwrap().state == ConnectionState::Connected;

        if !connected {
            if reconnect_attempts >= options.max_reconnect_attempts {
                eprintln!(
                    "Giving up after {} reconnect attempts",
                    options.max_reconnect_attempts
                );
                shared.lock().unwrap().state = ConnectionState::Stopped;
                if let Some(callback) = on_error.take() {
                    callback("max reconnect attempts reached".to_string());
                }
                break;
            }

            reconnect_attempts += 1;
            {
                let mut s = shared.lock().unwrap();
                s.state = ConnectionState::Connecting;
                s.reconnect_attempts = reconnect_attempts;
            }
            println!(
                "Connecting... (attempt {}/{})",
                reconnect_attempts, options.max_reconnect_attempts
            );

            match grabber.open() {
                Ok(()) => {
                    reconnect_attempts = 0;
                    let mut s = shared.lock().unwrap();
                    s.state = ConnectionState::Connected;
                    s.error_count = 0;
                    s.reconnect_attempts = 0;
                }
                Err(e) => {
                    eprintln!("Connection failed: {e:#}");
                    shared.lock().unwrap().state = ConnectionState::Disconnected;
                    sleep_while_running(&running, options.reconnect_interval);
                }
            }
            continue;
        }

        match grabber.read() {
            Ok(frame) => {
                let frame_number = {
                    let mut s = shared.lock().unwrap();
                    s.frame_count += 1;
                    s.error_count = 0;
                    s.last_frame = Some(frame.clone());
                    s.frame_count
                };
                seq.store(frame_number, Ordering::Release);

                if let Some(callback) = on_frame.as_mut() {
                    callback(&frame, frame_number);
                }
                if let Some(interval) = options.read_interval {
                    sleep_while_running(&running, interval);
                }
            }
            Err(e) => {
                let errors = {
                    let mut s = shared.lock().unwrap();
                    s.error_count += 1;
                    s.error_count
                };
                eprintln!("Frame read failed ({errors}): {e:#}");

                if errors > options.max_read_errors {
                    eprintln!("Too many read errors, reconnecting");
                    shared.lock().unwrap().state = ConnectionState::Disconnected;
                    grabber.release();
                    sleep_while_running(&running, options.reconnect_interval);
                }
            }
        }
    }

    grabber.release();
    let mut s = shared.lock().unwrap();
    if s.state != ConnectionState::Stopped {
        s.state = ConnectionState::Disconnected;
    }
}

/// running フラグを見ながら上限まで眠る。停止要求が来たら早く抜ける。
fn sleep_while_running(running: &AtomicBool, total: Duration) {
    let step = Duration::from_millis(50);
    let deadline = Instant::now() + total;
    while running.load(Ordering::Acquire) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        thread::sleep((deadline - now).min(step));
    }
}
