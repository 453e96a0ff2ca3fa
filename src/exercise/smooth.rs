use std::collections::VecDeque;

/// デフォルトの平滑化ウィンドウ（サンプル数）
pub const DEFAULT_SMOOTHING_WINDOW: usize = 5;

/// 中央値ベースの外れ値除去つき角度平滑化フィルタ
///
/// 直近の生角度を固定容量のバッファに保持し、中央値から2σを超えて
/// 外れたサンプルを捨てた残りの平均を返す。トラッキングの単発の
/// 跳びをラグの大きいフィルタなしで吸収できる。
pub struct AngleSmoother {
    capacity: usize,
    history: VecDeque<f32>,
}

impl AngleSmoother {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            history: VecDeque::new(),
        }
    }

    /// 生角度を1つ取り込み、平滑化した値を返す
    ///
    /// バッファが3サンプル未満の間は統計量が立たないため生値をそのまま返す。
    /// 全サンプルが外れ値として捨てられた場合も生値にフォールバックする。
    pub fn push(&mut self, raw: f32) -> f32 {
        if self.history.len() == self.capacity {
            self.history.pop_front();
        }
        self.history.push_back(raw);

        if self.history.len() < 3 {
            return raw;
        }

        let samples: Vec<f32> = self.history.iter().copied().collect();
        let median = median(&samples);
        let std_dev = std_dev(&samples);

        let survivors: Vec<f32> = samples
            .iter()
            .copied()
            .filter(|v| (v - median).abs() <= 2.0 * std_dev)
            .collect();

        if survivors.is_empty() {
            raw
        } else {
            survivors.iter().sum::<f32>() / survivors.len() as f32
        }
    }

    pub fn reset(&mut self) {
        self.history.clear();
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }
}

fn median(samples: &[f32]) -> f32 {
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

/// 母標準偏差
fn std_dev(samples: &[f32]) -> f32 {
    let mean = samples.iter().sum::<f32>() / samples.len() as f32;
    let variance = samples.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / samples.len() as f32;
    variance.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: f32, b: f32, eps: f32) -> bool {
        (a - b).abs() < eps
    }

    #[test]
    fn test_passthrough_under_three_samples() {
        let mut s = AngleSmoother::new(5);
        assert_eq!(s.push(170.0), 170.0);
        assert_eq!(s.push(42.0), 42.0);
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn test_outlier_rejected() {
        let mut s = AngleSmoother::new(5);
        for v in [10.0, 10.0, 10.0, 10.0] {
            s.push(v);
        }
        // 外れ値 100 は中央値10から2σを超えるため捨てられる
        let smoothed = s.push(100.0);
        assert!(approx_eq(smoothed, 10.0, 1e-3), "got {smoothed}");
    }

    #[test]
    fn test_uniform_samples_pass() {
        let mut s = AngleSmoother::new(5);
        s.push(90.0);
        s.push(90.0);
        // σ=0: 全サンプルが中央値ちょうど → 全員生き残る
        let smoothed = s.push(90.0);
        assert!(approx_eq(smoothed, 90.0, 1e-6));
    }

    #[test]
    fn test_capacity_eviction() {
        let mut s = AngleSmoother::new(3);
        s.push(1.0);
        s.push(2.0);
        s.push(3.0);
        s.push(4.0);
        assert_eq!(s.len(), 3);
        // 最古の 1.0 は追い出されている: 残り [2,3,4] の中央値は3
        let smoothed = s.push(5.0);
        // [3,4,5] mean = 4
        assert!(approx_eq(smoothed, 4.0, 1e-3), "got {smoothed}");
    }

    #[test]
    fn test_median_even_count() {
        assert!(approx_eq(median(&[1.0, 2.0, 3.0, 4.0]), 2.5, 1e-6));
        assert!(approx_eq(median(&[3.0, 1.0, 2.0]), 2.0, 1e-6));
    }

    #[test]
    fn test_reset() {
        let mut s = AngleSmoother::new(5);
        for v in [10.0, 20.0, 30.0, 40.0] {
            s.push(v);
        }
        s.reset();
        assert!(s.is_empty());
        // リセット後は再びパススルー
        assert_eq!(s.push(77.0), 77.0);
    }
}
