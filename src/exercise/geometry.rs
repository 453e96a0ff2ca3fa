/// 2次元平面上の点（画像ピクセル座標）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point2 {
    pub x: f32,
    pub y: f32,
}

impl Point2 {
    pub fn new(x: f32, y: f32) -> Self {
        Self { x, y }
    }

    /// 原点(0,0)は「無効キーポイント」を表す
    pub fn is_zero(self) -> bool {
        self.x == 0.0 && self.y == 0.0
    }

    fn is_finite(self) -> bool {
        self.x.is_finite() && self.y.is_finite()
    }
}

/// 3点 A-B-C がなす頂点Bの角度を度数で返す
///
/// 無効な点（ゼロ座標・非有限値）やゼロ長ベクトルの場合は None。
/// cos値は浮動小数点誤差で [-1, 1] をはみ出すことがあるためクランプする。
pub fn joint_angle(a: Point2, b: Point2, c: Point2) -> Option<f32> {
    if !a.is_finite() || !b.is_finite() || !c.is_finite() {
        return None;
    }
    if a.is_zero() || b.is_zero() || c.is_zero() {
        return None;
    }

    let (bax, bay) = (a.x - b.x, a.y - b.y);
    let (bcx, bcy) = (c.x - b.x, c.y - b.y);

    let ba_norm = (bax * bax + bay * bay).sqrt();
    let bc_norm = (bcx * bcx + bcy * bcy).sqrt();

    if ba_norm == 0.0 || bc_norm == 0.0 {
        return None;
    }

    let cosine = ((bax * bcx + bay * bcy) / (ba_norm * bc_norm)).clamp(-1.0, 1.0);
    Some(cosine.acos().to_degrees())
}
