use crate::{value_entry_at, ByPulse, Graph, GraphCurve, Pulse, RelPulse};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoTiltKind {
    Normal,
    Bigger,
    Biggest,
    KeepNormal,
    KeepBigger,
    KeepBiggest,
    Zero,
}

impl AutoTiltKind {
    pub fn scale(&self) -> f64 {
        match self {
            AutoTiltKind::Zero => 0.0,
            AutoTiltKind::Normal | AutoTiltKind::KeepNormal => 1.0,
            AutoTiltKind::Bigger | AutoTiltKind::KeepBigger => 1.75,
            AutoTiltKind::Biggest | AutoTiltKind::KeepBiggest => 2.5,
        }
    }

    pub fn is_keep(&self) -> bool {
        matches!(
            self,
            AutoTiltKind::KeepNormal | AutoTiltKind::KeepBigger | AutoTiltKind::KeepBiggest
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AutoTiltKind::Normal => "normal",
            AutoTiltKind::Bigger => "bigger",
            AutoTiltKind::Biggest => "biggest",
            AutoTiltKind::KeepNormal => "keep_normal",
            AutoTiltKind::KeepBigger => "keep_bigger",
            AutoTiltKind::KeepBiggest => "keep_biggest",
            AutoTiltKind::Zero => "zero",
        }
    }

    /// Unknown names resolve to `Normal`.
    pub fn from_name(s: &str) -> Self {
        match s {
            "bigger" => AutoTiltKind::Bigger,
            "biggest" => AutoTiltKind::Biggest,
            "keep_normal" => AutoTiltKind::KeepNormal,
            "keep_bigger" => AutoTiltKind::KeepBigger,
            "keep_biggest" => AutoTiltKind::KeepBiggest,
            "zero" => AutoTiltKind::Zero,
            _ => AutoTiltKind::Normal,
        }
    }
}

/// The second half of a manual tilt transition: either another manual value
/// or an auto-tilt state entered instantaneously.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TiltVf {
    Value(f64),
    Auto(AutoTiltKind),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltGraphValue {
    pub v: f64,
    pub vf: TiltVf,
}

impl TiltGraphValue {
    pub fn new(v: f64) -> Self {
        TiltGraphValue {
            v,
            vf: TiltVf::Value(v),
        }
    }

    pub fn with_transition(v: f64, vf: TiltVf) -> Self {
        TiltGraphValue { v, vf }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TiltGraphPoint {
    pub v: TiltGraphValue,
    pub curve: GraphCurve,
}

impl TiltGraphPoint {
    pub fn new(v: f64) -> Self {
        TiltGraphPoint {
            v: TiltGraphValue::new(v),
            curve: GraphCurve::default(),
        }
    }

    pub fn from_value(v: TiltGraphValue) -> Self {
        TiltGraphPoint {
            v,
            curve: GraphCurve::default(),
        }
    }

    pub fn with_curve(v: TiltGraphValue, curve: GraphCurve) -> Self {
        TiltGraphPoint { v, curve }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TiltValue {
    Auto(AutoTiltKind),
    Manual(TiltGraphPoint),
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CamPatternInvokeSpin {
    /// Laser slam direction, -1 (left) or 1 (right).
    pub d: i32,
    pub length: RelPulse,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CamPatternInvokeSwingValue {
    pub scale: f64,
    pub repeat: i32,
    /// Order of the decay that scales camera values (0-2).
    pub decay_order: i32,
}

impl Default for CamPatternInvokeSwingValue {
    fn default() -> Self {
        CamPatternInvokeSwingValue {
            scale: 250.0,
            repeat: 1,
            decay_order: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CamPatternInvokeSwing {
    pub d: i32,
    pub length: RelPulse,
    pub v: CamPatternInvokeSwingValue,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CamGraphs {
    pub zoom_top: Graph,
    pub zoom_bottom: Graph,
    pub zoom_side: Graph,
    pub rotation_deg: Graph,
    pub center_split: Graph,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CamPatternLaserInvokeList {
    pub spin: ByPulse<CamPatternInvokeSpin>,
    pub half_spin: ByPulse<CamPatternInvokeSpin>,
    pub swing: ByPulse<CamPatternInvokeSwing>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CamPatternLaserInfo {
    pub slam_event: CamPatternLaserInvokeList,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CamPatternInfo {
    pub laser: CamPatternLaserInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CamInfo {
    pub body: CamGraphs,
    pub pattern: CamPatternInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CameraInfo {
    pub tilt: ByPulse<TiltValue>,
    pub cam: CamInfo,
}

/// Manual tilt value at `pulse`, interpolating a point's `vf` toward the next
/// manual point's `v` with the point's curve applied. `None` while an auto
/// tilt state is active.
pub fn manual_tilt_value_at(tilt: &ByPulse<TiltValue>, pulse: Pulse) -> Option<f64> {
    let (current_pulse, current) = value_entry_at(tilt, pulse)?;

    let TiltValue::Manual(current_point) = current else {
        return None;
    };
    let TiltVf::Value(current_vf) = current_point.v.vf else {
        return None;
    };

    match tilt.range(current_pulse + 1..).next() {
        Some((&next_pulse, TiltValue::Manual(next_point))) => {
            let segment_length = next_pulse - current_pulse;
            if segment_length <= 0 {
                return Some(next_point.v.v);
            }
            let lerp_rate = (pulse - current_pulse) as f64 / segment_length as f64;
            let curve_value = current_point.curve.evaluate(lerp_rate);
            Some(current_vf + (next_point.v.v - current_vf) * curve_value)
        }
        _ => Some(current_vf),
    }
}

pub fn auto_tilt_scale_at(tilt: &ByPulse<TiltValue>, pulse: Pulse) -> f64 {
    match value_entry_at(tilt, pulse) {
        Some((_, TiltValue::Auto(kind))) => kind.scale(),
        _ => 1.0,
    }
}

pub fn auto_tilt_keep_at(tilt: &ByPulse<TiltValue>, pulse: Pulse) -> bool {
    matches!(
        value_entry_at(tilt, pulse),
        Some((_, TiltValue::Auto(kind))) if kind.is_keep()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auto_tilt_scales() {
        assert_eq!(AutoTiltKind::Zero.scale(), 0.0);
        assert_eq!(AutoTiltKind::Normal.scale(), 1.0);
        assert_eq!(AutoTiltKind::KeepBigger.scale(), 1.75);
        assert_eq!(AutoTiltKind::Biggest.scale(), 2.5);
        assert!(AutoTiltKind::KeepNormal.is_keep());
        assert!(!AutoTiltKind::Bigger.is_keep());
    }

    #[test]
    fn tilt_name_round_trip() {
        for kind in [
            AutoTiltKind::Normal,
            AutoTiltKind::Bigger,
            AutoTiltKind::Biggest,
            AutoTiltKind::KeepNormal,
            AutoTiltKind::KeepBigger,
            AutoTiltKind::KeepBiggest,
            AutoTiltKind::Zero,
        ] {
            assert_eq!(AutoTiltKind::from_name(kind.as_str()), kind);
        }
    }

    #[test]
    fn manual_tilt_interpolates() {
        let mut tilt = ByPulse::new();
        tilt.insert(0, TiltValue::Manual(TiltGraphPoint::new(0.0)));
        tilt.insert(100, TiltValue::Manual(TiltGraphPoint::new(2.0)));
        assert_eq!(manual_tilt_value_at(&tilt, 0), Some(0.0));
        assert_eq!(manual_tilt_value_at(&tilt, 50), Some(1.0));
        assert_eq!(manual_tilt_value_at(&tilt, 100), Some(2.0));
        assert_eq!(manual_tilt_value_at(&tilt, 500), Some(2.0));
    }

    #[test]
    fn auto_tilt_masks_manual_lookup() {
        let mut tilt = ByPulse::new();
        tilt.insert(0, TiltValue::Auto(AutoTiltKind::Bigger));
        assert_eq!(manual_tilt_value_at(&tilt, 100), None);
        assert_eq!(auto_tilt_scale_at(&tilt, 100), 1.75);
        assert!(!auto_tilt_keep_at(&tilt, 100));
    }
}
