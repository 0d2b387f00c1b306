pub mod camera;
pub mod diag;
pub mod effects;
pub mod encoding;
mod graph;
pub mod ksh;
pub mod kson;
pub mod timing;

use std::collections::{BTreeMap, BTreeSet};

use thiserror::Error;

use camera::CameraInfo;
use effects::AudioEffectInfo;
pub use graph::*;

pub const NUM_BT_LANES: usize = 4;
pub const NUM_FX_LANES: usize = 2;
pub const NUM_LASER_LANES: usize = 2;

/// Absolute time in pulses. 240 pulses per quarter note.
pub type Pulse = i64;
/// A pulse value used as a duration.
pub type RelPulse = i64;

pub const RESOLUTION: Pulse = 240;
pub const RESOLUTION4: Pulse = RESOLUTION * 4;

/// Default interval for subdividing curved graph segments.
pub const CURVE_SUBDIVISION_INTERVAL: Pulse = RESOLUTION / 16;

pub type ByPulse<T> = BTreeMap<Pulse, T>;
pub type ByRelPulse<T> = BTreeMap<RelPulse, T>;
pub type ByMeasureIdx<T> = BTreeMap<i64, T>;

/// Ordered multimap; values sharing a pulse keep their insertion order.
pub type ByPulseMulti<T> = BTreeMap<Pulse, Vec<T>>;

/// String-keyed map with deterministic (key-ordered) iteration.
pub type Dict<T> = BTreeMap<String, T>;

pub type PulseSet = BTreeSet<Pulse>;

pub type BtLanes<T> = [ByPulse<T>; NUM_BT_LANES];
pub type FxLanes<T> = [ByPulse<T>; NUM_FX_LANES];
pub type LaserLanes<T> = [ByPulse<T>; NUM_LASER_LANES];

/// Entry with the largest key `<= key`, if any.
pub fn value_entry_at<K: Ord + Copy, V>(map: &BTreeMap<K, V>, key: K) -> Option<(K, &V)> {
    map.range(..=key).next_back().map(|(k, v)| (*k, v))
}

/// Step-function lookup: value of the largest key `<= key`, else `default`.
pub fn value_at_or_default<K: Ord + Copy, V: Clone>(map: &BTreeMap<K, V>, key: K, default: V) -> V {
    value_entry_at(map, key).map_or(default, |(_, v)| v.clone())
}

pub fn count_in_range<T>(map: &ByPulse<T>, start: Pulse, end: Pulse) -> usize {
    assert!(start <= end);
    map.range(start..end).count()
}

pub fn first_in_range<T>(map: &ByPulse<T>, start: Pulse, end: Pulse) -> Option<(Pulse, &T)> {
    assert!(start <= end);
    map.range(start..end).next().map(|(k, v)| (*k, v))
}

/// Interval whose span `[y, y + length)` contains `pulse`.
pub fn interval_at(map: &ByPulse<Interval>, pulse: Pulse) -> Option<(Pulse, &Interval)> {
    match value_entry_at(map, pulse) {
        Some((y, interval)) if pulse < y + interval.length => Some((y, interval)),
        _ => None,
    }
}

/// Rounds to eight decimal places, keeping the rounded value only if it is
/// within 1e-9 of the original (e.g. "0.700000004" -> "0.7").
pub fn remove_floating_point_error(value: f64) -> f64 {
    let rounded = (value * 1e8).round() / 1e8;
    if (rounded - value).abs() < 1e-9 {
        rounded
    } else {
        value
    }
}

pub fn almost_equals(a: f64, b: f64) -> bool {
    (a * 1e8).round() == (b * 1e8).round()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeSig {
    pub n: i32,
    pub d: i32,
}

impl Default for TimeSig {
    fn default() -> Self {
        TimeSig { n: 4, d: 4 }
    }
}

impl TimeSig {
    /// Parse from an "n/d" string; malformed parts fall back to 4.
    pub fn parse(s: &str) -> Self {
        let mut parts = s.split('/');
        let n = parts.next().unwrap_or("4").trim().parse().unwrap_or(4);
        let d = parts.next().unwrap_or("4").trim().parse().unwrap_or(4);
        TimeSig { n, d }
    }

    pub fn measure_pulses(&self) -> Pulse {
        if self.d == 0 {
            return 0;
        }
        RESOLUTION4 * self.n as Pulse / self.d as Pulse
    }
}

/// A note; `length == 0` is a chip note.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Interval {
    pub length: RelPulse,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DifficultyInfo {
    /// 0-3 in KSH.
    pub idx: i32,
    /// Empty unless the source carried a non-standard difficulty string.
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaInfo {
    pub title: String,
    pub title_translit: String,
    pub title_img_filename: String,
    pub artist: String,
    pub artist_translit: String,
    pub artist_img_filename: String,
    pub chart_author: String,
    pub difficulty: DifficultyInfo,
    pub level: i32,
    pub disp_bpm: String,
    pub std_bpm: f64,
    pub jacket_filename: String,
    pub jacket_author: String,
    pub icon_filename: String,
    pub information: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BeatInfo {
    pub bpm: ByPulse<f64>,
    pub time_sig: ByMeasureIdx<TimeSig>,
    pub scroll_speed: Graph,
    pub stop: ByPulse<RelPulse>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GaugeInfo {
    pub total: i32,
}

pub const LASER_X_SCALE_1X: i32 = 1;
pub const LASER_X_SCALE_2X: i32 = 2;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LaserSection {
    /// Laser points, relative to the section start.
    pub v: ByRelPulse<GraphPoint>,
    /// 1 or 2; 2 widens the section to 2x.
    pub w: i32,
}

impl LaserSection {
    pub fn new() -> Self {
        LaserSection {
            v: ByRelPulse::new(),
            w: LASER_X_SCALE_1X,
        }
    }

    pub fn wide(&self) -> bool {
        self.w == LASER_X_SCALE_2X
    }

    pub fn last_ry(&self) -> RelPulse {
        self.v.keys().next_back().copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct NoteInfo {
    pub bt: BtLanes<Interval>,
    pub fx: FxLanes<Interval>,
    pub laser: LaserLanes<LaserSection>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyBgmInfo {
    /// Filename of the song audio played when the gauge is under 70%.
    pub filename_f: String,
    /// Filename of the song audio played when the gauge is over 70%.
    pub filename_p: String,
    /// Filename of the song audio played on both conditions.
    pub filename_fp: String,
}

impl LegacyBgmInfo {
    pub fn is_empty(&self) -> bool {
        self.filename_f.is_empty() && self.filename_p.is_empty() && self.filename_fp.is_empty()
    }

    /// Filenames up to the last non-empty entry, for "m=a;b;c" emission.
    pub fn to_str_vec(&self) -> Vec<&str> {
        let mut v = vec![
            self.filename_f.as_str(),
            self.filename_p.as_str(),
            self.filename_fp.as_str(),
        ];
        while v.last() == Some(&"") {
            v.pop();
        }
        v
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BgmPreviewInfo {
    pub offset: i32,
    pub duration: i32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BgmInfo {
    pub filename: String,
    pub vol: f64,
    pub offset: i32,
    pub preview: BgmPreviewInfo,
    pub legacy: LegacyBgmInfo,
}

impl Default for BgmInfo {
    fn default() -> Self {
        BgmInfo {
            filename: String::new(),
            vol: 1.0,
            offset: 0,
            preview: BgmPreviewInfo::default(),
            legacy: LegacyBgmInfo::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KeySoundInvokeFx {
    pub vol: f64,
}

impl Default for KeySoundInvokeFx {
    fn default() -> Self {
        KeySoundInvokeFx { vol: 1.0 }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySoundFxInfo {
    pub chip_event: Dict<[ByPulse<KeySoundInvokeFx>; NUM_FX_LANES]>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySoundLaserLegacyInfo {
    /// "chokkakuautovol" in KSH format.
    pub vol_auto: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySoundLaserInfo {
    pub vol: ByPulse<f64>,
    pub slam_event: Dict<PulseSet>,
    pub legacy: KeySoundLaserLegacyInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySoundInfo {
    pub fx: KeySoundFxInfo,
    pub laser: KeySoundLaserInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioInfo {
    pub bgm: BgmInfo,
    pub key_sound: KeySoundInfo,
    pub audio_effect: AudioEffectInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaBgmInfo {
    pub filename: String,
    pub vol: f64,
    pub preview: BgmPreviewInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaAudioInfo {
    pub bgm: MetaBgmInfo,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KshLayerRotationInfo {
    /// Whether lane tilts affect rotation of the BG/layer.
    pub tilt: bool,
    /// Whether lane spins affect rotation of the BG/layer.
    pub spin: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KshBgInfo {
    pub filename: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct KshLayerInfo {
    pub filename: String,
    /// One-loop duration in milliseconds; negative plays backwards, zero is
    /// tempo-synchronized.
    pub duration: i32,
    pub rotation: KshLayerRotationInfo,
}

impl Default for KshLayerInfo {
    fn default() -> Self {
        KshLayerInfo {
            filename: String::new(),
            duration: 0,
            rotation: KshLayerRotationInfo {
                tilt: true,
                spin: true,
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KshMovieInfo {
    pub filename: String,
    /// Movie offset in milliseconds.
    pub offset: i32,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct LegacyBgInfo {
    /// First entry: gauge < 70%, second entry: gauge >= 70%.
    pub bg: [KshBgInfo; 2],
    pub layer: KshLayerInfo,
    pub movie: KshMovieInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct BgInfo {
    /// Reserved for future extension.
    pub filename: String,
    pub legacy: LegacyBgInfo,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct EditorInfo {
    pub app_name: String,
    pub app_version: String,
    pub comment: ByPulseMulti<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct KshUnknownInfo {
    pub meta: Dict<String>,
    pub option: Dict<ByPulseMulti<String>>,
    pub line: ByPulseMulti<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompatInfo {
    pub ksh_version: String,
    pub ksh_unknown: KshUnknownInfo,
}

impl CompatInfo {
    pub fn is_ksh_version_older_than(&self, ksh_version_int: i32) -> bool {
        if self.ksh_version.is_empty() {
            // This chart data is not converted from the KSH format
            return false;
        }
        let v = atoi(&self.ksh_version);
        (100..ksh_version_int).contains(&v)
    }
}

/// C-style atoi: parses an optionally signed digit prefix, 0 on no digits.
pub(crate) fn atoi(s: &str) -> i32 {
    let s = s.trim_start();
    let (sign, digits) = match s.strip_prefix('-') {
        Some(rest) => (-1i64, rest),
        None => (1i64, s.strip_prefix('+').unwrap_or(s)),
    };
    let end = digits
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(digits.len());
    let parsed: i64 = digits[..end].parse().unwrap_or(0);
    (sign * parsed).clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ChartError {
    #[error("IO error")]
    GeneralIo,
    #[error("File not found")]
    FileNotFound,
    #[error("Could not open input file stream")]
    CouldNotOpenInputFileStream,
    #[error("Could not open output file stream")]
    CouldNotOpenOutputFileStream,
    #[error("Chart format error")]
    GeneralChartFormat,
    #[error("KSON parse error")]
    KsonParse,
    #[error("Encoding error")]
    Encoding,
    #[error("Unknown error")]
    Unknown,
}

impl From<std::io::Error> for ChartError {
    fn from(_: std::io::Error) -> Self {
        ChartError::GeneralIo
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChartData {
    pub meta: MetaInfo,
    pub beat: BeatInfo,
    pub gauge: GaugeInfo,
    pub note: NoteInfo,
    pub audio: AudioInfo,
    pub camera: CameraInfo,
    pub bg: BgInfo,
    pub editor: EditorInfo,
    pub compat: CompatInfo,

    /// Opaque "impl" value carried through unchanged.
    pub impl_data: serde_json::Value,

    pub error: Option<ChartError>,
    pub warnings: Vec<String>,
}

impl ChartData {
    pub fn from_error(error: ChartError) -> Self {
        ChartData {
            error: Some(error),
            ..ChartData::default()
        }
    }

    /// Default chart contents as created by the chart editor.
    pub fn editor_default() -> Self {
        let mut chart = ChartData::default();
        chart.beat.bpm.insert(0, 120.0);
        chart.beat.time_sig.insert(0, TimeSig::default());
        chart
            .beat
            .scroll_speed
            .insert(0, GraphPoint::from_value(GraphValue::new(1.0)));
        chart.audio.bgm.vol = 0.75;
        chart
            .audio
            .audio_effect
            .laser
            .pulse_event
            .insert("peaking_filter".to_owned(), PulseSet::from([0]));
        chart
            .audio
            .audio_effect
            .laser
            .legacy
            .filter_gain
            .insert(0, 0.5);
        chart.audio.audio_effect.laser.peaking_filter_delay = 40;
        chart.audio.key_sound.laser.vol.insert(0, 0.5);
        chart
            .camera
            .tilt
            .insert(0, camera::TiltValue::Auto(camera::AutoTiltKind::Normal));
        chart.bg.legacy.bg[0].filename = "desert".to_owned();
        chart.bg.legacy.bg[1].filename = "desert".to_owned();
        chart.bg.legacy.layer.filename = "arrow".to_owned();
        chart
    }
}

/// Header-only chart data, for chart listings.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetaChartData {
    pub meta: MetaInfo,
    pub audio: MetaAudioInfo,

    pub error: Option<ChartError>,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_at_is_step_function() {
        let mut map = ByPulse::new();
        map.insert(0, 120.0);
        map.insert(960, 180.0);
        assert_eq!(value_at_or_default(&map, 0, 0.0), 120.0);
        assert_eq!(value_at_or_default(&map, 959, 0.0), 120.0);
        assert_eq!(value_at_or_default(&map, 960, 0.0), 180.0);
        assert_eq!(value_at_or_default(&map, 5000, 0.0), 180.0);
        assert_eq!(value_at_or_default(&map, -1, 0.0), 0.0);
    }

    #[test]
    fn range_queries_are_half_open() {
        let mut map = ByPulse::new();
        map.insert(0, ());
        map.insert(240, ());
        map.insert(480, ());
        assert_eq!(count_in_range(&map, 0, 480), 2);
        assert_eq!(count_in_range(&map, 0, 481), 3);
        assert_eq!(first_in_range(&map, 1, 480).map(|(y, _)| y), Some(240));
        assert_eq!(first_in_range(&map, 481, 960), None);
    }

    #[test]
    fn interval_at_covers_span() {
        let mut lane = ByPulse::new();
        lane.insert(240, Interval { length: 120 });
        assert!(interval_at(&lane, 239).is_none());
        assert_eq!(interval_at(&lane, 240).map(|(y, _)| y), Some(240));
        assert_eq!(interval_at(&lane, 359).map(|(y, _)| y), Some(240));
        assert!(interval_at(&lane, 360).is_none());
    }

    #[test]
    fn float_error_removal() {
        assert_eq!(remove_floating_point_error(0.700000004), 0.7);
        let kept = 1.66666666667;
        assert_eq!(remove_floating_point_error(kept), kept);
        assert!(almost_equals(0.7, 0.700000004));
        assert!(!almost_equals(0.7, 0.71));
    }

    #[test]
    fn ksh_version_comparison() {
        let mut compat = CompatInfo::default();
        assert!(!compat.is_ksh_version_older_than(160));
        compat.ksh_version = "120".to_owned();
        assert!(compat.is_ksh_version_older_than(160));
        compat.ksh_version = "171".to_owned();
        assert!(!compat.is_ksh_version_older_than(160));
        compat.ksh_version = "x".to_owned();
        assert!(!compat.is_ksh_version_older_than(160));
    }

    #[test]
    fn time_sig_parse() {
        let sig = TimeSig::parse("3/4");
        assert_eq!((sig.n, sig.d), (3, 4));
        assert_eq!(sig.measure_pulses(), 720);
        let bad = TimeSig::parse("nope");
        assert_eq!((bad.n, bad.d), (4, 4));
    }
}
