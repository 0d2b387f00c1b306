//! KSH text format support.
//!
//! The KSH format is line-oriented: a `key=value` header terminated by `--`,
//! then measures of chart lines (`BBBB|FF|LL` plus an optional spin suffix)
//! interleaved with option lines, also terminated by `--`. Timing inside a
//! measure is resolution-independent: each chart line is one subdivision slot
//! of the measure under the running time signature.

mod read;
mod write;

pub use read::{load_chart, load_chart_from_path, load_chart_with_diag, load_meta};
pub use write::{save_chart, save_chart_to_path, save_chart_with_diag};

use crate::effects::AudioEffectKind;
use crate::{almost_equals, Pulse, RelPulse, RESOLUTION4};

pub(crate) const OPTION_SEPARATOR: char = '=';
pub(crate) const BLOCK_SEPARATOR: u8 = b'|';
pub(crate) const MEASURE_SEPARATOR: &[u8] = b"--";
pub(crate) const AUDIO_EFFECT_STR_SEPARATOR: char = ';';

/// KSH resolution: 192 pulses per 4/4 measure, used by `stop=`, `@` and `S`
/// length fields.
pub(crate) const KSH_RESOLUTION4: Pulse = 192;

pub(crate) const LASER_X_MAX: i32 = 50;

// Version gates
pub(crate) const VER_BPM_LIMIT_ADDED: i32 = 130;
pub(crate) const VER_FX_FORMAT_CHANGED: i32 = 160;
pub(crate) const VER_LAYER_DELIMITER_CHANGED: i32 = 166;
pub(crate) const VER_ZOOM_LIMIT_EXTENDED: i32 = 167;
pub(crate) const VER_MANUAL_TILT_SCALE_CHANGED: i32 = 170;

pub(crate) const BPM_MAX: f64 = 65535.0;
pub(crate) const ZOOM_ABS_MAX_LEGACY: f64 = 300.0;
pub(crate) const ZOOM_ABS_MAX: f64 = 65535.0;
pub(crate) const ZOOM_MAX_CHAR_LEGACY: usize = 4;
pub(crate) const CENTER_SPLIT_ABS_MAX: f64 = 65535.0;
pub(crate) const MANUAL_TILT_ABS_MAX: f64 = 1000.0;
pub(crate) const ROTATION_DEG_ABS_MAX: f64 = 65535.0;

pub(crate) fn to_ksh_resolution(pulse: Pulse) -> i64 {
    pulse * KSH_RESOLUTION4 / RESOLUTION4
}

pub(crate) fn ksh_length_to_rel_pulse(n: i64) -> RelPulse {
    n * RESOLUTION4 / KSH_RESOLUTION4
}

/// Rounds to the 3 decimal places the KSH format carries.
pub(crate) fn round_to_ksh_value(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

/// Formats with up to 3 decimal places, trailing zeros removed.
pub(crate) fn format_ksh_value(value: f64) -> String {
    let mut s = format!("{:.3}", round_to_ksh_value(value));
    while s.ends_with('0') {
        s.pop();
    }
    if s.ends_with('.') {
        s.pop();
    }
    if s == "-0" {
        s = "0".to_owned();
    }
    s
}

/// Laser character alphabet: '0'-'9' = 0-9, 'A'-'Z' = 10-35, 'a'-'o' = 36-50.
pub(crate) fn char_to_laser_x(c: u8) -> i32 {
    match c {
        b'0'..=b'9' => (c - b'0') as i32,
        b'A'..=b'Z' => (c - b'A') as i32 + 10,
        b'a'..=b'o' => (c - b'a') as i32 + 36,
        _ => 0,
    }
}

pub(crate) fn laser_x_to_char(laser_x: i32) -> u8 {
    match laser_x {
        0..=9 => b'0' + laser_x as u8,
        10..=35 => b'A' + (laser_x - 10) as u8,
        36..=50 => b'a' + (laser_x - 36) as u8,
        _ => b'0',
    }
}

const LEFT_ZERO_LASER_X: i32 = 12; // 'C'
const RIGHT_ZERO_LASER_X: i32 = 37; // 'b'

/// Laser x (0-50) to graph value (0.0-1.0). Wide lasers keep the legacy
/// "zero" positions 'C' and 'b' exactly at 0.25 / 0.75.
pub(crate) fn laser_x_to_graph_value(laser_x: i32, wide: bool) -> f64 {
    if wide {
        if laser_x == LEFT_ZERO_LASER_X {
            return 0.25;
        }
        if laser_x == RIGHT_ZERO_LASER_X {
            return 0.75;
        }
    }
    laser_x as f64 / LASER_X_MAX as f64
}

pub(crate) fn graph_value_to_laser_x(graph_value: f64, wide: bool) -> i32 {
    if wide {
        if almost_equals(graph_value, 0.25) {
            return LEFT_ZERO_LASER_X;
        }
        if almost_equals(graph_value, 0.75) {
            return RIGHT_ZERO_LASER_X;
        }
    }
    ((graph_value * LASER_X_MAX as f64).round() as i32).clamp(0, LASER_X_MAX)
}

/// Pre-v1.60 single-character FX notation.
pub(crate) fn legacy_fx_char_to_audio_effect_str(c: u8) -> &'static str {
    match c {
        b'S' => "Retrigger;8",
        b'V' => "Retrigger;12",
        b'T' => "Retrigger;16",
        b'W' => "Retrigger;24",
        b'U' => "Retrigger;32",
        b'G' => "Gate;4",
        b'H' => "Gate;8",
        b'K' => "Gate;12",
        b'I' => "Gate;16",
        b'L' => "Gate;24",
        b'J' => "Gate;32",
        b'F' => "Flanger",
        b'P' => "PitchShift;12",
        b'B' => "BitCrusher;5",
        b'Q' => "Phaser",
        b'X' => "Wobble;12",
        b'A' => "TapeStop",
        b'D' => "SideChain",
        _ => "",
    }
}

/// KSH preset FX effect name to KSON name.
pub(crate) fn fx_effect_name_to_kson(name: &str) -> Option<&'static str> {
    Some(match name {
        "Retrigger" => "retrigger",
        "Gate" => "gate",
        "Flanger" => "flanger",
        "PitchShift" => "pitch_shift",
        "BitCrusher" => "bitcrusher",
        "Phaser" => "phaser",
        "Wobble" => "wobble",
        "TapeStop" => "tapestop",
        "Echo" => "echo",
        "SideChain" => "sidechain",
        _ => return None,
    })
}

/// KSH `filtertype=` value to KSON effect name.
pub(crate) fn filter_name_to_kson(name: &str) -> Option<&'static str> {
    Some(match name {
        "peak" => "peaking_filter",
        "hpf1" => "high_pass_filter",
        "lpf1" => "low_pass_filter",
        "bitc" => "bitcrusher",
        "fx" => "fx",
        "fx;bitc" => "fx;bitcrusher",
        _ => return None,
    })
}

/// `type=` value in `#define_fx`/`#define_filter`.
pub(crate) fn audio_effect_kind_from_ksh(name: &str) -> Option<AudioEffectKind> {
    Some(match name {
        "Retrigger" => AudioEffectKind::Retrigger,
        "Gate" => AudioEffectKind::Gate,
        "Flanger" => AudioEffectKind::Flanger,
        "PitchShift" => AudioEffectKind::PitchShift,
        "BitCrusher" => AudioEffectKind::Bitcrusher,
        "Phaser" => AudioEffectKind::Phaser,
        "Wobble" => AudioEffectKind::Wobble,
        "TapeStop" => AudioEffectKind::Tapestop,
        "Echo" => AudioEffectKind::Echo,
        "SideChain" => AudioEffectKind::Sidechain,
        "SwitchAudio" => AudioEffectKind::SwitchAudio,
        _ => return None,
    })
}

/// KSH parameter names to KSON; several were renamed, not just re-cased.
pub(crate) fn param_name_to_kson(name: &str) -> Option<&'static str> {
    Some(match name {
        "attackTime" => "attack_time",
        "bandwidth" => "bandwidth",
        "chunkSize" => "chunk_size",
        "delay" => "delay",
        "depth" => "depth",
        "feedback" => "feedback",
        "feedbackLevel" => "feedback_level",
        "fileName" => "filename",
        "freq" => "freq",
        "freqMax" => "freq_max",
        "gain" => "gain",
        "hiCutGain" => "hi_cut_gain",
        "hiFreq" => "freq_2",
        "holdTime" => "hold_time",
        "loFreq" => "freq_1",
        "mix" => "mix",
        "overWrap" => "overlap",
        "period" => "period",
        "pitch" => "pitch",
        "Q" => "q",
        "rate" => "rate",
        "ratio" => "ratio",
        "reduction" => "reduction",
        "releaseTime" => "release_time",
        "speed" => "speed",
        "stage" => "stage",
        "stereoWidth" => "stereo_width",
        "trigger" => "trigger",
        "updateTrigger" => "update_trigger",
        "updatePeriod" => "update_period",
        "v" => "v",
        "volume" => "vol",
        "waveLength" => "wave_length",
        _ => return None,
    })
}

pub(crate) fn param_name_to_ksh(name: &str) -> Option<&'static str> {
    Some(match name {
        "attack_time" => "attackTime",
        "bandwidth" => "bandwidth",
        "chunk_size" => "chunkSize",
        "delay" => "delay",
        "depth" => "depth",
        "feedback" => "feedback",
        "feedback_level" => "feedbackLevel",
        "filename" => "fileName",
        "freq" => "freq",
        "freq_max" => "freqMax",
        "freq_2" => "hiFreq",
        "freq_1" => "loFreq",
        "gain" => "gain",
        "hi_cut_gain" => "hiCutGain",
        "hold_time" => "holdTime",
        "mix" => "mix",
        "overlap" => "overWrap",
        "period" => "period",
        "pitch" => "pitch",
        "q" => "Q",
        "rate" => "rate",
        "ratio" => "ratio",
        "reduction" => "reduction",
        "release_time" => "releaseTime",
        "speed" => "speed",
        "stage" => "stage",
        "stereo_width" => "stereoWidth",
        "trigger" => "trigger",
        "update_trigger" => "updateTrigger",
        "update_period" => "updatePeriod",
        "v" => "v",
        "vol" => "volume",
        "wave_length" => "waveLength",
        _ => return None,
    })
}

/// KSON type name to the `type=` value in `#define_fx`/`#define_filter`.
pub(crate) fn audio_effect_kind_name_to_ksh(name: &str) -> Option<&'static str> {
    Some(match name {
        "retrigger" => "Retrigger",
        "gate" => "Gate",
        "flanger" => "Flanger",
        "pitch_shift" => "PitchShift",
        "bitcrusher" => "BitCrusher",
        "phaser" => "Phaser",
        "wobble" => "Wobble",
        "tapestop" => "TapeStop",
        "echo" => "Echo",
        "sidechain" => "SideChain",
        "switch_audio" => "SwitchAudio",
        "high_pass_filter" => "HighPassFilter",
        "low_pass_filter" => "LowPassFilter",
        "peaking_filter" => "PeakingFilter",
        _ => return None,
    })
}

/// KSON preset FX effect name to the `fx-l=`/`fx-r=` spelling.
pub(crate) fn preset_fx_effect_name_to_ksh(name: &str) -> Option<&'static str> {
    Some(match name {
        "retrigger" => "Retrigger",
        "gate" => "Gate",
        "flanger" => "Flanger",
        "pitch_shift" => "PitchShift",
        "bitcrusher" => "BitCrusher",
        "phaser" => "Phaser",
        "wobble" => "Wobble",
        "tapestop" => "TapeStop",
        "echo" => "Echo",
        "sidechain" => "SideChain",
        "switch_audio" => "SwitchAudio",
        _ => return None,
    })
}

/// KSON preset laser filter name to the `filtertype=` spelling.
pub(crate) fn preset_filter_name_to_ksh(name: &str) -> Option<&'static str> {
    Some(match name {
        "peaking_filter" => "peak",
        "low_pass_filter" => "lpf1",
        "high_pass_filter" => "hpf1",
        "bitcrusher" => "bitc",
        _ => return None,
    })
}

/// KSON preset effect names resolvable without a definition.
pub(crate) fn preset_effect_kind(name: &str) -> Option<AudioEffectKind> {
    let kind = AudioEffectKind::from_name(name);
    (kind != AudioEffectKind::Unspecified).then_some(kind)
}

// ---------------------------------------------------------------------------
// Numeric parsing (C-style prefix semantics: trailing garbage is ignored)

pub(crate) fn parse_i64_prefix(s: &str, default: i64) -> i64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let digits_start = end;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
    }
    if end == digits_start {
        return default;
    }
    s[..end].parse().unwrap_or(default)
}

pub(crate) fn parse_i32_prefix(s: &str, default: i32) -> i32 {
    parse_i64_prefix(s, default as i64)
        .clamp(i32::MIN as i64, i32::MAX as i64) as i32
}

pub(crate) fn parse_f64_prefix(s: &str, default: f64) -> f64 {
    let s = s.trim_start();
    let bytes = s.as_bytes();
    let mut end = 0;
    if end < bytes.len() && (bytes[end] == b'+' || bytes[end] == b'-') {
        end += 1;
    }
    let mut any_digit = false;
    while end < bytes.len() && bytes[end].is_ascii_digit() {
        end += 1;
        any_digit = true;
    }
    if end < bytes.len() && bytes[end] == b'.' {
        end += 1;
        while end < bytes.len() && bytes[end].is_ascii_digit() {
            end += 1;
            any_digit = true;
        }
    }
    if !any_digit {
        return default;
    }
    // Exponent part
    if end < bytes.len() && (bytes[end] == b'e' || bytes[end] == b'E') {
        let mut exp_end = end + 1;
        if exp_end < bytes.len() && (bytes[exp_end] == b'+' || bytes[exp_end] == b'-') {
            exp_end += 1;
        }
        let exp_digits = exp_end;
        while exp_end < bytes.len() && bytes[exp_end].is_ascii_digit() {
            exp_end += 1;
        }
        if exp_end > exp_digits {
            end = exp_end;
        }
    }
    s[..end].parse().unwrap_or(default)
}

pub(crate) fn truncate_chars(s: &str, n: usize) -> &str {
    match s.char_indices().nth(n) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

pub(crate) fn split_n<const N: usize>(s: &str, sep: char) -> [String; N] {
    let mut arr: [String; N] = std::array::from_fn(|_| String::new());
    let mut cursor = 0usize;
    for slot in &mut arr {
        let rest = &s[cursor..];
        match rest.find(sep) {
            None => {
                *slot = rest.to_owned();
                break;
            }
            Some(idx) => {
                *slot = rest[..idx].to_owned();
                cursor += idx + sep.len_utf8();
            }
        }
    }
    arr
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn laser_char_alphabet() {
        assert_eq!(char_to_laser_x(b'0'), 0);
        assert_eq!(char_to_laser_x(b'9'), 9);
        assert_eq!(char_to_laser_x(b'A'), 10);
        assert_eq!(char_to_laser_x(b'Z'), 35);
        assert_eq!(char_to_laser_x(b'a'), 36);
        assert_eq!(char_to_laser_x(b'o'), 50);
        for x in 0..=LASER_X_MAX {
            assert_eq!(char_to_laser_x(laser_x_to_char(x)), x);
        }
    }

    #[test]
    fn wide_laser_zero_positions() {
        assert_eq!(laser_x_to_graph_value(12, true), 0.25);
        assert_eq!(laser_x_to_graph_value(37, true), 0.75);
        assert_eq!(laser_x_to_graph_value(12, false), 12.0 / 50.0);
        assert_eq!(graph_value_to_laser_x(0.25, true), 12);
        assert_eq!(graph_value_to_laser_x(0.75, true), 37);
        assert_eq!(graph_value_to_laser_x(1.0, false), 50);
        assert_eq!(graph_value_to_laser_x(0.0, false), 0);
    }

    #[test]
    fn ksh_resolution_conversion() {
        assert_eq!(ksh_length_to_rel_pulse(192), RESOLUTION4);
        assert_eq!(ksh_length_to_rel_pulse(48), RESOLUTION4 / 4);
        assert_eq!(to_ksh_resolution(RESOLUTION4), 192);
        assert_eq!(to_ksh_resolution(30), 6);
    }

    #[test]
    fn param_name_tables_are_inverse() {
        for ksh in [
            "attackTime",
            "chunkSize",
            "feedbackLevel",
            "fileName",
            "hiFreq",
            "loFreq",
            "overWrap",
            "Q",
            "volume",
            "waveLength",
            "updatePeriod",
        ] {
            let kson = param_name_to_kson(ksh).unwrap();
            assert_eq!(param_name_to_ksh(kson), Some(ksh));
        }
        assert_eq!(param_name_to_kson("unknownParam"), None);
    }

    #[test]
    fn ksh_value_formatting() {
        assert_eq!(format_ksh_value(1.0), "1");
        assert_eq!(format_ksh_value(0.5), "0.5");
        assert_eq!(format_ksh_value(1.25), "1.25");
        assert_eq!(format_ksh_value(1.2344), "1.234");
        assert_eq!(format_ksh_value(-2.5), "-2.5");
        assert_eq!(format_ksh_value(0.0001), "0");
    }
}
