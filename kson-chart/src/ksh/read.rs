use std::collections::{HashMap, HashSet};

use crate::camera::{AutoTiltKind, TiltGraphPoint, TiltGraphValue, TiltValue, TiltVf};
use crate::diag::{KshLoadingDiag, KshLoadingWarningKind, WarningScope};
use crate::effects::{
    pulse_set_insert, AudioEffectDef, AudioEffectKind, AudioEffectParams,
};
use crate::encoding::decode_shift_jis;
use crate::ksh::*;
use crate::{
    ByPulse, ByRelPulse, ChartData, ChartError, Dict, Graph, GraphCurve, GraphPoint, GraphValue,
    Interval, KeySoundInvokeFx, LaserSection, MetaAudioInfo, MetaBgmInfo, MetaChartData, Pulse,
    RelPulse, TimeSig, LASER_X_SCALE_1X, LASER_X_SCALE_2X, NUM_BT_LANES, NUM_FX_LANES,
    NUM_LASER_LANES, RESOLUTION4,
};

const AUDIO_EFFECT_PARAM_UNSPECIFIED: i32 = -99999;

/// Loads a KSH chart from raw file bytes.
///
/// Errors are reported through `ChartData::error`; the reader never aborts
/// mid-stream on recoverable problems.
pub fn load_chart(bytes: &[u8]) -> ChartData {
    let mut diag = KshLoadingDiag::default();
    load_impl(bytes, &mut diag, false)
}

pub fn load_chart_with_diag(bytes: &[u8], diag: &mut KshLoadingDiag) -> ChartData {
    load_impl(bytes, diag, false)
}

pub fn load_chart_from_path(path: impl AsRef<std::path::Path>) -> ChartData {
    let path = path.as_ref();
    if !path.exists() {
        return ChartData::from_error(ChartError::FileNotFound);
    }
    match std::fs::read(path) {
        Ok(bytes) => load_chart(&bytes),
        Err(_) => ChartData::from_error(ChartError::CouldNotOpenInputFileStream),
    }
}

/// Loads only the header section, for chart listings.
pub fn load_meta(bytes: &[u8]) -> MetaChartData {
    let mut diag = KshLoadingDiag::default();
    let chart = load_impl(bytes, &mut diag, true);
    MetaChartData {
        meta: chart.meta,
        audio: MetaAudioInfo {
            bgm: MetaBgmInfo {
                filename: chart.audio.bgm.filename,
                vol: chart.audio.bgm.vol,
                preview: chart.audio.bgm.preview,
            },
        },
        error: chart.error,
        warnings: chart.warnings,
    }
}

// ---------------------------------------------------------------------------
// Line classification and decoding

fn is_chart_line(line: &[u8]) -> bool {
    line.contains(&BLOCK_SEPARATOR)
}

fn is_option_line(line: &[u8]) -> bool {
    // An empty key ("=...") is not an option line
    line.len() >= 2 && line[0] != b'=' && line[1..].contains(&(OPTION_SEPARATOR as u8))
}

fn is_bar_line(line: &[u8]) -> bool {
    line == MEASURE_SEPARATOR
}

fn is_comment_line(line: &[u8]) -> bool {
    line.starts_with(b"//")
}

fn to_utf8(line: &[u8], is_utf8: bool) -> Result<String, ChartError> {
    if is_utf8 {
        Ok(String::from_utf8_lossy(line).into_owned())
    } else {
        decode_shift_jis(line)
    }
}

fn to_utf8_lossy(line: &[u8], is_utf8: bool) -> String {
    to_utf8(line, is_utf8).unwrap_or_else(|_| String::from_utf8_lossy(line).into_owned())
}

fn split_option_line(line: &[u8], is_utf8: bool) -> Result<(String, String), ChartError> {
    let decoded = to_utf8(line, is_utf8)?;
    match decoded.find(OPTION_SEPARATOR) {
        Some(idx) => Ok((decoded[..idx].to_owned(), decoded[idx + 1..].to_owned())),
        None => Err(ChartError::Encoding),
    }
}

/// Splits "Name;p1;p2" into the name and up to two integer parameters.
fn split_audio_effect_str(s: &str) -> (String, i32, i32) {
    let Some(idx1) = s.find(AUDIO_EFFECT_STR_SEPARATOR) else {
        return (
            s.to_owned(),
            AUDIO_EFFECT_PARAM_UNSPECIFIED,
            AUDIO_EFFECT_PARAM_UNSPECIFIED,
        );
    };
    let rest = &s[idx1 + 1..];
    let param1 = parse_i32_prefix(rest, 0);
    match rest.find(AUDIO_EFFECT_STR_SEPARATOR) {
        None => (
            s[..idx1].to_owned(),
            param1,
            AUDIO_EFFECT_PARAM_UNSPECIFIED,
        ),
        Some(idx2) => {
            let param2 = parse_i32_prefix(&rest[idx2 + 1..], 0);
            (s[..idx1].to_owned(), param1, param2)
        }
    }
}

// ---------------------------------------------------------------------------
// Small model helpers

fn insert_bpm_change(bpm: &mut ByPulse<f64>, time: Pulse, value: &str, ksh_version_int: i32) {
    // Range strings ("120-180") never enter the BPM map
    if value.contains('-') {
        return;
    }
    let mut v = round_to_ksh_value(parse_f64_prefix(value, 0.0));
    if ksh_version_int >= VER_BPM_LIMIT_ADDED {
        v = v.min(BPM_MAX);
    }
    bpm.insert(time, v);
}

fn insert_graph_point_or_assign_vf(graph: &mut Graph, time: Pulse, v: f64) {
    match graph.get_mut(&time) {
        Some(point) => point.v.vf = v,
        None => {
            graph.insert(time, GraphPoint::new(v));
        }
    }
}

fn insert_filtertype(chart: &mut ChartData, time: Pulse, value: &str) {
    let filename_f = chart.audio.bgm.legacy.filename_f.clone();
    let laser = &mut chart.audio.audio_effect.laser;
    if let Some(kson_name) = filter_name_to_kson(value) {
        let mut name = kson_name.to_owned();
        if name == "fx" && !laser.def_contains(&name) {
            if filename_f.is_empty() {
                name.clear();
            } else {
                let mut params = AudioEffectParams::new();
                params.insert("filename".to_owned(), filename_f);
                laser.def.push((
                    "fx".to_owned(),
                    AudioEffectDef {
                        kind: AudioEffectKind::SwitchAudio,
                        v: params,
                    },
                ));
            }
        } else if name == "fx;bitcrusher" && !laser.def_contains(&name) {
            laser.def.push((
                "fx;bitcrusher".to_owned(),
                AudioEffectDef {
                    kind: AudioEffectKind::Bitcrusher,
                    v: AudioEffectParams::new(),
                },
            ));
        }
        if !name.is_empty() {
            pulse_set_insert(&mut laser.pulse_event, &name, time);
        }
    } else {
        pulse_set_insert(&mut laser.pulse_event, value, time);
    }
}

fn parse_curve_value(value: &str) -> Option<GraphCurve> {
    let idx = value.find(AUDIO_EFFECT_STR_SEPARATOR)?;
    let a = parse_f64_prefix(&value[..idx], 0.0);
    let b = parse_f64_prefix(&value[idx + 1..], 0.0);
    Some(GraphCurve::new(a, b))
}

fn is_tilt_value_manual(value: &str) -> bool {
    value
        .as_bytes()
        .first()
        .is_some_and(|&c| c.is_ascii_digit() || c == b'-')
}

fn auto_tilt_kind_from_ksh(value: &str) -> AutoTiltKind {
    match value {
        "big" => AutoTiltKind::Bigger,
        "keep" => AutoTiltKind::KeepBigger,
        _ => AutoTiltKind::from_name(value),
    }
}

// ---------------------------------------------------------------------------
// Lane spin suffix

#[derive(Debug, PartialEq)]
enum LaneSpin {
    Normal { d: i32, length: RelPulse },
    Half { d: i32, length: RelPulse },
    Swing { d: i32, length: RelPulse, amplitude: i32, repeat: i32, decay_order: i32 },
}

fn split_swing_params(s: &str) -> (RelPulse, i32, i32, i32) {
    let mut params = ["192".to_owned(), "250".to_owned(), "3".to_owned(), "2".to_owned()];
    for (i, part) in s.split(AUDIO_EFFECT_STR_SEPARATOR).take(4).enumerate() {
        params[i] = part.to_owned();
    }
    (
        ksh_length_to_rel_pulse(parse_i64_prefix(&params[0], 0)),
        parse_i32_prefix(&params[1], 0),
        parse_i32_prefix(&params[2], 0),
        parse_i32_prefix(&params[3], 0),
    )
}

fn parse_lane_spin(bytes: &[u8]) -> Option<LaneSpin> {
    if bytes.len() < 3 {
        return None;
    }
    let s = String::from_utf8_lossy(&bytes[2..]).into_owned();
    match (bytes[0], bytes[1]) {
        (b'@', b'(') | (b'@', b')') | (b'@', b'<') | (b'@', b'>') => {
            let d = if bytes[1] == b'(' || bytes[1] == b'<' { -1 } else { 1 };
            let length = ksh_length_to_rel_pulse(parse_i64_prefix(&s, 0));
            if bytes[1] == b'(' || bytes[1] == b')' {
                Some(LaneSpin::Normal { d, length })
            } else {
                Some(LaneSpin::Half { d, length })
            }
        }
        (b'S', b'<') | (b'S', b'>') => {
            let d = if bytes[1] == b'<' { -1 } else { 1 };
            let (length, amplitude, repeat, decay_order) = split_swing_params(&s);
            Some(LaneSpin::Swing { d, length, amplitude, repeat, decay_order })
        }
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Prepared long notes and laser sections

#[derive(Default)]
struct PreparedLongBtNote {
    slot: Option<(Pulse, RelPulse)>,
}

impl PreparedLongBtNote {
    fn prepare(&mut self, time: Pulse) {
        if self.slot.is_none() {
            self.slot = Some((time, 0));
        }
    }

    fn prepared(&self) -> bool {
        self.slot.is_some()
    }

    fn extend(&mut self, rel_pulse: RelPulse) {
        if let Some((_, length)) = &mut self.slot {
            *length += rel_pulse;
        }
    }

    fn publish(&mut self, lane: &mut ByPulse<Interval>) {
        if let Some((time, length)) = self.slot.take() {
            lane.entry(time).or_insert(Interval { length });
        }
    }
}

#[derive(Default)]
struct LongFxData {
    length: RelPulse,
    is_legacy_char: bool,
}

#[derive(Default)]
struct PreparedLongFxNote {
    slot: Option<(Pulse, LongFxData)>,
}

impl PreparedLongFxNote {
    fn prepare(
        &mut self,
        time: Pulse,
        lane_idx: usize,
        long_event: &mut Dict<[ByPulse<AudioEffectParams>; NUM_FX_LANES]>,
    ) {
        if let Some((_, data)) = &self.slot {
            if data.is_legacy_char {
                // A long note starting with a legacy character (e.g. "F" =
                // Flanger) clears its audio effect when it changes to "1"
                self.prepare_with_effect(time, "", "", false, lane_idx, long_event);
                return;
            }
        }
        if self.slot.is_none() {
            self.slot = Some((time, LongFxData::default()));
        }
    }

    /// `audio_effect_str`: "fx-l="/"fx-r=" value (e.g. "Retrigger;16").
    /// `audio_effect_param_str`: legacy "fx-l_param1="/"fx-r_param1=" value.
    fn prepare_with_effect(
        &mut self,
        time: Pulse,
        audio_effect_str: &str,
        audio_effect_param_str: &str,
        is_legacy_char: bool,
        lane_idx: usize,
        long_event: &mut Dict<[ByPulse<AudioEffectParams>; NUM_FX_LANES]>,
    ) {
        if self.slot.is_none() {
            self.slot = Some((time, LongFxData::default()));
        }

        // The long_event entry is always published when "fx-l="/"fx-r=" is
        // explicitly specified, even if the value repeats, for round-trip
        // compatibility
        publish_long_fx_audio_effect_event(
            long_event,
            lane_idx,
            time,
            audio_effect_str,
            audio_effect_param_str,
        );

        if let Some((_, data)) = &mut self.slot {
            data.is_legacy_char = is_legacy_char;
        }
    }

    fn prepared(&self) -> bool {
        self.slot.is_some()
    }

    fn extend(&mut self, rel_pulse: RelPulse) {
        if let Some((_, data)) = &mut self.slot {
            data.length += rel_pulse;
        }
    }

    fn publish(&mut self, lane: &mut ByPulse<Interval>) {
        if let Some((time, data)) = self.slot.take() {
            lane.entry(time).or_insert(Interval {
                length: data.length,
            });
        }
    }
}

fn publish_long_fx_audio_effect_event(
    long_event: &mut Dict<[ByPulse<AudioEffectParams>; NUM_FX_LANES]>,
    lane_idx: usize,
    time: Pulse,
    audio_effect_str: &str,
    audio_effect_param_str: &str,
) {
    let (name, mut param1, param2) = split_audio_effect_str(audio_effect_str);
    if !audio_effect_param_str.is_empty() {
        // Legacy parameters never carry a second value; Echo (the only
        // two-parameter effect) postdates them
        param1 = parse_i32_prefix(audio_effect_param_str, 0);
    }
    let name = fx_effect_name_to_kson(&name)
        .map(str::to_owned)
        .unwrap_or(name);

    // The parameter values are kept in temporary keys; resolving them needs
    // the effect type, which is only known after "#define_fx" lines are read
    let mut params = AudioEffectParams::new();
    params.insert("_param1".to_owned(), param1.to_string());
    params.insert("_param2".to_owned(), param2.to_string());
    long_event.entry(name).or_default()[lane_idx]
        .entry(time)
        .or_insert(params);
}

#[derive(Default)]
struct LaserSectionData {
    points: ByRelPulse<GraphPoint>,
    wide: bool,
}

#[derive(Default)]
struct PreparedLaserSection {
    slot: Option<(Pulse, LaserSectionData)>,
}

impl PreparedLaserSection {
    fn prepare(&mut self, time: Pulse, wide: bool) {
        if self.slot.is_none() {
            self.slot = Some((
                time,
                LaserSectionData {
                    points: ByRelPulse::new(),
                    wide,
                },
            ));
        }
    }

    fn prepared(&self) -> bool {
        self.slot.is_some()
    }

    fn wide(&self) -> bool {
        self.slot.as_ref().is_some_and(|(_, data)| data.wide)
    }

    fn add_graph_point(&mut self, time: Pulse, value: f64) {
        if let Some((start, data)) = &mut self.slot {
            let rel_time = time - *start;
            if rel_time >= 0 {
                match data.points.get_mut(&rel_time) {
                    Some(point) => point.v.vf = value,
                    None => {
                        data.points.insert(rel_time, GraphPoint::new(value));
                    }
                }
            }
        }
    }

    fn publish(&mut self, lane: &mut ByPulse<LaserSection>) {
        let Some((time, data)) = self.slot.take() else {
            return;
        };

        // Sections that never got a second chart line are dropped
        if data.points.len() < 2 {
            return;
        }

        lane.entry(time).or_insert(LaserSection {
            v: convert_short_segments_to_slams(&data.points),
            w: if data.wide {
                LASER_X_SCALE_2X
            } else {
                LASER_X_SCALE_1X
            },
        });
    }

    fn clear(&mut self) {
        self.slot = None;
    }
}

/// Rewrites 32nd-or-shorter laser segments into laser slams.
fn convert_short_segments_to_slams(points: &ByRelPulse<GraphPoint>) -> ByRelPulse<GraphPoint> {
    let threshold: RelPulse = RESOLUTION4 / 32;
    let entries: Vec<(RelPulse, GraphPoint)> = points.iter().map(|(ry, p)| (*ry, *p)).collect();

    let mut converted = ByRelPulse::new();
    let mut i = 0;
    while i < entries.len() {
        let (ry, point) = entries[i];
        if let Some(&(next_ry, next_point)) = entries.get(i + 1) {
            if next_ry - ry <= threshold && !crate::almost_equals(next_point.v.v, point.v.v) {
                converted.insert(
                    ry,
                    GraphPoint::from_value(GraphValue::with_transition(point.v.v, next_point.v.v)),
                );
                // The merged point survives only when a third point continues
                // from the slam end within slam distance at a differing value
                let skip_next = match entries.get(i + 2) {
                    None => true,
                    Some(&(nn_ry, nn_point)) => {
                        nn_ry - next_ry > threshold
                            || crate::almost_equals(nn_point.v.v, next_point.v.v)
                    }
                };
                i += if skip_next { 2 } else { 1 };
                continue;
            }
        }
        converted.insert(ry, point);
        i += 1;
    }
    converted
}

// ---------------------------------------------------------------------------
// Measure-local buffers

struct BufOptionLine {
    line_idx: usize,
    key: String,
    value: String,
}

struct BufKeySound {
    name: String,
    vol: i32,
}

struct BodyState {
    chart_lines: Vec<Vec<u8>>,
    option_lines: Vec<BufOptionLine>,
    comment_lines: Vec<(usize, String)>,
    unknown_lines: Vec<(usize, String)>,
    buffered_curves: HashMap<String, ByPulse<GraphCurve>>,
    laser_x_scale_2x: [HashSet<usize>; NUM_LASER_LANES],
    fx_audio_effect_strs: [HashMap<usize, String>; NUM_FX_LANES],
    fx_audio_effect_param_strs: [HashMap<usize, String>; NUM_FX_LANES],
    fx_key_sounds: [HashMap<usize, BufKeySound>; NUM_FX_LANES],
    laser_key_sounds: HashMap<usize, String>,
    prepared_bt: [PreparedLongBtNote; NUM_BT_LANES],
    prepared_fx: [PreparedLongFxNote; NUM_FX_LANES],
    prepared_laser: [PreparedLaserSection; NUM_LASER_LANES],
    current_pulse: Pulse,
    current_measure_idx: i64,
    current_time_sig: TimeSig,
    use_legacy_scale_for_manual_tilt: bool,
}

impl BodyState {
    fn new(current_time_sig: TimeSig) -> Self {
        BodyState {
            chart_lines: Vec::new(),
            option_lines: Vec::new(),
            comment_lines: Vec::new(),
            unknown_lines: Vec::new(),
            buffered_curves: HashMap::new(),
            laser_x_scale_2x: Default::default(),
            fx_audio_effect_strs: Default::default(),
            fx_audio_effect_param_strs: Default::default(),
            fx_key_sounds: Default::default(),
            laser_key_sounds: HashMap::new(),
            prepared_bt: Default::default(),
            prepared_fx: Default::default(),
            prepared_laser: Default::default(),
            current_pulse: 0,
            current_measure_idx: 0,
            current_time_sig,
            use_legacy_scale_for_manual_tilt: false,
        }
    }

    fn clear_measure_buffers(&mut self) {
        self.chart_lines.clear();
        self.option_lines.clear();
        self.comment_lines.clear();
        self.unknown_lines.clear();
        for set in &mut self.laser_x_scale_2x {
            set.clear();
        }
        for map in &mut self.fx_audio_effect_strs {
            map.clear();
        }
        for map in &mut self.fx_audio_effect_param_strs {
            map.clear();
        }
        for map in &mut self.fx_key_sounds {
            map.clear();
        }
        self.laser_key_sounds.clear();
    }
}

struct ReadContext {
    is_utf8: bool,
    ksh_version_int: i32,
    zoom_abs_max: f64,
    zoom_max_char: usize,
}

fn warn(
    chart: &mut ChartData,
    diag: &mut KshLoadingDiag,
    kind: KshLoadingWarningKind,
    scope: WarningScope,
    message: String,
    line_no: i64,
) {
    chart.warnings.push(message.clone());
    diag.push(kind, scope, message, line_no);
}

// ---------------------------------------------------------------------------
// Header

fn strip_bom(bytes: &[u8]) -> (bool, &[u8]) {
    if bytes.starts_with(&[0xEF, 0xBB, 0xBF]) {
        (true, &bytes[3..])
    } else {
        (false, bytes)
    }
}

fn split_lines(content: &[u8]) -> Vec<&[u8]> {
    content
        .split(|&b| b == b'\n')
        .map(|line| line.strip_suffix(b"\r").unwrap_or(line))
        .collect()
}

fn pop(map: &mut HashMap<String, String>, key: &str, default: &str) -> String {
    map.remove(key).unwrap_or_else(|| default.to_owned())
}

fn parse_header(
    lines: &[&[u8]],
    is_utf8: bool,
    chart: &mut ChartData,
    diag: &mut KshLoadingDiag,
) -> Result<(usize, i32), ChartError> {
    // The first option line must be "title="
    if !lines.first().is_some_and(|line| line.first() == Some(&b't')) {
        warn(
            chart,
            diag,
            KshLoadingWarningKind::TitleNotAtBeginning,
            WarningScope::Editor,
            "The option line \"title=...\" must be placed at the beginning of a KSH chart file."
                .to_owned(),
            1,
        );
    }

    let mut meta_map: HashMap<String, String> = HashMap::new();
    let mut body_start = None;
    for (i, line) in lines.iter().enumerate() {
        if is_bar_line(line) {
            body_start = Some(i + 1);
            break;
        }

        if is_comment_line(line) {
            chart
                .editor
                .comment
                .entry(0)
                .or_default()
                .push(to_utf8_lossy(&line[2..], is_utf8));
            continue;
        }

        if !is_option_line(line) {
            chart
                .compat
                .ksh_unknown
                .line
                .entry(0)
                .or_default()
                .push(to_utf8_lossy(line, is_utf8));
            continue;
        }

        let (key, value) = split_option_line(line, is_utf8)?;
        meta_map.insert(key, value);
    }

    // .ksh files must have at least one bar line ("--") and a "title=" line
    let Some(body_start) = body_start else {
        return Err(ChartError::GeneralChartFormat);
    };
    if !meta_map.contains_key("title") {
        return Err(ChartError::GeneralChartFormat);
    }

    let ksh_version = {
        let ver = pop(&mut meta_map, "ver", "100");
        let ver_compat = pop(&mut meta_map, "ver_compat", "");
        if ver_compat.is_empty() {
            ver
        } else {
            // ver_compat supersedes ver for all version checks
            ver_compat
        }
    };
    let ksh_version_int = parse_i32_prefix(&ksh_version, 100);
    chart.compat.ksh_version = ksh_version;

    chart.meta.title = pop(&mut meta_map, "title", "");
    chart.meta.title_img_filename = pop(&mut meta_map, "title_img", "");
    chart.meta.artist = pop(&mut meta_map, "artist", "");
    chart.meta.artist_img_filename = pop(&mut meta_map, "artist_img", "");
    chart.meta.chart_author = pop(&mut meta_map, "effect", "");
    chart.meta.jacket_filename = pop(&mut meta_map, "jacket", "");
    chart.meta.jacket_author = pop(&mut meta_map, "illustrator", "");
    chart.meta.icon_filename = pop(&mut meta_map, "icon", "");

    let difficulty_name = pop(&mut meta_map, "difficulty", "infinite");
    match difficulty_name.as_str() {
        "light" => chart.meta.difficulty.idx = 0,
        "challenge" => chart.meta.difficulty.idx = 1,
        "extended" => chart.meta.difficulty.idx = 2,
        "infinite" => chart.meta.difficulty.idx = 3,
        _ => {
            // Unknown difficulty plays as "infinite" but keeps its name
            chart.meta.difficulty.idx = 3;
            chart.meta.difficulty.name = difficulty_name;
        }
    }

    chart.meta.level = parse_i32_prefix(&pop(&mut meta_map, "level", "1"), 1).clamp(1, 20);

    // First time signature ("beat=" is usually after the first bar line)
    let first_time_sig = match meta_map.remove("beat") {
        Some(value) => TimeSig::parse(&value),
        None => TimeSig::default(),
    };
    chart.beat.time_sig.insert(0, first_time_sig);

    // First tempo change
    if let Some(t) = meta_map.get("t") {
        let t = t.clone();
        insert_bpm_change(&mut chart.beat.bpm, 0, &t, ksh_version_int);
    }
    chart.meta.disp_bpm = pop(&mut meta_map, "t", "");
    chart.meta.std_bpm = parse_f64_prefix(&pop(&mut meta_map, "to", "0"), 0.0);

    let bgm_filenames = split_n::<4>(&pop(&mut meta_map, "m", ""), ';');
    chart.audio.bgm.filename = bgm_filenames[0].clone();
    chart.audio.bgm.legacy.filename_f = bgm_filenames[1].clone();
    chart.audio.bgm.legacy.filename_p = bgm_filenames[2].clone();
    chart.audio.bgm.legacy.filename_fp = bgm_filenames[3].clone();

    let vol_int = parse_i32_prefix(&pop(&mut meta_map, "mvol", "100"), 100);
    chart.audio.bgm.vol = vol_int as f64 / 100.0;
    if ksh_version_int == 100 {
        // Charts of format version "100" (including unspecified) played at
        // 60% volume
        chart.audio.bgm.vol *= 0.6;
    }

    chart.audio.bgm.offset = parse_i32_prefix(&pop(&mut meta_map, "o", "0"), 0);
    chart.audio.bgm.preview.offset = parse_i32_prefix(&pop(&mut meta_map, "po", "0"), 0);
    chart.audio.bgm.preview.duration = parse_i32_prefix(&pop(&mut meta_map, "plength", "0"), 0);

    chart
        .audio
        .key_sound
        .laser
        .vol
        .insert(0, parse_i32_prefix(&pop(&mut meta_map, "chokkakuvol", "50"), 50) as f64 / 100.0);
    chart.audio.key_sound.laser.legacy.vol_auto =
        parse_i32_prefix(&pop(&mut meta_map, "chokkakuautovol", "1"), 1) != 0;
    if meta_map.contains_key("filtertype") {
        let value = pop(&mut meta_map, "filtertype", "peak");
        insert_filtertype(chart, 0, &value);
    }
    if meta_map.contains_key("pfiltergain") {
        let gain = parse_i32_prefix(&pop(&mut meta_map, "pfiltergain", "50"), 50);
        chart
            .audio
            .audio_effect
            .laser
            .legacy
            .filter_gain
            .entry(0)
            .or_insert(gain as f64 / 100.0);
    }
    chart.audio.audio_effect.laser.peaking_filter_delay =
        parse_i32_prefix(&pop(&mut meta_map, "pfilterdelay", "40"), 40).clamp(0, 160);

    let bg_str = pop(&mut meta_map, "bg", "desert");
    if bg_str.contains(';') {
        let bg_filenames = split_n::<2>(&bg_str, ';');
        chart.bg.legacy.bg[0].filename = bg_filenames[0].clone();
        chart.bg.legacy.bg[1].filename = bg_filenames[1].clone();
    } else {
        chart.bg.legacy.bg[0].filename = bg_str.clone();
        chart.bg.legacy.bg[1].filename = bg_str;
    }

    // Layer field separator changed from "/" to ";" at format version 166
    let layer_separator = if ksh_version_int >= VER_LAYER_DELIMITER_CHANGED {
        ';'
    } else {
        '/'
    };
    let layer_str = pop(&mut meta_map, "layer", "arrow");
    let layer_options = split_n::<3>(&layer_str, layer_separator);
    chart.bg.legacy.layer.filename = layer_options[0].clone();
    chart.bg.legacy.layer.duration = parse_i32_prefix(&layer_options[1], 0);
    let rotation_flags = parse_i32_prefix(&layer_options[2], 0b11);
    chart.bg.legacy.layer.rotation.tilt = rotation_flags & 0b01 != 0;
    chart.bg.legacy.layer.rotation.spin = rotation_flags & 0b10 != 0;

    chart.bg.legacy.movie.filename = pop(&mut meta_map, "v", "");
    chart.bg.legacy.movie.offset = parse_i32_prefix(&pop(&mut meta_map, "vo", "0"), 0);

    chart.gauge.total = parse_i32_prefix(&pop(&mut meta_map, "total", "0"), 0);
    chart.meta.information = pop(&mut meta_map, "information", "");

    // Unrecognized header keys are preserved
    for (key, value) in meta_map {
        chart.compat.ksh_unknown.meta.insert(key, value);
    }

    Ok((body_start, ksh_version_int))
}

// ---------------------------------------------------------------------------
// Body

fn load_impl(bytes: &[u8], diag: &mut KshLoadingDiag, meta_only: bool) -> ChartData {
    let (is_utf8, content) = strip_bom(bytes);
    let lines = split_lines(content);

    let mut chart = ChartData::default();
    let header = parse_header(&lines, is_utf8, &mut chart, diag);
    let (body_start, ksh_version_int) = match header {
        Ok(result) => result,
        Err(error) => return ChartData::from_error(error),
    };

    if meta_only {
        return chart;
    }

    let current_time_sig = match chart.beat.time_sig.get(&0) {
        Some(sig) => *sig,
        None => {
            warn(
                &mut chart,
                diag,
                KshLoadingWarningKind::MissingTimeSigAtZero,
                WarningScope::Player,
                "Loaded KSH chart data must have time signature at zero pulse.".to_owned(),
                0,
            );
            TimeSig::default()
        }
    };

    let ctx = ReadContext {
        is_utf8,
        ksh_version_int,
        zoom_abs_max: if ksh_version_int >= VER_ZOOM_LIMIT_EXTENDED {
            ZOOM_ABS_MAX
        } else {
            ZOOM_ABS_MAX_LEGACY
        },
        zoom_max_char: if ksh_version_int >= VER_ZOOM_LIMIT_EXTENDED {
            usize::MAX
        } else {
            ZOOM_MAX_CHAR_LEGACY
        },
    };

    let mut state = BodyState::new(current_time_sig);

    for (offset, line) in lines[body_start..].iter().enumerate() {
        let line_no = (body_start + offset + 1) as i64;

        if line.is_empty() {
            continue;
        }

        if is_comment_line(line) {
            state
                .comment_lines
                .push((state.chart_lines.len(), to_utf8_lossy(&line[2..], ctx.is_utf8)));
            continue;
        }

        // User-defined audio effects
        if line.first() == Some(&b'#') {
            if let Err(error) = parse_define_line(line, &ctx, &mut chart, diag, line_no) {
                return ChartData::from_error(error);
            }
            continue;
        }

        if is_chart_line(line) {
            state.chart_lines.push(line.to_vec());
            continue;
        }

        if is_option_line(line) {
            let (key, value) = match split_option_line(line, ctx.is_utf8) {
                Ok(pair) => pair,
                Err(error) => return ChartData::from_error(error),
            };

            if key == "beat" {
                // Takes effect for the measure being assembled, not deferred
                state.current_time_sig = TimeSig::parse(&value);
                chart
                    .beat
                    .time_sig
                    .insert(state.current_measure_idx, state.current_time_sig);
            } else {
                state.option_lines.push(BufOptionLine {
                    line_idx: state.chart_lines.len(),
                    key,
                    value,
                });
            }
            continue;
        }

        if is_bar_line(line) {
            commit_measure(&mut chart, &mut state, &ctx, diag, line_no);
            state.clear_measure_buffers();
            state.current_pulse += state.current_time_sig.measure_pulses();
            state.current_measure_idx += 1;
            continue;
        }

        state
            .unknown_lines
            .push((state.chart_lines.len(), to_utf8_lossy(line, ctx.is_utf8)));
    }

    // The chart content should end with a bar line, so prepared button notes
    // can only remain here on truncated files
    for prepared in &state.prepared_bt {
        if prepared.prepared() {
            warn(
                &mut chart,
                diag,
                KshLoadingWarningKind::UncommittedBtNote,
                WarningScope::Editor,
                "Uncommitted BT note detected. The chart content does not end with a bar line (\"--\").".to_owned(),
                lines.len() as i64,
            );
        }
    }
    for prepared in &state.prepared_fx {
        if prepared.prepared() {
            warn(
                &mut chart,
                diag,
                KshLoadingWarningKind::UncommittedFxNote,
                WarningScope::Editor,
                "Uncommitted FX note detected. The chart content does not end with a bar line (\"--\").".to_owned(),
                lines.len() as i64,
            );
        }
    }

    // Laser sections are published only on a blank laser char, so sections
    // running to EOF are still pending
    for (lane_idx, prepared) in state.prepared_laser.iter_mut().enumerate() {
        prepared.publish(&mut chart.note.laser[lane_idx]);
    }

    apply_buffered_curves_to_lasers(&state.buffered_curves, &mut chart);
    apply_buffered_curves_to_graph(
        "scroll_speed",
        &mut chart.beat.scroll_speed,
        &state.buffered_curves,
    );
    apply_buffered_curves_to_graph(
        "rotation_deg",
        &mut chart.camera.cam.body.rotation_deg,
        &state.buffered_curves,
    );
    apply_buffered_curves_to_graph(
        "zoom_top",
        &mut chart.camera.cam.body.zoom_top,
        &state.buffered_curves,
    );
    apply_buffered_curves_to_graph(
        "zoom_bottom",
        &mut chart.camera.cam.body.zoom_bottom,
        &state.buffered_curves,
    );
    apply_buffered_curves_to_graph(
        "zoom_side",
        &mut chart.camera.cam.body.zoom_side,
        &state.buffered_curves,
    );
    apply_buffered_curves_to_graph(
        "center_split",
        &mut chart.camera.cam.body.center_split,
        &state.buffered_curves,
    );
    apply_buffered_curves_to_tilt(&state.buffered_curves, &mut chart.camera.tilt);

    if !chart.beat.scroll_speed.contains_key(&0) {
        chart.beat.scroll_speed.insert(0, GraphPoint::new(1.0));
    }

    resolve_fx_long_event_params(&mut chart, diag);

    if state.use_legacy_scale_for_manual_tilt {
        // Charts with large manual tilt values depend on the 14-degree tilt
        // scale used before v1.70
        const TO_LEGACY_SCALE: f64 = 14.0 / 10.0;
        for tilt_value in chart.camera.tilt.values_mut() {
            if let TiltValue::Manual(point) = tilt_value {
                point.v.v = round_to_ksh_value(point.v.v * TO_LEGACY_SCALE);
                if let TiltVf::Value(vf) = &mut point.v.vf {
                    *vf = round_to_ksh_value(*vf * TO_LEGACY_SCALE);
                }
            }
        }
    }

    chart
}

fn parse_define_line(
    line: &[u8],
    ctx: &ReadContext,
    chart: &mut ChartData,
    diag: &mut KshLoadingDiag,
    line_no: i64,
) -> Result<(), ChartError> {
    let is_define_fx = line.starts_with(b"#define_fx ");
    let is_define_filter = !is_define_fx && line.starts_with(b"#define_filter ");
    if !is_define_fx && !is_define_filter {
        // Other "#" lines are consumed without effect
        return Ok(());
    }

    let mut sv: &[u8] = line;

    // Move past the directive to the audio effect name
    {
        let mut white_space_found = false;
        let mut idx = 0;
        while idx < sv.len() {
            if sv[idx] == b' ' {
                white_space_found = true;
            } else if white_space_found {
                break;
            }
            idx += 1;
        }
        sv = &sv[idx..];
    }

    // Audio effect name, then move to the parameter list
    let mut name_bytes: Vec<u8> = Vec::new();
    {
        let mut white_space_found = false;
        let mut idx = 0;
        while idx < sv.len() {
            if sv[idx] == b' ' {
                white_space_found = true;
            } else if white_space_found {
                break;
            } else {
                name_bytes.push(sv[idx]);
            }
            idx += 1;
        }
        sv = &sv[idx..];
        while sv.last() == Some(&b' ') {
            sv = &sv[..sv.len() - 1];
        }
    }
    let mut name = to_utf8_lossy(&name_bytes, ctx.is_utf8);

    let mut params: Dict<String> = Dict::new();
    while !sv.is_empty() {
        let semicolon_idx = sv.iter().position(|&b| b == AUDIO_EFFECT_STR_SEPARATOR as u8);
        let param_sv = match semicolon_idx {
            Some(idx) => &sv[..idx],
            None => sv,
        };
        let (param_name, value) = split_option_line(param_sv, ctx.is_utf8)?;
        if param_name.is_empty() {
            return Err(ChartError::Encoding);
        }
        if !value.is_empty() {
            params.entry(param_name).or_insert(value);
        }

        match semicolon_idx {
            Some(idx) => sv = &sv[idx + 1..],
            None => break,
        }
    }

    let Some(type_str) = params.remove("type") else {
        warn(
            chart,
            diag,
            KshLoadingWarningKind::AudioEffectMissingType,
            WarningScope::Editor,
            format!("Audio effect '{name}' is ignored as it does not contain 'type' parameter."),
            line_no,
        );
        return Ok(());
    };

    let Some(kind) = audio_effect_kind_from_ksh(&type_str) else {
        warn(
            chart,
            diag,
            KshLoadingWarningKind::AudioEffectInvalidType,
            WarningScope::Editor,
            format!("Audio effect '{name}' is ignored as '{type_str}' is not a valid audio effect type"),
            line_no,
        );
        return Ok(());
    };

    let mut params_kson = AudioEffectParams::new();
    for (param_name, value) in params {
        if let Some(kson_name) = param_name_to_kson(&param_name) {
            params_kson.insert(kson_name.to_owned(), value);
        }
    }

    // User-defined audio effects may overwrite preset names
    if let Some(kson_name) = fx_effect_name_to_kson(&name) {
        name = kson_name.to_owned();
    }

    let def = if is_define_fx {
        &mut chart.audio.audio_effect.fx.def
    } else {
        &mut chart.audio.audio_effect.laser.def
    };
    def.push((
        name,
        AudioEffectDef {
            kind,
            v: params_kson,
        },
    ));

    Ok(())
}

fn commit_measure(
    chart: &mut ChartData,
    state: &mut BodyState,
    ctx: &ReadContext,
    diag: &mut KshLoadingDiag,
    line_no: i64,
) {
    let buf_line_count = state.chart_lines.len();
    if buf_line_count == 0 {
        return;
    }

    let measure_pulses = state.current_time_sig.measure_pulses();
    if measure_pulses % buf_line_count as Pulse != 0 {
        warn(
            chart,
            diag,
            KshLoadingWarningKind::MeasureSplitNotDivisible,
            WarningScope::Player,
            format!(
                "Measure starting at pulse {} is not evenly divisible into {} lines.",
                state.current_pulse, buf_line_count
            ),
            line_no,
        );
    }
    let one_line_pulse = measure_pulses / buf_line_count as Pulse;

    // Options first: their pulse values depend only on the line index
    let option_lines = std::mem::take(&mut state.option_lines);
    for option in &option_lines {
        let time = state.current_pulse + option.line_idx as Pulse * one_line_pulse;
        apply_option(chart, state, ctx, time, option);
    }
    state.option_lines = option_lines;

    // Notes
    let chart_lines = std::mem::take(&mut state.chart_lines);
    for (i, buf) in chart_lines.iter().enumerate() {
        let time = state.current_pulse + i as Pulse * one_line_pulse;
        apply_chart_line(chart, state, i, buf, time, one_line_pulse);
    }
    state.chart_lines = chart_lines;

    // Comments
    for (line_idx, value) in &state.comment_lines {
        let time = state.current_pulse + *line_idx as Pulse * one_line_pulse;
        chart
            .editor
            .comment
            .entry(time)
            .or_default()
            .push(value.clone());
    }

    // Unknown lines
    for (line_idx, value) in &state.unknown_lines {
        let time = state.current_pulse + *line_idx as Pulse * one_line_pulse;
        chart
            .compat
            .ksh_unknown
            .line
            .entry(time)
            .or_default()
            .push(value.clone());
    }
}

fn apply_option(
    chart: &mut ChartData,
    state: &mut BodyState,
    ctx: &ReadContext,
    time: Pulse,
    option: &BufOptionLine,
) {
    let BufOptionLine {
        line_idx,
        key,
        value,
    } = option;
    let line_idx = *line_idx;

    if let Some(param_name) = key.strip_suffix("_curve") {
        if let Some(curve) = parse_curve_value(value) {
            state
                .buffered_curves
                .entry(param_name.to_owned())
                .or_default()
                .insert(time, curve);
        }
        return;
    }

    match key.as_str() {
        "t" => {
            if chart.beat.bpm.is_empty() {
                // BPM was missing from the chart metadata
                insert_bpm_change(&mut chart.beat.bpm, 0, value, ctx.ksh_version_int);
            } else {
                insert_bpm_change(&mut chart.beat.bpm, time, value, ctx.ksh_version_int);
            }
        }
        "stop" => {
            let length = ksh_length_to_rel_pulse(parse_i64_prefix(value, 0));
            if length > 0 {
                chart.beat.stop.insert(time, length);
            }
        }
        "zoom_top" | "zoom_bottom" | "zoom_side" => {
            let d_value =
                parse_i64_prefix(truncate_chars(value, ctx.zoom_max_char), 0) as f64;
            let graph = match key.as_str() {
                "zoom_top" => &mut chart.camera.cam.body.zoom_top,
                "zoom_bottom" => &mut chart.camera.cam.body.zoom_bottom,
                _ => &mut chart.camera.cam.body.zoom_side,
            };
            // Out-of-range values are dropped unless the pulse already has a
            // point; then the value still lands in vf for round-trip fidelity
            if d_value.abs() <= ctx.zoom_abs_max
                || (ctx.ksh_version_int < VER_ZOOM_LIMIT_EXTENDED && graph.contains_key(&time))
            {
                insert_graph_point_or_assign_vf(graph, time, d_value);
            }
        }
        "center_split" => {
            let d_value = parse_i64_prefix(value, 0) as f64;
            if d_value.abs() <= CENTER_SPLIT_ABS_MAX {
                insert_graph_point_or_assign_vf(
                    &mut chart.camera.cam.body.center_split,
                    time,
                    d_value,
                );
            }
        }
        "scroll_speed" => {
            let d_value = parse_f64_prefix(value, 0.0);
            insert_graph_point_or_assign_vf(&mut chart.beat.scroll_speed, time, d_value);
        }
        "rotation_deg" => {
            let d_value = parse_i64_prefix(value, 0) as f64;
            if d_value.abs() <= ROTATION_DEG_ABS_MAX {
                insert_graph_point_or_assign_vf(
                    &mut chart.camera.cam.body.rotation_deg,
                    time,
                    d_value,
                );
            }
        }
        "tilt" => apply_tilt_option(chart, state, ctx, time, value),
        "chokkakuvol" => {
            let d_value = parse_i64_prefix(value, 0) as f64 / 100.0;
            chart.audio.key_sound.laser.vol.insert(time, d_value);
        }
        "chokkakuse" => {
            state
                .laser_key_sounds
                .insert(line_idx, value.clone());
        }
        "pfiltergain" => {
            let gain = parse_i32_prefix(value, 50);
            chart
                .audio
                .audio_effect
                .laser
                .legacy
                .filter_gain
                .entry(time)
                .or_insert(gain as f64 / 100.0);
        }
        "fx-l" => {
            state.fx_audio_effect_strs[0].insert(line_idx, value.clone());
        }
        "fx-r" => {
            state.fx_audio_effect_strs[1].insert(line_idx, value.clone());
        }
        // "fx-l_param2"/"fx-r_param2" never occur: "_param1" is pre-v1.60,
        // and Echo (the only two-parameter effect) was added in v1.60
        "fx-l_param1" => {
            state.fx_audio_effect_param_strs[0].insert(line_idx, value.clone());
        }
        "fx-r_param1" => {
            state.fx_audio_effect_param_strs[1].insert(line_idx, value.clone());
        }
        "fx-l_se" | "fx-r_se" => {
            let lane_idx = if key.as_str() == "fx-l_se" { 0 } else { 1 };
            let pair = split_n::<2>(value, ';');
            state.fx_key_sounds[lane_idx].insert(
                line_idx,
                BufKeySound {
                    name: pair[0].clone(),
                    vol: parse_i32_prefix(&pair[1], 100),
                },
            );
        }
        "filtertype" => insert_filtertype(chart, time, value),
        "laserrange_l" => {
            if value.as_str() == "2x" {
                state.laser_x_scale_2x[0].insert(line_idx);
            }
        }
        "laserrange_r" => {
            if value.as_str() == "2x" {
                state.laser_x_scale_2x[1].insert(line_idx);
            }
        }
        _ if key.starts_with("fx:") || key.starts_with("filter:") => {
            let is_fx = key.starts_with("fx:");
            let parts = split_n::<3>(key, ':');
            let (effect_part, param_part) = (&parts[1], &parts[2]);
            if effect_part.is_empty() || param_part.is_empty() {
                return;
            }
            let Some(kson_param) = param_name_to_kson(param_part) else {
                return;
            };
            let effect_name = if is_fx {
                fx_effect_name_to_kson(effect_part)
                    .map(str::to_owned)
                    .unwrap_or_else(|| effect_part.clone())
            } else {
                filter_name_to_kson(effect_part)
                    .map(str::to_owned)
                    .unwrap_or_else(|| effect_part.clone())
            };
            let param_change = if is_fx {
                &mut chart.audio.audio_effect.fx.param_change
            } else {
                &mut chart.audio.audio_effect.laser.param_change
            };
            param_change
                .entry(effect_name)
                .or_default()
                .entry(kson_param.to_owned())
                .or_default()
                .insert(time, value.clone());
        }
        _ => {
            chart
                .compat
                .ksh_unknown
                .option
                .entry(key.clone())
                .or_default()
                .entry(time)
                .or_default()
                .push(value.clone());
        }
    }
}

fn apply_tilt_option(
    chart: &mut ChartData,
    state: &mut BodyState,
    ctx: &ReadContext,
    time: Pulse,
    value: &str,
) {
    let target = &mut chart.camera.tilt;

    if is_tilt_value_manual(value) {
        let d_value = round_to_ksh_value(parse_f64_prefix(value, 0.0));
        if d_value.abs() <= MANUAL_TILT_ABS_MAX {
            // Consecutive tilt values at the same pulse form an immediate change
            if let Some((&last_pulse, &last_value)) = target.iter().next_back() {
                if last_pulse == time {
                    if let TiltValue::Manual(last_point) = last_value {
                        target.insert(
                            time,
                            TiltValue::Manual(TiltGraphPoint::with_curve(
                                TiltGraphValue::with_transition(
                                    last_point.v.v,
                                    TiltVf::Value(d_value),
                                ),
                                last_point.curve,
                            )),
                        );
                        return;
                    }
                }
            }
            target.insert(
                time,
                TiltValue::Manual(TiltGraphPoint::new(d_value)),
            );
        }
        if ctx.ksh_version_int < VER_MANUAL_TILT_SCALE_CHANGED && d_value.abs() >= 10.0 {
            // Legacy charts with large manual tilt values depend on the
            // pre-v1.70 tilt scale (14 degrees)
            state.use_legacy_scale_for_manual_tilt = true;
        }
    } else {
        let kind = auto_tilt_kind_from_ksh(value);

        // Immediate change from a manual tilt into an auto tilt state
        if let Some((&last_pulse, &last_value)) = target.iter().next_back() {
            if last_pulse == time {
                if let TiltValue::Manual(last_point) = last_value {
                    target.insert(
                        time,
                        TiltValue::Manual(TiltGraphPoint::with_curve(
                            TiltGraphValue::with_transition(last_point.v.v, TiltVf::Auto(kind)),
                            last_point.curve,
                        )),
                    );
                    return;
                }
            }
        }
        target.insert(time, TiltValue::Auto(kind));
    }
}

fn apply_chart_line(
    chart: &mut ChartData,
    state: &mut BodyState,
    line_idx: usize,
    buf: &[u8],
    time: Pulse,
    one_line_pulse: Pulse,
) {
    let mut current_block = 0usize;
    let mut lane_idx = 0usize;

    let mut j = 0usize;
    while j < buf.len() {
        let c = buf[j];
        if c == BLOCK_SEPARATOR {
            current_block += 1;
            lane_idx = 0;
            j += 1;
            continue;
        }

        if current_block == 0 && lane_idx < NUM_BT_LANES {
            let prepared = &mut state.prepared_bt[lane_idx];
            match c {
                b'2' => {
                    // Long BT note
                    if !prepared.prepared() {
                        prepared.prepare(time);
                    }
                    prepared.extend(one_line_pulse);
                }
                b'1' => {
                    // Chip BT note
                    prepared.publish(&mut chart.note.bt[lane_idx]);
                    chart.note.bt[lane_idx]
                        .entry(time)
                        .or_insert(Interval { length: 0 });
                }
                _ => {
                    prepared.publish(&mut chart.note.bt[lane_idx]);
                }
            }
        } else if current_block == 1 && lane_idx < NUM_FX_LANES {
            let prepared = &mut state.prepared_fx[lane_idx];
            let long_event = &mut chart.audio.audio_effect.fx.long_event;
            match c {
                b'2' => {
                    // Chip FX note
                    chart.note.fx[lane_idx]
                        .entry(time)
                        .or_insert(Interval { length: 0 });
                    if let Some(key_sound) = state.fx_key_sounds[lane_idx].get(&line_idx) {
                        chart
                            .audio
                            .key_sound
                            .fx
                            .chip_event
                            .entry(key_sound.name.clone())
                            .or_default()[lane_idx]
                            .entry(time)
                            .or_insert(KeySoundInvokeFx {
                                vol: key_sound.vol as f64 / 100.0,
                            });
                    }
                }
                b'0' => {
                    prepared.publish(&mut chart.note.fx[lane_idx]);
                }
                b'1' => {
                    // Long FX note
                    if let Some(effect_str) =
                        state.fx_audio_effect_strs[lane_idx].get(&line_idx)
                    {
                        let param_str = state.fx_audio_effect_param_strs[lane_idx]
                            .get(&line_idx)
                            .cloned()
                            .unwrap_or_default();
                        let effect_str = effect_str.clone();
                        prepared.prepare_with_effect(
                            time,
                            &effect_str,
                            &param_str,
                            false,
                            lane_idx,
                            long_event,
                        );
                    } else {
                        prepared.prepare(time, lane_idx, long_event);
                    }
                    prepared.extend(one_line_pulse);
                }
                _ => {
                    // Long FX note with a legacy effect character
                    let effect_str = legacy_fx_char_to_audio_effect_str(c);
                    let param_str = state.fx_audio_effect_param_strs[lane_idx]
                        .get(&line_idx)
                        .cloned()
                        .unwrap_or_default();
                    prepared.prepare_with_effect(
                        time,
                        effect_str,
                        &param_str,
                        true,
                        lane_idx,
                        long_event,
                    );
                    prepared.extend(one_line_pulse);
                }
            }
        } else if current_block == 2 && lane_idx < NUM_LASER_LANES {
            let prepared = &mut state.prepared_laser[lane_idx];
            match c {
                b'-' => {
                    prepared.publish(&mut chart.note.laser[lane_idx]);
                    prepared.clear();
                }
                b':' => {}
                _ => {
                    let laser_x = char_to_laser_x(c);
                    if !prepared.prepared() {
                        let wide = state.laser_x_scale_2x[lane_idx].contains(&line_idx);
                        prepared.prepare(time, wide);
                    }
                    let graph_value = laser_x_to_graph_value(laser_x, prepared.wide());
                    prepared.add_graph_point(time, graph_value);

                    if let Some(name) = state.laser_key_sounds.get(&line_idx) {
                        // Inserted even when the laser point is not a slam;
                        // harmless for playback
                        if !name.is_empty() {
                            pulse_set_insert(
                                &mut chart.audio.key_sound.laser.slam_event,
                                name,
                                time,
                            );
                        }
                    }
                }
            }
        } else if current_block == 2 && lane_idx == NUM_LASER_LANES {
            // Trailing lane spin suffix
            if let Some(spin) = parse_lane_spin(&buf[j..]) {
                let slam_event = &mut chart.camera.cam.pattern.laser.slam_event;
                match spin {
                    LaneSpin::Normal { d, length } => {
                        slam_event
                            .spin
                            .entry(time)
                            .or_insert(crate::camera::CamPatternInvokeSpin { d, length });
                    }
                    LaneSpin::Half { d, length } => {
                        slam_event
                            .half_spin
                            .entry(time)
                            .or_insert(crate::camera::CamPatternInvokeSpin { d, length });
                    }
                    LaneSpin::Swing {
                        d,
                        length,
                        amplitude,
                        repeat,
                        decay_order,
                    } => {
                        slam_event.swing.entry(time).or_insert(
                            crate::camera::CamPatternInvokeSwing {
                                d,
                                length,
                                v: crate::camera::CamPatternInvokeSwingValue {
                                    scale: amplitude as f64,
                                    repeat,
                                    decay_order,
                                },
                            },
                        );
                    }
                }
            }
            break;
        }

        lane_idx += 1;
        j += 1;
    }
}

// ---------------------------------------------------------------------------
// Post-passes

fn apply_buffered_curves_to_graph(
    param_name: &str,
    graph: &mut Graph,
    buffered_curves: &HashMap<String, ByPulse<GraphCurve>>,
) {
    let Some(curves) = buffered_curves.get(param_name) else {
        return;
    };
    for (&pulse, &curve) in curves {
        if let Some(point) = graph.get_mut(&pulse) {
            point.curve = curve;
        }
    }
}

fn apply_buffered_curves_to_tilt(
    buffered_curves: &HashMap<String, ByPulse<GraphCurve>>,
    tilt: &mut ByPulse<TiltValue>,
) {
    let Some(curves) = buffered_curves.get("tilt") else {
        return;
    };
    for (&pulse, &curve) in curves {
        if let Some(TiltValue::Manual(point)) = tilt.get_mut(&pulse) {
            point.curve = curve;
        }
    }
}

fn apply_buffered_curves_to_lasers(
    buffered_curves: &HashMap<String, ByPulse<GraphCurve>>,
    chart: &mut ChartData,
) {
    for (lane_idx, param_name) in ["laser_l", "laser_r"].iter().enumerate() {
        let Some(curves) = buffered_curves.get(*param_name) else {
            continue;
        };
        for (&pulse, &curve) in curves {
            for (&section_pulse, section) in chart.note.laser[lane_idx].iter_mut() {
                let rel_pulse = pulse - section_pulse;
                if rel_pulse >= 0 {
                    if let Some(point) = section.v.get_mut(&rel_pulse) {
                        point.curve = curve;
                    }
                }
            }
        }
    }
}

/// Resolves the temporary "_param1"/"_param2" keys of FX long events into
/// named parameters, once the effect type is known.
fn resolve_fx_long_event_params(chart: &mut ChartData, diag: &mut KshLoadingDiag) {
    let unspecified = AUDIO_EFFECT_PARAM_UNSPECIFIED.to_string();

    let kinds: Vec<(String, AudioEffectKind)> = chart
        .audio
        .audio_effect
        .fx
        .long_event
        .keys()
        .map(|name| {
            let kind = match chart.audio.audio_effect.fx.def_by_name(name) {
                Some(def) => def.kind,
                None => AudioEffectKind::from_name(name),
            };
            (name.clone(), kind)
        })
        .collect();

    let mut undefined_warnings: Vec<String> = Vec::new();
    for (name, kind) in &kinds {
        if !name.is_empty() && *kind == AudioEffectKind::Unspecified {
            undefined_warnings.push(format!(
                "Undefined audio effect '{name}' is specified in audio.audio_effect.fx.long_event."
            ));
        }
    }

    for (name, kind) in kinds {
        let Some(lanes) = chart.audio.audio_effect.fx.long_event.get_mut(&name) else {
            continue;
        };
        for lane in lanes.iter_mut() {
            for params in lane.values_mut() {
                if kind == AudioEffectKind::Unspecified {
                    params.remove("_param1");
                    params.remove("_param2");
                    continue;
                }

                if !(params.contains_key("_param1") && params.contains_key("_param2")) {
                    continue;
                }
                let mut param1 = params.remove("_param1").unwrap_or_default();
                let mut param2 = params.remove("_param2").unwrap_or_default();

                if param1 == unspecified {
                    param1 = match kind {
                        AudioEffectKind::Retrigger => "8",
                        AudioEffectKind::Gate => "4",
                        AudioEffectKind::Wobble => "12",
                        AudioEffectKind::PitchShift => "12",
                        AudioEffectKind::Bitcrusher => "5",
                        AudioEffectKind::Tapestop => "50",
                        AudioEffectKind::Echo => "4",
                        _ => "0",
                    }
                    .to_owned();
                }
                if param2 == unspecified {
                    param2 = match kind {
                        AudioEffectKind::Echo => "60",
                        _ => "0",
                    }
                    .to_owned();
                }

                match kind {
                    AudioEffectKind::Retrigger
                    | AudioEffectKind::Gate
                    | AudioEffectKind::Wobble => {
                        if parse_i32_prefix(&param1, 0) > 0 {
                            params
                                .entry("wave_length".to_owned())
                                .or_insert(format!("1/{param1}"));
                        }
                    }
                    AudioEffectKind::PitchShift => {
                        params.entry("pitch".to_owned()).or_insert(param1);
                    }
                    AudioEffectKind::Bitcrusher => {
                        params
                            .entry("reduction".to_owned())
                            .or_insert(format!("{param1}samples"));
                    }
                    AudioEffectKind::Tapestop => {
                        params
                            .entry("speed".to_owned())
                            .or_insert(format!("{param1}%"));
                    }
                    AudioEffectKind::Echo => {
                        if parse_i32_prefix(&param1, 0) > 0 {
                            params
                                .entry("wave_length".to_owned())
                                .or_insert(format!("1/{param1}"));
                        }
                        params
                            .entry("feedback_level".to_owned())
                            .or_insert(format!("{param2}%"));
                    }
                    _ => {}
                }
            }
        }
    }

    for message in undefined_warnings {
        warn(
            chart,
            diag,
            KshLoadingWarningKind::UndefinedAudioEffect,
            WarningScope::Player,
            message,
            0,
        );
    }
}
