use std::io::Read;

use serde_json::Value;

use crate::camera::{
    AutoTiltKind, CamPatternInvokeSpin, CamPatternInvokeSwing, CameraInfo, TiltGraphPoint,
    TiltGraphValue, TiltValue, TiltVf,
};
use crate::diag::{KsonLoadingDiag, KsonLoadingWarningKind, WarningScope};
use crate::effects::{
    AudioEffectDef, AudioEffectFxInfo, AudioEffectInfo, AudioEffectKind, AudioEffectLaserInfo,
    AudioEffectParams,
};
use crate::kson::KSON_FORMAT_VERSION;
use crate::{
    AudioInfo, BeatInfo, BgInfo, BgmInfo, ByPulse, ByPulseMulti, ChartData, ChartError, CompatInfo,
    EditorInfo, GaugeInfo, GraphCurve, GraphPoint, GraphValue, Interval, KeySoundFxInfo,
    KeySoundInfo, KeySoundInvokeFx, KeySoundLaserInfo, LaserSection, MetaAudioInfo, MetaBgmInfo,
    MetaChartData, MetaInfo, NoteInfo, Pulse, PulseSet, TimeSig, LASER_X_SCALE_1X,
    NUM_FX_LANES,
};

/// Loads a KSON chart. JSON and schema errors are reported through
/// `ChartData::error`; malformed entries are skipped with warnings.
pub fn load_chart<R: Read>(reader: R) -> ChartData {
    let mut diag = KsonLoadingDiag::default();
    load_chart_with_diag(reader, &mut diag)
}

pub fn load_chart_with_diag<R: Read>(reader: R, diag: &mut KsonLoadingDiag) -> ChartData {
    let value: Value = match serde_json::from_reader(reader) {
        Ok(value) => value,
        Err(e) => {
            let mut chart = ChartData::from_error(ChartError::KsonParse);
            let message = format!("JSON parse error: {e}");
            diag.push(
                KsonLoadingWarningKind::JsonParseError,
                WarningScope::Both,
                message.clone(),
            );
            chart.warnings.push(message);
            return chart;
        }
    };
    chart_from_value(&value, diag)
}

pub fn load_chart_from_path(path: impl AsRef<std::path::Path>) -> ChartData {
    let path = path.as_ref();
    if !path.exists() {
        return ChartData::from_error(ChartError::FileNotFound);
    }
    match std::fs::File::open(path) {
        Ok(file) => load_chart(std::io::BufReader::new(file)),
        Err(_) => ChartData::from_error(ChartError::CouldNotOpenInputFileStream),
    }
}

/// Loads only the metadata of a KSON chart.
pub fn load_meta<R: Read>(reader: R) -> MetaChartData {
    let chart = load_chart(reader);
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

struct ReadCtx<'a> {
    warnings: Vec<String>,
    diag: &'a mut KsonLoadingDiag,
}

impl ReadCtx<'_> {
    fn warn(&mut self, kind: KsonLoadingWarningKind, scope: WarningScope, message: &str) {
        self.warnings.push(message.to_owned());
        self.diag.push(kind, scope, message);
    }
}

pub(crate) fn chart_from_value(value: &Value, diag: &mut KsonLoadingDiag) -> ChartData {
    let mut ctx = ReadCtx {
        warnings: Vec::new(),
        diag,
    };
    let mut chart = ChartData::default();

    let Some(format_version) = value.get("format_version") else {
        chart.error = Some(ChartError::KsonParse);
        ctx.warn(
            KsonLoadingWarningKind::MissingFormatVersion,
            WarningScope::Both,
            "Missing required field: format_version",
        );
        chart.warnings = ctx.warnings;
        return chart;
    };
    let Some(format_version) = format_version.as_i64() else {
        chart.error = Some(ChartError::KsonParse);
        ctx.warn(
            KsonLoadingWarningKind::InvalidFormatVersion,
            WarningScope::Both,
            "Invalid format_version: must be an integer",
        );
        chart.warnings = ctx.warnings;
        return chart;
    };
    if format_version > KSON_FORMAT_VERSION {
        ctx.warn(
            KsonLoadingWarningKind::NewerFormatVersion,
            WarningScope::Editor,
            &format!("Chart format version {format_version} is newer than supported"),
        );
    }

    if let Some(j) = value.get("meta") {
        chart.meta = parse_meta(j);
    }
    if let Some(j) = value.get("beat") {
        chart.beat = parse_beat(j, &mut ctx);
    } else {
        chart.beat.scroll_speed.insert(0, GraphPoint::new(1.0));
    }
    if let Some(j) = value.get("gauge") {
        chart.gauge = parse_gauge(j);
    }
    if let Some(j) = value.get("note") {
        chart.note = parse_note(j, &mut ctx);
    }
    if let Some(j) = value.get("audio") {
        chart.audio = parse_audio(j, &mut ctx);
    }
    if let Some(j) = value.get("camera") {
        chart.camera = parse_camera(j, &mut ctx);
    }
    if let Some(j) = value.get("bg") {
        chart.bg = parse_bg(j);
    }
    if let Some(j) = value.get("editor") {
        chart.editor = parse_editor(j, &mut ctx);
    }
    if let Some(j) = value.get("compat") {
        chart.compat = parse_compat(j);
    }
    if let Some(j) = value.get("impl") {
        chart.impl_data = j.clone();
    }

    chart.warnings = ctx.warnings;
    chart
}

// ---------------------------------------------------------------------------
// Primitive helpers

fn get_str(j: &Value, key: &str, default: &str) -> String {
    j.get(key)
        .and_then(Value::as_str)
        .unwrap_or(default)
        .to_owned()
}

fn get_f64(j: &Value, key: &str, default: f64) -> f64 {
    j.get(key).and_then(Value::as_f64).unwrap_or(default)
}

fn get_i64(j: &Value, key: &str, default: i64) -> i64 {
    j.get(key).and_then(Value::as_i64).unwrap_or(default)
}

fn get_i32(j: &Value, key: &str, default: i32) -> i32 {
    get_i64(j, key, default as i64) as i32
}

fn get_bool(j: &Value, key: &str, default: bool) -> bool {
    j.get(key).and_then(Value::as_bool).unwrap_or(default)
}

fn parse_by_pulse_f64(j: &Value, ctx: &mut ReadCtx) -> ByPulse<f64> {
    let mut result = ByPulse::new();
    let Some(array) = j.as_array() else {
        return result;
    };
    for item in array {
        let entry = item.as_array().filter(|a| a.len() >= 2).and_then(|a| {
            Some((a[0].as_i64()?, a[1].as_f64()?))
        });
        match entry {
            Some((pulse, value)) => {
                result.insert(pulse, value);
            }
            None => ctx.warn(
                KsonLoadingWarningKind::InvalidByPulseEntryFormat,
                WarningScope::Editor,
                "Invalid ByPulse entry format",
            ),
        }
    }
    result
}

fn parse_by_pulse_i64(j: &Value, ctx: &mut ReadCtx) -> ByPulse<i64> {
    let mut result = ByPulse::new();
    let Some(array) = j.as_array() else {
        return result;
    };
    for item in array {
        let entry = item.as_array().filter(|a| a.len() >= 2).and_then(|a| {
            Some((a[0].as_i64()?, a[1].as_i64()?))
        });
        match entry {
            Some((pulse, value)) => {
                result.insert(pulse, value);
            }
            None => ctx.warn(
                KsonLoadingWarningKind::InvalidByPulseEntryFormat,
                WarningScope::Editor,
                "Invalid ByPulse entry format",
            ),
        }
    }
    result
}

fn parse_by_pulse_string(j: &Value, ctx: &mut ReadCtx) -> ByPulse<String> {
    let mut result = ByPulse::new();
    let Some(array) = j.as_array() else {
        return result;
    };
    for item in array {
        let entry = item.as_array().filter(|a| a.len() >= 2).and_then(|a| {
            Some((a[0].as_i64()?, a[1].as_str()?.to_owned()))
        });
        match entry {
            Some((pulse, value)) => {
                result.insert(pulse, value);
            }
            None => ctx.warn(
                KsonLoadingWarningKind::InvalidByPulseEntryFormat,
                WarningScope::Editor,
                "Invalid ByPulse entry format",
            ),
        }
    }
    result
}

fn parse_by_pulse_multi_string(j: &Value, ctx: &mut ReadCtx) -> ByPulseMulti<String> {
    let mut result = ByPulseMulti::new();
    let Some(array) = j.as_array() else {
        return result;
    };
    for item in array {
        let entry = item.as_array().filter(|a| a.len() >= 2).and_then(|a| {
            Some((a[0].as_i64()?, a[1].as_str()?.to_owned()))
        });
        match entry {
            Some((pulse, value)) => result.entry(pulse).or_default().push(value),
            None => ctx.warn(
                KsonLoadingWarningKind::InvalidByPulseEntryFormat,
                WarningScope::Editor,
                "Invalid ByPulse entry format",
            ),
        }
    }
    result
}

fn parse_pulse_set(j: &Value) -> PulseSet {
    let mut set = PulseSet::new();
    if let Some(array) = j.as_array() {
        for pulse in array {
            if let Some(pulse) = pulse.as_i64() {
                set.insert(pulse);
            }
        }
    }
    set
}

fn parse_graph_value(j: &Value, ctx: &mut ReadCtx) -> GraphValue {
    if let Some(v) = j.as_f64() {
        return GraphValue::new(v);
    }
    if let Some(array) = j.as_array() {
        if array.len() >= 2 {
            if let (Some(v), Some(vf)) = (array[0].as_f64(), array[1].as_f64()) {
                return GraphValue::with_transition(v, vf);
            }
        }
    }
    ctx.warn(
        KsonLoadingWarningKind::InvalidGraphValueFormat,
        WarningScope::Editor,
        "Invalid graph value format",
    );
    GraphValue::new(0.0)
}

fn parse_curve(j: &Value) -> GraphCurve {
    if let Some(array) = j.as_array() {
        if array.len() >= 2 {
            if let (Some(a), Some(b)) = (array[0].as_f64(), array[1].as_f64()) {
                return GraphCurve::new(a, b);
            }
        }
    }
    GraphCurve::default()
}

/// Parses a graph point from an array item where `item[value_idx]` is the
/// value and `item[value_idx + 1]` the optional curve.
fn parse_graph_point_from_item(item: &[Value], value_idx: usize, ctx: &mut ReadCtx) -> GraphPoint {
    let v = match item.get(value_idx) {
        Some(value) => parse_graph_value(value, ctx),
        None => GraphValue::new(0.0),
    };
    let curve = match item.get(value_idx + 1) {
        Some(curve) => parse_curve(curve),
        None => GraphCurve::default(),
    };
    GraphPoint::with_curve(v, curve)
}

fn parse_graph(j: &Value, ctx: &mut ReadCtx) -> crate::Graph {
    let mut result = crate::Graph::new();
    let Some(array) = j.as_array() else {
        return result;
    };
    for item in array {
        match item.as_array().filter(|a| a.len() >= 2) {
            Some(entry) => {
                let Some(pulse) = entry[0].as_i64() else {
                    ctx.warn(
                        KsonLoadingWarningKind::InvalidGraphEntryFormat,
                        WarningScope::Editor,
                        "Invalid graph entry format",
                    );
                    continue;
                };
                let point = parse_graph_point_from_item(entry, 1, ctx);
                result.insert(pulse, point);
            }
            None => ctx.warn(
                KsonLoadingWarningKind::InvalidGraphEntryFormat,
                WarningScope::Editor,
                "Invalid graph entry format",
            ),
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Sections

fn parse_meta(j: &Value) -> MetaInfo {
    let mut meta = MetaInfo {
        title: get_str(j, "title", ""),
        title_translit: get_str(j, "title_translit", ""),
        title_img_filename: get_str(j, "title_img_filename", ""),
        artist: get_str(j, "artist", ""),
        artist_translit: get_str(j, "artist_translit", ""),
        artist_img_filename: get_str(j, "artist_img_filename", ""),
        chart_author: get_str(j, "chart_author", ""),
        level: get_i32(j, "level", 1),
        disp_bpm: get_str(j, "disp_bpm", ""),
        std_bpm: get_f64(j, "std_bpm", 0.0),
        jacket_filename: get_str(j, "jacket_filename", ""),
        jacket_author: get_str(j, "jacket_author", ""),
        icon_filename: get_str(j, "icon_filename", ""),
        information: get_str(j, "information", ""),
        ..MetaInfo::default()
    };

    if let Some(difficulty) = j.get("difficulty") {
        if let Some(idx) = difficulty.as_i64() {
            meta.difficulty.idx = idx as i32;
        } else if let Some(name) = difficulty.as_str() {
            // A string difficulty always plays as "infinite"
            meta.difficulty.idx = 3;
            meta.difficulty.name = name.to_owned();
        }
    }

    meta
}

fn parse_beat(j: &Value, ctx: &mut ReadCtx) -> BeatInfo {
    let mut beat = BeatInfo::default();

    if let Some(bpm) = j.get("bpm") {
        beat.bpm = parse_by_pulse_f64(bpm, ctx);
    }

    if let Some(time_sig_array) = j.get("time_sig").and_then(Value::as_array) {
        for item in time_sig_array {
            let entry = item.as_array().filter(|a| a.len() >= 2).and_then(|a| {
                let idx = a[0].as_i64()?;
                let sig = a[1].as_array().filter(|s| s.len() >= 2)?;
                Some((idx, sig[0].as_i64()? as i32, sig[1].as_i64()? as i32))
            });
            match entry {
                Some((idx, n, d)) => {
                    beat.time_sig.insert(idx, TimeSig { n, d });
                }
                None => ctx.warn(
                    KsonLoadingWarningKind::InvalidByMeasureIdxEntryFormat,
                    WarningScope::Editor,
                    "Invalid ByMeasureIdx entry format",
                ),
            }
        }
    }

    match j.get("scroll_speed") {
        Some(scroll_speed) => beat.scroll_speed = parse_graph(scroll_speed, ctx),
        None => {
            beat.scroll_speed.insert(0, GraphPoint::new(1.0));
        }
    }

    if let Some(stop) = j.get("stop") {
        beat.stop = parse_by_pulse_i64(stop, ctx);
    }

    beat
}

fn parse_gauge(j: &Value) -> GaugeInfo {
    GaugeInfo {
        total: get_i32(j, "total", 0),
    }
}

fn parse_button_lane(j: &Value, lane: &mut ByPulse<Interval>, ctx: &mut ReadCtx) {
    let Some(array) = j.as_array() else {
        return;
    };
    for item in array {
        if let Some(pulse) = item.as_i64() {
            // Compact form: a bare pulse is a chip note
            lane.insert(pulse, Interval { length: 0 });
        } else if let Some(entry) = item.as_array().filter(|a| a.len() >= 2) {
            match (entry[0].as_i64(), entry[1].as_i64()) {
                (Some(pulse), Some(length)) => {
                    lane.insert(pulse, Interval { length });
                }
                _ => ctx.warn(
                    KsonLoadingWarningKind::InvalidNoteEntryFormat,
                    WarningScope::Editor,
                    "Invalid note entry format",
                ),
            }
        } else {
            ctx.warn(
                KsonLoadingWarningKind::InvalidNoteEntryFormat,
                WarningScope::Editor,
                "Invalid note entry format",
            );
        }
    }
}

fn parse_laser_lane(j: &Value, lane: &mut ByPulse<LaserSection>, ctx: &mut ReadCtx) {
    let Some(array) = j.as_array() else {
        return;
    };
    for item in array {
        let Some(entry) = item.as_array().filter(|a| a.len() >= 2) else {
            ctx.warn(
                KsonLoadingWarningKind::InvalidLaserSectionFormat,
                WarningScope::Editor,
                "Invalid laser section format",
            );
            continue;
        };
        let Some(pulse) = entry[0].as_i64() else {
            ctx.warn(
                KsonLoadingWarningKind::InvalidLaserSectionFormat,
                WarningScope::Editor,
                "Invalid laser section format",
            );
            continue;
        };

        let mut section = LaserSection::new();
        if let Some(points) = entry[1].as_array() {
            for point in points {
                if let Some(point_entry) = point.as_array().filter(|a| a.len() >= 2) {
                    if let Some(ry) = point_entry[0].as_i64() {
                        let graph_point = parse_graph_point_from_item(point_entry, 1, ctx);
                        section.v.insert(ry, graph_point);
                    }
                }
            }
        }
        section.w = entry
            .get(2)
            .and_then(Value::as_i64)
            .unwrap_or(LASER_X_SCALE_1X as i64) as i32;

        lane.insert(pulse, section);
    }
}

fn parse_note(j: &Value, ctx: &mut ReadCtx) -> NoteInfo {
    let mut note = NoteInfo::default();

    if let Some(bt_array) = j.get("bt").and_then(Value::as_array) {
        for (i, lane) in bt_array.iter().take(note.bt.len()).enumerate() {
            parse_button_lane(lane, &mut note.bt[i], ctx);
        }
    }
    if let Some(fx_array) = j.get("fx").and_then(Value::as_array) {
        for (i, lane) in fx_array.iter().take(note.fx.len()).enumerate() {
            parse_button_lane(lane, &mut note.fx[i], ctx);
        }
    }
    if let Some(laser_array) = j.get("laser").and_then(Value::as_array) {
        for (i, lane) in laser_array.iter().take(note.laser.len()).enumerate() {
            parse_laser_lane(lane, &mut note.laser[i], ctx);
        }
    }

    note
}

fn parse_bgm(j: &Value) -> BgmInfo {
    let mut bgm = BgmInfo {
        filename: get_str(j, "filename", ""),
        vol: get_f64(j, "vol", 1.0),
        offset: get_i32(j, "offset", 0),
        ..BgmInfo::default()
    };

    if let Some(preview) = j.get("preview") {
        bgm.preview.offset = get_i32(preview, "offset", 0);
        bgm.preview.duration = get_i32(preview, "duration", 15000);
    }

    if let Some(legacy) = j.get("legacy") {
        if let Some(fp_array) = legacy.get("fp_filenames").and_then(Value::as_array) {
            let mut filenames = fp_array.iter().filter_map(Value::as_str);
            bgm.legacy.filename_f = filenames.next().unwrap_or("").to_owned();
            bgm.legacy.filename_p = filenames.next().unwrap_or("").to_owned();
            bgm.legacy.filename_fp = filenames.next().unwrap_or("").to_owned();
        }
    }

    bgm
}

fn parse_audio_effect_def(j: &Value) -> AudioEffectDef {
    let mut def = AudioEffectDef::default();
    if let Some(type_str) = j.get("type").and_then(Value::as_str) {
        def.kind = AudioEffectKind::from_name(type_str);
    }
    if let Some(v) = j.get("v").and_then(Value::as_object) {
        for (key, value) in v {
            if let Some(value) = value.as_str() {
                def.v.insert(key.clone(), value.to_owned());
            }
        }
    }
    def
}

fn parse_def_list(j: &Value) -> Vec<(String, AudioEffectDef)> {
    let mut defs = Vec::new();
    if let Some(array) = j.as_array() {
        for item in array {
            if let Some(entry) = item.as_array().filter(|a| a.len() >= 2) {
                if let Some(name) = entry[0].as_str() {
                    defs.push((name.to_owned(), parse_audio_effect_def(&entry[1])));
                }
            }
        }
    }
    defs
}

fn parse_param_change(
    j: &Value,
    target: &mut crate::Dict<crate::Dict<ByPulse<String>>>,
    ctx: &mut ReadCtx,
) {
    let Some(obj) = j.as_object() else {
        return;
    };
    for (effect_name, params) in obj {
        let Some(params_obj) = params.as_object() else {
            continue;
        };
        for (param_name, values) in params_obj {
            if values.is_array() {
                target
                    .entry(effect_name.clone())
                    .or_default()
                    .insert(param_name.clone(), parse_by_pulse_string(values, ctx));
            }
        }
    }
}

fn parse_audio_effect_params(j: &Value) -> AudioEffectParams {
    let mut params = AudioEffectParams::new();
    if let Some(obj) = j.as_object() {
        for (key, value) in obj {
            if let Some(value) = value.as_str() {
                params.insert(key.clone(), value.to_owned());
            }
        }
    }
    params
}

fn parse_audio_effect_fx(j: &Value, ctx: &mut ReadCtx) -> AudioEffectFxInfo {
    let mut fx = AudioEffectFxInfo::default();

    if let Some(def) = j.get("def") {
        fx.def = parse_def_list(def);
    }
    if let Some(param_change) = j.get("param_change") {
        parse_param_change(param_change, &mut fx.param_change, ctx);
    }

    if let Some(long_event) = j.get("long_event").and_then(Value::as_object) {
        for (effect_name, lanes) in long_event {
            let Some(lanes_array) = lanes.as_array() else {
                continue;
            };
            let mut fx_lanes: [ByPulse<AudioEffectParams>; NUM_FX_LANES] = Default::default();
            for (i, lane) in lanes_array.iter().take(NUM_FX_LANES).enumerate() {
                let Some(lane_array) = lane.as_array() else {
                    continue;
                };
                for event in lane_array {
                    if let Some(pulse) = event.as_i64() {
                        fx_lanes[i].insert(pulse, AudioEffectParams::new());
                    } else if let Some(entry) = event.as_array().filter(|a| a.len() >= 2) {
                        if let Some(pulse) = entry[0].as_i64() {
                            fx_lanes[i].insert(pulse, parse_audio_effect_params(&entry[1]));
                        }
                    }
                }
            }
            fx.long_event.insert(effect_name.clone(), fx_lanes);
        }
    }

    fx
}

fn parse_audio_effect_laser(j: &Value, ctx: &mut ReadCtx) -> AudioEffectLaserInfo {
    let mut laser = AudioEffectLaserInfo::default();

    if let Some(def) = j.get("def") {
        laser.def = parse_def_list(def);
    }
    if let Some(param_change) = j.get("param_change") {
        parse_param_change(param_change, &mut laser.param_change, ctx);
    }
    if let Some(pulse_event) = j.get("pulse_event").and_then(Value::as_object) {
        for (effect_name, pulses) in pulse_event {
            if pulses.is_array() {
                laser
                    .pulse_event
                    .insert(effect_name.clone(), parse_pulse_set(pulses));
            }
        }
    }

    laser.peaking_filter_delay = get_i32(j, "peaking_filter_delay", 0).clamp(0, 160);

    if let Some(legacy) = j.get("legacy") {
        if let Some(filter_gain) = legacy.get("filter_gain") {
            if filter_gain.is_array() {
                laser.legacy.filter_gain = parse_by_pulse_f64(filter_gain, ctx);
            }
        }
    }

    laser
}

fn parse_key_sound(j: &Value, ctx: &mut ReadCtx) -> KeySoundInfo {
    let mut key_sound = KeySoundInfo::default();

    if let Some(fx) = j.get("fx") {
        let mut fx_info = KeySoundFxInfo::default();
        if let Some(chip_event) = fx.get("chip_event").and_then(Value::as_object) {
            for (sound_name, lanes) in chip_event {
                let Some(lanes_array) = lanes.as_array() else {
                    continue;
                };
                let mut fx_lanes: [ByPulse<KeySoundInvokeFx>; NUM_FX_LANES] = Default::default();
                for (i, lane) in lanes_array.iter().take(NUM_FX_LANES).enumerate() {
                    let Some(lane_array) = lane.as_array() else {
                        continue;
                    };
                    for event in lane_array {
                        if let Some(pulse) = event.as_i64() {
                            fx_lanes[i].insert(pulse, KeySoundInvokeFx::default());
                        } else if let Some(entry) = event.as_array().filter(|a| a.len() >= 2) {
                            if let Some(pulse) = entry[0].as_i64() {
                                let vol = get_f64(&entry[1], "vol", 1.0);
                                fx_lanes[i].insert(pulse, KeySoundInvokeFx { vol });
                            }
                        }
                    }
                }
                fx_info.chip_event.insert(sound_name.clone(), fx_lanes);
            }
        }
        key_sound.fx = fx_info;
    }

    if let Some(laser) = j.get("laser") {
        let mut laser_info = KeySoundLaserInfo::default();
        if let Some(vol) = laser.get("vol") {
            laser_info.vol = parse_by_pulse_f64(vol, ctx);
        }
        if let Some(slam_event) = laser.get("slam_event").and_then(Value::as_object) {
            for (event_name, pulses) in slam_event {
                if pulses.is_array() {
                    laser_info
                        .slam_event
                        .insert(event_name.clone(), parse_pulse_set(pulses));
                }
            }
        }
        if let Some(legacy) = laser.get("legacy") {
            laser_info.legacy.vol_auto = get_bool(legacy, "vol_auto", false);
        }
        key_sound.laser = laser_info;
    }

    key_sound
}

fn parse_audio(j: &Value, ctx: &mut ReadCtx) -> AudioInfo {
    let mut audio = AudioInfo::default();

    if let Some(bgm) = j.get("bgm") {
        audio.bgm = parse_bgm(bgm);
    }
    if let Some(key_sound) = j.get("key_sound") {
        audio.key_sound = parse_key_sound(key_sound, ctx);
    }
    if let Some(audio_effect) = j.get("audio_effect") {
        let mut info = AudioEffectInfo::default();
        if let Some(fx) = audio_effect.get("fx") {
            info.fx = parse_audio_effect_fx(fx, ctx);
        }
        if let Some(laser) = audio_effect.get("laser") {
            info.laser = parse_audio_effect_laser(laser, ctx);
        }
        audio.audio_effect = info;
    }

    audio
}

fn parse_tilt(j: &Value, ctx: &mut ReadCtx) -> ByPulse<TiltValue> {
    let mut tilt = ByPulse::new();
    let Some(array) = j.as_array() else {
        return tilt;
    };

    for item in array {
        let Some(entry) = item.as_array().filter(|a| a.len() >= 2) else {
            ctx.warn(
                KsonLoadingWarningKind::InvalidGraphEntryFormat,
                WarningScope::Editor,
                "Invalid tilt entry format",
            );
            continue;
        };
        let Some(pulse) = entry[0].as_i64() else {
            continue;
        };

        let value = &entry[1];
        if let Some(name) = value.as_str() {
            // Auto tilt: [pulse, "name"]
            tilt.insert(pulse, TiltValue::Auto(AutoTiltKind::from_name(name)));
        } else if let Some(v) = value.as_f64() {
            // Manual: [pulse, v]
            tilt.insert(pulse, TiltValue::Manual(TiltGraphPoint::new(v)));
        } else if let Some(pair) = value.as_array().filter(|a| a.len() == 2) {
            if pair[0].is_array() {
                // [[v, vf], [a, b]]: immediate change with curve
                let graph_value = parse_tilt_graph_value(&pair[0]);
                let curve = parse_curve(&pair[1]);
                if let Some(graph_value) = graph_value {
                    tilt.insert(
                        pulse,
                        TiltValue::Manual(TiltGraphPoint::with_curve(graph_value, curve)),
                    );
                }
            } else if pair[1].is_array() {
                // [v, [a, b]]: single value with curve
                if let Some(v) = pair[0].as_f64() {
                    let curve = parse_curve(&pair[1]);
                    tilt.insert(
                        pulse,
                        TiltValue::Manual(TiltGraphPoint::with_curve(
                            TiltGraphValue::new(v),
                            curve,
                        )),
                    );
                }
            } else if let Some(graph_value) = parse_tilt_graph_value(value) {
                // [v, vf]: immediate change; vf may be an auto tilt name
                tilt.insert(
                    pulse,
                    TiltValue::Manual(TiltGraphPoint::from_value(graph_value)),
                );
            }
        }
    }

    tilt
}

fn parse_tilt_graph_value(j: &Value) -> Option<TiltGraphValue> {
    let pair = j.as_array().filter(|a| a.len() >= 2)?;
    let v = pair[0].as_f64()?;
    if let Some(name) = pair[1].as_str() {
        Some(TiltGraphValue::with_transition(
            v,
            TiltVf::Auto(AutoTiltKind::from_name(name)),
        ))
    } else {
        pair[1]
            .as_f64()
            .map(|vf| TiltGraphValue::with_transition(v, TiltVf::Value(vf)))
    }
}

fn parse_camera(j: &Value, ctx: &mut ReadCtx) -> CameraInfo {
    let mut camera = CameraInfo::default();

    if let Some(tilt) = j.get("tilt") {
        camera.tilt = parse_tilt(tilt, ctx);
    }

    if let Some(cam) = j.get("cam") {
        if let Some(body) = cam.get("body") {
            if let Some(graph) = body.get("zoom_bottom") {
                camera.cam.body.zoom_bottom = parse_graph(graph, ctx);
            }
            if let Some(graph) = body.get("zoom_side") {
                camera.cam.body.zoom_side = parse_graph(graph, ctx);
            }
            if let Some(graph) = body.get("zoom_top") {
                camera.cam.body.zoom_top = parse_graph(graph, ctx);
            }
            if let Some(graph) = body.get("rotation_deg") {
                camera.cam.body.rotation_deg = parse_graph(graph, ctx);
            }
            if let Some(graph) = body.get("center_split") {
                camera.cam.body.center_split = parse_graph(graph, ctx);
            }
        }

        if let Some(slam_event) = cam
            .get("pattern")
            .and_then(|pattern| pattern.get("laser"))
            .and_then(|laser| laser.get("slam_event"))
        {
            if let Some(spins) = slam_event.get("spin").and_then(Value::as_array) {
                for item in spins {
                    if let Some((pulse, spin)) = parse_spin_entry(item) {
                        camera.cam.pattern.laser.slam_event.spin.insert(pulse, spin);
                    }
                }
            }
            if let Some(half_spins) = slam_event.get("half_spin").and_then(Value::as_array) {
                for item in half_spins {
                    if let Some((pulse, spin)) = parse_spin_entry(item) {
                        camera
                            .cam
                            .pattern
                            .laser
                            .slam_event
                            .half_spin
                            .insert(pulse, spin);
                    }
                }
            }
            if let Some(swings) = slam_event.get("swing").and_then(Value::as_array) {
                for item in swings {
                    let Some(entry) = item.as_array().filter(|a| a.len() >= 3) else {
                        continue;
                    };
                    let (Some(pulse), Some(d), Some(length)) =
                        (entry[0].as_i64(), entry[1].as_i64(), entry[2].as_i64())
                    else {
                        continue;
                    };
                    let mut swing = CamPatternInvokeSwing {
                        d: d as i32,
                        length,
                        ..CamPatternInvokeSwing::default()
                    };
                    if let Some(v) = entry.get(3).filter(|v| v.is_object()) {
                        swing.v.scale = get_f64(v, "scale", swing.v.scale);
                        swing.v.repeat = get_i32(v, "repeat", swing.v.repeat);
                        swing.v.decay_order = get_i32(v, "decay_order", swing.v.decay_order);
                    }
                    camera
                        .cam
                        .pattern
                        .laser
                        .slam_event
                        .swing
                        .insert(pulse, swing);
                }
            }
        }
    }

    camera
}

fn parse_spin_entry(item: &Value) -> Option<(Pulse, CamPatternInvokeSpin)> {
    let entry = item.as_array().filter(|a| a.len() >= 3)?;
    let pulse = entry[0].as_i64()?;
    let d = entry[1].as_i64()? as i32;
    let length = entry[2].as_i64()?;
    Some((pulse, CamPatternInvokeSpin { d, length }))
}

fn parse_bg(j: &Value) -> BgInfo {
    let mut bg = BgInfo {
        filename: get_str(j, "filename", ""),
        ..BgInfo::default()
    };

    if let Some(legacy) = j.get("legacy") {
        if let Some(bg_array) = legacy.get("bg").and_then(Value::as_array) {
            for (i, item) in bg_array.iter().take(bg.legacy.bg.len()).enumerate() {
                bg.legacy.bg[i].filename = get_str(item, "filename", "");
            }
            // The writer collapses two identical filenames into one entry
            if bg_array.len() == 1 {
                bg.legacy.bg[1].filename = bg.legacy.bg[0].filename.clone();
            }
        }
        if let Some(layer) = legacy.get("layer") {
            bg.legacy.layer.filename = get_str(layer, "filename", "");
            bg.legacy.layer.duration = get_i32(layer, "duration", 0);
            if let Some(rotation) = layer.get("rotation") {
                bg.legacy.layer.rotation.tilt = get_bool(rotation, "tilt", true);
                bg.legacy.layer.rotation.spin = get_bool(rotation, "spin", true);
            }
        }
        if let Some(movie) = legacy.get("movie") {
            bg.legacy.movie.filename = get_str(movie, "filename", "");
            bg.legacy.movie.offset = get_i32(movie, "offset", 0);
        }
    }

    bg
}

fn parse_editor(j: &Value, ctx: &mut ReadCtx) -> EditorInfo {
    let mut editor = EditorInfo {
        app_name: get_str(j, "app_name", ""),
        app_version: get_str(j, "app_version", ""),
        ..EditorInfo::default()
    };
    if let Some(comment) = j.get("comment") {
        editor.comment = parse_by_pulse_multi_string(comment, ctx);
    }
    editor
}

fn parse_compat(j: &Value) -> CompatInfo {
    let mut compat = CompatInfo {
        ksh_version: get_str(j, "ksh_version", ""),
        ..CompatInfo::default()
    };

    if let Some(unknown) = j.get("ksh_unknown") {
        if let Some(meta) = unknown.get("meta").and_then(Value::as_object) {
            for (key, value) in meta {
                if let Some(value) = value.as_str() {
                    compat
                        .ksh_unknown
                        .meta
                        .insert(key.clone(), value.to_owned());
                }
            }
        }
        if let Some(option) = unknown.get("option").and_then(Value::as_object) {
            for (key, values) in option {
                if let Some(values_array) = values.as_array() {
                    for item in values_array {
                        if let Some(entry) = item.as_array().filter(|a| a.len() >= 2) {
                            if let (Some(pulse), Some(value)) =
                                (entry[0].as_i64(), entry[1].as_str())
                            {
                                compat
                                    .ksh_unknown
                                    .option
                                    .entry(key.clone())
                                    .or_default()
                                    .entry(pulse)
                                    .or_default()
                                    .push(value.to_owned());
                            }
                        }
                    }
                }
            }
        }
        if let Some(lines) = unknown.get("line").and_then(Value::as_array) {
            for item in lines {
                if let Some(entry) = item.as_array().filter(|a| a.len() >= 2) {
                    if let (Some(pulse), Some(value)) = (entry[0].as_i64(), entry[1].as_str()) {
                        compat
                            .ksh_unknown
                            .line
                            .entry(pulse)
                            .or_default()
                            .push(value.to_owned());
                    }
                }
            }
        }
    }

    compat
}
