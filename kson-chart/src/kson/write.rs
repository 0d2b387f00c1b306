use std::io::Write;

use serde_json::{json, Map, Value};

use crate::camera::{CamPatternInvokeSpin, CamPatternInvokeSwing, CameraInfo, TiltValue, TiltVf};
use crate::effects::AudioEffectDefList;
use crate::kson::KSON_FORMAT_VERSION;
use crate::{
    almost_equals, remove_floating_point_error, AudioInfo, BeatInfo, BgInfo, ByPulse, ByPulseMulti,
    ByRelPulse, ChartData, ChartError, CompatInfo, Dict, EditorInfo, GaugeInfo, GraphPoint,
    Interval, LaserSection, MetaInfo, NoteInfo, Pulse, PulseSet, TimeSig, LASER_X_SCALE_1X,
};

/// Saves a chart as compact KSON JSON.
pub fn save_chart<W: Write>(writer: W, chart: &ChartData) -> Result<(), ChartError> {
    serde_json::to_writer(writer, &chart_to_value(chart)).map_err(|_| ChartError::GeneralIo)
}

pub fn save_chart_to_path(
    path: impl AsRef<std::path::Path>,
    chart: &ChartData,
) -> Result<(), ChartError> {
    let file = std::fs::File::create(path)
        .map_err(|_| ChartError::CouldNotOpenOutputFileStream)?;
    save_chart(file, chart)
}

pub(crate) fn chart_to_value(chart: &ChartData) -> Value {
    let mut root = Map::new();
    root.insert("format_version".to_owned(), json!(KSON_FORMAT_VERSION));
    put(&mut root, "meta", meta_to_value(&chart.meta));
    put(&mut root, "beat", beat_to_value(&chart.beat));
    put(&mut root, "gauge", gauge_to_value(&chart.gauge));
    put(&mut root, "note", note_to_value(&chart.note));
    put(&mut root, "audio", audio_to_value(&chart.audio));
    put(&mut root, "camera", camera_to_value(&chart.camera));
    put(&mut root, "bg", bg_to_value(&chart.bg));
    put(&mut root, "editor", editor_to_value(&chart.editor));
    put(&mut root, "compat", compat_to_value(&chart.compat));
    put(&mut root, "impl", chart.impl_data.clone());
    Value::Object(root)
}

// ---------------------------------------------------------------------------
// Elision helpers

/// Inserts unless the value is null or an empty object.
fn put(obj: &mut Map<String, Value>, key: &str, value: Value) {
    if value.is_null() || value.as_object().is_some_and(Map::is_empty) {
        return;
    }
    obj.insert(key.to_owned(), value);
}

fn num(v: f64) -> Value {
    json!(remove_floating_point_error(v))
}

fn put_str(obj: &mut Map<String, Value>, key: &str, s: &str) {
    obj.insert(key.to_owned(), json!(s));
}

fn put_str_nonempty(obj: &mut Map<String, Value>, key: &str, s: &str) {
    if !s.is_empty() {
        put_str(obj, key, s);
    }
}

fn put_i64(obj: &mut Map<String, Value>, key: &str, v: i64) {
    obj.insert(key.to_owned(), json!(v));
}

fn put_i64_default(obj: &mut Map<String, Value>, key: &str, v: i64, default: i64) {
    if v != default {
        put_i64(obj, key, v);
    }
}

fn put_f64_default(obj: &mut Map<String, Value>, key: &str, v: f64, default: f64) {
    if !almost_equals(v, default) {
        obj.insert(key.to_owned(), num(v));
    }
}

fn put_bool_default(obj: &mut Map<String, Value>, key: &str, v: bool, default: bool) {
    if v != default {
        obj.insert(key.to_owned(), json!(v));
    }
}

// ---------------------------------------------------------------------------
// Container writers

fn by_pulse_f64_to_value(map: &ByPulse<f64>) -> Value {
    Value::Array(map.iter().map(|(&y, &v)| json!([y, num(v)])).collect())
}

fn by_pulse_i64_to_value(map: &ByPulse<i64>) -> Value {
    Value::Array(map.iter().map(|(&y, &v)| json!([y, v])).collect())
}

fn by_pulse_str_to_value(map: &ByPulse<String>) -> Value {
    Value::Array(map.iter().map(|(&y, v)| json!([y, v])).collect())
}

fn by_pulse_multi_str_to_value(map: &ByPulseMulti<String>) -> Value {
    let mut array = Vec::new();
    for (&y, values) in map {
        for v in values {
            array.push(json!([y, v]));
        }
    }
    Value::Array(array)
}

fn pulse_set_to_value(set: &PulseSet) -> Value {
    Value::Array(set.iter().map(|&y| json!(y)).collect())
}

fn time_sig_to_value(map: &crate::ByMeasureIdx<TimeSig>) -> Value {
    Value::Array(
        map.iter()
            .map(|(&idx, sig)| json!([idx, [sig.n, sig.d]]))
            .collect(),
    )
}

/// `[y, v]`, `[y, [v, vf]]`, `[y, v, [a, b]]` or `[y, [v, vf], [a, b]]`.
fn graph_point_to_value(y: Pulse, point: &GraphPoint) -> Value {
    let has_curve = !point.curve.is_linear();
    let has_transition = !almost_equals(point.v.v, point.v.vf);

    let value = if has_transition {
        json!([num(point.v.v), num(point.v.vf)])
    } else {
        num(point.v.v)
    };

    if has_curve {
        json!([y, value, [num(point.curve.a), num(point.curve.b)]])
    } else {
        json!([y, value])
    }
}

fn graph_to_value(graph: &crate::Graph) -> Value {
    Value::Array(
        graph
            .iter()
            .map(|(&y, point)| graph_point_to_value(y, point))
            .collect(),
    )
}

fn graph_is_all_default(graph: &crate::Graph, default: f64) -> bool {
    graph
        .values()
        .all(|p| almost_equals(p.v.v, default) && almost_equals(p.v.vf, default))
}

fn put_graph(obj: &mut Map<String, Value>, key: &str, graph: &crate::Graph) {
    if graph.is_empty() {
        return;
    }
    obj.insert(key.to_owned(), graph_to_value(graph));
}

fn put_graph_default(obj: &mut Map<String, Value>, key: &str, graph: &crate::Graph, default: f64) {
    if graph_is_all_default(graph, default) {
        return;
    }
    put_graph(obj, key, graph);
}

fn button_lanes_to_value<const N: usize>(lanes: &[ByPulse<Interval>; N]) -> Option<Value> {
    if lanes.iter().all(ByPulse::is_empty) {
        return None;
    }
    let array = lanes
        .iter()
        .map(|lane| {
            Value::Array(
                lane.iter()
                    .map(|(&y, interval)| {
                        if interval.length == 0 {
                            json!(y)
                        } else {
                            json!([y, interval.length])
                        }
                    })
                    .collect(),
            )
        })
        .collect();
    Some(Value::Array(array))
}

fn laser_points_to_value(points: &ByRelPulse<GraphPoint>) -> Value {
    Value::Array(
        points
            .iter()
            .map(|(&ry, point)| graph_point_to_value(ry, point))
            .collect(),
    )
}

fn laser_lanes_to_value(lanes: &[ByPulse<LaserSection>; 2]) -> Option<Value> {
    if lanes.iter().all(ByPulse::is_empty) {
        return None;
    }
    let array = lanes
        .iter()
        .map(|lane| {
            Value::Array(
                lane.iter()
                    .filter(|(_, section)| !section.v.is_empty())
                    .map(|(&y, section)| {
                        let points = laser_points_to_value(&section.v);
                        if section.w == LASER_X_SCALE_1X {
                            json!([y, points])
                        } else {
                            json!([y, points, section.w])
                        }
                    })
                    .collect(),
            )
        })
        .collect();
    Some(Value::Array(array))
}

// ---------------------------------------------------------------------------
// Sections

fn meta_to_value(meta: &MetaInfo) -> Value {
    let mut j = Map::new();
    put_str(&mut j, "title", &meta.title);
    put_str_nonempty(&mut j, "title_translit", &meta.title_translit);
    put_str_nonempty(&mut j, "title_img_filename", &meta.title_img_filename);
    put_str(&mut j, "artist", &meta.artist);
    put_str_nonempty(&mut j, "artist_translit", &meta.artist_translit);
    put_str_nonempty(&mut j, "artist_img_filename", &meta.artist_img_filename);
    put_str(&mut j, "chart_author", &meta.chart_author);
    if meta.difficulty.name.is_empty() {
        put_i64(&mut j, "difficulty", meta.difficulty.idx as i64);
    } else {
        put_str(&mut j, "difficulty", &meta.difficulty.name);
    }
    put_i64(&mut j, "level", meta.level as i64);
    put_str(&mut j, "disp_bpm", &meta.disp_bpm);
    put_f64_default(&mut j, "std_bpm", meta.std_bpm, 0.0);
    put_str_nonempty(&mut j, "jacket_filename", &meta.jacket_filename);
    put_str_nonempty(&mut j, "jacket_author", &meta.jacket_author);
    put_str_nonempty(&mut j, "icon_filename", &meta.icon_filename);
    put_str_nonempty(&mut j, "information", &meta.information);
    Value::Object(j)
}

fn beat_to_value(beat: &BeatInfo) -> Value {
    let mut j = Map::new();
    if !beat.bpm.is_empty() {
        j.insert("bpm".to_owned(), by_pulse_f64_to_value(&beat.bpm));
    }
    if !beat.time_sig.is_empty() {
        j.insert("time_sig".to_owned(), time_sig_to_value(&beat.time_sig));
    }
    put_graph_default(&mut j, "scroll_speed", &beat.scroll_speed, 1.0);
    if !beat.stop.is_empty() {
        j.insert("stop".to_owned(), by_pulse_i64_to_value(&beat.stop));
    }
    Value::Object(j)
}

fn gauge_to_value(gauge: &GaugeInfo) -> Value {
    let mut j = Map::new();
    put_i64_default(&mut j, "total", gauge.total as i64, 0);
    Value::Object(j)
}

fn note_to_value(note: &NoteInfo) -> Value {
    let mut j = Map::new();
    if let Some(bt) = button_lanes_to_value(&note.bt) {
        j.insert("bt".to_owned(), bt);
    }
    if let Some(fx) = button_lanes_to_value(&note.fx) {
        j.insert("fx".to_owned(), fx);
    }
    if let Some(laser) = laser_lanes_to_value(&note.laser) {
        j.insert("laser".to_owned(), laser);
    }
    Value::Object(j)
}

fn audio_effect_def_to_value(def: &AudioEffectDefList) -> Value {
    Value::Array(
        def.iter()
            .map(|(name, def)| {
                let mut def_json = Map::new();
                put_str(&mut def_json, "type", def.kind.as_str());
                if !def.v.is_empty() {
                    def_json.insert(
                        "v".to_owned(),
                        Value::Object(
                            def.v
                                .iter()
                                .map(|(k, v)| (k.clone(), json!(v)))
                                .collect(),
                        ),
                    );
                }
                json!([name, Value::Object(def_json)])
            })
            .collect(),
    )
}

fn param_change_to_value(param_change: &Dict<Dict<ByPulse<String>>>) -> Value {
    let mut j = Map::new();
    for (effect_name, params) in param_change {
        if params.is_empty() {
            continue;
        }
        let mut params_json = Map::new();
        for (param_name, by_pulse) in params {
            if !by_pulse.is_empty() {
                params_json.insert(param_name.clone(), by_pulse_str_to_value(by_pulse));
            }
        }
        put(&mut j, effect_name, Value::Object(params_json));
    }
    Value::Object(j)
}

fn audio_to_value(audio: &AudioInfo) -> Value {
    let mut j = Map::new();

    // bgm
    {
        let mut bgm_json = Map::new();
        put_str_nonempty(&mut bgm_json, "filename", &audio.bgm.filename);
        put_f64_default(&mut bgm_json, "vol", audio.bgm.vol, 1.0);
        put_i64_default(&mut bgm_json, "offset", audio.bgm.offset as i64, 0);
        {
            let mut preview_json = Map::new();
            put_i64(&mut preview_json, "offset", audio.bgm.preview.offset as i64);
            put_i64(
                &mut preview_json,
                "duration",
                audio.bgm.preview.duration as i64,
            );
            put(&mut bgm_json, "preview", Value::Object(preview_json));
        }
        {
            let mut legacy_json = Map::new();
            if !audio.bgm.legacy.is_empty() {
                legacy_json.insert(
                    "fp_filenames".to_owned(),
                    json!(audio.bgm.legacy.to_str_vec()),
                );
            }
            put(&mut bgm_json, "legacy", Value::Object(legacy_json));
        }
        put(&mut j, "bgm", Value::Object(bgm_json));
    }

    // key_sound
    {
        let mut key_sound_json = Map::new();
        {
            let mut fx_json = Map::new();
            let mut chip_event_json = Map::new();
            for (filename, lanes) in &audio.key_sound.fx.chip_event {
                if lanes.iter().all(ByPulse::is_empty) {
                    continue;
                }
                let lanes_json: Vec<Value> = lanes
                    .iter()
                    .map(|lane| {
                        Value::Array(
                            lane.iter()
                                .map(|(&y, invoke)| {
                                    let mut v_json = Map::new();
                                    put_f64_default(&mut v_json, "vol", invoke.vol, 1.0);
                                    if v_json.is_empty() {
                                        json!(y)
                                    } else {
                                        json!([y, Value::Object(v_json)])
                                    }
                                })
                                .collect(),
                        )
                    })
                    .collect();
                chip_event_json.insert(filename.clone(), Value::Array(lanes_json));
            }
            put(&mut fx_json, "chip_event", Value::Object(chip_event_json));
            put(&mut key_sound_json, "fx", Value::Object(fx_json));
        }
        {
            let mut laser_json = Map::new();
            if !audio.key_sound.laser.vol.is_empty() {
                laser_json.insert(
                    "vol".to_owned(),
                    by_pulse_f64_to_value(&audio.key_sound.laser.vol),
                );
            }
            {
                let mut slam_event_json = Map::new();
                for (filename, pulse_set) in &audio.key_sound.laser.slam_event {
                    if !pulse_set.is_empty() {
                        slam_event_json.insert(filename.clone(), pulse_set_to_value(pulse_set));
                    }
                }
                put(&mut laser_json, "slam_event", Value::Object(slam_event_json));
            }
            {
                let mut legacy_json = Map::new();
                put_bool_default(
                    &mut legacy_json,
                    "vol_auto",
                    audio.key_sound.laser.legacy.vol_auto,
                    false,
                );
                put(&mut laser_json, "legacy", Value::Object(legacy_json));
            }
            put(&mut key_sound_json, "laser", Value::Object(laser_json));
        }
        put(&mut j, "key_sound", Value::Object(key_sound_json));
    }

    // audio_effect
    {
        let mut audio_effect_json = Map::new();
        {
            let mut fx_json = Map::new();
            if !audio.audio_effect.fx.def.is_empty() {
                fx_json.insert(
                    "def".to_owned(),
                    audio_effect_def_to_value(&audio.audio_effect.fx.def),
                );
            }
            if !audio.audio_effect.fx.param_change.is_empty() {
                put(
                    &mut fx_json,
                    "param_change",
                    param_change_to_value(&audio.audio_effect.fx.param_change),
                );
            }
            {
                let mut long_event_json = Map::new();
                for (effect_name, lanes) in &audio.audio_effect.fx.long_event {
                    if lanes.iter().all(ByPulse::is_empty) {
                        continue;
                    }
                    let lanes_json: Vec<Value> = lanes
                        .iter()
                        .map(|lane| {
                            Value::Array(
                                lane.iter()
                                    .map(|(&y, params)| {
                                        if params.is_empty() {
                                            json!(y)
                                        } else {
                                            json!([y, params])
                                        }
                                    })
                                    .collect(),
                            )
                        })
                        .collect();
                    long_event_json.insert(effect_name.clone(), Value::Array(lanes_json));
                }
                put(&mut fx_json, "long_event", Value::Object(long_event_json));
            }
            put(&mut audio_effect_json, "fx", Value::Object(fx_json));
        }
        {
            let mut laser_json = Map::new();
            if !audio.audio_effect.laser.def.is_empty() {
                laser_json.insert(
                    "def".to_owned(),
                    audio_effect_def_to_value(&audio.audio_effect.laser.def),
                );
            }
            if !audio.audio_effect.laser.param_change.is_empty() {
                put(
                    &mut laser_json,
                    "param_change",
                    param_change_to_value(&audio.audio_effect.laser.param_change),
                );
            }
            {
                let mut pulse_event_json = Map::new();
                for (effect_name, pulse_set) in &audio.audio_effect.laser.pulse_event {
                    if !pulse_set.is_empty() {
                        pulse_event_json.insert(effect_name.clone(), pulse_set_to_value(pulse_set));
                    }
                }
                put(&mut laser_json, "pulse_event", Value::Object(pulse_event_json));
            }
            put_i64_default(
                &mut laser_json,
                "peaking_filter_delay",
                audio.audio_effect.laser.peaking_filter_delay as i64,
                0,
            );
            {
                let mut legacy_json = Map::new();
                if !audio.audio_effect.laser.legacy.filter_gain.is_empty() {
                    legacy_json.insert(
                        "filter_gain".to_owned(),
                        by_pulse_f64_to_value(&audio.audio_effect.laser.legacy.filter_gain),
                    );
                }
                put(&mut laser_json, "legacy", Value::Object(legacy_json));
            }
            put(&mut audio_effect_json, "laser", Value::Object(laser_json));
        }
        put(&mut j, "audio_effect", Value::Object(audio_effect_json));
    }

    Value::Object(j)
}

fn tilt_value_to_value(pulse: Pulse, tilt_value: &TiltValue) -> Value {
    match tilt_value {
        TiltValue::Auto(kind) => json!([pulse, kind.as_str()]),
        TiltValue::Manual(point) => {
            let has_curve = !point.curve.is_linear();
            let (has_transition, vf_value) = match point.v.vf {
                TiltVf::Value(vf) => (!almost_equals(point.v.v, vf), num(vf)),
                TiltVf::Auto(kind) => (true, json!(kind.as_str())),
            };

            let graph_value = if has_transition {
                json!([num(point.v.v), vf_value])
            } else {
                num(point.v.v)
            };

            if has_curve {
                let curve_value = json!([num(point.curve.a), num(point.curve.b)]);
                json!([pulse, [graph_value, curve_value]])
            } else {
                json!([pulse, graph_value])
            }
        }
    }
}

fn spin_to_value(map: &ByPulse<CamPatternInvokeSpin>) -> Value {
    Value::Array(
        map.iter()
            .map(|(&y, invoke)| json!([y, invoke.d, invoke.length]))
            .collect(),
    )
}

fn swing_to_value(map: &ByPulse<CamPatternInvokeSwing>) -> Value {
    Value::Array(
        map.iter()
            .map(|(&y, invoke)| {
                let mut v_json = Map::new();
                put_f64_default(&mut v_json, "scale", invoke.v.scale, 250.0);
                put_i64_default(&mut v_json, "repeat", invoke.v.repeat as i64, 1);
                put_i64_default(&mut v_json, "decay_order", invoke.v.decay_order as i64, 0);
                if v_json.is_empty() {
                    json!([y, invoke.d, invoke.length])
                } else {
                    json!([y, invoke.d, invoke.length, Value::Object(v_json)])
                }
            })
            .collect(),
    )
}

fn camera_to_value(camera: &CameraInfo) -> Value {
    let mut j = Map::new();

    if !camera.tilt.is_empty() {
        let tilt_json: Vec<Value> = camera
            .tilt
            .iter()
            .map(|(&pulse, tilt_value)| tilt_value_to_value(pulse, tilt_value))
            .collect();
        j.insert("tilt".to_owned(), Value::Array(tilt_json));
    }

    {
        let mut cam_json = Map::new();
        {
            let mut body_json = Map::new();
            put_graph_default(&mut body_json, "zoom_bottom", &camera.cam.body.zoom_bottom, 0.0);
            put_graph_default(&mut body_json, "zoom_side", &camera.cam.body.zoom_side, 0.0);
            put_graph_default(&mut body_json, "zoom_top", &camera.cam.body.zoom_top, 0.0);
            put_graph_default(&mut body_json, "rotation_deg", &camera.cam.body.rotation_deg, 0.0);
            put_graph_default(&mut body_json, "center_split", &camera.cam.body.center_split, 0.0);
            put(&mut cam_json, "body", Value::Object(body_json));
        }
        {
            let mut pattern_json = Map::new();
            let mut laser_json = Map::new();
            let mut slam_event_json = Map::new();
            let slam_event = &camera.cam.pattern.laser.slam_event;
            if !slam_event.spin.is_empty() {
                slam_event_json.insert("spin".to_owned(), spin_to_value(&slam_event.spin));
            }
            if !slam_event.half_spin.is_empty() {
                slam_event_json.insert("half_spin".to_owned(), spin_to_value(&slam_event.half_spin));
            }
            if !slam_event.swing.is_empty() {
                slam_event_json.insert("swing".to_owned(), swing_to_value(&slam_event.swing));
            }
            put(&mut laser_json, "slam_event", Value::Object(slam_event_json));
            put(&mut pattern_json, "laser", Value::Object(laser_json));
            put(&mut cam_json, "pattern", Value::Object(pattern_json));
        }
        put(&mut j, "cam", Value::Object(cam_json));
    }

    Value::Object(j)
}

fn bg_to_value(bg: &BgInfo) -> Value {
    let mut j = Map::new();
    put_str_nonempty(&mut j, "filename", &bg.filename);

    let mut legacy_json = Map::new();
    {
        let mut bg_array = Vec::new();
        if !bg.legacy.bg[0].filename.is_empty() {
            bg_array.push(json!({ "filename": bg.legacy.bg[0].filename }));
        }
        if !bg.legacy.bg[1].filename.is_empty()
            && bg.legacy.bg[0].filename != bg.legacy.bg[1].filename
        {
            bg_array.push(json!({ "filename": bg.legacy.bg[1].filename }));
        }
        if !bg_array.is_empty() {
            legacy_json.insert("bg".to_owned(), Value::Array(bg_array));
        }
    }
    {
        let mut layer_json = Map::new();
        put_str_nonempty(&mut layer_json, "filename", &bg.legacy.layer.filename);
        put_i64_default(&mut layer_json, "duration", bg.legacy.layer.duration as i64, 0);
        {
            let mut rotation_json = Map::new();
            put_bool_default(&mut rotation_json, "tilt", bg.legacy.layer.rotation.tilt, true);
            put_bool_default(&mut rotation_json, "spin", bg.legacy.layer.rotation.spin, true);
            put(&mut layer_json, "rotation", Value::Object(rotation_json));
        }
        put(&mut legacy_json, "layer", Value::Object(layer_json));
    }
    {
        let mut movie_json = Map::new();
        put_str_nonempty(&mut movie_json, "filename", &bg.legacy.movie.filename);
        put_i64_default(&mut movie_json, "offset", bg.legacy.movie.offset as i64, 0);
        put(&mut legacy_json, "movie", Value::Object(movie_json));
    }
    put(&mut j, "legacy", Value::Object(legacy_json));

    Value::Object(j)
}

fn editor_to_value(editor: &EditorInfo) -> Value {
    let mut j = Map::new();
    put_str_nonempty(&mut j, "app_name", &editor.app_name);
    put_str_nonempty(&mut j, "app_version", &editor.app_version);
    if !editor.comment.is_empty() {
        j.insert(
            "comment".to_owned(),
            by_pulse_multi_str_to_value(&editor.comment),
        );
    }
    Value::Object(j)
}

fn compat_to_value(compat: &CompatInfo) -> Value {
    let mut j = Map::new();
    put_str_nonempty(&mut j, "ksh_version", &compat.ksh_version);

    let mut ksh_unknown_json = Map::new();
    if !compat.ksh_unknown.meta.is_empty() {
        ksh_unknown_json.insert(
            "meta".to_owned(),
            Value::Object(
                compat
                    .ksh_unknown
                    .meta
                    .iter()
                    .map(|(k, v)| (k.clone(), json!(v)))
                    .collect(),
            ),
        );
    }
    {
        let mut option_json = Map::new();
        for (key, values) in &compat.ksh_unknown.option {
            if !values.is_empty() {
                option_json.insert(key.clone(), by_pulse_multi_str_to_value(values));
            }
        }
        put(&mut ksh_unknown_json, "option", Value::Object(option_json));
    }
    if !compat.ksh_unknown.line.is_empty() {
        ksh_unknown_json.insert(
            "line".to_owned(),
            by_pulse_multi_str_to_value(&compat.ksh_unknown.line),
        );
    }
    put(&mut j, "ksh_unknown", Value::Object(ksh_unknown_json));

    Value::Object(j)
}
