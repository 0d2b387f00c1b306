use std::io::{BufWriter, Write};

use itertools::Itertools;

use crate::camera::{TiltValue, TiltVf};
use crate::diag::{KshSavingDiag, WarningScope};
use crate::effects::{AudioEffectDefList, AudioEffectKind, AudioEffectParams};
use crate::ksh::*;
use crate::{
    almost_equals, value_at_or_default, value_entry_at, ByPulse, ChartData, ChartError, Interval,
    LaserSection, Pulse, TimeSig, NUM_FX_LANES, NUM_LASER_LANES, RESOLUTION4,
};

/// Saves a chart in the KSH text format (UTF-8 with BOM, CRLF line endings).
pub fn save_chart<W: Write>(writer: W, chart: &ChartData) -> Result<(), ChartError> {
    let mut diag = KshSavingDiag::default();
    save_chart_with_diag(writer, chart, &mut diag)
}

pub fn save_chart_to_path(
    path: impl AsRef<std::path::Path>,
    chart: &ChartData,
) -> Result<(), ChartError> {
    let file = std::fs::File::create(path)
        .map_err(|_| ChartError::CouldNotOpenOutputFileStream)?;
    save_chart(file, chart)
}

pub fn save_chart_with_diag<W: Write>(
    writer: W,
    chart: &ChartData,
    diag: &mut KshSavingDiag,
) -> Result<(), ChartError> {
    let mut w = BufWriter::new(writer);

    w.write_all(&[0xEF, 0xBB, 0xBF])?;

    let mut state = ExportState::new(chart);
    state.header_bpm_str = write_header(&mut w, chart)?;
    write_measures(&mut w, chart, &mut state, diag)?;
    write_audio_effect_definitions(&mut w, chart)?;

    w.flush()?;
    Ok(())
}

struct ExportState {
    current_time_sig: TimeSig,
    header_bpm_str: String,
    current_chokkakuvol: i32,
    current_pfiltergain: i32,
}

impl ExportState {
    fn new(chart: &ChartData) -> Self {
        let current_chokkakuvol = chart
            .audio
            .key_sound
            .laser
            .vol
            .values()
            .next()
            .map_or(50, |v| (v * 100.0).round() as i32);
        let current_pfiltergain = chart
            .audio
            .audio_effect
            .laser
            .legacy
            .filter_gain
            .values()
            .next()
            .map_or(50, |v| (v * 100.0).round() as i32);
        ExportState {
            current_time_sig: TimeSig::default(),
            header_bpm_str: String::new(),
            current_chokkakuvol,
            current_pfiltergain,
        }
    }
}

fn gcd(a: Pulse, b: Pulse) -> Pulse {
    if b == 0 {
        a
    } else {
        gcd(b, a % b)
    }
}

// ---------------------------------------------------------------------------
// Header

fn should_clamp_bpm(chart: &ChartData) -> bool {
    !chart.compat.is_ksh_version_older_than(VER_BPM_LIMIT_ADDED)
}

/// Writes the header `t=` line and returns the emitted string, so the body
/// can suppress a duplicate change at pulse 0.
fn write_bpm_to_header<W: Write>(w: &mut W, chart: &ChartData) -> Result<String, ChartError> {
    if !chart.meta.disp_bpm.is_empty() {
        write!(w, "t={}\r\n", chart.meta.disp_bpm)?;
        return Ok(chart.meta.disp_bpm.clone());
    }

    let bpm_map = &chart.beat.bpm;
    if bpm_map.is_empty() {
        write!(w, "t=120\r\n")?;
        return Ok("120".to_owned());
    }

    let clamp = should_clamp_bpm(chart);
    let clamped = |bpm: f64| if clamp { bpm.min(BPM_MAX) } else { bpm };

    if bpm_map.len() == 1 {
        let bpm_str = format_ksh_value(clamped(*bpm_map.values().next().unwrap_or(&120.0)));
        write!(w, "t={bpm_str}\r\n")?;
        return Ok(bpm_str);
    }

    let (min_bpm, max_bpm) = match bpm_map.values().copied().map(clamped).minmax() {
        itertools::MinMaxResult::NoElements => (120.0, 120.0),
        itertools::MinMaxResult::OneElement(v) => (v, v),
        itertools::MinMaxResult::MinMax(min, max) => (min, max),
    };

    let bpm_str = if almost_equals(min_bpm, max_bpm) {
        format_ksh_value(min_bpm)
    } else {
        format!("{}-{}", format_ksh_value(min_bpm), format_ksh_value(max_bpm))
    };
    write!(w, "t={bpm_str}\r\n")?;
    Ok(bpm_str)
}

/// `ver=` value, the version integer, and whether `ver_compat=` is needed.
/// Charts older than the v1.60 FX format change are upgraded on output.
fn resolve_output_version(chart: &ChartData) -> (String, i32, bool) {
    if chart.compat.ksh_version.is_empty() {
        return ("171".to_owned(), 171, false);
    }

    let digits_end = chart
        .compat
        .ksh_version
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(chart.compat.ksh_version.len());
    if digits_end == 0 {
        return ("171".to_owned(), 171, false);
    }

    let ver_int = parse_i32_prefix(&chart.compat.ksh_version, 171);
    if ver_int < VER_FX_FORMAT_CHANGED {
        (
            VER_FX_FORMAT_CHANGED.to_string(),
            VER_FX_FORMAT_CHANGED,
            true,
        )
    } else {
        (chart.compat.ksh_version.clone(), ver_int, false)
    }
}

fn write_header<W: Write>(w: &mut W, chart: &ChartData) -> Result<String, ChartError> {
    let meta = &chart.meta;
    let audio = &chart.audio;
    let bg = &chart.bg;

    write!(w, "title={}\r\n", meta.title)?;
    if !meta.title_img_filename.is_empty() {
        write!(w, "title_img={}\r\n", meta.title_img_filename)?;
    }
    write!(w, "artist={}\r\n", meta.artist)?;
    if !meta.artist_img_filename.is_empty() {
        write!(w, "artist_img={}\r\n", meta.artist_img_filename)?;
    }
    write!(w, "effect={}\r\n", meta.chart_author)?;
    write!(w, "jacket={}\r\n", meta.jacket_filename)?;
    write!(w, "illustrator={}\r\n", meta.jacket_author)?;

    let diff_str = match meta.difficulty.idx {
        0 => "light",
        1 => "challenge",
        2 => "extended",
        _ => "infinite",
    };
    write!(w, "difficulty={diff_str}\r\n")?;
    write!(w, "level={}\r\n", meta.level)?;

    let header_bpm_str = write_bpm_to_header(w, chart)?;

    // Standard BPM for hi-speed calculation
    if meta.std_bpm != 0.0 {
        write!(w, "to={}\r\n", format_ksh_value(meta.std_bpm))?;
    }

    // Needed early: the layer delimiter depends on the output version
    let (ver_value, ver_int, need_ver_compat) = resolve_output_version(chart);

    if !audio.bgm.filename.is_empty() {
        write!(w, "m={}", audio.bgm.filename)?;
        if !audio.bgm.legacy.is_empty() {
            for fp_filename in audio.bgm.legacy.to_str_vec() {
                write!(w, ";{fp_filename}")?;
            }
        }
        write!(w, "\r\n")?;
    }

    // For version "100" the input scaling (0.6x) is inverted on output
    let mut vol_for_output = audio.bgm.vol;
    if chart.compat.ksh_version == "100" {
        vol_for_output /= 0.6;
    }
    let mvol = (vol_for_output * 100.0).round() as i32;
    if mvol != 100 {
        write!(w, "mvol={mvol}\r\n")?;
    }

    write!(w, "o={}\r\n", audio.bgm.offset)?;

    if !bg.legacy.bg[0].filename.is_empty() {
        write!(w, "bg={}", bg.legacy.bg[0].filename)?;
        if !bg.legacy.bg[1].filename.is_empty()
            && bg.legacy.bg[0].filename != bg.legacy.bg[1].filename
        {
            write!(w, ";{}", bg.legacy.bg[1].filename)?;
        }
        write!(w, "\r\n")?;
    }

    if !bg.legacy.layer.filename.is_empty() {
        write!(w, "layer={}", bg.legacy.layer.filename)?;

        let is_default_duration = bg.legacy.layer.duration == 0;
        let is_default_rotation = bg.legacy.layer.rotation.tilt && bg.legacy.layer.rotation.spin;
        if !is_default_duration || !is_default_rotation {
            // Delimiter changed from "/" to ";" at v1.66
            let delimiter = if ver_int < VER_LAYER_DELIMITER_CHANGED {
                '/'
            } else {
                ';'
            };
            let mut rotation_flags = 0;
            if bg.legacy.layer.rotation.tilt {
                rotation_flags |= 0b01;
            }
            if bg.legacy.layer.rotation.spin {
                rotation_flags |= 0b10;
            }
            write!(
                w,
                "{delimiter}{}{delimiter}{rotation_flags}",
                bg.legacy.layer.duration
            )?;
        }
        write!(w, "\r\n")?;
    }

    if !bg.legacy.movie.filename.is_empty() {
        write!(w, "v={}\r\n", bg.legacy.movie.filename)?;
        write!(w, "vo={}\r\n", bg.legacy.movie.offset)?;
    }

    write!(w, "po={}\r\n", audio.bgm.preview.offset)?;
    write!(w, "plength={}\r\n", audio.bgm.preview.duration)?;

    // Only legacy.filter_gain is consulted, never param_change
    if let Some(filter_gain) = audio.audio_effect.laser.legacy.filter_gain.values().next() {
        let pfiltergain = (filter_gain * 100.0).round() as i32;
        write!(w, "pfiltergain={pfiltergain}\r\n")?;
    }

    for (effect_name, pulses) in &audio.audio_effect.laser.pulse_event {
        if pulses.contains(&0) {
            match preset_filter_name_to_ksh(effect_name) {
                Some(ksh_name) => write!(w, "filtertype={ksh_name}\r\n")?,
                None => write!(w, "filtertype={effect_name}\r\n")?,
            }
            break;
        }
    }

    write!(
        w,
        "chokkakuautovol={}\r\n",
        if audio.key_sound.laser.legacy.vol_auto {
            1
        } else {
            0
        }
    )?;

    if let Some(vol) = audio.key_sound.laser.vol.values().next() {
        write!(w, "chokkakuvol={}\r\n", (vol * 100.0).round() as i32)?;
    }

    if audio.audio_effect.laser.peaking_filter_delay != 40 {
        write!(
            w,
            "pfilterdelay={}\r\n",
            audio.audio_effect.laser.peaking_filter_delay
        )?;
    }

    if chart.gauge.total != 0 {
        write!(w, "total={}\r\n", chart.gauge.total)?;
    }

    if !meta.information.is_empty() {
        write!(w, "information={}\r\n", meta.information)?;
    }

    if !meta.icon_filename.is_empty() {
        write!(w, "icon={}\r\n", meta.icon_filename)?;
    }

    write!(w, "ver={ver_value}\r\n")?;
    if need_ver_compat {
        write!(w, "ver_compat={}\r\n", chart.compat.ksh_version)?;
    }

    for (key, value) in &chart.compat.ksh_unknown.meta {
        write!(w, "{key}={value}\r\n")?;
    }

    if let Some(lines) = chart.compat.ksh_unknown.line.get(&0) {
        for line in lines {
            write!(w, "{line}\r\n")?;
        }
    }

    write!(w, "--\r\n")?;
    Ok(header_bpm_str)
}

// ---------------------------------------------------------------------------
// Laser segments

/// Flat KSH-side representation of a laser lane: a slam becomes its own short
/// segment so that two chart lines can carry its start and end values.
#[derive(Debug, Clone, Copy)]
struct KshLaserSegment {
    start_pulse: Pulse,
    length: Pulse,
    start_value: i32,
    end_value: i32,
    is_section_start: bool,
    wide: bool,
}

fn convert_laser_to_segments(lane: &ByPulse<LaserSection>) -> Vec<KshLaserSegment> {
    const PREFERRED_SLAM_LENGTH: Pulse = RESOLUTION4 / 32;
    const PULSE_1_16: Pulse = RESOLUTION4 / 16;
    const PULSE_1_48: Pulse = RESOLUTION4 / 48;
    const PULSE_1_64: Pulse = RESOLUTION4 / 64;
    const PULSE_1_96: Pulse = RESOLUTION4 / 96;
    const PULSE_1_192: Pulse = RESOLUTION4 / 192;

    let mut segments = Vec::new();

    for (&section_start, section) in lane {
        if section.v.is_empty() {
            continue;
        }

        let points: Vec<(Pulse, crate::GraphPoint)> =
            section.v.iter().map(|(ry, p)| (*ry, *p)).collect();

        if points.len() == 1 && points[0].0 == 0 {
            let point = points[0].1;
            if almost_equals(point.v.v, point.v.vf) {
                let value = graph_value_to_laser_x(point.v.v, section.wide());
                segments.push(KshLaserSegment {
                    start_pulse: section_start,
                    length: 0,
                    start_value: value,
                    end_value: value,
                    is_section_start: true,
                    wide: section.wide(),
                });
            } else {
                segments.push(KshLaserSegment {
                    start_pulse: section_start,
                    length: PREFERRED_SLAM_LENGTH,
                    start_value: graph_value_to_laser_x(point.v.v, section.wide()),
                    end_value: graph_value_to_laser_x(point.v.vf, section.wide()),
                    is_section_start: true,
                    wide: section.wide(),
                });
            }
            continue;
        }

        let mut is_first_segment = true;
        for (i, &(rel_pulse, point)) in points.iter().enumerate() {
            let absolute_pulse = section_start + rel_pulse;
            let next = points.get(i + 1);
            let has_slam = !almost_equals(point.v.v, point.v.vf);

            if has_slam {
                let start_value = graph_value_to_laser_x(point.v.v, section.wide());
                let end_value = graph_value_to_laser_x(point.v.vf, section.wide());

                let mut slam_length = PREFERRED_SLAM_LENGTH;
                if let Some(&(next_rel_pulse, next_point)) = next {
                    let distance_to_next = next_rel_pulse - rel_pulse;
                    let next_start_value =
                        graph_value_to_laser_x(next_point.v.v, section.wide());

                    if distance_to_next < PREFERRED_SLAM_LENGTH {
                        if next_start_value == end_value {
                            // Shorten the slam so the next point still gets its
                            // own line and survives the round trip
                            slam_length = (distance_to_next / 2).max(1);
                        } else {
                            slam_length = distance_to_next;
                        }
                    } else if distance_to_next <= PULSE_1_16 && next_start_value != end_value {
                        // A short gap to a differing value would read back as a
                        // second slam; shrink this one below the threshold
                        slam_length = if distance_to_next > PREFERRED_SLAM_LENGTH + PULSE_1_48 {
                            PULSE_1_48
                        } else if distance_to_next > PREFERRED_SLAM_LENGTH + PULSE_1_64 {
                            PULSE_1_64
                        } else if distance_to_next > PREFERRED_SLAM_LENGTH + PULSE_1_96 {
                            PULSE_1_96
                        } else {
                            PULSE_1_192
                        };
                    }
                }

                segments.push(KshLaserSegment {
                    start_pulse: absolute_pulse,
                    length: slam_length,
                    start_value,
                    end_value,
                    is_section_start: is_first_segment,
                    wide: section.wide(),
                });
                is_first_segment = false;

                if let Some(&(next_rel_pulse, next_point)) = next {
                    let slam_end_pulse = absolute_pulse + slam_length;
                    let next_absolute_pulse = section_start + next_rel_pulse;
                    if slam_end_pulse <= next_absolute_pulse {
                        segments.push(KshLaserSegment {
                            start_pulse: slam_end_pulse,
                            length: next_absolute_pulse - slam_end_pulse,
                            start_value: end_value,
                            end_value: graph_value_to_laser_x(next_point.v.v, section.wide()),
                            is_section_start: false,
                            wide: section.wide(),
                        });
                    }
                }
            } else if let Some(&(next_rel_pulse, next_point)) = next {
                let next_absolute_pulse = section_start + next_rel_pulse;
                segments.push(KshLaserSegment {
                    start_pulse: absolute_pulse,
                    length: next_absolute_pulse - absolute_pulse,
                    start_value: graph_value_to_laser_x(point.v.v, section.wide()),
                    end_value: graph_value_to_laser_x(next_point.v.v, section.wide()),
                    is_section_start: is_first_segment,
                    wide: section.wide(),
                });
                is_first_segment = false;
            }
        }
    }

    segments
}

fn laser_char_at(segments: &[KshLaserSegment], pulse: Pulse) -> u8 {
    for seg in segments {
        let segment_end = seg.start_pulse + seg.length;
        if pulse < seg.start_pulse || pulse > segment_end {
            continue;
        }
        if pulse == seg.start_pulse {
            return laser_x_to_char(seg.start_value);
        }
        if pulse == segment_end {
            return laser_x_to_char(seg.end_value);
        }
        return b':';
    }
    b'-'
}

fn bt_char_at(lane: &ByPulse<Interval>, pulse: Pulse) -> u8 {
    if let Some(interval) = lane.get(&pulse) {
        return if interval.length == 0 { b'1' } else { b'2' };
    }
    match value_entry_at(lane, pulse) {
        Some((y, interval)) if pulse > y && pulse < y + interval.length => b'2',
        _ => b'0',
    }
}

fn fx_char_at(lane: &ByPulse<Interval>, pulse: Pulse) -> u8 {
    if let Some(interval) = lane.get(&pulse) {
        return if interval.length == 0 { b'2' } else { b'1' };
    }
    match value_entry_at(lane, pulse) {
        Some((y, interval)) if pulse > y && pulse < y + interval.length => b'1',
        _ => b'0',
    }
}

// ---------------------------------------------------------------------------
// Audio effect strings

fn atoi_str(s: &str) -> i32 {
    parse_i32_prefix(s, 0)
}

/// Percent-like KSH parameter ("50%", "0.5" or "1/2") to an integer percent.
fn rate_param_to_percent(s: &str) -> i32 {
    if s.ends_with('%') {
        atoi_str(s)
    } else if let Some(denominator) = s.strip_prefix("1/") {
        let denominator = atoi_str(denominator);
        if denominator > 0 {
            100 / denominator
        } else {
            0
        }
    } else {
        (parse_f64_prefix(s, 0.0) * 100.0).round() as i32
    }
}

/// Reconstructs the short "Name;p1;p2" string of `fx-l=`/`fx-r=` from KSON
/// long event parameters.
fn generate_ksh_audio_effect_string(
    chart: &ChartData,
    effect_name: &str,
    params: &AudioEffectParams,
    is_fx: bool,
) -> String {
    let mut result = preset_fx_effect_name_to_ksh(effect_name)
        .map(str::to_owned)
        .unwrap_or_else(|| effect_name.to_owned());

    let defs = if is_fx {
        &chart.audio.audio_effect.fx.def
    } else {
        &chart.audio.audio_effect.laser.def
    };
    let mut kind = defs
        .iter()
        .find(|(name, _)| name.as_str() == effect_name)
        .map(|(_, def)| def.kind)
        .unwrap_or(AudioEffectKind::Unspecified);
    if kind == AudioEffectKind::Unspecified {
        if let Some(preset_kind) = preset_effect_kind(effect_name) {
            kind = preset_kind;
        }
    }

    let mut param1: Option<i32> = None;
    let mut param2: Option<i32> = None;

    match kind {
        AudioEffectKind::Retrigger
        | AudioEffectKind::Gate
        | AudioEffectKind::Wobble
        | AudioEffectKind::Echo => {
            if let Some(wave_length) = params.get("wave_length") {
                if let Some(denominator) = wave_length.strip_prefix("1/") {
                    param1 = Some(atoi_str(denominator));
                }
            }
            if kind == AudioEffectKind::Echo {
                if let Some(feedback) = params.get("feedback_level") {
                    param2 = Some(rate_param_to_percent(feedback));
                }
            }
        }
        AudioEffectKind::PitchShift => {
            if let Some(pitch) = params.get("pitch") {
                param1 = Some(atoi_str(pitch));
            }
        }
        AudioEffectKind::Bitcrusher => {
            if let Some(reduction) = params.get("reduction") {
                param1 = Some(atoi_str(reduction));
            }
        }
        AudioEffectKind::Tapestop => {
            if let Some(speed) = params.get("speed") {
                param1 = Some(rate_param_to_percent(speed));
            }
        }
        _ => {}
    }

    if let Some(p1) = param1 {
        result.push_str(&format!(";{p1}"));
        if let Some(p2) = param2 {
            result.push_str(&format!(";{p2}"));
        }
    }

    result
}

// ---------------------------------------------------------------------------
// Measure body

/// Last pulse that must still be covered by an emitted measure.
fn calculate_max_pulse(chart: &ChartData) -> Pulse {
    let mut max_pulse: Pulse = 0;
    let mut up = |pulse: Pulse| {
        if pulse > max_pulse {
            max_pulse = pulse;
        }
    };

    for lane in &chart.note.bt {
        if let Some((&pulse, interval)) = lane.iter().next_back() {
            up(pulse + interval.length);
        }
    }
    for lane in &chart.note.fx {
        if let Some((&pulse, interval)) = lane.iter().next_back() {
            up(pulse + interval.length);
        }
    }
    for lane in &chart.note.laser {
        if let Some((&pulse, section)) = lane.iter().next_back() {
            up(pulse + section.last_ry());
        }
    }

    if let Some(&pulse) = chart.beat.bpm.keys().next_back() {
        up(pulse);
    }

    // Pulse of the last time signature change
    if let Some(&last_measure_idx) = chart.beat.time_sig.keys().next_back() {
        let mut pulse_at_last_time_sig: Pulse = 0;
        for idx in 0..last_measure_idx {
            let sig = value_at_or_default(&chart.beat.time_sig, idx, TimeSig::default());
            pulse_at_last_time_sig += sig.measure_pulses();
        }
        up(pulse_at_last_time_sig);
    }

    if let Some(&pulse) = chart.beat.stop.keys().next_back() {
        up(pulse);
    }
    if let Some(&pulse) = chart.beat.scroll_speed.keys().next_back() {
        up(pulse);
    }

    let body = &chart.camera.cam.body;
    for graph in [
        &body.rotation_deg,
        &body.zoom_top,
        &body.zoom_bottom,
        &body.zoom_side,
        &body.center_split,
    ] {
        if let Some(&pulse) = graph.keys().next_back() {
            up(pulse);
        }
    }

    if let Some(&pulse) = chart.camera.tilt.keys().next_back() {
        up(pulse);
    }

    let slam_event = &chart.camera.cam.pattern.laser.slam_event;
    if let Some(&pulse) = slam_event.spin.keys().next_back() {
        up(pulse);
    }
    if let Some(&pulse) = slam_event.half_spin.keys().next_back() {
        up(pulse);
    }
    if let Some(&pulse) = slam_event.swing.keys().next_back() {
        up(pulse);
    }

    if let Some(&pulse) = chart.audio.key_sound.laser.vol.keys().next_back() {
        up(pulse);
    }
    for pulses in chart.audio.key_sound.laser.slam_event.values() {
        if let Some(&pulse) = pulses.iter().next_back() {
            up(pulse);
        }
    }
    for pulses in chart.audio.audio_effect.laser.pulse_event.values() {
        if let Some(&pulse) = pulses.iter().next_back() {
            up(pulse);
        }
    }
    for param_map in chart.audio.audio_effect.laser.param_change.values() {
        for pulse_value_map in param_map.values() {
            if let Some(&pulse) = pulse_value_map.keys().next_back() {
                up(pulse);
            }
        }
    }

    for lane_events in chart.audio.audio_effect.fx.long_event.values() {
        for lane in lane_events {
            if let Some(&pulse) = lane.keys().next_back() {
                up(pulse);
            }
        }
    }
    for param_map in chart.audio.audio_effect.fx.param_change.values() {
        for pulse_value_map in param_map.values() {
            if let Some(&pulse) = pulse_value_map.keys().next_back() {
                up(pulse);
            }
        }
    }

    if let Some(&pulse) = chart.editor.comment.keys().next_back() {
        up(pulse);
    }

    if let Some(&pulse) = chart.compat.ksh_unknown.line.keys().next_back() {
        up(pulse);
    }
    for pulse_value_map in chart.compat.ksh_unknown.option.values() {
        if let Some(&pulse) = pulse_value_map.keys().next_back() {
            up(pulse);
        }
    }

    max_pulse
}

struct DivisionScan {
    measure_start: Pulse,
    measure_end: Pulse,
    measure_length: Pulse,
    gcd: Pulse,
    should_double: bool,
}

impl DivisionScan {
    fn update(&mut self, pulse: Pulse) {
        if pulse >= self.measure_start && pulse < self.measure_end {
            let rel_pulse = pulse - self.measure_start;
            if rel_pulse > 0 && rel_pulse < self.measure_length {
                self.gcd = gcd(self.gcd, rel_pulse);
            }
        }
    }

    fn contains(&self, pulse: Pulse) -> bool {
        pulse >= self.measure_start && pulse < self.measure_end
    }
}

/// Subdivision count that can place every event of the measure on its own
/// line. Long-note and laser endpoints try to double (or triple, for 1/64th
/// grids) the resolution so the endpoint gets a dedicated line.
fn calculate_optimal_division(
    chart: &ChartData,
    laser_segments: &[Vec<KshLaserSegment>; NUM_LASER_LANES],
    measure_start: Pulse,
    measure_length: Pulse,
) -> Pulse {
    let mut scan = DivisionScan {
        measure_start,
        measure_end: measure_start + measure_length,
        measure_length,
        gcd: measure_length,
        should_double: false,
    };

    for lane in &chart.note.bt {
        for (&pulse, interval) in lane {
            scan.update(pulse);
            scan.update(pulse + interval.length);
            if interval.length > 0
                && (scan.contains(pulse) || scan.contains(pulse + interval.length))
            {
                scan.should_double = true;
            }
        }
    }
    for lane in &chart.note.fx {
        for (&pulse, interval) in lane {
            scan.update(pulse);
            scan.update(pulse + interval.length);
            if interval.length > 0
                && (scan.contains(pulse) || scan.contains(pulse + interval.length))
            {
                scan.should_double = true;
            }
        }
    }
    for segments in laser_segments {
        for seg in segments {
            scan.update(seg.start_pulse);
            scan.update(seg.start_pulse + seg.length);
            if scan.contains(seg.start_pulse) || scan.contains(seg.start_pulse + seg.length) {
                scan.should_double = true;
            }
        }
    }

    for &pulse in chart.beat.bpm.keys() {
        scan.update(pulse);
    }
    for &pulse in chart.beat.stop.keys() {
        scan.update(pulse);
    }
    for &pulse in chart.beat.scroll_speed.keys() {
        scan.update(pulse);
    }

    let body = &chart.camera.cam.body;
    for graph in [
        &body.rotation_deg,
        &body.zoom_top,
        &body.zoom_bottom,
        &body.zoom_side,
        &body.center_split,
    ] {
        for &pulse in graph.keys() {
            scan.update(pulse);
        }
    }

    for &pulse in chart.camera.tilt.keys() {
        scan.update(pulse);
    }

    let slam_event = &chart.camera.cam.pattern.laser.slam_event;
    for &pulse in slam_event.spin.keys() {
        scan.update(pulse);
    }
    for &pulse in slam_event.half_spin.keys() {
        scan.update(pulse);
    }
    for &pulse in slam_event.swing.keys() {
        scan.update(pulse);
    }

    for lane_events in chart.audio.audio_effect.fx.long_event.values() {
        for lane in lane_events {
            for &pulse in lane.keys() {
                scan.update(pulse);
            }
        }
    }
    for param_map in chart.audio.audio_effect.fx.param_change.values() {
        for pulse_value_map in param_map.values() {
            for &pulse in pulse_value_map.keys() {
                scan.update(pulse);
            }
        }
    }
    for param_map in chart.audio.audio_effect.laser.param_change.values() {
        for pulse_value_map in param_map.values() {
            for &pulse in pulse_value_map.keys() {
                scan.update(pulse);
            }
        }
    }
    for pulses in chart.audio.audio_effect.laser.pulse_event.values() {
        for &pulse in pulses {
            scan.update(pulse);
        }
    }
    for &pulse in chart.audio.key_sound.laser.vol.keys() {
        scan.update(pulse);
    }
    for &pulse in chart.audio.audio_effect.laser.legacy.filter_gain.keys() {
        scan.update(pulse);
    }
    for pulses in chart.audio.key_sound.laser.slam_event.values() {
        for &pulse in pulses {
            scan.update(pulse);
        }
    }
    for lanes in chart.audio.key_sound.fx.chip_event.values() {
        for lane in lanes {
            for &pulse in lane.keys() {
                scan.update(pulse);
            }
        }
    }

    for &pulse in chart.editor.comment.keys() {
        scan.update(pulse);
    }
    for pulse_value_map in chart.compat.ksh_unknown.option.values() {
        for &pulse in pulse_value_map.keys() {
            scan.update(pulse);
        }
    }
    for &pulse in chart.compat.ksh_unknown.line.keys() {
        scan.update(pulse);
    }

    let mut division = if scan.gcd > 0 {
        measure_length / scan.gcd
    } else {
        measure_length
    };

    if division < measure_length && scan.should_double {
        let doubled = division * 2;
        if measure_length % doubled == 0 {
            division = doubled;
        } else if measure_length / division == 15 {
            // 1/64th grids on odd subdivisions only triple evenly; doubling
            // would merge adjacent laser sections on read-back
            let tripled = division * 3;
            if measure_length % tripled == 0 {
                division = tripled;
            }
        }
    }

    if division < 1 || measure_length % division != 0 {
        division = measure_length;
    }
    division.min(measure_length)
}

fn write_measures<W: Write>(
    w: &mut W,
    chart: &ChartData,
    state: &mut ExportState,
    diag: &mut KshSavingDiag,
) -> Result<(), ChartError> {
    // Same gate as loading: charts older than v1.70 with large manual tilt
    // values use the 14-degree scale
    let mut use_legacy_scale_for_manual_tilt = false;
    if chart
        .compat
        .is_ksh_version_older_than(VER_MANUAL_TILT_SCALE_CHANGED)
    {
        for tilt_value in chart.camera.tilt.values() {
            if let TiltValue::Manual(point) = tilt_value {
                let large_vf = matches!(point.v.vf, TiltVf::Value(vf) if vf.abs() >= 10.0);
                if point.v.v.abs() >= 10.0 || large_vf {
                    use_legacy_scale_for_manual_tilt = true;
                    break;
                }
            }
        }
    }

    let laser_segments: [Vec<KshLaserSegment>; NUM_LASER_LANES] = [
        convert_laser_to_segments(&chart.note.laser[0]),
        convert_laser_to_segments(&chart.note.laser[1]),
    ];

    let max_pulse = calculate_max_pulse(chart);
    let mut current_pulse: Pulse = 0;
    let mut measure_idx: i64 = 0;

    while current_pulse <= max_pulse {
        let time_sig = value_at_or_default(&chart.beat.time_sig, measure_idx, TimeSig::default());
        let measure_length = time_sig.measure_pulses();
        if measure_length <= 0 {
            diag.push(
                WarningScope::Both,
                format!(
                    "Time signature {}/{} at measure {} has no length; output truncated.",
                    time_sig.n, time_sig.d, measure_idx
                ),
            );
            break;
        }

        if chart.beat.time_sig.contains_key(&measure_idx)
            || time_sig != state.current_time_sig
        {
            write!(w, "beat={}/{}\r\n", time_sig.n, time_sig.d)?;
            state.current_time_sig = time_sig;
        }

        let division =
            calculate_optimal_division(chart, &laser_segments, current_pulse, measure_length);
        let one_line_pulse = measure_length / division;

        for line_idx in 0..division {
            let pulse = current_pulse + line_idx * one_line_pulse;
            write_note_line(
                w,
                chart,
                &laser_segments,
                pulse,
                state,
                use_legacy_scale_for_manual_tilt,
            )?;
        }

        write!(w, "--\r\n")?;
        current_pulse += measure_length;
        measure_idx += 1;
    }

    Ok(())
}

fn write_graph_curve<W: Write>(
    w: &mut W,
    param_name: &str,
    curve: &crate::GraphCurve,
) -> Result<(), ChartError> {
    if curve.a != 0.0 || curve.b != 0.0 {
        write!(
            w,
            "{param_name}_curve={};{}\r\n",
            format_ksh_value(curve.a),
            format_ksh_value(curve.b)
        )?;
    }
    Ok(())
}

fn write_zoom_parameter<W: Write>(
    w: &mut W,
    param_name: &str,
    point: &crate::GraphPoint,
) -> Result<(), ChartError> {
    let zoom_value = point.v.v.clamp(-ZOOM_ABS_MAX, ZOOM_ABS_MAX).round() as i64;
    write!(w, "{param_name}={zoom_value}\r\n")?;

    if !almost_equals(point.v.v, point.v.vf) {
        let zoom_value_final = point.v.vf.clamp(-ZOOM_ABS_MAX, ZOOM_ABS_MAX).round() as i64;
        if zoom_value != zoom_value_final {
            write!(w, "{param_name}={zoom_value_final}\r\n")?;
        }
    }

    write_graph_curve(w, param_name, &point.curve)
}

// The emission order below matches the legacy editor's save routine for
// internet ranking hash compatibility.
fn write_note_line<W: Write>(
    w: &mut W,
    chart: &ChartData,
    laser_segments: &[Vec<KshLaserSegment>; NUM_LASER_LANES],
    pulse: Pulse,
    state: &mut ExportState,
    use_legacy_scale_for_manual_tilt: bool,
) -> Result<(), ChartError> {
    // FX chip key sounds
    for lane_idx in 0..NUM_FX_LANES {
        for (chip_name, lanes) in &chart.audio.key_sound.fx.chip_event {
            if let Some(chip_data) = lanes[lane_idx].get(&pulse) {
                let vol = (chip_data.vol * 100.0).round() as i32;
                write!(w, "fx-{}_se={chip_name}", lane_side_char(lane_idx))?;
                if vol != 100 {
                    write!(w, ";{vol}")?;
                }
                write!(w, "\r\n")?;
            }
        }
    }

    // BPM change
    if let Some(&bpm) = chart.beat.bpm.get(&pulse) {
        let bpm = if should_clamp_bpm(chart) {
            bpm.min(BPM_MAX)
        } else {
            bpm
        };
        let bpm_str = format_ksh_value(bpm);
        let skip_duplicate =
            pulse == 0 && !state.header_bpm_str.is_empty() && bpm_str == state.header_bpm_str;
        if !skip_duplicate {
            write!(w, "t={bpm_str}\r\n")?;
        }
    }

    // Comments
    if let Some(comments) = chart.editor.comment.get(&pulse) {
        for comment in comments {
            write!(w, "//{comment}\r\n")?;
        }
    }

    // Unknown lines (pulse 0 already went into the header)
    if pulse != 0 {
        if let Some(lines) = chart.compat.ksh_unknown.line.get(&pulse) {
            for line in lines {
                write!(w, "{line}\r\n")?;
            }
        }
    }

    // Unknown options
    for (option_key, pulse_value_map) in &chart.compat.ksh_unknown.option {
        if let Some(values) = pulse_value_map.get(&pulse) {
            for value in values {
                write!(w, "{option_key}={value}\r\n")?;
            }
        }
    }

    // center_split
    if let Some(point) = chart.camera.cam.body.center_split.get(&pulse) {
        let clamped_v = point.v.v.clamp(-CENTER_SPLIT_ABS_MAX, CENTER_SPLIT_ABS_MAX);
        write!(w, "center_split={}\r\n", format_ksh_value(clamped_v))?;
        if !almost_equals(point.v.v, point.v.vf) {
            let clamped_vf = point.v.vf.clamp(-CENTER_SPLIT_ABS_MAX, CENTER_SPLIT_ABS_MAX);
            write!(w, "center_split={}\r\n", format_ksh_value(clamped_vf))?;
        }
        write_graph_curve(w, "center_split", &point.curve)?;
    }

    // FX and laser parameter changes
    for (effect_name, param_map) in &chart.audio.audio_effect.fx.param_change {
        for (param_name, pulse_value_map) in param_map {
            if let Some(value) = pulse_value_map.get(&pulse) {
                let ksh_effect_name = preset_fx_effect_name_to_ksh(effect_name)
                    .unwrap_or(effect_name.as_str());
                let ksh_param_name =
                    param_name_to_ksh(param_name).unwrap_or(param_name.as_str());
                write!(w, "fx:{ksh_effect_name}:{ksh_param_name}={value}\r\n")?;
            }
        }
    }
    for (effect_name, param_map) in &chart.audio.audio_effect.laser.param_change {
        for (param_name, pulse_value_map) in param_map {
            if let Some(value) = pulse_value_map.get(&pulse) {
                let ksh_effect_name =
                    preset_filter_name_to_ksh(effect_name).unwrap_or(effect_name.as_str());
                let ksh_param_name =
                    param_name_to_ksh(param_name).unwrap_or(param_name.as_str());
                write!(w, "filter:{ksh_effect_name}:{ksh_param_name}={value}\r\n")?;
            }
        }
    }

    // Peaking filter gain (pulse 0 already went into the header)
    if let Some(filter_gain) = chart
        .audio
        .audio_effect
        .laser
        .legacy
        .filter_gain
        .get(&pulse)
    {
        let pfiltergain = (filter_gain * 100.0).round() as i32;
        if pfiltergain != state.current_pfiltergain {
            if pulse != 0 {
                write!(w, "pfiltergain={pfiltergain}\r\n")?;
            }
            state.current_pfiltergain = pfiltergain;
        }
    }

    // Filter type changes (pulse 0 already went into the header)
    if pulse != 0 {
        let pulse_event = &chart.audio.audio_effect.laser.pulse_event;
        for (kson_name, ksh_name) in [
            ("peaking_filter", "peak"),
            ("low_pass_filter", "lpf1"),
            ("high_pass_filter", "hpf1"),
            ("bitcrusher", "bitc"),
        ] {
            if pulse_event
                .get(kson_name)
                .is_some_and(|pulses| pulses.contains(&pulse))
            {
                write!(w, "filtertype={ksh_name}\r\n")?;
                break;
            }
        }
        for (effect_name, pulses) in pulse_event {
            if preset_filter_name_to_ksh(effect_name).is_none() && pulses.contains(&pulse) {
                write!(w, "filtertype={effect_name}\r\n")?;
            }
        }
    }

    // Laser key sound volume
    if let Some(vol) = chart.audio.key_sound.laser.vol.get(&pulse) {
        let chokkakuvol = (vol * 100.0).round() as i32;
        if chokkakuvol != state.current_chokkakuvol {
            if pulse != 0 {
                write!(w, "chokkakuvol={chokkakuvol}\r\n")?;
            }
            state.current_chokkakuvol = chokkakuvol;
        }
    }

    // Laser slam key sounds
    {
        let slam_event = &chart.audio.key_sound.laser.slam_event;
        for name in ["down", "up", "swing", "mute"] {
            if slam_event
                .get(name)
                .is_some_and(|pulses| pulses.contains(&pulse))
            {
                write!(w, "chokkakuse={name}\r\n")?;
                break;
            }
        }
    }

    // Tilt
    if let Some(tilt_value) = chart.camera.tilt.get(&pulse) {
        match tilt_value {
            TiltValue::Manual(point) => {
                let scale = if use_legacy_scale_for_manual_tilt {
                    10.0 / 14.0
                } else {
                    1.0
                };

                if !point.curve.is_linear() {
                    write!(
                        w,
                        "tilt_curve={};{}\r\n",
                        format_ksh_value(point.curve.a),
                        format_ksh_value(point.curve.b)
                    )?;
                }

                let clamped_v =
                    (point.v.v * scale).clamp(-MANUAL_TILT_ABS_MAX, MANUAL_TILT_ABS_MAX);
                write!(w, "tilt={}\r\n", format_ksh_value(clamped_v))?;

                match point.v.vf {
                    TiltVf::Value(vf) => {
                        if !almost_equals(point.v.v, vf) {
                            let clamped_vf =
                                (vf * scale).clamp(-MANUAL_TILT_ABS_MAX, MANUAL_TILT_ABS_MAX);
                            write!(w, "tilt={}\r\n", format_ksh_value(clamped_vf))?;
                        }
                    }
                    TiltVf::Auto(kind) => {
                        write!(w, "tilt={}\r\n", kind.as_str())?;
                    }
                }
            }
            TiltValue::Auto(kind) => {
                write!(w, "tilt={}\r\n", kind.as_str())?;
            }
        }
    }

    // Camera zooms
    if let Some(point) = chart.camera.cam.body.zoom_top.get(&pulse) {
        write_zoom_parameter(w, "zoom_top", point)?;
    }
    if let Some(point) = chart.camera.cam.body.zoom_bottom.get(&pulse) {
        write_zoom_parameter(w, "zoom_bottom", point)?;
    }
    if let Some(point) = chart.camera.cam.body.zoom_side.get(&pulse) {
        write_zoom_parameter(w, "zoom_side", point)?;
    }

    // Wide-laser announcements
    for (lane_idx, segments) in laser_segments.iter().enumerate() {
        for seg in segments {
            if seg.start_pulse == pulse && seg.is_section_start {
                if seg.wide {
                    write!(w, "laserrange_{}=2x\r\n", lane_side_char(lane_idx))?;
                }
                break;
            }
        }
    }

    // Laser point curves
    for (lane_idx, lane) in chart.note.laser.iter().enumerate() {
        for (&section_pulse, section) in lane {
            let rel_pulse = pulse - section_pulse;
            if rel_pulse < 0 {
                continue;
            }
            if let Some(point) = section.v.get(&rel_pulse) {
                if point.curve.a != 0.0 || point.curve.b != 0.0 {
                    write!(
                        w,
                        "laser_{}_curve={};{}\r\n",
                        lane_side_char(lane_idx),
                        format_ksh_value(point.curve.a),
                        format_ksh_value(point.curve.b)
                    )?;
                }
                break;
            }
        }
    }

    // Stop
    if let Some(&stop_length) = chart.beat.stop.get(&pulse) {
        write!(w, "stop={}\r\n", to_ksh_resolution(stop_length))?;
    }

    // Scroll speed
    if let Some(point) = chart.beat.scroll_speed.get(&pulse) {
        let is_default_only = chart.beat.scroll_speed.len() == 1
            && chart
                .beat
                .scroll_speed
                .values()
                .next()
                .is_some_and(|p| almost_equals(p.v.v, 1.0));
        if !is_default_only {
            write!(w, "scroll_speed={}\r\n", format_ksh_value(point.v.v))?;
        }
        if !almost_equals(point.v.v, point.v.vf) {
            write!(w, "scroll_speed={}\r\n", format_ksh_value(point.v.vf))?;
        }
        write_graph_curve(w, "scroll_speed", &point.curve)?;
    }

    // Rotation
    if let Some(point) = chart.camera.cam.body.rotation_deg.get(&pulse) {
        let clamped_v = point.v.v.clamp(-ROTATION_DEG_ABS_MAX, ROTATION_DEG_ABS_MAX);
        write!(w, "rotation_deg={}\r\n", clamped_v.round() as i64)?;
        if !almost_equals(point.v.v, point.v.vf) {
            let clamped_vf = point.v.vf.clamp(-ROTATION_DEG_ABS_MAX, ROTATION_DEG_ABS_MAX);
            write!(w, "rotation_deg={}\r\n", clamped_vf.round() as i64)?;
        }
        write_graph_curve(w, "rotation_deg", &point.curve)?;
    }

    // FX long event annotations, left lane before right
    for lane_idx in 0..NUM_FX_LANES {
        for (effect_name, lane_events) in &chart.audio.audio_effect.fx.long_event {
            let Some(params) = lane_events[lane_idx].get(&pulse) else {
                continue;
            };

            if effect_name.is_empty() {
                // Empty effect name represents "effect off"
                write!(w, "fx-{}=\r\n", lane_side_char(lane_idx))?;
                break;
            }

            let audio_effect_str =
                generate_ksh_audio_effect_string(chart, effect_name, params, true);
            write!(w, "fx-{}={audio_effect_str}\r\n", lane_side_char(lane_idx))?;
            break;
        }
    }

    // Chart line body
    for lane in &chart.note.bt {
        w.write_all(&[bt_char_at(lane, pulse)])?;
    }
    w.write_all(&[BLOCK_SEPARATOR])?;
    for lane in &chart.note.fx {
        w.write_all(&[fx_char_at(lane, pulse)])?;
    }
    w.write_all(&[BLOCK_SEPARATOR])?;
    for segments in laser_segments {
        w.write_all(&[laser_char_at(segments, pulse)])?;
    }

    // Spin suffix
    let slam_event = &chart.camera.cam.pattern.laser.slam_event;
    if let Some(spin) = slam_event.spin.get(&pulse) {
        let dir_char = if spin.d < 0 { '(' } else { ')' };
        write!(w, "@{dir_char}{}", to_ksh_resolution(spin.length))?;
    } else if let Some(half_spin) = slam_event.half_spin.get(&pulse) {
        let dir_char = if half_spin.d < 0 { '<' } else { '>' };
        write!(w, "@{dir_char}{}", to_ksh_resolution(half_spin.length))?;
    } else if let Some(swing) = slam_event.swing.get(&pulse) {
        let dir_char = if swing.d < 0 { '<' } else { '>' };
        write!(w, "S{dir_char}{}", to_ksh_resolution(swing.length))?;
        let scale = swing.v.scale.round() as i32;
        if scale != 250 || swing.v.repeat != 3 || swing.v.decay_order != 2 {
            write!(w, ";{scale};{};{}", swing.v.repeat, swing.v.decay_order)?;
        }
    }

    write!(w, "\r\n")?;
    Ok(())
}

fn lane_side_char(lane_idx: usize) -> char {
    if lane_idx == 0 {
        'l'
    } else {
        'r'
    }
}

// ---------------------------------------------------------------------------
// Audio effect definitions

fn write_definitions<W: Write>(
    w: &mut W,
    directive: &str,
    def: &AudioEffectDefList,
) -> Result<(), ChartError> {
    for (name, def) in def {
        let type_str = def.kind.as_str();
        let ksh_type = audio_effect_kind_name_to_ksh(type_str).unwrap_or(type_str);
        write!(w, "{directive} {name} type={ksh_type}")?;
        for (param_name, value) in &def.v {
            let ksh_param = param_name_to_ksh(param_name).unwrap_or(param_name.as_str());
            write!(w, ";{ksh_param}={value}")?;
        }
        write!(w, "\r\n")?;
    }
    Ok(())
}

fn write_audio_effect_definitions<W: Write>(
    w: &mut W,
    chart: &ChartData,
) -> Result<(), ChartError> {
    write_definitions(w, "#define_fx", &chart.audio.audio_effect.fx.def)?;
    write_definitions(w, "#define_filter", &chart.audio.audio_effect.laser.def)?;
    Ok(())
}
