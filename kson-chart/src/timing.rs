use std::collections::BTreeMap;

use crate::{
    value_entry_at, BeatInfo, ByPulse, ChartData, Interval, LaserSection, NoteInfo, Pulse,
    RelPulse, TimeSig, RESOLUTION,
};

/// Precomputed conversion tables for a `BeatInfo`.
///
/// Construction patches a missing BPM entry at pulse 0 (or an empty BPM map)
/// and a missing time signature at measure 0 so that lookups always have an
/// anchor.
#[derive(Debug, Clone, Default)]
pub struct TimingCache {
    bpm: ByPulse<f64>,
    time_sig: BTreeMap<i64, TimeSig>,
    bpm_change_sec: ByPulse<f64>,
    /// (sec, pulse) sorted by sec.
    bpm_change_pulse: Vec<(f64, Pulse)>,
    /// Measure index -> pulse of each time signature change.
    time_sig_change_pulse: BTreeMap<i64, Pulse>,
    /// Pulse -> measure index of each time signature change.
    time_sig_change_measure_idx: BTreeMap<Pulse, i64>,
}

pub fn time_sig_one_measure_pulse(time_sig: &TimeSig) -> Pulse {
    time_sig.measure_pulses()
}

pub fn create_timing_cache(beat: &BeatInfo) -> TimingCache {
    let mut bpm = beat.bpm.clone();
    if bpm.is_empty() {
        log::warn!("create_timing_cache: BPM is empty, using default 120.0");
        bpm.insert(0, 120.0);
    } else if !bpm.contains_key(&0) {
        log::warn!("create_timing_cache: BPM at pulse 0 is missing, using first value");
        let first = *bpm.values().next().unwrap_or(&120.0);
        bpm.insert(0, first);
    }

    let mut time_sig = beat.time_sig.clone();
    if !time_sig.contains_key(&0) {
        log::warn!("create_timing_cache: time signature at measure 0 is missing, using 4/4");
        time_sig.insert(0, TimeSig::default());
    }

    let mut cache = TimingCache {
        bpm,
        time_sig,
        ..TimingCache::default()
    };

    cache.bpm_change_sec.insert(0, 0.0);
    cache.bpm_change_pulse.push((0.0, 0));
    cache.time_sig_change_pulse.insert(0, 0);
    cache.time_sig_change_measure_idx.insert(0, 0);

    // Seconds of each tempo change
    {
        let mut sec = 0.0;
        let entries: Vec<(Pulse, f64)> = cache.bpm.iter().map(|(y, b)| (*y, *b)).collect();
        for pair in entries.windows(2) {
            let (prev_y, prev_bpm) = pair[0];
            let (y, _) = pair[1];
            sec += (y - prev_y) as f64 / RESOLUTION as f64 * 60.0 / prev_bpm;
            cache.bpm_change_sec.insert(y, sec);
            cache.bpm_change_pulse.push((sec, y));
        }
    }

    // Pulse of each time signature change
    {
        let mut pulse: Pulse = 0;
        let entries: Vec<(i64, TimeSig)> = cache.time_sig.iter().map(|(i, s)| (*i, *s)).collect();
        for pair in entries.windows(2) {
            let (prev_idx, prev_sig) = pair[0];
            let (idx, _) = pair[1];
            pulse += (idx - prev_idx) * time_sig_one_measure_pulse(&prev_sig);
            cache.time_sig_change_pulse.insert(idx, pulse);
            cache.time_sig_change_measure_idx.insert(pulse, idx);
        }
    }

    cache
}

impl TimingCache {
    fn bpm_change_at(&self, pulse: Pulse) -> (Pulse, f64) {
        value_entry_at(&self.bpm, pulse).map_or((0, 120.0), |(y, b)| (y, *b))
    }

    fn bpm_change_at_sec(&self, sec: f64) -> (f64, Pulse) {
        let idx = self.bpm_change_pulse.partition_point(|(s, _)| *s <= sec);
        if idx == 0 {
            self.bpm_change_pulse.first().copied().unwrap_or((0.0, 0))
        } else {
            self.bpm_change_pulse[idx - 1]
        }
    }

    fn time_sig_change_at_pulse(&self, pulse: Pulse) -> (Pulse, i64) {
        value_entry_at(&self.time_sig_change_measure_idx, pulse).map_or((0, 0), |(y, i)| (y, *i))
    }

    fn time_sig_change_at_measure(&self, measure_idx: i64) -> (i64, Pulse) {
        value_entry_at(&self.time_sig_change_pulse, measure_idx).map_or((0, 0), |(i, y)| (i, *y))
    }

    fn time_sig_of(&self, measure_idx: i64) -> TimeSig {
        self.time_sig.get(&measure_idx).copied().unwrap_or_default()
    }
}

pub fn pulse_to_sec(pulse: Pulse, cache: &TimingCache) -> f64 {
    let (change_pulse, bpm) = cache.bpm_change_at(pulse);
    let base = cache.bpm_change_sec.get(&change_pulse).copied().unwrap_or(0.0);
    base + (pulse - change_pulse) as f64 / RESOLUTION as f64 * 60.0 / bpm
}

pub fn pulse_to_ms(pulse: Pulse, cache: &TimingCache) -> f64 {
    pulse_to_sec(pulse, cache) * 1000.0
}

pub fn pulse_double_to_sec(pulse: f64, cache: &TimingCache) -> f64 {
    let (change_pulse, bpm) = cache.bpm_change_at(pulse as Pulse);
    let base = cache.bpm_change_sec.get(&change_pulse).copied().unwrap_or(0.0);
    base + (pulse - change_pulse as f64) / RESOLUTION as f64 * 60.0 / bpm
}

pub fn pulse_double_to_ms(pulse: f64, cache: &TimingCache) -> f64 {
    pulse_double_to_sec(pulse, cache) * 1000.0
}

pub fn sec_to_pulse(sec: f64, cache: &TimingCache) -> Pulse {
    let (change_sec, change_pulse) = cache.bpm_change_at_sec(sec);
    let bpm = cache.bpm.get(&change_pulse).copied().unwrap_or(120.0);
    change_pulse + (RESOLUTION as f64 * (sec - change_sec) * bpm / 60.0) as Pulse
}

pub fn ms_to_pulse(ms: f64, cache: &TimingCache) -> Pulse {
    sec_to_pulse(ms / 1000.0, cache)
}

pub fn sec_to_pulse_double(sec: f64, cache: &TimingCache) -> f64 {
    let (change_sec, change_pulse) = cache.bpm_change_at_sec(sec);
    let bpm = cache.bpm.get(&change_pulse).copied().unwrap_or(120.0);
    change_pulse as f64 + RESOLUTION as f64 * (sec - change_sec) * bpm / 60.0
}

pub fn ms_to_pulse_double(ms: f64, cache: &TimingCache) -> f64 {
    sec_to_pulse_double(ms / 1000.0, cache)
}

pub fn pulse_to_measure_idx(pulse: Pulse, cache: &TimingCache) -> i64 {
    let (change_pulse, change_idx) = cache.time_sig_change_at_pulse(pulse);
    let sig = cache.time_sig_of(change_idx);
    let one_measure = time_sig_one_measure_pulse(&sig);
    if one_measure == 0 {
        return change_idx;
    }
    change_idx + (pulse - change_pulse) / one_measure
}

pub fn sec_to_measure_idx(sec: f64, cache: &TimingCache) -> i64 {
    pulse_to_measure_idx(sec_to_pulse(sec, cache), cache)
}

pub fn ms_to_measure_idx(ms: f64, cache: &TimingCache) -> i64 {
    sec_to_measure_idx(ms / 1000.0, cache)
}

pub fn measure_idx_to_pulse(measure_idx: i64, cache: &TimingCache) -> Pulse {
    let (change_idx, change_pulse) = cache.time_sig_change_at_measure(measure_idx);
    let sig = cache.time_sig_of(change_idx);
    change_pulse + (measure_idx - change_idx) * time_sig_one_measure_pulse(&sig)
}

pub fn measure_value_to_pulse(measure_value: f64, cache: &TimingCache) -> Pulse {
    measure_value_to_pulse_double(measure_value, cache) as Pulse
}

pub fn measure_value_to_pulse_double(measure_value: f64, cache: &TimingCache) -> f64 {
    let measure_idx = measure_value as i64;
    let (change_idx, change_pulse) = cache.time_sig_change_at_measure(measure_idx);
    let sig = cache.time_sig_of(change_idx);
    change_pulse as f64 + (measure_value - change_idx as f64) * time_sig_one_measure_pulse(&sig) as f64
}

pub fn measure_idx_to_sec(measure_idx: i64, cache: &TimingCache) -> f64 {
    pulse_to_sec(measure_idx_to_pulse(measure_idx, cache), cache)
}

pub fn measure_idx_to_ms(measure_idx: i64, cache: &TimingCache) -> f64 {
    measure_idx_to_sec(measure_idx, cache) * 1000.0
}

pub fn measure_value_to_sec(measure_value: f64, cache: &TimingCache) -> f64 {
    pulse_to_sec(measure_value_to_pulse(measure_value, cache), cache)
}

pub fn measure_value_to_ms(measure_value: f64, cache: &TimingCache) -> f64 {
    measure_value_to_sec(measure_value, cache) * 1000.0
}

pub fn is_bar_line_pulse(pulse: Pulse, cache: &TimingCache) -> bool {
    let (change_pulse, change_idx) = cache.time_sig_change_at_pulse(pulse);
    let sig = cache.time_sig_of(change_idx);
    let one_measure = time_sig_one_measure_pulse(&sig);
    if one_measure == 0 {
        return false;
    }
    (pulse - change_pulse) % one_measure == 0
}

pub fn tempo_at(pulse: Pulse, beat: &BeatInfo) -> f64 {
    value_entry_at(&beat.bpm, pulse).map_or(120.0, |(_, b)| *b)
}

pub fn time_sig_at(pulse: Pulse, cache: &TimingCache) -> TimeSig {
    let (_, change_idx) = cache.time_sig_change_at_pulse(pulse);
    cache.time_sig_of(change_idx)
}

/// BPM that lasts longest up to `last_pulse`; ties prefer the higher BPM.
/// BPM values are bucketed to 3 decimal places.
pub fn get_mode_bpm(beat: &BeatInfo, last_pulse: Pulse) -> f64 {
    const ERROR_BPM: f64 = 120.0;
    const BPM_SCALE: f64 = 1000.0;

    if beat.bpm.is_empty() {
        return ERROR_BPM;
    }
    if beat.bpm.len() == 1 {
        return *beat.bpm.values().next().unwrap_or(&ERROR_BPM);
    }

    let mut totals: BTreeMap<i64, RelPulse> = BTreeMap::new();
    let mut prev: Option<(Pulse, i64)> = None;
    for (&y, &bpm) in &beat.bpm {
        if y > last_pulse {
            break;
        }
        if let Some((prev_y, prev_bpm_int)) = prev {
            *totals.entry(prev_bpm_int).or_default() += y - prev_y;
        }
        prev = Some((y, (bpm * BPM_SCALE) as i64));
    }
    if let Some((prev_y, prev_bpm_int)) = prev {
        if prev_y <= last_pulse {
            *totals.entry(prev_bpm_int).or_default() += last_pulse - prev_y;
        }
    }

    if totals.is_empty() {
        return prev.map_or(ERROR_BPM, |(_, b)| b as f64 / BPM_SCALE);
    }

    totals
        .iter()
        .max_by_key(|(bpm_int, total)| (**total, **bpm_int))
        .map_or(ERROR_BPM, |(bpm_int, _)| *bpm_int as f64 / BPM_SCALE)
}

/// `meta.std_bpm` when set, otherwise the mode BPM over the played range.
pub fn get_effective_std_bpm(chart: &ChartData) -> f64 {
    if chart.meta.std_bpm > 0.0 {
        return chart.meta.std_bpm;
    }
    get_mode_bpm(&chart.beat, last_note_end_y(&chart.note))
}

pub fn last_note_end_y_button_lane(lane: &ByPulse<Interval>) -> Pulse {
    lane.iter()
        .next_back()
        .map_or(0, |(y, interval)| y + interval.length)
}

pub fn last_note_end_y_laser_lane(lane: &ByPulse<LaserSection>) -> Pulse {
    lane.iter().next_back().map_or(0, |(y, section)| y + section.last_ry())
}

pub fn last_note_end_y(note: &NoteInfo) -> Pulse {
    let bt = note.bt.iter().map(last_note_end_y_button_lane).max().unwrap_or(0);
    let fx = note.fx.iter().map(last_note_end_y_button_lane).max().unwrap_or(0);
    let laser = note.laser.iter().map(last_note_end_y_laser_lane).max().unwrap_or(0);
    bt.max(fx).max(laser)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RESOLUTION4;

    fn beat_with(bpm: &[(Pulse, f64)], sigs: &[(i64, i32, i32)]) -> BeatInfo {
        let mut beat = BeatInfo::default();
        for &(y, b) in bpm {
            beat.bpm.insert(y, b);
        }
        for &(i, n, d) in sigs {
            beat.time_sig.insert(i, TimeSig { n, d });
        }
        beat
    }

    #[test]
    fn pulse_sec_round_trip() {
        let beat = beat_with(&[(0, 120.0), (RESOLUTION4, 240.0)], &[(0, 4, 4)]);
        let cache = create_timing_cache(&beat);

        // 120 BPM: one quarter note = 0.5s
        assert!((pulse_to_sec(RESOLUTION, &cache) - 0.5).abs() < 1e-9);
        // First measure lasts 2s, then 240 BPM
        assert!((pulse_to_sec(RESOLUTION4 + RESOLUTION, &cache) - 2.25).abs() < 1e-9);

        for &sec in &[0.0, 0.25, 1.0, 2.0, 3.5] {
            let round = pulse_to_sec(sec_to_pulse(sec, &cache), &cache);
            assert!((round - sec).abs() < 1e-6);
        }
    }

    #[test]
    fn measure_idx_follows_time_sig() {
        let beat = beat_with(&[(0, 120.0)], &[(0, 4, 4), (2, 3, 4)]);
        let cache = create_timing_cache(&beat);

        assert_eq!(pulse_to_measure_idx(0, &cache), 0);
        assert_eq!(pulse_to_measure_idx(RESOLUTION4 * 2 - 1, &cache), 1);
        assert_eq!(pulse_to_measure_idx(RESOLUTION4 * 2, &cache), 2);
        // Measure 2 is 720 pulses long
        assert_eq!(pulse_to_measure_idx(RESOLUTION4 * 2 + 720, &cache), 3);
        assert_eq!(measure_idx_to_pulse(3, &cache), RESOLUTION4 * 2 + 720);
        assert!(is_bar_line_pulse(RESOLUTION4 * 2 + 720, &cache));
        assert!(!is_bar_line_pulse(RESOLUTION4 * 2 + 719, &cache));
    }

    #[test]
    fn mode_bpm_prefers_longest_duration() {
        let beat = beat_with(&[(0, 120.0), (960, 180.0), (1200, 120.0)], &[(0, 4, 4)]);
        // 120 BPM covers 960 + 800 pulses, 180 covers 240
        assert_eq!(get_mode_bpm(&beat, 2000), 120.0);
        // Tie prefers the higher BPM
        let tie = beat_with(&[(0, 120.0), (960, 180.0)], &[(0, 4, 4)]);
        assert_eq!(get_mode_bpm(&tie, 1920), 180.0);
    }

    #[test]
    fn last_note_end_includes_lengths() {
        let mut note = NoteInfo::default();
        note.bt[0].insert(0, Interval { length: 480 });
        note.fx[1].insert(960, Interval { length: 0 });
        let mut section = LaserSection::new();
        section.v.insert(0, crate::GraphPoint::new(0.0));
        section.v.insert(240, crate::GraphPoint::new(1.0));
        note.laser[0].insert(1200, section);
        assert_eq!(last_note_end_y(&note), 1440);
    }
}
