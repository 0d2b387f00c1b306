use crate::{ByPulse, Dict, Pulse, PulseSet, NUM_FX_LANES};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum AudioEffectKind {
    #[default]
    Unspecified,
    Retrigger,
    Gate,
    Flanger,
    PitchShift,
    Bitcrusher,
    Phaser,
    Wobble,
    Tapestop,
    Echo,
    Sidechain,
    SwitchAudio,
    HighPassFilter,
    LowPassFilter,
    PeakingFilter,
}

impl AudioEffectKind {
    /// KSON type name; empty for `Unspecified`.
    pub fn as_str(&self) -> &'static str {
        match self {
            AudioEffectKind::Unspecified => "",
            AudioEffectKind::Retrigger => "retrigger",
            AudioEffectKind::Gate => "gate",
            AudioEffectKind::Flanger => "flanger",
            AudioEffectKind::PitchShift => "pitch_shift",
            AudioEffectKind::Bitcrusher => "bitcrusher",
            AudioEffectKind::Phaser => "phaser",
            AudioEffectKind::Wobble => "wobble",
            AudioEffectKind::Tapestop => "tapestop",
            AudioEffectKind::Echo => "echo",
            AudioEffectKind::Sidechain => "sidechain",
            AudioEffectKind::SwitchAudio => "switch_audio",
            AudioEffectKind::HighPassFilter => "high_pass_filter",
            AudioEffectKind::LowPassFilter => "low_pass_filter",
            AudioEffectKind::PeakingFilter => "peaking_filter",
        }
    }

    /// Parses a KSON type name; unknown names are `Unspecified`.
    pub fn from_name(s: &str) -> Self {
        match s {
            "retrigger" => AudioEffectKind::Retrigger,
            "gate" => AudioEffectKind::Gate,
            "flanger" => AudioEffectKind::Flanger,
            "pitch_shift" => AudioEffectKind::PitchShift,
            "bitcrusher" => AudioEffectKind::Bitcrusher,
            "phaser" => AudioEffectKind::Phaser,
            "wobble" => AudioEffectKind::Wobble,
            "tapestop" => AudioEffectKind::Tapestop,
            "echo" => AudioEffectKind::Echo,
            "sidechain" => AudioEffectKind::Sidechain,
            "switch_audio" => AudioEffectKind::SwitchAudio,
            "high_pass_filter" => AudioEffectKind::HighPassFilter,
            "low_pass_filter" => AudioEffectKind::LowPassFilter,
            "peaking_filter" => AudioEffectKind::PeakingFilter,
            _ => AudioEffectKind::Unspecified,
        }
    }
}

/// Parameter values are kept as literal strings (e.g. "1/8", "60%", "500Hz")
/// to preserve author intent.
pub type AudioEffectParams = Dict<String>;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioEffectDef {
    pub kind: AudioEffectKind,
    pub v: AudioEffectParams,
}

/// Definition list entry; insertion order is preserved through serialization.
pub type AudioEffectDefList = Vec<(String, AudioEffectDef)>;

fn def_find<'a>(def: &'a AudioEffectDefList, name: &str) -> Option<&'a AudioEffectDef> {
    def.iter().find(|(n, _)| n.as_str() == name).map(|(_, d)| d)
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioEffectFxInfo {
    pub def: AudioEffectDefList,
    pub param_change: Dict<Dict<ByPulse<String>>>,
    pub long_event: Dict<[ByPulse<AudioEffectParams>; NUM_FX_LANES]>,
}

impl AudioEffectFxInfo {
    // Linear search; cache the result when calling often.
    pub fn def_contains(&self, name: &str) -> bool {
        def_find(&self.def, name).is_some()
    }

    pub fn def_by_name(&self, name: &str) -> Option<&AudioEffectDef> {
        def_find(&self.def, name)
    }

    pub fn def_as_dict(&self) -> Dict<AudioEffectDef> {
        self.def
            .iter()
            .map(|(n, d)| (n.clone(), d.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioEffectLaserLegacyInfo {
    /// "pfiltergain" in KSH format, scaled to 0.0-1.0.
    pub filter_gain: ByPulse<f64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioEffectLaserInfo {
    pub def: AudioEffectDefList,
    pub param_change: Dict<Dict<ByPulse<String>>>,
    pub pulse_event: Dict<PulseSet>,
    /// 0ms - 160ms.
    pub peaking_filter_delay: i32,
    pub legacy: AudioEffectLaserLegacyInfo,
}

impl AudioEffectLaserInfo {
    // Linear search; cache the result when calling often.
    pub fn def_contains(&self, name: &str) -> bool {
        def_find(&self.def, name).is_some()
    }

    pub fn def_by_name(&self, name: &str) -> Option<&AudioEffectDef> {
        def_find(&self.def, name)
    }

    pub fn def_as_dict(&self) -> Dict<AudioEffectDef> {
        self.def
            .iter()
            .map(|(n, d)| (n.clone(), d.clone()))
            .collect()
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct AudioEffectInfo {
    pub fx: AudioEffectFxInfo,
    pub laser: AudioEffectLaserInfo,
}

pub(crate) fn pulse_set_insert(map: &mut Dict<PulseSet>, name: &str, pulse: Pulse) {
    map.entry(name.to_owned()).or_default().insert(pulse);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_name_round_trip() {
        for kind in [
            AudioEffectKind::Retrigger,
            AudioEffectKind::Gate,
            AudioEffectKind::Flanger,
            AudioEffectKind::PitchShift,
            AudioEffectKind::Bitcrusher,
            AudioEffectKind::Phaser,
            AudioEffectKind::Wobble,
            AudioEffectKind::Tapestop,
            AudioEffectKind::Echo,
            AudioEffectKind::Sidechain,
            AudioEffectKind::SwitchAudio,
            AudioEffectKind::HighPassFilter,
            AudioEffectKind::LowPassFilter,
            AudioEffectKind::PeakingFilter,
        ] {
            assert_eq!(AudioEffectKind::from_name(kind.as_str()), kind);
        }
        assert_eq!(
            AudioEffectKind::from_name("not_an_effect"),
            AudioEffectKind::Unspecified
        );
    }

    #[test]
    fn def_list_lookup_is_by_name() {
        let mut fx = AudioEffectFxInfo::default();
        fx.def.push((
            "my_flanger".to_owned(),
            AudioEffectDef {
                kind: AudioEffectKind::Flanger,
                v: AudioEffectParams::new(),
            },
        ));
        assert!(fx.def_contains("my_flanger"));
        assert!(!fx.def_contains("flanger"));
        assert_eq!(
            fx.def_by_name("my_flanger").map(|d| d.kind),
            Some(AudioEffectKind::Flanger)
        );
    }
}
