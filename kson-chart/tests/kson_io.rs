use kson_chart::camera::{AutoTiltKind, TiltValue, TiltVf};
use kson_chart::{ksh, kson, ChartData, ChartError, GraphCurve, GraphValue, Interval};
use pretty_assertions::assert_eq;
use serde_json::json;

fn normalized(mut chart: ChartData) -> ChartData {
    chart.warnings.clear();
    chart
}

fn save_to_string(chart: &ChartData) -> String {
    let mut out = Vec::new();
    kson::save_chart(&mut out, chart).unwrap();
    String::from_utf8(out).unwrap()
}

#[test]
fn format_version_is_required() {
    let chart = kson::load_chart(br#"{}"#.as_slice());
    assert_eq!(chart.error, Some(ChartError::KsonParse));
    assert!(chart
        .warnings
        .iter()
        .any(|w| w.contains("format_version")));
}

#[test]
fn format_version_must_be_integer() {
    let chart = kson::load_chart(br#"{"format_version":"1"}"#.as_slice());
    assert_eq!(chart.error, Some(ChartError::KsonParse));
}

#[test]
fn malformed_json_is_a_parse_error() {
    let chart = kson::load_chart(b"{not json".as_slice());
    assert_eq!(chart.error, Some(ChartError::KsonParse));
}

#[test]
fn editor_default_round_trips() {
    let chart = ChartData::editor_default();
    let out = save_to_string(&chart);
    let loaded = kson::load_chart(out.as_bytes());
    assert_eq!(loaded.error, None);
    assert_eq!(normalized(loaded), normalized(chart));
}

#[test]
fn ksh_chart_round_trips_through_kson() {
    let ksh_src = "title=T\nartist=A\neffect=E\njacket=j\nillustrator=I\n\
                   difficulty=challenge\nlevel=12\nt=90-180\nm=m.ogg\no=20\nver=170\n--\n\
                   t=90\n\
                   laserrange_l=2x\n\
                   1020|01|0-\n\
                   0000|01|C-\n\
                   t=180\n\
                   0200|20|b-\n\
                   0000|00|--\n--\n";
    let chart = ksh::load_chart(ksh_src.as_bytes());
    assert_eq!(chart.error, None);

    let out = save_to_string(&chart);
    let loaded = kson::load_chart(out.as_bytes());
    assert_eq!(loaded.error, None);
    assert_eq!(normalized(loaded), normalized(chart));
}

#[test]
fn kson_output_is_semantically_stable() {
    let ksh_src = "title=T\nartist=A\neffect=E\nt=150\nm=m.ogg\nver=170\n--\n\
                   zoom_top=50\n\
                   tilt=1.5\n\
                   2000|12|0o\n\
                   0000|10|:-\n\
                   0000|00|o-\n\
                   0000|00|--\n--\n";
    let chart = ksh::load_chart(ksh_src.as_bytes());
    assert_eq!(chart.error, None);

    let first = save_to_string(&chart);
    let reloaded = kson::load_chart(first.as_bytes());
    let second = save_to_string(&reloaded);
    assert_eq!(first, second);
}

#[test]
fn compact_note_forms_are_accepted() {
    let src = r#"{"format_version":1,"note":{"bt":[[0,[240,120]],[],[],[]],"fx":[[480],[]]}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(chart.error, None);
    assert_eq!(chart.note.bt[0].get(&0), Some(&Interval { length: 0 }));
    assert_eq!(chart.note.bt[0].get(&240), Some(&Interval { length: 120 }));
    assert_eq!(chart.note.fx[0].get(&480), Some(&Interval { length: 0 }));
}

#[test]
fn chip_notes_collapse_on_output() {
    let mut chart = ChartData::editor_default();
    chart.note.bt[0].insert(0, Interval { length: 0 });
    chart.note.bt[0].insert(240, Interval { length: 120 });
    let value = kson::chart_to_json_value(&chart);
    assert_eq!(
        value["note"]["bt"],
        json!([[0, [240, 120]], [], [], []])
    );
}

#[test]
fn laser_sections_parse_with_width() {
    let src = r#"{"format_version":1,"note":{"laser":[
        [[0, [[0, 0.0], [240, [0.5, 1.0], [0.2, 0.8]]], 2]],
        []
    ]}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(chart.error, None);

    let section = &chart.note.laser[0][&0];
    assert!(section.wide());
    assert_eq!(section.v[&0].v, GraphValue::new(0.0));
    assert_eq!(section.v[&240].v, GraphValue { v: 0.5, vf: 1.0 });
    assert_eq!(section.v[&240].curve, GraphCurve::new(0.2, 0.8));

    // Width 1 is elided on output
    let value = kson::chart_to_json_value(&chart);
    let lane = &value["note"]["laser"][0][0];
    assert_eq!(lane[2], json!(2));
}

#[test]
fn tilt_forms_parse() {
    let src = r#"{"format_version":1,"camera":{"tilt":[
        [0, "bigger"],
        [100, 1.5],
        [200, [1.0, 2.0]],
        [300, [1.0, "zero"]],
        [400, [1.0, [0.3, 0.7]]],
        [500, [[1.0, 2.0], [0.3, 0.7]]]
    ]}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(chart.error, None);

    assert_eq!(
        chart.camera.tilt[&0],
        TiltValue::Auto(AutoTiltKind::Bigger)
    );
    let TiltValue::Manual(simple) = chart.camera.tilt[&100] else {
        panic!("expected manual tilt");
    };
    assert_eq!((simple.v.v, simple.v.vf), (1.5, TiltVf::Value(1.5)));

    let TiltValue::Manual(transition) = chart.camera.tilt[&200] else {
        panic!("expected manual tilt");
    };
    assert_eq!(transition.v.vf, TiltVf::Value(2.0));

    let TiltValue::Manual(to_auto) = chart.camera.tilt[&300] else {
        panic!("expected manual tilt");
    };
    assert_eq!(to_auto.v.vf, TiltVf::Auto(AutoTiltKind::Zero));

    let TiltValue::Manual(curved) = chart.camera.tilt[&400] else {
        panic!("expected manual tilt");
    };
    assert_eq!(curved.curve, GraphCurve::new(0.3, 0.7));
    assert_eq!(curved.v.vf, TiltVf::Value(1.0));

    let TiltValue::Manual(full) = chart.camera.tilt[&500] else {
        panic!("expected manual tilt");
    };
    assert_eq!(full.v.vf, TiltVf::Value(2.0));
    assert_eq!(full.curve, GraphCurve::new(0.3, 0.7));

    // All forms survive a save/load cycle
    let out = save_to_string(&chart);
    let reloaded = kson::load_chart(out.as_bytes());
    assert_eq!(chart.camera.tilt, reloaded.camera.tilt);
}

#[test]
fn impl_value_passes_through() {
    let src = r#"{"format_version":1,"impl":{"custom":{"x":1}}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(chart.impl_data, json!({"custom":{"x":1}}));

    let value = kson::chart_to_json_value(&chart);
    assert_eq!(value["impl"], json!({"custom":{"x":1}}));
}

#[test]
fn unknown_top_level_keys_are_ignored() {
    let src = r#"{"format_version":1,"future_field":{"a":[1,2,3]},"meta":{"title":"x"}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(chart.error, None);
    assert_eq!(chart.meta.title, "x");
}

#[test]
fn malformed_entries_are_skipped_with_warnings() {
    let src = r#"{"format_version":1,"beat":{"bpm":[[0,120.0],"bogus",[960,180.0]]}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(chart.error, None);
    assert_eq!(chart.beat.bpm.len(), 2);
    assert!(!chart.warnings.is_empty());
}

#[test]
fn scroll_speed_defaults_when_absent() {
    let src = r#"{"format_version":1,"beat":{"bpm":[[0,120.0]]}}"#;
    let chart = kson::load_chart(src.as_bytes());
    assert_eq!(
        chart.beat.scroll_speed.get(&0).map(|p| p.v),
        Some(GraphValue::new(1.0))
    );

    // The all-default graph is elided again on output
    let value = kson::chart_to_json_value(&chart);
    assert!(value["beat"].get("scroll_speed").is_none());
}

#[test]
fn serde_trait_integration() {
    let chart = ChartData::editor_default();
    let text = serde_json::to_string(&chart).unwrap();
    let parsed: ChartData = serde_json::from_str(&text).unwrap();
    assert_eq!(normalized(parsed), normalized(chart));
}
