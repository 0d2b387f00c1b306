use kson_chart::camera::{TiltValue, TiltVf};
use kson_chart::{ksh, kson, ChartData, GraphCurve, GraphValue, Interval};
use pretty_assertions::assert_eq;
use serde_json::json;

fn ksh_bytes(header_extra: &str, body: &str) -> Vec<u8> {
    format!(
        "title=Test Chart\n\
         artist=Someone\n\
         effect=Charter\n\
         jacket=jacket.png\n\
         illustrator=Artist\n\
         difficulty=extended\n\
         level=7\n\
         t=120\n\
         m=song.ogg\n\
         o=0\n\
         {header_extra}--\n{body}"
    )
    .into_bytes()
}

fn normalized(mut chart: ChartData) -> ChartData {
    chart.warnings.clear();
    chart
}

fn save_to_string(chart: &ChartData) -> String {
    let mut out = Vec::new();
    ksh::save_chart(&mut out, chart).unwrap();
    String::from_utf8_lossy(&out).into_owned()
}

#[test]
fn chip_bt_round_trip() {
    let bytes = ksh_bytes("", "1000|00|--\n0000|00|--\n0000|00|--\n0000|00|--\n--\n");
    let chart = ksh::load_chart(&bytes);
    assert_eq!(chart.error, None);

    assert_eq!(chart.note.bt[0].len(), 1);
    assert_eq!(chart.note.bt[0].get(&0), Some(&Interval { length: 0 }));
    for lane in &chart.note.bt[1..] {
        assert!(lane.is_empty());
    }
    assert!(chart.note.fx.iter().all(|lane| lane.is_empty()));

    let out = save_to_string(&chart);
    let reloaded = ksh::load_chart(out.as_bytes());
    assert_eq!(reloaded.error, None);
    assert_eq!(normalized(chart), normalized(reloaded));
}

#[test]
fn laser_slam_inference() {
    // Laser moves 0 -> 1 across two adjacent 1/32 lines: read back as one slam
    let mut body = String::from("0000|00|0-\n0000|00|o-\n");
    body.push_str(&"0000|00|:-\n".repeat(30));
    body.push_str("--\n");
    let chart = ksh::load_chart(&ksh_bytes("", &body));
    assert_eq!(chart.error, None);

    assert_eq!(chart.note.laser[0].len(), 1);
    let section = &chart.note.laser[0][&0];
    assert_eq!(section.v.len(), 1);
    assert_eq!(
        section.v[&0].v,
        GraphValue { v: 0.0, vf: 1.0 },
        "the point pair must merge into a single slam"
    );
    assert!(!section.wide());

    // A slam survives the round trip unchanged
    let out = save_to_string(&chart);
    let reloaded = ksh::load_chart(out.as_bytes());
    assert_eq!(chart.note.laser, reloaded.note.laser);
}

#[test]
fn bpm_clamped_at_ver_130() {
    let bytes = "title=T\nartist=A\neffect=E\nt=100000\nver=130\n--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(bytes.as_bytes());
    assert_eq!(chart.error, None);
    assert_eq!(chart.beat.bpm.get(&0), Some(&65535.0));
}

#[test]
fn bpm_unclamped_with_ver_compat_120() {
    let bytes = "title=T\nartist=A\neffect=E\nt=100000\nver=160\nver_compat=120\n--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(bytes.as_bytes());
    assert_eq!(chart.error, None);
    assert_eq!(chart.compat.ksh_version, "120");
    assert_eq!(chart.beat.bpm.get(&0), Some(&100000.0));

    // Still unclamped after a save/load cycle
    let out = save_to_string(&chart);
    assert!(out.contains("ver=160\r\n"));
    assert!(out.contains("ver_compat=120\r\n"));
    let reloaded = ksh::load_chart(out.as_bytes());
    assert_eq!(reloaded.beat.bpm.get(&0), Some(&100000.0));
}

#[test]
fn preset_fx_param_change() {
    let body = "fx:Retrigger:waveLength=1/8\n0000|00|--\n0000|00|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    assert_eq!(chart.error, None);

    let changes = &chart.audio.audio_effect.fx.param_change["retrigger"]["wave_length"];
    assert_eq!(changes.len(), 1);
    assert_eq!(changes.get(&0), Some(&"1/8".to_owned()));

    let out = save_to_string(&chart);
    assert!(out.contains("fx:Retrigger:waveLength=1/8\r\n"));
}

#[test]
fn tilt_manual_with_curve() {
    let body = "tilt_curve=0.1;0.5\n\
                tilt=0.0\n\
                0000|00|--\n0000|00|--\n0000|00|--\n0000|00|--\n\
                tilt=5.0\n\
                0000|00|--\n0000|00|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("ver=170\n", body));
    assert_eq!(chart.error, None);

    let TiltValue::Manual(first) = chart.camera.tilt[&0] else {
        panic!("first tilt point must be manual");
    };
    assert_eq!(first.v.v, 0.0);
    assert_eq!(first.v.vf, TiltVf::Value(0.0));
    assert_eq!(first.curve, GraphCurve::new(0.1, 0.5));

    let TiltValue::Manual(second) = chart.camera.tilt[&480] else {
        panic!("second tilt point must be manual");
    };
    assert_eq!(second.v.v, 5.0);
    assert_eq!(second.v.vf, TiltVf::Value(5.0));
    assert!(second.curve.is_linear());

    let value = kson::chart_to_json_value(&chart);
    assert_eq!(
        value["camera"]["tilt"],
        json!([[0, [0.0, [0.1, 0.5]]], [480, 5.0]])
    );
}

#[test]
fn spin_suffix() {
    let body = "0000|00|--@)192\n0000|00|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    assert_eq!(chart.error, None);

    let spin = &chart.camera.cam.pattern.laser.slam_event.spin[&0];
    assert_eq!(spin.d, 1);
    assert_eq!(spin.length, 960);

    let out = save_to_string(&chart);
    assert!(out.contains("@)192\r\n"));
}

#[test]
fn swing_suffix_with_params() {
    let body = "0000|00|--S<96;300;4;1\n0000|00|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    let swing = &chart.camera.cam.pattern.laser.slam_event.swing[&0];
    assert_eq!(swing.d, -1);
    assert_eq!(swing.length, 480);
    assert_eq!(swing.v.scale, 300.0);
    assert_eq!(swing.v.repeat, 4);
    assert_eq!(swing.v.decay_order, 1);

    let out = save_to_string(&chart);
    assert!(out.contains("S<96;300;4;1\r\n"));
}

#[test]
fn unknown_option_preserved() {
    let body = "0000|00|--\n0000|00|--\nfoo=bar\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    assert_eq!(chart.error, None);
    assert_eq!(
        chart.compat.ksh_unknown.option["foo"][&480],
        vec!["bar".to_owned()]
    );

    let out = save_to_string(&chart);
    let reloaded = ksh::load_chart(out.as_bytes());
    assert_eq!(
        reloaded.compat.ksh_unknown.option["foo"][&480],
        vec!["bar".to_owned()]
    );
}

#[test]
fn unknown_meta_preserved() {
    let chart = ksh::load_chart(&ksh_bytes("custom_key=value\n", "0000|00|--\n--\n"));
    assert_eq!(
        chart.compat.ksh_unknown.meta.get("custom_key"),
        Some(&"value".to_owned())
    );
    let out = save_to_string(&chart);
    assert!(out.contains("custom_key=value\r\n"));
}

#[test]
fn long_notes_and_wide_laser() {
    let body = "laserrange_l=2x\n\
                fx-l=Retrigger;8\n\
                2000|10|0-\n\
                2000|10|:-\n\
                0000|00|C-\n\
                0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("ver=170\n", body));
    assert_eq!(chart.error, None);

    // Long BT on lane 0 spans two of the four lines
    assert_eq!(chart.note.bt[0].get(&0), Some(&Interval { length: 480 }));

    // Long FX with an explicit effect annotation
    assert_eq!(chart.note.fx[0].get(&0), Some(&Interval { length: 480 }));
    let long_event = &chart.audio.audio_effect.fx.long_event["retrigger"][0];
    assert_eq!(
        long_event[&0].get("wave_length"),
        Some(&"1/8".to_owned())
    );

    // Wide laser with the 2x center position
    let section = &chart.note.laser[0][&0];
    assert!(section.wide());
    assert_eq!(section.v[&0].v, GraphValue::new(0.0));
    assert_eq!(section.v[&480].v, GraphValue::new(0.25));

    let out = save_to_string(&chart);
    assert!(out.contains("laserrange_l=2x\r\n"));
    assert!(out.contains("fx-l=Retrigger;8\r\n"));
    let reloaded = ksh::load_chart(out.as_bytes());
    assert_eq!(normalized(chart), normalized(reloaded));
}

#[test]
fn legacy_fx_chars_publish_per_line() {
    let body = "0000|F0|--\n0000|F0|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    assert_eq!(chart.error, None);

    assert_eq!(chart.note.fx[0].get(&0), Some(&Interval { length: 480 }));
    let long_event = &chart.audio.audio_effect.fx.long_event["flanger"][0];
    assert!(long_event.contains_key(&0));
    assert!(long_event.contains_key(&240));

    let out = save_to_string(&chart);
    let reloaded = ksh::load_chart(out.as_bytes());
    assert_eq!(chart.note.fx, reloaded.note.fx);
    assert_eq!(
        chart.audio.audio_effect.fx.long_event,
        reloaded.audio.audio_effect.fx.long_event
    );
}

#[test]
fn stop_and_zoom_transitions() {
    let body = "stop=48\n\
                zoom_top=10\n\
                zoom_top=20\n\
                0000|00|--\n0000|00|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("ver=170\n", body));
    assert_eq!(chart.beat.stop.get(&0), Some(&240));
    assert_eq!(
        chart.camera.cam.body.zoom_top[&0].v,
        GraphValue { v: 10.0, vf: 20.0 }
    );

    let out = save_to_string(&chart);
    assert!(out.contains("stop=48\r\n"));
    assert!(out.contains("zoom_top=10\r\nzoom_top=20\r\n"));
}

#[test]
fn out_of_range_legacy_zoom_dropped() {
    // Format versions before 167 cap zooms at 300
    let body = "zoom_top=500\n0000|00|--\n0000|00|--\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    assert!(chart.camera.cam.body.zoom_top.is_empty());

    let in_range = "zoom_top=300\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", in_range));
    assert_eq!(chart.camera.cam.body.zoom_top[&0].v, GraphValue::new(300.0));
}

#[test]
fn missing_bar_line_is_fatal() {
    let chart = ksh::load_chart(b"title=T\nartist=A\n");
    assert_eq!(chart.error, Some(kson_chart::ChartError::GeneralChartFormat));
}

#[test]
fn missing_title_is_fatal() {
    let chart = ksh::load_chart(b"artist=A\n--\n0000|00|--\n--\n");
    assert_eq!(chart.error, Some(kson_chart::ChartError::GeneralChartFormat));
}

#[test]
fn meta_only_loading() {
    let meta = ksh::load_meta(&ksh_bytes("po=1000\nplength=5000\n", "0000|00|--\n--\n"));
    assert_eq!(meta.error, None);
    assert_eq!(meta.meta.title, "Test Chart");
    assert_eq!(meta.meta.level, 7);
    assert_eq!(meta.audio.bgm.filename, "song.ogg");
    assert_eq!(meta.audio.bgm.preview.offset, 1000);
    assert_eq!(meta.audio.bgm.preview.duration, 5000);
}

#[test]
fn utf8_bom_is_consumed() {
    let mut bytes = vec![0xEF, 0xBB, 0xBF];
    bytes.extend_from_slice(&ksh_bytes("", "1000|00|--\n--\n"));
    let chart = ksh::load_chart(&bytes);
    assert_eq!(chart.error, None);
    assert_eq!(chart.meta.title, "Test Chart");
    assert_eq!(chart.note.bt[0].len(), 1);
}

#[test]
fn comments_attach_to_their_line() {
    let body = "//first\n0000|00|--\n0000|00|--\n//later\n0000|00|--\n0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    assert_eq!(chart.editor.comment[&0], vec!["first".to_owned()]);
    assert_eq!(chart.editor.comment[&480], vec!["later".to_owned()]);

    let out = save_to_string(&chart);
    assert!(out.contains("//first\r\n"));
    assert!(out.contains("//later\r\n"));
}

#[test]
fn define_fx_lines_build_definitions() {
    let body = "#define_fx MyRT type=Retrigger;waveLength=1/6;rate=80%\n\
                0000|00|--\n--\n";
    let chart = ksh::load_chart(&ksh_bytes("", body));
    let (name, def) = &chart.audio.audio_effect.fx.def[0];
    assert_eq!(name, "MyRT");
    assert_eq!(def.kind, kson_chart::effects::AudioEffectKind::Retrigger);
    assert_eq!(def.v.get("wave_length"), Some(&"1/6".to_owned()));
    assert_eq!(def.v.get("rate"), Some(&"80%".to_owned()));

    let out = save_to_string(&chart);
    assert!(out.contains("#define_fx MyRT type=Retrigger;rate=80%;waveLength=1/6\r\n"));
}

#[test]
fn double_round_trip_is_stable() {
    let body = "tilt_curve=0.1;0.5\n\
                tilt=0.0\n\
                laserrange_r=2x\n\
                fx-l=Echo;4;70\n\
                2100|10|-0\n\
                0000|10|-:\n\
                foo=bar\n\
                0000|20|-o\n\
                0000|00|--@<48\n--\n\
                beat=3/4\n\
                0000|00|--\n\
                stop=96\n\
                0000|00|--\n\
                0000|00|--\n--\n";
    let chart1 = ksh::load_chart(&ksh_bytes("ver=170\n", body));
    assert_eq!(chart1.error, None);

    let out = save_to_string(&chart1);
    let chart2 = ksh::load_chart(out.as_bytes());
    assert_eq!(chart2.error, None);

    let json1 = kson::chart_to_json_value(&chart1);
    let json2 = kson::chart_to_json_value(&chart2);
    assert_json_diff::assert_json_eq!(json1, json2);
}
