use crate::{ByPulse, ByRelPulse, LaserSection, Pulse, RelPulse};

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GraphValue {
    pub v: f64,
    /// When `vf != v`, the point is an instantaneous transition from `v` to `vf`.
    pub vf: f64,
}

impl GraphValue {
    pub fn new(v: f64) -> Self {
        GraphValue { v, vf: v }
    }

    pub fn with_transition(v: f64, vf: f64) -> Self {
        GraphValue { v, vf }
    }
}

/// Control point of the curve between a point and its successor.
/// `a == b` denotes linear interpolation (including the default `{0, 0}`).
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GraphCurve {
    pub a: f64,
    pub b: f64,
}

impl GraphCurve {
    pub fn new(a: f64, b: f64) -> Self {
        GraphCurve { a, b }
    }

    pub fn is_linear(&self) -> bool {
        self.a == self.b
    }

    pub fn evaluate(&self, x: f64) -> f64 {
        if self.is_linear() {
            x
        } else {
            evaluate_curve(self.a, self.b, x)
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GraphPoint {
    pub v: GraphValue,
    pub curve: GraphCurve,
}

impl GraphPoint {
    pub fn new(v: f64) -> Self {
        GraphPoint {
            v: GraphValue::new(v),
            curve: GraphCurve::default(),
        }
    }

    pub fn from_value(v: GraphValue) -> Self {
        GraphPoint {
            v,
            curve: GraphCurve::default(),
        }
    }

    pub fn with_curve(v: GraphValue, curve: GraphCurve) -> Self {
        GraphPoint { v, curve }
    }
}

/// Global time-indexed curve.
pub type Graph = ByPulse<GraphPoint>;

/// A local graph attached to a parent time point, using relative pulses.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct GraphSection {
    pub v: ByRelPulse<GraphPoint>,
}

/// Quadratic bezier curve evaluation.
/// Curve formula (where 0 <= a, b, x <= 1):
///   f(x) = 2(1-t)tb + t^2
///   t = (a - sqrt(a^2 + x - 2ax)) / (-1 + 2a)
/// This doesn't work when a is near 0.5 (numerator and denominator both
/// approach zero), so the conjugate form is used there:
///   t = x / (a + sqrt(a^2 + x - 2ax))
pub fn evaluate_curve(a: f64, b: f64, x: f64) -> f64 {
    let a = a.clamp(0.0, 1.0);
    let b = b.clamp(0.0, 1.0);
    let x = x.clamp(0.0, 1.0);

    let discriminant = a * a + x - 2.0 * a * x;
    let d_sqrt = if discriminant >= 0.0 {
        discriminant.sqrt()
    } else {
        0.0
    };

    let t = if a < 0.25 {
        (a - d_sqrt) / (-1.0 + 2.0 * a)
    } else {
        x / (a + d_sqrt)
    };

    (2.0 * (1.0 - t) * t * b + t * t).clamp(0.0, 1.0)
}

fn lerp(a: f64, b: f64, t: f64) -> f64 {
    a + (b - a) * t
}

/// Graph value at `pulse`, interpolating from a point's `vf` to the next
/// point's `v` with the point's curve applied.
pub fn graph_value_at(graph: &Graph, pulse: Pulse) -> f64 {
    let Some((y1, point1)) = crate::value_entry_at(graph, pulse) else {
        return graph.values().next().map_or(0.0, |p| p.v.v);
    };

    let Some((y2, point2)) = graph.range(y1 + 1..).next() else {
        return point1.v.vf;
    };

    let segment_length = *y2 - y1;
    if segment_length <= 0 {
        return point2.v.v;
    }

    let lerp_rate = (pulse - y1) as f64 / segment_length as f64;
    let curve_value = point1.curve.evaluate(lerp_rate);
    lerp(point1.v.vf, point2.v.v, curve_value)
}

/// Rewrites a scroll-speed graph so that stop ranges become zero-speed
/// plateaus. Overlapping stop ranges are merged first.
pub fn bake_stop_into_scroll_speed(scroll_speed: &Graph, stop: &ByPulse<RelPulse>) -> Graph {
    if stop.is_empty() {
        return scroll_speed.clone();
    }

    let mut result = scroll_speed.clone();
    if result.is_empty() {
        result.insert(0, GraphPoint::new(1.0));
    }

    let mut merged_ranges: Vec<(Pulse, Pulse)> = Vec::new();
    for (&stop_y, &stop_length) in stop {
        let (start, end) = (stop_y, stop_y + stop_length);
        match merged_ranges.last_mut() {
            Some(last) if last.1 >= start => last.1 = last.1.max(end),
            _ => merged_ranges.push((start, end)),
        }
    }

    for (stop_start, stop_end) in merged_ranges {
        let speed_before = graph_value_at(&result, stop_start);
        let speed_after = graph_value_at(&result, stop_end);

        let inside: Vec<Pulse> = result
            .range(stop_start + 1..stop_end)
            .map(|(y, _)| *y)
            .collect();
        for y in inside {
            result.remove(&y);
        }

        result.insert(
            stop_start,
            GraphPoint::from_value(GraphValue::with_transition(speed_before, 0.0)),
        );
        result.insert(
            stop_end,
            GraphPoint::from_value(GraphValue::with_transition(0.0, speed_after)),
        );
    }

    result
}

/// Common access to the relative-pulse point map of section-like graphs.
pub trait SectionPoints {
    fn points(&self) -> &ByRelPulse<GraphPoint>;
}

impl SectionPoints for GraphSection {
    fn points(&self) -> &ByRelPulse<GraphPoint> {
        &self.v
    }
}

impl SectionPoints for LaserSection {
    fn points(&self) -> &ByRelPulse<GraphPoint> {
        &self.v
    }
}

pub fn graph_section_at<S: SectionPoints>(
    sections: &ByPulse<S>,
    pulse: Pulse,
) -> Option<(Pulse, &S)> {
    if sections.is_empty() {
        return None;
    }
    // The earliest section when pulse precedes all of them
    crate::value_entry_at(sections, pulse)
        .or_else(|| sections.iter().next().map(|(y, s)| (*y, s)))
}

pub fn graph_section_value_at<S: SectionPoints>(
    sections: &ByPulse<S>,
    pulse: Pulse,
) -> Option<f64> {
    let (y, section) = graph_section_at(sections, pulse)?;
    let points = section.points();
    let ry = pulse - y;

    if points.len() <= 1 {
        return None;
    }

    let first_ry = *points.keys().next()?;
    let last_ry = *points.keys().next_back()?;
    if ry < first_ry || ry >= last_ry {
        return None;
    }

    Some(graph_value_at(points, ry))
}

pub fn graph_section_value_at_or_default<S: SectionPoints>(
    sections: &ByPulse<S>,
    pulse: Pulse,
    default: f64,
) -> f64 {
    graph_section_value_at(sections, pulse).unwrap_or(default)
}

pub fn graph_point_at<S: SectionPoints>(sections: &ByPulse<S>, pulse: Pulse) -> Option<GraphPoint> {
    let (y, section) = graph_section_at(sections, pulse)?;
    section.points().get(&(pulse - y)).copied()
}

fn expand_points(points: &ByRelPulse<GraphPoint>, interval: RelPulse) -> ByRelPulse<GraphPoint> {
    assert!(interval > 0);

    let mut result = ByRelPulse::new();
    let entries: Vec<(RelPulse, GraphPoint)> = points.iter().map(|(ry, p)| (*ry, *p)).collect();
    if let Some(&(first_ry, first)) = entries.first() {
        result.insert(first_ry, first);
    }

    for pair in entries.windows(2) {
        let (ry1, point1) = pair[0];
        let (ry2, point2) = pair[1];

        if !point1.curve.is_linear() {
            let segment_length = ry2 - ry1;
            let mut ry = interval;
            while ry < segment_length {
                let lerp_rate = ry as f64 / segment_length as f64;
                let curve_value = point1.curve.evaluate(lerp_rate);
                let value = lerp(point1.v.vf, point2.v.v, curve_value);
                result.insert(ry1 + ry, GraphPoint::new(value));
                ry += interval;
            }
        }

        result.insert(ry2, point2);
    }

    result
}

/// Expands curved segments into linear ones at `interval` pulses.
pub fn expand_graph_curves(graph: &Graph, interval: Pulse) -> Graph {
    if graph.is_empty() {
        return graph.clone();
    }
    expand_points(graph, interval)
}

pub fn expand_section_curves(section: &GraphSection, interval: RelPulse) -> GraphSection {
    if section.v.is_empty() {
        return section.clone();
    }
    GraphSection {
        v: expand_points(&section.v, interval),
    }
}

pub fn expand_laser_curves(section: &LaserSection, interval: RelPulse) -> LaserSection {
    if section.v.is_empty() {
        return section.clone();
    }
    LaserSection {
        v: expand_points(&section.v, interval),
        w: section.w,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linear_curve_is_identity() {
        let curve = GraphCurve::new(0.5, 0.5);
        assert!(curve.is_linear());
        assert_eq!(curve.evaluate(0.25), 0.25);
        assert!(GraphCurve::default().is_linear());
    }

    #[test]
    fn curve_endpoints_are_fixed() {
        for &(a, b) in &[(0.1, 0.9), (0.3, 0.2), (0.8, 0.5), (0.0, 1.0)] {
            assert!(evaluate_curve(a, b, 0.0).abs() < 1e-9);
            assert!((evaluate_curve(a, b, 1.0) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn curve_is_monotone() {
        let mut prev = 0.0;
        for i in 0..=100 {
            let x = i as f64 / 100.0;
            let y = evaluate_curve(0.2, 0.8, x);
            assert!(y + 1e-9 >= prev);
            prev = y;
        }
    }

    #[test]
    fn graph_value_interpolates_from_vf() {
        let mut graph = Graph::new();
        graph.insert(0, GraphPoint::from_value(GraphValue::with_transition(0.0, 1.0)));
        graph.insert(100, GraphPoint::new(2.0));
        assert_eq!(graph_value_at(&graph, 0), 1.0);
        assert!((graph_value_at(&graph, 50) - 1.5).abs() < 1e-9);
        assert_eq!(graph_value_at(&graph, 100), 2.0);
        assert_eq!(graph_value_at(&graph, 500), 2.0);
        assert_eq!(graph_value_at(&graph, -10), 0.0);
    }

    #[test]
    fn stop_bakes_to_zero_plateau() {
        let mut scroll = Graph::new();
        scroll.insert(0, GraphPoint::new(1.0));
        let mut stop = ByPulse::new();
        stop.insert(240, 240);
        let baked = bake_stop_into_scroll_speed(&scroll, &stop);
        assert_eq!(baked[&240].v, GraphValue::with_transition(1.0, 0.0));
        assert_eq!(baked[&480].v, GraphValue::with_transition(0.0, 1.0));
    }

    #[test]
    fn expand_inserts_linear_points() {
        let mut section = GraphSection::default();
        section.v.insert(
            0,
            GraphPoint::with_curve(GraphValue::new(0.0), GraphCurve::new(0.2, 0.8)),
        );
        section.v.insert(120, GraphPoint::new(1.0));
        let expanded = expand_section_curves(&section, 30);
        assert_eq!(expanded.v.len(), 5);
        assert!(expanded.v[&30].curve.is_linear());
        assert_eq!(expanded.v[&120].v.v, 1.0);
    }
}
