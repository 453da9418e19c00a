//! Clock skew estimation from round-trip timing samples.
//!
//! Every round trip gives a request time `rq` and a reply time `rx` on the local clock and
//!  the remote transmit time `tx` in between. The true skew (remote minus local) lies between
//!  `tx - rx` (lower bound) and `tx - rq` (upper bound). Network delay only ever loosens the
//!  bounds, so the tightest line over all lower bounds (and under all upper bounds) is a robust
//!  estimate of offset and drift. The longest segment of each envelope is that line.

use tracing::trace;

/// measurements an envelope needs before its line is trusted
const STABLE_AFTER_MEASUREMENTS: usize = 50;
/// measurements during which the (often wrong) upper bound is ignored for the raw estimate
const LOWER_BOUND_ONLY_MEASUREMENTS: usize = 10;
const MAX_SEGMENTS: usize = 500;
const MAX_SEGMENT_AGE_SECS: f64 = 60.0 * 60.0;

/// smoothing gains: upward steps are followed quickly, downward ones (usually delay outliers)
///  only slowly
const ALPHA_UP: f64 = 0.5;
const ALPHA_DOWN: f64 = 0.01;


#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Segment {
    pub p1: Point,
    pub p2: Point,
    pub slope: f64,
    pub intercept: f64,
    /// x-extent covered by this segment, summed over everything merged into it
    pub period: f64,
}

impl Segment {
    fn between(p1: Point, p2: Point) -> Option<Segment> {
        if p1.x == p2.x {
            return None;
        }
        let slope = (p2.y - p1.y) / (p2.x - p1.x);
        Some(Segment {
            p1,
            p2,
            slope,
            intercept: p2.y - slope * p2.x,
            period: (p2.x - p1.x).abs(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeSide {
    /// envelope lying above all points, tightest for lower bounds
    Above,
    /// envelope lying below all points, tightest for upper bounds
    Below,
}

/// An immutable piecewise linear envelope. Adding a point produces a new envelope.
#[derive(Debug, Clone, PartialEq)]
pub struct ConvexEnvelope {
    side: EnvelopeSide,
    segments: Vec<Segment>,
    anchor: Option<Point>,
    longest: Option<usize>,
    num_measurements: usize,
}

impl ConvexEnvelope {
    pub fn new(side: EnvelopeSide) -> ConvexEnvelope {
        ConvexEnvelope {
            side,
            segments: Vec::new(),
            anchor: None,
            longest: None,
            num_measurements: 0,
        }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn longest_segment(&self) -> Option<&Segment> {
        self.longest.and_then(|idx| self.segments.get(idx))
    }

    pub fn is_stable(&self) -> bool {
        self.num_measurements > STABLE_AFTER_MEASUREMENTS
    }

    /// `(slope, intercept)` of the longest segment, or a flat line through the only point seen
    pub fn line_estimate(&self) -> (f64, f64) {
        match self.longest_segment() {
            Some(seg) => (seg.slope, seg.intercept),
            None => (0.0, self.anchor.map(|p| p.y).unwrap_or(0.0)),
        }
    }

    pub fn value_at(&self, x: f64) -> f64 {
        let (m, c) = self.line_estimate();
        m * x + c
    }

    /// Returns the envelope extended by `pt`, or `None` if `pt` cannot extend it (same x as the
    ///  previous point). Segments ending before `crop_before` are dropped once the envelope
    ///  grows beyond its size ceiling, but never the longest one.
    pub fn with_point(&self, pt: Point, crop_before: f64) -> Option<ConvexEnvelope> {
        let anchor = match self.anchor {
            None => {
                return Some(ConvexEnvelope {
                    anchor: Some(pt),
                    ..self.clone()
                });
            }
            Some(anchor) => anchor,
        };

        let mut segments = self.segments.clone();
        segments.push(Segment::between(anchor, pt)?);
        let mut segments = merge_back(segments, self.side);

        let mut longest = longest_index(&segments);
        if segments.len() > MAX_SEGMENTS {
            segments = crop_front(segments, longest, crop_before);
            longest = longest_index(&segments);
        }

        Some(ConvexEnvelope {
            side: self.side,
            segments,
            anchor: Some(pt),
            longest,
            num_measurements: self.num_measurements + 1,
        })
    }
}

/// merges the newest segment into its predecessor for as long as their junction violates
///  convexity
fn merge_back(mut segments: Vec<Segment>, side: EnvelopeSide) -> Vec<Segment> {
    while segments.len() > 1 {
        let newest = segments[segments.len() - 1];
        let previous = segments[segments.len() - 2];

        let is_convex = match side {
            EnvelopeSide::Above => newest.slope < previous.slope,
            EnvelopeSide::Below => newest.slope > previous.slope,
        };
        if is_convex {
            break;
        }

        let mut merged = match Segment::between(previous.p1, newest.p2) {
            Some(seg) => seg,
            None => break,
        };
        merged.period = previous.period + newest.period;

        segments.truncate(segments.len() - 2);
        segments.push(merged);
    }
    segments
}

fn longest_index(segments: &[Segment]) -> Option<usize> {
    let mut result: Option<usize> = None;
    for (idx, seg) in segments.iter().enumerate() {
        match result {
            Some(prev) if segments[prev].period >= seg.period => {}
            _ => result = Some(idx),
        }
    }
    result
}

fn crop_front(segments: Vec<Segment>, longest: Option<usize>, crop_before: f64) -> Vec<Segment> {
    let longest = longest.unwrap_or(0);
    let num_droppable = segments.iter()
        .take(longest)
        .take_while(|seg| seg.p2.x < crop_before)
        .count();
    segments.into_iter().skip(num_droppable).collect()
}


/// Detailed output of a single filter update, for diagnostics
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkewEstimate {
    /// the recommended skew (remote clock minus local clock)
    pub skew: f64,
    pub slope: f64,
    pub lower_bound: f64,
    pub upper_bound: f64,
    pub envelope_lower: f64,
    pub envelope_upper: f64,
    pub envelope_estimate: f64,
}

/// Stateful wrapper around two envelopes. Inputs are conditioned by subtracting the first
///  sample's transmit time and skew so that the line fits work on small numbers.
#[derive(Debug, Clone)]
pub struct SkewFilter {
    lower: ConvexEnvelope,
    upper: ConvexEnvelope,
    origin: Option<(f64, f64)>,
    last_value: f64,
    last_time: f64,
    num_measurements: usize,
}

impl Default for SkewFilter {
    fn default() -> Self {
        SkewFilter::new()
    }
}

impl SkewFilter {
    pub fn new() -> SkewFilter {
        SkewFilter {
            lower: ConvexEnvelope::new(EnvelopeSide::Above),
            upper: ConvexEnvelope::new(EnvelopeSide::Below),
            origin: None,
            last_value: 0.0,
            last_time: 0.0,
            num_measurements: 0,
        }
    }

    pub fn num_measurements(&self) -> usize {
        self.num_measurements
    }

    /// most recent output, `None` before the first sample
    pub fn current_skew(&self) -> Option<f64> {
        let (_, skew_origin) = self.origin?;
        Some(self.last_value + skew_origin)
    }

    pub fn update(&mut self, request_time: f64, remote_time: f64, reply_time: f64) -> SkewEstimate {
        let (time_origin, skew_origin) = *self.origin
            .get_or_insert((remote_time, remote_time - reply_time));

        let x = remote_time - time_origin;
        let lower_bound = remote_time - reply_time - skew_origin;
        let upper_bound = remote_time - request_time - skew_origin;

        let crop_before = x - MAX_SEGMENT_AGE_SECS;
        self.lower = self.lower.with_point(Point { x, y: lower_bound }, crop_before)
            .unwrap_or_else(|| ConvexEnvelope::new(EnvelopeSide::Above));
        self.upper = self.upper.with_point(Point { x, y: upper_bound }, crop_before)
            .unwrap_or_else(|| ConvexEnvelope::new(EnvelopeSide::Below));

        let envelope_lower = self.lower.value_at(x);
        let envelope_upper = self.upper.value_at(x);

        let mut estimate = if self.num_measurements < LOWER_BOUND_ONLY_MEASUREMENTS {
            lower_bound
        }
        else {
            (lower_bound + upper_bound) / 2.0
        };
        let mut slope = 0.0;

        if self.lower.is_stable() {
            estimate = envelope_lower;
            slope = self.lower.line_estimate().0;
            if self.upper.is_stable() && envelope_upper >= envelope_lower {
                estimate = (envelope_lower + envelope_upper) / 2.0;
                slope = (self.lower.line_estimate().0 + self.upper.line_estimate().0) / 2.0;
            }
        }
        else if self.upper.is_stable() {
            estimate = envelope_upper;
            slope = self.upper.line_estimate().0;
        }

        let filtered = if (self.lower.is_stable() || self.upper.is_stable()) && self.num_measurements > 0 {
            smooth(x - self.last_time, self.last_value, estimate, slope)
        }
        else {
            estimate
        };

        trace!(lower_bound, upper_bound, envelope_lower, envelope_upper, filtered, "skew filter update");

        self.last_value = filtered;
        self.last_time = x;
        self.num_measurements += 1;

        SkewEstimate {
            skew: filtered + skew_origin,
            slope,
            lower_bound: lower_bound + skew_origin,
            upper_bound: upper_bound + skew_origin,
            envelope_lower: envelope_lower + skew_origin,
            envelope_upper: envelope_upper + skew_origin,
            envelope_estimate: estimate + skew_origin,
        }
    }
}

fn smooth(dt: f64, previous: f64, measured: f64, gradient: f64) -> f64 {
    let predicted = previous + gradient * dt;
    let innovation = measured - predicted;
    let alpha = if innovation > 0.0 { ALPHA_UP } else { ALPHA_DOWN };
    predicted + alpha * innovation
}
