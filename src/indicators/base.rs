//! Base indicator reducers. Each one consumes the ring buffer for its lane
//! and produces the next incremental value; none re-scan more history than
//! their own declared window.

use std::collections::VecDeque;

use crate::models::Tick;

/// One buffered print plus the indicator's running value at that point —
/// a lane's ring buffer holds these, trimmed to the variant's window.
#[derive(Debug, Clone, Copy)]
pub struct BufferedTick {
    pub timestamp_millis: i64,
    pub price: f64,
    pub volume: f64,
}

impl From<&Tick> for BufferedTick {
    fn from(t: &Tick) -> Self {
        Self {
            timestamp_millis: t.timestamp.timestamp_millis(),
            price: t.price,
            volume: t.volume,
        }
    }
}

/// Time-weighted price average over the variant's window.
pub fn twpa(buffer: &VecDeque<BufferedTick>) -> f64 {
    if buffer.len() < 2 {
        return buffer.back().map(|t| t.price).unwrap_or(f64::NAN);
    }
    let mut weighted_sum = 0.0;
    let mut total_weight = 0.0;
    for pair in buffer.make_contiguous().windows(2) {
        let (a, b) = (pair[0], pair[1]);
        let dt = (b.timestamp_millis - a.timestamp_millis).max(0) as f64;
        weighted_sum += a.price * dt;
        total_weight += dt;
    }
    if total_weight <= 0.0 {
        buffer.back().map(|t| t.price).unwrap_or(f64::NAN)
    } else {
        weighted_sum / total_weight
    }
}

/// Price velocity: linear rate of change over the window, in price units
/// per second.
pub fn velocity(buffer: &VecDeque<BufferedTick>) -> f64 {
    let (first, last) = match (buffer.front(), buffer.back()) {
        (Some(f), Some(l)) if f.timestamp_millis != l.timestamp_millis => (f, l),
        _ => return 0.0,
    };
    let dt_seconds = (last.timestamp_millis - first.timestamp_millis) as f64 / 1000.0;
    (last.price - first.price) / dt_seconds
}

/// Ratio of the most recent volume to the window's mean volume. A value
/// well above 1.0 signals a volume surge.
pub fn volume_surge_ratio(buffer: &VecDeque<BufferedTick>) -> f64 {
    if buffer.is_empty() {
        return f64::NAN;
    }
    let mean: f64 = buffer.iter().map(|t| t.volume).sum::<f64>() / buffer.len() as f64;
    if mean <= 0.0 {
        return f64::NAN;
    }
    buffer.back().map(|t| t.volume).unwrap_or(0.0) / mean
}

/// Cumulative percentage move from the oldest buffered price to the
/// newest, the core "pump magnitude" signal.
pub fn pump_magnitude(buffer: &VecDeque<BufferedTick>) -> f64 {
    let (first, last) = match (buffer.front(), buffer.back()) {
        (Some(f), Some(l)) => (f, l),
        _ => return 0.0,
    };
    if first.price <= 0.0 {
        return f64::NAN;
    }
    (last.price - first.price) / first.price * 100.0
}

pub fn dispatch(base_type: &str, buffer: &VecDeque<BufferedTick>) -> Option<f64> {
    match base_type {
        "TWPA" => Some(twpa(buffer)),
        "VELOCITY" => Some(velocity(buffer)),
        "VOLUME_SURGE_RATIO" => Some(volume_surge_ratio(buffer)),
        "PUMP_MAGNITUDE" => Some(pump_magnitude(buffer)),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buf(points: &[(i64, f64, f64)]) -> VecDeque<BufferedTick> {
        points
            .iter()
            .map(|(t, p, v)| BufferedTick {
                timestamp_millis: *t,
                price: *p,
                volume: *v,
            })
            .collect()
    }

    #[test]
    fn pump_magnitude_is_percent_change_from_oldest_to_newest() {
        let buffer = buf(&[(0, 100.0, 1.0), (1000, 110.0, 1.0)]);
        assert!((pump_magnitude(&buffer) - 10.0).abs() < 1e-9);
    }

    #[test]
    fn velocity_is_zero_for_a_single_point() {
        let buffer = buf(&[(0, 100.0, 1.0)]);
        assert_eq!(velocity(&buffer), 0.0);
    }

    #[test]
    fn volume_surge_ratio_reflects_spike_over_mean() {
        let buffer = buf(&[(0, 100.0, 1.0), (1000, 100.0, 1.0), (2000, 100.0, 4.0)]);
        assert!((volume_surge_ratio(&buffer) - 2.0).abs() < 1e-9);
    }
}
