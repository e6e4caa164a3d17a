//! Per-tag change detection: deadband/heartbeat gating before a sampled
//! value is allowed onto the telemetry channel (§3, §4.1).

use crate::value::TagValue;

/// Deadband comparison mode for numeric tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeadbandMode {
    Absolute,
    Percent,
}

/// Per-tag change-detection configuration (§3).
#[derive(Debug, Clone)]
pub struct ChangeConfig {
    pub on_change_enabled: bool,
    pub deadband: f64,
    pub deadband_mode: DeadbandMode,
    pub heartbeat_ms: u64,
}

impl Default for ChangeConfig {
    /// Change detection off, so every poll publishes — the safe default for
    /// a tag whose subscription omitted change-detection fields.
    fn default() -> Self {
        Self {
            on_change_enabled: false,
            deadband: 0.0,
            deadband_mode: DeadbandMode::Absolute,
            heartbeat_ms: 0,
        }
    }
}

/// Quality code accompanying a telemetry value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    Good,
    Bad,
}

impl Quality {
    pub fn code(self) -> u8 {
        match self {
            Quality::Good => 0,
            Quality::Bad => 1,
        }
    }
}

/// The last value published for a tag, used to evaluate the next sample.
#[derive(Debug, Clone)]
pub struct LastValue {
    pub value: TagValue,
    pub quality: Quality,
    pub timestamp_ms: u64,
}

/// Evaluates whether a new sample should be published, per the seven-step
/// algorithm in §4.1. Does not mutate any state — the caller updates the
/// last-value record on publish.
pub fn should_publish(
    config: &ChangeConfig,
    last: Option<&LastValue>,
    new_value: &TagValue,
    new_quality: Quality,
    now_ms: u64,
) -> bool {
    if !config.on_change_enabled {
        return true;
    }

    let last = match last {
        None => return true,
        Some(l) => l,
    };

    if last.quality != new_quality {
        return true;
    }

    if config.heartbeat_ms > 0 && now_ms.saturating_sub(last.timestamp_ms) >= config.heartbeat_ms {
        return true;
    }

    let last_is_null = last.value.is_null();
    let new_is_null = new_value.is_null();
    if last_is_null != new_is_null {
        return true;
    }

    if !last_is_null && !new_is_null && last.value.is_numeric() && new_value.is_numeric() {
        let old = last.value.as_f64().unwrap();
        let new = new_value.as_f64().unwrap();

        return if config.deadband > 0.0 {
            match config.deadband_mode {
                DeadbandMode::Percent => {
                    let base = if old != 0.0 { old.abs() } else { 1.0 };
                    let percent_change = ((new - old) / base).abs() * 100.0;
                    percent_change >= config.deadband
                }
                DeadbandMode::Absolute => (new - old).abs() >= config.deadband,
            }
        } else {
            new != old
        };
    }

    new_value != &last.value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn last(value: TagValue, quality: Quality, ts: u64) -> LastValue {
        LastValue {
            value,
            quality,
            timestamp_ms: ts,
        }
    }

    #[test]
    fn change_detection_disabled_always_publishes() {
        let config = ChangeConfig {
            on_change_enabled: false,
            ..ChangeConfig::default()
        };
        let last_value = last(TagValue::Float(10.0), Quality::Good, 0);
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(10.0),
            Quality::Good,
            10,
        ));
    }

    #[test]
    fn first_sample_always_publishes() {
        let config = ChangeConfig {
            on_change_enabled: true,
            ..ChangeConfig::default()
        };
        assert!(should_publish(
            &config,
            None,
            &TagValue::Float(10.0),
            Quality::Good,
            0,
        ));
    }

    #[test]
    fn quality_transition_always_publishes() {
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 0.0,
            ..ChangeConfig::default()
        };
        let last_value = last(TagValue::Float(10.0), Quality::Good, 0);
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(10.0),
            Quality::Bad,
            10,
        ));
    }

    #[test]
    fn heartbeat_forces_publish() {
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 0.0,
            heartbeat_ms: 500,
            ..ChangeConfig::default()
        };
        let last_value = last(TagValue::Float(10.0), Quality::Good, 0);
        assert!(!should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(10.0),
            Quality::Good,
            400,
        ));
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(10.0),
            Quality::Good,
            500,
        ));
    }

    #[test]
    fn scalar_deadband_scenario_from_spec() {
        // §8 scenario 1: values 10.0, 10.2, 10.6, 10.6, 10.6 with absolute
        // deadband 0.5 publish only the 1st and 3rd.
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 0.5,
            deadband_mode: DeadbandMode::Absolute,
            heartbeat_ms: 0,
        };
        let samples = [10.0, 10.2, 10.6, 10.6, 10.6];
        let mut last_value: Option<LastValue> = None;
        let mut publishes = 0;
        for (i, &v) in samples.iter().enumerate() {
            let value = TagValue::Float(v);
            let publish = should_publish(
                &config,
                last_value.as_ref(),
                &value,
                Quality::Good,
                i as u64 * 100,
            );
            if publish {
                publishes += 1;
                last_value = Some(last(value, Quality::Good, i as u64 * 100));
            }
        }
        assert_eq!(publishes, 2);
    }

    #[test]
    fn percent_deadband_uses_unity_base_for_zero() {
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 10.0,
            deadband_mode: DeadbandMode::Percent,
            heartbeat_ms: 0,
        };
        let last_value = last(TagValue::Float(0.0), Quality::Good, 0);
        // delta = |0.05 - 0| / 1 * 100 = 5%, below 10% threshold.
        assert!(!should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(0.05),
            Quality::Good,
            10,
        ));
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(0.2),
            Quality::Good,
            10,
        ));
    }

    #[test]
    fn deadband_zero_requires_exact_match() {
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 0.0,
            deadband_mode: DeadbandMode::Absolute,
            heartbeat_ms: 0,
        };
        let last_value = last(TagValue::Int(5), Quality::Good, 0);
        assert!(!should_publish(
            &config,
            Some(&last_value),
            &TagValue::Int(5),
            Quality::Good,
            10,
        ));
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Int(6),
            Quality::Good,
            10,
        ));
    }

    #[test]
    fn non_numeric_values_compare_by_equality() {
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 1.0,
            deadband_mode: DeadbandMode::Absolute,
            heartbeat_ms: 0,
        };
        let last_value = last(TagValue::Bool(true), Quality::Good, 0);
        assert!(!should_publish(
            &config,
            Some(&last_value),
            &TagValue::Bool(true),
            Quality::Good,
            10,
        ));
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Bool(false),
            Quality::Good,
            10,
        ));
    }

    #[test]
    fn one_sided_null_always_publishes() {
        let config = ChangeConfig {
            on_change_enabled: true,
            deadband: 0.0,
            deadband_mode: DeadbandMode::Absolute,
            heartbeat_ms: 0,
        };
        let last_value = last(TagValue::Null, Quality::Good, 0);
        assert!(should_publish(
            &config,
            Some(&last_value),
            &TagValue::Float(1.0),
            Quality::Good,
            10,
        ));
    }
}
