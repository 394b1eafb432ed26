/// Consolidation pressure zones derived from current vocabulary size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Zone {
    Green,
    Watch,
    Danger,
    Emergency,
}

impl Zone {
    pub fn as_str(self) -> &'static str {
        match self {
            Zone::Green => "GREEN",
            Zone::Watch => "WATCH",
            Zone::Danger => "DANGER",
            Zone::Emergency => "EMERGENCY",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ZoneThresholds {
    pub min: usize,
    pub max: usize,
    pub emergency: usize,
    /// Sizes up to `min + safe_band` stay GREEN.
    pub safe_band: usize,
}

impl Default for ZoneThresholds {
    fn default() -> Self {
        Self {
            min: 30,
            max: 90,
            emergency: 200,
            safe_band: 15,
        }
    }
}

impl ZoneThresholds {
    pub fn zone_for(&self, size: usize) -> Zone {
        if size <= self.min + self.safe_band {
            Zone::Green
        } else if size <= self.max {
            Zone::Watch
        } else if size <= self.emergency {
            Zone::Danger
        } else {
            Zone::Emergency
        }
    }
}

/// Shape of the pressure curve mapping vocabulary size to an
/// aggressiveness scalar in [0, 1]. Each profile is a cubic Bézier from
/// (0,0) to (1,1); the control points decide how early pressure builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AggressivenessProfile {
    Conservative,
    #[default]
    Balanced,
    Aggressive,
}

impl AggressivenessProfile {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "conservative" => Some(Self::Conservative),
            "balanced" => Some(Self::Balanced),
            "aggressive" => Some(Self::Aggressive),
            _ => None,
        }
    }

    fn control_points(self) -> ((f64, f64), (f64, f64)) {
        match self {
            Self::Conservative => ((0.6, 0.0), (0.9, 0.4)),
            Self::Balanced => ((0.4, 0.1), (0.7, 0.7)),
            Self::Aggressive => ((0.2, 0.5), (0.5, 0.9)),
        }
    }

    /// A(size): 0 at or below `min`, 1 at or above `emergency`, Bézier
    /// eased in between. Monotone non-decreasing in size.
    pub fn aggressiveness(self, size: usize, thresholds: &ZoneThresholds) -> f64 {
        let min = thresholds.min as f64;
        let emergency = thresholds.emergency as f64;
        if emergency <= min {
            return if (size as f64) >= emergency { 1.0 } else { 0.0 };
        }

        let x = ((size as f64 - min) / (emergency - min)).clamp(0.0, 1.0);
        let ((x1, y1), (x2, y2)) = self.control_points();

        // Invert x(t) by bisection; x(t) is monotone for control x in
        // [0, 1].
        let bezier = |p1: f64, p2: f64, t: f64| -> f64 {
            let u = 1.0 - t;
            3.0 * u * u * t * p1 + 3.0 * u * t * t * p2 + t * t * t
        };

        let mut lo = 0.0f64;
        let mut hi = 1.0f64;
        for _ in 0..32 {
            let mid = (lo + hi) / 2.0;
            if bezier(x1, x2, mid) < x {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        let t = (lo + hi) / 2.0;

        bezier(y1, y2, t).clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zone_boundaries() {
        let thresholds = ZoneThresholds::default();

        assert_eq!(thresholds.zone_for(0), Zone::Green);
        assert_eq!(thresholds.zone_for(30), Zone::Green);
        assert_eq!(thresholds.zone_for(45), Zone::Green);
        assert_eq!(thresholds.zone_for(46), Zone::Watch);
        assert_eq!(thresholds.zone_for(90), Zone::Watch);
        assert_eq!(thresholds.zone_for(91), Zone::Danger);
        assert_eq!(thresholds.zone_for(200), Zone::Danger);
        assert_eq!(thresholds.zone_for(201), Zone::Emergency);
    }

    #[test]
    fn test_aggressiveness_endpoints() {
        let thresholds = ZoneThresholds::default();
        for profile in [
            AggressivenessProfile::Conservative,
            AggressivenessProfile::Balanced,
            AggressivenessProfile::Aggressive,
        ] {
            assert!(profile.aggressiveness(0, &thresholds) < 1e-9);
            assert!(profile.aggressiveness(30, &thresholds) < 1e-9);
            assert!((profile.aggressiveness(200, &thresholds) - 1.0).abs() < 1e-9);
            assert!((profile.aggressiveness(500, &thresholds) - 1.0).abs() < 1e-9);
        }
    }

    #[test]
    fn test_aggressiveness_is_monotone() {
        let thresholds = ZoneThresholds::default();
        for profile in [
            AggressivenessProfile::Conservative,
            AggressivenessProfile::Balanced,
            AggressivenessProfile::Aggressive,
        ] {
            let mut previous = 0.0;
            for size in (30..=200).step_by(5) {
                let value = profile.aggressiveness(size, &thresholds);
                assert!(
                    value + 1e-9 >= previous,
                    "{profile:?} not monotone at size {size}"
                );
                previous = value;
            }
        }
    }

    #[test]
    fn test_profiles_order_by_pressure() {
        let thresholds = ZoneThresholds::default();
        let size = 115; // mid-curve

        let conservative =
            AggressivenessProfile::Conservative.aggressiveness(size, &thresholds);
        let balanced = AggressivenessProfile::Balanced.aggressiveness(size, &thresholds);
        let aggressive = AggressivenessProfile::Aggressive.aggressiveness(size, &thresholds);

        assert!(conservative < balanced);
        assert!(balanced < aggressive);
    }

    #[test]
    fn test_profile_parsing() {
        assert_eq!(
            AggressivenessProfile::parse("Aggressive"),
            Some(AggressivenessProfile::Aggressive)
        );
        assert_eq!(AggressivenessProfile::parse("unknown"), None);
    }
}
