//! Current-limit scheduling
//!
//! Turns a requested amperage into the two-period schedule sent with every
//! SetChargingProfile: the clamped request from the start of the schedule,
//! then the standing operating limit after 24 hours.

use crate::ocpp::ChargingSchedulePeriod;

/// Physical ceiling of the charger, in amps
pub const MAX_CURRENT_CHARGER: i32 = 32;

/// Offset of the fallback period (24 h)
pub const FALLBACK_PERIOD_START: i32 = 86_400;

/// What the scheduler did to the requested limit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LimitAdjustment {
    /// Request used as-is (including 0, which means suspend)
    Unchanged,
    /// Nonzero request below the vehicle minimum, snapped up
    RaisedToMinimum,
    /// Request outside `[0, max]`, replaced by the fallback limit
    InvalidFallback,
}

/// One schedule period in whole amps
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SchedulePeriod {
    pub start_offset_secs: i32,
    pub limit_amps: i32,
}

impl From<SchedulePeriod> for ChargingSchedulePeriod {
    fn from(p: SchedulePeriod) -> Self {
        ChargingSchedulePeriod {
            start_period: p.start_offset_secs,
            limit: f64::from(p.limit_amps),
            number_phases: None,
        }
    }
}

/// Result of [`build_schedule`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuiltSchedule {
    pub periods: [SchedulePeriod; 2],
    pub adjustment: LimitAdjustment,
}

impl BuiltSchedule {
    /// Limit in force from the start of the schedule
    pub fn initial_limit(&self) -> i32 {
        self.periods[0].limit_amps
    }

    pub fn is_invalid_request(&self) -> bool {
        self.adjustment == LimitAdjustment::InvalidFallback
    }

    /// Periods in OCPP wire form
    pub fn to_periods(&self) -> Vec<ChargingSchedulePeriod> {
        self.periods.iter().copied().map(Into::into).collect()
    }
}

/// Build the schedule for `requested_amps`.
///
/// Clamping is applied in order:
/// 1. outside `[0, max_current_charger]` -> `fallback_amps`, flagged invalid;
/// 2. `0 < requested < min_current_ev` -> `min_current_ev`;
/// 3. otherwise unchanged.
///
/// The second period always restates `fallback_amps` at the 24 h mark.
pub fn build_schedule(
    requested_amps: i32,
    min_current_ev: i32,
    max_current_charger: i32,
    fallback_amps: i32,
) -> BuiltSchedule {
    let (limit, adjustment) = if requested_amps < 0 || requested_amps > max_current_charger {
        (fallback_amps, LimitAdjustment::InvalidFallback)
    } else if requested_amps > 0 && requested_amps < min_current_ev {
        (min_current_ev, LimitAdjustment::RaisedToMinimum)
    } else {
        (requested_amps, LimitAdjustment::Unchanged)
    };

    BuiltSchedule {
        periods: [
            SchedulePeriod {
                start_offset_secs: 0,
                limit_amps: limit,
            },
            SchedulePeriod {
                start_offset_secs: FALLBACK_PERIOD_START,
                limit_amps: fallback_amps,
            },
        ],
        adjustment,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN_EV: i32 = 6;

    #[test]
    fn test_valid_requests_pass_through() {
        for requested in (MIN_EV..=MAX_CURRENT_CHARGER).chain([0]) {
            let s = build_schedule(requested, MIN_EV, MAX_CURRENT_CHARGER, 16);
            assert_eq!(s.initial_limit(), requested);
            assert_eq!(s.adjustment, LimitAdjustment::Unchanged);
        }
    }

    #[test]
    fn test_low_requests_raised_to_vehicle_minimum() {
        for requested in 1..MIN_EV {
            let s = build_schedule(requested, MIN_EV, MAX_CURRENT_CHARGER, 16);
            assert_eq!(s.initial_limit(), MIN_EV);
            assert_eq!(s.adjustment, LimitAdjustment::RaisedToMinimum);
        }
    }

    #[test]
    fn test_out_of_range_uses_fallback() {
        for requested in [-1, -100, 33, 40, i32::MAX] {
            let s = build_schedule(requested, MIN_EV, MAX_CURRENT_CHARGER, 20);
            assert_eq!(s.initial_limit(), 20);
            assert!(s.is_invalid_request());
        }
    }

    #[test]
    fn test_second_period_restates_fallback() {
        for (requested, fallback) in [(0, 16), (3, 10), (25, 32), (99, 8)] {
            let s = build_schedule(requested, MIN_EV, MAX_CURRENT_CHARGER, fallback);
            assert_eq!(s.periods[1].start_offset_secs, FALLBACK_PERIOD_START);
            assert_eq!(s.periods[1].limit_amps, fallback);
            assert_eq!(s.periods[0].start_offset_secs, 0);
        }
    }

    #[test]
    fn test_wire_periods() {
        let periods = build_schedule(10, MIN_EV, MAX_CURRENT_CHARGER, 16).to_periods();
        assert_eq!(periods.len(), 2);
        assert_eq!(periods[0].limit, 10.0);
        assert_eq!(periods[1].start_period, 86_400);
        assert_eq!(periods[1].limit, 16.0);
    }
}
