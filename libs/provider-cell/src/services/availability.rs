use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveTime, Utc};
use tracing::debug;

use crate::models::{
    AvailabilityError, AvailableSlot, BookedInterval, TimeRange, WeeklySchedule,
};

/// Expands a provider's recurring weekly schedule into concrete bookable
/// slots for a requested date.
pub struct AvailabilityService {
    stride_minutes: i64,
}

impl AvailabilityService {
    pub fn new(stride_minutes: i64) -> Self {
        Self { stride_minutes }
    }

    /// Compute the ordered, non-overlapping candidate slots for `date`.
    ///
    /// Slots are generated by walking each configured range in stride-sized
    /// steps. A partial slot that would overflow the range end is discarded,
    /// as is any slot that starts at or before `now` or that overlaps one of
    /// the supplied active appointment intervals. Identical inputs and `now`
    /// always produce identical output.
    pub fn available_slots(
        &self,
        schedule: &WeeklySchedule,
        date: NaiveDate,
        booked: &[BookedInterval],
        now: DateTime<Utc>,
    ) -> Result<Vec<AvailableSlot>, AvailabilityError> {
        let day_of_week = date.weekday().number_from_monday();

        let day = match schedule.day(day_of_week) {
            Some(day) if day.is_available => day,
            _ => {
                debug!("Provider is not available on weekday {}", day_of_week);
                return Ok(Vec::new());
            }
        };

        let stride = Duration::minutes(self.stride_minutes);
        let mut slots = Vec::new();

        for range in &day.time_ranges {
            let (range_start, range_end) = parse_range(range)?;

            let range_start = date.and_time(range_start).and_utc();
            let range_end = date.and_time(range_end).and_utc();

            let mut slot_start = range_start;
            // No slot may overflow its configured range.
            while slot_start + stride <= range_end {
                let slot_end = slot_start + stride;

                let is_past = slot_start <= now;
                let has_conflict = booked.iter().any(|b| {
                    slot_start < b.end_time && b.start_time < slot_end
                });

                if !is_past && !has_conflict {
                    slots.push(AvailableSlot {
                        start_time: slot_start,
                        end_time: slot_end,
                    });
                }

                slot_start += stride;
            }
        }

        slots.sort_by(|a, b| a.start_time.cmp(&b.start_time));

        debug!("Found {} available slots on {}", slots.len(), date);
        Ok(slots)
    }

    /// Start of the first configured range for a weekday, if the provider
    /// works that day. Used for the confirmation-deadline calculation.
    pub fn first_range_start(
        &self,
        schedule: &WeeklySchedule,
        day_of_week: u32,
    ) -> Result<Option<NaiveTime>, AvailabilityError> {
        let day = match schedule.day(day_of_week) {
            Some(day) if day.is_available => day,
            _ => return Ok(None),
        };

        match day.time_ranges.first() {
            Some(range) => {
                let (start, _) = parse_range(range)?;
                Ok(Some(start))
            }
            None => Ok(None),
        }
    }
}

fn parse_range(range: &TimeRange) -> Result<(NaiveTime, NaiveTime), AvailabilityError> {
    let start = parse_hhmm(&range.start)?;
    let end = parse_hhmm(&range.end)?;

    if end <= start {
        return Err(AvailabilityError::Config(format!(
            "range end '{}' is not after start '{}'",
            range.end, range.start
        )));
    }

    Ok((start, end))
}

fn parse_hhmm(value: &str) -> Result<NaiveTime, AvailabilityError> {
    NaiveTime::parse_from_str(value, "%H:%M").map_err(|_| {
        AvailabilityError::Config(format!("'{}' is not a valid HH:MM time", value))
    })
}
