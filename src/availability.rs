//! Slot availability over half-open `[start, end)` windows.
//!
//! Two windows overlap when `a.start < b.end && b.start < a.end`, so a booking
//! ending at 11:00 and another starting at 11:00 never collide.

use crate::backend::ParkingBackend;
use crate::error::ParkingError;
use crate::types::Booking;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TimeWindow {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TimeWindow {
    /// Zero-length and inverted windows are invalid input, not "always free".
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, ParkingError> {
        if start >= end {
            return Err(ParkingError::Validation(
                "end time must be after start time".into(),
            ));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    pub fn overlaps(&self, other: &TimeWindow) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn ensure_not_past(&self, now: DateTime<Utc>) -> Result<(), ParkingError> {
        if self.start < now {
            return Err(ParkingError::Validation(
                "booking window starts in the past".into(),
            ));
        }
        Ok(())
    }
}

impl Booking {
    pub fn window(&self) -> TimeWindow {
        TimeWindow {
            start: self.start,
            end: self.end,
        }
    }
}

/// True when none of the active bookings overlaps `window`.
pub fn is_free<'a>(window: &TimeWindow, bookings: impl IntoIterator<Item = &'a Booking>) -> bool {
    !bookings
        .into_iter()
        .any(|booking| booking.is_active() && booking.window().overlaps(window))
}

pub fn is_available<T: ParkingBackend>(
    backend: &T,
    slot_id: i32,
    window: &TimeWindow,
) -> Result<bool, ParkingError> {
    let bookings = backend.active_bookings(slot_id)?;
    Ok(is_free(window, &bookings))
}
