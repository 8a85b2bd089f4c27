use crate::availability::TimeWindow;
use crate::error::ParkingError;
use crate::types::{
    Booking, BookingDetails, CancelOutcome, NewBooking, NewSlot, NewUser, Slot, SlotAvailability,
    SlotChanges, Stats, User,
};
use chrono::{DateTime, Utc};

/// The Data Store. Implementations own their transactions: every method is
/// atomic on its own, and `insert_booking` performs the availability check
/// and the insert as one unit.
pub trait ParkingBackend: Clone + Send + Sync + 'static {
    fn create_user(&self, user: NewUser) -> Result<User, ParkingError>;
    fn user(&self, id: i32) -> Result<User, ParkingError>;
    /// The user and stored password hash for a normalized email.
    fn credentials(&self, email: &str) -> Result<Option<(User, String)>, ParkingError>;
    fn update_password_hash(&self, user_id: i32, password_hash: String)
        -> Result<(), ParkingError>;

    fn slots(&self) -> Result<Vec<Slot>, ParkingError>;
    fn slot(&self, id: i32) -> Result<Slot, ParkingError>;
    fn add_slot(&self, slot: NewSlot) -> Result<Slot, ParkingError>;
    fn update_slot(&self, id: i32, changes: SlotChanges) -> Result<Slot, ParkingError>;
    /// Rejected while the slot has an active booking ending after `now`.
    fn remove_slot(&self, id: i32, now: DateTime<Utc>) -> Result<(), ParkingError>;

    fn active_bookings(&self, slot_id: i32) -> Result<Vec<Booking>, ParkingError>;
    fn search_slots(&self, window: &TimeWindow) -> Result<Vec<SlotAvailability>, ParkingError>;
    fn insert_booking(&self, booking: NewBooking) -> Result<Booking, ParkingError>;
    fn booking(&self, id: i32) -> Result<Booking, ParkingError>;
    fn cancel_booking(&self, id: i32) -> Result<CancelOutcome, ParkingError>;
    fn bookings_of_user(&self, user_id: i32) -> Result<Vec<BookingDetails>, ParkingError>;
    fn all_bookings(&self) -> Result<Vec<BookingDetails>, ParkingError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<Stats, ParkingError>;
}
