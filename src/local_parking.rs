use crate::availability::{is_free, TimeWindow};
use crate::backend::ParkingBackend;
use crate::error::ParkingError;
use crate::types::{
    Booking, BookingDetails, BookingStatus, CancelOutcome, NewBooking, NewSlot, NewUser, Slot,
    SlotAvailability, SlotChanges, Stats, User,
};
use chrono::{DateTime, Utc};
use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard},
};
use tracing::{error, warn};

#[derive(Debug, Default)]
struct Tables {
    users: BTreeMap<i32, (User, String)>,
    slots: BTreeMap<i32, Slot>,
    bookings: BTreeMap<i32, Booking>,
    last_user_id: i32,
    last_slot_id: i32,
    last_booking_id: i32,
}

impl Tables {
    fn slot(&self, id: i32) -> Result<&Slot, ParkingError> {
        self.slots
            .get(&id)
            .ok_or_else(|| ParkingError::NotFound(format!("slot {id} does not exist")))
    }

    fn details(&self, booking: &Booking) -> Result<BookingDetails, ParkingError> {
        let slot = self.slot(booking.slot_id)?;
        let (user, _) = self.users.get(&booking.user_id).ok_or_else(|| {
            ParkingError::Storage(format!("booking {} references a missing user", booking.id))
        })?;
        Ok(BookingDetails {
            booking: booking.clone(),
            slot_label: slot.label.clone(),
            user_name: user.name.clone(),
            user_email: user.email.clone(),
        })
    }

    fn label_taken(&self, label: &str, except: Option<i32>) -> bool {
        self.slots
            .values()
            .any(|slot| slot.label == label && Some(slot.id) != except)
    }
}

/// Impersistent store used when no database is configured. A single mutex
/// around all tables makes every operation, including check-then-insert for
/// bookings, atomic.
#[derive(Debug, Clone, Default)]
pub struct LocalParking {
    tables: Arc<Mutex<Tables>>,
}

impl LocalParking {
    fn tables(&self) -> Result<MutexGuard<'_, Tables>, ParkingError> {
        self.tables.lock().map_err(|_| {
            let err = "In-memory tables are poisoned";
            error!(err);
            ParkingError::Storage(err.into())
        })
    }
}

fn newest_first(mut details: Vec<BookingDetails>) -> Vec<BookingDetails> {
    details.sort_unstable_by(|a, b| {
        b.booking
            .created_at
            .cmp(&a.booking.created_at)
            .then(b.booking.id.cmp(&a.booking.id))
    });
    details
}

impl ParkingBackend for LocalParking {
    fn create_user(&self, user: NewUser) -> Result<User, ParkingError> {
        let mut tables = self.tables()?;
        if tables.users.values().any(|(u, _)| u.email == user.email) {
            return Err(ParkingError::Conflict("email is already registered".into()));
        }

        tables.last_user_id += 1;
        let created = User {
            id: tables.last_user_id,
            name: user.name,
            email: user.email,
            role: user.role,
        };
        tables
            .users
            .insert(created.id, (created.clone(), user.password_hash));
        Ok(created)
    }

    fn user(&self, id: i32) -> Result<User, ParkingError> {
        self.tables()?
            .users
            .get(&id)
            .map(|(user, _)| user.clone())
            .ok_or_else(|| ParkingError::NotFound(format!("user {id} does not exist")))
    }

    fn credentials(&self, email: &str) -> Result<Option<(User, String)>, ParkingError> {
        Ok(self
            .tables()?
            .users
            .values()
            .find(|(user, _)| user.email == email)
            .cloned())
    }

    fn update_password_hash(
        &self,
        user_id: i32,
        password_hash: String,
    ) -> Result<(), ParkingError> {
        match self.tables()?.users.get_mut(&user_id) {
            Some((_, hash)) => {
                *hash = password_hash;
                Ok(())
            }
            None => Err(ParkingError::NotFound(format!(
                "user {user_id} does not exist"
            ))),
        }
    }

    fn slots(&self) -> Result<Vec<Slot>, ParkingError> {
        // Keyed by id, so this is creation order
        Ok(self.tables()?.slots.values().cloned().collect())
    }

    fn slot(&self, id: i32) -> Result<Slot, ParkingError> {
        self.tables()?.slot(id).cloned()
    }

    fn add_slot(&self, slot: NewSlot) -> Result<Slot, ParkingError> {
        let mut tables = self.tables()?;
        if tables.label_taken(&slot.label, None) {
            return Err(ParkingError::Conflict(format!(
                "slot label '{}' is already in use",
                slot.label
            )));
        }

        tables.last_slot_id += 1;
        let created = Slot {
            id: tables.last_slot_id,
            label: slot.label,
            is_active: slot.is_active,
        };
        tables.slots.insert(created.id, created.clone());
        Ok(created)
    }

    fn update_slot(&self, id: i32, changes: SlotChanges) -> Result<Slot, ParkingError> {
        let mut tables = self.tables()?;
        if let Some(label) = &changes.label {
            if tables.label_taken(label, Some(id)) {
                return Err(ParkingError::Conflict(format!(
                    "slot label '{label}' is already in use"
                )));
            }
        }

        let slot = tables
            .slots
            .get_mut(&id)
            .ok_or_else(|| ParkingError::NotFound(format!("slot {id} does not exist")))?;
        if let Some(label) = changes.label {
            slot.label = label;
        }
        if let Some(is_active) = changes.is_active {
            slot.is_active = is_active;
        }
        Ok(slot.clone())
    }

    fn remove_slot(&self, id: i32, now: DateTime<Utc>) -> Result<(), ParkingError> {
        let mut tables = self.tables()?;
        tables.slot(id)?;

        let blocking = tables
            .bookings
            .values()
            .filter(|b| b.slot_id == id && b.is_active() && b.end > now)
            .count();
        if blocking > 0 {
            let err = format!("slot {id} still has {blocking} upcoming active booking(s)");
            warn!("{err}");
            return Err(ParkingError::Conflict(err));
        }

        tables.bookings.retain(|_, booking| booking.slot_id != id);
        tables.slots.remove(&id);
        Ok(())
    }

    fn active_bookings(&self, slot_id: i32) -> Result<Vec<Booking>, ParkingError> {
        let tables = self.tables()?;
        tables.slot(slot_id)?;
        Ok(tables
            .bookings
            .values()
            .filter(|b| b.slot_id == slot_id && b.is_active())
            .cloned()
            .collect())
    }

    fn search_slots(&self, window: &TimeWindow) -> Result<Vec<SlotAvailability>, ParkingError> {
        let tables = self.tables()?;
        let results: Vec<SlotAvailability> = tables
            .slots
            .values()
            .filter(|slot| slot.is_active)
            .map(|slot| SlotAvailability {
                slot: slot.clone(),
                available: is_free(
                    window,
                    tables.bookings.values().filter(|b| b.slot_id == slot.id),
                ),
            })
            .collect();
        Ok(results)
    }

    fn insert_booking(&self, booking: NewBooking) -> Result<Booking, ParkingError> {
        let mut tables = self.tables()?;
        if !tables.users.contains_key(&booking.user_id) {
            return Err(ParkingError::NotFound(format!(
                "user {} does not exist",
                booking.user_id
            )));
        }
        let slot = tables.slot(booking.slot_id)?;
        if !slot.is_active {
            return Err(ParkingError::Conflict(format!(
                "slot {} is not active",
                slot.label
            )));
        }

        let taken = !is_free(
            &booking.window,
            tables
                .bookings
                .values()
                .filter(|b| b.slot_id == booking.slot_id),
        );
        if taken {
            return Err(ParkingError::Conflict(
                "slot is unavailable for the requested window".into(),
            ));
        }

        tables.last_booking_id += 1;
        let created = Booking {
            id: tables.last_booking_id,
            user_id: booking.user_id,
            slot_id: booking.slot_id,
            start: booking.window.start(),
            end: booking.window.end(),
            status: BookingStatus::Active,
            amount: booking.amount,
            created_at: booking.created_at,
        };
        tables.bookings.insert(created.id, created.clone());
        Ok(created)
    }

    fn booking(&self, id: i32) -> Result<Booking, ParkingError> {
        self.tables()?
            .bookings
            .get(&id)
            .cloned()
            .ok_or_else(|| ParkingError::NotFound(format!("booking {id} does not exist")))
    }

    fn cancel_booking(&self, id: i32) -> Result<CancelOutcome, ParkingError> {
        let mut tables = self.tables()?;
        let booking = tables
            .bookings
            .get_mut(&id)
            .ok_or_else(|| ParkingError::NotFound(format!("booking {id} does not exist")))?;

        match booking.status {
            BookingStatus::Cancelled => Ok(CancelOutcome::AlreadyCancelled),
            BookingStatus::Active => {
                booking.status = BookingStatus::Cancelled;
                Ok(CancelOutcome::Cancelled)
            }
        }
    }

    fn bookings_of_user(&self, user_id: i32) -> Result<Vec<BookingDetails>, ParkingError> {
        let tables = self.tables()?;
        let details = tables
            .bookings
            .values()
            .filter(|b| b.user_id == user_id)
            .map(|b| tables.details(b))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(newest_first(details))
    }

    fn all_bookings(&self) -> Result<Vec<BookingDetails>, ParkingError> {
        let tables = self.tables()?;
        let details = tables
            .bookings
            .values()
            .map(|b| tables.details(b))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(newest_first(details))
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<Stats, ParkingError> {
        let tables = self.tables()?;
        let count = |n: usize| n as i64;
        Ok(Stats {
            total_slots: count(tables.slots.len()),
            active_slots: count(tables.slots.values().filter(|s| s.is_active).count()),
            users: count(tables.users.len()),
            total_bookings: count(tables.bookings.len()),
            upcoming_bookings: count(
                tables
                    .bookings
                    .values()
                    .filter(|b| b.is_active() && b.end >= now)
                    .count(),
            ),
        })
    }
}
