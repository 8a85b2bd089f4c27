use crate::auth::RequestContext;
use crate::availability::{self, TimeWindow};
use crate::backend::ParkingBackend;
use crate::error::{AuthError, ParkingError};
use crate::types::{
    Booking, BookingDetails, CancelOutcome, NewBooking, NewSlot, Role, Slot, SlotAvailability,
    SlotChanges, Stats,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub const MAX_LABEL_LENGTH: usize = 32;

/// Counters shown to everybody, without user numbers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Overview {
    pub active_slots: i64,
    pub total_bookings: i64,
    pub upcoming_bookings: i64,
}

/// Price of a window: the hourly rate for every started hour, at least one.
pub fn price(window: &TimeWindow, hourly_rate: i64) -> i64 {
    let seconds = window.duration().num_seconds();
    let hours = ((seconds + 3599) / 3600).max(1);
    hourly_rate * hours
}

fn normalize_label(label: &str) -> Result<String, ParkingError> {
    let label = label.trim();
    if label.is_empty() || label.chars().count() > MAX_LABEL_LENGTH {
        return Err(ParkingError::Validation(format!(
            "slot label must be between 1 and {MAX_LABEL_LENGTH} characters"
        )));
    }
    Ok(label.into())
}

#[derive(Debug, Clone)]
pub struct BookingManager<T: ParkingBackend> {
    backend: T,
    hourly_rate: i64,
}

impl<T: ParkingBackend> BookingManager<T> {
    pub fn new(backend: T, hourly_rate: i64) -> Self {
        Self {
            backend,
            hourly_rate,
        }
    }

    pub fn search_slots(&self, window: &TimeWindow) -> Result<Vec<SlotAvailability>, ParkingError> {
        self.backend.search_slots(window)
    }

    pub fn is_available(&self, slot_id: i32, window: &TimeWindow) -> Result<bool, ParkingError> {
        availability::is_available(&self.backend, slot_id, window)
    }

    /// The store re-checks availability inside the same transaction as the
    /// insert, so two racing requests cannot both succeed.
    pub fn create_booking(
        &self,
        context: &RequestContext,
        slot_id: i32,
        window: TimeWindow,
    ) -> Result<Booking, ParkingError> {
        context.require(Role::Customer)?;
        let now = Utc::now();
        window.ensure_not_past(now)?;

        let result = self.backend.insert_booking(NewBooking {
            user_id: context.user_id,
            slot_id,
            window,
            amount: price(&window, self.hourly_rate),
            created_at: now,
        });

        match &result {
            Ok(booking) => info!(
                booking_id = booking.id,
                slot_id,
                user_id = context.user_id,
                "Booking created"
            ),
            Err(ParkingError::Conflict(err)) => {
                warn!(slot_id, user_id = context.user_id, %err, "Booking rejected")
            }
            Err(_) => {}
        }
        result
    }

    pub fn cancel_booking(
        &self,
        context: &RequestContext,
        booking_id: i32,
    ) -> Result<CancelOutcome, ParkingError> {
        let booking = self.backend.booking(booking_id)?;
        if booking.user_id != context.user_id && !context.is_admin() {
            warn!(booking_id, user_id = context.user_id, "Cancellation of foreign booking");
            return Err(AuthError::Forbidden("booking belongs to another user".into()).into());
        }

        let outcome = self.backend.cancel_booking(booking_id)?;
        if outcome == CancelOutcome::Cancelled {
            info!(booking_id, user_id = context.user_id, "Booking cancelled");
        }
        Ok(outcome)
    }

    pub fn my_bookings(&self, context: &RequestContext) -> Result<Vec<BookingDetails>, ParkingError> {
        self.backend.bookings_of_user(context.user_id)
    }

    pub fn all_bookings(&self, context: &RequestContext) -> Result<Vec<BookingDetails>, ParkingError> {
        context.require(Role::Admin)?;
        self.backend.all_bookings()
    }

    pub fn slots(&self, context: &RequestContext) -> Result<Vec<Slot>, ParkingError> {
        context.require(Role::Admin)?;
        self.backend.slots()
    }

    pub fn create_slot(
        &self,
        context: &RequestContext,
        label: &str,
        is_active: bool,
    ) -> Result<Slot, ParkingError> {
        context.require(Role::Admin)?;
        let slot = self.backend.add_slot(NewSlot {
            label: normalize_label(label)?,
            is_active,
        })?;
        info!(slot_id = slot.id, label = %slot.label, "Slot created");
        Ok(slot)
    }

    pub fn update_slot(
        &self,
        context: &RequestContext,
        slot_id: i32,
        changes: SlotChanges,
    ) -> Result<Slot, ParkingError> {
        context.require(Role::Admin)?;
        if changes.is_empty() {
            return Err(ParkingError::Validation("no slot changes supplied".into()));
        }

        let changes = SlotChanges {
            label: changes.label.as_deref().map(normalize_label).transpose()?,
            is_active: changes.is_active,
        };
        let slot = self.backend.update_slot(slot_id, changes)?;
        info!(slot_id, label = %slot.label, is_active = slot.is_active, "Slot updated");
        Ok(slot)
    }

    pub fn delete_slot(&self, context: &RequestContext, slot_id: i32) -> Result<(), ParkingError> {
        context.require(Role::Admin)?;
        self.backend.remove_slot(slot_id, Utc::now())?;
        info!(slot_id, "Slot deleted");
        Ok(())
    }

    pub fn stats(&self, context: &RequestContext) -> Result<Stats, ParkingError> {
        context.require(Role::Admin)?;
        self.backend.stats(Utc::now())
    }

    pub fn overview(&self) -> Result<Overview, ParkingError> {
        let stats = self.backend.stats(Utc::now())?;
        Ok(Overview {
            active_slots: stats.active_slots,
            total_bookings: stats.total_bookings,
            upcoming_bookings: stats.upcoming_bookings,
        })
    }

    /// Seeds `Slot 1..=count` into an empty slot table.
    pub fn ensure_slots(&self, count: u32) -> Result<(), ParkingError> {
        if !self.backend.slots()?.is_empty() {
            return Ok(());
        }
        for number in 1..=count {
            self.backend.add_slot(NewSlot {
                label: format!("Slot {number}"),
                is_active: true,
            })?;
        }
        info!(count, "Seeded parking slots");
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::local_parking::LocalParking;
    use crate::testutils::{at, context, seed_admin, seed_customer, window};
    use crate::types::{BookingStatus, User};
    use chrono::Duration;
    use std::sync::{Arc, Barrier};
    use test_case::test_case;

    struct Fixture {
        manager: BookingManager<LocalParking>,
        backend: LocalParking,
        customer: User,
        admin: User,
        slot: Slot,
    }

    fn fixture() -> Fixture {
        let backend = LocalParking::default();
        let manager = BookingManager::new(backend.clone(), 20);
        let customer = seed_customer(&backend, "Stefan");
        let admin = seed_admin(&backend);
        let slot = manager.create_slot(&context(&admin), "S1", true).unwrap();
        Fixture {
            manager,
            backend,
            customer,
            admin,
            slot,
        }
    }

    fn assert_no_overlapping_active_bookings(backend: &LocalParking, slot_id: i32) {
        let active = backend.active_bookings(slot_id).unwrap();
        for (i, a) in active.iter().enumerate() {
            for b in active.iter().skip(i + 1) {
                assert!(
                    !a.window().overlaps(&b.window()),
                    "bookings {} and {} overlap",
                    a.id,
                    b.id
                );
            }
        }
    }

    #[test_case(30, 20 ; "half an hour costs a full hour")]
    #[test_case(60, 20 ; "exactly one hour")]
    #[test_case(61, 40 ; "a started hour counts")]
    #[test_case(180, 60 ; "three hours")]
    fn test_price(minutes: i64, expected: i64) {
        let start = at(10);
        let window = TimeWindow::new(start, start + Duration::minutes(minutes)).unwrap();
        assert_eq!(price(&window, 20), expected);
    }

    #[test]
    fn test_booking_scenario() {
        let f = fixture();
        let ctx = context(&f.customer);

        let a = f.manager.create_booking(&ctx, f.slot.id, window(10, 11)).unwrap();
        assert_eq!(a.amount, 20);
        assert_eq!(a.status, BookingStatus::Active);

        let half_past = Duration::minutes(30);
        let shifted = TimeWindow::new(at(10) + half_past, at(11) + half_past).unwrap();
        let err = f
            .manager
            .create_booking(&ctx, f.slot.id, shifted)
            .unwrap_err();
        assert!(matches!(err, ParkingError::Conflict(_)));

        // Back to back is fine
        f.manager.create_booking(&ctx, f.slot.id, window(11, 12)).unwrap();

        let results = f.manager.search_slots(&window(10, 11)).unwrap();
        assert!(!results[0].available);

        assert_eq!(
            f.manager.cancel_booking(&ctx, a.id).unwrap(),
            CancelOutcome::Cancelled
        );
        let results = f.manager.search_slots(&window(10, 11)).unwrap();
        assert!(results[0].available);
        assert!(f.manager.is_available(f.slot.id, &window(10, 11)).unwrap());
        assert!(!f.manager.is_available(f.slot.id, &window(11, 12)).unwrap());

        assert_no_overlapping_active_bookings(&f.backend, f.slot.id);
    }

    #[test]
    fn test_past_window_is_rejected() {
        let f = fixture();
        let start = Utc::now() - Duration::hours(1);
        let window = TimeWindow::new(start, start + Duration::hours(2)).unwrap();

        let err = f
            .manager
            .create_booking(&context(&f.customer), f.slot.id, window)
            .unwrap_err();
        assert!(matches!(err, ParkingError::Validation(_)));
    }

    #[test]
    fn test_admins_cannot_book() {
        let f = fixture();
        let err = f
            .manager
            .create_booking(&context(&f.admin), f.slot.id, window(10, 11))
            .unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::Forbidden(_))));
    }

    #[test]
    fn test_unknown_slot() {
        let f = fixture();
        let err = f
            .manager
            .create_booking(&context(&f.customer), f.slot.id + 1, window(10, 11))
            .unwrap_err();
        assert!(matches!(err, ParkingError::NotFound(_)));
    }

    #[test]
    fn test_cancel_rules() {
        let f = fixture();
        let owner = context(&f.customer);
        let stranger = context(&seed_customer(&f.backend, "Peter"));

        let booking = f
            .manager
            .create_booking(&owner, f.slot.id, window(10, 11))
            .unwrap();

        let err = f.manager.cancel_booking(&owner, booking.id + 1).unwrap_err();
        assert!(matches!(err, ParkingError::NotFound(_)));

        let err = f.manager.cancel_booking(&stranger, booking.id).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::Forbidden(_))));
        assert!(f.backend.booking(booking.id).unwrap().is_active());

        assert_eq!(
            f.manager.cancel_booking(&owner, booking.id).unwrap(),
            CancelOutcome::Cancelled
        );
        assert_eq!(
            f.manager.cancel_booking(&owner, booking.id).unwrap(),
            CancelOutcome::AlreadyCancelled
        );

        let other = f
            .manager
            .create_booking(&owner, f.slot.id, window(12, 13))
            .unwrap();
        assert_eq!(
            f.manager.cancel_booking(&context(&f.admin), other.id).unwrap(),
            CancelOutcome::Cancelled
        );
    }

    #[test]
    fn test_invariant_holds_after_mixed_operations() {
        let f = fixture();
        let ctx = context(&f.customer);
        let requests = [(8, 10), (9, 11), (10, 12), (12, 13), (11, 14), (13, 15), (8, 9)];

        let mut created = vec![];
        for (round, (start, end)) in requests.iter().enumerate() {
            if let Ok(booking) = f.manager.create_booking(&ctx, f.slot.id, window(*start, *end)) {
                created.push(booking);
            }
            if round % 3 == 2 {
                if let Some(booking) = created.pop() {
                    f.manager.cancel_booking(&ctx, booking.id).unwrap();
                }
            }
            assert_no_overlapping_active_bookings(&f.backend, f.slot.id);
        }
    }

    #[test]
    fn test_concurrent_overlapping_requests() {
        let f = fixture();
        const CONTENDERS: usize = 8;
        let barrier = Arc::new(Barrier::new(CONTENDERS));

        let handles: Vec<_> = (0..CONTENDERS)
            .map(|i| {
                let manager = f.manager.clone();
                let barrier = barrier.clone();
                let ctx = context(&seed_customer(&f.backend, &format!("Customer{i}")));
                let slot_id = f.slot.id;
                std::thread::spawn(move || {
                    barrier.wait();
                    manager.create_booking(&ctx, slot_id, window(10, 12))
                })
            })
            .collect();

        let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|err| matches!(err, ParkingError::Conflict(_))));
        assert_no_overlapping_active_bookings(&f.backend, f.slot.id);
    }

    #[test]
    fn test_slot_administration() {
        let f = fixture();
        let admin = context(&f.admin);
        let customer = context(&f.customer);

        let err = f.manager.create_slot(&customer, "S2", true).unwrap_err();
        assert!(matches!(err, ParkingError::Auth(AuthError::Forbidden(_))));
        f.manager.slots(&customer).unwrap_err();
        f.manager.all_bookings(&customer).unwrap_err();
        f.manager.stats(&customer).unwrap_err();

        let err = f.manager.create_slot(&admin, "   ", true).unwrap_err();
        assert!(matches!(err, ParkingError::Validation(_)));
        let err = f
            .manager
            .update_slot(&admin, f.slot.id, SlotChanges::default())
            .unwrap_err();
        assert!(matches!(err, ParkingError::Validation(_)));

        let slot = f.manager.create_slot(&admin, "  S2 ", false).unwrap();
        assert_eq!(slot.label, "S2");
        let slot = f
            .manager
            .update_slot(
                &admin,
                slot.id,
                SlotChanges {
                    label: Some("S3".into()),
                    is_active: Some(true),
                },
            )
            .unwrap();
        assert_eq!(slot.label, "S3");
        assert!(slot.is_active);
        assert_eq!(f.manager.slots(&admin).unwrap().len(), 2);

        f.manager
            .create_booking(&customer, f.slot.id, window(10, 11))
            .unwrap();
        let err = f.manager.delete_slot(&admin, f.slot.id).unwrap_err();
        assert!(matches!(err, ParkingError::Conflict(_)));
        f.manager.delete_slot(&admin, slot.id).unwrap();
        let err = f.manager.delete_slot(&admin, slot.id).unwrap_err();
        assert!(matches!(err, ParkingError::NotFound(_)));
    }

    #[test]
    fn test_ensure_slots_and_overview() {
        let backend = LocalParking::default();
        let manager = BookingManager::new(backend.clone(), 20);

        manager.ensure_slots(5).unwrap();
        manager.ensure_slots(5).unwrap();
        assert_eq!(backend.slots().unwrap().len(), 5);

        let customer = context(&seed_customer(&backend, "Stefan"));
        let slot_id = backend.slots().unwrap()[0].id;
        manager
            .create_booking(&customer, slot_id, window(10, 11))
            .unwrap();

        assert_eq!(
            manager.overview().unwrap(),
            Overview {
                active_slots: 5,
                total_bookings: 1,
                upcoming_bookings: 1,
            }
        );
    }

    #[test]
    fn test_seeded_slots_are_listed_in_number_order() {
        let backend = LocalParking::default();
        let manager = BookingManager::new(backend.clone(), 20);
        let admin = context(&seed_admin(&backend));
        manager.ensure_slots(12).unwrap();
        let expected: Vec<String> = (1..=12).map(|number| format!("Slot {number}")).collect();

        let searched: Vec<String> = manager
            .search_slots(&window(10, 11))
            .unwrap()
            .into_iter()
            .map(|result| result.slot.label)
            .collect();
        assert_eq!(searched, expected);

        let listed: Vec<String> = manager
            .slots(&admin)
            .unwrap()
            .into_iter()
            .map(|slot| slot.label)
            .collect();
        assert_eq!(listed, expected);
    }
}
