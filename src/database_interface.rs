use crate::availability::TimeWindow;
use crate::backend::ParkingBackend;
use crate::error::ParkingError;
use crate::schema::{bookings, slots, users};
use crate::types::{
    Booking, BookingDetails, BookingStatus, CancelOutcome, NewBooking, NewSlot, NewUser, Slot,
    SlotAvailability, SlotChanges, Stats, User,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use diesel::connection::SimpleConnection;
use diesel::prelude::*;
use diesel::result::{DatabaseErrorKind, Error as DieselError};
use diesel::sqlite::SqliteConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info, warn};

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Writers wait this long for a competing transaction instead of failing.
const BUSY_TIMEOUT_MS: u32 = 5000;

#[derive(Queryable, Selectable)]
#[diesel(table_name = users)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct UserRow {
    id: i32,
    name: String,
    email: String,
    password_hash: String,
    role: String,
}

impl UserRow {
    fn into_credentials(self) -> Result<(User, String), ParkingError> {
        let user = User {
            id: self.id,
            name: self.name,
            email: self.email,
            role: self.role.parse()?,
        };
        Ok((user, self.password_hash))
    }
}

#[derive(Insertable)]
#[diesel(table_name = users)]
struct NewUserRow<'a> {
    name: &'a str,
    email: &'a str,
    password_hash: &'a str,
    role: &'a str,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = slots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct SlotRow {
    id: i32,
    label: String,
    is_active: bool,
}

impl From<SlotRow> for Slot {
    fn from(row: SlotRow) -> Self {
        Slot {
            id: row.id,
            label: row.label,
            is_active: row.is_active,
        }
    }
}

#[derive(Insertable)]
#[diesel(table_name = slots)]
struct NewSlotRow<'a> {
    label: &'a str,
    is_active: bool,
}

#[derive(AsChangeset)]
#[diesel(table_name = slots)]
struct SlotChangeset<'a> {
    label: Option<&'a str>,
    is_active: Option<bool>,
}

#[derive(Queryable, Selectable)]
#[diesel(table_name = bookings)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
struct BookingRow {
    id: i32,
    user_id: i32,
    slot_id: i32,
    start_time: NaiveDateTime,
    end_time: NaiveDateTime,
    status: String,
    amount: i64,
    created_at: NaiveDateTime,
}

impl TryFrom<BookingRow> for Booking {
    type Error = ParkingError;

    fn try_from(row: BookingRow) -> Result<Self, Self::Error> {
        Ok(Booking {
            id: row.id,
            user_id: row.user_id,
            slot_id: row.slot_id,
            start: row.start_time.and_utc(),
            end: row.end_time.and_utc(),
            status: row.status.parse()?,
            amount: row.amount,
            created_at: row.created_at.and_utc(),
        })
    }
}

#[derive(Insertable)]
#[diesel(table_name = bookings)]
struct NewBookingRow<'a> {
    user_id: i32,
    slot_id: i32,
    start_time: NaiveDateTime,
    end_time: NaiveDateTime,
    status: &'a str,
    amount: i64,
    created_at: NaiveDateTime,
}

type DetailsRow = (BookingRow, String, String, String);

fn into_details(rows: Vec<DetailsRow>) -> Result<Vec<BookingDetails>, ParkingError> {
    rows.into_iter()
        .map(|(booking, slot_label, user_name, user_email)| {
            Ok(BookingDetails {
                booking: booking.try_into()?,
                slot_label,
                user_name,
                user_email,
            })
        })
        .collect()
}

fn is_unique_violation(err: &DieselError) -> bool {
    matches!(
        err,
        DieselError::DatabaseError(DatabaseErrorKind::UniqueViolation, _)
    )
}

fn slot_not_found(id: i32) -> ParkingError {
    ParkingError::NotFound(format!("slot {id} does not exist"))
}

/// Active bookings of `slot_id` overlapping `window`, as one indexed predicate.
fn count_overlapping(
    conn: &mut SqliteConnection,
    slot_id: i32,
    window: &TimeWindow,
) -> QueryResult<i64> {
    bookings::table
        .filter(bookings::slot_id.eq(slot_id))
        .filter(bookings::status.eq(BookingStatus::Active.as_str()))
        .filter(bookings::start_time.lt(window.end().naive_utc()))
        .filter(bookings::end_time.gt(window.start().naive_utc()))
        .count()
        .get_result(conn)
}

fn find_slot(conn: &mut SqliteConnection, id: i32) -> Result<SlotRow, ParkingError> {
    slots::table
        .find(id)
        .select(SlotRow::as_select())
        .first(conn)
        .optional()?
        .ok_or_else(|| slot_not_found(id))
}

#[derive(Clone)]
pub struct DatabaseInterface {
    connection: Arc<Mutex<SqliteConnection>>,
}

impl DatabaseInterface {
    /// Opens (or creates) the SQLite database and applies pending migrations.
    pub fn new(database_url: &str) -> Result<Self, ParkingError> {
        let mut connection = Self::establish_connection(database_url)?;
        let applied = connection
            .run_pending_migrations(MIGRATIONS)
            .map_err(|err| ParkingError::Storage(format!("Migrations failed: {err}")))?;
        if !applied.is_empty() {
            info!(count = applied.len(), "Applied database migrations");
        }

        Ok(Self {
            connection: Arc::new(Mutex::new(connection)),
        })
    }

    fn establish_connection(database_url: &str) -> Result<SqliteConnection, ParkingError> {
        let mut connection = SqliteConnection::establish(database_url)
            .map_err(|err| ParkingError::Storage(err.to_string()))?;
        connection.batch_execute(&format!(
            "PRAGMA foreign_keys = ON; PRAGMA busy_timeout = {BUSY_TIMEOUT_MS};"
        ))?;
        Ok(connection)
    }

    fn connection(&self) -> Result<MutexGuard<'_, SqliteConnection>, ParkingError> {
        self.connection.lock().map_err(|_| {
            let err = "Database connection is poisoned";
            error!(err);
            ParkingError::Storage(err.into())
        })
    }
}

impl ParkingBackend for DatabaseInterface {
    fn create_user(&self, user: NewUser) -> Result<User, ParkingError> {
        let mut connection = self.connection()?;
        let row = diesel::insert_into(users::table)
            .values(&NewUserRow {
                name: &user.name,
                email: &user.email,
                password_hash: &user.password_hash,
                role: user.role.as_str(),
            })
            .returning(UserRow::as_returning())
            .get_result(&mut *connection)
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ParkingError::Conflict("email is already registered".into())
                } else {
                    err.into()
                }
            })?;
        row.into_credentials().map(|(user, _)| user)
    }

    fn user(&self, id: i32) -> Result<User, ParkingError> {
        let mut connection = self.connection()?;
        users::table
            .find(id)
            .select(UserRow::as_select())
            .first(&mut *connection)
            .optional()?
            .ok_or_else(|| ParkingError::NotFound(format!("user {id} does not exist")))?
            .into_credentials()
            .map(|(user, _)| user)
    }

    fn credentials(&self, email: &str) -> Result<Option<(User, String)>, ParkingError> {
        let mut connection = self.connection()?;
        users::table
            .filter(users::email.eq(email))
            .select(UserRow::as_select())
            .first(&mut *connection)
            .optional()?
            .map(UserRow::into_credentials)
            .transpose()
    }

    fn update_password_hash(
        &self,
        user_id: i32,
        password_hash: String,
    ) -> Result<(), ParkingError> {
        let mut connection = self.connection()?;
        let updated = diesel::update(users::table.find(user_id))
            .set(users::password_hash.eq(password_hash))
            .execute(&mut *connection)?;
        if updated == 0 {
            return Err(ParkingError::NotFound(format!(
                "user {user_id} does not exist"
            )));
        }
        Ok(())
    }

    fn slots(&self) -> Result<Vec<Slot>, ParkingError> {
        let mut connection = self.connection()?;
        let rows = slots::table
            .order(slots::id.asc())
            .select(SlotRow::as_select())
            .load(&mut *connection)?;
        Ok(rows.into_iter().map(Slot::from).collect())
    }

    fn slot(&self, id: i32) -> Result<Slot, ParkingError> {
        let mut connection = self.connection()?;
        find_slot(&mut connection, id).map(Slot::from)
    }

    fn add_slot(&self, slot: NewSlot) -> Result<Slot, ParkingError> {
        let mut connection = self.connection()?;
        let row = diesel::insert_into(slots::table)
            .values(&NewSlotRow {
                label: &slot.label,
                is_active: slot.is_active,
            })
            .returning(SlotRow::as_returning())
            .get_result(&mut *connection)
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ParkingError::Conflict(format!("slot label '{}' is already in use", slot.label))
                } else {
                    err.into()
                }
            })?;
        Ok(row.into())
    }

    fn update_slot(&self, id: i32, changes: SlotChanges) -> Result<Slot, ParkingError> {
        let mut connection = self.connection()?;
        let changeset = SlotChangeset {
            label: changes.label.as_deref(),
            is_active: changes.is_active,
        };
        let row = diesel::update(slots::table.find(id))
            .set(&changeset)
            .returning(SlotRow::as_returning())
            .get_result(&mut *connection)
            .optional()
            .map_err(|err| {
                if is_unique_violation(&err) {
                    ParkingError::Conflict("slot label is already in use".into())
                } else {
                    err.into()
                }
            })?
            .ok_or_else(|| slot_not_found(id))?;
        Ok(row.into())
    }

    fn remove_slot(&self, id: i32, now: DateTime<Utc>) -> Result<(), ParkingError> {
        let mut connection = self.connection()?;
        connection.immediate_transaction(|conn| -> Result<(), ParkingError> {
            find_slot(conn, id)?;

            let blocking: i64 = bookings::table
                .filter(bookings::slot_id.eq(id))
                .filter(bookings::status.eq(BookingStatus::Active.as_str()))
                .filter(bookings::end_time.gt(now.naive_utc()))
                .count()
                .get_result(conn)?;
            if blocking > 0 {
                let err = format!("slot {id} still has {blocking} upcoming active booking(s)");
                warn!("{err}");
                return Err(ParkingError::Conflict(err));
            }

            diesel::delete(bookings::table.filter(bookings::slot_id.eq(id))).execute(conn)?;
            diesel::delete(slots::table.find(id)).execute(conn)?;
            Ok(())
        })
    }

    fn active_bookings(&self, slot_id: i32) -> Result<Vec<Booking>, ParkingError> {
        let mut connection = self.connection()?;
        find_slot(&mut connection, slot_id)?;
        bookings::table
            .filter(bookings::slot_id.eq(slot_id))
            .filter(bookings::status.eq(BookingStatus::Active.as_str()))
            .order(bookings::start_time.asc())
            .select(BookingRow::as_select())
            .load(&mut *connection)?
            .into_iter()
            .map(Booking::try_from)
            .collect()
    }

    fn search_slots(&self, window: &TimeWindow) -> Result<Vec<SlotAvailability>, ParkingError> {
        let mut connection = self.connection()?;
        let active_slots = slots::table
            .filter(slots::is_active.eq(true))
            .order(slots::id.asc())
            .select(SlotRow::as_select())
            .load(&mut *connection)?;
        let taken: Vec<i32> = bookings::table
            .filter(bookings::status.eq(BookingStatus::Active.as_str()))
            .filter(bookings::start_time.lt(window.end().naive_utc()))
            .filter(bookings::end_time.gt(window.start().naive_utc()))
            .select(bookings::slot_id)
            .distinct()
            .load(&mut *connection)?;

        Ok(active_slots
            .into_iter()
            .map(|row| SlotAvailability {
                available: !taken.contains(&row.id),
                slot: row.into(),
            })
            .collect())
    }

    fn insert_booking(&self, booking: NewBooking) -> Result<Booking, ParkingError> {
        let mut connection = self.connection()?;
        // BEGIN IMMEDIATE takes the write lock before the availability check
        connection.immediate_transaction(|conn| -> Result<Booking, ParkingError> {
            let slot = find_slot(conn, booking.slot_id)?;
            if !slot.is_active {
                return Err(ParkingError::Conflict(format!(
                    "slot {} is not active",
                    slot.label
                )));
            }
            if count_overlapping(conn, booking.slot_id, &booking.window)? > 0 {
                return Err(ParkingError::Conflict(
                    "slot is unavailable for the requested window".into(),
                ));
            }

            let row = diesel::insert_into(bookings::table)
                .values(&NewBookingRow {
                    user_id: booking.user_id,
                    slot_id: booking.slot_id,
                    start_time: booking.window.start().naive_utc(),
                    end_time: booking.window.end().naive_utc(),
                    status: BookingStatus::Active.as_str(),
                    amount: booking.amount,
                    created_at: booking.created_at.naive_utc(),
                })
                .returning(BookingRow::as_returning())
                .get_result(conn)
                .map_err(|err| match err {
                    DieselError::DatabaseError(DatabaseErrorKind::ForeignKeyViolation, _) => {
                        ParkingError::NotFound(format!("user {} does not exist", booking.user_id))
                    }
                    other => other.into(),
                })?;
            row.try_into()
        })
    }

    fn booking(&self, id: i32) -> Result<Booking, ParkingError> {
        let mut connection = self.connection()?;
        bookings::table
            .find(id)
            .select(BookingRow::as_select())
            .first(&mut *connection)
            .optional()?
            .ok_or_else(|| ParkingError::NotFound(format!("booking {id} does not exist")))?
            .try_into()
    }

    fn cancel_booking(&self, id: i32) -> Result<CancelOutcome, ParkingError> {
        let mut connection = self.connection()?;
        connection.immediate_transaction(|conn| -> Result<CancelOutcome, ParkingError> {
            let status: BookingStatus = bookings::table
                .find(id)
                .select(bookings::status)
                .first::<String>(conn)
                .optional()?
                .ok_or_else(|| ParkingError::NotFound(format!("booking {id} does not exist")))?
                .parse()?;
            if status == BookingStatus::Cancelled {
                return Ok(CancelOutcome::AlreadyCancelled);
            }

            diesel::update(bookings::table.find(id))
                .set(bookings::status.eq(BookingStatus::Cancelled.as_str()))
                .execute(conn)?;
            Ok(CancelOutcome::Cancelled)
        })
    }

    fn bookings_of_user(&self, user_id: i32) -> Result<Vec<BookingDetails>, ParkingError> {
        let mut connection = self.connection()?;
        let rows: Vec<DetailsRow> = bookings::table
            .inner_join(slots::table)
            .inner_join(users::table)
            .filter(bookings::user_id.eq(user_id))
            .order((bookings::created_at.desc(), bookings::id.desc()))
            .select((
                BookingRow::as_select(),
                slots::label,
                users::name,
                users::email,
            ))
            .load(&mut *connection)?;
        into_details(rows)
    }

    fn all_bookings(&self) -> Result<Vec<BookingDetails>, ParkingError> {
        let mut connection = self.connection()?;
        let rows: Vec<DetailsRow> = bookings::table
            .inner_join(slots::table)
            .inner_join(users::table)
            .order((bookings::created_at.desc(), bookings::id.desc()))
            .select((
                BookingRow::as_select(),
                slots::label,
                users::name,
                users::email,
            ))
            .load(&mut *connection)?;
        into_details(rows)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<Stats, ParkingError> {
        let mut connection = self.connection()?;
        let conn = &mut *connection;
        Ok(Stats {
            total_slots: slots::table.count().get_result(conn)?,
            active_slots: slots::table
                .filter(slots::is_active.eq(true))
                .count()
                .get_result(conn)?,
            users: users::table.count().get_result(conn)?,
            total_bookings: bookings::table.count().get_result(conn)?,
            upcoming_bookings: bookings::table
                .filter(bookings::status.eq(BookingStatus::Active.as_str()))
                .filter(bookings::end_time.ge(now.naive_utc()))
                .count()
                .get_result(conn)?,
        })
    }
}
