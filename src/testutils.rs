use crate::{
    auth::RequestContext,
    availability::TimeWindow,
    backend::ParkingBackend,
    configuration_handler::ConfigurationHandler,
    http::create_app,
    types::{Booking, BookingStatus, NewUser, Role, User},
};
use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use tokio::{net::TcpListener, task::JoinHandle};
use uuid::Uuid;

/// Tomorrow at `hour`:00 UTC, so every test window lies in the future.
pub fn at(hour: u32) -> DateTime<Utc> {
    (Utc::now() + Duration::days(1))
        .date_naive()
        .and_hms_opt(hour, 0, 0)
        .unwrap()
        .and_utc()
}

pub fn window(start_hour: u32, end_hour: u32) -> TimeWindow {
    TimeWindow::new(at(start_hour), at(end_hour)).unwrap()
}

pub fn booking_at(id: i32, start_hour: u32, end_hour: u32) -> Booking {
    Booking {
        id,
        user_id: 1,
        slot_id: 1,
        start: at(start_hour),
        end: at(end_hour),
        status: BookingStatus::Active,
        amount: 20,
        created_at: Utc::now(),
    }
}

fn seed_user<T: ParkingBackend>(backend: &T, name: &str, role: Role) -> User {
    backend
        .create_user(NewUser {
            name: name.into(),
            email: format!("{}@example.com", name.to_lowercase()),
            password_hash: "not-a-real-hash".into(),
            role,
        })
        .unwrap()
}

pub fn seed_customer<T: ParkingBackend>(backend: &T, name: &str) -> User {
    seed_user(backend, name, Role::Customer)
}

pub fn seed_admin<T: ParkingBackend>(backend: &T) -> User {
    seed_user(backend, "Admin", Role::Admin)
}

pub fn context(user: &User) -> RequestContext {
    RequestContext {
        user_id: user.id,
        role: user.role,
        token: Uuid::new_v4(),
    }
}

pub fn test_configuration() -> ConfigurationHandler {
    ConfigurationHandler::parse_from(["parking_manager", "--seed-slots", "3"])
}

/// Serves the app on an ephemeral port and returns its base url.
pub async fn spawn_server<T: ParkingBackend>(backend: T) -> (JoinHandle<()>, String) {
    let app = create_app(backend, &test_configuration()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let address = listener.local_addr().unwrap();
    let server = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (server, format!("http://{address}"))
}
