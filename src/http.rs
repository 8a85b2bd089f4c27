use crate::auth::{AuthGate, RequestContext, Session};
use crate::availability::TimeWindow;
use crate::backend::ParkingBackend;
use crate::booking_manager::{BookingManager, Overview};
use crate::configuration::Configuration;
use crate::error::ParkingError;
use crate::types::{
    Booking, BookingDetails, CancelOutcome, Role, Slot, SlotAvailability, SlotChanges, Stats, User,
};
use axum::extract::rejection::{JsonRejection, PathRejection, QueryRejection};
use axum::extract::{Path, Query, Request};
use axum::http::header::AUTHORIZATION;
use axum::middleware::{self, Next};
use axum::response::Response;
use axum::{extract::State, http::StatusCode, Extension, Json};
use axum::{
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, warn};
use validator::Validate;

#[derive(Clone)]
pub struct AppState<T: ParkingBackend> {
    auth_gate: AuthGate<T>,
    booking_manager: BookingManager<T>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct RegisterRequest {
    #[validate(length(min = 1, max = 100))]
    name: String,
    #[validate(email)]
    email: String,
    password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct LoginRequest {
    email: String,
    password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct BookingRequest {
    #[validate(range(min = 1))]
    slot_id: i32,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SearchQuery {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CancelResponse {
    booking_id: i32,
    status: CancelOutcome,
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct CreateSlotRequest {
    #[validate(length(min = 1, max = 32))]
    label: String,
    #[serde(default = "default_active")]
    is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
struct UpdateSlotRequest {
    #[validate(length(min = 1, max = 32))]
    label: Option<String>,
    is_active: Option<bool>,
}

/// Unwraps a JSON body and runs its field validation. Every malformed body
/// ends up as a validation error with the usual error shape.
fn payload<P: Validate>(payload: Result<Json<P>, JsonRejection>) -> Result<P, ParkingError> {
    let Json(payload) = payload.map_err(|err| ParkingError::Validation(err.body_text()))?;
    payload.validate()?;
    Ok(payload)
}

fn path_id(path: Result<Path<i32>, PathRejection>) -> Result<i32, ParkingError> {
    path.map(|Path(id)| id)
        .map_err(|err| ParkingError::Validation(err.body_text()))
}

/// Runs password hashing and other CPU heavy work on the blocking pool, so
/// the async workers keep serving other requests.
async fn blocking<R, F>(work: F) -> Result<R, ParkingError>
where
    F: FnOnce() -> Result<R, ParkingError> + Send + 'static,
    R: Send + 'static,
{
    tokio::task::spawn_blocking(work).await.map_err(|err| {
        error!(%err, "Blocking task failed");
        ParkingError::Storage(err.to_string())
    })?
}

/// Builds the router and makes sure the administrator account and the
/// initial slots exist.
pub fn create_app<T: ParkingBackend, C: Configuration>(
    backend: T,
    configuration: &C,
) -> Result<Router, ParkingError> {
    let auth_gate = AuthGate::new(backend.clone(), configuration.session_ttl());
    let booking_manager = BookingManager::new(backend, configuration.hourly_rate());

    auth_gate.ensure_admin(&configuration.admin_email(), &configuration.admin_password())?;
    booking_manager.ensure_slots(configuration.seed_slots())?;

    let state = AppState {
        auth_gate,
        booking_manager,
    };

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let public = Router::new()
        .route("/register", post(register::<T>))
        .route("/login", post(login::<T>))
        .route("/overview", get(overview::<T>))
        .route("/slots/search", get(search_slots::<T>));

    let admin = Router::new()
        .route("/admin/slots", get(admin_slots::<T>).post(create_slot::<T>))
        .route(
            "/admin/slots/{id}",
            put(update_slot::<T>).delete(delete_slot::<T>),
        )
        .route("/admin/bookings", get(all_bookings::<T>))
        .route("/admin/stats", get(stats::<T>))
        .route_layer(middleware::from_fn(admin_auth));

    // The session layer wraps the admin layer, so admin checks always see a
    // resolved request context.
    let session = Router::new()
        .route("/logout", post(logout::<T>))
        .route("/account/password", put(change_password::<T>))
        .route("/bookings", get(my_bookings::<T>).post(create_booking::<T>))
        .route("/bookings/{id}/cancel", post(cancel_booking::<T>))
        .merge(admin)
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            session_auth::<T>,
        ));

    Ok(Router::new()
        .merge(public)
        .merge(session)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors))
}

async fn session_auth<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ParkingError> {
    let token = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));
    let context = state
        .auth_gate
        .authenticate(token)
        .inspect_err(|err| warn!(%err, uri = %request.uri(), "Request rejected by session check"))?;

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

async fn admin_auth(
    Extension(context): Extension<RequestContext>,
    request: Request,
    next: Next,
) -> Result<Response, ParkingError> {
    context.require(Role::Admin)?;
    Ok(next.run(request).await)
}

async fn register<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    request: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<User>), ParkingError> {
    let request = payload(request)?;
    let user = blocking(move || {
        state
            .auth_gate
            .register(&request.name, &request.email, &request.password)
    })
    .await?;
    Ok((StatusCode::CREATED, Json(user)))
}

async fn login<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    request: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Json<Session>, ParkingError> {
    let request = payload(request)?;
    let session =
        blocking(move || state.auth_gate.login(&request.email, &request.password)).await?;
    Ok(Json(session))
}

async fn logout<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
) -> Result<StatusCode, ParkingError> {
    state.auth_gate.logout(&context)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn change_password<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
    request: Result<Json<ChangePasswordRequest>, JsonRejection>,
) -> Result<StatusCode, ParkingError> {
    let request = payload(request)?;
    blocking(move || {
        state.auth_gate.change_password(
            &context,
            &request.current_password,
            &request.new_password,
        )
    })
    .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn overview<T: ParkingBackend>(
    State(state): State<AppState<T>>,
) -> Result<Json<Overview>, ParkingError> {
    Ok(Json(state.booking_manager.overview()?))
}

async fn search_slots<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    query: Result<Query<SearchQuery>, QueryRejection>,
) -> Result<Json<Vec<SlotAvailability>>, ParkingError> {
    let Query(query) = query.map_err(|err| ParkingError::Validation(err.body_text()))?;
    let window = TimeWindow::new(query.start, query.end)?;
    Ok(Json(state.booking_manager.search_slots(&window)?))
}

async fn my_bookings<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
) -> Result<Json<Vec<BookingDetails>>, ParkingError> {
    Ok(Json(state.booking_manager.my_bookings(&context)?))
}

async fn create_booking<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
    request: Result<Json<BookingRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Booking>), ParkingError> {
    let request = payload(request)?;
    let window = TimeWindow::new(request.start, request.end)?;
    let booking = state
        .booking_manager
        .create_booking(&context, request.slot_id, window)?;
    Ok((StatusCode::CREATED, Json(booking)))
}

async fn cancel_booking<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
    booking_id: Result<Path<i32>, PathRejection>,
) -> Result<Json<CancelResponse>, ParkingError> {
    let booking_id = path_id(booking_id)?;
    let status = state.booking_manager.cancel_booking(&context, booking_id)?;
    Ok(Json(CancelResponse { booking_id, status }))
}

async fn admin_slots<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
) -> Result<Json<Vec<Slot>>, ParkingError> {
    Ok(Json(state.booking_manager.slots(&context)?))
}

async fn create_slot<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
    request: Result<Json<CreateSlotRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Slot>), ParkingError> {
    let request = payload(request)?;
    let slot = state
        .booking_manager
        .create_slot(&context, &request.label, request.is_active)?;
    Ok((StatusCode::CREATED, Json(slot)))
}

async fn update_slot<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
    slot_id: Result<Path<i32>, PathRejection>,
    request: Result<Json<UpdateSlotRequest>, JsonRejection>,
) -> Result<Json<Slot>, ParkingError> {
    let slot_id = path_id(slot_id)?;
    let request = payload(request)?;
    let changes = SlotChanges {
        label: request.label,
        is_active: request.is_active,
    };
    Ok(Json(
        state
            .booking_manager
            .update_slot(&context, slot_id, changes)?,
    ))
}

async fn delete_slot<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
    slot_id: Result<Path<i32>, PathRejection>,
) -> Result<StatusCode, ParkingError> {
    let slot_id = path_id(slot_id)?;
    state.booking_manager.delete_slot(&context, slot_id)?;
    Ok(StatusCode::NO_CONTENT)
}

async fn all_bookings<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
) -> Result<Json<Vec<BookingDetails>>, ParkingError> {
    Ok(Json(state.booking_manager.all_bookings(&context)?))
}

async fn stats<T: ParkingBackend>(
    State(state): State<AppState<T>>,
    Extension(context): Extension<RequestContext>,
) -> Result<Json<Stats>, ParkingError> {
    Ok(Json(state.booking_manager.stats(&context)?))
}
