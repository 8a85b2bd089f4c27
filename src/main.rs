use crate::{
    configuration::Configuration, configuration_handler::ConfigurationHandler,
    database_interface::DatabaseInterface, http::create_app, local_parking::LocalParking,
};
use std::error::Error;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

mod auth;
mod availability;
mod backend;
mod booking_manager;
mod configuration;
mod configuration_handler;
mod database_interface;
mod error;
mod http;
mod local_parking;
mod schema;
#[cfg(test)]
mod testutils;
mod types;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let configuration = ConfigurationHandler::parse_arguments();

    let app = if let Some(database_url) = configuration.database_url() {
        let backend = DatabaseInterface::new(&database_url).inspect_err(|err| {
            error!(%err, "Failed to open database: {database_url}");
        })?;
        info!("Successfully connected to database");
        create_app(backend, &configuration)?
    } else {
        warn!("No database configured, all data is kept in memory and lost on restart");
        create_app(LocalParking::default(), &configuration)?
    };

    let address = format!("0.0.0.0:{}", configuration.port());
    let listener = tokio::net::TcpListener::bind(&address).await?;
    info!("Parking manager accessible at {address}");

    axum::serve(listener, app).await?;
    Ok(())
}
