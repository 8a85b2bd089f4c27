use crate::configuration::Configuration;
use chrono::Duration;
use clap::Parser;

const MAX_SESSION_TTL_MINUTES: i64 = 60 * 24 * 365;
const MAX_HOURLY_RATE: i64 = 1_000_000;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Parking slot booking service", long_about = None)]
pub struct ConfigurationHandler {
    #[arg(long, env = "PARKING_PORT", default_value = "3000")]
    port: String,

    /// SQLite database file. Without it all data is kept in memory.
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// At most one year
    #[arg(
        long,
        env = "PARKING_SESSION_TTL_MINUTES",
        default_value_t = 480,
        value_parser = clap::value_parser!(i64).range(1..=MAX_SESSION_TTL_MINUTES)
    )]
    session_ttl_minutes: i64,

    #[arg(
        long,
        env = "PARKING_HOURLY_RATE",
        default_value_t = 20,
        value_parser = clap::value_parser!(i64).range(1..=MAX_HOURLY_RATE)
    )]
    hourly_rate: i64,

    #[arg(long, env = "PARKING_ADMIN_EMAIL", default_value = "admin@example.com")]
    admin_email: String,

    #[arg(long, env = "PARKING_ADMIN_PASSWORD", default_value = "admin123")]
    admin_password: String,

    /// Number of slots created when the slot table is empty
    #[arg(long, env = "PARKING_SEED_SLOTS", default_value_t = 20)]
    seed_slots: u32,
}

impl ConfigurationHandler {
    pub fn parse_arguments() -> Self {
        Self::parse()
    }
}

impl Configuration for ConfigurationHandler {
    fn port(&self) -> String {
        self.port.clone()
    }

    fn database_url(&self) -> Option<String> {
        self.database_url.clone()
    }

    fn session_ttl(&self) -> Duration {
        Duration::minutes(self.session_ttl_minutes)
    }

    fn hourly_rate(&self) -> i64 {
        self.hourly_rate
    }

    fn admin_email(&self) -> String {
        self.admin_email.clone()
    }

    fn admin_password(&self) -> String {
        self.admin_password.clone()
    }

    fn seed_slots(&self) -> u32 {
        self.seed_slots
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use test_case::test_case;

    #[test]
    fn test_defaults() {
        let configuration = ConfigurationHandler::parse_from(["parking_manager"]);
        assert_eq!(configuration.session_ttl(), Duration::hours(8));
        assert_eq!(configuration.hourly_rate(), 20);
        assert_eq!(configuration.seed_slots(), 20);
    }

    #[test]
    fn test_arguments_override_defaults() {
        let configuration = ConfigurationHandler::parse_from([
            "parking_manager",
            "--port",
            "8080",
            "--database-url",
            "parking.db",
            "--session-ttl-minutes",
            "15",
            "--hourly-rate",
            "35",
        ]);
        assert_eq!(configuration.port(), "8080");
        assert_eq!(configuration.database_url().as_deref(), Some("parking.db"));
        assert_eq!(configuration.session_ttl(), Duration::minutes(15));
        assert_eq!(configuration.hourly_rate(), 35);
    }

    #[test_case("--hourly-rate=0" ; "zero rate")]
    #[test_case("--hourly-rate=-5" ; "negative rate")]
    #[test_case("--hourly-rate=1000001" ; "rate above the limit")]
    #[test_case("--session-ttl-minutes=0" ; "zero ttl")]
    #[test_case("--session-ttl-minutes=-30" ; "negative ttl")]
    #[test_case("--session-ttl-minutes=9223372036854775807" ; "ttl that overflows a duration")]
    fn test_out_of_range_values_are_rejected(argument: &str) {
        assert!(ConfigurationHandler::try_parse_from(["parking_manager", argument]).is_err());
    }

    #[test]
    fn test_range_limits_are_accepted() {
        let configuration = ConfigurationHandler::parse_from([
            "parking_manager",
            "--hourly-rate=1000000",
            "--session-ttl-minutes=525600",
        ]);
        assert_eq!(configuration.hourly_rate(), 1_000_000);
        assert_eq!(configuration.session_ttl(), Duration::days(365));
    }
}
