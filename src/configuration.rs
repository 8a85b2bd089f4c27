use chrono::Duration;

pub trait Configuration: Clone + Send + Sync + 'static {
    fn port(&self) -> String;
    fn database_url(&self) -> Option<String>;
    fn session_ttl(&self) -> Duration;
    fn hourly_rate(&self) -> i64;
    fn admin_email(&self) -> String;
    fn admin_password(&self) -> String;
    fn seed_slots(&self) -> u32;
}
