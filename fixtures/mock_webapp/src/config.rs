/// Settings read once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub max_sessions: u32,
}

impl Config {
    pub fn load() -> Self {
        Self {
            port: std::env::var("PORT")
                .ok()
                .and_then(|value| value.parse().ok())
                .unwrap_or(8080),
            max_sessions: 100,
        }
    }
}
