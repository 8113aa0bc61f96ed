use anyhow::Result;
use dotenv::dotenv;
use std::env;
use std::path::Path;

pub mod app;
pub mod oauth;
pub mod rate_limit;
pub mod resolver;
pub mod session;

pub use resolver::ConfigResolver;

#[derive(Debug, Clone)]
pub struct Config {
    pub app: app::AppConfig,
    pub oauth: oauth::OAuthConfig,
    pub rate_limit: rate_limit::RateLimitConfig,
    pub session: session::SessionConfig,
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_dotenv();

        Ok(Config {
            app: app::AppConfig::from_env()?,
            oauth: oauth::OAuthConfig::from_env()?,
            rate_limit: rate_limit::RateLimitConfig::from_env()?,
            session: session::SessionConfig::from_env()?,
        })
    }

    pub fn from_env() -> Result<Self> {
        Self::load()
    }

    fn load_dotenv() {
        let env_file = match env::var("APP_ENV").unwrap_or_else(|_| "local".to_string()).as_str() {
            "production" => ".env.production",
            "staging" => ".env.staging",
            "testing" => ".env.testing",
            _ => ".env",
        };

        if Path::new(env_file).exists() {
            dotenv::from_filename(env_file).ok();
        } else {
            dotenv().ok();
        }
    }

    pub fn server_addr(&self) -> String {
        format!("0.0.0.0:{}", self.app.port)
    }

    pub fn is_production(&self) -> bool {
        self.app.is_production()
    }
}
