use std::collections::BTreeSet;

use crate::errors::AppError;
use crate::jwt::JwtConfig;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub port: u16,
    pub jwt: JwtConfig,
    /// Jobs with unconditional administrative authority.
    pub root_jobs: BTreeSet<String>,
    pub feed_capacity: usize,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, AppError> {
        let database_url = std::env::var("DATABASE_URL").map_err(|_| AppError::configuration("DATABASE_URL not set"))?;
        let port = std::env::var("APP_PORT")
            .map(|val| val.parse::<u16>())
            .unwrap_or(Ok(8000))
            .map_err(|_| AppError::configuration("APP_PORT must be a valid port number"))?;
        let feed_capacity = std::env::var("FEED_CAPACITY")
            .map(|val| val.parse::<usize>())
            .unwrap_or(Ok(1024))
            .map_err(|_| AppError::configuration("FEED_CAPACITY must be a positive integer"))?;
        if feed_capacity == 0 {
            return Err(AppError::configuration("FEED_CAPACITY must be a positive integer"));
        }

        Ok(Self {
            database_url,
            port,
            jwt: JwtConfig::from_env()?,
            root_jobs: parse_root_jobs(&std::env::var("ACCESS_ROOT_JOBS").unwrap_or_default()),
            feed_capacity,
        })
    }
}

pub fn parse_root_jobs(raw: &str) -> BTreeSet<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|job| !job.is_empty())
        .map(str::to_string)
        .collect()
}
