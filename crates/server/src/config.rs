//! Process configuration, read from flags or the environment.

use std::net::SocketAddr;
use std::time::Duration;

use clap::{ArgAction, Parser};

use courier_infra::DatabaseConfig;
use courier_infra::jobs::RunnerConfig;
use courier_observability::LogFormat;

#[derive(Debug, Clone, Parser)]
#[command(name = "courier-server", version, about = "Runs the courier background job runner")]
pub struct Config {
    /// SQLite database file or URL
    #[arg(long, env = "DATABASE_URL", default_value = "app.db")]
    pub database_url: String,

    #[arg(long, env = "DATABASE_MAX_CONNECTIONS", default_value_t = 5)]
    pub database_max_connections: u32,

    #[arg(long, env = "DATABASE_CONN_MAX_LIFETIME", default_value = "1h", value_parser = humantime::parse_duration)]
    pub database_conn_max_lifetime: Duration,

    #[arg(long, env = "DATABASE_CONN_MAX_IDLE_TIME", default_value = "1h", value_parser = humantime::parse_duration)]
    pub database_conn_max_idle_time: Duration,

    /// Run the job runner in this process
    #[arg(long, env = "JOBS_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub jobs_enabled: bool,

    /// Maximum jobs running at once
    #[arg(long, env = "JOB_LIMIT", default_value_t = 5)]
    pub job_limit: usize,

    #[arg(long, env = "JOB_POLL_INTERVAL", default_value = "1s", value_parser = humantime::parse_duration)]
    pub job_poll_interval: Duration,

    /// How long shutdown waits for in-flight jobs
    #[arg(long, env = "SHUTDOWN_TIMEOUT", default_value = "30s", value_parser = humantime::parse_duration)]
    pub shutdown_timeout: Duration,

    /// Base URL used in login links
    #[arg(long, env = "BASE_URL", default_value = "http://localhost:8080")]
    pub base_url: String,

    /// `json` or `pretty`
    #[arg(long, env = "LOG_FORMAT", default_value = "json")]
    pub log_format: LogFormat,

    /// Serve Prometheus metrics on this address
    #[arg(long, env = "METRICS_ADDR")]
    pub metrics_addr: Option<SocketAddr>,
}

impl Config {
    pub fn database(&self) -> DatabaseConfig {
        DatabaseConfig {
            url: self.database_url.clone(),
            max_connections: self.database_max_connections,
            max_lifetime: self.database_conn_max_lifetime,
            idle_timeout: self.database_conn_max_idle_time,
            ..DatabaseConfig::default()
        }
    }

    pub fn runner(&self) -> RunnerConfig {
        RunnerConfig::default()
            .with_job_limit(self.job_limit)
            .with_poll_interval(self.job_poll_interval)
            .with_shutdown_timeout(self.shutdown_timeout)
    }
}
