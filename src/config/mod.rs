use crate::error::QueueError;
use std::env;

/// One configured Ollama-compatible backend. Spec §9 "Dynamic config
/// objects": represented as an ordered list; the Selector references
/// candidates by index into this list.
#[derive(Clone, Debug)]
pub struct BackendDescriptor {
    pub id: String,
    pub url: String,
    pub enabled: bool,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    pub admin_token: String,

    pub backends: Vec<BackendDescriptor>,
    /// model_id -> indices into `backends`
    pub model_backend_map: std::collections::HashMap<String, Vec<usize>>,

    pub job_retention_days: i64,
    pub job_archive_retention_days: i64,

    pub scheduler_tick_seconds: u64,
    pub starvation_tick_seconds: u64,
    pub starvation_increment: f64,
    pub max_concurrent_jobs: usize,
    pub archive_check_interval_seconds: u64,

    pub backend_snapshot_interval_seconds: u64,
    pub backend_snapshot_retention_days: i64,

    pub ollama_lb_active_jobs_weight: f64,
    pub ollama_lb_response_time_weight: f64,
    pub ollama_lb_strategy: String,

    pub ollama_health_check_interval_seconds: u64,
    pub ollama_health_check_timeout_seconds: u64,
    pub ollama_alert_response_time_threshold_ms: f64,
    pub ollama_alert_active_jobs_threshold: i64,
}

impl Config {
    pub fn from_env() -> Result<Self, QueueError> {
        let database_url = env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite:data/jobqueue.db?mode=rwc".to_string());
        let port = env::var("PORT")
            .unwrap_or_else(|_| "3800".to_string())
            .parse()
            .map_err(|_| QueueError::Config("Invalid PORT value".to_string()))?;
        let admin_token = env::var("ADMIN_TOKEN").unwrap_or_else(|_| "admin".to_string());

        let backends = parse_backends(&env::var("OLLAMA_BACKENDS").unwrap_or_default());
        let model_backend_map =
            parse_model_backend_map(&env::var("MODEL_BACKEND_MAP").unwrap_or_default())?;

        let job_retention_days = env::var("JOB_RETENTION_DAYS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| QueueError::Config("Invalid JOB_RETENTION_DAYS value".to_string()))?;
        let job_archive_retention_days = env::var("JOB_ARCHIVE_RETENTION_DAYS")
            .unwrap_or_else(|_| "365".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid JOB_ARCHIVE_RETENTION_DAYS value".to_string())
            })?;

        let scheduler_tick_seconds = env::var("SCHEDULER_TICK_SECONDS")
            .unwrap_or_else(|_| "2".to_string())
            .parse()
            .map_err(|_| QueueError::Config("Invalid SCHEDULER_TICK_SECONDS value".to_string()))?;
        let starvation_tick_seconds = env::var("STARVATION_TICK_SECONDS")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid STARVATION_TICK_SECONDS value".to_string())
            })?;
        let starvation_increment = env::var("STARVATION_INCREMENT")
            .unwrap_or_else(|_| "0.5".to_string())
            .parse()
            .map_err(|_| QueueError::Config("Invalid STARVATION_INCREMENT value".to_string()))?;
        let max_concurrent_jobs = env::var("MAX_CONCURRENT_JOBS")
            .unwrap_or_else(|_| "10".to_string())
            .parse()
            .map_err(|_| QueueError::Config("Invalid MAX_CONCURRENT_JOBS value".to_string()))?;
        let archive_check_interval_seconds = env::var("ARCHIVE_CHECK_INTERVAL_SECONDS")
            .unwrap_or_else(|_| "3600".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid ARCHIVE_CHECK_INTERVAL_SECONDS value".to_string())
            })?;

        let backend_snapshot_interval_seconds = env::var("BACKEND_SNAPSHOT_INTERVAL")
            .unwrap_or_else(|_| "300".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid BACKEND_SNAPSHOT_INTERVAL value".to_string())
            })?;
        let backend_snapshot_retention_days = env::var("BACKEND_SNAPSHOT_RETENTION_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid BACKEND_SNAPSHOT_RETENTION_DAYS value".to_string())
            })?;

        let ollama_lb_active_jobs_weight = env::var("OLLAMA_LB_ACTIVE_JOBS_WEIGHT")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid OLLAMA_LB_ACTIVE_JOBS_WEIGHT value".to_string())
            })?;
        let ollama_lb_response_time_weight = env::var("OLLAMA_LB_RESPONSE_TIME_WEIGHT")
            .unwrap_or_else(|_| "1.0".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid OLLAMA_LB_RESPONSE_TIME_WEIGHT value".to_string())
            })?;
        let ollama_lb_strategy = env::var("OLLAMA_LB_STRATEGY")
            .unwrap_or_else(|_| "least_connections".to_string());

        let ollama_health_check_interval_seconds = env::var("OLLAMA_HEALTH_CHECK_INTERVAL")
            .unwrap_or_else(|_| "30".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid OLLAMA_HEALTH_CHECK_INTERVAL value".to_string())
            })?;
        let ollama_health_check_timeout_seconds = env::var("OLLAMA_HEALTH_CHECK_TIMEOUT")
            .unwrap_or_else(|_| "5".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid OLLAMA_HEALTH_CHECK_TIMEOUT value".to_string())
            })?;
        let ollama_alert_response_time_threshold_ms =
            env::var("OLLAMA_ALERT_RESPONSE_TIME_THRESHOLD_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()
                .map_err(|_| {
                    QueueError::Config(
                        "Invalid OLLAMA_ALERT_RESPONSE_TIME_THRESHOLD_MS value".to_string(),
                    )
                })?;
        let ollama_alert_active_jobs_threshold = env::var("OLLAMA_ALERT_ACTIVE_JOBS_THRESHOLD")
            .unwrap_or_else(|_| "20".to_string())
            .parse()
            .map_err(|_| {
                QueueError::Config("Invalid OLLAMA_ALERT_ACTIVE_JOBS_THRESHOLD value".to_string())
            })?;

        if let Some(db_path_str) = database_url.strip_prefix("sqlite:") {
            if let Some(db_path) = db_path_str.split('?').next() {
                if let Some(parent) = std::path::Path::new(db_path).parent() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        QueueError::Config(format!("Failed to create data directory: {e}"))
                    })?;
                }
            }
        }

        Ok(Config {
            database_url,
            port,
            admin_token,
            backends,
            model_backend_map,
            job_retention_days,
            job_archive_retention_days,
            scheduler_tick_seconds,
            starvation_tick_seconds,
            starvation_increment,
            max_concurrent_jobs,
            archive_check_interval_seconds,
            backend_snapshot_interval_seconds,
            backend_snapshot_retention_days,
            ollama_lb_active_jobs_weight,
            ollama_lb_response_time_weight,
            ollama_lb_strategy,
            ollama_health_check_interval_seconds,
            ollama_health_check_timeout_seconds,
            ollama_alert_response_time_threshold_ms,
            ollama_alert_active_jobs_threshold,
        })
    }
}

/// `OLLAMA_BACKENDS="http://localhost:11434,http://localhost:11435"`
fn parse_backends(raw: &str) -> Vec<BackendDescriptor> {
    raw.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .enumerate()
        .map(|(idx, url)| BackendDescriptor {
            id: format!("backend-{idx}"),
            url: url.to_string(),
            enabled: true,
        })
        .collect()
}

/// `MODEL_BACKEND_MAP="llama3=0,1;mistral=1"`
fn parse_model_backend_map(
    raw: &str,
) -> Result<std::collections::HashMap<String, Vec<usize>>, QueueError> {
    let mut map = std::collections::HashMap::new();
    for entry in raw.split(';') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }
        let (model, indices) = entry
            .split_once('=')
            .ok_or_else(|| QueueError::Config(format!("Invalid MODEL_BACKEND_MAP entry: {entry}")))?;
        let indices: Vec<usize> = indices
            .split(',')
            .map(|i| i.trim().parse::<usize>())
            .collect::<Result<_, _>>()
            .map_err(|_| QueueError::Config(format!("Invalid backend index in: {entry}")))?;
        map.insert(model.trim().to_string(), indices);
    }
    Ok(map)
}
