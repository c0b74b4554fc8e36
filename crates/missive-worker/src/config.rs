//! Configuration for the missive worker.

use std::time::Duration;

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use missive_mail::{ProviderConfig, SendGridConfig, SesConfig, SmtpConfig, SmtpTls};
use missive_queue::{SqsQueueConfig, MAX_BATCH_SIZE, MAX_WAIT_TIME};
use serde::{Deserialize, Serialize};

use crate::{
    engine::LoopConfig,
    retry::{BackoffStrategy, RetryPolicy},
};

const CONFIG_FILE: &str = "missive.toml";

/// Environment variable naming an alternative config file.
pub const CONFIG_FILE_ENV: &str = "MISSIVE_CONFIG";

/// Queue backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueProvider {
    /// Amazon SQS.
    Sqs,
    /// Redis lists.
    Redis,
    /// In-process queue; jobs are lost on exit.
    Memory,
}

/// Email provider selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmailProvider {
    /// Amazon SES.
    Ses,
    /// SendGrid.
    Sendgrid,
    /// SMTP relay.
    Smtp,
}

/// Where delivered job ids are remembered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DedupeProvider {
    /// This process only.
    Memory,
    /// Shared through `REDIS_URL`.
    Redis,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable.
    Pretty,
    /// One JSON object per line.
    Json,
}

/// Complete worker configuration.
///
/// Loaded once at startup, in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`missive.toml`, or the path in `MISSIVE_CONFIG`)
/// 3. Built-in defaults
///
/// The struct is immutable after [`load`](Self::load); components receive
/// the derived settings they need through the `to_*` conversions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    // Queue
    /// Queue backend.
    ///
    /// Environment variable: `QUEUE_PROVIDER`
    #[serde(default = "default_queue_provider", alias = "QUEUE_PROVIDER")]
    pub queue_provider: QueueProvider,
    /// Priority queue URL.
    ///
    /// Environment variable: `SQS_PRIORITY_QUEUE_URL`
    #[serde(default, alias = "SQS_PRIORITY_QUEUE_URL")]
    pub sqs_priority_queue_url: Option<String>,
    /// Regular queue URL.
    ///
    /// Environment variable: `SQS_REGULAR_QUEUE_URL`
    #[serde(default, alias = "SQS_REGULAR_QUEUE_URL")]
    pub sqs_regular_queue_url: Option<String>,
    /// Dead-letter queue URL.
    ///
    /// Environment variable: `SQS_DEAD_LETTER_QUEUE_URL`
    #[serde(default, alias = "SQS_DEAD_LETTER_QUEUE_URL")]
    pub sqs_dead_letter_queue_url: Option<String>,
    /// Seconds a received message stays hidden.
    ///
    /// Environment variable: `VISIBILITY_TIMEOUT`
    #[serde(default = "default_visibility_timeout", alias = "VISIBILITY_TIMEOUT")]
    pub visibility_timeout: u64,
    /// Redis endpoint for the redis queue and ledger.
    ///
    /// Environment variable: `REDIS_URL`
    #[serde(default = "default_redis_url", alias = "REDIS_URL")]
    pub redis_url: String,
    /// Key prefix for redis structures.
    ///
    /// Environment variable: `REDIS_QUEUE_PREFIX`
    #[serde(default = "default_redis_prefix", alias = "REDIS_QUEUE_PREFIX")]
    pub redis_queue_prefix: String,

    // Email
    /// Email provider.
    ///
    /// Environment variable: `EMAIL_PROVIDER`
    #[serde(default = "default_email_provider", alias = "EMAIL_PROVIDER")]
    pub email_provider: EmailProvider,
    /// Sender used when a payload has none.
    ///
    /// Environment variable: `EMAIL_FROM`
    #[serde(default, alias = "EMAIL_FROM")]
    pub email_from: String,
    /// Provider request timeout in seconds.
    ///
    /// Environment variable: `EMAIL_TIMEOUT`
    #[serde(default = "default_email_timeout", alias = "EMAIL_TIMEOUT")]
    pub email_timeout: u64,
    /// AWS region for SES and SQS.
    ///
    /// Environment variable: `AWS_REGION`
    #[serde(default, alias = "AWS_REGION")]
    pub aws_region: Option<String>,
    /// SES configuration set.
    ///
    /// Environment variable: `SES_CONFIGURATION_SET`
    #[serde(default, alias = "SES_CONFIGURATION_SET")]
    pub ses_configuration_set: Option<String>,
    /// SendGrid API key.
    ///
    /// Environment variable: `SENDGRID_API_KEY`
    #[serde(default, alias = "SENDGRID_API_KEY")]
    pub sendgrid_api_key: Option<String>,
    /// SendGrid API base URL.
    ///
    /// Environment variable: `SENDGRID_API_URL`
    #[serde(default = "default_sendgrid_url", alias = "SENDGRID_API_URL")]
    pub sendgrid_api_url: String,
    /// SMTP relay host.
    ///
    /// Environment variable: `SMTP_HOST`
    #[serde(default = "default_smtp_host", alias = "SMTP_HOST")]
    pub smtp_host: String,
    /// SMTP relay port.
    ///
    /// Environment variable: `SMTP_PORT`
    #[serde(default = "default_smtp_port", alias = "SMTP_PORT")]
    pub smtp_port: u16,
    /// SMTP login.
    ///
    /// Environment variable: `SMTP_USERNAME`
    #[serde(default, alias = "SMTP_USERNAME")]
    pub smtp_username: Option<String>,
    /// SMTP password.
    ///
    /// Environment variable: `SMTP_PASSWORD`
    #[serde(default, alias = "SMTP_PASSWORD")]
    pub smtp_password: Option<String>,
    /// SMTP transport security: `none`, `starttls` or `tls`.
    ///
    /// Environment variable: `SMTP_TLS`
    #[serde(default, alias = "SMTP_TLS")]
    pub smtp_tls: SmtpTls,

    // Polling
    /// Milliseconds to sleep when both queues are empty.
    ///
    /// Environment variable: `POLL_INTERVAL`
    #[serde(default = "default_poll_interval", alias = "POLL_INTERVAL")]
    pub poll_interval: u64,
    /// Messages requested per poll, 1 to 10.
    ///
    /// Environment variable: `MAX_MESSAGES_PER_POLL`
    #[serde(default = "default_max_messages", alias = "MAX_MESSAGES_PER_POLL")]
    pub max_messages_per_poll: usize,
    /// Regular queue long-poll in seconds, 0 to 20.
    ///
    /// Environment variable: `WAIT_TIME_SECONDS`
    #[serde(default = "default_wait_time", alias = "WAIT_TIME_SECONDS")]
    pub wait_time_seconds: u64,
    /// Priority queue wait in seconds. Unset means 1 on SQS, where a zero
    /// wait samples only part of the fleet, and 0 elsewhere.
    ///
    /// Environment variable: `PRIORITY_WAIT_TIME_SECONDS`
    #[serde(default, alias = "PRIORITY_WAIT_TIME_SECONDS")]
    pub priority_wait_time_seconds: Option<u64>,
    /// Milliseconds to back off after a failed poll.
    ///
    /// Environment variable: `POLL_ERROR_BACKOFF`
    #[serde(default = "default_error_backoff", alias = "POLL_ERROR_BACKOFF")]
    pub poll_error_backoff: u64,
    /// Jobs processed at once; defaults to the batch size.
    ///
    /// Environment variable: `WORKER_CONCURRENCY`
    #[serde(default, alias = "WORKER_CONCURRENCY")]
    pub worker_concurrency: Option<usize>,
    /// Consecutive priority batches before regular gets a turn.
    ///
    /// Environment variable: `MAX_CONSECUTIVE_PRIORITY_BATCHES`
    #[serde(default = "default_priority_streak", alias = "MAX_CONSECUTIVE_PRIORITY_BATCHES")]
    pub max_consecutive_priority_batches: u32,
    /// Seconds between visibility extensions; 0 disables the heartbeat.
    ///
    /// Environment variable: `VISIBILITY_EXTEND_INTERVAL`
    #[serde(default = "default_extend_interval", alias = "VISIBILITY_EXTEND_INTERVAL")]
    pub visibility_extend_interval: u64,
    /// Seconds of visibility granted by each extension.
    ///
    /// Environment variable: `VISIBILITY_EXTENSION`
    #[serde(default = "default_visibility_extension", alias = "VISIBILITY_EXTENSION")]
    pub visibility_extension: u64,

    // Retry
    /// Transient failures tolerated per job.
    ///
    /// Environment variable: `MAX_RETRIES`
    #[serde(default = "default_max_retries", alias = "MAX_RETRIES")]
    pub max_retries: u32,
    /// Base delay for exponential backoff in milliseconds.
    ///
    /// Environment variable: `RETRY_BASE_DELAY_MS`
    #[serde(default = "default_base_delay_ms", alias = "RETRY_BASE_DELAY_MS")]
    pub retry_base_delay_ms: u64,
    /// Maximum delay between retries in milliseconds.
    ///
    /// Environment variable: `RETRY_MAX_DELAY_MS`
    #[serde(default = "default_max_delay_ms", alias = "RETRY_MAX_DELAY_MS")]
    pub retry_max_delay_ms: u64,
    /// Jitter factor for retry timing (0.0 to 1.0).
    ///
    /// Environment variable: `RETRY_JITTER`
    #[serde(default = "default_jitter", alias = "RETRY_JITTER")]
    pub retry_jitter: f64,

    // Dedupe
    /// Delivery ledger backend.
    ///
    /// Environment variable: `DEDUPE_PROVIDER`
    #[serde(default = "default_dedupe_provider", alias = "DEDUPE_PROVIDER")]
    pub dedupe_provider: DedupeProvider,
    /// Seconds a delivered job id is remembered.
    ///
    /// Environment variable: `DEDUPE_TTL`
    #[serde(default = "default_dedupe_ttl", alias = "DEDUPE_TTL")]
    pub dedupe_ttl: u64,

    // Lifecycle
    /// Seconds shutdown waits for the current batch.
    ///
    /// Environment variable: `SHUTDOWN_GRACE_PERIOD`
    #[serde(default = "default_grace_period", alias = "SHUTDOWN_GRACE_PERIOD")]
    pub shutdown_grace_period: u64,

    // Logging
    /// Log level; `RUST_LOG` takes precedence when set.
    ///
    /// Environment variable: `LOG_LEVEL`
    #[serde(default = "default_log_level", alias = "LOG_LEVEL")]
    pub log_level: String,
    /// Log output format.
    ///
    /// Environment variable: `LOG_FORMAT`
    #[serde(default = "default_log_format", alias = "LOG_FORMAT")]
    pub log_format: LogFormat,
}

impl WorkerConfig {
    /// Load configuration from defaults, config file, and environment
    /// variable overrides, then validate it.
    pub fn load() -> Result<Self> {
        let file = std::env::var(CONFIG_FILE_ENV).unwrap_or_else(|_| CONFIG_FILE.to_string());
        let config: Self = Self::figment(&file)
            .extract()
            .with_context(|| format!("failed to load configuration (file: {file})"))?;
        config.validate()?;
        Ok(config)
    }

    /// Layered configuration sources.
    pub fn figment(file: &str) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(file))
            .merge(Env::prefixed(""))
    }

    /// Messages requested per poll.
    pub fn batch_size(&self) -> usize {
        self.max_messages_per_poll
    }

    /// Jobs processed at once, never more than the batch size.
    pub fn concurrency(&self) -> usize {
        let batch = self.max_messages_per_poll;
        self.worker_concurrency.unwrap_or(batch).min(batch)
    }

    /// Visibility timeout requested from the queue backend.
    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout)
    }

    /// Seconds a delivered job id is remembered.
    pub fn dedupe_ttl(&self) -> Duration {
        Duration::from_secs(self.dedupe_ttl)
    }

    /// Wait used when polling the priority queue.
    pub fn priority_wait_time(&self) -> Duration {
        let default = match self.queue_provider {
            QueueProvider::Sqs => 1,
            QueueProvider::Redis | QueueProvider::Memory => 0,
        };
        Duration::from_secs(self.priority_wait_time_seconds.unwrap_or(default))
    }

    /// Grace period for shutdown.
    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period)
    }

    /// Convert to retry policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            base_delay: Duration::from_millis(self.retry_base_delay_ms),
            max_delay: Duration::from_millis(self.retry_max_delay_ms),
            jitter_factor: self.retry_jitter,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }

    /// Convert to the polling loop's settings.
    pub fn to_loop_config(&self) -> LoopConfig {
        LoopConfig {
            batch_size: self.batch_size(),
            concurrency: self.concurrency(),
            wait_time: Duration::from_secs(self.wait_time_seconds),
            priority_wait_time: self.priority_wait_time(),
            poll_interval: Duration::from_millis(self.poll_interval),
            max_consecutive_priority_batches: self.max_consecutive_priority_batches,
            visibility_extend_interval: (self.visibility_extend_interval > 0)
                .then(|| Duration::from_secs(self.visibility_extend_interval)),
            visibility_extension: Duration::from_secs(self.visibility_extension),
            error_backoff: Duration::from_millis(self.poll_error_backoff),
            shutdown_grace_period: self.shutdown_grace_period(),
        }
    }

    /// Convert to SQS queue settings. `None` unless both URLs are set.
    pub fn to_sqs_config(&self) -> Option<SqsQueueConfig> {
        let priority = self.sqs_priority_queue_url.as_deref()?;
        let regular = self.sqs_regular_queue_url.as_deref()?;
        Some(SqsQueueConfig {
            dead_letter_url: self.sqs_dead_letter_queue_url.clone(),
            visibility_timeout: self.visibility_timeout(),
            ..SqsQueueConfig::new(priority, regular)
        })
    }

    /// Convert to the email provider selection.
    pub fn to_provider_config(&self) -> ProviderConfig {
        let timeout = Duration::from_secs(self.email_timeout);
        match self.email_provider {
            EmailProvider::Ses => ProviderConfig::Ses(SesConfig {
                region: self.aws_region.clone(),
                configuration_set: self.ses_configuration_set.clone(),
                timeout,
            }),
            EmailProvider::Sendgrid => ProviderConfig::SendGrid(SendGridConfig {
                api_key: self.sendgrid_api_key.clone().unwrap_or_default(),
                api_url: self.sendgrid_api_url.clone(),
                timeout,
            }),
            EmailProvider::Smtp => ProviderConfig::Smtp(SmtpConfig {
                host: self.smtp_host.clone(),
                port: self.smtp_port,
                username: self.smtp_username.clone(),
                password: self.smtp_password.clone(),
                tls: self.smtp_tls,
                timeout,
            }),
        }
    }

    /// Redis URL with password masked for logging.
    pub fn redis_url_masked(&self) -> String {
        if let Some(at_pos) = self.redis_url.find('@') {
            if let Some(colon_pos) = self.redis_url[..at_pos].rfind(':') {
                let scheme_end = self.redis_url.find("://").map_or(0, |pos| pos + 3);
                if colon_pos >= scheme_end {
                    let mut masked = self.redis_url.clone();
                    masked.replace_range(colon_pos + 1..at_pos, "***");
                    return masked;
                }
            }
        }
        self.redis_url.clone()
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<()> {
        if self.email_from.trim().is_empty() {
            anyhow::bail!("EMAIL_FROM must be set");
        }
        missive_mail::parse_mailbox(&self.email_from).context("EMAIL_FROM is not a valid mailbox")?;

        if self.queue_provider == QueueProvider::Sqs && self.to_sqs_config().is_none() {
            anyhow::bail!("SQS_PRIORITY_QUEUE_URL and SQS_REGULAR_QUEUE_URL are required for sqs");
        }

        match self.email_provider {
            EmailProvider::Sendgrid
                if self.sendgrid_api_key.as_deref().map_or(true, |key| key.trim().is_empty()) =>
            {
                anyhow::bail!("SENDGRID_API_KEY is required for sendgrid");
            },
            EmailProvider::Smtp if self.smtp_username.is_some() != self.smtp_password.is_some() => {
                anyhow::bail!("SMTP_USERNAME and SMTP_PASSWORD must be set together");
            },
            _ => {},
        }

        if !(1..=MAX_BATCH_SIZE).contains(&self.max_messages_per_poll) {
            anyhow::bail!("max_messages_per_poll must be between 1 and {MAX_BATCH_SIZE}");
        }

        if self.wait_time_seconds > MAX_WAIT_TIME.as_secs() {
            anyhow::bail!("wait_time_seconds must not exceed 20");
        }

        if self.worker_concurrency == Some(0) {
            anyhow::bail!("worker_concurrency must be greater than 0");
        }

        if self.max_consecutive_priority_batches == 0 {
            anyhow::bail!("max_consecutive_priority_batches must be greater than 0");
        }

        if self.retry_base_delay_ms == 0 {
            anyhow::bail!("retry_base_delay_ms must be greater than 0");
        }

        if self.retry_max_delay_ms < self.retry_base_delay_ms {
            anyhow::bail!("retry_max_delay_ms cannot be less than retry_base_delay_ms");
        }

        if !(0.0..=1.0).contains(&self.retry_jitter) {
            anyhow::bail!("retry_jitter must be between 0.0 and 1.0");
        }

        if self.priority_wait_time() > MAX_WAIT_TIME {
            anyhow::bail!("priority_wait_time_seconds must not exceed 20");
        }

        if self.visibility_timeout == 0 {
            anyhow::bail!("visibility_timeout must be greater than 0");
        }

        if self.visibility_extend_interval > 0 {
            if self.visibility_extend_interval >= self.visibility_timeout {
                anyhow::bail!("visibility_extend_interval must be shorter than visibility_timeout");
            }
            if self.visibility_extension <= self.visibility_extend_interval {
                anyhow::bail!("visibility_extension must exceed visibility_extend_interval");
            }
        } else if self.email_timeout >= self.visibility_timeout {
            anyhow::bail!(
                "email_timeout must be shorter than visibility_timeout when the visibility \
                 heartbeat is disabled"
            );
        }

        Ok(())
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            queue_provider: default_queue_provider(),
            sqs_priority_queue_url: None,
            sqs_regular_queue_url: None,
            sqs_dead_letter_queue_url: None,
            visibility_timeout: default_visibility_timeout(),
            redis_url: default_redis_url(),
            redis_queue_prefix: default_redis_prefix(),
            email_provider: default_email_provider(),
            email_from: String::new(),
            email_timeout: default_email_timeout(),
            aws_region: None,
            ses_configuration_set: None,
            sendgrid_api_key: None,
            sendgrid_api_url: default_sendgrid_url(),
            smtp_host: default_smtp_host(),
            smtp_port: default_smtp_port(),
            smtp_username: None,
            smtp_password: None,
            smtp_tls: SmtpTls::default(),
            poll_interval: default_poll_interval(),
            max_messages_per_poll: default_max_messages(),
            wait_time_seconds: default_wait_time(),
            priority_wait_time_seconds: None,
            poll_error_backoff: default_error_backoff(),
            worker_concurrency: None,
            max_consecutive_priority_batches: default_priority_streak(),
            visibility_extend_interval: default_extend_interval(),
            visibility_extension: default_visibility_extension(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_base_delay_ms(),
            retry_max_delay_ms: default_max_delay_ms(),
            retry_jitter: default_jitter(),
            dedupe_provider: default_dedupe_provider(),
            dedupe_ttl: default_dedupe_ttl(),
            shutdown_grace_period: default_grace_period(),
            log_level: default_log_level(),
            log_format: default_log_format(),
        }
    }
}

fn default_queue_provider() -> QueueProvider {
    QueueProvider::Sqs
}

fn default_visibility_timeout() -> u64 {
    30
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_redis_prefix() -> String {
    "missive".to_string()
}

fn default_email_provider() -> EmailProvider {
    EmailProvider::Smtp
}

fn default_email_timeout() -> u64 {
    30
}

fn default_extend_interval() -> u64 {
    10
}

fn default_sendgrid_url() -> String {
    "https://api.sendgrid.com".to_string()
}

fn default_smtp_host() -> String {
    "localhost".to_string()
}

fn default_smtp_port() -> u16 {
    587
}

fn default_poll_interval() -> u64 {
    5000
}

fn default_max_messages() -> usize {
    10
}

fn default_wait_time() -> u64 {
    20
}

fn default_error_backoff() -> u64 {
    5000
}

fn default_priority_streak() -> u32 {
    5
}

fn default_visibility_extension() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    900_000
}

fn default_jitter() -> f64 {
    0.1
}

fn default_dedupe_provider() -> DedupeProvider {
    DedupeProvider::Memory
}

fn default_dedupe_ttl() -> u64 {
    86_400
}

fn default_grace_period() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> LogFormat {
    LogFormat::Pretty
}
