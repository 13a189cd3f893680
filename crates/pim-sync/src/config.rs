use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use pim_adapters::{ClassifierConfig, TicketingConfig};
use pim_storage::BackoffPolicy;

use crate::analysis::AnalysisConfig;
use crate::sync::SyncOptions;
use crate::worker::ScheduleConfig;

/// Process configuration, read once from the environment.
#[derive(Clone)]
pub struct PipelineConfig {
    pub database_url: Option<String>,
    pub ticketing: TicketingConfig,
    pub classifier: ClassifierConfig,
    pub sync: SyncOptions,
    pub analysis: AnalysisConfig,
    pub schedule: ScheduleConfig,
    pub web_port: u16,
    pub export_dir: PathBuf,
}

impl std::fmt::Debug for PipelineConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "***"))
            .field("ticketing", &self.ticketing)
            .field("classifier", &self.classifier)
            .field("sync", &self.sync)
            .field("analysis", &self.analysis)
            .field("schedule", &self.schedule)
            .field("web_port", &self.web_port)
            .field("export_dir", &self.export_dir)
            .finish()
    }
}

fn env_string(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str) -> bool {
    env_string(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True" | "yes"))
        .unwrap_or(false)
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let timeout = Duration::from_secs(env_parse("PIM_HTTP_TIMEOUT_SECS", 30));
        let subdomain = env_string("TICKETING_SUBDOMAIN").unwrap_or_else(|| "example".to_string());

        let ticketing = TicketingConfig {
            base_url: env_string("TICKETING_BASE_URL")
                .unwrap_or_else(|| format!("https://{subdomain}.zendesk.com/api/v2")),
            email: env_string("TICKETING_EMAIL").unwrap_or_default(),
            api_token: env_string("TICKETING_API_TOKEN").unwrap_or_default(),
            rate_limit_per_min: env_parse("TICKETING_RATE_LIMIT_PER_MIN", 700),
            timeout,
            backoff: BackoffPolicy::default(),
        };

        let classifier = ClassifierConfig {
            base_url: env_string("CLASSIFIER_BASE_URL")
                .unwrap_or_else(|| "https://api.anthropic.com/v1".to_string()),
            api_key: env_string("CLASSIFIER_API_KEY").unwrap_or_default(),
            model: env_string("CLASSIFIER_MODEL")
                .unwrap_or_else(|| "claude-sonnet-4-5".to_string()),
            rate_limit_per_min: env_parse("CLASSIFIER_RATE_LIMIT_PER_MIN", 50),
            timeout,
            backoff: BackoffPolicy::default(),
        };

        let defaults = ScheduleConfig::default();
        Self {
            database_url: env_string("DATABASE_URL"),
            ticketing,
            classifier,
            sync: SyncOptions {
                concurrency: env_parse("TICKETING_FETCH_CONCURRENCY", SyncOptions::default().concurrency),
                ..SyncOptions::default()
            },
            analysis: AnalysisConfig {
                batch_size: env_parse("PIM_ANALYSIS_BATCH_SIZE", AnalysisConfig::default().batch_size),
                commit_every: env_parse("PIM_COMMIT_EVERY", AnalysisConfig::default().commit_every),
            },
            schedule: ScheduleConfig {
                enabled: env_flag("PIM_SCHEDULER_ENABLED"),
                pipeline_cron: env_string("PIM_PIPELINE_CRON").unwrap_or(defaults.pipeline_cron),
                trends_cron: env_string("PIM_TRENDS_CRON").unwrap_or(defaults.trends_cron),
            },
            web_port: env_parse("PIM_WEB_PORT", 8000),
            export_dir: env_string("PIM_EXPORT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./exports")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn debug_output_hides_secrets() {
        let mut config = PipelineConfig::from_env();
        config.database_url = Some("postgres://pim:hunter2@db/pim".into());
        config.ticketing.api_token = "zd-token-value".into();
        config.classifier.api_key = "sk-secret-value".into();
        let printed = format!("{config:?}");
        assert!(!printed.contains("hunter2"));
        assert!(!printed.contains("zd-token-value"));
        assert!(!printed.contains("sk-secret-value"));
    }

    #[test]
    fn unparseable_numbers_fall_back_to_defaults() {
        assert_eq!(env_parse::<usize>("PIM_TEST_UNSET_NUMBER_FOR_CONFIG", 42), 42);
        assert!(!env_flag("PIM_TEST_UNSET_FLAG_FOR_CONFIG"));
    }
}
