use std::time::Duration;

use envconfig::Envconfig;
use order_common::config::{EnvMsDuration, KafkaConfig, NonEmptyString, RetryPolicyConfig};
use order_common::retry::RetryPolicy;

use crate::generator::GeneratorSettings;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3303")]
    pub port: u16,

    #[envconfig(nested = true)]
    pub kafka: KafkaConfig,

    #[envconfig(default = "orders")]
    pub publish_topic: NonEmptyString,

    #[envconfig(default = "1.0")]
    pub events_per_second: f64,

    /// Stop after this long, run until signalled when unset
    pub run_duration: Option<EnvMsDuration>,

    #[envconfig(default = "5")]
    pub publish_max_attempts: u32,

    #[envconfig(nested = true)]
    pub retry_policy: RetryPolicyConfig,
}

impl Config {
    /// Produce a host:port address for binding a TcpListener.
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    pub fn settings(&self) -> eyre::Result<GeneratorSettings> {
        if !self.events_per_second.is_finite() || self.events_per_second <= 0.0 {
            eyre::bail!(
                "EVENTS_PER_SECOND must be a positive number, got {}",
                self.events_per_second
            );
        }
        if self.publish_max_attempts == 0 {
            eyre::bail!("PUBLISH_MAX_ATTEMPTS must be at least 1");
        }

        let interval = Duration::try_from_secs_f64(1.0 / self.events_per_second).map_err(|e| {
            eyre::eyre!(
                "EVENTS_PER_SECOND {} gives an unusable interval: {}",
                self.events_per_second,
                e
            )
        })?;

        Ok(GeneratorSettings {
            topic: self.publish_topic.as_str().to_owned(),
            interval,
            duration: self.run_duration.map(|d| d.0),
            max_attempts: self.publish_max_attempts,
            retry_policy: RetryPolicy::from(&self.retry_policy),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn config_from(vars: &[(&str, &str)]) -> Config {
        let env: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::init_from_hashmap(&env).expect("failed to load config")
    }

    #[test]
    fn test_defaults_publish_once_per_second_forever() {
        let config = config_from(&[]);
        let settings = config.settings().unwrap();

        assert_eq!(config.bind(), "0.0.0.0:3303");
        assert_eq!(settings.topic, "orders");
        assert_eq!(settings.interval, Duration::from_secs(1));
        assert_eq!(settings.duration, None);
        assert_eq!(settings.max_attempts, 5);
    }

    #[test]
    fn test_rate_and_duration() {
        let config = config_from(&[("EVENTS_PER_SECOND", "4"), ("RUN_DURATION", "60000")]);
        let settings = config.settings().unwrap();

        assert_eq!(settings.interval, Duration::from_millis(250));
        assert_eq!(settings.duration, Some(Duration::from_secs(60)));
    }

    #[test]
    fn test_invalid_rate() {
        for rate in ["0", "-1", "NaN", "inf", "1e-30"] {
            let config = config_from(&[("EVENTS_PER_SECOND", rate)]);
            assert!(config.settings().is_err(), "rate {rate} was accepted");
        }
    }
}
