use std::str::FromStr;
use std::time;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct KafkaConfig {
    #[envconfig(default = "localhost:9092")]
    pub kafka_hosts: String,

    #[envconfig(default = "false")]
    pub kafka_tls: bool,

    #[envconfig(default = "20")]
    pub kafka_producer_linger_ms: u32, // Maximum time between producer batches during low traffic

    #[envconfig(default = "20000")]
    pub kafka_message_timeout_ms: u32, // Time before we stop retrying producing a message: 20 seconds

    #[envconfig(default = "none")]
    pub kafka_compression_codec: String, // none, gzip, snappy, lz4, zstd
}

#[derive(Envconfig, Clone)]
pub struct ConsumerConfig {
    #[envconfig(default = "orders-sub")]
    pub kafka_consumer_group: String,

    #[envconfig(default = "orders")]
    pub kafka_consumer_topic: String,

    #[envconfig(default = "earliest")]
    pub kafka_consumer_offset_reset: String, // earliest, latest

    /// How long a pull waits for a message before reporting an empty poll
    #[envconfig(from = "POLL_TIMEOUT", default = "1000")]
    pub poll_timeout: EnvMsDuration,
}

#[derive(Envconfig, Clone)]
pub struct RetryPolicyConfig {
    #[envconfig(from = "RETRY_POLICY_BACKOFF_COEFFICIENT", default = "2")]
    pub backoff_coefficient: u32,

    #[envconfig(from = "RETRY_POLICY_INITIAL_INTERVAL", default = "100")]
    pub initial_interval: EnvMsDuration,

    #[envconfig(from = "RETRY_POLICY_MAXIMUM_INTERVAL", default = "10000")]
    pub maximum_interval: EnvMsDuration,
}

#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(s.to_owned()))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_ms_duration() {
        let parsed: EnvMsDuration = "1500".parse().unwrap();
        assert_eq!(parsed.0, time::Duration::from_millis(1500));
        assert_eq!(
            "1.5s".parse::<EnvMsDuration>().unwrap_err(),
            ParseEnvMsDurationError
        );
    }

    #[test]
    fn test_non_empty_string() {
        assert_eq!("orders".parse::<NonEmptyString>().unwrap().as_str(), "orders");
        assert_eq!(
            "".parse::<NonEmptyString>().unwrap_err(),
            StringIsEmptyError
        );
    }
}
