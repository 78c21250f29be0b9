//! 🔧 App Configuration: the sacred TOML-to-struct pipeline.
//!
//! 📡 "Config not found: We looked everywhere. Under the couch. Behind the fridge.
//! In the junk drawer. Nothing." -- every developer at 3am 🦆
//!
//! 🏗️ Powered by Figment, because manually parsing env vars is a form of
//! self-harm that even the borrow checker wouldn't approve of.
//!
//! Each section's struct lives next to the component it configures and is
//! re-exported here, so callers only ever need `app_config::*`.

use std::path::Path;

use anyhow::Context;
use figment::{
    Figment,
    providers::{Env, Format, Toml},
};
use serde::Deserialize;
use tracing::info;

pub use crate::broker::BrokerConfig;
pub use crate::checkpoint::CheckpointConfig;
pub use crate::generator::{RandomUserConfig, SourceConfig};
pub use crate::store::StoreConfig;
pub use crate::workers::consumer_worker::{ConsumerConfig, StartPolicy};
pub use crate::workers::producer_worker::{ProducerConfig, PublishRetryConfig};

/// 🌍 Env vars with this prefix are merged under the TOML file. `__` separates nesting.
pub const ENV_PREFIX: &str = "USTREAM_";

/// 📦 The AppConfig: one struct to rule them all, one struct to find them,
/// one struct to bring them all, and in the Figment bind them.
///
/// 🎯 Every section defaults, so an empty file (or no file) points everything at
/// localhost: Kafka on 9092, Cassandra on 9042, randomuser.me on the internet.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct AppConfig {
    /// 📡 Where fake users come from.
    #[serde(default)]
    pub source: SourceConfig,
    /// ✉️ The Kafka side of things.
    #[serde(default)]
    pub broker: BrokerConfig,
    /// 🏛️ The Cassandra side of things.
    #[serde(default)]
    pub store: StoreConfig,
    #[serde(default)]
    pub checkpoint: CheckpointConfig,
    #[serde(default)]
    pub producer: ProducerConfig,
    #[serde(default)]
    pub consumer: ConsumerConfig,
}

/// 🚀 Load the config: from a file, from env vars, or from the sheer power of hoping.
///
/// 📐 Layering:
///   - `USTREAM_*` env vars are the base layer (`USTREAM_BROKER__TOPIC=users`).
///   - If `config_file_name` is Some, that TOML file is merged on top. TOML wins on conflicts.
///   - If it's None: env vars and defaults only. No file, no assumptions.
///
/// 💀 Returns an error if the config is unparseable, with a context line that says
/// which inputs were involved.
pub fn load_config(config_file_name: Option<&Path>) -> anyhow::Result<AppConfig> {
    info!(
        "🔧 Loading configuration: {:#?}",
        config_file_name.unwrap_or(Path::new(""))
    );

    let config = Figment::new().merge(Env::prefixed(ENV_PREFIX).split("__"));

    let config = match config_file_name {
        Some(file_name) => config.merge(Toml::file(file_name)),
        None => config,
    };

    let context_msg = match config_file_name {
        Some(path) => format!(
            "💀 Failed to parse configuration from file '{}' and environment variables ({ENV_PREFIX}*). \
             The file exists in our hearts, but apparently not in a shape serde recognises.",
            path.display()
        ),
        None => format!(
            "💀 Failed to parse configuration from environment variables ({ENV_PREFIX}*). \
             No file was provided, so this one's all on the environment. Classic."
        ),
    };

    config.extract().context(context_msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    // 🧪 Every test runs inside a figment Jail: its own cwd, its own env, one at a time.
    // Otherwise the env-var test leaks USTREAM_* into its neighbours mid-run.
    fn load_from_jail(jail: &mut figment::Jail, contents: &str) -> figment::error::Result<AppConfig> {
        jail.create_file("userstream.toml", contents)?;
        load_config(Some(Path::new("userstream.toml")))
            .map_err(|e| figment::Error::from(format!("{e:#}")))
    }

    #[test]
    fn the_one_where_every_section_has_a_sensible_default() {
        figment::Jail::expect_with(|jail| {
            let app_config = load_from_jail(jail, "")?;

            match &app_config.source {
                SourceConfig::RandomUser(random_user) => {
                    assert_eq!(random_user.url, "https://randomuser.me/api/");
                    assert_eq!(random_user.request_timeout(), Duration::from_secs(5));
                }
                honestly_who_knows => panic!(
                    "💀 Expected the random_user source by default, got {honestly_who_knows:?}"
                ),
            }
            assert_eq!(app_config.broker.topic, "user_stream");
            assert_eq!(app_config.broker.bootstrap_servers, "localhost:9092");
            assert_eq!(app_config.store.keyspace, "spark_streams");
            assert_eq!(app_config.store.table, "user_stream");
            assert_eq!(app_config.store.nodes, vec!["127.0.0.1:9042".to_string()]);
            assert_eq!(
                app_config.checkpoint.path,
                PathBuf::from("/tmp/checkpoint/user_stream.json")
            );
            assert_eq!(app_config.producer.window(), Duration::from_secs(10));
            assert_eq!(app_config.producer.send_timeout(), Duration::from_secs(5));
            assert_eq!(app_config.producer.publish_retry.max_attempts, 1);
            assert_eq!(app_config.consumer.start_policy, StartPolicy::Earliest);
            assert_eq!(app_config.consumer.max_batch_size, 100);
            Ok(())
        });
    }

    #[test]
    fn the_one_where_the_toml_file_moves_the_knobs() {
        figment::Jail::expect_with(|jail| {
            let app_config = load_from_jail(
                jail,
                r#"
                source = "fixture"

                [broker]
                bootstrap_servers = "broker:29092"
                topic = "users_created"

                [broker.client_properties]
                "security.protocol" = "ssl"

                [store]
                nodes = ["cassandra-1:9042", "cassandra-2:9042"]
                replication_factor = 3

                [producer]
                window_ms = 2500
                max_messages = 7

                [producer.publish_retry]
                max_attempts = 4
                backoff_ms = 250

                [consumer]
                group_id = "sink-a"
                start_policy = "latest"
                max_in_flight_batches = 3
                dead_letter_path = "/var/lib/userstream/dead.ndjson"
                "#,
            )?;

            assert!(matches!(app_config.source, SourceConfig::Fixture));
            assert_eq!(app_config.broker.bootstrap_servers, "broker:29092");
            assert_eq!(app_config.broker.topic, "users_created");
            assert_eq!(
                app_config.broker.client_properties.get("security.protocol"),
                Some(&"ssl".to_string())
            );
            assert_eq!(app_config.store.nodes.len(), 2);
            assert_eq!(app_config.store.replication_factor, 3);
            assert_eq!(app_config.producer.window(), Duration::from_millis(2500));
            assert_eq!(app_config.producer.max_messages, Some(7));
            assert_eq!(app_config.producer.publish_retry.max_attempts, 4);
            assert_eq!(
                app_config.producer.publish_retry.backoff(),
                Duration::from_millis(250)
            );
            assert_eq!(app_config.consumer.group_id, "sink-a");
            assert_eq!(app_config.consumer.start_policy, StartPolicy::Latest);
            assert_eq!(app_config.consumer.max_in_flight_batches, 3);
            assert_eq!(
                app_config.consumer.dead_letter_path,
                Some(PathBuf::from("/var/lib/userstream/dead.ndjson"))
            );
            Ok(())
        });
    }

    #[test]
    fn the_one_where_env_vars_fill_in_and_the_file_still_wins() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("USTREAM_BROKER__TOPIC", "from_env_topic");
            jail.set_env("USTREAM_STORE__KEYSPACE", "env_keyspace");
            jail.set_env("USTREAM_CONSUMER__GROUP_ID", "env_group");

            let app_config = load_from_jail(
                jail,
                r#"
                [consumer]
                group_id = "file_group"
                "#,
            )?;

            assert_eq!(app_config.broker.topic, "from_env_topic");
            assert_eq!(app_config.store.keyspace, "env_keyspace");
            assert_eq!(app_config.consumer.group_id, "file_group");
            Ok(())
        });
    }

    #[test]
    fn the_one_where_no_file_means_env_and_defaults_only() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("USTREAM_PRODUCER__WINDOW_MS", "1234");
            let app_config = load_config(None).map_err(|e| figment::Error::from(e.to_string()))?;
            assert_eq!(app_config.producer.window(), Duration::from_millis(1234));
            assert_eq!(app_config.broker.topic, "user_stream");
            Ok(())
        });
    }

    #[test]
    fn the_one_where_a_typo_in_the_source_kind_is_not_forgiven() {
        figment::Jail::expect_with(|jail| {
            let err = load_from_jail(jail, r#"source = "randumuser""#)
                .expect_err("💀 An unknown source kind should not parse.");
            assert!(err.to_string().contains("Failed to parse configuration"));
            Ok(())
        });
    }
}
