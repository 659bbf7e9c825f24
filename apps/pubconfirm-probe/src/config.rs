use config::{Config, ConfigError, Environment, File};
use pubconfirm_core::{Binding, Exchange, Queue, Topology, TopologyError};
use pubconfirm_engine::EngineConfig;
use pubconfirm_sim::{confirm_fixture, default_probe_cases, ProbeCase};
use serde::de::{self, Deserializer, Visitor};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Deserialize, Clone)]
pub struct ProbeConfig {
    #[serde(with = "humantime_serde")]
    pub wait_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reaper_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub resolved_grace: Duration,
    #[serde(with = "humantime_serde")]
    pub shutdown_drain_timeout: Duration,
    /// Exit non-zero when a probe misses its expected outcome.
    pub fail_on_mismatch: bool,
    /// Probe names to run; empty runs all of them.
    #[serde(deserialize_with = "deserialize_list")]
    pub only: Vec<String>,
    #[serde(default)]
    pub exchanges: Vec<Exchange>,
    #[serde(default)]
    pub queues: Vec<Queue>,
    #[serde(default)]
    pub bindings: Vec<Binding>,
    #[serde(default)]
    pub probes: Vec<ProbeCase>,
}

fn deserialize_list<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct ListVisitor;

    impl<'de> Visitor<'de> for ListVisitor {
        type Value = Vec<String>;

        fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
            formatter.write_str("a string or a sequence of strings")
        }

        fn visit_str<E>(self, value: &str) -> Result<Self::Value, E>
        where
            E: de::Error,
        {
            Ok(split_list(value))
        }

        fn visit_seq<S>(self, mut seq: S) -> Result<Self::Value, S::Error>
        where
            S: de::SeqAccess<'de>,
        {
            let mut vec = Vec::new();
            while let Some(element) = seq.next_element()? {
                vec.push(element);
            }
            Ok(vec)
        }
    }

    deserializer.deserialize_any(ListVisitor)
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(|c| c == ',' || c == ';')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

impl ProbeConfig {
    pub fn new(config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let mut builder = Config::builder()
            .set_default("wait_timeout", "5s")?
            .set_default("reaper_interval", "50ms")?
            .set_default("resolved_grace", "1s")?
            .set_default("shutdown_drain_timeout", "2s")?
            .set_default("fail_on_mismatch", true)?
            .set_default("only", Vec::<String>::new())?;

        if let Some(path) = config_path {
            if path.extension().and_then(|ext| ext.to_str()) == Some("env") {
                // .env files feed the PUBCONFIRM_* environment source below.
                match dotenvy::from_path(&path) {
                    Ok(_) => tracing::info!("loaded environment from {}", path.display()),
                    Err(err) => {
                        tracing::warn!("failed to load .env from {}: {}", path.display(), err)
                    }
                }
            } else {
                builder = builder.add_source(File::from(path));
            }
        }

        builder = builder.add_source(Environment::with_prefix("PUBCONFIRM").try_parsing(true));

        builder.build()?.try_deserialize()
    }

    pub fn engine_config(&self) -> EngineConfig {
        EngineConfig {
            default_wait_timeout: self.wait_timeout,
            reaper_interval: self.reaper_interval,
            resolved_grace: self.resolved_grace,
            shutdown_drain_timeout: self.shutdown_drain_timeout,
        }
    }

    /// Declared topology, or the canned confirm fixture when none is declared.
    pub fn topology(&self) -> Result<Topology, TopologyError> {
        if self.exchanges.is_empty() && self.queues.is_empty() && self.bindings.is_empty() {
            return confirm_fixture();
        }
        Topology::from_declarations(
            self.exchanges.iter().cloned(),
            self.queues.iter().cloned(),
            self.bindings.iter().cloned(),
        )
    }

    /// Configured probes (default cases when none), filtered by `only`.
    pub fn probe_cases(&self) -> Vec<ProbeCase> {
        let cases = if self.probes.is_empty() {
            default_probe_cases()
        } else {
            self.probes.clone()
        };
        if self.only.is_empty() {
            return cases;
        }
        cases
            .into_iter()
            .filter(|case| self.only.iter().any(|name| name == &case.name))
            .collect()
    }
}
