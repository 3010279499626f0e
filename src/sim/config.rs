use std::str::FromStr;

use log::warn;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use toml::{Table, Value};

use crate::base::error::{SimError, SimResult};
use crate::timeq::Cycle;

pub trait Config: DeserializeOwned + Default {
    fn from_section(section: Option<&Value>) -> SimResult<Self> {
        match section {
            Some(value) => value.clone().try_into().map_err(|err: toml::de::Error| {
                SimError::invalid_config(std::any::type_name::<Self>(), err.to_string())
            }),
            None => {
                warn!("config section not found");
                Ok(Self::default())
            }
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SimConfig {
    /// Cycles between two heartbeats delivered to every stage.
    pub heartbeat_interval: Cycle,
    pub max_cycles: Cycle,
}

impl Config for SimConfig {}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: 100_000,
            max_cycles: 10_000_000,
        }
    }
}

/// Synthetic request stream used when no trace file is supplied.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrafficConfig {
    pub requests: u64,
    pub cores: u32,
    /// Working set in KB.
    pub footprint_kb: u64,
    /// Probability that a request walks sequentially instead of jumping randomly.
    pub sequential_rate: f64,
    pub write_rate: f64,
    /// Mean cycles between requests of one core.
    pub issue_gap: Cycle,
    pub seed: u64,
}

impl Config for TrafficConfig {}

impl Default for TrafficConfig {
    fn default() -> Self {
        Self {
            requests: 100_000,
            cores: 1,
            footprint_kb: 8192,
            sequential_rate: 0.5,
            write_rate: 0.1,
            issue_gap: 4,
            seed: 0,
        }
    }
}

/// One `[[stage]]` entry: the component kind, an optional instance name and the remaining keys
/// as the component's own parameters.
#[derive(Debug, Clone)]
pub struct StageSpec {
    pub kind: String,
    pub name: Option<String>,
    pub params: Table,
}

impl StageSpec {
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            name: None,
            params: Table::new(),
        }
    }

    pub fn with_param(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.params.insert(key.to_string(), value.into());
        self
    }

    fn from_value(index: usize, value: &Value) -> SimResult<Self> {
        let component = format!("stage[{}]", index);
        let mut params = value
            .as_table()
            .cloned()
            .ok_or_else(|| SimError::invalid_config(&component, "expected a table"))?;
        let kind = match params.remove("kind") {
            Some(Value::String(kind)) => kind,
            _ => return Err(SimError::invalid_config(&component, "missing string key 'kind'")),
        };
        let name = match params.remove("name") {
            Some(Value::String(name)) => Some(name),
            Some(_) => return Err(SimError::invalid_config(&component, "'name' must be a string")),
            None => None,
        };
        Ok(Self { kind, name, params })
    }

    /// Typed view of the component parameters.
    pub fn params<C: Config>(&self) -> SimResult<C> {
        C::from_section(Some(&Value::Table(self.params.clone())))
    }
}

#[derive(Debug, Clone, Default)]
pub struct HierarchyConfig {
    pub sim: SimConfig,
    pub traffic: TrafficConfig,
    pub stages: Vec<StageSpec>,
}

impl FromStr for HierarchyConfig {
    type Err = SimError;

    fn from_str(text: &str) -> SimResult<Self> {
        let table: Table = toml::from_str(text)
            .map_err(|err| SimError::invalid_config("config", err.to_string()))?;
        let sim = SimConfig::from_section(table.get("sim"))?;
        let traffic = match table.get("traffic") {
            Some(section) => TrafficConfig::from_section(Some(section))?,
            None => TrafficConfig::default(),
        };
        let stages = match table.get("stage") {
            Some(Value::Array(entries)) => entries
                .iter()
                .enumerate()
                .map(|(i, v)| StageSpec::from_value(i, v))
                .collect::<SimResult<Vec<_>>>()?,
            Some(_) => {
                return Err(SimError::invalid_config(
                    "config",
                    "'stage' must be an array of tables",
                ))
            }
            None => Vec::new(),
        };
        if stages.is_empty() {
            return Err(SimError::invalid_config("config", "no [[stage]] entries"));
        }
        Ok(Self {
            sim,
            traffic,
            stages,
        })
    }
}
