use std::sync::Arc;

use serde::Serialize;

/// State every hierarchy component carries: its instance name, its statistics and a shared,
/// immutable copy of its configuration.
#[derive(Debug)]
pub struct ModuleBase<S, C> {
    pub name: String,
    pub stats: S,
    pub config: Arc<C>,
}

impl<S: Default, C> ModuleBase<S, C> {
    pub fn new(name: impl Into<String>, config: C) -> Self {
        Self {
            name: name.into(),
            stats: S::default(),
            config: Arc::new(config),
        }
    }
}

pub trait IsModule {
    type StatsType: Serialize;
    type ConfigType;

    fn base(&mut self) -> &mut ModuleBase<Self::StatsType, Self::ConfigType>;

    fn base_ref(&self) -> &ModuleBase<Self::StatsType, Self::ConfigType>;

    fn stats_mut(&mut self) -> &mut Self::StatsType {
        &mut self.base().stats
    }

    fn stats(&self) -> &Self::StatsType {
        &self.base_ref().stats
    }

    fn conf(&self) -> &Self::ConfigType {
        &self.base_ref().config
    }
}

/// Object-safe view of a module used by the hierarchy for reporting.
pub trait Describe {
    fn name(&self) -> &str;

    fn stats_json(&self) -> serde_json::Value;
}

impl<X> Describe for X
where
    X: IsModule,
{
    fn name(&self) -> &str {
        &self.base_ref().name
    }

    fn stats_json(&self) -> serde_json::Value {
        serde_json::to_value(self.stats()).unwrap_or(serde_json::Value::Null)
    }
}

/// arguments: identifier, stats type, config type, additional methods
macro_rules! module {
    ($comp:ident, $S:ty, $C:ty, $($method:item)*) => {
        impl $crate::base::module::IsModule for $comp {
            type StatsType = $S;
            type ConfigType = $C;

            fn base(&mut self) -> &mut $crate::base::module::ModuleBase<$S, $C> {
                &mut self.base
            }

            fn base_ref(&self) -> &$crate::base::module::ModuleBase<$S, $C> {
                &self.base
            }

            $($method)*
        }
    };
}

pub(crate) use module;
