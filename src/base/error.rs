use thiserror::Error;

use crate::sim::request::{RequestId, RequestKind};

/// Fatal simulation errors. Backpressure (full MSHR, full write buffer, rejected DRAM
/// transaction) is never reported through this type.
#[derive(Debug, Error)]
pub enum SimError {
    #[error("{component}: cannot handle {kind:?} requests")]
    UnsupportedRequest {
        component: String,
        kind: RequestKind,
    },

    #[error("{component}: completion for address {addr:#x} matches no in-flight request")]
    UnmatchedCompletion { component: String, addr: u64 },

    #[error("unknown replacement policy '{0}'")]
    UnknownPolicy(String),

    #[error("unknown component kind '{0}'")]
    UnknownComponent(String),

    #[error("unknown DRAM scheduler '{0}'")]
    UnknownScheduler(String),

    #[error("{component}: invalid configuration: {reason}")]
    InvalidConfig { component: String, reason: String },

    #[error("request {id} left stage {stage} unserviced with no stage below it")]
    Unserviced { id: RequestId, stage: usize },

    #[error("trace line {line}: {reason}")]
    Trace { line: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SimResult<T> = Result<T, SimError>;

impl SimError {
    pub fn invalid_config(component: impl Into<String>, reason: impl Into<String>) -> Self {
        SimError::InvalidConfig {
            component: component.into(),
            reason: reason.into(),
        }
    }
}

/// Bail out with `SimError::InvalidConfig` unless `cond` holds.
macro_rules! ensure_config {
    ($cond:expr, $component:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err($crate::base::error::SimError::invalid_config(
                $component,
                format!($($fmt)+),
            ));
        }
    };
}

pub(crate) use ensure_config;
