/// Environment construction for new workers
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

use super::configuration::WorkerConfiguration;

pub const ENTRY_POINT_KEY: &str = "WORKER_ENTRYPOINT";
pub const PARENT_PID_KEY: &str = "WORKER_PARENT_PID";
pub const SANDBOXED_HINT_KEY: &str = "WORKER_CRASH_REPORTER_SANDBOXED_HINT";
pub const PROCESS_TYPE_KEY: &str = "WORKER_CRASH_REPORTER_PROCESS_TYPE";

/// Environment keys a worker must not inherit
pub trait DenyList: Send + Sync {
    fn is_denied(&self, key: &str) -> bool;
}

/// Keys known to crash or destabilize child processes, plus configured extras
#[derive(Debug, Clone, Default)]
pub struct DefaultDenyList {
    extra: Vec<String>,
}

impl DefaultDenyList {
    pub fn new(extra: Vec<String>) -> Self {
        Self { extra }
    }

    fn builtin() -> &'static [&'static str] {
        if cfg!(target_os = "macos") {
            &["DEBUG", "DYLD_LIBRARY_PATH"]
        } else if cfg!(target_os = "linux") {
            &["DEBUG", "LD_PRELOAD"]
        } else {
            &["DEBUG"]
        }
    }
}

impl DenyList for DefaultDenyList {
    fn is_denied(&self, key: &str) -> bool {
        let matches = |denied: &str| {
            if cfg!(windows) {
                denied.eq_ignore_ascii_case(key)
            } else {
                denied == key
            }
        };

        Self::builtin().iter().any(|denied| matches(denied)) || self.extra.iter().any(|denied| matches(denied))
    }
}

/// Derives the sanitized environment map handed to a worker
#[derive(Clone)]
pub struct EnvironmentBuilder {
    deny_list: Arc<dyn DenyList>,
}

impl EnvironmentBuilder {
    pub fn new(deny_list: Arc<dyn DenyList>) -> Self {
        Self { deny_list }
    }

    /// Build the worker environment
    ///
    /// `base` is the ambient environment, used only when the configuration
    /// carries no environment of its own.
    pub fn build<I>(&self, base: I, config: &WorkerConfiguration, owner_is_sandboxed: bool) -> HashMap<String, String>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut env: HashMap<String, Value> = match &config.env {
            Some(env) => env.clone(),
            None => base.into_iter().map(|(k, v)| (k, Value::String(v))).collect(),
        };

        env.insert(ENTRY_POINT_KEY.to_string(), Value::String(config.entry_point.clone()));
        if let Some(parent_pid) = config.parent_lifecycle_bound {
            env.insert(PARENT_PID_KEY.to_string(), Value::String(parent_pid.to_string()));
        }
        if owner_is_sandboxed {
            env.insert(SANDBOXED_HINT_KEY.to_string(), Value::String("1".to_string()));
        }
        env.insert(PROCESS_TYPE_KEY.to_string(), Value::String(config.process_type.clone()));

        env.into_iter()
            .filter(|(key, _)| !self.deny_list.is_denied(key))
            .filter_map(|(key, value)| coerce(value).map(|value| (key, value)))
            .collect()
    }
}

impl Default for EnvironmentBuilder {
    fn default() -> Self {
        Self::new(Arc::new(DefaultDenyList::default()))
    }
}

/// The supervisor's own environment, lossily decoded
pub fn ambient_environment() -> impl Iterator<Item = (String, String)> {
    std::env::vars_os().map(|(k, v)| (k.to_string_lossy().into_owned(), v.to_string_lossy().into_owned()))
}

fn coerce(value: Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) => Some(s),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        other => Some(other.to_string()),
    }
}
