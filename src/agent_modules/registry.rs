use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use super::job::{CheckJob, CheckResult};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Invalid check type: {0}")]
    UnknownCheckType(String),
}

/// A protocol-specific probe.
///
/// Implementations own their timeout and must abort their own I/O when it
/// expires. A checker may retry internally (follow a redirect, fall back to
/// another address family) but returns exactly one result per call.
#[async_trait]
pub trait Checker: Send + Sync {
    /// Type tag this checker is registered under.
    fn name(&self) -> &'static str;

    /// Runs one attempt. `job.attempt` persists across debounce retries of
    /// the same job and may be used to cache a resolved address.
    async fn check(&self, job: &mut CheckJob) -> CheckResult;
}

/// Maps lower-cased check type tags to checker implementations.
#[derive(Clone, Default)]
pub struct CheckerRegistry {
    checkers: HashMap<String, Arc<dyn Checker>>,
}

impl CheckerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `checker` under its own name.
    pub fn register(&mut self, checker: Arc<dyn Checker>) {
        let name = checker.name().to_ascii_lowercase();
        self.checkers.insert(name, checker);
    }

    /// Registers an additional tag for an already registered checker.
    pub fn alias(&mut self, alias: &str, target: &str) {
        if let Some(checker) = self.checkers.get(&target.to_ascii_lowercase()).cloned() {
            self.checkers.insert(alias.to_ascii_lowercase(), checker);
        }
    }

    /// Case-insensitive lookup.
    pub fn resolve(&self, check_type: &str) -> Result<Arc<dyn Checker>, RegistryError> {
        self.checkers
            .get(&check_type.trim().to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| RegistryError::UnknownCheckType(check_type.to_string()))
    }

    pub fn types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.checkers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_modules::job::now_ms;

    struct Noop;

    #[async_trait]
    impl Checker for Noop {
        fn name(&self) -> &'static str {
            "NOOP"
        }

        async fn check(&self, _job: &mut CheckJob) -> CheckResult {
            CheckResult::started_at(now_ms()).up("ok", "noop")
        }
    }

    #[test]
    fn test_resolve_is_case_insensitive() {
        let mut registry = CheckerRegistry::new();
        registry.register(Arc::new(Noop));
        registry.alias("Nothing", "noop");

        assert!(registry.resolve("noop").is_ok());
        assert!(registry.resolve(" NoOp ").is_ok());
        assert!(registry.resolve("NOTHING").is_ok());
        assert_eq!(registry.types(), vec!["noop", "nothing"]);
    }

    #[test]
    fn test_unknown_type_is_typed_error() {
        let registry = CheckerRegistry::new();
        match registry.resolve("smtp") {
            Err(e) => {
                assert_eq!(e, RegistryError::UnknownCheckType("smtp".to_string()));
                assert_eq!(e.to_string(), "Invalid check type: smtp");
            }
            Ok(_) => panic!("expected an error for an unregistered type"),
        }
    }
}
