//! Task-type registry.
//!
//! Every task type is registered once at startup with:
//! - a parameter schema (a typed [`TaskKind`] or a dynamic validator)
//! - a failure classifier used by the retry manager
//! - optionally an executor, on processes that run workers
//!
//! Submissions for unregistered types are rejected.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{ExecutionError, FailureKind, ValidationError};

use super::executor::{TaskExecutor, Typed, TypedExecutor};

/// Typed parameter schema of a task type.
///
/// ```rust,ignore
/// #[derive(Serialize, Deserialize)]
/// struct ScrapeVideo { url: String }
///
/// impl TaskKind for ScrapeVideo {
///     const TYPE: &'static str = "scrape_video";
/// }
/// ```
pub trait TaskKind: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Task type tag stored on each task.
    const TYPE: &'static str;

    /// Semantic checks beyond what deserialization enforces.
    fn validate(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Binary failure class used by the retry manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Worth retrying after a delay.
    Transient,
    /// Retrying cannot help.
    Permanent,
}

impl fmt::Display for FailureClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureClass::Transient => f.write_str("transient"),
            FailureClass::Permanent => f.write_str("permanent"),
        }
    }
}

/// Classifier used when a task type does not register its own.
///
/// Timeouts, exhausted resources, network and unknown errors are
/// transient; bad input, logic errors and cancellations are permanent.
pub fn default_classifier(error: &ExecutionError) -> FailureClass {
    match error.kind {
        FailureKind::Timeout
        | FailureKind::ResourceExhausted
        | FailureKind::Network
        | FailureKind::Other => FailureClass::Transient,
        FailureKind::InvalidInput | FailureKind::Logic | FailureKind::Cancelled => {
            FailureClass::Permanent
        }
    }
}

type Validator = Arc<dyn Fn(&serde_json::Value) -> Result<(), String> + Send + Sync>;
type Classifier = Arc<dyn Fn(&ExecutionError) -> FailureClass + Send + Sync>;

struct Registration {
    validator: Validator,
    classifier: Classifier,
    executor: Option<Arc<dyn TaskExecutor>>,
}

/// Registered task types.
#[derive(Default)]
pub struct TaskRegistry {
    types: HashMap<String, Registration>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a typed task kind without an executor.
    pub fn register<K: TaskKind>(&mut self) -> Result<(), ValidationError> {
        self.insert(K::TYPE, typed_validator::<K>(), None)
    }

    /// Registers a typed task kind together with its executor.
    pub fn register_with_executor<K, E>(&mut self, executor: E) -> Result<(), ValidationError>
    where
        K: TaskKind,
        E: TypedExecutor<K> + 'static,
    {
        let executor: Arc<dyn TaskExecutor> = Arc::new(Typed::<K, E>::new(executor));
        self.insert(K::TYPE, typed_validator::<K>(), Some(executor))
    }

    /// Registers a task type whose parameters are checked by `validator`.
    pub fn register_dynamic<F>(&mut self, task_type: &str, validator: F) -> Result<(), ValidationError>
    where
        F: Fn(&serde_json::Value) -> Result<(), String> + Send + Sync + 'static,
    {
        self.insert(task_type, Arc::new(validator), None)
    }

    /// Attaches an executor to a registered type.
    pub fn set_executor(
        &mut self,
        task_type: &str,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), ValidationError> {
        self.entry_mut(task_type)?.executor = Some(executor);
        Ok(())
    }

    /// Replaces the failure classifier of a registered type.
    pub fn set_classifier<F>(&mut self, task_type: &str, classifier: F) -> Result<(), ValidationError>
    where
        F: Fn(&ExecutionError) -> FailureClass + Send + Sync + 'static,
    {
        let classifier: Classifier = Arc::new(classifier);
        self.entry_mut(task_type)?.classifier = classifier;
        Ok(())
    }

    /// Checks `parameters` against the schema of `task_type`.
    pub fn validate(&self, task_type: &str, parameters: &serde_json::Value) -> Result<(), ValidationError> {
        if task_type.trim().is_empty() {
            return Err(ValidationError::EmptyTaskType);
        }
        let registration = self
            .types
            .get(task_type)
            .ok_or_else(|| ValidationError::UnknownTaskType(task_type.to_string()))?;
        (registration.validator)(parameters).map_err(|reason| ValidationError::InvalidParameters {
            task_type: task_type.to_string(),
            reason,
        })
    }

    /// Classifies an execution failure of `task_type`.
    pub fn classify(&self, task_type: &str, error: &ExecutionError) -> FailureClass {
        match self.types.get(task_type) {
            Some(registration) => (registration.classifier)(error),
            None => default_classifier(error),
        }
    }

    /// Executor for `task_type`, if this process has one.
    pub fn executor(&self, task_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.types.get(task_type).and_then(|r| r.executor.clone())
    }

    pub fn contains(&self, task_type: &str) -> bool {
        self.types.contains_key(task_type)
    }

    /// All registered type tags, sorted.
    pub fn task_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.types.keys().cloned().collect();
        types.sort();
        types
    }

    /// Type tags that have an executor in this process, sorted.
    pub fn executable_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self
            .types
            .iter()
            .filter(|(_, r)| r.executor.is_some())
            .map(|(name, _)| name.clone())
            .collect();
        types.sort();
        types
    }

    fn insert(
        &mut self,
        task_type: &str,
        validator: Validator,
        executor: Option<Arc<dyn TaskExecutor>>,
    ) -> Result<(), ValidationError> {
        if task_type.trim().is_empty() {
            return Err(ValidationError::EmptyTaskType);
        }
        if self.types.contains_key(task_type) {
            return Err(ValidationError::DuplicateTaskType(task_type.to_string()));
        }
        self.types.insert(
            task_type.to_string(),
            Registration {
                validator,
                classifier: Arc::new(default_classifier),
                executor,
            },
        );
        Ok(())
    }

    fn entry_mut(&mut self, task_type: &str) -> Result<&mut Registration, ValidationError> {
        self.types
            .get_mut(task_type)
            .ok_or_else(|| ValidationError::UnknownTaskType(task_type.to_string()))
    }
}

impl fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("task_types", &self.task_types())
            .field("executable_types", &self.executable_types())
            .finish()
    }
}

fn typed_validator<K: TaskKind>() -> Validator {
    Arc::new(|parameters: &serde_json::Value| {
        let kind: K = serde_json::from_value(parameters.clone()).map_err(|e| e.to_string())?;
        kind.validate()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Serialize, Deserialize)]
    struct ScrapeVideo {
        url: String,
        #[serde(default)]
        depth: u32,
    }

    impl TaskKind for ScrapeVideo {
        const TYPE: &'static str = "scrape_video";

        fn validate(&self) -> Result<(), String> {
            if self.url.starts_with("http") {
                Ok(())
            } else {
                Err(format!("url '{}' is not http(s)", self.url))
            }
        }
    }

    #[test]
    fn test_register_and_validate() {
        let mut registry = TaskRegistry::new();
        registry.register::<ScrapeVideo>().expect("register");

        assert!(registry
            .validate("scrape_video", &serde_json::json!({"url": "https://example.com"}))
            .is_ok());

        let err = registry
            .validate("scrape_video", &serde_json::json!({"depth": 2}))
            .unwrap_err();
        assert!(matches!(err, ValidationError::InvalidParameters { .. }));
        assert!(err.to_string().contains("url"));

        let err = registry
            .validate("scrape_video", &serde_json::json!({"url": "ftp://x"}))
            .unwrap_err();
        assert!(err.to_string().contains("not http"));
    }

    #[test]
    fn test_unknown_and_empty_types() {
        let registry = TaskRegistry::new();
        assert!(matches!(
            registry.validate("nope", &serde_json::json!({})),
            Err(ValidationError::UnknownTaskType(_))
        ));
        assert!(matches!(
            registry.validate("  ", &serde_json::json!({})),
            Err(ValidationError::EmptyTaskType)
        ));
    }

    #[test]
    fn test_double_registration() {
        let mut registry = TaskRegistry::new();
        registry.register::<ScrapeVideo>().expect("register");
        assert!(matches!(
            registry.register::<ScrapeVideo>(),
            Err(ValidationError::DuplicateTaskType(_))
        ));
    }

    #[test]
    fn test_dynamic_validator() {
        let mut registry = TaskRegistry::new();
        registry
            .register_dynamic("classify", |v| {
                if v.get("text").and_then(|t| t.as_str()).is_some() {
                    Ok(())
                } else {
                    Err("missing string field 'text'".to_string())
                }
            })
            .expect("register");

        assert!(registry.validate("classify", &serde_json::json!({"text": "hi"})).is_ok());
        assert!(registry.validate("classify", &serde_json::json!({"text": 1})).is_err());
        assert_eq!(registry.task_types(), vec!["classify".to_string()]);
        assert!(registry.executable_types().is_empty());
    }

    #[test]
    fn test_default_classifier() {
        assert_eq!(
            default_classifier(&ExecutionError::timeout("slow")),
            FailureClass::Transient
        );
        assert_eq!(
            default_classifier(&ExecutionError::network("reset")),
            FailureClass::Transient
        );
        assert_eq!(
            default_classifier(&ExecutionError::invalid_input("bad")),
            FailureClass::Permanent
        );
        assert_eq!(
            default_classifier(&ExecutionError::logic("bug")),
            FailureClass::Permanent
        );
    }

    #[test]
    fn test_custom_classifier() {
        let mut registry = TaskRegistry::new();
        registry.register::<ScrapeVideo>().expect("register");
        registry
            .set_classifier("scrape_video", |_| FailureClass::Permanent)
            .expect("set classifier");

        assert_eq!(
            registry.classify("scrape_video", &ExecutionError::network("reset")),
            FailureClass::Permanent
        );
        assert_eq!(
            registry.classify("unregistered", &ExecutionError::network("reset")),
            FailureClass::Transient
        );
        assert!(registry.set_classifier("unregistered", |_| FailureClass::Transient).is_err());
    }
}
