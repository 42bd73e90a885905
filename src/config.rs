//! Engine configuration.

use std::thread;

use crate::error::{Error, Result};

/// Configuration for an [`Ifca`](crate::Ifca) engine
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct IfcaConfig {
    /// Number of held chunks (processing + ready) at which writes return a drain signal
    pub max_parallel: usize,
    /// Run leading synchronous transforms eagerly during `write`
    pub strict: bool,
    /// Deliver chunks in write order rather than completion order
    pub ordered: bool,
    /// Label used in traces, metrics and fault reports
    pub name: String,
}

impl Default for IfcaConfig {
    fn default() -> Self {
        Self {
            max_parallel: default_max_parallel(),
            strict: true,
            ordered: true,
            name: "ifca".to_string(),
        }
    }
}

impl IfcaConfig {
    /// Default configuration with the given parallelism limit
    pub fn new(max_parallel: usize) -> Self {
        Self::default().max_parallel(max_parallel)
    }

    /// Set the parallelism limit
    pub fn max_parallel(mut self, max_parallel: usize) -> Self {
        self.max_parallel = max_parallel;
        self
    }

    /// Set whether synchronous transforms run eagerly
    pub fn strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    /// Set whether delivery follows write order
    pub fn ordered(mut self, ordered: bool) -> Self {
        self.ordered = ordered;
        self
    }

    /// Set the engine label
    pub fn name<S: Into<String>>(mut self, name: S) -> Self {
        self.name = name.into();
        self
    }

    /// Check the configuration before building an engine
    pub fn validate(&self) -> Result<()> {
        if self.max_parallel == 0 {
            return Err(Error::InvalidConfig(
                "max_parallel must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Twice the available parallelism of the host
fn default_max_parallel() -> usize {
    thread::available_parallelism()
        .map(|cores| cores.get() * 2)
        .unwrap_or(2)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = IfcaConfig::default();

        assert!(config.max_parallel >= 2);
        assert_eq!(config.max_parallel % 2, 0);
        assert!(config.strict);
        assert!(config.ordered);
        assert_eq!(config.name, "ifca");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_fluent_setters() {
        let config = IfcaConfig::new(4).strict(false).ordered(false).name("parse");

        assert_eq!(config.max_parallel, 4);
        assert!(!config.strict);
        assert!(!config.ordered);
        assert_eq!(config.name, "parse");
    }

    #[test]
    fn test_zero_parallelism_is_rejected() {
        let result = IfcaConfig::new(0).validate();
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }
}
