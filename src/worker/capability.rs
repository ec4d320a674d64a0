use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Advertised skill of a worker; informational only, never used for routing
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerCapability {
    pub name: String,
    pub description: String,
    pub input_types: Vec<String>,
    pub output_types: Vec<String>,
    pub performance_metrics: HashMap<String, f64>,
}

impl WorkerCapability {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            ..Self::default()
        }
    }

    pub fn with_input_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.input_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_output_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.output_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.performance_metrics.insert(name.into(), value);
        self
    }
}
