//! Mock Helmer for unit testing
//!
//! Stores charts in memory and records every `run` call so tests can assert
//! on what would have been applied, in order. Failures can be injected per
//! kernel version or for every call.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use crds::ChartReference;
use serde_json::Value;

use crate::error::HelmerError;
use crate::helmer_trait::HelmerTrait;
use crate::models::{ApplyRequest, Chart};

/// One recorded `run` call
#[derive(Debug, Clone, PartialEq)]
pub struct ApplyCall {
    pub name: String,
    pub namespace: String,
    pub kernel_full_version: String,
    pub operating_system_decimal: String,
    /// Template names of the applied chart, in chart order
    pub templates: Vec<String>,
    pub values: Value,
    pub debug: bool,
}

/// Mock Helmer for testing
#[derive(Clone, Default)]
pub struct MockHelmer {
    charts: Arc<Mutex<HashMap<String, Chart>>>,
    calls: Arc<Mutex<Vec<ApplyCall>>>,
    failing_kernels: Arc<Mutex<HashSet<String>>>,
    fail_all: Arc<Mutex<bool>>,
}

impl std::fmt::Debug for MockHelmer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MockHelmer").finish_non_exhaustive()
    }
}

impl MockHelmer {
    /// Create a new mock with no charts
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a chart under a reference (for test setup)
    pub fn add_chart(&self, reference: &ChartReference, chart: Chart) {
        self.charts.lock().unwrap().insert(reference.to_string(), chart);
    }

    /// Make every `run` for this kernel version fail
    pub fn fail_kernel(&self, kernel_full_version: impl Into<String>) {
        self.failing_kernels
            .lock()
            .unwrap()
            .insert(kernel_full_version.into());
    }

    /// Make every `run` fail
    pub fn fail_all(&self) {
        *self.fail_all.lock().unwrap() = true;
    }

    /// Recorded calls, oldest first (failed calls included)
    pub fn calls(&self) -> Vec<ApplyCall> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl HelmerTrait for MockHelmer {
    async fn load_chart(&self, reference: &ChartReference) -> Result<Chart, HelmerError> {
        self.charts
            .lock()
            .unwrap()
            .get(&reference.to_string())
            .cloned()
            .ok_or_else(|| HelmerError::ChartNotFound(reference.to_string()))
    }

    async fn run(&self, request: ApplyRequest) -> Result<(), HelmerError> {
        self.calls.lock().unwrap().push(ApplyCall {
            name: request.name.clone(),
            namespace: request.namespace.clone(),
            kernel_full_version: request.kernel_full_version.clone(),
            operating_system_decimal: request.operating_system_decimal.clone(),
            templates: request.chart.template_names(),
            values: request.values.clone(),
            debug: request.debug,
        });

        let failing = *self.fail_all.lock().unwrap()
            || self
                .failing_kernels
                .lock()
                .unwrap()
                .contains(&request.kernel_full_version);
        if failing {
            return Err(HelmerError::Apply(vec![format!(
                "mock failure for kernel {}",
                request.kernel_full_version
            )]));
        }
        Ok(())
    }
}
