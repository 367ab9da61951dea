//! HelmerTrait for mocking
//!
//! The controller only depends on this trait; tests swap in `MockHelmer`
//! (behind the `test-util` feature) to record apply calls without a cluster.

use crds::ChartReference;

use crate::error::HelmerError;
use crate::models::{ApplyRequest, Chart};

/// Chart operations needed by the reconcile loop
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait HelmerTrait: Send + Sync {
    /// Resolve a chart reference to a loaded chart
    async fn load_chart(&self, reference: &ChartReference) -> Result<Chart, HelmerError>;

    /// Render every template of `request.chart` and apply the objects.
    ///
    /// Failures of individual objects are collected and returned together.
    async fn run(&self, request: ApplyRequest) -> Result<(), HelmerError>;
}
