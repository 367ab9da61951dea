//! Helmer: chart collaborator for the special resource controller
//!
//! Loads charts from `file://` repositories, renders their templates with
//! the merged values of one reconcile step, and server-side applies the
//! resulting objects on behalf of an owning SpecialResource.
//!
//! # Example
//!
//! ```no_run
//! use helmer::{ApplyRequest, HelmerTrait, KubeHelmer};
//! # use crds::ChartReference;
//! # use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
//!
//! # async fn example(chart_ref: ChartReference, owner: OwnerReference) -> Result<(), Box<dyn std::error::Error>> {
//! let client = kube::Client::try_default().await?;
//! let helmer = KubeHelmer::new(client, "/charts");
//!
//! let chart = helmer.load_chart(&chart_ref).await?;
//! let values = chart.values.clone();
//! helmer
//!     .run(ApplyRequest::new(chart, values, owner, "simple-kmod", "simple-kmod"))
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod models;
#[path = "trait.rs"]
pub mod helmer_trait;
#[cfg(feature = "test-util")]
pub mod mock;

pub use client::KubeHelmer;
pub use error::HelmerError;
pub use helmer_trait::HelmerTrait;
pub use models::*;
#[cfg(feature = "test-util")]
pub use mock::{ApplyCall, MockHelmer};

/// Label marking an object as replicated per kernel version
pub const KERNEL_AFFINE_LABEL: &str = "specialresource.openshift.io/kernel-affine";

/// Node label carrying the full kernel version (set by node-feature-discovery)
pub const KERNEL_VERSION_NODE_LABEL: &str = "feature.node.kubernetes.io/kernel-version.full";

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "special-resource-controller";
