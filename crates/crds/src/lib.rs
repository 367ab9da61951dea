//! Special Resource CRD Definitions
//!
//! Kubernetes Custom Resource Definitions for the special resource controller.

pub mod conditions;
pub mod references;
pub mod special_resource;
pub mod special_resource_module;

pub use conditions::*;
pub use references::*;
pub use special_resource::*;
pub use special_resource_module::*;

/// API group shared by every CRD in this crate
pub const API_GROUP: &str = "sro.openshift.io";

/// API version shared by every CRD in this crate
pub const API_VERSION: &str = "v1beta1";
