//! Controller implementations for Resonance CRDs
//!
//! The ClusterSync reconciler runs sync passes; the observer maps tracked
//! resource changes onto descriptors; the registry is the state they share.

mod cluster_sync;
pub mod observer;
pub mod registry;

pub use cluster_sync::{
    error_policy, propagate_all, reconcile, run_pass, Context, ContextBuilder, KubeClient,
    KubeClientImpl, PassReport,
};
pub use observer::descriptors_to_trigger;
pub use registry::{DescriptorKey, Gate, PassRegistry, RunReason};
