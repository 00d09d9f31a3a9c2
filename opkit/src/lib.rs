//! Opkit is a typed convenience layer for building Kubernetes operators on
//! top of [`kube`].
//!
//! # Overview
//!
//! Opkit wraps the cluster connection, type registration, typed CRUD access,
//! reconciler wiring and admission webhooks behind a small generics-based
//! surface, with observability injected rather than hard-wired.
//!
//! The main modules are:
//!
//! - [`resource`] with the generic [`Envelope`] custom-resource wrapper
//! - [`cluster`] with the [`Cluster`] handle, registration and lifecycle
//! - [`client`] with the typed [`Client`] for CRUD against registered kinds
//! - [`reconciler`] for binding reconcile callbacks with event filtering
//! - [`hook`] for binding admission (defaulting/validation) callbacks
//! - [`observe`] with the injected [`Observability`] contract
//!
//! # Example
//!
//! ```no_run
//! use opkit::{
//!     Cluster, ClusterConfig, CrdGroup, KindEntry, Observability, ObservabilityConfig,
//!     resource::{Envelope, Undefined},
//! };
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct WidgetSpec {
//!     example_data: String,
//! }
//!
//! type Widget = Envelope<WidgetSpec, Undefined, Undefined>;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let obs = Observability::new(ObservabilityConfig::tracing_default());
//!     let ctx = obs.background().clone();
//!
//!     let config = ClusterConfig {
//!         crds: vec![CrdGroup {
//!             group: "testing.opkit.dev".into(),
//!             version: "v1".into(),
//!             kinds: vec![KindEntry::of::<Widget>("Widget")],
//!         }],
//!         ..Default::default()
//!     };
//!     let cluster = Cluster::new(&ctx, config, obs).await?;
//!
//!     cluster.add_reconciler::<Widget>(
//!         &ctx,
//!         None,
//!         Box::new(|_ctx, event, widget| {
//!             Box::pin(async move {
//!                 println!("{event}: {:?}", widget.metadata.name);
//!                 Ok(())
//!             })
//!         }),
//!     )?;
//!
//!     // Blocks until the future is dropped (e.g. on SIGTERM).
//!     cluster.connect(&ctx).await?;
//!     Ok(())
//! }
//! ```

pub mod client;
pub mod cluster;
pub mod error;
pub mod hook;
pub mod observe;
pub mod reconciler;
pub mod resource;
pub mod scheme;

mod elector;

pub use client::{Client, Subresource};
pub use cluster::{Cluster, ClusterConfig, LeaderElectionConfig};
pub use error::{BoxError, Error, Result};
pub use hook::Hook;
pub use observe::{Level, ObsContext, Observability, ObservabilityConfig};
pub use reconciler::{ReconcileEvent, ResourceEvent};
pub use resource::{Envelope, EnvelopeKind, EnvelopeList, Undefined};
pub use scheme::{CrdGroup, KindEntry};
