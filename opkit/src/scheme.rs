//! The cluster scheme: the mapping from Rust resource types to their
//! group/version/kind identity on the cluster.
//!
//! The original problem here is bridging compile-time generics and a runtime
//! type registry. Registration captures each type's [`TypeId`] next to the
//! kind name it is served under; typed clients and reconcilers later resolve
//! their [`ApiResource`] by type id alone, so call sites never repeat the
//! group/version/kind triple.

use std::{
    any::TypeId,
    collections::{HashMap, HashSet},
};

use kube::core::{ApiResource, GroupVersionKind};

use crate::{
    error::{Error, Result},
    observe::{Level, ObsContext, Observability},
};

/// One kind-name-to-type binding inside a [`CrdGroup`].
#[derive(Clone, Debug)]
pub struct KindEntry {
    kind: String,
    type_id: TypeId,
    type_name: &'static str,
}

impl KindEntry {
    /// Bind the kind name `kind` to the Rust type `K`.
    ///
    /// `K` is usually an [`Envelope`](crate::resource::Envelope) alias. Two
    /// kinds must not share one Rust type; the scheme rejects that at build
    /// time since type-id lookup could no longer tell them apart.
    pub fn of<K: 'static>(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            type_id: TypeId::of::<K>(),
            type_name: std::any::type_name::<K>(),
        }
    }
}

/// The custom resource kinds one API group/version serves.
#[derive(Clone, Debug, Default)]
pub struct CrdGroup {
    /// API group, e.g. `testing.opkit.dev`
    pub group: String,
    /// API version within the group, e.g. `v1`
    pub version: String,
    /// The kind bindings
    pub kinds: Vec<KindEntry>,
}

#[derive(Clone, Debug)]
pub(crate) struct SchemeEntry {
    pub(crate) resource: ApiResource,
    pub(crate) kind: String,
}

/// Immutable after construction; shared read-only by every client.
#[derive(Clone, Debug, Default)]
pub(crate) struct Scheme {
    by_type: HashMap<TypeId, SchemeEntry>,
}

impl Scheme {
    /// Build the scheme from the configured descriptors.
    ///
    /// Duplicate kind names within one group/version and duplicate Rust types
    /// are rejected rather than silently overwritten.
    pub(crate) fn build(
        groups: &[CrdGroup],
        obs: &Observability,
        ctx: &ObsContext,
    ) -> Result<Self> {
        let mut by_type = HashMap::new();
        let mut seen_kinds: HashSet<(String, String)> = HashSet::new();

        for group in groups {
            for entry in &group.kinds {
                let gvk = GroupVersionKind::gvk(&group.group, &group.version, &entry.kind);
                let api_version = gvk.api_version();

                if !seen_kinds.insert((api_version.clone(), entry.kind.clone())) {
                    return Err(Error::DuplicateKind {
                        api_version,
                        kind: entry.kind.clone(),
                    });
                }

                let resource = ApiResource::from_gvk(&gvk);
                obs.log(
                    ctx,
                    Level::Debug,
                    "registering kind type mapping in scheme",
                    &[
                        ("gvk", format!("{}/{}", api_version, entry.kind)),
                        ("kind_type", entry.type_name.to_string()),
                    ],
                );

                let previous = by_type.insert(entry.type_id, SchemeEntry {
                    resource,
                    kind: entry.kind.clone(),
                });
                if previous.is_some() {
                    return Err(Error::DuplicateType {
                        type_name: entry.type_name,
                    });
                }
            }
        }

        Ok(Self { by_type })
    }

    /// Resolve the identity registered for `K`.
    pub(crate) fn resolve<K: 'static>(&self) -> Result<&SchemeEntry> {
        self.by_type
            .get(&TypeId::of::<K>())
            .ok_or(Error::UnregisteredType {
                type_name: std::any::type_name::<K>(),
            })
    }
}
