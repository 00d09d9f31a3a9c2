//! Typed CRUD access to registered custom resources.
//!
//! A [`Client`] is bound to one registered resource type and borrows its
//! parent [`Cluster`]. Reads can be served from the cluster's shared watch
//! cache when one exists for the type; writes always go to the API server.

use kube::{
    api::{Api, DeleteParams, ListParams, PostParams},
    core::{ApiResource, ErrorResponse},
    runtime::reflector::ObjectRef,
};

use crate::{
    cluster::Cluster,
    error::{Error, Result},
    observe::{Level, ObsContext},
    resource::{EnvelopeKind, EnvelopeList},
};

/// The updatable subresources of a custom resource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subresource {
    /// The `status` subresource
    Status,
    /// The `scale` subresource
    Scale,
}

impl Subresource {
    pub(crate) fn name(self) -> &'static str {
        match self {
            Subresource::Status => "status",
            Subresource::Scale => "scale",
        }
    }
}

/// A typed client for one registered resource type.
///
/// Obtained through [`Cluster::client`]. Every operation panics if the
/// cluster is not yet connected; using a client before [`Cluster::connect`]
/// is a wiring error in the integrating application.
pub struct Client<K> {
    cluster: Cluster,
    resource: ApiResource,
    kind: String,
    use_cache: bool,
    _kind: std::marker::PhantomData<fn() -> K>,
}

impl<K> Clone for Client<K> {
    fn clone(&self) -> Self {
        Self {
            cluster: self.cluster.clone(),
            resource: self.resource.clone(),
            kind: self.kind.clone(),
            use_cache: self.use_cache,
            _kind: std::marker::PhantomData,
        }
    }
}

impl<K: EnvelopeKind> Client<K> {
    /// Bind a client for `K` to `cluster`.
    ///
    /// With `use_cache` set, `get` and `list` are answered from the shared
    /// watch cache whenever the cluster maintains one for `K` (it does once a
    /// reconciler for `K` is registered and caching is not disabled); writes
    /// are unaffected. Fails if `K` is not in the cluster's scheme.
    pub fn bound_to(ctx: &ObsContext, cluster: &Cluster, use_cache: bool) -> Result<Self> {
        let entry = cluster.scheme().resolve::<K>()?;
        cluster.obs().log(
            ctx,
            Level::Debug,
            "binding typed client",
            &[
                ("resource_type", entry.kind.clone()),
                ("use_cache", use_cache.to_string()),
            ],
        );
        Ok(Self {
            cluster: cluster.clone(),
            resource: entry.resource.clone(),
            kind: entry.kind.clone(),
            use_cache,
            _kind: std::marker::PhantomData,
        })
    }

    /// The identity `K` is registered under.
    pub fn resource(&self) -> &ApiResource {
        &self.resource
    }

    /// Create `item` on the cluster.
    ///
    /// Store rejections (conflicts, admission denials, validation failures)
    /// are returned as-is inside [`Error::Api`]; no retry is attempted.
    pub async fn create(&self, ctx: &ObsContext, item: &K) -> Result<()> {
        self.cluster.assert_connected("create");
        self.summary(ctx, "creating resource", item);
        let stop = self.cluster.obs().timer(ctx, "opkit_client");
        let result = self
            .api(item.meta().namespace.as_deref())
            .create(&PostParams::default(), item)
            .await;
        stop(&self.timer_labels("create"));
        let created = result.map_err(|source| self.api_error("create", source))?;
        self.payload(ctx, "created resource", &created);
        Ok(())
    }

    /// Update `item` on the cluster.
    ///
    /// With no subresources named this is one full-object replace. With one
    /// or more, each named subresource is replaced independently in the given
    /// order and the main object is left untouched; execution stops at the
    /// first failure. Subresources already replaced in the same call stay
    /// applied, there is no rollback.
    pub async fn update(
        &self,
        ctx: &ObsContext,
        item: &K,
        subresources: &[Subresource],
    ) -> Result<()> {
        self.cluster.assert_connected("update");
        let name = self.require_name(item)?;
        self.summary(ctx, "updating resource", item);
        let stop = self.cluster.obs().timer(ctx, "opkit_client");
        let result = self.update_inner(&name, item, subresources).await;
        stop(&self.timer_labels("update"));
        let updated = result?;
        self.payload(ctx, "updated resource", &updated);
        Ok(())
    }

    async fn update_inner(&self, name: &str, item: &K, subresources: &[Subresource]) -> Result<K> {
        let api = self.api(item.meta().namespace.as_deref());
        if subresources.is_empty() {
            return api
                .replace(name, &PostParams::default(), item)
                .await
                .map_err(|source| self.api_error("update", source));
        }
        let body = serde_json::to_vec(item).map_err(Error::Serialize)?;
        let mut latest = None;
        for sub in subresources {
            let replaced = api
                .replace_subresource(sub.name(), name, &PostParams::default(), body.clone())
                .await
                .map_err(|source| Error::Subresource {
                    subresource: sub.name(),
                    source,
                })?;
            latest = Some(replaced);
        }
        // Non-empty slice, so at least one replace ran.
        Ok(latest.unwrap_or_else(|| item.clone()))
    }

    /// Delete `item` from the cluster.
    pub async fn delete(&self, ctx: &ObsContext, item: &K) -> Result<()> {
        self.cluster.assert_connected("delete");
        let name = self.require_name(item)?;
        self.summary(ctx, "deleting resource", item);
        let stop = self.cluster.obs().timer(ctx, "opkit_client");
        let result = self
            .api(item.meta().namespace.as_deref())
            .delete(&name, &DeleteParams::default())
            .await;
        stop(&self.timer_labels("delete"));
        result.map_err(|source| self.api_error("delete", source))?;
        self.payload(ctx, "deleted resource", item);
        Ok(())
    }

    /// Fetch one object by namespace and name.
    ///
    /// Absence is reported through an error for which
    /// [`Error::is_not_found`] returns true, distinguishable from
    /// environmental failure.
    pub async fn get(&self, ctx: &ObsContext, namespace: Option<&str>, name: &str) -> Result<K> {
        self.cluster.assert_connected("get");
        self.cluster.obs().log(
            ctx,
            Level::Info,
            "getting resource",
            &[
                ("resource_type", self.kind.clone()),
                ("object", object_id(namespace, name)),
            ],
        );
        let stop = self.cluster.obs().timer(ctx, "opkit_client");
        let result = match self.store() {
            Some(store) => self.get_cached(&store, namespace, name),
            None => self
                .api(namespace)
                .get(name)
                .await
                .map_err(|source| self.api_error("get", source)),
        };
        stop(&self.timer_labels("get"));
        let item = result?;
        self.payload(ctx, "got resource", &item);
        Ok(item)
    }

    fn get_cached(
        &self,
        store: &kube::runtime::reflector::Store<K>,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<K> {
        // An absent namespace means the kube client's default namespace on
        // the live path; the cache key must resolve to the same object.
        let client = self.cluster.kube_client();
        let ns = namespace.unwrap_or_else(|| client.default_namespace());
        let key = ObjectRef::<K>::new_with(name, self.resource.clone()).within(ns);
        match store.get(&key) {
            Some(item) => Ok((*item).clone()),
            None => Err(Error::Api {
                verb: "get",
                type_name: std::any::type_name::<K>(),
                source: kube::Error::Api(ErrorResponse {
                    status: "Failure".to_string(),
                    message: format!("{} {:?} not found in cache", self.kind, name),
                    reason: "NotFound".to_string(),
                    code: 404,
                }),
            }),
        }
    }

    /// List all objects of the client's type, across namespaces.
    ///
    /// Item order is whatever the store returned, typically lexical by name
    /// but not guaranteed.
    pub async fn list(&self, ctx: &ObsContext) -> Result<EnvelopeList<K>> {
        self.cluster.assert_connected("list");
        self.cluster.obs().log(
            ctx,
            Level::Info,
            "listing resources",
            &[("resource_type", self.kind.clone())],
        );
        let stop = self.cluster.obs().timer(ctx, "opkit_client");
        let result = match self.store() {
            Some(store) => Ok(EnvelopeList {
                types: None,
                metadata: Default::default(),
                items: store.state().iter().map(|item| (**item).clone()).collect(),
            }),
            None => Api::<K>::all_with(self.cluster.kube_client(), &self.resource)
                .list(&ListParams::default())
                .await
                .map(|list| EnvelopeList {
                    types: Some(list.types),
                    metadata: list.metadata,
                    items: list.items,
                })
                .map_err(|source| self.api_error("list", source)),
        };
        stop(&self.timer_labels("list"));
        let list = result?;
        self.cluster.obs().log(
            ctx,
            Level::Trace,
            "listed resources",
            &[
                ("resource_type", self.kind.clone()),
                ("count", list.len().to_string()),
                ("payload", format!("{:?}", list.items)),
            ],
        );
        Ok(list)
    }

    fn api(&self, namespace: Option<&str>) -> Api<K> {
        let client = self.cluster.kube_client();
        match namespace {
            Some(ns) => Api::namespaced_with(client, ns, &self.resource),
            None => Api::default_namespaced_with(client, &self.resource),
        }
    }

    fn store(&self) -> Option<kube::runtime::reflector::Store<K>> {
        if !self.use_cache {
            return None;
        }
        self.cluster.store_for::<K>()
    }

    fn require_name(&self, item: &K) -> Result<String> {
        item.meta().name.clone().ok_or(Error::MissingObjectName {
            type_name: std::any::type_name::<K>(),
        })
    }

    fn api_error(&self, verb: &'static str, source: kube::Error) -> Error {
        Error::Api {
            verb,
            type_name: std::any::type_name::<K>(),
            source,
        }
    }

    fn summary(&self, ctx: &ObsContext, msg: &str, item: &K) {
        self.cluster.obs().log(
            ctx,
            Level::Info,
            msg,
            &[
                ("resource_type", self.kind.clone()),
                (
                    "object",
                    object_id(
                        item.meta().namespace.as_deref(),
                        item.meta().name.as_deref().unwrap_or(""),
                    ),
                ),
            ],
        );
    }

    fn payload(&self, ctx: &ObsContext, msg: &str, item: &K) {
        self.cluster.obs().log(
            ctx,
            Level::Trace,
            msg,
            &[
                ("resource_type", self.kind.clone()),
                ("payload", format!("{item:?}")),
            ],
        );
    }

    fn timer_labels(&self, action: &str) -> [(&'static str, String); 2] {
        [
            ("resource_type", self.kind.clone()),
            ("resource_action", action.to_string()),
        ]
    }
}

fn object_id(namespace: Option<&str>, name: &str) -> String {
    match namespace {
        Some(ns) => format!("{ns}/{name}"),
        None => name.to_string(),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn subresource_paths_match_the_api() {
        assert_eq!(Subresource::Status.name(), "status");
        assert_eq!(Subresource::Scale.name(), "scale");
    }

    #[test]
    fn object_ids_omit_the_missing_namespace() {
        assert_eq!(object_id(Some("dev"), "w1"), "dev/w1");
        assert_eq!(object_id(None, "w1"), "w1");
    }
}
