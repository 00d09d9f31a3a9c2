//! Reconciler registration and the per-type watch-driven runner.
//!
//! A reconciler binds one callback (and an optional filter predicate) to one
//! registered resource type. Once the cluster connects, a runner per
//! reconciler watches the type, classifies each delivered event as created,
//! updated or deleted, gates it through the filter, fetches the current state
//! of the object and invokes the callback. Callback and fetch failures are
//! requeued with exponential backoff.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use futures::{
    future::BoxFuture,
    stream::{self, FuturesUnordered},
    FutureExt, StreamExt,
};
use kube::{
    api::Api,
    runtime::{
        reflector::{self, store::Writer},
        watcher, WatchStreamExt,
    },
};

use crate::{
    client::Client,
    cluster::Cluster,
    error::{BoxError, Error, Result},
    observe::{Level, ObsContext, Observability},
    resource::EnvelopeKind,
};

/// Coarse classification of a watch delivery, as seen by filter predicates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceEvent {
    /// First delivery for this object
    Created,
    /// Delivery for an object seen before
    Updated,
    /// The object is gone
    Deleted,
}

impl std::fmt::Display for ResourceEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ResourceEvent::Created => "created",
            ResourceEvent::Updated => "updated",
            ResourceEvent::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// The classification passed to reconcile callbacks.
///
/// Creations and updates collapse into one case since the callback receives
/// the freshly fetched current state either way; deletions are distinct
/// because there is no state left to fetch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileEvent {
    /// The object exists; the callback receives its current state
    CreatedOrUpdated,
    /// The object is gone; the callback receives a zero-valued stand-in
    Deleted,
}

impl std::fmt::Display for ReconcileEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ReconcileEvent::CreatedOrUpdated => "created_or_updated",
            ReconcileEvent::Deleted => "deleted",
        };
        f.write_str(s)
    }
}

/// Event filter predicate; returning false suppresses the callback for that
/// delivery. Absence of a filter admits everything.
pub type FilterFn<K> = Box<dyn Fn(ResourceEvent, &K) -> bool + Send + Sync>;

/// The reconcile callback.
///
/// Invoked with a correlation context, the event classification and the
/// fetched current state of the object (zero-valued for deletions). An error
/// return requeues the object with exponential backoff.
pub type ReconcileFn<K> = Box<
    dyn Fn(ObsContext, ReconcileEvent, K) -> BoxFuture<'static, std::result::Result<(), BoxError>>
        + Send
        + Sync,
>;

/// Namespace/name pair identifying one object instance.
type ObjKey = (Option<String>, String);

pub(crate) fn register<K: EnvelopeKind>(
    ctx: &ObsContext,
    cluster: &Cluster,
    filter: Option<FilterFn<K>>,
    reconcile: ReconcileFn<K>,
) -> Result<()> {
    cluster.assert_registration_open("add_reconciler");
    let stop = cluster.obs().timer(ctx, "opkit_add_reconciler");
    let result = register_inner(ctx, cluster, filter, reconcile);
    stop(&[(
        "resource_type",
        std::any::type_name::<K>().to_string(),
    )]);
    result
}

fn register_inner<K: EnvelopeKind>(
    ctx: &ObsContext,
    cluster: &Cluster,
    filter: Option<FilterFn<K>>,
    reconcile: ReconcileFn<K>,
) -> Result<()> {
    let entry = cluster.scheme().resolve::<K>()?.clone();
    cluster.obs().log(
        ctx,
        Level::Debug,
        "registering reconciler",
        &[
            ("resource_type", entry.kind.clone()),
            ("filtered", filter.is_some().to_string()),
        ],
    );

    let writer = Writer::<K>::new(entry.resource.clone());
    if !cluster.caching_disabled() {
        cluster.register_store::<K>(writer.as_reader());
    }

    // The runner fetches current state through the cache when available.
    let fetch = Client::<K>::bound_to(ctx, cluster, true)?;
    let runner = Runner {
        cluster: cluster.clone(),
        kind: entry.kind,
        resource: entry.resource,
        writer: Some(writer),
        filter,
        reconcile,
        fetch,
    };
    cluster.register_runner(async move { runner.run().await }.boxed());
    Ok(())
}

struct Runner<K: EnvelopeKind> {
    cluster: Cluster,
    kind: String,
    resource: kube::core::ApiResource,
    writer: Option<Writer<K>>,
    filter: Option<FilterFn<K>>,
    reconcile: ReconcileFn<K>,
    fetch: Client<K>,
}

impl<K: EnvelopeKind> Runner<K> {
    async fn run(mut self) -> Result<()> {
        let obs = self.cluster.obs().clone();
        let client = self.cluster.kube_client();
        let namespaces = self.cluster.watch_namespaces();

        let apis: Vec<Api<K>> = if namespaces.is_empty() {
            vec![Api::all_with(client, &self.resource)]
        } else {
            namespaces
                .iter()
                .map(|ns| Api::namespaced_with(client.clone(), ns, &self.resource))
                .collect()
        };
        let watches = apis.into_iter().map(|api| {
            watcher(api, watcher::Config::default())
                .default_backoff()
                .boxed()
        });
        let writer = self.writer.take().expect("runner runs once");
        let mut events = reflector::reflector(writer, stream::select_all(watches)).boxed();

        obs.log(
            obs.background(),
            Level::Debug,
            "reconciler watch started",
            &[("resource_type", self.kind.clone())],
        );

        let mut seen: HashSet<ObjKey> = HashSet::new();
        let mut attempts: HashMap<ObjKey, u32> = HashMap::new();
        let mut pending: FuturesUnordered<BoxFuture<'static, (ReconcileEvent, ObjKey)>> =
            FuturesUnordered::new();

        loop {
            tokio::select! {
                delivery = events.next() => match delivery {
                    None => break,
                    Some(Err(err)) => {
                        obs.log(
                            obs.background(),
                            Level::Error,
                            "watch stream error",
                            &[
                                ("resource_type", self.kind.clone()),
                                ("error", err.to_string()),
                            ],
                        );
                    }
                    Some(Ok(event)) => {
                        if let Some((classification, object)) = classify(&mut seen, event) {
                            self.dispatch(&obs, &mut attempts, &mut pending, classification, object)
                                .await;
                        }
                    }
                },
                Some((event, key)) = pending.next(), if !pending.is_empty() => {
                    self.attempt(&obs, &mut attempts, &mut pending, event, key).await;
                }
            }
        }
        Ok(())
    }

    async fn dispatch(
        &self,
        obs: &Observability,
        attempts: &mut HashMap<ObjKey, u32>,
        pending: &mut FuturesUnordered<BoxFuture<'static, (ReconcileEvent, ObjKey)>>,
        classification: ResourceEvent,
        object: K,
    ) {
        let key = obj_key(&object);
        let admitted = self
            .filter
            .as_ref()
            .map_or(true, |filter| filter(classification, &object));
        obs.log(
            obs.background(),
            Level::Trace,
            if admitted {
                "filter admitted event"
            } else {
                "filter dropped event"
            },
            &[
                ("resource_type", self.kind.clone()),
                ("object", key_id(&key)),
                ("event", classification.to_string()),
            ],
        );
        if !admitted {
            return;
        }
        let event = match classification {
            ResourceEvent::Created | ResourceEvent::Updated => ReconcileEvent::CreatedOrUpdated,
            ResourceEvent::Deleted => ReconcileEvent::Deleted,
        };
        self.attempt(obs, attempts, pending, event, key).await;
    }

    async fn attempt(
        &self,
        obs: &Observability,
        attempts: &mut HashMap<ObjKey, u32>,
        pending: &mut FuturesUnordered<BoxFuture<'static, (ReconcileEvent, ObjKey)>>,
        event: ReconcileEvent,
        key: ObjKey,
    ) {
        match self.reconcile_one(obs, event, &key).await {
            Ok(()) => {
                attempts.remove(&key);
            }
            Err(err) => {
                let attempt = attempts.entry(key.clone()).or_insert(0);
                let delay = requeue_delay(*attempt);
                *attempt += 1;
                obs.log(
                    obs.background(),
                    Level::Error,
                    "reconcile failed, requeueing",
                    &[
                        ("resource_type", self.kind.clone()),
                        ("object", key_id(&key)),
                        ("error", err.to_string()),
                        ("requeue_after", format!("{delay:?}")),
                    ],
                );
                pending.push(
                    async move {
                        tokio::time::sleep(delay).await;
                        (event, key)
                    }
                    .boxed(),
                );
            }
        }
    }

    async fn reconcile_one(
        &self,
        obs: &Observability,
        event: ReconcileEvent,
        key: &ObjKey,
    ) -> Result<()> {
        let ctx = obs.correlate(obs.background());
        obs.log(
            &ctx,
            Level::Info,
            "reconciling resource",
            &[
                ("resource_type", self.kind.clone()),
                ("object", key_id(key)),
                ("event", event.to_string()),
            ],
        );
        let stop = obs.timer(&ctx, "opkit_reconcile");
        let result = self.invoke(&ctx, event, key).await;
        stop(&[
            ("resource_type", self.kind.clone()),
            ("resource_action", "reconcile".to_string()),
        ]);
        match &result {
            Ok(()) => obs.log(
                &ctx,
                Level::Trace,
                "reconciled resource",
                &[
                    ("resource_type", self.kind.clone()),
                    ("object", key_id(key)),
                ],
            ),
            Err(err) => obs.log(
                &ctx,
                Level::Error,
                "reconcile callback failed",
                &[
                    ("resource_type", self.kind.clone()),
                    ("object", key_id(key)),
                    ("error", err.to_string()),
                ],
            ),
        }
        result
    }

    async fn invoke(&self, ctx: &ObsContext, event: ReconcileEvent, key: &ObjKey) -> Result<()> {
        let (namespace, name) = (key.0.as_deref(), key.1.as_str());
        // The callback sees current state, not the possibly stale watch
        // payload; a vanished object downgrades the event to Deleted.
        let (event, item) = match self.fetch.get(ctx, namespace, name).await {
            Ok(item) => (event, item),
            Err(err) if err.is_not_found() => (ReconcileEvent::Deleted, K::default()),
            Err(err) => return Err(err),
        };
        (self.reconcile)(ctx.clone(), event, item)
            .await
            .map_err(|source| Error::Reconcile {
                object: key_id(key),
                source,
            })
    }
}

/// Classify one watch event against the set of already-seen objects.
///
/// Relist markers carry no object and classify to nothing. A relisted object
/// that was seen before classifies as updated, so a watch restart does not
/// replay creations.
fn classify<K: EnvelopeKind>(
    seen: &mut HashSet<ObjKey>,
    event: watcher::Event<K>,
) -> Option<(ResourceEvent, K)> {
    match event {
        watcher::Event::Init | watcher::Event::InitDone => None,
        watcher::Event::InitApply(object) | watcher::Event::Apply(object) => {
            let classification = if seen.insert(obj_key(&object)) {
                ResourceEvent::Created
            } else {
                ResourceEvent::Updated
            };
            Some((classification, object))
        }
        watcher::Event::Delete(object) => {
            seen.remove(&obj_key(&object));
            Some((ResourceEvent::Deleted, object))
        }
    }
}

fn obj_key<K: EnvelopeKind>(object: &K) -> ObjKey {
    (
        object.meta().namespace.clone(),
        object.meta().name.clone().unwrap_or_default(),
    )
}

fn key_id(key: &ObjKey) -> String {
    match &key.0 {
        Some(ns) => format!("{ns}/{}", key.1),
        None => key.1.clone(),
    }
}

fn requeue_delay(attempt: u32) -> Duration {
    const BASE_MS: u64 = 500;
    const CAP: Duration = Duration::from_secs(300);
    let delay = Duration::from_millis(BASE_MS.saturating_mul(1 << attempt.min(16)));
    delay.min(CAP)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::resource::{Envelope, Undefined};
    use kube::core::{ApiResource, GroupVersionKind};

    type Widget = Envelope<Undefined, Undefined, Undefined>;

    fn widget(ns: &str, name: &str) -> Widget {
        let ar = ApiResource::from_gvk(&GroupVersionKind::gvk("testing.opkit.dev", "v1", "Widget"));
        Widget::new(name, &ar, Undefined).within(ns)
    }

    #[test]
    fn first_apply_is_created_then_updated() {
        let mut seen = HashSet::new();
        let (first, _) = classify(&mut seen, watcher::Event::Apply(widget("dev", "w1"))).unwrap();
        assert_eq!(first, ResourceEvent::Created);
        let (second, _) = classify(&mut seen, watcher::Event::Apply(widget("dev", "w1"))).unwrap();
        assert_eq!(second, ResourceEvent::Updated);
    }

    #[test]
    fn delete_forgets_the_object() {
        let mut seen = HashSet::new();
        classify(&mut seen, watcher::Event::Apply(widget("dev", "w1")));
        let (event, _) = classify(&mut seen, watcher::Event::Delete(widget("dev", "w1"))).unwrap();
        assert_eq!(event, ResourceEvent::Deleted);
        let (event, _) = classify(&mut seen, watcher::Event::Apply(widget("dev", "w1"))).unwrap();
        assert_eq!(event, ResourceEvent::Created);
    }

    #[test]
    fn relist_of_known_objects_is_an_update() {
        let mut seen = HashSet::new();
        classify(&mut seen, watcher::Event::Apply(widget("dev", "w1")));
        assert!(classify::<Widget>(&mut seen, watcher::Event::Init).is_none());
        let (event, _) =
            classify(&mut seen, watcher::Event::InitApply(widget("dev", "w1"))).unwrap();
        assert_eq!(event, ResourceEvent::Updated);
        assert!(classify::<Widget>(&mut seen, watcher::Event::InitDone).is_none());
    }

    #[test]
    fn objects_are_keyed_by_namespace_and_name() {
        let mut seen = HashSet::new();
        let (a, _) = classify(&mut seen, watcher::Event::Apply(widget("dev", "w1"))).unwrap();
        let (b, _) = classify(&mut seen, watcher::Event::Apply(widget("prod", "w1"))).unwrap();
        assert_eq!(a, ResourceEvent::Created);
        assert_eq!(b, ResourceEvent::Created);
    }

    #[test]
    fn requeue_delay_grows_and_caps() {
        assert_eq!(requeue_delay(0), Duration::from_millis(500));
        assert_eq!(requeue_delay(1), Duration::from_secs(1));
        assert_eq!(requeue_delay(2), Duration::from_secs(2));
        assert_eq!(requeue_delay(30), Duration::from_secs(300));
    }

    #[test]
    fn classifications_render_for_logs() {
        assert_eq!(ResourceEvent::Created.to_string(), "created");
        assert_eq!(ReconcileEvent::CreatedOrUpdated.to_string(), "created_or_updated");
        assert_eq!(ReconcileEvent::Deleted.to_string(), "deleted");
    }
}
