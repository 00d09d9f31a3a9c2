//! The cluster handle: connection, type registration and lifecycle.
//!
//! A [`Cluster`] owns the connection to one Kubernetes cluster, the scheme
//! mapping registered resource types to their API identity, and everything
//! registered against it (reconcilers, admission hooks, watch caches).
//!
//! Lifecycle is two-phase. Between construction and [`Cluster::connect`],
//! reconcilers and hooks may be registered; `connect` then starts the watch
//! runners and the webhook listener and blocks until cancelled by dropping
//! its future. Registration after connect, a second connect, or using a
//! client before connect are programming errors and panic.

use std::{
    any::{Any, TypeId},
    collections::HashMap,
    net::SocketAddr,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
};

use futures::{future, future::BoxFuture, FutureExt};
use warp::{filters::BoxedFilter, reply::Response, Filter};

use crate::{
    client::Client,
    elector::Elector,
    error::{Error, Result},
    hook::{self, Hook},
    observe::{Level, ObsContext, Observability},
    reconciler::{self, FilterFn, ReconcileFn},
    resource::EnvelopeKind,
    scheme::{CrdGroup, Scheme},
};

/// Leader election settings.
///
/// When enabled, `lock_resource` is mandatory. `namespace` falls back to the
/// first watched namespace; construction panics when neither is available.
#[derive(Clone, Debug, Default)]
pub struct LeaderElectionConfig {
    /// Whether only the lease holder runs reconcilers and webhooks
    pub enabled: bool,
    /// Name of the Lease object used as the lock
    pub lock_resource: Option<String>,
    /// Namespace the Lease object lives in; defaults to the first entry of
    /// [`ClusterConfig::namespaces`]
    pub namespace: Option<String>,
}

/// Configuration for a [`Cluster`].
#[derive(Clone, Debug)]
pub struct ClusterConfig {
    /// The custom resource kinds this cluster serves, grouped by API group
    pub crds: Vec<CrdGroup>,
    /// Namespaces to watch; empty watches all namespaces
    pub namespaces: Vec<String>,
    /// Listen address for the admission webhook server
    pub webhook_addr: SocketAddr,
    /// Directory holding `tls.crt` and `tls.key` for the webhook server;
    /// unset serves plain HTTP (TLS terminated upstream)
    pub tls_dir: Option<PathBuf>,
    /// Disable the shared watch caches; cache-preferring clients go live
    pub disable_caching: bool,
    /// Leader election settings
    pub leader_election: LeaderElectionConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            crds: Vec::new(),
            namespaces: Vec::new(),
            webhook_addr: ([0, 0, 0, 0], 9443).into(),
            tls_dir: None,
            disable_caching: false,
            leader_election: LeaderElectionConfig::default(),
        }
    }
}

/// Handle to one Kubernetes cluster.
///
/// Cheap to clone; all clones share the same connection and state.
#[derive(Clone)]
pub struct Cluster {
    inner: Arc<Inner>,
}

struct Inner {
    client: kube::Client,
    scheme: Scheme,
    config: ClusterConfig,
    obs: Observability,
    connected: AtomicBool,
    runners: Mutex<Vec<BoxFuture<'static, Result<()>>>>,
    stores: Mutex<HashMap<TypeId, Box<dyn Any + Send + Sync>>>,
    routes: Mutex<Option<BoxedFilter<(Response,)>>>,
}

impl Cluster {
    /// Build a cluster handle with configuration inferred from the
    /// environment (kubeconfig or in-cluster service account).
    pub async fn new(
        ctx: &ObsContext,
        config: ClusterConfig,
        obs: Observability,
    ) -> Result<Self> {
        let kube_config = kube::Config::infer()
            .await
            .map_err(|err| Error::InferConfig(Box::new(err)))?;
        let client = kube::Client::try_from(kube_config).map_err(Error::BuildClient)?;
        Self::with_client(ctx, client, config, obs)
    }

    /// Build a cluster handle around an existing `kube` client.
    ///
    /// # Panics
    ///
    /// Panics if leader election is enabled without a lock resource name, or
    /// without a lock namespace when no watched namespaces are configured to
    /// fall back on.
    pub fn with_client(
        ctx: &ObsContext,
        client: kube::Client,
        mut config: ClusterConfig,
        obs: Observability,
    ) -> Result<Self> {
        let stop = obs.timer(ctx, "opkit_new_cluster");
        if config.leader_election.enabled {
            assert!(
                config.leader_election.lock_resource.is_some(),
                "leader election enabled without a lock resource name"
            );
            if config.leader_election.namespace.is_none() {
                let fallback = config.namespaces.first().cloned().expect(
                    "leader election enabled without a lock namespace or any watched namespaces",
                );
                config.leader_election.namespace = Some(fallback);
            }
        }

        let scheme = Scheme::build(&config.crds, &obs, ctx);
        stop(&[]);
        let scheme = scheme?;
        let le = &config.leader_election;
        obs.log(
            ctx,
            Level::Debug,
            "cluster handle built",
            &[
                (
                    "kinds",
                    config
                        .crds
                        .iter()
                        .map(|g| g.kinds.len())
                        .sum::<usize>()
                        .to_string(),
                ),
                ("leader_election", le.enabled.to_string()),
            ],
        );
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                scheme,
                config,
                obs,
                connected: AtomicBool::new(false),
                runners: Mutex::new(Vec::new()),
                stores: Mutex::new(HashMap::new()),
                routes: Mutex::new(None),
            }),
        })
    }

    /// A typed client for the registered type `K`.
    ///
    /// With `use_cache` set, reads prefer the shared watch cache when one
    /// exists for `K`.
    pub fn client<K: EnvelopeKind>(&self, ctx: &ObsContext, use_cache: bool) -> Result<Client<K>> {
        Client::bound_to(ctx, self, use_cache)
    }

    /// Register a reconciler for `K`.
    ///
    /// `filter` gates watch deliveries before they reach `reconcile`; absent
    /// means admit everything.
    ///
    /// # Panics
    ///
    /// Panics if the cluster is already connected.
    pub fn add_reconciler<K: EnvelopeKind>(
        &self,
        ctx: &ObsContext,
        filter: Option<FilterFn<K>>,
        reconcile: ReconcileFn<K>,
    ) -> Result<()> {
        reconciler::register(ctx, self, filter, reconcile)
    }

    /// Register admission callbacks for `K`, served under
    /// `POST /hooks/<plural>` on the webhook listener.
    ///
    /// # Panics
    ///
    /// Panics if the cluster is already connected.
    pub fn add_hook<K: EnvelopeKind>(&self, ctx: &ObsContext, hook: Hook<K>) -> Result<()> {
        hook::register(ctx, self, hook)
    }

    /// Whether [`Cluster::connect`] has been called.
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Connect and run until cancelled.
    ///
    /// Starts every registered reconciler and, if hooks were registered, the
    /// webhook listener. With leader election enabled this first blocks until
    /// the lease is acquired, and returns [`Error::LeaseLost`] if leadership
    /// slips away later. Shutdown is dropping the returned future (e.g. via
    /// `tokio::select!` with a signal handler); there is no separate stop
    /// call.
    ///
    /// # Panics
    ///
    /// Panics if called a second time on the same cluster.
    pub async fn connect(&self, ctx: &ObsContext) -> Result<()> {
        if self.inner.connected.swap(true, Ordering::SeqCst) {
            panic!("connect called twice on the same cluster");
        }

        let runners = std::mem::take(
            &mut *self
                .inner
                .runners
                .lock()
                .expect("runner registry poisoned"),
        );
        let routes = self
            .inner
            .routes
            .lock()
            .expect("route registry poisoned")
            .take();
        let obs = self.inner.obs.clone();
        obs.log(
            ctx,
            Level::Info,
            "connecting cluster",
            &[
                ("reconcilers", runners.len().to_string()),
                ("webhooks", routes.is_some().to_string()),
            ],
        );

        let addr = self.inner.config.webhook_addr;
        let tls_dir = self.inner.config.tls_dir.clone();
        let serve_obs = obs.clone();
        let work = async move {
            let mut tasks = runners;
            if let Some(routes) = routes {
                tasks.push(serve_webhooks(routes, addr, tls_dir, serve_obs).boxed());
            }
            if !tasks.is_empty() {
                future::try_join_all(tasks).await?;
            }
            // Runners hold their watches forever; reaching this means there
            // was nothing to run. Park until the caller drops us.
            future::pending::<Result<()>>().await
        };

        let stop = obs.timer(ctx, "opkit_connect");
        let result = if !self.inner.config.leader_election.enabled {
            work.await
        } else {
            let le = &self.inner.config.leader_election;
            // Both validated (or defaulted) in with_client.
            let lease = le.lock_resource.as_deref().expect("lock resource validated");
            let namespace = le.namespace.as_deref().expect("lock namespace validated");
            let elector = Elector::new(self.kube_client(), namespace, lease, obs.clone());
            match elector.acquire(ctx).await {
                Err(err) => Err(err),
                Ok(()) => tokio::select! {
                    res = work => res,
                    lost = elector.hold(ctx) => lost,
                },
            }
        };
        stop(&[]);
        result
    }

    pub(crate) fn assert_registration_open(&self, what: &str) {
        assert!(
            !self.is_connected(),
            "{what} called after the cluster was connected"
        );
    }

    pub(crate) fn assert_connected(&self, op: &str) {
        assert!(
            self.is_connected(),
            "client {op} called before the cluster was connected"
        );
    }

    pub(crate) fn kube_client(&self) -> kube::Client {
        self.inner.client.clone()
    }

    pub(crate) fn scheme(&self) -> &Scheme {
        &self.inner.scheme
    }

    pub(crate) fn obs(&self) -> &Observability {
        &self.inner.obs
    }

    pub(crate) fn watch_namespaces(&self) -> Vec<String> {
        self.inner.config.namespaces.clone()
    }

    pub(crate) fn caching_disabled(&self) -> bool {
        self.inner.config.disable_caching
    }

    pub(crate) fn register_runner(&self, runner: BoxFuture<'static, Result<()>>) {
        self.inner
            .runners
            .lock()
            .expect("runner registry poisoned")
            .push(runner);
    }

    pub(crate) fn register_store<K: EnvelopeKind>(
        &self,
        store: kube::runtime::reflector::Store<K>,
    ) {
        self.inner
            .stores
            .lock()
            .expect("store registry poisoned")
            .insert(TypeId::of::<K>(), Box::new(store));
    }

    pub(crate) fn store_for<K: EnvelopeKind>(
        &self,
    ) -> Option<kube::runtime::reflector::Store<K>> {
        if self.caching_disabled() {
            return None;
        }
        self.inner
            .stores
            .lock()
            .expect("store registry poisoned")
            .get(&TypeId::of::<K>())
            .and_then(|any| any.downcast_ref::<kube::runtime::reflector::Store<K>>())
            .cloned()
    }

    pub(crate) fn register_route(&self, route: BoxedFilter<(Response,)>) {
        let mut slot = self.inner.routes.lock().expect("route registry poisoned");
        *slot = Some(match slot.take() {
            Some(existing) => existing.or(route).unify().boxed(),
            None => route,
        });
    }
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("connected", &self.is_connected())
            .finish_non_exhaustive()
    }
}

async fn serve_webhooks(
    routes: BoxedFilter<(Response,)>,
    addr: SocketAddr,
    tls_dir: Option<PathBuf>,
    obs: Observability,
) -> Result<()> {
    obs.log(
        obs.background(),
        Level::Info,
        "webhook listener starting",
        &[
            ("addr", addr.to_string()),
            ("tls", tls_dir.is_some().to_string()),
        ],
    );
    match tls_dir {
        Some(dir) => {
            warp::serve(routes)
                .tls()
                .cert_path(dir.join("tls.crt"))
                .key_path(dir.join("tls.key"))
                .run(addr)
                .await
        }
        None => warp::serve(routes).run(addr).await,
    }
    Ok(())
}
