//! End-to-end scenarios against the current kube context.
//!
//! Applies its own CRD, connects a cluster handle with a reconciler, then
//! exercises typed CRUD and filtered reconciliation. Needs cluster-admin on
//! a disposable cluster (k3d/kind).

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{ensure, Context as _};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    runtime::wait::{await_condition, conditions},
};
use opkit::{
    resource::{Envelope, Undefined},
    Cluster, ClusterConfig, CrdGroup, KindEntry, Observability, ObservabilityConfig,
    ReconcileEvent, ResourceEvent,
};
use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetSpec {
    example_data: String,
}

type Widget = Envelope<WidgetSpec, Undefined, Undefined>;

const GROUP: &str = "e2e.opkit.dev";
const CRD_NAME: &str = "widgets.e2e.opkit.dev";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();

    let kube_client = kube::Client::try_default().await?;
    apply_crd(&kube_client).await?;

    let obs = Observability::new(ObservabilityConfig::tracing_default());
    let ctx = obs.background().clone();

    let config = ClusterConfig {
        crds: vec![CrdGroup {
            group: GROUP.into(),
            version: "v1".into(),
            kinds: vec![KindEntry::of::<Widget>("Widget")],
        }],
        disable_caching: true,
        ..Default::default()
    };
    let cluster = Cluster::with_client(&ctx, kube_client.clone(), config, obs)?;

    // Scenario D wiring: admit only creations of the object named "target".
    let invocations: Arc<Mutex<Vec<(ReconcileEvent, String)>>> = Arc::new(Mutex::new(Vec::new()));
    let sink = invocations.clone();
    cluster.add_reconciler::<Widget>(
        &ctx,
        Some(Box::new(|event, widget: &Widget| {
            event == ResourceEvent::Created && widget.metadata.name.as_deref() == Some("target")
        })),
        Box::new(move |_ctx, event, widget| {
            let sink = sink.clone();
            Box::pin(async move {
                let name = widget.metadata.name.clone().unwrap_or_default();
                sink.lock().unwrap().push((event, name));
                Ok(())
            })
        }),
    )?;

    let connecting = cluster.clone();
    let connect_ctx = ctx.clone();
    let connection = tokio::spawn(async move { connecting.connect(&connect_ctx).await });
    while !cluster.is_connected() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let client = cluster.client::<Widget>(&ctx, false)?;

    // Clean slate for the list assertions below.
    for leftover in client.list(&ctx).await? {
        client.delete(&ctx, &leftover).await?;
    }
    tokio::time::sleep(Duration::from_secs(1)).await;

    scenario_a(&cluster, &ctx).await?;
    scenario_b(&cluster, &ctx).await?;
    scenario_d(&cluster, &ctx, &invocations).await?;
    // TODO: add an admission scenario once this harness can provision webhook
    // serving certs and a webhook configuration reachable from the apiserver.

    info!("cleaning up");
    for widget in client.list(&ctx).await? {
        client.delete(&ctx, &widget).await?;
    }
    let crds: Api<CustomResourceDefinition> = Api::all(kube_client);
    crds.delete(CRD_NAME, &DeleteParams::default()).await?;
    connection.abort();

    info!("all scenarios passed");
    Ok(())
}

/// Create then list: the created object must be visible with its data intact.
async fn scenario_a(cluster: &Cluster, ctx: &opkit::ObsContext) -> anyhow::Result<()> {
    info!("scenario A: create then list");
    let client = cluster.client::<Widget>(ctx, false)?;
    let widget = Widget::new(
        "scenario-a",
        client.resource(),
        WidgetSpec {
            example_data: "x".into(),
        },
    )
    .within("default");
    client.create(ctx, &widget).await?;

    let list = client.list(ctx).await?;
    ensure!(list.len() == 1, "expected exactly one widget, saw {}", list.len());
    let item = list.iter().next().context("list was empty")?;
    ensure!(item.spec.example_data == "x", "exampleData did not round-trip");
    Ok(())
}

/// Get of a name that never existed must be a distinguishable not-found, and
/// must not disturb subsequent lists.
async fn scenario_b(cluster: &Cluster, ctx: &opkit::ObsContext) -> anyhow::Result<()> {
    info!("scenario B: not-found get");
    let client = cluster.client::<Widget>(ctx, false)?;
    let err = client
        .get(ctx, Some("default"), "never-created")
        .await
        .expect_err("get of a missing widget succeeded");
    ensure!(err.is_not_found(), "expected a not-found error, got: {err}");

    let list = client.list(ctx).await?;
    ensure!(list.len() == 1, "list count changed after a failed get");
    Ok(())
}

/// Filtered reconciliation: only the creation of "target" reaches the
/// callback, exactly once, classified created_or_updated.
async fn scenario_d(
    cluster: &Cluster,
    ctx: &opkit::ObsContext,
    invocations: &Arc<Mutex<Vec<(ReconcileEvent, String)>>>,
) -> anyhow::Result<()> {
    info!("scenario D: filtered reconciler");
    let client = cluster.client::<Widget>(ctx, false)?;
    for name in ["other", "target"] {
        let widget = Widget::new(
            name,
            client.resource(),
            WidgetSpec {
                example_data: name.into(),
            },
        )
        .within("default");
        client.create(ctx, &widget).await?;
    }

    let deadline = tokio::time::Instant::now() + Duration::from_secs(20);
    loop {
        if invocations.lock().unwrap().iter().any(|(_, name)| name == "target") {
            break;
        }
        ensure!(
            tokio::time::Instant::now() < deadline,
            "reconciler never saw the target widget"
        );
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    // Give stray deliveries a moment to show up before asserting exactly-once.
    tokio::time::sleep(Duration::from_secs(2)).await;

    let seen = invocations.lock().unwrap().clone();
    ensure!(
        seen == vec![(ReconcileEvent::CreatedOrUpdated, "target".to_string())],
        "unexpected reconcile invocations: {seen:?}"
    );
    Ok(())
}

async fn apply_crd(client: &kube::Client) -> anyhow::Result<()> {
    info!("applying widget crd");
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let crd: CustomResourceDefinition = serde_json::from_value(serde_json::json!({
        "apiVersion": "apiextensions.k8s.io/v1",
        "kind": "CustomResourceDefinition",
        "metadata": { "name": CRD_NAME },
        "spec": {
            "group": GROUP,
            "names": {
                "kind": "Widget",
                "plural": "widgets",
                "singular": "widget"
            },
            "scope": "Namespaced",
            "versions": [{
                "name": "v1",
                "served": true,
                "storage": true,
                "schema": {
                    "openAPIV3Schema": {
                        "type": "object",
                        "properties": {
                            "spec": {
                                "type": "object",
                                "properties": {
                                    "exampleData": { "type": "string" }
                                }
                            }
                        }
                    }
                }
            }]
        }
    }))?;
    crds.patch(CRD_NAME, &PatchParams::apply("opkit-e2e"), &Patch::Apply(&crd))
        .await?;

    let established = await_condition(crds, CRD_NAME, conditions::is_crd_established());
    tokio::time::timeout(Duration::from_secs(10), established).await??;
    Ok(())
}
