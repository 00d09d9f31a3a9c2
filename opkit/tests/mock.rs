//! Client behavior against a mocked apiserver.

use std::sync::Arc;

use anyhow::Result;
use http::{Request, Response};
use http_body_util::BodyExt;
use kube::client::Body;
use opkit::{
    resource::{Envelope, Undefined},
    Cluster, ClusterConfig, CrdGroup, KindEntry, Observability, ObservabilityConfig, ObsContext,
    Subresource,
};
use serde::{Deserialize, Serialize};
use serde_json::json;

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WidgetSpec {
    example_data: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
struct WidgetStatus {
    ready: bool,
}

type Widget = Envelope<WidgetSpec, WidgetStatus, Undefined>;

#[tokio::test]
async fn create_posts_to_the_collection() {
    let (cluster, fakeserver, ctx) = connected_cluster().await;
    let mocksrv = fakeserver.run(Scenario::CreateWidget);

    let client = cluster.client::<Widget>(&ctx, false).unwrap();
    let widget = test_widget("w1", "x");
    client.create(&ctx, &widget).await.unwrap();
    timeout_after_1s(mocksrv).await;
}

#[tokio::test]
async fn get_of_a_missing_object_is_not_found() {
    let (cluster, fakeserver, ctx) = connected_cluster().await;
    let mocksrv = fakeserver.run(Scenario::GetMissing);

    let client = cluster.client::<Widget>(&ctx, false).unwrap();
    let err = client.get(&ctx, Some("dev"), "missing").await.unwrap_err();
    assert!(err.is_not_found());
    timeout_after_1s(mocksrv).await;
}

#[tokio::test]
async fn subresource_updates_run_in_order() {
    let (cluster, fakeserver, ctx) = connected_cluster().await;
    let mocksrv = fakeserver.run(Scenario::StatusThenScaleFails);

    let client = cluster.client::<Widget>(&ctx, false).unwrap();
    let widget = test_widget("w1", "x");
    let err = client
        .update(&ctx, &widget, &[Subresource::Status, Subresource::Scale])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        opkit::Error::Subresource {
            subresource: "scale",
            ..
        }
    ));
    timeout_after_1s(mocksrv).await;
}

#[tokio::test]
async fn subresource_updates_stop_at_the_first_failure() {
    let (cluster, fakeserver, ctx) = connected_cluster().await;
    // The scenario only answers one request; a second would hang the timeout.
    let mocksrv = fakeserver.run(Scenario::StatusFailsImmediately);

    let client = cluster.client::<Widget>(&ctx, false).unwrap();
    let widget = test_widget("w1", "x");
    let err = client
        .update(&ctx, &widget, &[Subresource::Status, Subresource::Scale])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        opkit::Error::Subresource {
            subresource: "status",
            ..
        }
    ));
    assert!(!err.is_not_found());
    timeout_after_1s(mocksrv).await;
}

#[tokio::test]
async fn update_without_subresources_is_one_replace() {
    let (cluster, fakeserver, ctx) = connected_cluster().await;
    let mocksrv = fakeserver.run(Scenario::FullReplace);

    let client = cluster.client::<Widget>(&ctx, false).unwrap();
    let widget = test_widget("w1", "y");
    client.update(&ctx, &widget, &[]).await.unwrap();
    timeout_after_1s(mocksrv).await;
}

#[tokio::test]
async fn list_returns_the_items_in_store_order() {
    let (cluster, fakeserver, ctx) = connected_cluster().await;
    let mocksrv = fakeserver.run(Scenario::ListWidgets);

    let client = cluster.client::<Widget>(&ctx, false).unwrap();
    let list = client.list(&ctx).await.unwrap();
    assert_eq!(list.len(), 2);
    let names: Vec<_> = list
        .iter()
        .map(|w| w.metadata.name.clone().unwrap())
        .collect();
    assert_eq!(names, vec!["w1", "w2"]);
    assert_eq!(list.iter().next().unwrap().spec.example_data, "x");
    timeout_after_1s(mocksrv).await;
}

// ------------------------------------------------------------------------
// mock test setup cruft
// ------------------------------------------------------------------------

type ApiServerHandle = tower_test::mock::Handle<Request<Body>, Response<Body>>;
struct ApiServerVerifier(ApiServerHandle);

enum Scenario {
    CreateWidget,
    GetMissing,
    StatusThenScaleFails,
    StatusFailsImmediately,
    FullReplace,
    ListWidgets,
}

fn test_widget(name: &str, example_data: &str) -> Widget {
    let ar = kube::core::ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
        "testing.opkit.dev",
        "v1",
        "Widget",
    ));
    Widget::new(
        name,
        &ar,
        WidgetSpec {
            example_data: example_data.to_string(),
        },
    )
    .within("dev")
}

fn widget_json(name: &str, example_data: &str) -> serde_json::Value {
    json!({
        "apiVersion": "testing.opkit.dev/v1",
        "kind": "Widget",
        "metadata": {"name": name, "namespace": "dev"},
        "spec": {"exampleData": example_data},
        "status": {"ready": false}
    })
}

fn error_status(code: u16, reason: &str, message: &str) -> serde_json::Value {
    json!({
        "kind": "Status",
        "apiVersion": "v1",
        "metadata": {},
        "status": "Failure",
        "message": message,
        "reason": reason,
        "code": code
    })
}

async fn timeout_after_1s(handle: tokio::task::JoinHandle<()>) {
    tokio::time::timeout(std::time::Duration::from_secs(1), handle)
        .await
        .expect("timeout on mock apiserver")
        .expect("scenario succeeded")
}

impl ApiServerVerifier {
    fn run(self, scenario: Scenario) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            match scenario {
                Scenario::CreateWidget => self.handle_create().await,
                Scenario::GetMissing => self.handle_get_missing().await,
                Scenario::StatusThenScaleFails => self.handle_status_then_scale().await,
                Scenario::StatusFailsImmediately => self.handle_status_failure().await,
                Scenario::FullReplace => self.handle_full_replace().await,
                Scenario::ListWidgets => self.handle_list().await,
            }
            .expect("scenario completed without errors");
        })
    }

    async fn handle_create(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::POST);
        assert_eq!(
            request.uri().path(),
            "/apis/testing.opkit.dev/v1/namespaces/dev/widgets"
        );
        let body = request.into_body().collect().await?.to_bytes();
        let sent: serde_json::Value = serde_json::from_slice(&body)?;
        assert_eq!(sent["apiVersion"], "testing.opkit.dev/v1");
        assert_eq!(sent["kind"], "Widget");
        assert_eq!(sent["spec"]["exampleData"], "x");
        // Sections the type leaves undefined must not be on the wire.
        assert!(sent.get("scale").is_none());

        send.send_response(
            Response::builder()
                .status(201)
                .body(Body::from(serde_json::to_vec(&widget_json("w1", "x"))?))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_get_missing(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(
            request.uri().path(),
            "/apis/testing.opkit.dev/v1/namespaces/dev/widgets/missing"
        );
        send.send_response(
            Response::builder()
                .status(404)
                .body(Body::from(serde_json::to_vec(&error_status(
                    404,
                    "NotFound",
                    "widgets \"missing\" not found",
                ))?))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_status_then_scale(mut self) -> Result<Self> {
        {
            let (request, send) = self.0.next_request().await.expect("service not called 1");
            assert_eq!(request.method(), http::Method::PUT);
            assert_eq!(
                request.uri().path(),
                "/apis/testing.opkit.dev/v1/namespaces/dev/widgets/w1/status"
            );
            send.send_response(
                Response::builder()
                    .body(Body::from(serde_json::to_vec(&widget_json("w1", "x"))?))
                    .unwrap(),
            );
        }
        {
            let (request, send) = self.0.next_request().await.expect("service not called 2");
            assert_eq!(request.method(), http::Method::PUT);
            assert_eq!(
                request.uri().path(),
                "/apis/testing.opkit.dev/v1/namespaces/dev/widgets/w1/scale"
            );
            send.send_response(
                Response::builder()
                    .status(500)
                    .body(Body::from(serde_json::to_vec(&error_status(
                        500,
                        "InternalError",
                        "scale update failed",
                    ))?))
                    .unwrap(),
            );
        }
        Ok(self)
    }

    async fn handle_status_failure(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(
            request.uri().path(),
            "/apis/testing.opkit.dev/v1/namespaces/dev/widgets/w1/status"
        );
        send.send_response(
            Response::builder()
                .status(500)
                .body(Body::from(serde_json::to_vec(&error_status(
                    500,
                    "InternalError",
                    "status update failed",
                ))?))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_full_replace(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::PUT);
        assert_eq!(
            request.uri().path(),
            "/apis/testing.opkit.dev/v1/namespaces/dev/widgets/w1"
        );
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&widget_json("w1", "y"))?))
                .unwrap(),
        );
        Ok(self)
    }

    async fn handle_list(mut self) -> Result<Self> {
        let (request, send) = self.0.next_request().await.expect("service not called");
        assert_eq!(request.method(), http::Method::GET);
        assert_eq!(request.uri().path(), "/apis/testing.opkit.dev/v1/widgets");
        let respdata = json!({
            "kind": "WidgetList",
            "apiVersion": "testing.opkit.dev/v1",
            "metadata": {"resourceVersion": "1"},
            "items": [widget_json("w1", "x"), widget_json("w2", "y")]
        });
        send.send_response(
            Response::builder()
                .body(Body::from(serde_json::to_vec(&respdata)?))
                .unwrap(),
        );
        Ok(self)
    }
}

fn quiet_observability() -> Observability {
    Observability::new(ObservabilityConfig {
        background: Some(ObsContext::root()),
        log: Some(Arc::new(|_, _, _, _| {})),
        metric_timer: Some(Arc::new(|_, _| Box::new(|_| {}))),
        correlate: Some(Arc::new(|ctx| ctx.with("correlation_id", "test"))),
    })
}

async fn connected_cluster() -> (Cluster, ApiServerVerifier, ObsContext) {
    let (mock_service, handle) = tower_test::mock::pair::<Request<Body>, Response<Body>>();
    let client = kube::Client::new(mock_service, "default");

    let obs = quiet_observability();
    let ctx = obs.background().clone();
    let config = ClusterConfig {
        crds: vec![CrdGroup {
            group: "testing.opkit.dev".into(),
            version: "v1".into(),
            kinds: vec![KindEntry::of::<Widget>("Widget")],
        }],
        ..Default::default()
    };
    let cluster = Cluster::with_client(&ctx, client, config, obs).unwrap();

    let connecting = cluster.clone();
    let connect_ctx = ctx.clone();
    tokio::spawn(async move {
        let _ = connecting.connect(&connect_ctx).await;
    });
    while !cluster.is_connected() {
        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
    }
    (cluster, ApiServerVerifier(handle), ctx)
}
