//! Admission hook registration and the webhook review handler.
//!
//! A [`Hook`] binds up to four optional callbacks to one registered resource
//! type: defaulting, create-validation, update-validation and
//! delete-validation. Unset callbacks are no-ops (defaulting mutates nothing;
//! validation passes with no warnings). Registered hooks are served by the
//! cluster's webhook listener under `POST /hooks/<plural>`, implementing both
//! the mutating and validating capability in one endpoint.

use std::sync::Arc;

use kube::core::{
    admission::{AdmissionRequest, AdmissionResponse, AdmissionReview, Operation},
    DynamicObject,
};
use warp::{reply::Reply, Filter};

use crate::{
    cluster::Cluster,
    error::{BoxError, Error, Result},
    observe::{Level, ObsContext, Observability},
    resource::EnvelopeKind,
};

/// The defaulting callback; mutates the object in place.
pub type DefaultFn<K> =
    Box<dyn Fn(&ObsContext, &mut K) -> std::result::Result<(), BoxError> + Send + Sync>;

/// A single-object validation callback; returns warnings on success.
pub type ValidateFn<K> =
    Box<dyn Fn(&ObsContext, &K) -> std::result::Result<Vec<String>, BoxError> + Send + Sync>;

/// The update-validation callback; receives (old, new).
pub type ValidateUpdateFn<K> =
    Box<dyn Fn(&ObsContext, &K, &K) -> std::result::Result<Vec<String>, BoxError> + Send + Sync>;

/// The admission callbacks for one resource type.
///
/// ```
/// use opkit::hook::Hook;
/// use opkit::resource::{Envelope, Undefined};
///
/// type Widget = Envelope<WidgetSpec, Undefined, Undefined>;
/// # #[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
/// # struct WidgetSpec { example_data: String }
///
/// let hook = Hook::<Widget>::new()
///     .defaulting(|_ctx, widget| {
///         if widget.spec.example_data.is_empty() {
///             widget.spec.example_data = "default".to_string();
///         }
///         Ok(())
///     })
///     .validate_delete(|_ctx, _widget| Ok(vec!["deletion is permanent".to_string()]));
/// ```
#[derive(Default)]
pub struct Hook<K> {
    default_fn: Option<DefaultFn<K>>,
    validate_create_fn: Option<ValidateFn<K>>,
    validate_update_fn: Option<ValidateUpdateFn<K>>,
    validate_delete_fn: Option<ValidateFn<K>>,
}

impl<K: EnvelopeKind> Hook<K> {
    /// A hook with no callbacks set.
    pub fn new() -> Self {
        Self {
            default_fn: None,
            validate_create_fn: None,
            validate_update_fn: None,
            validate_delete_fn: None,
        }
    }

    /// Set the defaulting callback, applied on create and update.
    #[must_use]
    pub fn defaulting(
        mut self,
        f: impl Fn(&ObsContext, &mut K) -> std::result::Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.default_fn = Some(Box::new(f));
        self
    }

    /// Set the create-validation callback.
    #[must_use]
    pub fn validate_create(
        mut self,
        f: impl Fn(&ObsContext, &K) -> std::result::Result<Vec<String>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.validate_create_fn = Some(Box::new(f));
        self
    }

    /// Set the update-validation callback, invoked with (old, new).
    #[must_use]
    pub fn validate_update(
        mut self,
        f: impl Fn(&ObsContext, &K, &K) -> std::result::Result<Vec<String>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.validate_update_fn = Some(Box::new(f));
        self
    }

    /// Set the delete-validation callback.
    #[must_use]
    pub fn validate_delete(
        mut self,
        f: impl Fn(&ObsContext, &K) -> std::result::Result<Vec<String>, BoxError>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        self.validate_delete_fn = Some(Box::new(f));
        self
    }
}

pub(crate) fn register<K: EnvelopeKind>(
    ctx: &ObsContext,
    cluster: &Cluster,
    hook: Hook<K>,
) -> Result<()> {
    cluster.assert_registration_open("add_hook");
    let entry = cluster.scheme().resolve::<K>()?;
    let plural = entry.resource.plural.clone();
    cluster.obs().log(
        ctx,
        Level::Debug,
        "registering admission hook",
        &[
            ("resource_type", entry.kind.clone()),
            ("path", format!("/hooks/{plural}")),
        ],
    );

    let state = Arc::new(HookState {
        hook,
        obs: cluster.obs().clone(),
        kind: entry.kind.clone(),
    });
    let route = warp::post()
        .and(warp::path("hooks"))
        .and(warp::path(plural))
        .and(warp::path::end())
        .and(warp::body::json())
        .map(move |review: AdmissionReview<DynamicObject>| {
            warp::reply::json(&state.review(review)).into_response()
        })
        .boxed();
    cluster.register_route(route);
    Ok(())
}

pub(crate) struct HookState<K> {
    hook: Hook<K>,
    obs: Observability,
    kind: String,
}

impl<K: EnvelopeKind> HookState<K> {
    #[cfg(test)]
    pub(crate) fn for_tests(hook: Hook<K>, obs: Observability, kind: &str) -> Self {
        Self {
            hook,
            obs,
            kind: kind.to_string(),
        }
    }

    /// Handle one admission review round trip.
    pub(crate) fn review(
        &self,
        review: AdmissionReview<DynamicObject>,
    ) -> AdmissionReview<DynamicObject> {
        let req: AdmissionRequest<DynamicObject> = match review.try_into() {
            Ok(req) => req,
            Err(err) => {
                self.obs.log(
                    self.obs.background(),
                    Level::Error,
                    "malformed admission review",
                    &[
                        ("resource_type", self.kind.clone()),
                        ("error", err.to_string()),
                    ],
                );
                return AdmissionResponse::invalid(err.to_string()).into_review();
            }
        };

        let ctx = self.obs.correlate(self.obs.background());
        let operation = operation_label(&req.operation);
        self.obs.log(
            &ctx,
            Level::Info,
            "admitting resource",
            &[
                ("resource_type", self.kind.clone()),
                ("object", request_id(&req)),
                ("operation", operation.to_string()),
            ],
        );
        let stop = self.obs.timer(&ctx, "opkit_hook");
        let response = self.admit(&ctx, &req);
        stop(&[
            ("resource_type", self.kind.clone()),
            ("resource_action", operation.to_string()),
        ]);
        self.obs.log(
            &ctx,
            Level::Trace,
            "admission decided",
            &[
                ("resource_type", self.kind.clone()),
                ("object", request_id(&req)),
                ("allowed", response.allowed.to_string()),
                ("payload", format!("{:?}", req.object)),
            ],
        );
        response.into_review()
    }

    fn admit(&self, ctx: &ObsContext, req: &AdmissionRequest<DynamicObject>) -> AdmissionResponse {
        let res = AdmissionResponse::from(req);
        let outcome = match req.operation {
            Operation::Create => self.admit_create(ctx, req, res.clone()),
            Operation::Update => self.admit_update(ctx, req, res.clone()),
            Operation::Delete => self.admit_delete(ctx, req, res.clone()),
            // Connect is not a persistence operation; nothing to enforce.
            Operation::Connect => Ok(res.clone()),
        };
        outcome.unwrap_or_else(|reason| res.deny(reason))
    }

    fn admit_create(
        &self,
        ctx: &ObsContext,
        req: &AdmissionRequest<DynamicObject>,
        res: AdmissionResponse,
    ) -> std::result::Result<AdmissionResponse, String> {
        let Some(object) = &req.object else {
            return Ok(res);
        };
        let item = self.narrow(object)?;
        let (res, item) = self.apply_defaulting(ctx, req, res, item)?;
        let warnings = match &self.hook.validate_create_fn {
            Some(f) => f(ctx, &item).map_err(|err| err.to_string())?,
            None => Vec::new(),
        };
        Ok(with_warnings(res, warnings))
    }

    fn admit_update(
        &self,
        ctx: &ObsContext,
        req: &AdmissionRequest<DynamicObject>,
        res: AdmissionResponse,
    ) -> std::result::Result<AdmissionResponse, String> {
        let (Some(object), Some(old_object)) = (&req.object, &req.old_object) else {
            return Ok(res);
        };
        // Both sides must narrow; failures are reported as one combined error.
        let (new, old) = match (self.narrow(object), self.narrow(old_object)) {
            (Ok(new), Ok(old)) => (new, old),
            (new, old) => {
                let mut reasons = Vec::new();
                if let Err(reason) = new {
                    reasons.push(format!("new object: {reason}"));
                }
                if let Err(reason) = old {
                    reasons.push(format!("old object: {reason}"));
                }
                return Err(reasons.join("; "));
            }
        };
        let (res, new) = self.apply_defaulting(ctx, req, res, new)?;
        let warnings = match &self.hook.validate_update_fn {
            Some(f) => f(ctx, &old, &new).map_err(|err| err.to_string())?,
            None => Vec::new(),
        };
        Ok(with_warnings(res, warnings))
    }

    fn admit_delete(
        &self,
        ctx: &ObsContext,
        req: &AdmissionRequest<DynamicObject>,
        res: AdmissionResponse,
    ) -> std::result::Result<AdmissionResponse, String> {
        let Some(old_object) = &req.old_object else {
            return Ok(res);
        };
        let item = self.narrow(old_object)?;
        let warnings = match &self.hook.validate_delete_fn {
            Some(f) => f(ctx, &item).map_err(|err| err.to_string())?,
            None => Vec::new(),
        };
        Ok(with_warnings(res, warnings))
    }

    /// Run the defaulting callback and attach the resulting JSON patch.
    ///
    /// The patch is computed between the typed before and after views, so it
    /// only ever touches fields the resource type models.
    fn apply_defaulting(
        &self,
        ctx: &ObsContext,
        req: &AdmissionRequest<DynamicObject>,
        res: AdmissionResponse,
        item: K,
    ) -> std::result::Result<(AdmissionResponse, K), String> {
        let Some(f) = &self.hook.default_fn else {
            return Ok((res, item));
        };
        let mut mutated = item.clone();
        f(ctx, &mut mutated).map_err(|err| err.to_string())?;

        let before = serde_json::to_value(&item).map_err(|err| err.to_string())?;
        let after = serde_json::to_value(&mutated).map_err(|err| err.to_string())?;
        let patch = json_patch::diff(&before, &after);
        if req.dry_run || patch.0.is_empty() {
            return Ok((res, mutated));
        }
        let res = res.with_patch(patch).map_err(|err| err.to_string())?;
        Ok((res, mutated))
    }

    fn narrow(&self, object: &DynamicObject) -> std::result::Result<K, String> {
        let value = serde_json::to_value(object).map_err(Error::Serialize);
        value
            .and_then(|value| {
                serde_json::from_value::<K>(value).map_err(|source| Error::HookObject {
                    expected: std::any::type_name::<K>(),
                    source,
                })
            })
            .map_err(|err| err.to_string())
    }
}

fn with_warnings(mut res: AdmissionResponse, warnings: Vec<String>) -> AdmissionResponse {
    if !warnings.is_empty() {
        res.warnings = Some(warnings);
    }
    res
}

fn operation_label(operation: &Operation) -> &'static str {
    match operation {
        Operation::Create => "create",
        Operation::Update => "update",
        Operation::Delete => "delete",
        Operation::Connect => "connect",
    }
}

fn request_id(req: &AdmissionRequest<DynamicObject>) -> String {
    match &req.namespace {
        Some(ns) => format!("{ns}/{}", req.name),
        None => req.name.clone(),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::observe::test_observability;
    use crate::resource::{Envelope, Undefined};
    use serde_json::json;

    #[derive(Clone, Debug, Default, PartialEq, serde::Serialize, serde::Deserialize)]
    #[serde(rename_all = "camelCase")]
    struct WidgetSpec {
        example_data: String,
    }

    type Widget = Envelope<WidgetSpec, Undefined, Undefined>;

    fn state(hook: Hook<Widget>) -> HookState<Widget> {
        HookState::for_tests(hook, test_observability(), "Widget")
    }

    fn review_for(operation: &str, object: serde_json::Value, old: serde_json::Value) -> AdmissionReview<DynamicObject> {
        serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
            "request": {
                "uid": "705ab4f5",
                "kind": {"group": "testing.opkit.dev", "version": "v1", "kind": "Widget"},
                "resource": {"group": "testing.opkit.dev", "version": "v1", "resource": "widgets"},
                "name": "w1",
                "namespace": "dev",
                "operation": operation,
                "userInfo": {},
                "object": object,
                "oldObject": old,
            }
        }))
        .unwrap()
    }

    fn widget_json(example_data: &str) -> serde_json::Value {
        json!({
            "apiVersion": "testing.opkit.dev/v1",
            "kind": "Widget",
            "metadata": {"name": "w1", "namespace": "dev"},
            "spec": {"exampleData": example_data}
        })
    }

    fn response(review: AdmissionReview<DynamicObject>) -> AdmissionResponse {
        review.response.unwrap()
    }

    #[test]
    fn empty_hook_allows_everything() {
        let state = state(Hook::new());
        let res = response(state.review(review_for("CREATE", widget_json("x"), json!(null))));
        assert!(res.allowed);
        assert!(res.patch.is_none());
        assert!(res.warnings.is_none());
    }

    #[test]
    fn create_validation_rejects_with_the_callback_error() {
        let hook = Hook::<Widget>::new().validate_create(|_ctx, widget| {
            if widget.spec.example_data.is_empty() {
                return Err("exampleData must not be empty".into());
            }
            Ok(Vec::new())
        });
        let state = state(hook);

        let denied = response(state.review(review_for("CREATE", widget_json(""), json!(null))));
        assert!(!denied.allowed);
        assert!(denied.result.message.contains("must not be empty"));

        let allowed = response(state.review(review_for("CREATE", widget_json("y"), json!(null))));
        assert!(allowed.allowed);
    }

    #[test]
    fn defaulting_emits_a_patch_for_the_changed_field() {
        let hook = Hook::<Widget>::new().defaulting(|_ctx, widget| {
            if widget.spec.example_data.is_empty() {
                widget.spec.example_data = "defaulted".to_string();
            }
            Ok(())
        });
        let state = state(hook);

        let res = response(state.review(review_for("CREATE", widget_json(""), json!(null))));
        assert!(res.allowed);
        let patch: serde_json::Value =
            serde_json::from_slice(res.patch.as_deref().unwrap()).unwrap();
        assert_eq!(
            patch,
            json!([{"op": "replace", "path": "/spec/exampleData", "value": "defaulted"}])
        );

        // Nothing to default, nothing to patch.
        let res = response(state.review(review_for("CREATE", widget_json("set"), json!(null))));
        assert!(res.allowed);
        assert!(res.patch.is_none());
    }

    #[test]
    fn update_validation_sees_old_and_new() {
        let hook = Hook::<Widget>::new().validate_update(|_ctx, old, new| {
            if old.spec.example_data != new.spec.example_data {
                return Err("exampleData is immutable".into());
            }
            Ok(Vec::new())
        });
        let state = state(hook);

        let denied =
            response(state.review(review_for("UPDATE", widget_json("b"), widget_json("a"))));
        assert!(!denied.allowed);

        let allowed =
            response(state.review(review_for("UPDATE", widget_json("a"), widget_json("a"))));
        assert!(allowed.allowed);
    }

    #[test]
    fn delete_validation_runs_against_the_old_object() {
        let hook = Hook::<Widget>::new()
            .validate_delete(|_ctx, widget| Ok(vec![format!("removing {}", widget.spec.example_data)]));
        let state = state(hook);

        let res = response(state.review(review_for("DELETE", json!(null), widget_json("x"))));
        assert!(res.allowed);
        assert_eq!(res.warnings, Some(vec!["removing x".to_string()]));
    }

    #[test]
    fn review_without_a_request_is_invalid() {
        let state = state(Hook::new());
        let review: AdmissionReview<DynamicObject> = serde_json::from_value(json!({
            "apiVersion": "admission.k8s.io/v1",
            "kind": "AdmissionReview",
        }))
        .unwrap();
        let res = response(state.review(review));
        assert!(!res.allowed);
    }

    #[test]
    fn incompatible_objects_are_denied_not_panicked() {
        let hook = Hook::<Widget>::new().validate_create(|_ctx, _| Ok(Vec::new()));
        let state = state(hook);
        let malformed = json!({
            "apiVersion": "testing.opkit.dev/v1",
            "kind": "Widget",
            "metadata": {"name": "w1"},
            "spec": {"exampleData": 42}
        });
        let res = response(state.review(review_for("CREATE", malformed, json!(null))));
        assert!(!res.allowed);
        assert!(res.result.message.contains("incompatible"));
    }
}
