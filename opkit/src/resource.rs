//! Generic envelope and envelope-list wrappers for custom resources.
//!
//! [`Envelope`] is the template for a struct representing a custom resource
//! with the conventional `spec`, `status` and `scale` sections. The typical
//! use is a type alias naming the resource:
//!
//! ```
//! use opkit::resource::{Envelope, Undefined};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
//! #[serde(rename_all = "camelCase")]
//! struct WidgetSpec {
//!     example_data: String,
//! }
//!
//! /// A Widget has a spec, and neither status nor scale.
//! type Widget = Envelope<WidgetSpec, Undefined, Undefined>;
//! ```
//!
//! Sections a resource does not define are marked [`Undefined`]; such fields
//! never appear in the wire representation.

use std::borrow::Cow;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ListMeta, ObjectMeta};
use kube::core::{ApiResource, DynamicResourceScope, Resource, TypeMeta};
use serde::{de::DeserializeOwned, ser::SerializeMap, Deserialize, Serialize, Serializer};

/// Marker for a conventional section a resource does not define.
///
/// Serializes to JSON null, which the envelope serializer then drops, so an
/// undefined section is absent from the wire representation rather than null.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Undefined;

/// A custom resource with the conventional `spec`, `status` and `scale`
/// sections, each an independent type parameter.
///
/// - `spec` defines the desired state of the resource.
/// - `status`, typically a subresource, publishes the observed state.
/// - `scale`, typically a subresource, defines scaling properties.
///
/// Any section the resource does not define is set to [`Undefined`].
///
/// Deep copy is plain [`Clone`]; two clones are independently mutable.
#[derive(Clone, Debug, PartialEq, Deserialize)]
#[serde(bound(
    deserialize = "S: serde::Deserialize<'de> + Default, T: serde::Deserialize<'de> + Default, C: serde::Deserialize<'de> + Default"
))]
pub struct Envelope<S, T, C> {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,

    /// Standard object metadata: name, namespace, resource version and more
    #[serde(default)]
    pub metadata: ObjectMeta,

    /// The desired state of the resource
    #[serde(default)]
    pub spec: S,

    /// The observed state of the resource
    #[serde(default)]
    pub status: T,

    /// The scaling properties of the resource
    #[serde(default)]
    pub scale: C,
}

impl<S, T, C> Serialize for Envelope<S, T, C>
where
    S: Serialize,
    T: Serialize,
    C: Serialize,
{
    fn serialize<Z>(&self, serializer: Z) -> Result<Z::Ok, Z::Error>
    where
        Z: Serializer,
    {
        // Sections holding the Undefined marker serialize to null; those keys
        // must be absent on the wire, so serialize via Value and drop nulls.
        let spec = serde_json::to_value(&self.spec).map_err(serde::ser::Error::custom)?;
        let status = serde_json::to_value(&self.status).map_err(serde::ser::Error::custom)?;
        let scale = serde_json::to_value(&self.scale).map_err(serde::ser::Error::custom)?;

        let mut map = serializer.serialize_map(None)?;
        if let Some(types) = &self.types {
            map.serialize_entry("apiVersion", &types.api_version)?;
            map.serialize_entry("kind", &types.kind)?;
        }
        map.serialize_entry("metadata", &self.metadata)?;
        if !spec.is_null() {
            map.serialize_entry("spec", &spec)?;
        }
        if !status.is_null() {
            map.serialize_entry("status", &status)?;
        }
        if !scale.is_null() {
            map.serialize_entry("scale", &scale)?;
        }
        map.end()
    }
}

impl<S: Default, T: Default, C: Default> Default for Envelope<S, T, C> {
    fn default() -> Self {
        Self {
            types: None,
            metadata: ObjectMeta::default(),
            spec: S::default(),
            status: T::default(),
            scale: C::default(),
        }
    }
}

impl<S, T, C> Envelope<S, T, C>
where
    T: Default,
    C: Default,
{
    /// A named envelope with type fields taken from an [`ApiResource`].
    pub fn new(name: &str, ar: &ApiResource, spec: S) -> Self {
        Self {
            types: Some(TypeMeta {
                api_version: ar.api_version.clone(),
                kind: ar.kind.clone(),
            }),
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                ..Default::default()
            },
            spec,
            status: T::default(),
            scale: C::default(),
        }
    }

    /// Attach a namespace to the envelope.
    #[must_use]
    pub fn within(mut self, ns: &str) -> Self {
        self.metadata.namespace = Some(ns.to_string());
        self
    }
}

impl<S, T, C> Resource for Envelope<S, T, C> {
    type DynamicType = ApiResource;
    type Scope = DynamicResourceScope;

    fn group(dt: &ApiResource) -> Cow<'_, str> {
        dt.group.as_str().into()
    }

    fn version(dt: &ApiResource) -> Cow<'_, str> {
        dt.version.as_str().into()
    }

    fn kind(dt: &ApiResource) -> Cow<'_, str> {
        dt.kind.as_str().into()
    }

    fn plural(dt: &ApiResource) -> Cow<'_, str> {
        dt.plural.as_str().into()
    }

    fn api_version(dt: &ApiResource) -> Cow<'_, str> {
        dt.api_version.as_str().into()
    }

    fn meta(&self) -> &ObjectMeta {
        &self.metadata
    }

    fn meta_mut(&mut self) -> &mut ObjectMeta {
        &mut self.metadata
    }
}

/// The list form of zero or more [`Envelope`] items.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EnvelopeList<K> {
    /// The type fields, not always present
    #[serde(flatten, default)]
    pub types: Option<TypeMeta>,

    /// List metadata; carries the continuation token and resource version
    #[serde(default)]
    pub metadata: ListMeta,

    /// The items, in the order the store returned them
    #[serde(default = "Vec::new")]
    pub items: Vec<K>,
}

impl<K> EnvelopeList<K> {
    /// Iterate over the items.
    pub fn iter(&self) -> impl Iterator<Item = &K> {
        self.items.iter()
    }

    /// Iterate mutably over the items.
    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut K> {
        self.items.iter_mut()
    }

    /// The number of items.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list holds no items.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<K> IntoIterator for EnvelopeList<K> {
    type IntoIter = std::vec::IntoIter<K>;
    type Item = K;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

impl<'a, K> IntoIterator for &'a EnvelopeList<K> {
    type IntoIter = std::slice::Iter<'a, K>;
    type Item = &'a K;

    fn into_iter(self) -> Self::IntoIter {
        self.items.iter()
    }
}

/// The bounds every typed operation in this crate needs from a resource type.
///
/// Blanket-implemented; any [`Envelope`] alias whose payload types are
/// `Clone + Debug + Default + Serialize + Deserialize` qualifies. `Default`
/// supplies the zero value used when reconciling a deleted object, and serde
/// supplies the checked narrowing from untyped admission objects.
pub trait EnvelopeKind:
    Resource<DynamicType = ApiResource, Scope = DynamicResourceScope>
    + Clone
    + std::fmt::Debug
    + Default
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> EnvelopeKind for K where
    K: Resource<DynamicType = ApiResource, Scope = DynamicResourceScope>
        + Clone
        + std::fmt::Debug
        + Default
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

#[cfg(test)]
mod test {
    use super::*;
    use assert_json_diff::assert_json_eq;
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
    type BareWidget = Envelope<Undefined, Undefined, Undefined>;

    fn widget_resource() -> ApiResource {
        ApiResource::from_gvk(&kube::core::GroupVersionKind::gvk(
            "testing.opkit.dev",
            "v1",
            "Widget",
        ))
    }

    #[test]
    fn undefined_sections_are_absent_on_the_wire() {
        let w = Widget::new(
            "w1",
            &widget_resource(),
            WidgetSpec {
                example_data: "x".into(),
            },
        )
        .within("dev");

        let value = serde_json::to_value(&w).unwrap();
        assert_json_eq!(
            value,
            json!({
                "apiVersion": "testing.opkit.dev/v1",
                "kind": "Widget",
                "metadata": { "name": "w1", "namespace": "dev" },
                "spec": { "exampleData": "x" },
                "status": { "ready": false }
            })
        );
        assert!(value.get("scale").is_none());
    }

    #[test]
    fn all_undefined_round_trips_to_metadata_only() {
        let w = BareWidget::new("w2", &widget_resource(), Undefined);
        let value = serde_json::to_value(&w).unwrap();
        assert!(value.get("spec").is_none());
        assert!(value.get("status").is_none());
        assert!(value.get("scale").is_none());

        let back: BareWidget = serde_json::from_value(value).unwrap();
        assert_eq!(back, w);
    }

    #[test]
    fn round_trip_preserves_set_fields() {
        let w = Widget::new(
            "w3",
            &widget_resource(),
            WidgetSpec {
                example_data: "hello".into(),
            },
        )
        .within("dev");

        let wire = serde_json::to_string(&w).unwrap();
        let back: Widget = serde_json::from_str(&wire).unwrap();
        assert_eq!(back, w);
        assert_eq!(back.spec.example_data, "hello");
        assert_eq!(back.metadata.namespace.as_deref(), Some("dev"));
    }

    #[test]
    fn deserializes_with_sections_missing() {
        let back: Widget = serde_json::from_value(json!({
            "metadata": { "name": "partial" }
        }))
        .unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("partial"));
        assert_eq!(back.spec, WidgetSpec::default());
        assert_eq!(back.status, WidgetStatus::default());
    }

    #[test]
    fn clones_are_independently_mutable() {
        let original = Widget::new(
            "w4",
            &widget_resource(),
            WidgetSpec {
                example_data: "a".into(),
            },
        );
        let mut first = original.clone();
        let second = original.clone();

        first.spec.example_data = "mutated".into();
        assert_eq!(original.spec.example_data, "a");
        assert_eq!(second.spec.example_data, "a");
    }

    #[test]
    fn resource_impl_delegates_to_the_api_resource() {
        let ar = widget_resource();
        assert_eq!(Widget::group(&ar), "testing.opkit.dev");
        assert_eq!(Widget::version(&ar), "v1");
        assert_eq!(Widget::kind(&ar), "Widget");
        assert_eq!(Widget::plural(&ar), "widgets");
        assert_eq!(Widget::api_version(&ar), "testing.opkit.dev/v1");
    }

    #[test]
    fn list_iterates_in_order() {
        let list = EnvelopeList {
            types: None,
            metadata: ListMeta::default(),
            items: vec![1, 2, 3],
        };
        assert_eq!(list.len(), 3);
        let doubled: Vec<i32> = list.iter().map(|x| x * 2).collect();
        assert_eq!(doubled, vec![2, 4, 6]);
    }
}
