//! Target URL resolution
//!
//! A [`Resource`] turns the node picked by the executor into the full URL of
//! the call. Resources compose: the API root is `<endpoint>/api/json/v1`, a
//! namespace is the root plus `/<namespace>`, a collection is the namespace
//! plus `/<collection>`.

use crate::topology::Node;

/// Path of the JSON API below a node endpoint
pub const API_PATH: &str = "api/json/v1";

/// Resolves the URL to call on a given node
pub trait Resource: Send + Sync {
    fn resource(&self, node: &Node) -> String;
}

impl<F> Resource for F
where
    F: Fn(&Node) -> String + Send + Sync,
{
    fn resource(&self, node: &Node) -> String {
        self(node)
    }
}

/// `<endpoint>/api/json/v1`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ApiRoot;

impl Resource for ApiRoot {
    fn resource(&self, node: &Node) -> String {
        format!("{}/{}", node.base_url(), API_PATH)
    }
}

/// A parent resource extended by one path segment
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubResource<P> {
    parent: P,
    segment: String,
}

impl<P> SubResource<P> {
    pub fn parent(&self) -> &P {
        &self.parent
    }

    pub fn segment(&self) -> &str {
        &self.segment
    }
}

impl<P: Resource> Resource for SubResource<P> {
    fn resource(&self, node: &Node) -> String {
        format!("{}/{}", self.parent.resource(node), self.segment)
    }
}

/// Composition helpers available on every sized resource
pub trait ResourceExt: Resource + Sized {
    fn child(self, segment: impl Into<String>) -> SubResource<Self> {
        SubResource {
            parent: self,
            segment: segment.into().trim_matches('/').to_string(),
        }
    }
}

impl<R: Resource + Sized> ResourceExt for R {}

/// Resource of a namespace
pub type NamespaceResource = SubResource<ApiRoot>;

/// Resource of a collection
pub type CollectionResource = SubResource<NamespaceResource>;

pub fn namespace_resource(namespace: &str) -> NamespaceResource {
    ApiRoot.child(namespace)
}

pub fn collection_resource(namespace: &str, collection: &str) -> CollectionResource {
    namespace_resource(namespace).child(collection)
}
