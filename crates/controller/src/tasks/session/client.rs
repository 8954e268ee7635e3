//! Cluster access used by a session reconcile pass.

use crate::crds::{InteractiveSession, InteractiveSessionStatus};
use crate::tasks::session::children::{Child, ChildKind};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Event, PersistentVolumeClaim, Pod, Secret, Service};
use k8s_openapi::api::networking::v1::Ingress;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};
use std::fmt::Debug;

/// Namespaced cluster operations of one reconcile pass
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SessionClient: Send + Sync {
    /// `None` when the object does not exist
    async fn get_child(&self, kind: ChildKind, name: &str) -> Result<Option<Child>, kube::Error>;

    async fn create_child(&self, child: &Child) -> Result<Child, kube::Error>;

    /// Apply a JSON merge patch to an existing child
    async fn patch_child(
        &self,
        kind: ChildKind,
        name: &str,
        patch: &Value,
    ) -> Result<Child, kube::Error>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, kube::Error>;

    /// Events whose involved object is the named pod
    async fn list_pod_events(&self, pod_name: &str) -> Result<Vec<Event>, kube::Error>;

    async fn patch_session_status(
        &self,
        name: &str,
        status: &InteractiveSessionStatus,
    ) -> Result<(), kube::Error>;

    /// Set `spec.hibernated` on the session
    async fn hibernate_session(&self, name: &str) -> Result<(), kube::Error>;

    /// Foreground deletion of the session and its children
    async fn delete_session(&self, name: &str) -> Result<(), kube::Error>;

    /// Returns `false` when the secret was already gone
    async fn delete_secret(&self, name: &str) -> Result<bool, kube::Error>;
}

/// [`SessionClient`] backed by the Kubernetes API
pub struct KubeSessionClient {
    client: Client,
    namespace: String,
}

impl KubeSessionClient {
    #[must_use]
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
        }
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope, DynamicType = ()>,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

async fn create<K>(api: Api<K>, object: &K) -> Result<K, kube::Error>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    api.create(&PostParams::default(), object).await
}

async fn patch<K>(api: Api<K>, name: &str, patch: &Value) -> Result<K, kube::Error>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
        .await
}

#[async_trait]
impl SessionClient for KubeSessionClient {
    async fn get_child(&self, kind: ChildKind, name: &str) -> Result<Option<Child>, kube::Error> {
        Ok(match kind {
            ChildKind::StatefulSet => self
                .api::<StatefulSet>()
                .get_opt(name)
                .await?
                .map(Child::StatefulSet),
            ChildKind::Service => self.api::<Service>().get_opt(name).await?.map(Child::Service),
            ChildKind::Ingress => self.api::<Ingress>().get_opt(name).await?.map(Child::Ingress),
            ChildKind::PersistentVolumeClaim => self
                .api::<PersistentVolumeClaim>()
                .get_opt(name)
                .await?
                .map(Child::PersistentVolumeClaim),
            ChildKind::DataSourceClaim => self
                .api::<PersistentVolumeClaim>()
                .get_opt(name)
                .await?
                .map(Child::DataSourceClaim),
        })
    }

    async fn create_child(&self, child: &Child) -> Result<Child, kube::Error> {
        Ok(match child {
            Child::StatefulSet(o) => Child::StatefulSet(create(self.api(), o).await?),
            Child::Service(o) => Child::Service(create(self.api(), o).await?),
            Child::Ingress(o) => Child::Ingress(create(self.api(), o).await?),
            Child::PersistentVolumeClaim(o) => {
                Child::PersistentVolumeClaim(create(self.api(), o).await?)
            }
            Child::DataSourceClaim(o) => Child::DataSourceClaim(create(self.api(), o).await?),
        })
    }

    async fn patch_child(
        &self,
        kind: ChildKind,
        name: &str,
        body: &Value,
    ) -> Result<Child, kube::Error> {
        Ok(match kind {
            ChildKind::StatefulSet => Child::StatefulSet(patch(self.api(), name, body).await?),
            ChildKind::Service => Child::Service(patch(self.api(), name, body).await?),
            ChildKind::Ingress => Child::Ingress(patch(self.api(), name, body).await?),
            ChildKind::PersistentVolumeClaim => {
                Child::PersistentVolumeClaim(patch(self.api(), name, body).await?)
            }
            ChildKind::DataSourceClaim => {
                Child::DataSourceClaim(patch(self.api(), name, body).await?)
            }
        })
    }

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, kube::Error> {
        self.api::<Pod>().get_opt(name).await
    }

    async fn list_pod_events(&self, pod_name: &str) -> Result<Vec<Event>, kube::Error> {
        let params = ListParams::default().fields(&format!(
            "involvedObject.kind=Pod,involvedObject.name={pod_name}"
        ));
        Ok(self.api::<Event>().list(&params).await?.items)
    }

    async fn patch_session_status(
        &self,
        name: &str,
        status: &InteractiveSessionStatus,
    ) -> Result<(), kube::Error> {
        let patch = json!({ "status": status });
        self.api::<InteractiveSession>()
            .patch_status(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn hibernate_session(&self, name: &str) -> Result<(), kube::Error> {
        let patch = json!({ "spec": { "hibernated": true } });
        self.api::<InteractiveSession>()
            .patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }

    async fn delete_session(&self, name: &str) -> Result<(), kube::Error> {
        match self
            .api::<InteractiveSession>()
            .delete(name, &DeleteParams::foreground())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn delete_secret(&self, name: &str) -> Result<bool, kube::Error> {
        match self
            .api::<Secret>()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(response)) if response.code == 404 => Ok(false),
            Err(e) => Err(e),
        }
    }
}
