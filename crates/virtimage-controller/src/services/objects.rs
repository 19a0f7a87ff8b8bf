//! Small helpers over `kube::Api` shared by the services

use std::fmt::Debug;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams};
use kube::{Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use virtimage_common::crd::{VirtualImage, VIRTUAL_IMAGE_KIND};
use virtimage_common::supplements::{fetch_with_fallback, Supplement, SupplementNames};
use virtimage_common::{Result, API_VERSION, FIELD_MANAGER, IMAGE_NAME_LABEL, MANAGED_BY};

/// Controller owner reference pointing at the image
pub fn owner_reference(vi: &VirtualImage) -> OwnerReference {
    OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: VIRTUAL_IMAGE_KIND.to_string(),
        name: vi.name_any(),
        uid: vi.uid_or_default(),
        controller: Some(true),
        block_owner_deletion: Some(true),
    }
}

/// Metadata of a helper object owned by `owner`
pub fn helper_meta(name: &str, namespace: &str, owner: &OwnerReference) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        labels: Some(
            [
                ("app.kubernetes.io/managed-by".to_string(), MANAGED_BY.to_string()),
                (IMAGE_NAME_LABEL.to_string(), owner.name.clone()),
            ]
            .into_iter()
            .collect(),
        ),
        owner_references: Some(vec![owner.clone()]),
        ..Default::default()
    }
}

/// Whether an object has a deletion timestamp
pub fn is_terminating<K: Resource>(obj: Option<&K>) -> bool {
    obj.is_some_and(|o| o.meta().deletion_timestamp.is_some())
}

/// Fetch a helper of `names` by its current name, falling back to the legacy one
pub async fn get_supplement<K>(
    api_for: impl Fn(&str) -> Api<K>,
    names: &SupplementNames,
    supplement: Supplement,
) -> Result<Option<K>>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    fetch_with_fallback(names, supplement, |name| {
        let api = api_for(&name.namespace);
        async move { Ok(api.get_opt(&name.name).await?) }
    })
    .await
}

/// Create an object, treating AlreadyExists as success
pub async fn create_if_missing<K>(api: &Api<K>, obj: &K) -> Result<()>
where
    K: Resource + Clone + Serialize + DeserializeOwned + Debug,
{
    match api.create(&PostParams::default(), obj).await {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 409 => {
            debug!(name = %obj.name_any(), "helper object already exists");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Delete an object, returning whether it existed
pub async fn delete_if_exists<K>(api: &Api<K>, name: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    match api.delete(name, &DeleteParams::background()).await {
        Ok(_) => Ok(true),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(false),
        Err(e) => Err(e.into()),
    }
}

/// Add a finalizer to an object unless it is already present
pub async fn add_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let mut finalizers = obj.finalizers().to_vec();
    if finalizers.iter().any(|f| f == finalizer) {
        return Ok(());
    }
    finalizers.push(finalizer.to_string());
    patch_finalizers(api, &obj.name_any(), finalizers).await
}

/// Remove a finalizer from an object if present
pub async fn remove_finalizer<K>(api: &Api<K>, obj: &K, finalizer: &str) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    if !obj.finalizers().iter().any(|f| f == finalizer) {
        return Ok(());
    }
    let finalizers: Vec<String> = obj
        .finalizers()
        .iter()
        .filter(|f| *f != finalizer)
        .cloned()
        .collect();
    patch_finalizers(api, &obj.name_any(), finalizers).await
}

async fn patch_finalizers<K>(api: &Api<K>, name: &str, finalizers: Vec<String>) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    match api
        .patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await
    {
        Ok(_) => Ok(()),
        Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Remove a finalizer, then delete the object
pub async fn release_and_delete<K>(api: &Api<K>, obj: Option<K>, finalizer: &str) -> Result<bool>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    let Some(obj) = obj else {
        return Ok(false);
    };
    remove_finalizer(api, &obj, finalizer).await?;
    delete_if_exists(api, &obj.name_any()).await
}
