//! The handful of API calls the reconciler makes, behind a trait so the
//! reconciliation can be exercised without a cluster.

use std::fmt::Debug;

use async_trait::async_trait;
use kube::{
    api::{DeleteParams, PostParams},
    Api,
};
use serde::{de::DeserializeOwned, Serialize};

use crate::error::is_not_found;

#[async_trait]
pub trait ObjectApi<K>: Send + Sync {
    /// `Ok(None)` when the object does not exist.
    async fn get_opt(&self, name: &str) -> Result<Option<K>, kube::Error>;

    async fn create(&self, object: &K) -> Result<K, kube::Error>;

    async fn replace(&self, name: &str, object: &K) -> Result<K, kube::Error>;

    /// Deleting an object that is already gone is not an error.
    async fn delete(&self, name: &str) -> Result<(), kube::Error>;
}

#[async_trait]
impl<K> ObjectApi<K> for Api<K>
where
    K: Clone + Debug + DeserializeOwned + Serialize + Send + Sync + 'static,
{
    async fn get_opt(&self, name: &str) -> Result<Option<K>, kube::Error> {
        Api::get_opt(self, name).await
    }

    async fn create(&self, object: &K) -> Result<K, kube::Error> {
        Api::create(self, &PostParams::default(), object).await
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, kube::Error> {
        Api::replace(self, name, &PostParams::default(), object).await
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        match Api::delete(self, name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(error) if is_not_found(&error) => Ok(()),
            Err(error) => Err(error),
        }
    }
}

#[async_trait]
impl<K, T> ObjectApi<K> for &T
where
    K: Send + Sync + 'static,
    T: ObjectApi<K> + ?Sized,
{
    async fn get_opt(&self, name: &str) -> Result<Option<K>, kube::Error> {
        (**self).get_opt(name).await
    }

    async fn create(&self, object: &K) -> Result<K, kube::Error> {
        (**self).create(object).await
    }

    async fn replace(&self, name: &str, object: &K) -> Result<K, kube::Error> {
        (**self).replace(name, object).await
    }

    async fn delete(&self, name: &str) -> Result<(), kube::Error> {
        (**self).delete(name).await
    }
}
