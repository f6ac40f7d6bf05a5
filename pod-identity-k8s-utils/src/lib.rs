use std::fmt::Debug;
use std::hash::Hash;
use std::time::Duration;

use futures::StreamExt;
use k8s_openapi::serde::de::DeserializeOwned;
use kube::runtime::reflector::Store;
use kube::runtime::{WatchStreamExt, reflector, watcher};
use kube::{Api, Resource};
use thiserror::Error;
use tracing::{error, trace};

#[derive(Error, Debug)]
pub enum Error {
    #[error("failed to create store: {0}")]
    StoreCreation(String),

    #[error("kube error: {0}")]
    KubeError(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Starts a reflector for `api` and returns its store once the initial list
/// has been applied. Every watch event is handed to `notify` after it has
/// been written to the store, so a listing performed from `notify` already
/// observes the change.
pub async fn create_store_with_notifier<K, F>(
    api: Api<K>,
    timeout: Option<Duration>,
    notify: F,
) -> Result<Store<K>>
where
    K: Resource + Send + Clone + Debug + DeserializeOwned + Sync + 'static,
    <K as Resource>::DynamicType: Default + Eq + Send + Sync + Hash + Clone,
    F: Fn(&watcher::Event<K>) + Send + 'static,
{
    let (store, writer) = reflector::store();

    let stream = watcher(api, watcher::Config::default())
        .default_backoff()
        .reflect(writer)
        .for_each(move |res| {
            match res {
                Ok(ev) => {
                    trace!("received event: {:?}", ev);
                    notify(&ev);
                }
                Err(e) => {
                    error!(%e, "unexpected error with stream")
                }
            }
            futures::future::ready(())
        });

    tokio::spawn(stream);
    let wait = store.wait_until_ready();
    if let Some(timeout) = timeout {
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| Error::StoreCreation("timed out waiting for store".into()))?
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    } else {
        wait.await
            .map_err(|e| Error::StoreCreation(e.to_string()))?;
    }
    Ok(store)
}

