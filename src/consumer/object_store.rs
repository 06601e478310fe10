//! Object store creation and versioned JSON records.
//!
//! Lease and checkpoint records are small JSON documents. Every write is a
//! conditional put: `PutMode::Create` when the caller saw no record, and
//! `PutMode::Update` with the version the caller read otherwise. A lost race
//! surfaces as [`CasOutcome::Conflict`], never as an error.

use std::sync::Arc;

use futures::TryStreamExt;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutMode, PutOptions, PutPayload, UpdateVersion};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use super::config::StoreBackend;
use super::error::{ConsumerError, ConsumerResult};
use super::keys::StoreLayout;

/// Create an object store for the configured backend.
///
/// Cloud backends are built from their builders with explicit settings;
/// anything not supplied falls back to the builder's own environment lookup
/// (instance credentials, managed identity).
pub fn create_object_store(backend: &StoreBackend) -> ConsumerResult<Arc<dyn ObjectStore>> {
    match backend {
        StoreBackend::Memory => {
            info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
        StoreBackend::S3 {
            bucket,
            region,
            endpoint,
            access_key_id,
            secret_access_key,
        } => {
            use object_store::aws::{AmazonS3Builder, S3ConditionalPut};

            let mut builder = AmazonS3Builder::new()
                .with_bucket_name(bucket)
                .with_region(region)
                .with_conditional_put(S3ConditionalPut::ETagMatch);

            if let Some(ep) = endpoint {
                builder = builder.with_endpoint(ep).with_allow_http(true);
            }

            if let (Some(key), Some(secret)) = (access_key_id, secret_access_key) {
                builder = builder
                    .with_access_key_id(key)
                    .with_secret_access_key(secret);
            }

            let store = builder.build().map_err(|e| {
                ConsumerError::Config(format!("Failed to create S3 object store: {}", e))
            })?;

            info!(bucket = %bucket, region = %region, "Using S3 object store");
            Ok(Arc::new(store))
        }
        StoreBackend::Gcs {
            bucket,
            service_account_key,
        } => {
            use object_store::gcp::GoogleCloudStorageBuilder;

            let mut builder = GoogleCloudStorageBuilder::new().with_bucket_name(bucket);

            if let Some(key_path) = service_account_key {
                builder = builder.with_service_account_path(key_path);
            }

            let store = builder.build().map_err(|e| {
                ConsumerError::Config(format!("Failed to create GCS object store: {}", e))
            })?;

            info!(bucket = %bucket, "Using GCS object store");
            Ok(Arc::new(store))
        }
        StoreBackend::Azure {
            container,
            account,
            access_key,
        } => {
            use object_store::azure::MicrosoftAzureBuilder;

            let mut builder = MicrosoftAzureBuilder::new()
                .with_container_name(container)
                .with_account(account);

            if let Some(key) = access_key {
                builder = builder.with_access_key(key);
            }

            let store = builder.build().map_err(|e| {
                ConsumerError::Config(format!("Failed to create Azure object store: {}", e))
            })?;

            info!(container = %container, account = %account, "Using Azure object store");
            Ok(Arc::new(store))
        }
    }
}

/// A decoded record together with the object version it was read at.
#[derive(Debug, Clone)]
pub struct Versioned<T> {
    pub value: T,
    pub version: UpdateVersion,
}

/// Result of a conditional write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write landed; the record now has this version.
    Written(UpdateVersion),
    /// Someone else wrote (or created) the record since it was read.
    Conflict,
}

/// Read and decode a JSON record; `None` when the object does not exist.
pub async fn read_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    path: &Path,
) -> ConsumerResult<Option<Versioned<T>>> {
    match store.get(path).await {
        Ok(result) => {
            let version = UpdateVersion {
                e_tag: result.meta.e_tag.clone(),
                version: result.meta.version.clone(),
            };
            let bytes = result.bytes().await?;
            let value = serde_json::from_slice(&bytes)?;
            Ok(Some(Versioned { value, version }))
        }
        Err(object_store::Error::NotFound { .. }) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON record only if it is still at `expected`.
///
/// `expected = None` means "only if the object does not exist yet".
pub async fn write_json_if<T: Serialize>(
    store: &dyn ObjectStore,
    path: &Path,
    value: &T,
    expected: Option<&UpdateVersion>,
) -> ConsumerResult<CasOutcome> {
    let payload = PutPayload::from(serde_json::to_vec(value)?);
    let mode = match expected {
        None => PutMode::Create,
        Some(version) => PutMode::Update(version.clone()),
    };

    match store.put_opts(path, payload, PutOptions::from(mode)).await {
        Ok(result) => Ok(CasOutcome::Written(UpdateVersion::from(result))),
        Err(object_store::Error::Precondition { .. })
        | Err(object_store::Error::AlreadyExists { .. }) => Ok(CasOutcome::Conflict),
        Err(e) => Err(e.into()),
    }
}

/// Write a JSON record unconditionally.
pub async fn overwrite_json<T: Serialize>(
    store: &dyn ObjectStore,
    path: &Path,
    value: &T,
) -> ConsumerResult<()> {
    let payload = PutPayload::from(serde_json::to_vec(value)?);
    store.put(path, payload).await?;
    Ok(())
}

/// Delete a record; a missing object is not an error.
pub async fn delete_record(store: &dyn ObjectStore, path: &Path) -> ConsumerResult<()> {
    match store.delete(path).await {
        Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Read every record under `dir`.
///
/// Objects deleted between the listing and the read are skipped.
pub async fn list_json<T: DeserializeOwned>(
    store: &dyn ObjectStore,
    dir: &Path,
) -> ConsumerResult<Vec<Versioned<T>>> {
    let metas: Vec<_> = store.list(Some(dir)).try_collect().await?;

    let mut records = Vec::with_capacity(metas.len());
    for meta in metas {
        if !StoreLayout::is_record(&meta.location) {
            continue;
        }
        if let Some(record) = read_json(store, &meta.location).await? {
            records.push(record);
        }
    }
    Ok(records)
}
