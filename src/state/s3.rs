//! S3-based state storage backend.
//!
//! This module provides remote state storage using AWS S3 (or compatible
//! services) for teams and CI runners sharing one state.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::{HalldyllError, Result, StateError};

use super::lock::{LOCK_EXPIRY_SECS, LockInfo, generate_holder_id};
use super::store::StateStore;
use super::types::StateSnapshot;

/// State file key suffix.
const STATE_KEY: &str = "state.json";

/// Lock file key suffix.
const LOCK_KEY: &str = "state.lock";

/// S3-based state store.
#[derive(Debug)]
pub struct S3StateStore {
    /// S3 client.
    client: Client,
    /// Bucket name.
    bucket: String,
    /// Key prefix.
    prefix: String,
    /// Serializes writers inside this process.
    write_guard: Mutex<()>,
}

impl S3StateStore {
    /// Creates a new S3 state store using the default AWS credential chain.
    ///
    /// # Errors
    ///
    /// Returns an error if the S3 client cannot be initialized.
    pub async fn new(bucket: &str, prefix: Option<&str>, region: Option<&str>) -> Result<Self> {
        let mut loader = aws_config::defaults(aws_config::BehaviorVersion::latest());
        if let Some(region_str) = region {
            loader = loader.region(aws_config::Region::new(region_str.to_string()));
        }
        let config = loader.load().await;

        Ok(Self::with_client(Client::new(&config), bucket, prefix))
    }

    /// Creates a new S3 state store with an existing client.
    #[must_use]
    pub fn with_client(client: Client, bucket: &str, prefix: Option<&str>) -> Self {
        Self {
            client,
            bucket: bucket.to_string(),
            prefix: normalize_prefix(prefix),
            write_guard: Mutex::new(()),
        }
    }

    /// Gets the full S3 key for a file.
    fn key(&self, file: &str) -> String {
        format!("{}{file}", self.prefix)
    }

    /// Gets an object from S3.
    async fn get_object(&self, key: &str) -> Result<Option<String>> {
        Ok(self.get_object_tagged(key).await?.map(|(content, _)| content))
    }

    /// Gets an object together with its entity tag.
    async fn get_object_tagged(&self, key: &str) -> Result<Option<(String, Option<String>)>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(response) => {
                let etag = response.e_tag().map(str::to_string);
                let bytes = response.body.collect().await.map_err(|e| {
                    HalldyllError::State(StateError::s3(format!("Failed to read S3 object: {e}")))
                })?;

                let content = String::from_utf8(bytes.to_vec()).map_err(|e| {
                    HalldyllError::State(StateError::Corrupted {
                        message: format!("Invalid UTF-8 in S3 object: {e}"),
                    })
                })?;

                Ok(Some((content, etag)))
            }
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(HalldyllError::State(StateError::s3(format!(
                        "S3 get error: {service_err}"
                    ))))
                }
            }
        }
    }

    /// Puts an object to S3.
    async fn put_object(&self, key: &str, content: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await
            .map_err(|e| HalldyllError::State(StateError::s3(format!("S3 put error: {e}"))))?;

        Ok(())
    }

    /// Puts an object only if the key does not exist yet.
    ///
    /// Returns `false` when another writer got there first.
    async fn put_object_if_absent(&self, key: &str, content: &str) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_none_match("*")
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                // 412 Precondition Failed, or 409 on a concurrent conditional write
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(409 | 412)) {
                    Ok(false)
                } else {
                    Err(HalldyllError::State(StateError::s3(format!(
                        "S3 conditional put error: {sdk_err}"
                    ))))
                }
            }
        }
    }

    /// Overwrites an object only if it still carries `etag`.
    ///
    /// Returns `false` when the object changed in between.
    async fn put_object_if_match(&self, key: &str, content: &str, etag: &str) -> Result<bool> {
        let result = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .if_match(etag)
            .body(content.as_bytes().to_vec().into())
            .content_type("application/json")
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let status = sdk_err.raw_response().map(|r| r.status().as_u16());
                if matches!(status, Some(404 | 409 | 412)) {
                    Ok(false)
                } else {
                    Err(HalldyllError::State(StateError::s3(format!(
                        "S3 conditional put error: {sdk_err}"
                    ))))
                }
            }
        }
    }

    /// Deletes an object from S3.
    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| HalldyllError::State(StateError::s3(format!("S3 delete error: {e}"))))?;

        Ok(())
    }

    /// Checks if an object exists in S3.
    async fn object_exists(&self, key: &str) -> Result<bool> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(_) => Ok(true),
            Err(sdk_err) => {
                let service_err = sdk_err.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(HalldyllError::State(StateError::s3(format!(
                        "S3 head error: {service_err}"
                    ))))
                }
            }
        }
    }

    async fn read_lock(&self) -> Result<Option<LockInfo>> {
        Ok(self.read_lock_tagged().await?.map(|(lock, _)| lock))
    }

    async fn read_lock_tagged(&self) -> Result<Option<(LockInfo, Option<String>)>> {
        let Some((content, etag)) = self.get_object_tagged(&self.key(LOCK_KEY)).await? else {
            return Ok(None);
        };
        let lock_info = serde_json::from_str(&content).map_err(|e| {
            HalldyllError::State(StateError::Corrupted {
                message: format!("Failed to parse lock: {e}"),
            })
        })?;
        Ok(Some((lock_info, etag)))
    }
}

/// Normalizes a key prefix to either empty or `segment/.../`.
fn normalize_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(|p| {
            let p = p.trim_matches('/');
            if p.is_empty() {
                String::new()
            } else {
                format!("{p}/")
            }
        })
        .unwrap_or_default()
}

#[async_trait]
impl StateStore for S3StateStore {
    async fn read_snapshot(&self) -> Result<Option<StateSnapshot>> {
        let key = self.key(STATE_KEY);
        debug!("Loading state from s3://{}/{key}", self.bucket);

        let Some(json) = self.get_object(&key).await? else {
            debug!("No state found in S3");
            return Ok(None);
        };

        let state: StateSnapshot = serde_json::from_str(&json).map_err(|e| {
            HalldyllError::State(StateError::Corrupted {
                message: format!("Failed to parse state: {e}"),
            })
        })?;

        Ok(Some(state))
    }

    async fn write_snapshot(&self, snapshot: &StateSnapshot) -> Result<()> {
        let key = self.key(STATE_KEY);
        debug!(
            "Saving state to s3://{}/{key} (serial {})",
            self.bucket, snapshot.serial
        );

        let content = serde_json::to_string_pretty(snapshot).map_err(|e| {
            HalldyllError::State(StateError::serialization(format!(
                "Failed to serialize state: {e}"
            )))
        })?;

        self.put_object(&key, &content).await
    }

    fn write_guard(&self) -> &Mutex<()> {
        &self.write_guard
    }

    async fn exists(&self) -> Result<bool> {
        let key = self.key(STATE_KEY);
        self.object_exists(&key).await
    }

    async fn acquire_lock(&self, holder: &str) -> Result<LockInfo> {
        let key = self.key(LOCK_KEY);

        let holder_id = if holder.is_empty() {
            generate_holder_id()
        } else {
            holder.to_string()
        };

        // One retry: the first attempt may find an expired lock to take over
        for _ in 0..2 {
            let lock_info = LockInfo::new(&holder_id);
            let content = serde_json::to_string_pretty(&lock_info).map_err(|e| {
                HalldyllError::State(StateError::serialization(format!(
                    "Failed to serialize lock: {e}"
                )))
            })?;

            if self.put_object_if_absent(&key, &content).await? {
                info!(
                    "Acquired state lock: {} (expires in {}s)",
                    lock_info.lock_id, LOCK_EXPIRY_SECS
                );
                return Ok(lock_info);
            }

            match self.read_lock().await? {
                Some(existing) if !existing.is_expired() => {
                    return Err(HalldyllError::State(StateError::Locked {
                        holder: existing.holder,
                        since: existing.acquired_at.to_rfc3339(),
                    }));
                }
                _ => {
                    debug!("Expired lock found, taking over");
                    self.delete_object(&key).await?;
                }
            }
        }

        Err(HalldyllError::State(StateError::LockFailed {
            message: String::from("Lock was taken over concurrently"),
        }))
    }

    async fn refresh_lock(&self, lock: &LockInfo) -> Result<LockInfo> {
        let lost = || {
            HalldyllError::State(StateError::LockLost {
                lock_id: lock.lock_id.clone(),
            })
        };

        let Some((existing, Some(etag))) = self.read_lock_tagged().await? else {
            return Err(lost());
        };
        if existing.lock_id != lock.lock_id || existing.is_expired() {
            return Err(lost());
        }

        let mut refreshed = existing;
        refreshed.refresh();
        let content = serde_json::to_string_pretty(&refreshed).map_err(|e| {
            HalldyllError::State(StateError::serialization(format!(
                "Failed to serialize lock: {e}"
            )))
        })?;

        // A takeover between the read and the write changes the tag
        if !self
            .put_object_if_match(&self.key(LOCK_KEY), &content, &etag)
            .await?
        {
            return Err(lost());
        }
        debug!("Refreshed state lock {} until {}", refreshed.lock_id, refreshed.expires_at);
        Ok(refreshed)
    }

    async fn release_lock(&self, lock_id: &str) -> Result<()> {
        if let Some(existing) = self.read_lock().await? {
            if existing.lock_id == lock_id {
                self.delete_object(&self.key(LOCK_KEY)).await?;
                info!("Released state lock: {lock_id}");
            } else {
                debug!(
                    "Lock ID mismatch: expected {lock_id}, found {}",
                    existing.lock_id
                );
            }
        }

        Ok(())
    }

    async fn force_unlock(&self) -> Result<Option<LockInfo>> {
        let existing = self.read_lock().await.ok().flatten();
        self.delete_object(&self.key(LOCK_KEY)).await?;
        Ok(existing)
    }

    async fn get_lock_info(&self) -> Result<Option<LockInfo>> {
        self.read_lock().await
    }

    fn backend_type(&self) -> &'static str {
        "s3"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefix_normalization() {
        assert_eq!(normalize_prefix(None), "");
        assert_eq!(normalize_prefix(Some("")), "");
        assert_eq!(normalize_prefix(Some("/")), "");
        assert_eq!(normalize_prefix(Some("network/prod")), "network/prod/");
        assert_eq!(normalize_prefix(Some("/network/prod/")), "network/prod/");
    }
}
