//! In-memory provider.
//!
//! Keeps remote objects in a map and records every call in a shared journal.
//! Serves as the stand-in provider for tests, where failure injection and
//! artificial latency exercise the executor and the engine.

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use crate::error::ProviderError;

use super::traits::{
    Attributes, OperationContext, Provider, ProviderResult, RemoteObject, ResourceSchema,
};

/// Provider operations, as recorded in the journal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Operation {
    /// `create`
    Create,
    /// `read`
    Read,
    /// `update`
    Update,
    /// `delete`
    Delete,
    /// `find`
    Find,
}

/// One recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JournalEntry {
    /// The operation performed.
    pub operation: Operation,
    /// Address from the operation context.
    pub address: String,
    /// Object id involved, when known.
    pub id: Option<String>,
    /// Whether the call returned successfully.
    pub succeeded: bool,
}

/// Ordered log of calls, shareable across providers.
#[derive(Debug, Default)]
pub struct Journal {
    /// Recorded entries in call-completion order.
    entries: Mutex<Vec<JournalEntry>>,
}

impl Journal {
    /// Creates an empty journal.
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn record(&self, entry: JournalEntry) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }

    /// Returns a copy of every entry.
    #[must_use]
    pub fn entries(&self) -> Vec<JournalEntry> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Returns the successful mutating calls as `(operation, address)` pairs.
    #[must_use]
    pub fn mutations(&self) -> Vec<(Operation, String)> {
        self.entries()
            .into_iter()
            .filter(|e| {
                e.succeeded
                    && matches!(
                        e.operation,
                        Operation::Create | Operation::Update | Operation::Delete
                    )
            })
            .map(|e| (e.operation, e.address))
            .collect()
    }

    /// Returns the position of the first successful call matching the pair.
    #[must_use]
    pub fn position(&self, operation: Operation, address: &str) -> Option<usize> {
        self.mutations()
            .iter()
            .position(|(op, addr)| *op == operation && addr == address)
    }
}

/// An error the provider returns instead of performing a call.
#[derive(Debug, Clone)]
struct InjectedFailure {
    operation: Operation,
    address: Option<String>,
    error: ProviderError,
    remaining: usize,
    after_effect: bool,
}

#[derive(Debug, Default)]
struct MemoryInner {
    objects: BTreeMap<String, Attributes>,
    tokens: BTreeMap<String, String>,
    next_id: u64,
    failures: Vec<InjectedFailure>,
}

/// Provider keeping objects in memory.
#[derive(Debug)]
pub struct MemoryProvider {
    /// Schema of the served type.
    schema: ResourceSchema,
    /// Objects, tokens, and pending failures.
    inner: Mutex<MemoryInner>,
    /// Shared call log.
    journal: Arc<Journal>,
    /// Artificial latency per call.
    latency: Duration,
    /// Calls currently running.
    in_flight: AtomicUsize,
    /// Highest observed `in_flight`.
    peak_in_flight: AtomicUsize,
}

impl MemoryProvider {
    /// Creates a provider with its own journal.
    #[must_use]
    pub fn new(schema: ResourceSchema) -> Self {
        Self::with_journal(schema, Journal::new())
    }

    /// Creates a provider recording into a shared journal.
    #[must_use]
    pub fn with_journal(schema: ResourceSchema, journal: Arc<Journal>) -> Self {
        Self {
            schema,
            inner: Mutex::new(MemoryInner::default()),
            journal,
            latency: Duration::ZERO,
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
        }
    }

    /// Adds artificial latency to every call.
    #[must_use]
    pub const fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Fails the next `times` calls of `operation`, optionally only for one address.
    pub fn fail(
        &self,
        operation: Operation,
        address: Option<&str>,
        error: ProviderError,
        times: usize,
    ) {
        self.push_failure(operation, address, error, times, false);
    }

    /// Like [`fail`](Self::fail), but the call takes effect before the error is returned.
    pub fn fail_after_effect(
        &self,
        operation: Operation,
        address: Option<&str>,
        error: ProviderError,
        times: usize,
    ) {
        self.push_failure(operation, address, error, times, true);
    }

    fn push_failure(
        &self,
        operation: Operation,
        address: Option<&str>,
        error: ProviderError,
        remaining: usize,
        after_effect: bool,
    ) {
        self.lock().failures.push(InjectedFailure {
            operation,
            address: address.map(ToString::to_string),
            error,
            remaining,
            after_effect,
        });
    }

    /// Returns the journal this provider records into.
    #[must_use]
    pub fn journal(&self) -> Arc<Journal> {
        Arc::clone(&self.journal)
    }

    /// Returns the stored attributes of an object.
    #[must_use]
    pub fn object(&self, id: &str) -> Option<Attributes> {
        self.lock().objects.get(id).cloned()
    }

    /// Returns the ids of all live objects.
    #[must_use]
    pub fn object_ids(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    /// Replaces an object's attributes out of band, simulating drift.
    pub fn tamper(&self, id: &str, attributes: Attributes) {
        self.lock().objects.insert(id.to_string(), attributes);
    }

    /// Removes an object out of band.
    pub fn remove(&self, id: &str) {
        self.lock().objects.remove(id);
    }

    /// Returns the highest number of concurrent calls observed.
    #[must_use]
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight.load(Ordering::SeqCst)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Takes a matching injected failure, if any.
    fn take_failure(&self, operation: Operation, address: &str) -> Option<(ProviderError, bool)> {
        let mut inner = self.lock();
        let index = inner.failures.iter().position(|f| {
            f.operation == operation
                && f.remaining > 0
                && f.address.as_deref().is_none_or(|a| a == address)
        })?;
        let failure = &mut inner.failures[index];
        failure.remaining -= 1;
        Some((failure.error.clone(), failure.after_effect))
    }

    async fn enter(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
    }

    fn leave<T>(
        &self,
        operation: Operation,
        ctx: &OperationContext,
        id: Option<&str>,
        result: ProviderResult<T>,
    ) -> ProviderResult<T> {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.journal.record(JournalEntry {
            operation,
            address: ctx.address.clone(),
            id: id.map(ToString::to_string),
            succeeded: result.is_ok(),
        });
        result
    }

    /// Fills computed attributes the caller did not supply.
    fn with_computed(&self, id: &str, attributes: &Attributes) -> Attributes {
        let mut out = attributes.clone();
        for name in &self.schema.computed_attributes {
            out.entry(name.clone())
                .or_insert_with(|| serde_json::Value::String(format!("{name}-{id}")));
        }
        out
    }

    fn do_create(&self, ctx: &OperationContext, attributes: &Attributes) -> RemoteObject {
        let mut inner = self.lock();
        if let Some(id) = inner.tokens.get(&ctx.token).cloned()
            && let Some(existing) = inner.objects.get(&id)
        {
            return RemoteObject {
                id,
                attributes: existing.clone(),
            };
        }
        inner.next_id += 1;
        let id = format!("{}-{}", self.schema.resource_type, inner.next_id);
        let stored = self.with_computed(&id, attributes);
        inner.objects.insert(id.clone(), stored.clone());
        inner.tokens.insert(ctx.token.clone(), id.clone());
        RemoteObject {
            id,
            attributes: stored,
        }
    }

    fn do_update(&self, id: &str, attributes: &Attributes) -> ProviderResult<Attributes> {
        let mut inner = self.lock();
        let Some(existing) = inner.objects.get(id) else {
            return Err(ProviderError::NotFound { id: id.to_string() });
        };
        let mut merged = existing.clone();
        merged.extend(attributes.clone());
        inner.objects.insert(id.to_string(), merged.clone());
        Ok(merged)
    }

    fn do_delete(&self, id: &str) -> ProviderResult<()> {
        let mut inner = self.lock();
        if inner.objects.remove(id).is_none() {
            return Err(ProviderError::NotFound { id: id.to_string() });
        }
        inner.tokens.retain(|_, v| v != id);
        Ok(())
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn schema(&self) -> &ResourceSchema {
        &self.schema
    }

    async fn create(
        &self,
        ctx: &OperationContext,
        attributes: &Attributes,
    ) -> ProviderResult<RemoteObject> {
        self.enter().await;
        let result = match self.take_failure(Operation::Create, &ctx.address) {
            Some((error, true)) => {
                self.do_create(ctx, attributes);
                Err(error)
            }
            Some((error, false)) => Err(error),
            None => Ok(self.do_create(ctx, attributes)),
        };
        let id = result.as_ref().ok().map(|o| o.id.clone());
        self.leave(Operation::Create, ctx, id.as_deref(), result)
    }

    async fn read(&self, ctx: &OperationContext, id: &str) -> ProviderResult<Option<Attributes>> {
        self.enter().await;
        let result = match self.take_failure(Operation::Read, &ctx.address) {
            Some((error, _)) => Err(error),
            None => Ok(self.object(id)),
        };
        self.leave(Operation::Read, ctx, Some(id), result)
    }

    async fn update(
        &self,
        ctx: &OperationContext,
        id: &str,
        attributes: &Attributes,
    ) -> ProviderResult<Attributes> {
        self.enter().await;
        let result = match self.take_failure(Operation::Update, &ctx.address) {
            Some((error, true)) => self.do_update(id, attributes).and(Err(error)),
            Some((error, false)) => Err(error),
            None => self.do_update(id, attributes),
        };
        self.leave(Operation::Update, ctx, Some(id), result)
    }

    async fn delete(&self, ctx: &OperationContext, id: &str) -> ProviderResult<()> {
        self.enter().await;
        let result = match self.take_failure(Operation::Delete, &ctx.address) {
            Some((error, true)) => self.do_delete(id).and(Err(error)),
            Some((error, false)) => Err(error),
            None => self.do_delete(id),
        };
        self.leave(Operation::Delete, ctx, Some(id), result)
    }

    async fn find(&self, ctx: &OperationContext) -> ProviderResult<Option<RemoteObject>> {
        self.enter().await;
        let result = match self.take_failure(Operation::Find, &ctx.address) {
            Some((error, _)) => Err(error),
            None => {
                let inner = self.lock();
                Ok(inner.tokens.get(&ctx.token).and_then(|id| {
                    inner.objects.get(id).map(|attributes| RemoteObject {
                        id: id.clone(),
                        attributes: attributes.clone(),
                    })
                }))
            }
        };
        let id = result
            .as_ref()
            .ok()
            .and_then(|o| o.as_ref().map(|o| o.id.clone()));
        self.leave(Operation::Find, ctx, id.as_deref(), result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn attrs(cidr: &str) -> Attributes {
        Attributes::from([(String::from("cidr_block"), json!(cidr))])
    }

    fn vpc_provider() -> MemoryProvider {
        MemoryProvider::new(ResourceSchema::new("aws_vpc").with_computed(["arn"]))
    }

    #[tokio::test]
    async fn test_create_read_update_delete() {
        let provider = vpc_provider();
        let ctx = OperationContext::new("aws_vpc.main");

        let created = provider.create(&ctx, &attrs("10.0.0.0/16")).await.unwrap();
        assert_eq!(created.id, "aws_vpc-1");
        assert_eq!(created.attributes["arn"], json!("arn-aws_vpc-1"));

        let read = provider.read(&ctx, &created.id).await.unwrap().unwrap();
        assert_eq!(read["cidr_block"], json!("10.0.0.0/16"));

        let updated = provider
            .update(&ctx, &created.id, &attrs("10.1.0.0/16"))
            .await
            .unwrap();
        assert_eq!(updated["cidr_block"], json!("10.1.0.0/16"));
        assert_eq!(updated["arn"], json!("arn-aws_vpc-1"));

        provider.delete(&ctx, &created.id).await.unwrap();
        assert!(provider.read(&ctx, &created.id).await.unwrap().is_none());
        assert_eq!(
            provider.delete(&ctx, &created.id).await,
            Err(ProviderError::NotFound {
                id: created.id.clone()
            })
        );
    }

    #[tokio::test]
    async fn test_create_is_idempotent_per_token() {
        let provider = vpc_provider();
        let ctx = OperationContext::new("aws_vpc.main");

        let first = provider.create(&ctx, &attrs("10.0.0.0/16")).await.unwrap();
        let second = provider.create(&ctx, &attrs("10.0.0.0/16")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(provider.object_ids().len(), 1);
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed() {
        let provider = vpc_provider();
        provider.fail(
            Operation::Create,
            Some("aws_vpc.main"),
            ProviderError::unavailable("boom"),
            1,
        );

        let ctx = OperationContext::new("aws_vpc.main");
        assert!(provider.create(&ctx, &attrs("10.0.0.0/16")).await.is_err());
        assert!(provider.create(&ctx, &attrs("10.0.0.0/16")).await.is_ok());

        let other = OperationContext::new("aws_vpc.other");
        provider.fail(
            Operation::Create,
            Some("aws_vpc.main"),
            ProviderError::unavailable("boom"),
            1,
        );
        assert!(provider.create(&other, &attrs("10.9.0.0/16")).await.is_ok());
    }

    #[tokio::test]
    async fn test_find_after_ambiguous_create() {
        let provider = vpc_provider();
        provider.fail_after_effect(
            Operation::Create,
            None,
            ProviderError::Timeout {
                message: String::from("gateway timeout"),
            },
            1,
        );

        let ctx = OperationContext::new("aws_vpc.main");
        assert!(provider.create(&ctx, &attrs("10.0.0.0/16")).await.is_err());

        let found = provider.find(&ctx).await.unwrap().unwrap();
        assert_eq!(found.attributes["cidr_block"], json!("10.0.0.0/16"));

        let stranger = OperationContext::new("aws_vpc.main");
        assert!(provider.find(&stranger).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_shared_journal_order() {
        let journal = Journal::new();
        let vpcs = MemoryProvider::with_journal(ResourceSchema::new("aws_vpc"), journal.clone());
        let subnets =
            MemoryProvider::with_journal(ResourceSchema::new("aws_subnet"), journal.clone());

        let vpc_ctx = OperationContext::new("aws_vpc.main");
        let subnet_ctx = OperationContext::new("aws_subnet.a");
        vpcs.create(&vpc_ctx, &attrs("10.0.0.0/16")).await.unwrap();
        subnets.create(&subnet_ctx, &attrs("10.0.1.0/24")).await.unwrap();

        assert_eq!(journal.position(Operation::Create, "aws_vpc.main"), Some(0));
        assert_eq!(journal.position(Operation::Create, "aws_subnet.a"), Some(1));
        assert_eq!(journal.mutations().len(), 2);
    }
}
