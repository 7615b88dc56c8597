//! Retry wrapper
//!
//! Repeats calls that fail transiently, sleeping between attempts, until the
//! policy runs out or the owning peer dies.

use crate::error::CallResult;
use crate::peer::{
    ClientPeer, Lifecycle, Peer, ServerHandle, ServerPeer, SwitchboardApi,
};
use crate::work::{Payload, WorkItem};
use async_trait::async_trait;
use log::debug;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// How many times to re-issue a failed call, and how long to sleep in between
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// `None` retries indefinitely
    pub retries: Option<u32>,
    pub sleep: Duration,
}

impl RetryPolicy {
    pub fn new(retries: Option<u32>, sleep: Duration) -> Self {
        Self { retries, sleep }
    }

    pub fn indefinitely(sleep: Duration) -> Self {
        Self {
            retries: None,
            sleep,
        }
    }

    /// Build from a signed count where any negative value means indefinitely
    pub fn from_count(retries: i64, sleep: Duration) -> Self {
        Self {
            retries: u32::try_from(retries).ok(),
            sleep,
        }
    }
}

/// Re-issues calls on `T` that fail with a transient error
///
/// When tied to a local [`Lifecycle`], retrying stops as soon as the owning
/// peer starts shutting down.
pub struct Retry<T> {
    inner: T,
    policy: RetryPolicy,
    owner: Option<Arc<Lifecycle>>,
}

impl<T: Clone + Send + Sync> Retry<T> {
    pub fn new(inner: T, policy: RetryPolicy) -> Self {
        Self {
            inner,
            policy,
            owner: None,
        }
    }

    /// Stop retrying once `owner` starts shutting down
    pub fn owned_by(mut self, owner: Arc<Lifecycle>) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn inner(&self) -> &T {
        &self.inner
    }

    fn keep_trying(&self) -> bool {
        self.owner.as_ref().map_or(true, |o| !o.time_to_die())
    }

    /// Run `call` against the wrapped handle until it succeeds, fails
    /// permanently, or the policy runs out
    pub async fn call<R, F, Fut>(&self, name: &str, mut call: F) -> CallResult<R>
    where
        F: FnMut(T) -> Fut + Send,
        Fut: Future<Output = CallResult<R>> + Send,
        R: Send,
    {
        let mut failures: u32 = 0;
        loop {
            let err = match call(self.inner.clone()).await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) => e,
            };

            failures += 1;
            let exhausted = self.policy.retries.map_or(false, |max| failures > max);
            if exhausted || !self.keep_trying() {
                return Err(err);
            }

            debug!(
                "{} failed ({}); retry {} in {:?}",
                name, err, failures, self.policy.sleep
            );
            tokio::time::sleep(self.policy.sleep).await;
        }
    }
}

#[async_trait]
impl Peer for Retry<ServerHandle> {
    async fn id(&self) -> CallResult<u32> {
        self.call("id", |s| async move { s.id().await }).await
    }

    async fn host(&self) -> CallResult<String> {
        self.call("host", |s| async move { s.host().await }).await
    }

    async fn alive(&self) -> CallResult<bool> {
        self.call("alive", |s| async move { s.alive().await }).await
    }

    async fn die(&self, immediate: bool) -> CallResult<()> {
        self.call("die", |s| async move { s.die(immediate).await }).await
    }

    fn endpoint(&self) -> Option<String> {
        self.inner.endpoint()
    }
}

#[async_trait]
impl ServerPeer for Retry<ServerHandle> {
    async fn max_clients(&self) -> CallResult<i32> {
        self.call("max_clients", |s| async move { s.max_clients().await })
            .await
    }

    async fn accept_only_by_request(&self) -> CallResult<bool> {
        self.call("accept_only_by_request", |s| async move {
            s.accept_only_by_request().await
        })
        .await
    }

    async fn serve(&self, request: Payload) -> CallResult<Payload> {
        self.call("serve", |s| {
            let request = request.clone();
            async move { s.serve(request).await }
        })
        .await
    }
}

#[async_trait]
impl SwitchboardApi for Retry<Arc<dyn SwitchboardApi>> {
    async fn register_client(&self, client: Arc<dyn ClientPeer>) -> CallResult<u32> {
        self.call("register_client", |sb| {
            let client = client.clone();
            async move { sb.register_client(client).await }
        })
        .await
    }

    async fn register_server(&self, server: ServerHandle) -> CallResult<u32> {
        self.call("register_server", |sb| {
            let server = server.clone();
            async move { sb.register_server(server).await }
        })
        .await
    }

    async fn get_server(&self, client_id: u32) -> CallResult<Option<ServerHandle>> {
        self.call("get_server", |sb| async move { sb.get_server(client_id).await })
            .await
    }

    async fn get_server_by_id(
        &self,
        client_id: u32,
        server_id: u32,
    ) -> CallResult<Option<ServerHandle>> {
        self.call("get_server_by_id", |sb| async move {
            sb.get_server_by_id(client_id, server_id).await
        })
        .await
    }

    async fn next_object(&self, client_id: u32) -> CallResult<Option<WorkItem>> {
        self.call("next_object", |sb| async move { sb.next_object(client_id).await })
            .await
    }

    async fn put_object(
        &self,
        client_id: u32,
        item: WorkItem,
        elapsed_millis: u64,
    ) -> CallResult<()> {
        self.call("put_object", |sb| {
            let item = item.clone();
            async move { sb.put_object(client_id, item, elapsed_millis).await }
        })
        .await
    }

    async fn get_setting(&self, name: &str) -> CallResult<Option<String>> {
        self.call("get_setting", |sb| {
            let name = name.to_string();
            async move { sb.get_setting(&name).await }
        })
        .await
    }

    async fn get_settings(&self) -> CallResult<BTreeMap<String, String>> {
        self.call("get_settings", |sb| async move { sb.get_settings().await })
            .await
    }

    async fn keep_alive_interval(&self) -> CallResult<Duration> {
        self.call("keep_alive_interval", |sb| async move {
            sb.keep_alive_interval().await
        })
        .await
    }

    async fn keep_alive_max_retries(&self) -> CallResult<u32> {
        self.call("keep_alive_max_retries", |sb| async move {
            sb.keep_alive_max_retries().await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SwitchboardError;
    use crate::peer::mock::MockServer;
    use serde_json::json;

    fn quick(retries: Option<u32>) -> RetryPolicy {
        RetryPolicy::new(retries, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let server = Arc::new(MockServer::new(1));
        server.fail_next_calls(2);
        let retry = Retry::new(server.clone() as ServerHandle, quick(Some(2)));

        let response = retry.serve(json!("ping")).await.unwrap();
        assert_eq!(response, json!("ping"));
        assert_eq!(server.serve_calls(), 3);
    }

    #[tokio::test]
    async fn test_policy_runs_out() {
        let server = Arc::new(MockServer::new(1));
        server.fail_next_calls(5);
        let retry = Retry::new(server.clone() as ServerHandle, quick(Some(1)));

        let err = retry.serve(json!("ping")).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(server.serve_calls(), 2);
    }

    #[tokio::test]
    async fn test_permanent_errors_pass_through() {
        let retry = Retry::new((), quick(None));
        let mut calls = 0;
        let result: CallResult<()> = retry
            .call("probe", |_| {
                calls += 1;
                async { Err(SwitchboardError::UnrecognizedClient(4)) }
            })
            .await;

        assert!(matches!(result, Err(SwitchboardError::UnrecognizedClient(4))));
        assert_eq!(calls, 1);
    }

    #[tokio::test]
    async fn test_owner_shutdown_stops_indefinite_retry() {
        let owner = Arc::new(Lifecycle::new());
        let retry = Retry::new((), quick(None)).owned_by(owner.clone());
        let mut calls = 0;
        let result: CallResult<()> = retry
            .call("probe", |_| {
                calls += 1;
                if calls == 3 {
                    owner.die(true);
                }
                async { Err(SwitchboardError::transport("refused")) }
            })
            .await;

        assert!(result.unwrap_err().is_transient());
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_negative_count_means_indefinitely() {
        assert_eq!(RetryPolicy::from_count(-1, Duration::ZERO).retries, None);
        assert_eq!(RetryPolicy::from_count(3, Duration::ZERO).retries, Some(3));
    }
}
