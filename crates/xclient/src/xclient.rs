//! A client over many servers, picking targets through [`Discovery`].

use crate::discovery::{Discovery, SelectMode};
use crate::error::{Error, Result};

use futures::StreamExt;
use futures::stream::FuturesUnordered;
use serde::{Serialize, de::DeserializeOwned};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tern_rpc::{Client, Options};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Issues calls against servers chosen by a [`Discovery`], keeping one
/// client per address.
pub struct XClient<D> {
    discovery: D,
    mode: SelectMode,
    options: Options,
    clients: Mutex<HashMap<String, Arc<Client>>>,
}

impl<D: Discovery> XClient<D> {
    /// Create a client; nothing is dialled until the first call.
    #[must_use]
    pub fn new(discovery: D, mode: SelectMode, options: Options) -> Self {
        Self {
            discovery,
            mode,
            options,
            clients: Mutex::new(HashMap::new()),
        }
    }

    /// The discovery this client selects from.
    pub const fn discovery(&self) -> &D {
        &self.discovery
    }

    /// Cached client for `addr`, dialling a new one if none is usable.
    ///
    /// The cache lock is not held while dialling.
    async fn dial(&self, addr: &str) -> Result<Arc<Client>> {
        let stale = {
            let mut clients = self.clients.lock().await;
            if let Some(client) = clients.get(addr) {
                if client.is_available() {
                    return Ok(Arc::clone(client));
                }
            }
            clients.remove(addr)
        };
        if let Some(client) = stale {
            debug!("rpc xclient: dropping unavailable client for {}", addr);
            let _ = client.close().await;
        }

        let client = Arc::new(tern_rpc::dial(addr, self.options).await?);

        let mut clients = self.clients.lock().await;
        if let Some(existing) = clients.get(addr) {
            if existing.is_available() {
                let existing = Arc::clone(existing);
                drop(clients);
                let _ = client.close().await;
                return Ok(existing);
            }
        }
        clients.insert(addr.to_string(), Arc::clone(&client));
        Ok(client)
    }

    /// Call one server chosen by the select mode.
    ///
    /// # Errors
    ///
    /// Returns an error if no server is available, dialling fails or the call
    /// fails.
    pub async fn call<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.dial(&addr).await?;
        Ok(client.call(service_method, args).await?)
    }

    /// Call one server chosen by the select mode, waiting at most `deadline`.
    ///
    /// # Errors
    ///
    /// As [`XClient::call`], plus a timeout error if the deadline expires.
    pub async fn call_with_timeout<A, R>(
        &self,
        service_method: &str,
        args: &A,
        deadline: Duration,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let addr = self.discovery.get(self.mode).await?;
        let client = self.dial(&addr).await?;
        Ok(client
            .call_with_timeout(service_method, args, deadline)
            .await?)
    }

    async fn call_cancellable<A, R>(
        &self,
        addr: &str,
        service_method: &str,
        args: &A,
        cancel: &CancellationToken,
    ) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let client = tokio::select! {
            client = self.dial(addr) => client?,
            () = cancel.cancelled() => return Err(tern_rpc::Error::Cancelled.into()),
        };
        Ok(client.call_with_cancel(service_method, args, cancel).await?)
    }

    /// Call every server concurrently.
    ///
    /// The first failure cancels the calls still running and is returned.
    /// Without failures the first reply to arrive is returned.
    ///
    /// # Errors
    ///
    /// Returns [`Error::NoAvailableServers`] for an empty server list, or the
    /// first call error.
    pub async fn broadcast<A, R>(&self, service_method: &str, args: &A) -> Result<R>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let servers = self.discovery.get_all().await?;
        if servers.is_empty() {
            return Err(Error::NoAvailableServers);
        }

        let cancel = CancellationToken::new();
        let mut calls: FuturesUnordered<_> = servers
            .iter()
            .map(|addr| self.call_cancellable::<A, R>(addr, service_method, args, &cancel))
            .collect();

        let mut first_error = None;
        let mut first_reply = None;
        while let Some(result) = calls.next().await {
            match result {
                Ok(reply) => {
                    if first_reply.is_none() {
                        first_reply = Some(reply);
                    }
                }
                Err(e) => {
                    if first_error.is_none() {
                        debug!("rpc xclient: broadcast {} failed: {}", service_method, e);
                        cancel.cancel();
                        first_error = Some(e);
                    }
                }
            }
        }

        match (first_error, first_reply) {
            (Some(e), _) => Err(e),
            (None, Some(reply)) => Ok(reply),
            (None, None) => Err(Error::NoAvailableServers),
        }
    }

    /// Close and forget every cached client.
    pub async fn close(&self) {
        let mut clients = self.clients.lock().await;
        for (addr, client) in clients.drain() {
            if let Err(e) = client.close().await {
                debug!("rpc xclient: closing client for {}: {}", addr, e);
            }
        }
    }
}
