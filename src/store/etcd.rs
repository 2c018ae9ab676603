//! etcd backend for [`KvStore`], over the gRPC API via `etcd-client`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{
    Client, Compare, CompareOp, ConnectOptions, EventType, GetOptions, PutOptions, SortOrder,
    SortTarget, Txn, TxnOp, WatchFilterType, WatchOptions, WatchStream, Watcher,
};
use secrecy::ExposeSecret;
use tracing::{debug, info};

use super::{CreateWatch, Entry, KvStore, LeaseId, Range, WatchBatch, WatchEvent};
use crate::config::Config;
use crate::error::{Error, Result};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// etcd connection shared by every queue operation.
pub struct EtcdStore {
    client: Client,
    endpoints: Vec<String>,
    closed: AtomicBool,
}

impl EtcdStore {
    /// Connect to the cluster described by `config`.
    pub async fn connect(config: &Config) -> Result<Self> {
        let mut options = ConnectOptions::new().with_connect_timeout(CONNECT_TIMEOUT);
        if let (Some(user), Some(password)) = (&config.etcd_user, &config.etcd_password) {
            options = options.with_user(user.clone(), password.expose_secret().to_string());
        }
        Self::connect_with(config.etcd_endpoints.clone(), Some(options)).await
    }

    /// Connect to `endpoints` with explicit client options.
    pub async fn connect_with(
        endpoints: Vec<String>,
        options: Option<ConnectOptions>,
    ) -> Result<Self> {
        info!(?endpoints, "connecting to etcd");
        let client = Client::connect(&endpoints, options).await?;
        Ok(Self::from_client(client, endpoints))
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client, endpoints: Vec<String>) -> Self {
        Self {
            client,
            endpoints,
            closed: AtomicBool::new(false),
        }
    }

    /// A handle for one call. `etcd_client::Client` methods take `&mut self`
    /// but the client itself is a cheap clone over shared channels.
    fn handle(&self) -> Result<Client> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Stopped);
        }
        Ok(self.client.clone())
    }
}

fn entry_from(kv: &etcd_client::KeyValue) -> Entry {
    Entry {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
    }
}

#[async_trait]
impl KvStore for EtcdStore {
    async fn linearized_get(&self, key: &str) -> Result<Option<Entry>> {
        let resp = self.handle()?.get(key, None).await?;
        Ok(resp.kvs().first().map(entry_from))
    }

    async fn first_in_range(&self, prefix: &str) -> Result<Range> {
        let options = GetOptions::new()
            .with_prefix()
            .with_sort(SortTarget::Key, SortOrder::Ascend)
            .with_limit(1);
        let resp = self.handle()?.get(prefix, Some(options)).await?;
        Ok(Range {
            entries: resp.kvs().iter().map(entry_from).collect(),
        })
    }

    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId> {
        let resp = self.handle()?.lease_grant(ttl_secs, None).await?;
        debug!(lease = resp.id(), ttl_secs = resp.ttl(), "lease granted");
        Ok(resp.id())
    }

    async fn put(&self, key: &str, value: &[u8], lease: Option<LeaseId>) -> Result<()> {
        let options = lease.map(|id| PutOptions::new().with_lease(id));
        self.handle()?.put(key, value.to_vec(), options).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<u64> {
        let resp = self.handle()?.delete(key, None).await?;
        Ok(u64::try_from(resp.deleted()).unwrap_or(0))
    }

    async fn delete_if_created(&self, key: &str, create_revision: i64) -> Result<bool> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(
                key,
                CompareOp::Equal,
                create_revision,
            )])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = self.handle()?.txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn watch_creates(&self, prefix: &str) -> Result<Box<dyn CreateWatch>> {
        // etcd-client returns from watch() only after the server's
        // "created" response, so the subscription is live here.
        let (watcher, stream) = self
            .handle()?
            .watch(
                prefix,
                Some(
                    WatchOptions::new()
                        .with_prefix()
                        .with_filters([WatchFilterType::NoDelete]),
                ),
            )
            .await?;
        debug!(prefix, watch_id = watcher.watch_id(), "watch established");
        Ok(Box::new(EtcdCreateWatch {
            _watcher: watcher,
            stream,
        }))
    }

    fn endpoints(&self) -> Vec<String> {
        self.endpoints.clone()
    }

    async fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!(endpoints = ?self.endpoints, "etcd connection closed");
        }
    }

    fn etcd_client(&self) -> Option<Client> {
        self.handle().ok()
    }
}

struct EtcdCreateWatch {
    // Dropping the watcher closes the request side of the watch.
    _watcher: Watcher,
    stream: WatchStream,
}

#[async_trait]
impl CreateWatch for EtcdCreateWatch {
    async fn next_batch(&mut self) -> Result<Option<WatchBatch>> {
        loop {
            let Some(resp) = self.stream.message().await? else {
                return Ok(None);
            };

            let events: Vec<WatchEvent> = resp
                .events()
                .iter()
                .filter_map(|event| {
                    let kv = event.kv()?;
                    match event.event_type() {
                        // version 1 marks the first write of a key
                        EventType::Put if kv.version() == 1 => {
                            Some(WatchEvent::Created(entry_from(kv)))
                        }
                        EventType::Put => None,
                        // Filtered server side; only reaches us if the
                        // server ignored the filter.
                        EventType::Delete => Some(WatchEvent::Deleted(
                            String::from_utf8_lossy(kv.key()).into_owned(),
                        )),
                    }
                })
                .collect();

            let error = (!resp.cancel_reason().is_empty())
                .then(|| resp.cancel_reason().to_string());

            // Progress notifications and pure modifications carry nothing
            // for a creation watcher.
            if events.is_empty() && !resp.canceled() && error.is_none() {
                continue;
            }

            return Ok(Some(WatchBatch {
                events,
                canceled: resp.canceled(),
                error,
            }));
        }
    }
}
