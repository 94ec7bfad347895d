//! Kairos kubehub: kube watchers that turn object updates into change events.

#![forbid(unsafe_code)]

use std::collections::HashMap;

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kairos_core::{is_minor_update, ChangeEvent, ChangeKind};
use kube::{
    api::{Api, ListParams},
    config::{KubeConfigOptions, Kubeconfig},
    core::{ApiResource, DynamicObject, GroupVersionKind},
    discovery::{Discovery, Scope},
    runtime::watcher::{self, Event},
    runtime::WatchStreamExt,
    Client, Config,
};
use metrics::counter;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Kinds watched when none are configured.
pub const DEFAULT_KINDS: &[&str] = &[
    "v1/Pod",
    "v1/Node",
    "v1/Namespace",
    "v1/Service",
    "v1/Event",
    "v1/ConfigMap",
    "v1/PersistentVolumeClaim",
    "apps/v1/Deployment",
    "apps/v1/ReplicaSet",
    "apps/v1/StatefulSet",
    "apps/v1/DaemonSet",
    "batch/v1/Job",
];

/// The kubeconfig's current context name.
pub fn current_context() -> Result<String> {
    Kubeconfig::read()
        .context("reading kubeconfig")?
        .current_context
        .ok_or_else(|| anyhow!("kubeconfig has no current context; pass --context"))
}

/// Build a client for `context`, or for the kubeconfig's current context.
/// Returns the client and the resolved context name, which scopes the store root.
pub async fn client_for_context(context: Option<&str>) -> Result<(Client, String)> {
    let name = match context {
        Some(c) => c.to_string(),
        None => current_context()?,
    };
    let opts = KubeConfigOptions { context: Some(name.clone()), ..Default::default() };
    let cfg = Config::from_kubeconfig(&opts).await.with_context(|| format!("loading kube context {name}"))?;
    let client = Client::try_from(cfg).context("building kube client")?;
    Ok((client, name))
}

pub fn parse_gvk_key(key: &str) -> Result<GroupVersionKind> {
    let parts: Vec<_> = key.split('/').collect();
    match parts.as_slice() {
        [version, kind] if !version.is_empty() && !kind.is_empty() => {
            Ok(GroupVersionKind { group: String::new(), version: version.to_string(), kind: kind.to_string() })
        }
        [group, version, kind] if !version.is_empty() && !kind.is_empty() => Ok(GroupVersionKind {
            group: (*group).to_string(),
            version: (*version).to_string(),
            kind: (*kind).to_string(),
        }),
        _ => Err(anyhow!("invalid gvk key: {} (expect v1/Kind or group/v1/Kind)", key)),
    }
}

/// GVK keys for the served custom resources, one per CRD (its storage version when served).
pub fn crd_gvk_keys(crds: &[CustomResourceDefinition]) -> Vec<String> {
    let mut keys = Vec::with_capacity(crds.len());
    for crd in crds {
        let spec = &crd.spec;
        let version = spec
            .versions
            .iter()
            .find(|v| v.served && v.storage)
            .or_else(|| spec.versions.iter().find(|v| v.served));
        match version {
            Some(v) => keys.push(format!("{}/{}/{}", spec.group, v.name, spec.names.kind)),
            None => debug!(group = %spec.group, kind = %spec.names.kind, "crd has no served version"),
        }
    }
    keys.sort();
    keys.dedup();
    keys
}

async fn list_crd_kinds(client: Client) -> Result<Vec<String>> {
    let api: Api<CustomResourceDefinition> = Api::all(client);
    let list = api.list(&ListParams::default()).await.context("listing custom resource definitions")?;
    Ok(crd_gvk_keys(&list.items))
}

fn find_api_resource(discovery: &Discovery, gvk: &GroupVersionKind) -> Result<(ApiResource, bool)> {
    for group in discovery.groups() {
        for (ar, caps) in group.recommended_resources() {
            if ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind {
                return Ok((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
            }
        }
    }
    Err(anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))
}

fn strip_managed_fields(v: &mut Value) {
    if let Some(meta) = v.get_mut("metadata").and_then(Value::as_object_mut) {
        meta.remove("managedFields");
    }
}

fn meta_str<'a>(v: &'a Value, field: &str) -> &'a str {
    v.get("metadata").and_then(|m| m.get(field)).and_then(Value::as_str).unwrap_or("")
}

/// Remembers the last object seen per resource of one kind so updates can be classified.
pub struct ChangeTracker {
    kind: String,
    last: HashMap<(String, String), Value>,
}

impl ChangeTracker {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into(), last: HashMap::new() }
    }

    pub fn tracked(&self) -> usize {
        self.last.len()
    }

    /// Object added or modified. `None` when it lacks a name.
    pub fn applied(&mut self, mut obj: Value, at: DateTime<Utc>) -> Option<ChangeEvent> {
        strip_managed_fields(&mut obj);
        let name = meta_str(&obj, "name").to_string();
        if name.is_empty() {
            warn!(kind = %self.kind, "object without metadata.name; skipped");
            return None;
        }
        let namespace = meta_str(&obj, "namespace").to_string();
        let rv = meta_str(&obj, "resourceVersion").to_string();
        let payload = obj.to_string();
        let id = (namespace.clone(), name.clone());
        let (change, minor) = match self.last.get(&id) {
            Some(prev) => (ChangeKind::Update, is_minor_update(prev, &obj)),
            None => (ChangeKind::Create, false),
        };
        self.last.insert(id, obj);
        Some(
            ChangeEvent::new(self.kind.clone(), namespace, name, at, change, payload)
                .with_resource_version(rv)
                .with_minor(minor),
        )
    }

    pub fn deleted(&mut self, mut obj: Value, at: DateTime<Utc>) -> Option<ChangeEvent> {
        strip_managed_fields(&mut obj);
        let name = meta_str(&obj, "name").to_string();
        if name.is_empty() {
            return None;
        }
        let namespace = meta_str(&obj, "namespace").to_string();
        self.last.remove(&(namespace.clone(), name.clone()));
        let rv = meta_str(&obj, "resourceVersion").to_string();
        Some(ChangeEvent::new(self.kind.clone(), namespace, name, at, ChangeKind::Delete, obj.to_string()).with_resource_version(rv))
    }

    /// Relist after a watch restart. Objects that disappeared while disconnected become deletes.
    pub fn restarted(&mut self, objs: Vec<Value>, at: DateTime<Utc>) -> Vec<ChangeEvent> {
        let mut seen = std::collections::HashSet::with_capacity(objs.len());
        let mut out = Vec::with_capacity(objs.len());
        for obj in objs {
            seen.insert((meta_str(&obj, "namespace").to_string(), meta_str(&obj, "name").to_string()));
            out.extend(self.applied(obj, at));
        }
        let gone: Vec<_> = self.last.keys().filter(|k| !seen.contains(*k)).cloned().collect();
        for id in gone {
            if let Some(prev) = self.last.remove(&id) {
                let rv = meta_str(&prev, "resourceVersion").to_string();
                out.push(
                    ChangeEvent::new(self.kind.clone(), id.0, id.1, at, ChangeKind::Delete, prev.to_string())
                        .with_resource_version(rv),
                );
            }
        }
        out
    }
}

/// Running watchers. Dropping every clone of the producer sender happens on [`WatchSet::stop`].
pub struct WatchSet {
    cancel: CancellationToken,
    tasks: Vec<(String, JoinHandle<()>)>,
}

impl WatchSet {
    /// Start one watcher per GVK key, all feeding `tx`. Unknown kinds are skipped with a warning.
    /// With `watch_crds`, every custom resource defined at startup is watched as well.
    pub async fn start(
        client: Client,
        kinds: &[String],
        namespace: Option<&str>,
        watch_crds: bool,
        tx: mpsc::Sender<ChangeEvent>,
    ) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await.context("running api discovery")?;
        let mut kinds = kinds.to_vec();
        if watch_crds {
            match list_crd_kinds(client.clone()).await {
                Ok(crds) => {
                    info!(crds = crds.len(), "watching custom resources");
                    for key in crds {
                        if !kinds.contains(&key) {
                            kinds.push(key);
                        }
                    }
                }
                Err(e) => warn!(error = %e, "custom resources not listed; watching built-in kinds only"),
            }
        }
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        for key in &kinds {
            let gvk = parse_gvk_key(key)?;
            let (ar, namespaced) = match find_api_resource(&discovery, &gvk) {
                Ok(found) => found,
                Err(e) => {
                    warn!(gvk = %key, error = %e, "kind not served; not watching");
                    continue;
                }
            };
            let api: Api<DynamicObject> = match (namespaced, namespace) {
                (true, Some(ns)) => Api::namespaced_with(client.clone(), ns, &ar),
                _ => Api::all_with(client.clone(), &ar),
            };
            let handle = tokio::spawn(run_watcher(key.clone(), gvk.kind, api, tx.clone(), cancel.child_token()));
            tasks.push((key.clone(), handle));
        }
        if tasks.is_empty() {
            return Err(anyhow!("none of the requested kinds are served by the cluster"));
        }
        info!(watchers = tasks.len(), ns = ?namespace, "watchers started");
        Ok(Self { cancel, tasks })
    }

    /// Stop every watcher and wait for them to exit. No events are sent afterwards.
    pub async fn stop(self) {
        self.cancel.cancel();
        for (key, task) in self.tasks {
            if let Err(e) = task.await {
                warn!(gvk = %key, error = %e, "watcher task ended abnormally");
            }
        }
        info!("watchers stopped");
    }
}

async fn run_watcher(
    key: String,
    kind: String,
    api: Api<DynamicObject>,
    tx: mpsc::Sender<ChangeEvent>,
    cancel: CancellationToken,
) {
    let stream = watcher::watcher(api, watcher::Config::default()).default_backoff();
    futures::pin_mut!(stream);
    let mut tracker = ChangeTracker::new(kind);
    debug!(gvk = %key, "watcher running");
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let ev = match next {
            Some(Ok(ev)) => ev,
            Some(Err(e)) => {
                warn!(gvk = %key, error = %e, "watch error; retrying");
                counter!("kubehub_watch_errors_total", 1u64);
                continue;
            }
            None => {
                warn!(gvk = %key, "watcher stream ended");
                break;
            }
        };
        let now = Utc::now();
        let out = match ev {
            Event::Applied(o) => to_value(&key, &o).and_then(|v| tracker.applied(v, now)).into_iter().collect(),
            Event::Deleted(o) => to_value(&key, &o).and_then(|v| tracker.deleted(v, now)).into_iter().collect(),
            Event::Restarted(list) => {
                debug!(gvk = %key, count = list.len(), "watch restart");
                let objs = list.iter().filter_map(|o| to_value(&key, o)).collect();
                tracker.restarted(objs, now)
            }
        };
        for ev in out {
            counter!("kubehub_events_total", 1u64);
            // The send waits while the channel is full; cancellation still wins.
            tokio::select! {
                _ = cancel.cancelled() => return,
                sent = tx.send(ev) => if sent.is_err() {
                    debug!(gvk = %key, "event channel closed");
                    return;
                },
            }
        }
    }
}

fn to_value(key: &str, obj: &DynamicObject) -> Option<Value> {
    match serde_json::to_value(obj) {
        Ok(v) => Some(v),
        Err(e) => {
            warn!(gvk = %key, error = %e, "serializing object failed");
            None
        }
    }
}
