//! Kubernetes pod feed
//!
//! Watches pods matching the selector and turns watcher apply/delete events
//! into `Observed`/`Transitioned` events using a local cache keyed by uid.
//! Deleting a running pod is reported as a transition to `Failed`.

use super::source::ListFuture;
use super::{
    FeedError, FeedEvent, FeedStream, Member, MemberPhase, MemberRole, MemberSelector,
    MemberSource,
};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, ListParams},
    runtime::watcher::{watcher, Config as WatcherConfig, Event},
    runtime::WatchStreamExt,
    Client,
};
use std::collections::HashMap;
use tracing::{debug, warn};

pub struct KubeSource {
    client: Client,
}

impl KubeSource {
    /// Connect using in-cluster config or the local kubeconfig
    pub async fn try_default() -> Result<Self, FeedError> {
        let client = Client::try_default()
            .await
            .map_err(|e| FeedError::Unavailable(e.to_string()))?;
        Ok(KubeSource { client })
    }

    pub fn new(client: Client) -> Self {
        KubeSource { client }
    }
}

/// Convert a pod; pods without a name or uid are rejected
pub fn pod_to_member(pod: &Pod, selector: &MemberSelector) -> Result<Member, FeedError> {
    let name = pod
        .metadata
        .name
        .clone()
        .ok_or_else(|| FeedError::Malformed("pod without a name".to_string()))?;
    let uid = pod
        .metadata
        .uid
        .clone()
        .ok_or_else(|| FeedError::Malformed(format!("pod {} without a uid", name)))?;

    let component = pod
        .metadata
        .labels
        .as_ref()
        .and_then(|labels| labels.get("component"));
    let role = if component.map(String::as_str) == Some(selector.component.as_str()) {
        MemberRole::Primary
    } else {
        MemberRole::Secondary
    };

    let status = pod.status.as_ref();
    Ok(Member {
        address: status.and_then(|s| s.pod_ip.clone()).unwrap_or_default(),
        name,
        uid,
        role,
        phase: status
            .and_then(|s| s.phase.as_deref())
            .map(MemberPhase::parse)
            .unwrap_or(MemberPhase::Unknown),
    })
}

/// Tracks last-seen members to derive transitions from watcher snapshots
#[derive(Default)]
struct MemberCache {
    members: HashMap<String, Member>,
}

impl MemberCache {
    fn apply(&mut self, member: Member) -> Option<FeedEvent> {
        match self.members.insert(member.uid.clone(), member.clone()) {
            None => Some(FeedEvent::Observed(member)),
            Some(old) if old.phase != member.phase => Some(FeedEvent::Transitioned {
                old,
                new: member,
            }),
            Some(_) => None,
        }
    }

    fn delete(&mut self, member: &Member) -> Option<FeedEvent> {
        let old = self.members.remove(&member.uid)?;
        if old.phase != MemberPhase::Running {
            return None;
        }
        let new = Member {
            phase: MemberPhase::Failed,
            ..old.clone()
        };
        Some(FeedEvent::Transitioned { old, new })
    }

    fn translate(&mut self, event: Event<Pod>, selector: &MemberSelector) -> Vec<Result<FeedEvent, FeedError>> {
        match event {
            Event::Init => {
                debug!("pod watcher (re)listing");
                Vec::new()
            }
            Event::InitApply(pod) | Event::Apply(pod) => match pod_to_member(&pod, selector) {
                Ok(member) => self.apply(member).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            },
            Event::Delete(pod) => match pod_to_member(&pod, selector) {
                Ok(member) => self.delete(&member).into_iter().map(Ok).collect(),
                Err(e) => vec![Err(e)],
            },
            Event::InitDone => vec![Ok(FeedEvent::Synced)],
        }
    }
}

impl MemberSource for KubeSource {
    fn watch(&self, selector: &MemberSelector) -> FeedStream {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &selector.namespace);
        let config = WatcherConfig::default().labels(&selector.label_selector());
        let selector = selector.clone();
        let mut cache = MemberCache::default();

        let stream = watcher(pods, config)
            .default_backoff()
            .map(move |event| match event {
                Ok(event) => cache.translate(event, &selector),
                Err(e) => {
                    warn!(error = %e, "pod watcher error, will retry");
                    vec![Err(FeedError::Unavailable(e.to_string()))]
                }
            })
            .flat_map(futures::stream::iter);

        Box::pin(stream)
    }

    fn list<'a>(&'a self, selector: &'a MemberSelector) -> ListFuture<'a> {
        Box::pin(async move {
            let pods: Api<Pod> = Api::namespaced(self.client.clone(), &selector.namespace);
            let params = ListParams::default().labels(&selector.label_selector());
            let list = pods
                .list(&params)
                .await
                .map_err(|e| FeedError::Unavailable(e.to_string()))?;

            list.items
                .iter()
                .map(|pod| pod_to_member(pod, selector))
                .collect()
        })
    }
}
