//! Pod watch translated into node-local NAT events

use futures::{StreamExt, TryStreamExt};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::runtime::watcher;
use kube::Client;
use podnat_core::types::{EventKind, PodEvent};
use podnat_core::{annotation, netutil};
use std::collections::HashSet;
use std::net::IpAddr;
use tokio::sync::mpsc::Sender;
use tracing::{info, warn};

/// Filter options for the pod watch
#[derive(Debug, Clone)]
pub struct InformerConfig {
    pub node_id: String,
    pub annotation_key: String,
    pub resync_secs: u32,
    pub restricted_ports: Vec<u16>,
    pub restricted_ports_enable: bool,
    /// Event kinds forwarded to the supervisor
    pub subscriptions: Vec<EventKind>,
}

pub struct PodInformer {
    client: Client,
    config: InformerConfig,
    events: Sender<PodEvent>,
}

impl PodInformer {
    pub fn new(client: Client, config: InformerConfig, events: Sender<PodEvent>) -> Self {
        Self {
            client,
            config,
            events,
        }
    }

    /// Watch pods until the stream ends, translating lifecycle changes
    /// into NAT events for the supervisor. The channel send blocks while
    /// the processor is busy, which intentionally throttles the watch
    /// rather than dropping events.
    pub async fn run(self) {
        let pods: Api<Pod> = Api::all(self.client.clone());
        let watch_config = watcher::Config::default().timeout(self.config.resync_secs);

        let mut seen: HashSet<String> = HashSet::new();
        let mut stream = watcher(pods, watch_config).boxed();

        loop {
            match stream.try_next().await {
                Ok(Some(watcher::Event::Applied(pod))) => {
                    self.forward(&pod, &mut seen, false).await;
                }
                Ok(Some(watcher::Event::Deleted(pod))) => {
                    self.forward(&pod, &mut seen, true).await;
                }
                Ok(Some(watcher::Event::Restarted(pods))) => {
                    for pod in pods {
                        self.forward(&pod, &mut seen, false).await;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!("pod watch error: {}", e);
                    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                }
            }
        }
    }

    async fn forward(&self, pod: &Pod, seen: &mut HashSet<String>, deleted: bool) {
        let Some(event) = translate(pod, seen, deleted, &self.config) else {
            return;
        };
        info!(
            "pod {} matched: {}/{}",
            event.kind, event.namespace, event.name
        );
        if self.events.send(event).await.is_err() {
            warn!("event channel closed, dropping pod event");
        }
    }
}

/// Filter and translate one pod object.
///
/// `None` when the pod does not participate in NAT, runs on another
/// node or carries unusable data. The watch does not distinguish adds
/// from updates, so first sightings become adds via the seen set.
fn translate(
    pod: &Pod,
    seen: &mut HashSet<String>,
    deleted: bool,
    config: &InformerConfig,
) -> Option<PodEvent> {
    let name = pod.metadata.name.clone()?;
    let namespace = pod
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let raw = pod
        .metadata
        .annotations
        .as_ref()?
        .get(&config.annotation_key)?;

    let node = pod
        .spec
        .as_ref()
        .and_then(|spec| spec.node_name.clone())
        .unwrap_or_default();
    if netutil::short_host_name(&node) != config.node_id {
        return None;
    }

    let pod_ip = pod.status.as_ref().and_then(|status| status.pod_ip.clone())?;
    let ipv4 = match pod_ip.parse::<IpAddr>() {
        Ok(ip @ IpAddr::V4(_)) => ip,
        _ => {
            warn!(
                "pod {}/{} has no usable IPv4 address, skipping",
                namespace, name
            );
            return None;
        }
    };

    let annotation = match annotation::parse_annotation(
        raw,
        &config.restricted_ports,
        config.restricted_ports_enable,
    ) {
        Ok(parsed) => parsed,
        Err(e) => {
            warn!("invalid NAT annotation on pod {}/{}: {}", namespace, name, e);
            return None;
        }
    };

    let id = format!("{}/{}", namespace, name);
    let kind = if deleted {
        seen.remove(&id);
        EventKind::Delete
    } else if seen.insert(id) {
        EventKind::Add
    } else {
        EventKind::Update
    };

    // sightings keep the seen set current even for unsubscribed kinds
    if !config.subscriptions.contains(&kind) {
        return None;
    }

    Some(PodEvent {
        kind,
        name,
        namespace,
        node,
        ipv4,
        annotation,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodSpec, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    const ANNOTATION: &str = r#"{"entries":[{"srcPort":25,"dstPort":25}]}"#;

    fn config() -> InformerConfig {
        InformerConfig {
            node_id: "node1".to_string(),
            annotation_key: "bln.space/podnat".to_string(),
            resync_secs: 180,
            restricted_ports: vec![22, 53, 6443],
            restricted_ports_enable: false,
            subscriptions: vec![EventKind::Add, EventKind::Update, EventKind::Delete],
        }
    }

    fn pod(name: &str, node: &str, ip: Option<&str>, annotation: Option<&str>) -> Pod {
        let annotations = annotation.map(|value| {
            let mut map = BTreeMap::new();
            map.insert("bln.space/podnat".to_string(), value.to_string());
            map
        });
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("prod".to_string()),
                annotations,
                ..Default::default()
            },
            spec: Some(PodSpec {
                node_name: Some(node.to_string()),
                ..Default::default()
            }),
            status: ip.map(|ip| PodStatus {
                pod_ip: Some(ip.to_string()),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn first_sighting_is_add_then_update_then_delete() {
        let mut seen = HashSet::new();
        let pod = pod("web", "node1.cluster.local", Some("10.0.0.5"), Some(ANNOTATION));

        let event = translate(&pod, &mut seen, false, &config()).unwrap();
        assert_eq!(event.kind, EventKind::Add);
        assert_eq!(event.namespace, "prod");
        assert_eq!(event.annotation.entries.len(), 1);

        let event = translate(&pod, &mut seen, false, &config()).unwrap();
        assert_eq!(event.kind, EventKind::Update);

        let event = translate(&pod, &mut seen, true, &config()).unwrap();
        assert_eq!(event.kind, EventKind::Delete);
        assert!(seen.is_empty());
    }

    #[test]
    fn pods_on_other_nodes_are_filtered() {
        let mut seen = HashSet::new();
        let pod = pod("web", "node2", Some("10.0.0.5"), Some(ANNOTATION));
        assert!(translate(&pod, &mut seen, false, &config()).is_none());
    }

    #[test]
    fn pods_without_the_annotation_are_filtered() {
        let mut seen = HashSet::new();
        let pod = pod("web", "node1", Some("10.0.0.5"), None);
        assert!(translate(&pod, &mut seen, false, &config()).is_none());
    }

    #[test]
    fn pods_with_broken_annotations_are_filtered() {
        let mut seen = HashSet::new();
        let pod = pod("web", "node1", Some("10.0.0.5"), Some("{not json"));
        assert!(translate(&pod, &mut seen, false, &config()).is_none());

        // restricted port refused while the enable flag is off
        let restricted = r#"{"entries":[{"srcPort":22,"dstPort":22}]}"#;
        let pod = self::pod("web", "node1", Some("10.0.0.5"), Some(restricted));
        assert!(translate(&pod, &mut seen, false, &config()).is_none());
        assert!(seen.is_empty());
    }

    #[test]
    fn unsubscribed_kinds_are_not_forwarded() {
        let mut seen = HashSet::new();
        let mut delete_only = config();
        delete_only.subscriptions = vec![EventKind::Delete];

        let pod = pod("web", "node1", Some("10.0.0.5"), Some(ANNOTATION));
        assert!(translate(&pod, &mut seen, false, &delete_only).is_none());

        let event = translate(&pod, &mut seen, true, &delete_only).unwrap();
        assert_eq!(event.kind, EventKind::Delete);
    }

    #[test]
    fn pods_without_usable_ip_are_filtered() {
        let mut seen = HashSet::new();
        let no_ip = pod("web", "node1", None, Some(ANNOTATION));
        assert!(translate(&no_ip, &mut seen, false, &config()).is_none());

        let v6 = pod("web", "node1", Some("fd00::5"), Some(ANNOTATION));
        assert!(translate(&v6, &mut seen, false, &config()).is_none());
    }
}
