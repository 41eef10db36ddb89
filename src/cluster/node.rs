//! A node and the listeners it runs.

use std::sync::{Arc, Weak};

use serde::{Deserialize, Serialize};

use super::{Cluster, ClusterInner};
use crate::logging::{debug, info};
use crate::services::{HttpService, KvService, Service, ServiceError, ServiceType};

/// Address every node binds to.
pub const DEFAULT_HOSTNAME: &str = "127.0.0.1";

/// Options for a new node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeOptions {
    /// Services to run. Empty means all of them.
    pub services: Vec<ServiceType>,
}

/// One node of the mock cluster.
pub struct ClusterNode {
    id: String,
    hostname: String,
    cluster: Weak<ClusterInner>,
    kv: Option<Arc<KvService>>,
    mgmt: Option<Arc<HttpService>>,
    views: Option<Arc<HttpService>>,
    query: Option<Arc<HttpService>>,
    search: Option<Arc<HttpService>>,
    analytics: Option<Arc<HttpService>>,
}

impl std::fmt::Debug for ClusterNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterNode")
            .field("id", &self.id)
            .field("hostname", &self.hostname)
            .finish()
    }
}

impl ClusterNode {
    /// Bind every requested listener, then start serving.
    pub(crate) async fn start(cluster: Weak<ClusterInner>, opts: &NodeOptions) -> Result<Arc<Self>, ServiceError> {
        let hostname = DEFAULT_HOSTNAME;
        let enabled = |service: ServiceType| service.enabled_in(&opts.services);

        let kv_listener = if enabled(ServiceType::KeyValue) {
            Some(KvService::bind(hostname).await?)
        } else {
            None
        };
        let mut http_listeners = Vec::new();
        for service in ServiceType::ALL.iter().copied() {
            if service != ServiceType::KeyValue && enabled(service) {
                http_listeners.push((service, HttpService::bind(service, hostname).await?));
            }
        }

        let node = Arc::new_cyclic(|weak: &Weak<ClusterNode>| {
            let mut node = ClusterNode {
                id: uuid::Uuid::new_v4().simple().to_string(),
                hostname: hostname.to_string(),
                cluster,
                kv: kv_listener.map(|listener| KvService::start(listener, hostname, weak.clone())),
                mgmt: None,
                views: None,
                query: None,
                search: None,
                analytics: None,
            };
            for (service, listener) in http_listeners {
                let started = Some(HttpService::start(service, listener, hostname, weak.clone()));
                match service {
                    ServiceType::Mgmt => node.mgmt = started,
                    ServiceType::Views => node.views = started,
                    ServiceType::Query => node.query = started,
                    ServiceType::Search => node.search = started,
                    ServiceType::Analytics => node.analytics = started,
                    ServiceType::KeyValue => {}
                }
            }
            node
        });
        info!(node = %node.id, "cluster node started");
        Ok(node)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    /// The cluster this node belongs to, while it is alive.
    pub fn cluster(&self) -> Option<Cluster> {
        self.cluster.upgrade().map(|inner| Cluster { inner })
    }

    pub fn kv_service(&self) -> Option<&Arc<KvService>> {
        self.kv.as_ref()
    }

    pub fn mgmt_service(&self) -> Option<&Arc<HttpService>> {
        self.mgmt.as_ref()
    }

    pub fn views_service(&self) -> Option<&Arc<HttpService>> {
        self.views.as_ref()
    }

    pub fn query_service(&self) -> Option<&Arc<HttpService>> {
        self.query.as_ref()
    }

    pub fn search_service(&self) -> Option<&Arc<HttpService>> {
        self.search.as_ref()
    }

    pub fn analytics_service(&self) -> Option<&Arc<HttpService>> {
        self.analytics.as_ref()
    }

    /// The HTTP listener for `service`, if this node runs it.
    pub fn http_service(&self, service: ServiceType) -> Option<&Arc<HttpService>> {
        match service {
            ServiceType::KeyValue => None,
            ServiceType::Mgmt => self.mgmt_service(),
            ServiceType::Views => self.views_service(),
            ServiceType::Query => self.query_service(),
            ServiceType::Search => self.search_service(),
            ServiceType::Analytics => self.analytics_service(),
        }
    }

    /// Plain port of `service`, 0 when not running.
    pub fn port(&self, service: ServiceType) -> u16 {
        match service {
            ServiceType::KeyValue => self.kv.as_ref().map(|s| s.listen_port()),
            other => self.http_service(other).map(|s| s.listen_port()),
        }
        .unwrap_or(0)
    }

    /// TLS port of `service`, 0 when not running or not secured.
    pub fn tls_port(&self, service: ServiceType) -> u16 {
        match service {
            ServiceType::KeyValue => self.kv.as_ref().map(|s| s.listen_port_tls()),
            other => self.http_service(other).map(|s| s.listen_port_tls()),
        }
        .unwrap_or(0)
    }

    /// Stop every listener.
    pub fn close(&self) {
        if let Some(kv) = &self.kv {
            kv.close();
        }
        for service in [&self.mgmt, &self.views, &self.query, &self.search, &self.analytics]
            .into_iter()
            .flatten()
        {
            service.close();
        }
        debug!(node = %self.id, "cluster node closed");
    }
}
