use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{MembershipError, NotFound, RegistryError};
use crate::policy::{LoadBalancingPolicy, PolicyKind};
use crate::replica::{LocalChannel, Replica, ReplicaSet};

pub static DEFAULT_METHOD: &str = "call";

#[derive(Debug, Clone)]
/// The settings used to register a new deployment.
pub struct DeploymentConfig {
    name: String,
    route_prefix: Option<String>,
    methods: BTreeSet<String>,
    default_method: String,
    policy: PolicyKind,
}

impl DeploymentConfig {
    /// Creates a new deployment config with no route prefix.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            route_prefix: None,
            methods: BTreeSet::new(),
            default_method: DEFAULT_METHOD.to_string(),
            policy: PolicyKind::default(),
        }
    }

    /// Creates a new deployment config using the name and method table
    /// of a local service channel.
    pub fn for_channel(channel: &LocalChannel) -> Self {
        Self::new(channel.deployment_name()).with_methods(channel.methods())
    }

    /// Exposes the deployment over HTTP under the given path prefix.
    pub fn with_route_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.route_prefix = Some(prefix.into());
        self
    }

    /// Restricts the deployment to the given set of callable methods.
    ///
    /// An empty set allows any method name to be forwarded to the replicas.
    pub fn with_methods(mut self, methods: impl IntoIterator<Item = impl AsRef<str>>) -> Self {
        self.methods = methods
            .into_iter()
            .map(|method| method.as_ref().to_string())
            .collect();
        self
    }

    /// Sets the method invoked when a call does not name one.
    pub fn with_default_method(mut self, method: impl Into<String>) -> Self {
        self.default_method = method.into();
        self
    }

    /// Sets the load balancing policy of the deployment.
    pub fn with_policy(mut self, policy: PolicyKind) -> Self {
        self.policy = policy;
        self
    }
}

/// A named, horizontally scaled unit of request handling logic.
pub struct Deployment {
    name: String,
    route_prefix: Option<String>,
    methods: BTreeSet<String>,
    default_method: String,
    replicas: ReplicaSet,
    policy: Box<dyn LoadBalancingPolicy>,
}

impl Deployment {
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    /// The normalised route prefix of the deployment, if exposed over HTTP.
    pub fn route_prefix(&self) -> Option<&str> {
        self.route_prefix.as_deref()
    }

    #[inline]
    pub fn default_method(&self) -> &str {
        &self.default_method
    }

    #[inline]
    /// The declared set of callable methods.
    ///
    /// An empty set means the deployment does not restrict method names.
    pub fn methods(&self) -> &BTreeSet<String> {
        &self.methods
    }

    #[inline]
    pub fn replicas(&self) -> &ReplicaSet {
        &self.replicas
    }

    #[inline]
    pub fn policy(&self) -> &dyn LoadBalancingPolicy {
        self.policy.as_ref()
    }

    /// Returns if the deployment declares the given method.
    pub fn has_method(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Works out which method a call should invoke.
    pub fn resolve_method<'a>(&'a self, requested: Option<&'a str>) -> Result<&'a str, NotFound> {
        let method = requested.unwrap_or(&self.default_method);

        if !self.methods.is_empty() && !self.methods.contains(method) {
            return Err(NotFound::Method {
                deployment: self.name.clone(),
                method: method.to_string(),
            });
        }

        Ok(method)
    }
}

impl Debug for Deployment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deployment")
            .field("name", &self.name)
            .field("route_prefix", &self.route_prefix)
            .field("methods", &self.methods)
            .field("default_method", &self.default_method)
            .field("num_replicas", &self.replicas.len())
            .field("policy", &self.policy.name())
            .finish()
    }
}

#[derive(Debug, Clone)]
/// The result of resolving a request path against the route table.
pub struct RouteMatch {
    /// The deployment owning the longest matching prefix.
    pub deployment: Arc<Deployment>,
    /// The prefix which was matched.
    pub prefix: String,
    /// The remainder of the path after the prefix, always starting
    /// with `/` unless empty.
    pub remainder: String,
}

#[derive(Default)]
struct RegistryState {
    deployments: BTreeMap<String, Arc<Deployment>>,
    /// A mapping of normalised route prefix -> deployment name.
    routes: BTreeMap<String, String>,
}

#[derive(Clone, Default)]
/// The set of all registered deployments and the route table exposing them.
///
/// The registry is a cheap to clone handle, every clone observes the same
/// deployments.
pub struct DeploymentRegistry {
    state: Arc<RwLock<RegistryState>>,
}

impl DeploymentRegistry {
    /// Registers a new deployment.
    ///
    /// Fails if a deployment with the same name exists or the route prefix is
    /// already owned by another deployment.
    pub fn register(&self, config: DeploymentConfig) -> Result<Arc<Deployment>, RegistryError> {
        let route_prefix = config
            .route_prefix
            .as_deref()
            .map(normalise_prefix)
            .transpose()?;

        let mut lock = self.state.write();

        if lock.deployments.contains_key(&config.name) {
            return Err(RegistryError::DeploymentExists(config.name));
        }

        if let Some(prefix) = route_prefix.as_ref() {
            if let Some(existing) = lock.routes.get(prefix) {
                return Err(RegistryError::RoutePrefixConflict {
                    prefix: prefix.clone(),
                    existing: existing.clone(),
                });
            }
        }

        let deployment = Arc::new(Deployment {
            name: config.name.clone(),
            route_prefix: route_prefix.clone(),
            methods: config.methods,
            default_method: config.default_method,
            replicas: ReplicaSet::default(),
            policy: config.policy.build(),
        });

        if let Some(prefix) = route_prefix {
            lock.routes.insert(prefix, config.name.clone());
        }
        lock.deployments.insert(config.name, deployment.clone());

        info!(
            deployment = %deployment.name(),
            route_prefix = ?deployment.route_prefix(),
            policy = deployment.policy().name(),
            "Registered deployment."
        );

        Ok(deployment)
    }

    /// Removes the deployment and its replica set from the registry.
    ///
    /// Calls already dispatched to one of its replicas are allowed to complete.
    /// The replicas are released and may be added to another deployment.
    pub fn deregister(&self, name: &str) -> Option<Arc<Deployment>> {
        let mut lock = self.state.write();
        let deployment = lock.deployments.remove(name)?;

        if let Some(prefix) = deployment.route_prefix() {
            lock.routes.remove(prefix);
        }
        deployment.replicas().release_all();

        info!(deployment = %name, "Deregistered deployment.");

        Some(deployment)
    }

    /// Gets the deployment with the given name.
    pub fn resolve_by_name(&self, name: &str) -> Result<Arc<Deployment>, NotFound> {
        self.state
            .read()
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| NotFound::Deployment(name.to_string()))
    }

    /// Gets the deployment whose route prefix is the longest match for the path.
    ///
    /// Prefixes match on whole path segments, `/a` matches `/a` and `/a/b`
    /// but not `/ab`.
    pub fn resolve_by_prefix(&self, path: &str) -> Result<RouteMatch, NotFound> {
        let lock = self.state.read();

        let (prefix, name) = longest_prefix_match(&lock.routes, path)
            .ok_or_else(|| NotFound::Route(path.to_string()))?;

        let deployment = lock
            .deployments
            .get(name)
            .cloned()
            .ok_or_else(|| NotFound::Route(path.to_string()))?;

        let remainder = if prefix == "/" {
            path.to_string()
        } else {
            path[prefix.len()..].to_string()
        };

        Ok(RouteMatch {
            deployment,
            prefix: prefix.to_string(),
            remainder,
        })
    }

    /// Adds a replica to the named deployment.
    pub fn add_replica(
        &self,
        deployment: &str,
        replica: Arc<Replica>,
    ) -> Result<(), RegistryError> {
        let target = self.resolve_by_name(deployment)?;
        let replica_id = replica.id().to_string();

        target
            .replicas()
            .add(replica)
            .map_err(|e| match e {
                MembershipError::Duplicate(source) => RegistryError::DuplicateReplica {
                    deployment: deployment.to_string(),
                    source,
                },
                MembershipError::AlreadyOwned(replica) => RegistryError::ReplicaInUse {
                    deployment: deployment.to_string(),
                    replica,
                },
            })?;

        debug!(deployment = %deployment, replica = %replica_id, "Added replica.");

        Ok(())
    }

    /// Removes a replica from the named deployment.
    ///
    /// Removing a replica which is not part of the deployment is a no-op.
    pub fn remove_replica(
        &self,
        deployment: &str,
        replica_id: &str,
    ) -> Result<Option<Arc<Replica>>, RegistryError> {
        let target = self.resolve_by_name(deployment)?;
        let removed = target.replicas().remove(replica_id);

        if removed.is_some() {
            debug!(deployment = %deployment, replica = %replica_id, "Removed replica.");
        }

        Ok(removed)
    }

    /// Returns all currently registered deployments ordered by name.
    pub fn deployments(&self) -> Vec<Arc<Deployment>> {
        self.state.read().deployments.values().cloned().collect()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.state.read().deployments.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn normalise_prefix(prefix: &str) -> Result<String, RegistryError> {
    if !prefix.starts_with('/') {
        return Err(RegistryError::InvalidRoutePrefix(prefix.to_string()));
    }

    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        Ok("/".to_string())
    } else {
        Ok(trimmed.to_string())
    }
}

/// Walks the path from its full length back towards the root, one segment at
/// a time, and returns the first registered prefix.
fn longest_prefix_match<'a>(
    routes: &'a BTreeMap<String, String>,
    path: &str,
) -> Option<(&'a str, &'a str)> {
    let mut end = path.len();

    loop {
        let candidate = &path[..end];
        if let Some((prefix, name)) = routes.get_key_value(candidate) {
            return Some((prefix.as_str(), name.as_str()));
        }

        match candidate.rfind('/') {
            Some(0) | None => break,
            Some(pos) => end = pos,
        }
    }

    routes
        .get_key_value("/")
        .map(|(prefix, name)| (prefix.as_str(), name.as_str()))
}
