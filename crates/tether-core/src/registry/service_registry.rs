//! Startup-time binding of service interfaces to endpoints.

use super::endpoint::{ServiceEndpoint, ServiceInterface};
use crate::error::{Result, TetherError};
use std::any::TypeId;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

#[derive(Default)]
struct RegistryInner {
    /// service name -> method name -> endpoint
    services: HashMap<String, HashMap<String, Arc<ServiceEndpoint>>>,
    /// (interface type, target instance) pairs already registered
    registrations: HashSet<(TypeId, usize)>,
}

impl RegistryInner {
    fn contains(&self, service: &str, method: &str) -> bool {
        self.services
            .get(service)
            .is_some_and(|methods| methods.contains_key(method))
    }
}

/// Maps `(service, method)` pairs to endpoints.
///
/// Shared between channels behind an `Arc`. Lookups take a read lock and
/// never block each other.
#[derive(Default)]
pub struct ServiceRegistry {
    inner: RwLock<RegistryInner>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every method of `S` bound to `target`.
    ///
    /// Either all methods are bound or none are. Registering the same instance
    /// for the same interface again is a no-op and returns `Ok(0)`; otherwise
    /// returns the number of endpoints added.
    pub fn register<S: ServiceInterface>(&self, target: Arc<S>) -> Result<usize> {
        let key = (TypeId::of::<S>(), Arc::as_ptr(&target) as *const () as usize);
        let descriptors = S::methods();

        if descriptors.is_empty() {
            return Err(TetherError::ServiceRegistration {
                service: S::NAME.to_string(),
                message: "interface declares no methods".to_string(),
            });
        }

        let mut resolved = HashSet::with_capacity(descriptors.len());
        for descriptor in &descriptors {
            let (service, method) = descriptor.resolved_names(S::NAME);
            if !resolved.insert((service.clone(), method.clone())) {
                warn!(
                    service = %service,
                    method = %method,
                    overridden = descriptor.is_overridden(),
                    "ambiguous method binding within interface"
                );
                return Err(TetherError::DuplicateService { service, method });
            }
        }

        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());

        if inner.registrations.contains(&key) {
            debug!(service = S::NAME, "instance already registered, skipping");
            return Ok(0);
        }

        if let Some((service, method)) = resolved
            .iter()
            .find(|(service, method)| inner.contains(service, method))
        {
            return Err(TetherError::DuplicateService {
                service: service.clone(),
                method: method.clone(),
            });
        }

        let count = descriptors.len();
        for descriptor in descriptors {
            let endpoint = descriptor.bind(S::NAME, target.clone());
            debug!(
                endpoint = %endpoint.qualified_name(),
                params = endpoint.parameter_count(),
                "bound endpoint"
            );
            inner
                .services
                .entry(endpoint.service_name().to_string())
                .or_default()
                .insert(endpoint.method_name().to_string(), Arc::new(endpoint));
        }
        inner.registrations.insert(key);

        info!(service = S::NAME, endpoints = count, "Registered service");
        Ok(count)
    }

    /// Find the endpoint bound to `(service, method)`.
    pub fn lookup(&self, service: &str, method: &str) -> Option<Arc<ServiceEndpoint>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .services
            .get(service)
            .and_then(|methods| methods.get(method))
            .cloned()
    }

    pub fn contains(&self, service: &str, method: &str) -> bool {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .contains(service, method)
    }

    /// Number of bound endpoints.
    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .services
            .values()
            .map(HashMap::len)
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// All bound `(service, method)` pairs, sorted.
    pub fn endpoints(&self) -> Vec<(String, String)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut pairs: Vec<(String, String)> = inner
            .services
            .iter()
            .flat_map(|(service, methods)| {
                methods
                    .keys()
                    .map(move |method| (service.clone(), method.clone()))
            })
            .collect();
        pairs.sort();
        pairs
    }
}

impl std::fmt::Debug for ServiceRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServiceRegistry")
            .field("endpoints", &self.endpoints())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::MethodDescriptor;
    use serde_json::json;

    struct Metrics;

    impl ServiceInterface for Metrics {
        const NAME: &'static str = "metrics";

        fn methods() -> Vec<MethodDescriptor<Self>> {
            vec![
                MethodDescriptor::new("push", |_m: Arc<Metrics>, batch: Vec<f64>| async move {
                    Ok::<_, String>(batch.len())
                }),
                MethodDescriptor::new("count", |_m: Arc<Metrics>| async move {
                    Ok::<_, String>(0u64)
                }),
            ]
        }
    }

    /// Two overloads of `push` with no override to tell them apart.
    struct Overloaded;

    impl ServiceInterface for Overloaded {
        const NAME: &'static str = "overloaded";

        fn methods() -> Vec<MethodDescriptor<Self>> {
            vec![
                MethodDescriptor::new("push", |_o: Arc<Overloaded>, _x: i64| async move {
                    Ok::<_, String>(())
                }),
                MethodDescriptor::new("push", |_o: Arc<Overloaded>, _x: String| async move {
                    Ok::<_, String>(())
                }),
            ]
        }
    }

    /// The same overloads, disambiguated by renaming one of them.
    struct Disambiguated;

    impl ServiceInterface for Disambiguated {
        const NAME: &'static str = "overloaded";

        fn methods() -> Vec<MethodDescriptor<Self>> {
            vec![
                MethodDescriptor::new("push", |_d: Arc<Disambiguated>, _x: i64| async move {
                    Ok::<_, String>(())
                }),
                MethodDescriptor::new("push", |_d: Arc<Disambiguated>, _x: String| async move {
                    Ok::<_, String>(())
                })
                .rename("pushText"),
                MethodDescriptor::new("stats", |_d: Arc<Disambiguated>| async move {
                    Ok::<_, String>(1)
                })
                .service("diagnostics"),
            ]
        }
    }

    /// Shares `metrics.count` with [`Metrics`].
    struct Rival;

    impl ServiceInterface for Rival {
        const NAME: &'static str = "rival";

        fn methods() -> Vec<MethodDescriptor<Self>> {
            vec![
                MethodDescriptor::new("hello", |_r: Arc<Rival>| async move {
                    Ok::<_, String>("hi")
                }),
                MethodDescriptor::new("count", |_r: Arc<Rival>| async move {
                    Ok::<_, String>(7)
                })
                .service("metrics"),
            ]
        }
    }

    struct Empty;

    impl ServiceInterface for Empty {
        const NAME: &'static str = "empty";

        fn methods() -> Vec<MethodDescriptor<Self>> {
            Vec::new()
        }
    }

    #[tokio::test]
    async fn test_register_and_lookup() {
        let registry = ServiceRegistry::new();
        assert_eq!(registry.register(Arc::new(Metrics)).unwrap(), 2);
        assert_eq!(registry.len(), 2);

        let push = registry.lookup("metrics", "push").unwrap();
        assert_eq!(push.parameter_count(), 1);
        let result = push.invoke(vec![json!([1.0, 2.0, 3.0])]).await.unwrap();
        assert_eq!(result, json!(3));

        assert!(registry.lookup("metrics", "pull").is_none());
    }

    #[test]
    fn test_same_instance_is_idempotent() {
        let registry = ServiceRegistry::new();
        let metrics = Arc::new(Metrics);
        assert_eq!(registry.register(metrics.clone()).unwrap(), 2);
        assert_eq!(registry.register(metrics).unwrap(), 0);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_second_instance_conflicts() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(Metrics)).unwrap();
        let err = registry.register(Arc::new(Metrics)).unwrap_err();
        assert!(matches!(err, TetherError::DuplicateService { .. }));
    }

    #[test]
    fn test_ambiguous_overloads_rejected() {
        let registry = ServiceRegistry::new();
        let err = registry.register(Arc::new(Overloaded)).unwrap_err();
        match err {
            TetherError::DuplicateService { service, method } => {
                assert_eq!(service, "overloaded");
                assert_eq!(method, "push");
            }
            other => panic!("Expected DuplicateService, got: {:?}", other),
        }
        assert!(registry.is_empty());
    }

    #[test]
    fn test_overrides_disambiguate() {
        let registry = ServiceRegistry::new();
        assert_eq!(registry.register(Arc::new(Disambiguated)).unwrap(), 3);
        assert_eq!(
            registry.endpoints(),
            vec![
                ("diagnostics".to_string(), "stats".to_string()),
                ("overloaded".to_string(), "push".to_string()),
                ("overloaded".to_string(), "pushText".to_string()),
            ]
        );
    }

    #[test]
    fn test_conflicting_registration_binds_nothing() {
        let registry = ServiceRegistry::new();
        registry.register(Arc::new(Metrics)).unwrap();

        let err = registry.register(Arc::new(Rival)).unwrap_err();
        assert!(matches!(err, TetherError::DuplicateService { ref method, .. } if method == "count"));
        assert!(!registry.contains("rival", "hello"));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_empty_interface_rejected() {
        let registry = ServiceRegistry::new();
        let err = registry.register(Arc::new(Empty)).unwrap_err();
        assert!(matches!(err, TetherError::ServiceRegistration { .. }));
    }
}
