use std::any::{Any, TypeId};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::lock::Mutex as AsyncMutex;
use parking_lot::Mutex;

use crate::error::{BootError, LogError};
use crate::util::short_name;

/// Identity of a capability contract: the `TypeId` of the handle type that
/// dependents receive (e.g. `Arc<dyn Config>`), plus a display name for
/// diagnostics.
#[derive(Clone, Debug)]
pub struct Contract {
    id: TypeId,
    name: String,
}

impl Contract {
    pub fn of<S: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<S>(),
            name: short_name::<S>(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

type ArcInstance = Arc<dyn Any + Send + Sync>;
type BuildFn =
    Box<dyn FnOnce(Deps, Lifecycle) -> BoxFuture<'static, anyhow::Result<ArcInstance>> + Send>;
type HookFn = Box<dyn FnOnce() -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// A service definition: the contract it provides, the contracts it needs,
/// and an async constructor that receives those dependencies plus a
/// [`Lifecycle`] handle for registering start/stop hooks.
///
/// ```
/// use std::sync::Arc;
/// use svc_bootstrap::container::ServiceDescriptor;
///
/// let descriptor = ServiceDescriptor::provide::<Arc<String>>()
///     .build(|_, _| async { Ok(Arc::new("ready".to_string())) });
/// assert_eq!(descriptor.contract().name(), "Arc<String>");
/// ```
pub struct ServiceDescriptor {
    contract: Contract,
    dependencies: Vec<Contract>,
    build: BuildFn,
}

impl ServiceDescriptor {
    /// Begin describing a service by the handle type it provides.
    pub fn provide<S: Clone + Send + Sync + 'static>() -> DescriptorBuilder<S> {
        DescriptorBuilder {
            dependencies: vec![],
            _provides: PhantomData,
        }
    }

    pub fn contract(&self) -> &Contract {
        &self.contract
    }

    pub fn dependencies(&self) -> &[Contract] {
        &self.dependencies
    }
}

pub struct DescriptorBuilder<S> {
    dependencies: Vec<Contract>,
    _provides: PhantomData<fn() -> S>,
}

impl<S: Clone + Send + Sync + 'static> DescriptorBuilder<S> {
    /// Declare a dependency on another contract. The dependency must be
    /// registered (or primitive, i.e. dependency-free) by the time this
    /// service is resolved, and it is constructed first.
    pub fn depends_on<D: Clone + Send + Sync + 'static>(mut self) -> Self {
        self.dependencies.push(Contract::of::<D>());
        self
    }

    pub fn build<F, Fut>(self, construct: F) -> ServiceDescriptor
    where
        F: FnOnce(Deps, Lifecycle) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<S>> + Send + 'static,
    {
        ServiceDescriptor {
            contract: Contract::of::<S>(),
            dependencies: self.dependencies,
            build: Box::new(
                move |deps, lifecycle| -> BoxFuture<'static, anyhow::Result<ArcInstance>> {
                    Box::pin(async move {
                        construct(deps, lifecycle)
                            .await
                            .map(|service| Arc::new(service) as ArcInstance)
                    })
                },
            ),
        }
    }
}

/// The declared dependencies of a service, handed to its constructor as an
/// owned view. Constructors can only reach what they declared with
/// [`DescriptorBuilder::depends_on`]; anything else is an unresolved
/// dependency.
pub struct Deps {
    owner: Contract,
    instances: HashMap<TypeId, ArcInstance>,
}

impl Deps {
    pub fn get<D: Clone + Send + Sync + 'static>(&self) -> Result<D, BootError> {
        let contract = Contract::of::<D>();
        self.instances
            .get(&contract.id)
            .and_then(|instance| instance.downcast_ref::<D>())
            .cloned()
            .ok_or_else(|| BootError::UnresolvedDependency {
                contract: contract.name,
                required_by: Some(self.owner.name.clone()),
            })
    }
}

struct Hook {
    service: String,
    on_start: Option<HookFn>,
    on_stop: Option<HookFn>,
}

/// Handle through which a constructor appends lifecycle hooks for the
/// service being built. Hooks are recorded in construction order, which is
/// dependency order; stop hooks run in exact reverse.
#[derive(Clone)]
pub struct Lifecycle {
    service: String,
    hooks: Arc<Mutex<Vec<Hook>>>,
}

impl Lifecycle {
    pub fn on_start<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.lock().push(Hook {
            service: self.service.clone(),
            on_start: Some(Box::new(
                move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(hook()) },
            )),
            on_stop: None,
        });
    }

    pub fn on_stop<F, Fut>(&self, hook: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.hooks.lock().push(Hook {
            service: self.service.clone(),
            on_start: None,
            on_stop: Some(Box::new(
                move || -> BoxFuture<'static, anyhow::Result<()>> { Box::pin(hook()) },
            )),
        });
    }
}

struct RegistryState {
    metas: Vec<(Contract, Vec<Contract>)>,
    builds: Vec<Option<BuildFn>>,
    index: HashMap<TypeId, usize>,
}

#[derive(Default)]
struct StartState {
    begun: bool,
    completed: usize,
}

/// The composition root: holds service descriptors, constructs each contract
/// lazily and at most once (singleton semantics), and owns the ordered
/// start/stop sequence.
///
/// Construction order is a topological sort of the declared dependency
/// graph with ties broken by registration order, so builds are
/// deterministic and reproducible.
pub struct Container {
    registry: Mutex<RegistryState>,
    instances: Mutex<HashMap<TypeId, ArcInstance>>,
    /// Contracts whose constructors are on the current call chain.
    resolving: Mutex<Vec<Contract>>,
    hooks: Arc<Mutex<Vec<Hook>>>,
    started: Mutex<StartState>,
    /// Serializes construction so each constructor runs exactly once.
    build_lock: AsyncMutex<()>,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    pub fn new() -> Self {
        Self {
            registry: Mutex::new(RegistryState {
                metas: vec![],
                builds: vec![],
                index: HashMap::new(),
            }),
            instances: Mutex::new(HashMap::new()),
            resolving: Mutex::new(vec![]),
            hooks: Arc::new(Mutex::new(vec![])),
            started: Mutex::new(StartState::default()),
            build_lock: AsyncMutex::new(()),
        }
    }

    /// Add a service definition. Must happen before the contract is resolved.
    pub fn register(&self, descriptor: ServiceDescriptor) -> Result<(), BootError> {
        let ServiceDescriptor {
            contract,
            dependencies,
            build,
        } = descriptor;
        let mut registry = self.registry.lock();
        if registry.index.contains_key(&contract.id) {
            return Err(BootError::DuplicateRegistration(contract.name));
        }
        let idx = registry.metas.len();
        registry.index.insert(contract.id, idx);
        registry.metas.push((contract, dependencies));
        registry.builds.push(Some(build));
        Ok(())
    }

    /// The singleton handle for a contract, constructing it and any
    /// unconstructed transitive dependencies on first use.
    pub async fn resolve<S: Clone + Send + Sync + 'static>(&self) -> Result<S, BootError> {
        let contract = Contract::of::<S>();
        if let Some(existing) = self.get_if_constructed::<S>() {
            return Ok(existing);
        }
        self.check_not_resolving(&contract)?;
        let _guard = self.build_lock.lock().await;
        if let Some(existing) = self.get_if_constructed::<S>() {
            return Ok(existing);
        }
        let order = self.construction_order(std::slice::from_ref(&contract))?;
        self.construct(order).await?;
        self.get_if_constructed::<S>()
            .ok_or_else(|| BootError::UnresolvedDependency {
                contract: contract.name,
                required_by: None,
            })
    }

    /// The already-constructed handle for a contract, if any. Never triggers
    /// construction.
    pub fn get_if_constructed<S: Clone + Send + Sync + 'static>(&self) -> Option<S> {
        self.instances
            .lock()
            .get(&TypeId::of::<S>())
            .and_then(|instance| instance.downcast_ref::<S>())
            .cloned()
    }

    /// The deterministic construction order of every registered contract,
    /// by name. Computes the full topological sort without constructing
    /// anything.
    pub fn plan(&self) -> Result<Vec<String>, BootError> {
        let roots = self.registered_contracts();
        let order = self.construction_order(&roots)?;
        let registry = self.registry.lock();
        Ok(order
            .into_iter()
            .map(|idx| registry.metas[idx].0.name.clone())
            .collect())
    }

    /// Construct every registered service, then run start hooks in
    /// dependency order. The first failing hook aborts the sequence and the
    /// error propagates; services that already started are left running for
    /// the caller to tear down the process (fail-fast boot policy).
    ///
    /// Hooks run exactly once: a second call is an error.
    pub async fn start(&self) -> Result<(), BootError> {
        {
            let mut started = self.started.lock();
            if started.begun {
                return Err(BootError::AlreadyStarted);
            }
            started.begun = true;
        }
        {
            let _guard = self.build_lock.lock().await;
            let roots = self.registered_contracts();
            let order = self.construction_order(&roots)?;
            self.construct(order).await?;
        }
        let total = self.hooks.lock().len();
        for i in 0..total {
            let (service, on_start) = {
                let mut hooks = self.hooks.lock();
                (hooks[i].service.clone(), hooks[i].on_start.take())
            };
            if let Some(hook) = on_start {
                tracing::info!("starting {service}");
                hook().await.map_err(|source| BootError::StartHook {
                    contract: service,
                    source: source.into(),
                })?;
            }
            self.started.lock().completed = i + 1;
        }
        Ok(())
    }

    /// Run stop hooks in the exact reverse order of successful starts. A
    /// failing stop hook is logged and the teardown continues, so
    /// earlier-started services still get to release their resources.
    pub async fn stop(&self) {
        let completed = {
            let mut started = self.started.lock();
            std::mem::take(&mut started.completed)
        };
        for i in (0..completed).rev() {
            let (service, on_stop) = {
                let mut hooks = self.hooks.lock();
                (hooks[i].service.clone(), hooks[i].on_stop.take())
            };
            if let Some(hook) = on_stop {
                tracing::info!("stopping {service}");
                hook()
                    .await
                    .log_with_context(|| format!("stop hook of '{service}' failed"));
            }
        }
    }

    fn registered_contracts(&self) -> Vec<Contract> {
        self.registry
            .lock()
            .metas
            .iter()
            .map(|(contract, _)| contract.clone())
            .collect()
    }

    fn check_not_resolving(&self, contract: &Contract) -> Result<(), BootError> {
        let resolving = self.resolving.lock();
        if resolving.iter().any(|c| c.id == contract.id) {
            let chain = resolving
                .iter()
                .map(|c| c.name.as_str())
                .chain(std::iter::once(contract.name.as_str()))
                .collect::<Vec<_>>()
                .join(" -> ");
            return Err(BootError::CyclicDependency(chain));
        }
        Ok(())
    }

    /// Topological sort of the dependency closure of `roots`, ties broken by
    /// registration order. Returns descriptor indices, dependencies first.
    fn construction_order(&self, roots: &[Contract]) -> Result<Vec<usize>, BootError> {
        let registry = self.registry.lock();

        // Gather the transitive closure, failing on unregistered contracts.
        let mut needed: Vec<usize> = vec![];
        let mut seen: HashSet<TypeId> = HashSet::new();
        let mut pending: Vec<(Contract, Option<String>)> =
            roots.iter().map(|c| (c.clone(), None)).collect();
        while let Some((contract, required_by)) = pending.pop() {
            if !seen.insert(contract.id) {
                continue;
            }
            let idx = *registry.index.get(&contract.id).ok_or_else(|| {
                BootError::UnresolvedDependency {
                    contract: contract.name.clone(),
                    required_by,
                }
            })?;
            needed.push(idx);
            let (owner, dependencies) = &registry.metas[idx];
            for dependency in dependencies {
                pending.push((dependency.clone(), Some(owner.name.clone())));
            }
        }
        needed.sort_unstable();

        // Kahn's algorithm, always picking the lowest registration index
        // among the ready contracts.
        let mut order: Vec<usize> = Vec::with_capacity(needed.len());
        let mut placed: HashSet<TypeId> = HashSet::new();
        let mut remaining = needed;
        while !remaining.is_empty() {
            let next = remaining.iter().position(|&idx| {
                registry.metas[idx]
                    .1
                    .iter()
                    .all(|dependency| placed.contains(&dependency.id))
            });
            match next {
                Some(pos) => {
                    let idx = remaining.remove(pos);
                    placed.insert(registry.metas[idx].0.id);
                    order.push(idx);
                }
                None => {
                    let stuck = remaining
                        .iter()
                        .map(|&idx| registry.metas[idx].0.name.as_str())
                        .collect::<Vec<_>>()
                        .join(" -> ");
                    return Err(BootError::CyclicDependency(stuck));
                }
            }
        }
        Ok(order)
    }

    /// Run the constructors for `order`, skipping contracts that already
    /// have an instance. Caller must hold `build_lock`.
    async fn construct(&self, order: Vec<usize>) -> Result<(), BootError> {
        for idx in order {
            let (contract, dependencies) = {
                let registry = self.registry.lock();
                registry.metas[idx].clone()
            };
            if self.instances.lock().contains_key(&contract.id) {
                continue;
            }

            let mut dep_instances = HashMap::new();
            {
                let instances = self.instances.lock();
                for dependency in &dependencies {
                    let instance = instances.get(&dependency.id).cloned().ok_or_else(|| {
                        BootError::UnresolvedDependency {
                            contract: dependency.name.clone(),
                            required_by: Some(contract.name.clone()),
                        }
                    })?;
                    dep_instances.insert(dependency.id, instance);
                }
            }

            let build = { self.registry.lock().builds[idx].take() }.ok_or_else(|| {
                BootError::Construction {
                    contract: contract.name.clone(),
                    source: "constructor was consumed by a previously failed attempt".into(),
                }
            })?;

            let deps = Deps {
                owner: contract.clone(),
                instances: dep_instances,
            };
            let lifecycle = Lifecycle {
                service: contract.name.clone(),
                hooks: self.hooks.clone(),
            };

            self.resolving.lock().push(contract.clone());
            let result = build(deps, lifecycle).await;
            self.resolving.lock().pop();

            let instance = result.map_err(|source| BootError::Construction {
                contract: contract.name.clone(),
                source: source.into(),
            })?;
            tracing::debug!("constructed singleton for contract {}", contract.name);
            self.instances.lock().insert(contract.id, instance);
        }
        Ok(())
    }
}
