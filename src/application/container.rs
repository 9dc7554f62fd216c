//! # Service Container
//!
//! Explicit dependency-injection container. Every service is registered with a factory and a
//! lifespan; resolution is scoped by conversation id.
//!
//! - `Singleton`: one instance for the whole process.
//! - `Scoped`: one instance per (type, conversation).
//! - `Transient`: a fresh instance on every resolution.
//!
//! Factories resolve their own dependencies through the [`Resolver`] they receive, which tracks
//! the active resolution stack and rejects cycles.

use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::domain::errors::ContainerError;
use crate::domain::types::ChatId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifespan {
    Singleton,
    Scoped,
    Transient,
}

type Instance = Arc<dyn Any + Send + Sync>;
type Factory = Arc<dyn Fn(&mut Resolver<'_>) -> Result<Instance, ContainerError> + Send + Sync>;

/// A registered service. Immutable once the container is built.
pub struct ServiceDefinition {
    name: &'static str,
    lifespan: Lifespan,
    factory: Factory,
}

impl ServiceDefinition {
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn lifespan(&self) -> Lifespan {
        self.lifespan
    }
}

#[derive(Default)]
pub struct ServiceContainer {
    definitions: HashMap<TypeId, ServiceDefinition>,
    singletons: Mutex<HashMap<TypeId, Instance>>,
    scoped: Mutex<HashMap<(TypeId, ChatId), Instance>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ServiceContainer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `T` (usually an `Arc<Service>` or `Arc<dyn Trait>`) with the factory that builds it.
    /// The first registration of a type wins; later ones are ignored.
    pub fn register<T, F>(&mut self, lifespan: Lifespan, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        let id = TypeId::of::<T>();
        if let Some(existing) = self.definitions.get(&id) {
            tracing::warn!(
                "Service {} already registered as {:?}, ignoring re-registration",
                existing.name,
                existing.lifespan
            );
            return self;
        }
        let factory: Factory = Arc::new(move |resolver| {
            factory(resolver).map(|value| Arc::new(value) as Instance)
        });
        self.definitions.insert(
            id,
            ServiceDefinition {
                name: type_name::<T>(),
                lifespan,
                factory,
            },
        );
        self
    }

    pub fn add_singleton<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.register(Lifespan::Singleton, factory)
    }

    pub fn add_scoped<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.register(Lifespan::Scoped, factory)
    }

    pub fn add_transient<T, F>(&mut self, factory: F) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
        F: Fn(&mut Resolver<'_>) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        self.register(Lifespan::Transient, factory)
    }

    /// Registers an already-built value as a singleton.
    pub fn add_instance<T>(&mut self, value: T) -> &mut Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.register(Lifespan::Singleton, move |_| Ok(value.clone()))
    }

    pub fn is_registered<T: 'static>(&self) -> bool {
        self.definitions.contains_key(&TypeId::of::<T>())
    }

    pub fn definition<T: 'static>(&self) -> Option<&ServiceDefinition> {
        self.definitions.get(&TypeId::of::<T>())
    }

    pub fn resolve<T>(&self, scope: ChatId) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        Resolver::new(self, scope).resolve::<T>()
    }

    /// Drops every Scoped instance cached for `scope`.
    pub fn release_scope(&self, scope: ChatId) {
        lock(&self.scoped).retain(|(_, owner), _| *owner != scope);
    }

    /// Number of Scoped instances currently cached for `scope`.
    pub fn scoped_count(&self, scope: ChatId) -> usize {
        lock(&self.scoped)
            .keys()
            .filter(|(_, owner)| *owner == scope)
            .count()
    }
}

/// Resolution state for one top-level `resolve` call.
pub struct Resolver<'a> {
    container: &'a ServiceContainer,
    scope: ChatId,
    stack: Vec<(TypeId, &'static str)>,
}

impl<'a> Resolver<'a> {
    fn new(container: &'a ServiceContainer, scope: ChatId) -> Self {
        Self {
            container,
            scope,
            stack: Vec::new(),
        }
    }

    pub fn scope(&self) -> ChatId {
        self.scope
    }

    pub fn resolve<T>(&mut self) -> Result<T, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        let name = type_name::<T>();
        let instance = self.resolve_instance(TypeId::of::<T>(), name)?;
        instance
            .downcast_ref::<T>()
            .cloned()
            .ok_or(ContainerError::TypeMismatch(name))
    }

    /// Resolves `T` if registered, `None` otherwise. Cycles still fail.
    pub fn resolve_optional<T>(&mut self) -> Result<Option<T>, ContainerError>
    where
        T: Clone + Send + Sync + 'static,
    {
        if !self.container.is_registered::<T>() {
            tracing::debug!("Skipping unregistered optional dependency {}", type_name::<T>());
            return Ok(None);
        }
        self.resolve::<T>().map(Some)
    }

    fn resolve_instance(
        &mut self,
        id: TypeId,
        name: &'static str,
    ) -> Result<Instance, ContainerError> {
        let container = self.container;
        let definition = container
            .definitions
            .get(&id)
            .ok_or(ContainerError::Unregistered(name))?;

        if self.stack.iter().any(|(seen, _)| *seen == id) {
            let mut chain: Vec<&'static str> = self.stack.iter().map(|(_, n)| *n).collect();
            chain.push(name);
            return Err(ContainerError::Cyclic(chain));
        }

        let cached = match definition.lifespan {
            Lifespan::Singleton => lock(&container.singletons).get(&id).cloned(),
            Lifespan::Scoped => lock(&container.scoped).get(&(id, self.scope)).cloned(),
            Lifespan::Transient => None,
        };
        if let Some(instance) = cached {
            return Ok(instance);
        }

        self.stack.push((id, name));
        let built = (definition.factory)(self);
        self.stack.pop();
        let built = built?;

        // A concurrent resolution may have won the race; keep whichever landed first.
        let instance = match definition.lifespan {
            Lifespan::Singleton => lock(&container.singletons)
                .entry(id)
                .or_insert(built)
                .clone(),
            Lifespan::Scoped => lock(&container.scoped)
                .entry((id, self.scope))
                .or_insert(built)
                .clone(),
            Lifespan::Transient => built,
        };
        tracing::trace!("Resolved {} ({:?}) for scope {}", name, definition.lifespan, self.scope);
        Ok(instance)
    }
}
