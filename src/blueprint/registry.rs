//! Blueprint registries and hydration
//!
//! Declarations and behavior facets register separately, keyed by the
//! same [`BlueprintId`]; the [`BlueprintHydrator`] fuses them on demand
//! and caches the result. Registries are explicit values passed through
//! the composition root, never ambient singletons, and follow
//! the lifecycle `init → mutate during setup → frozen before hub start`.

use super::behavior::{BehaviorFacet, ExecutableDeviceBlueprint};
use super::declaration::{BlueprintDeclaration, BlueprintId};
use crate::error::DeviceError;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

/// Declaration lookup.
pub trait BlueprintRegistry: Send + Sync {
    /// Find a declaration by id.
    fn find_by_id(&self, id: &BlueprintId) -> Option<Arc<BlueprintDeclaration>>;
}

/// Behavior facet lookup.
pub trait BlueprintBehaviorRegistry: Send + Sync {
    /// Every facet registered for a blueprint.
    fn find_facets(&self, id: &BlueprintId) -> Vec<BehaviorFacet>;
}

/// Executable blueprint resolution, as consumed by the hub at attach
/// time.
#[async_trait]
pub trait BlueprintProvider: Send + Sync {
    /// Resolve an executable blueprint.
    async fn provide(&self, id: &BlueprintId) -> Result<Arc<ExecutableDeviceBlueprint>, DeviceError>;
}

/// In-memory declaration registry.
#[derive(Default)]
pub struct InMemoryBlueprintRegistry {
    declarations: RwLock<HashMap<BlueprintId, Arc<BlueprintDeclaration>>>,
    frozen: AtomicBool,
}

impl InMemoryBlueprintRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a declaration. Re-registering an id replaces the entry;
    /// the schema version must not regress against the one it replaces.
    pub fn register(&self, declaration: BlueprintDeclaration) -> Result<(), DeviceError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(DeviceError::Internal("blueprint registry is frozen".into()));
        }
        let mut declarations = self.declarations.write().expect("registry lock poisoned");
        if let Some(previous) = declarations.get(&declaration.id) {
            crate::validation::validate_schema_progression(previous, &declaration)
                .map_err(|issue| DeviceError::Validation(issue.to_string()))?;
        }
        declarations.insert(declaration.id.clone(), Arc::new(declaration));
        Ok(())
    }

    /// Forbid further registration.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }
}

impl BlueprintRegistry for InMemoryBlueprintRegistry {
    fn find_by_id(&self, id: &BlueprintId) -> Option<Arc<BlueprintDeclaration>> {
        self.declarations
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
    }
}

/// In-memory behavior registry.
#[derive(Default)]
pub struct InMemoryBehaviorRegistry {
    facets: RwLock<HashMap<BlueprintId, Vec<BehaviorFacet>>>,
    frozen: AtomicBool,
}

impl InMemoryBehaviorRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a facet for a blueprint.
    pub fn register(&self, id: BlueprintId, facet: BehaviorFacet) -> Result<(), DeviceError> {
        if self.frozen.load(Ordering::SeqCst) {
            return Err(DeviceError::Internal("behavior registry is frozen".into()));
        }
        self.facets
            .write()
            .expect("registry lock poisoned")
            .entry(id)
            .or_default()
            .push(facet);
        Ok(())
    }

    /// Forbid further registration.
    pub fn freeze(&self) {
        self.frozen.store(true, Ordering::SeqCst);
    }
}

impl BlueprintBehaviorRegistry for InMemoryBehaviorRegistry {
    fn find_facets(&self, id: &BlueprintId) -> Vec<BehaviorFacet> {
        self.facets
            .read()
            .expect("registry lock poisoned")
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

/// Fuses declarations with facets, caching the executable result.
pub struct BlueprintHydrator {
    declarations: Arc<dyn BlueprintRegistry>,
    behaviors: Arc<dyn BlueprintBehaviorRegistry>,
    cache: RwLock<HashMap<BlueprintId, Arc<ExecutableDeviceBlueprint>>>,
}

impl BlueprintHydrator {
    /// Hydrator over a pair of registries.
    pub fn new(
        declarations: Arc<dyn BlueprintRegistry>,
        behaviors: Arc<dyn BlueprintBehaviorRegistry>,
    ) -> Self {
        Self {
            declarations,
            behaviors,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Resolve and fuse a blueprint. A missing declaration or driver is
    /// fatal; missing optional facets hydrate as absent fields.
    pub fn hydrate(&self, id: &BlueprintId) -> Result<Arc<ExecutableDeviceBlueprint>, DeviceError> {
        if let Some(hit) = self.cache.read().expect("cache lock poisoned").get(id) {
            return Ok(hit.clone());
        }
        let declaration = self
            .declarations
            .find_by_id(id)
            .ok_or_else(|| DeviceError::not_found("blueprint", id))?;
        let facets = self.behaviors.find_facets(id);
        let executable = Arc::new(ExecutableDeviceBlueprint::fuse(declaration, facets)?);
        self.cache
            .write()
            .expect("cache lock poisoned")
            .insert(id.clone(), executable.clone());
        Ok(executable)
    }
}

#[async_trait]
impl BlueprintProvider for BlueprintHydrator {
    async fn provide(&self, id: &BlueprintId) -> Result<Arc<ExecutableDeviceBlueprint>, DeviceError> {
        self.hydrate(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blueprint::behavior::{DeviceDriver, DeviceLogic, DriverContext};
    use crate::blueprint::builder::BlueprintBuilder;

    struct NullDriver;

    #[async_trait]
    impl DeviceDriver for NullDriver {
        async fn create(&self, _context: DriverContext) -> Result<DeviceLogic, DeviceError> {
            Ok(DeviceLogic::new())
        }
    }

    fn declaration() -> BlueprintDeclaration {
        BlueprintBuilder::new("test.device", "1.0.0").build().unwrap()
    }

    fn declaration_at(schema_version: u32) -> BlueprintDeclaration {
        BlueprintBuilder::new("test.device", "1.0.0")
            .schema_version(schema_version)
            .build()
            .unwrap()
    }

    #[test]
    fn test_hydrate_requires_declaration() {
        let hydrator = BlueprintHydrator::new(
            Arc::new(InMemoryBlueprintRegistry::new()),
            Arc::new(InMemoryBehaviorRegistry::new()),
        );
        let err = hydrator.hydrate(&"missing.device".into()).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound { .. }));
    }

    #[test]
    fn test_hydrate_requires_driver() {
        let registry = InMemoryBlueprintRegistry::new();
        registry.register(declaration()).unwrap();
        let hydrator = BlueprintHydrator::new(
            Arc::new(registry),
            Arc::new(InMemoryBehaviorRegistry::new()),
        );
        let err = hydrator.hydrate(&"test.device".into()).unwrap_err();
        assert!(matches!(err, DeviceError::NotFound { .. }));
    }

    #[test]
    fn test_hydrate_fuses_and_caches() {
        let registry = InMemoryBlueprintRegistry::new();
        registry.register(declaration()).unwrap();
        let behaviors = InMemoryBehaviorRegistry::new();
        behaviors
            .register("test.device".into(), BehaviorFacet::Driver(Arc::new(NullDriver)))
            .unwrap();
        let hydrator = BlueprintHydrator::new(Arc::new(registry), Arc::new(behaviors));
        let first = hydrator.hydrate(&"test.device".into()).unwrap();
        let second = hydrator.hydrate(&"test.device".into()).unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_schema_version_must_not_regress() {
        let registry = InMemoryBlueprintRegistry::new();
        registry.register(declaration_at(2)).unwrap();
        // same and higher versions replace the entry
        registry.register(declaration_at(2)).unwrap();
        registry.register(declaration_at(3)).unwrap();

        let err = registry.register(declaration_at(1)).unwrap_err();
        assert!(matches!(err, DeviceError::Validation(_)));
        // the accepted entry is untouched
        let kept = registry.find_by_id(&"test.device".into()).unwrap();
        assert_eq!(kept.schema_version, 3);
    }

    #[test]
    fn test_frozen_registries_reject() {
        let registry = InMemoryBlueprintRegistry::new();
        registry.freeze();
        assert!(registry.register(declaration()).is_err());

        let behaviors = InMemoryBehaviorRegistry::new();
        behaviors.freeze();
        assert!(behaviors
            .register("test.device".into(), BehaviorFacet::Driver(Arc::new(NullDriver)))
            .is_err());
    }
}
