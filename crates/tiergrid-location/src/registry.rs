//! Location registry — creates and destroys dynamic locations keyed by owner.
//!
//! Location ids are derived from the parent id and the owner id, so a
//! second creation for the same owner always collides with the first.
//! Deletion is idempotent and cascades to child locations.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use tiergrid_core::{EntityId, Flags, LocationId};

use crate::error::{LocationError, LocationResult};

/// What kind of entity a location represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocationKind {
    Pool,
    Machine,
    Container,
}

/// A registered handle for a live physical resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicLocation {
    pub id: LocationId,
    pub kind: LocationKind,
    /// Owning entity. Lookup only.
    pub owner: EntityId,
    pub parent: Option<LocationId>,
    /// Physical address of the backing host, if known.
    pub address: Option<String>,
    pub config: Flags,
    pub created_at: u64,
}

/// Arguments to [`LocationRegistry::create_location`].
#[derive(Debug, Clone)]
pub struct LocationSpec {
    pub owner: EntityId,
    pub kind: LocationKind,
    pub address: Option<String>,
    pub parent: Option<LocationId>,
    pub config: Flags,
}

/// Capability of entities that may be backed by a dynamic location.
pub trait DynamicallyLocated {
    /// Id under which the entity owns its location.
    fn entity_id(&self) -> &str;

    /// The entity's live location, if one is registered.
    fn dynamic_location(&self, registry: &LocationRegistry) -> Option<DynamicLocation> {
        registry.lookup(self.entity_id())
    }
}

#[derive(Default)]
struct RegistryInner {
    /// Registered locations by id.
    managed: HashMap<LocationId, DynamicLocation>,
    /// Each owner's dynamic-location attribute.
    attributes: HashMap<EntityId, LocationId>,
    /// Persisted location-name record per owner.
    names: HashMap<EntityId, String>,
}

/// Management-wide registry of dynamic locations.
///
/// Cheap to clone; all clones share state.
#[derive(Clone)]
pub struct LocationRegistry {
    prefix: String,
    inner: Arc<RwLock<RegistryInner>>,
}

impl LocationRegistry {
    /// Create an empty registry. Root locations are named `{prefix}{owner}`.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            inner: Arc::new(RwLock::new(RegistryInner::default())),
        }
    }

    /// Register a location for `spec.owner` and set the owner's attribute.
    ///
    /// Fails with `AlreadyExists` while the owner has a live location.
    pub fn create_location(&self, spec: LocationSpec) -> LocationResult<DynamicLocation> {
        let mut inner = self.write();

        if let Some(existing) = inner.attributes.get(&spec.owner).cloned() {
            if inner.managed.contains_key(&existing) {
                return Err(LocationError::AlreadyExists {
                    owner: spec.owner,
                    location: existing,
                });
            }
            warn!(
                owner = %spec.owner,
                location = %existing,
                "location inconsistency: attribute set for unregistered location, clearing"
            );
            inner.attributes.remove(&spec.owner);
            inner.names.remove(&spec.owner);
        }

        let id = match &spec.parent {
            Some(parent) => {
                if !inner.managed.contains_key(parent) {
                    return Err(LocationError::ParentNotFound(parent.clone()));
                }
                format!("{parent}-{}", spec.owner)
            }
            None => format!("{}{}", self.prefix, spec.owner),
        };

        if inner.managed.contains_key(&id) {
            return Err(LocationError::DuplicateName(id));
        }

        let location = DynamicLocation {
            id: id.clone(),
            kind: spec.kind,
            owner: spec.owner.clone(),
            parent: spec.parent,
            address: spec.address,
            config: spec.config,
            created_at: epoch_secs(),
        };

        inner.managed.insert(id.clone(), location.clone());
        inner.attributes.insert(spec.owner.clone(), id.clone());
        inner.names.insert(spec.owner.clone(), id.clone());

        debug!(owner = %spec.owner, location = %id, kind = ?location.kind, "location created");
        Ok(location)
    }

    /// Unregister the owner's location and clear its attribute.
    ///
    /// Returns the removed location, or `None` if there was nothing to
    /// remove. Calling it twice is a no-op the second time. Child
    /// locations are unregistered too.
    pub fn delete_location(&self, owner: &str) -> Option<DynamicLocation> {
        let mut inner = self.write();

        let attribute = inner.attributes.remove(owner);
        inner.names.remove(owner);

        let removed = match attribute {
            Some(id) => {
                let removed = inner.managed.remove(&id);
                if removed.is_none() {
                    warn!(
                        %owner,
                        location = %id,
                        "location inconsistency: attribute set for unregistered location, cleared"
                    );
                }
                removed
            }
            None => {
                // A registered location whose owner lost its attribute.
                let orphan = inner
                    .managed
                    .values()
                    .find(|l| l.owner == owner)
                    .map(|l| l.id.clone());
                orphan.and_then(|id| {
                    warn!(
                        %owner,
                        location = %id,
                        "location inconsistency: registered location without owner attribute, unregistering"
                    );
                    inner.managed.remove(&id)
                })
            }
        };

        if let Some(location) = &removed {
            let cascaded = remove_descendants(&mut inner, &location.id);
            info!(
                %owner,
                location = %location.id,
                children = cascaded,
                "location deleted"
            );
        }

        removed
    }

    /// The owner's live location, resolved through its attribute.
    pub fn lookup(&self, owner: &str) -> Option<DynamicLocation> {
        let inner = self.read();
        inner
            .attributes
            .get(owner)
            .and_then(|id| inner.managed.get(id))
            .cloned()
    }

    /// A registered location by id.
    pub fn get(&self, location: &str) -> Option<DynamicLocation> {
        self.read().managed.get(location).cloned()
    }

    /// Owner of a registered location.
    pub fn owner_of(&self, location: &str) -> Option<EntityId> {
        self.read().managed.get(location).map(|l| l.owner.clone())
    }

    /// The persisted location-name record for an owner.
    pub fn location_name(&self, owner: &str) -> Option<String> {
        self.read().names.get(owner).cloned()
    }

    pub fn is_managed(&self, location: &str) -> bool {
        self.read().managed.contains_key(location)
    }

    /// Direct children of a location, ordered by id.
    pub fn children(&self, location: &str) -> Vec<DynamicLocation> {
        let inner = self.read();
        let mut children: Vec<_> = inner
            .managed
            .values()
            .filter(|l| l.parent.as_deref() == Some(location))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.id.cmp(&b.id));
        children
    }

    pub fn len(&self) -> usize {
        self.read().managed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Report every disagreement between owner attributes and registered
    /// locations. Empty when consistent.
    pub fn check_consistency(&self) -> Vec<LocationError> {
        let inner = self.read();
        let mut problems = Vec::new();

        for (owner, id) in &inner.attributes {
            match inner.managed.get(id) {
                None => problems.push(LocationError::Inconsistent {
                    owner: owner.clone(),
                    detail: format!("attribute points to unregistered location {id}"),
                }),
                Some(l) if &l.owner != owner => problems.push(LocationError::Inconsistent {
                    owner: owner.clone(),
                    detail: format!("location {id} is owned by {}", l.owner),
                }),
                Some(_) => {}
            }
        }
        for location in inner.managed.values() {
            if inner.attributes.get(&location.owner) != Some(&location.id) {
                problems.push(LocationError::Inconsistent {
                    owner: location.owner.clone(),
                    detail: format!("location {} has no owner attribute", location.id),
                });
            }
        }
        problems
    }

    // ── Internal helpers ────────────────────────────────────────

    fn read(&self) -> RwLockReadGuard<'_, RegistryInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, RegistryInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Unregister all descendants of `root`, clearing their owners' attributes.
fn remove_descendants(inner: &mut RegistryInner, root: &str) -> usize {
    let mut pending = vec![root.to_string()];
    let mut removed = 0;

    while let Some(parent) = pending.pop() {
        let children: Vec<LocationId> = inner
            .managed
            .values()
            .filter(|l| l.parent.as_deref() == Some(parent.as_str()))
            .map(|l| l.id.clone())
            .collect();

        for id in children {
            if let Some(child) = inner.managed.remove(&id) {
                if inner.attributes.get(&child.owner) == Some(&child.id) {
                    inner.attributes.remove(&child.owner);
                    inner.names.remove(&child.owner);
                }
                removed += 1;
                pending.push(id);
            }
        }
    }
    removed
}

fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(owner: &str, kind: LocationKind, parent: Option<&str>) -> LocationSpec {
        LocationSpec {
            owner: owner.to_string(),
            kind,
            address: Some("10.0.0.1".to_string()),
            parent: parent.map(str::to_string),
            config: Flags::new(),
        }
    }

    fn registry_with_pool() -> (LocationRegistry, DynamicLocation) {
        let reg = LocationRegistry::new("tiergrid-");
        let root = reg
            .create_location(spec("pool1", LocationKind::Pool, None))
            .unwrap();
        (reg, root)
    }

    #[test]
    fn ids_derive_from_parent_and_owner() {
        let (reg, root) = registry_with_pool();
        assert_eq!(root.id, "tiergrid-pool1");

        let m = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        assert_eq!(m.id, "tiergrid-pool1-m1");

        let c = reg
            .create_location(spec("c1", LocationKind::Container, Some(&m.id)))
            .unwrap();
        assert_eq!(c.id, "tiergrid-pool1-m1-c1");
        assert_eq!(reg.owner_of(&c.id).as_deref(), Some("c1"));
        assert_eq!(reg.location_name("c1").as_deref(), Some("tiergrid-pool1-m1-c1"));
    }

    #[test]
    fn second_create_for_same_owner_fails() {
        let (reg, root) = registry_with_pool();
        reg.create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();

        let err = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap_err();
        assert_eq!(
            err,
            LocationError::AlreadyExists {
                owner: "m1".to_string(),
                location: "tiergrid-pool1-m1".to_string(),
            }
        );
    }

    #[test]
    fn missing_parent_is_rejected() {
        let reg = LocationRegistry::new("tiergrid-");
        let err = reg
            .create_location(spec("m1", LocationKind::Machine, Some("nope")))
            .unwrap_err();
        assert_eq!(err, LocationError::ParentNotFound("nope".to_string()));
        assert!(reg.lookup("m1").is_none());
    }

    #[test]
    fn delete_is_idempotent() {
        let (reg, root) = registry_with_pool();
        reg.create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();

        let first = reg.delete_location("m1");
        assert_eq!(first.map(|l| l.id).as_deref(), Some("tiergrid-pool1-m1"));
        assert!(reg.lookup("m1").is_none());
        assert!(reg.location_name("m1").is_none());

        assert!(reg.delete_location("m1").is_none());
        assert!(reg.delete_location("never-existed").is_none());
        assert!(reg.check_consistency().is_empty());
    }

    #[test]
    fn recreate_after_delete_reuses_id() {
        let (reg, root) = registry_with_pool();
        let a = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        reg.delete_location("m1");
        let b = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        assert_eq!(a.id, b.id);
    }

    #[test]
    fn delete_cascades_to_children() {
        let (reg, root) = registry_with_pool();
        let m = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        reg.create_location(spec("c1", LocationKind::Container, Some(&m.id)))
            .unwrap();
        reg.create_location(spec("c2", LocationKind::Container, Some(&m.id)))
            .unwrap();
        assert_eq!(reg.children(&m.id).len(), 2);

        reg.delete_location("pool1");
        assert!(reg.is_empty());
        assert!(reg.lookup("c1").is_none());
        assert!(reg.lookup("m1").is_none());
        assert!(reg.check_consistency().is_empty());

        // Owners of cascaded locations can delete again without effect.
        assert!(reg.delete_location("c2").is_none());
    }

    #[test]
    fn dangling_attribute_is_healed_on_delete() {
        let (reg, root) = registry_with_pool();
        let m = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        reg.write().managed.remove(&m.id);
        assert_eq!(reg.check_consistency().len(), 1);

        assert!(reg.delete_location("m1").is_none());
        assert!(reg.check_consistency().is_empty());
    }

    #[test]
    fn dangling_attribute_is_healed_on_create() {
        let (reg, root) = registry_with_pool();
        let m = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        reg.write().managed.remove(&m.id);

        let again = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        assert_eq!(again.id, m.id);
        assert!(reg.check_consistency().is_empty());
    }

    #[test]
    fn orphaned_location_is_unregistered_on_delete() {
        let (reg, root) = registry_with_pool();
        reg.create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        reg.write().attributes.remove("m1");
        assert!(reg.lookup("m1").is_none());

        let healed = reg.delete_location("m1");
        assert!(healed.is_some());
        assert!(!reg.is_managed("tiergrid-pool1-m1"));
        assert!(reg.check_consistency().is_empty());
    }

    #[test]
    fn orphaned_location_blocks_create_until_healed() {
        let (reg, root) = registry_with_pool();
        reg.create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        reg.write().attributes.remove("m1");

        let err = reg
            .create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
            .unwrap_err();
        assert!(matches!(err, LocationError::DuplicateName(_)));

        reg.delete_location("m1");
        assert!(
            reg.create_location(spec("m1", LocationKind::Machine, Some(&root.id)))
                .is_ok()
        );
    }

    #[test]
    fn dynamically_located_resolves_through_registry() {
        struct Host(String);
        impl DynamicallyLocated for Host {
            fn entity_id(&self) -> &str {
                &self.0
            }
        }

        let (reg, root) = registry_with_pool();
        let host = Host("m9".to_string());
        assert!(host.dynamic_location(&reg).is_none());

        reg.create_location(spec("m9", LocationKind::Machine, Some(&root.id)))
            .unwrap();
        assert_eq!(
            host.dynamic_location(&reg).map(|l| l.kind),
            Some(LocationKind::Machine)
        );
    }

    #[test]
    fn concurrent_creates_for_one_owner_yield_one_location() {
        let (reg, root) = registry_with_pool();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let reg = reg.clone();
                let parent = root.id.clone();
                std::thread::spawn(move || {
                    reg.create_location(spec("m1", LocationKind::Machine, Some(&parent)))
                        .is_ok()
                })
            })
            .collect();

        let ok = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(ok, 1);
        assert_eq!(reg.children(&root.id).len(), 1);
    }
}
