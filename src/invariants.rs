use std::collections::{HashMap, HashSet};

use anyhow::anyhow;
use serde::Serialize;

use crate::algorithms::TreeItem;
use crate::document::PlacedEntry;
use crate::error::{ErrorDetails, LibError, Result};
use crate::models::{MenuDefinition, MenuId, MenuNode, MenuType};

/// Whether giving `node_id` the parent `candidate_parent_id` would close a cycle.
///
/// Walks the candidate's ancestor chain. The walk is bounded by the number of items, so a
/// hierarchy that is already cyclic yields an integrity error instead of spinning.
pub fn would_cycle<T: TreeItem>(
    node_id: T::Id,
    candidate_parent_id: T::Id,
    items: &[T],
) -> Result<bool> {
    if node_id == candidate_parent_id {
        return Ok(true);
    }

    let parents: HashMap<T::Id, Option<T::Id>> = items
        .iter()
        .map(|item| (item.id(), item.parent_id()))
        .collect();

    let mut current = Some(candidate_parent_id);
    let mut steps = 0usize;
    while let Some(id) = current {
        if id == node_id {
            return Ok(true);
        }
        steps += 1;
        if steps > items.len() {
            return Err(LibError::integrity(
                "hierarchy_corrupt",
                "Stored hierarchy already contains a cycle",
                anyhow!(
                    "ancestor walk from {:?} exceeded {} steps",
                    candidate_parent_id,
                    items.len()
                ),
            ));
        }
        current = parents.get(&id).copied().flatten();
    }

    Ok(false)
}

pub fn ensure_parentage(parent_type: MenuType, child_type: MenuType) -> Result<()> {
    if parent_type.can_parent(child_type) {
        return Ok(());
    }

    let public = match parent_type {
        MenuType::Directory => "Directories can only contain directories or menus",
        MenuType::Menu => "Menus can only contain buttons",
        MenuType::Button => "Buttons cannot contain children",
    };
    Err(LibError::invalid_with_code(
        "menu_invalid_parent_type",
        public,
        anyhow!("{:?} cannot parent {:?}", parent_type, child_type),
    ))
}

/// Checks a create or update against the stored menus.
///
/// `existing_id` is the node being updated, excluded from uniqueness checks.
pub fn ensure_menu_placement(
    definition: &MenuDefinition,
    existing_id: Option<MenuId>,
    menus: &[MenuNode],
) -> Result<()> {
    if let Some(parent_id) = definition.parent_id {
        if existing_id == Some(parent_id) {
            return Err(LibError::invalid_with_code(
                "menu_self_parent",
                "A menu cannot be its own parent",
                anyhow!("menu {} set as its own parent", parent_id),
            ));
        }

        let parent = menus
            .iter()
            .find(|menu| menu.id == parent_id)
            .ok_or_else(|| {
                LibError::invalid_with_code(
                    "menu_parent_missing",
                    "Parent menu does not exist",
                    anyhow!("parent menu {} not found", parent_id),
                )
            })?;
        ensure_parentage(parent.menu_type, definition.menu_type)?;

        if let Some(node_id) = existing_id {
            let moving = menus
                .iter()
                .find(|menu| menu.id == node_id)
                .is_some_and(|menu| menu.parent_id != Some(parent_id));
            if moving && would_cycle(node_id, parent_id, menus)? {
                return Err(LibError::invalid_with_code(
                    "menu_cycle",
                    "Parent menu would create a circular reference",
                    anyhow!("menu {} is an ancestor of {}", node_id, parent_id),
                ));
            }
        }
    }

    ensure_unique(definition, existing_id, menus)
}

fn ensure_unique(
    definition: &MenuDefinition,
    existing_id: Option<MenuId>,
    menus: &[MenuNode],
) -> Result<()> {
    let others = || menus.iter().filter(move |menu| Some(menu.id) != existing_id);

    if definition.menu_type.is_routable() {
        if let Some(clash) = others()
            .find(|menu| menu.menu_type.is_routable() && menu.name == definition.name)
        {
            return Err(LibError::invalid_with_code(
                "menu_name_taken",
                "Menu name is already used by another menu",
                anyhow!("name {} used by menu {}", definition.name, clash.id),
            ));
        }
        if !definition.path.is_empty() {
            if let Some(clash) = others()
                .find(|menu| menu.menu_type.is_routable() && menu.path == definition.path)
            {
                return Err(LibError::invalid_with_code(
                    "menu_path_taken",
                    "Route path is already used by another menu",
                    anyhow!("path {} used by menu {}", definition.path, clash.id),
                ));
            }
        }
    }

    if definition.menu_type == MenuType::Button && !definition.permission.is_empty() {
        if let Some(clash) =
            others().find(|menu| menu.is_button() && menu.permission == definition.permission)
        {
            return Err(LibError::invalid_with_code(
                "menu_permission_taken",
                "Button permission is already used by another button",
                anyhow!(
                    "permission {} used by button {}",
                    definition.permission,
                    clash.id
                ),
            ));
        }
    }

    Ok(())
}

/// A structural problem in an import document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DocumentViolation {
    DuplicateId {
        id: MenuId,
    },
    SelfReference {
        id: MenuId,
    },
    /// A nested node declares a parent other than the node it is nested under.
    ParentMismatch {
        id: MenuId,
        declared_parent_id: Option<MenuId>,
        enclosing_id: MenuId,
    },
    /// A top-level node names a parent that does not precede it in the document.
    UnknownParent {
        id: MenuId,
        parent_id: MenuId,
    },
    InvalidParentType {
        id: MenuId,
        parent_type: MenuType,
        child_type: MenuType,
    },
    ButtonWithoutParent {
        id: MenuId,
    },
    DuplicateValue {
        id: MenuId,
        field: String,
        value: String,
    },
}

/// Every structural violation in a flattened document, in document order.
///
/// A top-level entry may point at any entry that precedes it; nested entries must point at
/// the node they are nested under.
pub fn document_violations(entries: &[PlacedEntry]) -> Vec<DocumentViolation> {
    let mut violations = Vec::new();
    let mut seen_types: HashMap<MenuId, MenuType> = HashMap::with_capacity(entries.len());
    let mut names = HashSet::new();
    let mut paths = HashSet::new();
    let mut permissions = HashSet::new();

    for placed in entries {
        let entry = &placed.entry;
        if seen_types.contains_key(&entry.id) {
            violations.push(DocumentViolation::DuplicateId { id: entry.id });
        }
        if entry.parent_id == Some(entry.id) {
            violations.push(DocumentViolation::SelfReference { id: entry.id });
        }

        let parent = match (placed.enclosing_id, entry.parent_id) {
            (Some(enclosing_id), declared) => {
                if declared != Some(enclosing_id) {
                    violations.push(DocumentViolation::ParentMismatch {
                        id: entry.id,
                        declared_parent_id: declared,
                        enclosing_id,
                    });
                }
                Some(enclosing_id)
            }
            (None, Some(parent_id)) if parent_id != entry.id => {
                if !seen_types.contains_key(&parent_id) {
                    violations.push(DocumentViolation::UnknownParent {
                        id: entry.id,
                        parent_id,
                    });
                }
                Some(parent_id)
            }
            (None, _) => None,
        };

        match parent.and_then(|parent_id| seen_types.get(&parent_id)) {
            Some(parent_type) if !parent_type.can_parent(entry.menu_type) => {
                violations.push(DocumentViolation::InvalidParentType {
                    id: entry.id,
                    parent_type: *parent_type,
                    child_type: entry.menu_type,
                });
            }
            None if parent.is_none() && entry.menu_type == MenuType::Button => {
                violations.push(DocumentViolation::ButtonWithoutParent { id: entry.id });
            }
            _ => {}
        }

        let mut check_duplicate = |field: &str, value: &str, seen: &mut HashSet<String>| {
            if !value.is_empty() && !seen.insert(value.to_string()) {
                violations.push(DocumentViolation::DuplicateValue {
                    id: entry.id,
                    field: field.to_string(),
                    value: value.to_string(),
                });
            }
        };
        if entry.menu_type.is_routable() {
            check_duplicate("name", &entry.name, &mut names);
            check_duplicate("path", &entry.path, &mut paths);
        } else {
            check_duplicate("permission", &entry.permission, &mut permissions);
        }

        seen_types.entry(entry.id).or_insert(entry.menu_type);
    }

    violations
}

pub fn ensure_document_shape(entries: &[PlacedEntry]) -> Result<()> {
    let violations = document_violations(entries);
    if violations.is_empty() {
        return Ok(());
    }

    Err(LibError::invalid_with_details(
        "menu_document_invalid",
        "Menu document has structural errors",
        ErrorDetails::DocumentViolations {
            violations: violations.clone(),
        },
        anyhow!("{} document violations: {:?}", violations.len(), violations),
    ))
}
