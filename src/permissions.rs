use std::collections::{BTreeSet, HashMap, HashSet};

use crate::algorithms::{TreeNode, TreeWarning, build_sorted_forest};
use crate::models::{MenuId, MenuNode, Role, RoleId, UserId};

/// Granted to bypass users: every action on every resource.
pub const WILDCARD_PERMISSION: &str = "*:*:*";

/// Principals exempt from role-based resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BypassList(HashSet<UserId>);

impl BypassList {
    pub fn new(user_ids: impl IntoIterator<Item = UserId>) -> Self {
        Self(user_ids.into_iter().collect())
    }

    pub fn contains(&self, user_id: UserId) -> bool {
        self.0.contains(&user_id)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// The given roles plus every transitive ancestor.
///
/// Each walk stops at a root, at a role missing from `roles`, or when it revisits a role,
/// so a cyclic role graph cannot loop.
pub fn ancestor_closure(role_ids: &[RoleId], roles: &[Role]) -> HashSet<RoleId> {
    let parents: HashMap<RoleId, Option<RoleId>> =
        roles.iter().map(|role| (role.id, role.parent_id)).collect();

    let mut closure: HashSet<RoleId> = role_ids.iter().copied().collect();
    for role_id in role_ids {
        let mut walked = HashSet::new();
        let mut current = *role_id;
        while let Some(Some(parent_id)) = parents.get(&current) {
            if !walked.insert(current) {
                tracing::warn!(role_id = %role_id, "role hierarchy contains a cycle");
                break;
            }
            closure.insert(*parent_id);
            current = *parent_id;
        }
    }
    closure
}

/// Distinct permission keys of the button menus among `granted`.
pub fn button_permissions(granted: &HashSet<MenuId>, menus: &[MenuNode]) -> BTreeSet<String> {
    menus
        .iter()
        .filter(|menu| menu.is_button() && !menu.permission.is_empty())
        .filter(|menu| granted.contains(&menu.id))
        .map(|menu| menu.permission.clone())
        .collect()
}

pub fn wildcard_permissions() -> BTreeSet<String> {
    BTreeSet::from([WILDCARD_PERMISSION.to_string()])
}

/// Granted menus together with every ancestor they hang under.
///
/// A grant on a button makes the menu and directories above it reachable for navigation.
pub fn with_ancestors(granted: &HashSet<MenuId>, menus: &[MenuNode]) -> HashSet<MenuId> {
    let parents: HashMap<MenuId, Option<MenuId>> =
        menus.iter().map(|menu| (menu.id, menu.parent_id)).collect();

    let mut expanded = granted.clone();
    for menu_id in granted {
        let mut current = *menu_id;
        let mut steps = 0usize;
        while let Some(Some(parent_id)) = parents.get(&current) {
            steps += 1;
            if !expanded.insert(*parent_id) || steps > menus.len() {
                break;
            }
            current = *parent_id;
        }
    }
    expanded
}

/// Enabled directories and menus, optionally restricted to `visible`, as a sorted forest.
pub fn routable_forest<F>(
    menus: Vec<MenuNode>,
    visible: Option<&HashSet<MenuId>>,
    warn: F,
) -> Vec<TreeNode<MenuNode>>
where
    F: FnMut(TreeWarning<MenuId>),
{
    let selected = menus
        .into_iter()
        .filter(|menu| menu.menu_type.is_routable() && !menu.disabled)
        .filter(|menu| visible.is_none_or(|ids| ids.contains(&menu.id)))
        .collect();
    build_sorted_forest(selected, warn)
}
