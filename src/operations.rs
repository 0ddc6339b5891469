use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;

use anyhow::anyhow;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::algorithms::{
    TreeNode, build_forest, build_sorted_forest, descendant_ids, fix_orphan_parent_ids,
    log_tree_warning,
};
use crate::config::AccessConfig;
use crate::document::{
    DocumentEntry, document_from_forest, flatten_document, parse_document, render_document,
};
use crate::error::{ErrorDetails, LibError, Result};
use crate::import::{ImportRemapper, ImportReport};
use crate::invariants::{ensure_document_shape, ensure_menu_placement, ensure_parentage, would_cycle};
use crate::models::{
    Api, ApiId, BatchDeletePayload, ExportDocument, ExportMenusQuery, MenuApiLink, MenuId,
    MenuListing, MenuNode, MenuPayload, Principal, Role, RoleId, RolePayload, SetMenuApisPayload,
    SetRoleMenusPayload, UpdateMenuPayload, UpdateRolePayload, UserId,
};
use crate::permissions::{
    BypassList, ancestor_closure, button_permissions, routable_forest, wildcard_permissions,
    with_ancestors,
};
use crate::store::{MenuStore, MenuTransaction, NoopPolicyCache, PolicyCache};

/// High-level menu and role actions.
///
/// Callers must provide a trusted `actor` resolved from validated session state.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "operation", rename_all = "snake_case")]
pub enum MenuOperation {
    CreateMenu { payload: MenuPayload },
    UpdateMenu { payload: UpdateMenuPayload },
    DeleteMenu { menu_id: MenuId },
    BatchDeleteMenus { payload: BatchDeletePayload },
    SetMenuApis { payload: SetMenuApisPayload },
    GetMenu { menu_id: MenuId },
    MenuApiIds { menu_id: MenuId },
    ExportMenus { query: ExportMenusQuery },
    ImportMenus { content: String },
    FullMenuTree,
    RoutableMenus,
    EffectivePermissions,
    CreateRole { payload: RolePayload },
    UpdateRole { payload: UpdateRolePayload },
    DeleteRole { role_id: RoleId },
    RoleTree,
    SetRoleMenus { payload: SetRoleMenusPayload },
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum MenuOperationResult {
    Menu { menu: MenuNode },
    MenuTree { tree: Vec<TreeNode<MenuListing>> },
    RoutableTree { tree: Vec<TreeNode<MenuNode>> },
    ApiIds { api_ids: Vec<ApiId> },
    Export { document: ExportDocument },
    Imported { report: ImportReport },
    BatchDeleted { report: BatchDeleteReport },
    Permissions { permissions: BTreeSet<String> },
    Role { role: Role },
    RoleTree { tree: Vec<TreeNode<Role>> },
    Updated,
    Deleted,
}

/// Rows removed by a batch delete.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeleteReport {
    pub menu_ids: Vec<MenuId>,
    /// Apis left without any menu link.
    pub api_ids: Vec<ApiId>,
}

pub struct MenuOperations<S, P = NoopPolicyCache> {
    store: S,
    policy: Arc<P>,
    permission_bypass: BypassList,
    routing_bypass: BypassList,
}

impl<S: Clone, P> Clone for MenuOperations<S, P> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            policy: Arc::clone(&self.policy),
            permission_bypass: self.permission_bypass.clone(),
            routing_bypass: self.routing_bypass.clone(),
        }
    }
}

impl<S: MenuStore> MenuOperations<S, NoopPolicyCache> {
    pub fn without_policy_cache(store: S, config: &AccessConfig) -> Self {
        Self::new(store, NoopPolicyCache, config)
    }
}

impl<S: MenuStore, P: PolicyCache> MenuOperations<S, P> {
    pub fn new(store: S, policy: P, config: &AccessConfig) -> Self {
        Self {
            store,
            policy: Arc::new(policy),
            permission_bypass: config.permission_bypass(),
            routing_bypass: config.routing_bypass(),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn execute(
        &self,
        actor: Principal,
        operation: MenuOperation,
    ) -> Result<MenuOperationResult> {
        match operation {
            MenuOperation::CreateMenu { payload } => {
                let menu = self.create_menu(actor.user_id, payload).await?;
                Ok(MenuOperationResult::Menu { menu })
            }
            MenuOperation::UpdateMenu { payload } => {
                let menu = self.update_menu(payload).await?;
                Ok(MenuOperationResult::Menu { menu })
            }
            MenuOperation::DeleteMenu { menu_id } => {
                self.delete_menu(menu_id).await?;
                Ok(MenuOperationResult::Deleted)
            }
            MenuOperation::BatchDeleteMenus { payload } => {
                let report = self.batch_delete_menus(payload).await?;
                Ok(MenuOperationResult::BatchDeleted { report })
            }
            MenuOperation::SetMenuApis { payload } => {
                self.set_menu_apis(payload).await?;
                Ok(MenuOperationResult::Updated)
            }
            MenuOperation::GetMenu { menu_id } => {
                let menu = self.get_menu(menu_id).await?;
                Ok(MenuOperationResult::Menu { menu })
            }
            MenuOperation::MenuApiIds { menu_id } => {
                let api_ids = self.menu_api_ids(menu_id).await?;
                Ok(MenuOperationResult::ApiIds { api_ids })
            }
            MenuOperation::ExportMenus { query } => {
                let document = self.export_menus(query).await?;
                Ok(MenuOperationResult::Export { document })
            }
            MenuOperation::ImportMenus { content } => {
                let report = self.import_menus(actor.user_id, content.as_bytes()).await?;
                Ok(MenuOperationResult::Imported { report })
            }
            MenuOperation::FullMenuTree => {
                let tree = self.full_menu_tree().await?;
                Ok(MenuOperationResult::MenuTree { tree })
            }
            MenuOperation::RoutableMenus => {
                let tree = self.routable_menus(actor).await?;
                Ok(MenuOperationResult::RoutableTree { tree })
            }
            MenuOperation::EffectivePermissions => {
                let permissions = self.effective_permissions(actor).await?;
                Ok(MenuOperationResult::Permissions { permissions })
            }
            MenuOperation::CreateRole { payload } => {
                let role = self.create_role(payload).await?;
                Ok(MenuOperationResult::Role { role })
            }
            MenuOperation::UpdateRole { payload } => {
                let role = self.update_role(payload).await?;
                Ok(MenuOperationResult::Role { role })
            }
            MenuOperation::DeleteRole { role_id } => {
                self.delete_role(role_id).await?;
                Ok(MenuOperationResult::Deleted)
            }
            MenuOperation::RoleTree => {
                let tree = self.role_tree().await?;
                Ok(MenuOperationResult::RoleTree { tree })
            }
            MenuOperation::SetRoleMenus { payload } => {
                self.set_role_menus(payload).await?;
                Ok(MenuOperationResult::Updated)
            }
        }
    }

    pub async fn create_menu(&self, actor: UserId, payload: MenuPayload) -> Result<MenuNode> {
        let definition = payload.normalize()?;
        let mut tx = self.store.begin().await?;
        let menus = tx.menus().await?;
        ensure_menu_placement(&definition, None, &menus)?;

        let menu_id = tx.insert_menu(&definition, Some(actor)).await?;
        tx.commit().await?;
        tracing::info!(menu_id = %menu_id, actor = %actor, "created menu");
        Ok(definition.into_node(menu_id, Some(actor)))
    }

    pub async fn update_menu(&self, payload: UpdateMenuPayload) -> Result<MenuNode> {
        let menu_id = payload.id;
        let definition = payload.menu.normalize()?;
        let mut tx = self.store.begin().await?;
        let menus = tx.menus().await?;
        let existing = find_menu(&menus, menu_id)?;
        ensure_menu_placement(&definition, Some(menu_id), &menus)?;
        for child in menus.iter().filter(|menu| menu.parent_id == Some(menu_id)) {
            ensure_parentage(definition.menu_type, child.menu_type)?;
        }

        let created_by = existing.created_by;
        tx.update_menu(menu_id, &definition).await?;
        tx.commit().await?;
        tracing::info!(menu_id = %menu_id, "updated menu");
        Ok(definition.into_node(menu_id, created_by))
    }

    /// Soft-deletes a childless menu that no role references.
    pub async fn delete_menu(&self, menu_id: MenuId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let menus = tx.menus().await?;
        find_menu(&menus, menu_id)?;
        if menus.iter().any(|menu| menu.parent_id == Some(menu_id)) {
            return Err(LibError::invalid_with_code(
                "menu_has_children",
                "Delete the child menus first",
                anyhow!("menu {} still has children", menu_id),
            ));
        }
        ensure_unassigned(&mut tx, &[menu_id]).await?;

        tx.delete_role_links_for_menus(&[menu_id]).await?;
        tx.soft_delete_menu(menu_id).await?;
        tx.delete_menu_api_links(&[menu_id]).await?;
        tx.commit().await?;
        tracing::info!(menu_id = %menu_id, "deleted menu");
        Ok(())
    }

    /// Hard-deletes the menus, their descendants, and any Api left without a link.
    pub async fn batch_delete_menus(&self, payload: BatchDeletePayload) -> Result<BatchDeleteReport> {
        if payload.menu_ids.is_empty() {
            return Err(LibError::invalid_with_code(
                "menu_ids_required",
                "Select at least one menu",
                anyhow!("batch delete without menu ids"),
            ));
        }

        let mut tx = self.store.begin().await?;
        let menus = tx.menus().await?;
        let menu_ids = descendant_ids(&payload.menu_ids, &menus);
        if menu_ids.is_empty() {
            return Err(LibError::not_found(
                "Menus not found",
                anyhow!("none of {:?} exist", payload.menu_ids),
            ));
        }
        ensure_unassigned(&mut tx, &menu_ids).await?;

        tx.delete_role_links_for_menus(&menu_ids).await?;
        let linked: Vec<ApiId> = tx
            .menu_api_links(&menu_ids)
            .await?
            .into_iter()
            .map(|link| link.api_id)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let surviving: HashSet<ApiId> = tx
            .api_ids_linked_outside(&linked, &menu_ids)
            .await?
            .into_iter()
            .collect();
        let orphaned: Vec<ApiId> = linked
            .into_iter()
            .filter(|api_id| !surviving.contains(api_id))
            .collect();

        tx.delete_menu_api_links(&menu_ids).await?;
        tx.delete_apis(&orphaned).await?;
        tx.delete_menus(&menu_ids).await?;
        tx.commit().await?;
        tracing::info!(
            menus = menu_ids.len(),
            apis = orphaned.len(),
            "batch deleted menus"
        );
        Ok(BatchDeleteReport {
            menu_ids,
            api_ids: orphaned,
        })
    }

    /// Replaces the Apis linked to a menu, then refreshes the policy cache.
    ///
    /// A failed refresh is returned as an error although the new links are already committed.
    pub async fn set_menu_apis(&self, payload: SetMenuApisPayload) -> Result<()> {
        let menu_id = payload.menu_id;
        let api_ids: Vec<ApiId> = payload
            .api_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.store.begin().await?;
        let menus = tx.menus().await?;
        find_menu(&menus, menu_id)?;
        let found = tx.count_apis(&api_ids).await?;
        if found != api_ids.len() as u64 {
            return Err(LibError::invalid_with_code(
                "menu_api_missing",
                "Some of the selected Apis do not exist",
                anyhow!("found {} of {} apis", found, api_ids.len()),
            ));
        }

        let links: Vec<MenuApiLink> = api_ids
            .iter()
            .map(|api_id| MenuApiLink {
                menu_id,
                api_id: *api_id,
            })
            .collect();
        tx.delete_menu_api_links(&[menu_id]).await?;
        tx.insert_menu_api_links(&links).await?;
        tx.commit().await?;
        tracing::info!(menu_id = %menu_id, apis = links.len(), "replaced menu apis");

        self.policy
            .refresh_role_api_permissions_for_menu(menu_id)
            .await
            .map_err(|err| {
                tracing::error!(menu_id = %menu_id, error = %err, "policy refresh failed after menu api update");
                err
            })
    }

    pub async fn get_menu(&self, menu_id: MenuId) -> Result<MenuNode> {
        let mut tx = self.store.read().await?;
        let menus = tx.menus().await?;
        find_menu(&menus, menu_id).cloned()
    }

    pub async fn menu_api_ids(&self, menu_id: MenuId) -> Result<Vec<ApiId>> {
        let mut tx = self.store.read().await?;
        Ok(tx
            .menu_api_links(&[menu_id])
            .await?
            .into_iter()
            .map(|link| link.api_id)
            .collect())
    }

    /// Enabled menus of every type with their Apis, for administration screens.
    pub async fn full_menu_tree(&self) -> Result<Vec<TreeNode<MenuListing>>> {
        let mut tx = self.store.read().await?;
        let menus: Vec<MenuNode> = tx
            .menus()
            .await?
            .into_iter()
            .filter(|menu| !menu.disabled)
            .collect();
        let listings = with_apis(&mut tx, menus).await?;
        Ok(build_sorted_forest(listings, log_tree_warning))
    }

    /// The requested menus and their descendants as a standalone document.
    pub async fn export_menus(&self, query: ExportMenusQuery) -> Result<ExportDocument> {
        if query.menu_ids.is_empty() {
            return Err(LibError::invalid_with_code(
                "menu_ids_required",
                "Select at least one menu",
                anyhow!("export without menu ids"),
            ));
        }

        let mut tx = self.store.read().await?;
        let menus = tx.menus().await?;
        let selected_ids: HashSet<MenuId> =
            descendant_ids(&query.menu_ids, &menus).into_iter().collect();
        if selected_ids.is_empty() {
            return Err(LibError::not_found(
                "Menus not found",
                anyhow!("none of {:?} exist", query.menu_ids),
            ));
        }

        let mut selected: Vec<MenuNode> = menus
            .into_iter()
            .filter(|menu| selected_ids.contains(&menu.id))
            .collect();
        fix_orphan_parent_ids(&mut selected);
        let listings = with_apis(&mut tx, selected).await?;
        let forest = build_sorted_forest(listings, log_tree_warning);
        let content = render_document(&document_from_forest(forest))?;

        tracing::info!(menus = selected_ids.len(), "exported menus");
        Ok(ExportDocument {
            filename: ExportDocument::filename_at(Utc::now().naive_utc()),
            content,
        })
    }

    /// Recreates a document's menus and Api links under fresh ids, in one transaction.
    pub async fn import_menus(&self, actor: UserId, content: &[u8]) -> Result<ImportReport> {
        let placed = flatten_document(parse_document(content)?);
        ensure_document_shape(&placed)?;
        let entries: Vec<DocumentEntry> = placed.into_iter().map(|placed| placed.entry).collect();

        let mut tx = self.store.begin().await?;
        let menus = tx.menus().await?;
        if let Some(details) = import_collisions(&entries, &menus) {
            return Err(LibError::invalid_with_details(
                "menu_import_collision",
                "Imported menus collide with existing menus",
                details.clone(),
                anyhow!("import collisions: {:?}", details),
            ));
        }

        let forest = build_forest(entries, log_tree_warning);
        let report = ImportRemapper::new(Some(actor))
            .import(&mut tx, forest)
            .await?;
        tx.commit().await?;
        tracing::info!(
            actor = %actor,
            menus = report.menus_created,
            apis = report.apis_created,
            "imported menus"
        );
        Ok(report)
    }

    /// Navigable menus for the principal.
    ///
    /// Grants on a menu expose the directories above it. Routing bypass users see every
    /// enabled directory and menu.
    pub async fn routable_menus(&self, principal: Principal) -> Result<Vec<TreeNode<MenuNode>>> {
        let mut tx = self.store.read().await?;
        let menus = tx.menus().await?;
        if self.routing_bypass.contains(principal.user_id) {
            return Ok(routable_forest(menus, None, log_tree_warning));
        }

        let role_ids = tx.user_role_ids(principal).await?;
        if role_ids.is_empty() {
            return Err(LibError::forbidden(
                "User has no assigned roles",
                anyhow!("user {} has no roles", principal.user_id),
            ));
        }
        let granted = granted_menu_ids(&mut tx, &role_ids).await?;
        let visible = with_ancestors(&granted, &menus);
        Ok(routable_forest(menus, Some(&visible), log_tree_warning))
    }

    /// Button permission keys granted to the principal through its roles and their ancestors.
    pub async fn effective_permissions(&self, principal: Principal) -> Result<BTreeSet<String>> {
        if self.permission_bypass.contains(principal.user_id) {
            return Ok(wildcard_permissions());
        }

        let mut tx = self.store.read().await?;
        let role_ids = tx.user_role_ids(principal).await?;
        if role_ids.is_empty() {
            return Ok(BTreeSet::new());
        }
        let granted = granted_menu_ids(&mut tx, &role_ids).await?;
        let menus = tx.menus().await?;
        Ok(button_permissions(&granted, &menus))
    }

    pub async fn create_role(&self, payload: RolePayload) -> Result<Role> {
        let definition = payload.normalize()?;
        let mut tx = self.store.begin().await?;
        let roles = tx.roles().await?;
        if let Some(parent_id) = definition.parent_id {
            find_parent_role(&roles, parent_id)?;
        }

        let role_id = tx.insert_role(&definition).await?;
        tx.commit().await?;
        tracing::info!(role_id = %role_id, "created role");
        Ok(definition.into_role(role_id))
    }

    pub async fn update_role(&self, payload: UpdateRolePayload) -> Result<Role> {
        let role_id = payload.id;
        let definition = payload.role.normalize()?;
        let mut tx = self.store.begin().await?;
        let roles = tx.roles().await?;
        if !roles.iter().any(|role| role.id == role_id) {
            return Err(LibError::not_found(
                "Role not found",
                anyhow!("role {} not found", role_id),
            ));
        }
        if let Some(parent_id) = definition.parent_id {
            if parent_id == role_id {
                return Err(LibError::invalid_with_code(
                    "role_self_parent",
                    "A role cannot be its own parent",
                    anyhow!("role {} set as its own parent", role_id),
                ));
            }
            find_parent_role(&roles, parent_id)?;
            if would_cycle(role_id, parent_id, &roles)? {
                return Err(LibError::invalid_with_code(
                    "role_cycle",
                    "Parent role would create a circular reference",
                    anyhow!("role {} is an ancestor of {}", role_id, parent_id),
                ));
            }
        }

        tx.update_role(role_id, &definition).await?;
        tx.commit().await?;
        tracing::info!(role_id = %role_id, "updated role");
        Ok(definition.into_role(role_id))
    }

    pub async fn delete_role(&self, role_id: RoleId) -> Result<()> {
        let mut tx = self.store.begin().await?;
        let roles = tx.roles().await?;
        if !roles.iter().any(|role| role.id == role_id) {
            return Err(LibError::not_found(
                "Role not found",
                anyhow!("role {} not found", role_id),
            ));
        }
        if roles.iter().any(|role| role.parent_id == Some(role_id)) {
            return Err(LibError::invalid_with_code(
                "role_has_children",
                "Delete the child roles first",
                anyhow!("role {} still has children", role_id),
            ));
        }
        let links = tx.count_menu_links_for_role(role_id).await?;
        if links > 0 {
            return Err(LibError::invalid_with_code(
                "role_has_menus",
                "Remove the role's menus before deleting it",
                anyhow!("role {} has {} menu links", role_id, links),
            ));
        }

        tx.delete_role(role_id).await?;
        tx.commit().await?;
        tracing::info!(role_id = %role_id, "deleted role");
        Ok(())
    }

    pub async fn role_tree(&self) -> Result<Vec<TreeNode<Role>>> {
        let mut tx = self.store.read().await?;
        let roles = tx.roles().await?;
        Ok(build_sorted_forest(roles, log_tree_warning))
    }

    /// Replaces the menus granted to a role, then refreshes the role's cached Api permissions.
    pub async fn set_role_menus(&self, payload: SetRoleMenusPayload) -> Result<()> {
        let role_id = payload.role_id;
        let menu_ids: Vec<MenuId> = payload
            .menu_ids
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let mut tx = self.store.begin().await?;
        let roles = tx.roles().await?;
        if !roles.iter().any(|role| role.id == role_id) {
            return Err(LibError::not_found(
                "Role not found",
                anyhow!("role {} not found", role_id),
            ));
        }
        let known: HashSet<MenuId> = tx.menus().await?.into_iter().map(|menu| menu.id).collect();
        if let Some(missing) = menu_ids.iter().find(|menu_id| !known.contains(menu_id)) {
            return Err(LibError::invalid_with_code(
                "role_menu_missing",
                "Some of the selected menus do not exist",
                anyhow!("menu {} not found", missing),
            ));
        }

        tx.replace_role_menus(role_id, &menu_ids).await?;
        tx.commit().await?;
        tracing::info!(role_id = %role_id, menus = menu_ids.len(), "replaced role menus");

        self.policy
            .refresh_role_api_permissions(role_id)
            .await
            .map_err(|err| {
                tracing::error!(role_id = %role_id, error = %err, "policy refresh failed after role menu update");
                err
            })
    }
}

fn find_menu(menus: &[MenuNode], menu_id: MenuId) -> Result<&MenuNode> {
    menus.iter().find(|menu| menu.id == menu_id).ok_or_else(|| {
        LibError::not_found("Menu not found", anyhow!("menu {} not found", menu_id))
    })
}

fn find_parent_role(roles: &[Role], parent_id: RoleId) -> Result<&Role> {
    roles.iter().find(|role| role.id == parent_id).ok_or_else(|| {
        LibError::invalid_with_code(
            "role_parent_missing",
            "Parent role does not exist",
            anyhow!("parent role {} not found", parent_id),
        )
    })
}

async fn ensure_unassigned<T: MenuTransaction>(tx: &mut T, menu_ids: &[MenuId]) -> Result<()> {
    let links = tx.count_role_links_for_menus(menu_ids).await?;
    if links > 0 {
        return Err(LibError::invalid_with_code(
            "menu_assigned_to_roles",
            "Menu is still assigned to roles",
            anyhow!("{} role links reference {:?}", links, menu_ids),
        ));
    }
    Ok(())
}

async fn granted_menu_ids<T: MenuTransaction>(
    tx: &mut T,
    role_ids: &[RoleId],
) -> Result<HashSet<MenuId>> {
    let roles = tx.roles().await?;
    let closure: Vec<RoleId> = ancestor_closure(role_ids, &roles).into_iter().collect();
    Ok(tx.role_menu_ids(&closure).await?.into_iter().collect())
}

async fn with_apis<T: MenuTransaction>(
    tx: &mut T,
    menus: Vec<MenuNode>,
) -> Result<Vec<MenuListing>> {
    let menu_ids: Vec<MenuId> = menus.iter().map(|menu| menu.id).collect();
    let links = tx.menu_api_links(&menu_ids).await?;
    let api_ids: Vec<ApiId> = links
        .iter()
        .map(|link| link.api_id)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let apis: HashMap<ApiId, Api> = tx
        .apis(&api_ids)
        .await?
        .into_iter()
        .map(|api| (api.id, api))
        .collect();

    let mut by_menu: HashMap<MenuId, Vec<Api>> = HashMap::new();
    for link in links {
        if let Some(api) = apis.get(&link.api_id) {
            by_menu.entry(link.menu_id).or_default().push(api.clone());
        }
    }
    Ok(menus
        .into_iter()
        .map(|menu| MenuListing {
            apis: by_menu.remove(&menu.id).unwrap_or_default(),
            menu,
        })
        .collect())
}

/// Document values that already exist in the store.
pub fn import_collisions(entries: &[DocumentEntry], menus: &[MenuNode]) -> Option<ErrorDetails> {
    let stored_components: HashSet<&str> = menus
        .iter()
        .map(|menu| menu.component.as_str())
        .filter(|component| !component.is_empty())
        .collect();
    let stored_permissions: HashSet<&str> = menus
        .iter()
        .filter(|menu| menu.is_button())
        .map(|menu| menu.permission.as_str())
        .filter(|permission| !permission.is_empty())
        .collect();
    let stored_names: HashSet<&str> = menus
        .iter()
        .filter(|menu| menu.menu_type.is_routable())
        .map(|menu| menu.name.as_str())
        .collect();
    let stored_paths: HashSet<&str> = menus
        .iter()
        .filter(|menu| menu.menu_type.is_routable())
        .map(|menu| menu.path.as_str())
        .filter(|path| !path.is_empty())
        .collect();

    let mut components = BTreeSet::new();
    let mut permissions = BTreeSet::new();
    let mut names = BTreeSet::new();
    let mut paths = BTreeSet::new();
    for entry in entries {
        if stored_components.contains(entry.component.as_str()) {
            components.insert(entry.component.clone());
        }
        if entry.menu_type.is_routable() {
            if stored_names.contains(entry.name.as_str()) {
                names.insert(entry.name.clone());
            }
            if stored_paths.contains(entry.path.as_str()) {
                paths.insert(entry.path.clone());
            }
        } else if stored_permissions.contains(entry.permission.as_str()) {
            permissions.insert(entry.permission.clone());
        }
    }

    if components.is_empty() && permissions.is_empty() && names.is_empty() && paths.is_empty() {
        return None;
    }
    Some(ErrorDetails::Collisions {
        components: components.into_iter().collect(),
        permissions: permissions.into_iter().collect(),
        names: names.into_iter().collect(),
        paths: paths.into_iter().collect(),
    })
}

#[cfg(test)]
mod tests {
    use tokio::sync::Mutex;

    use super::*;
    use crate::algorithms::flatten;
    use crate::error::ErrorKind;
    use crate::invariants::DocumentViolation;
    use crate::memory::MemoryStore;
    use crate::models::{MenuType, RoleDefinition};

    const ADMIN: UserId = UserId(1);

    #[derive(Default)]
    struct RecordingPolicy {
        menus: Mutex<Vec<MenuId>>,
        roles: Mutex<Vec<RoleId>>,
        fail: bool,
    }

    impl PolicyCache for RecordingPolicy {
        async fn refresh_role_api_permissions_for_menu(&self, menu_id: MenuId) -> Result<()> {
            self.menus.lock().await.push(menu_id);
            if self.fail {
                return Err(LibError::message("Policy engine unavailable"));
            }
            Ok(())
        }

        async fn refresh_role_api_permissions(&self, role_id: RoleId) -> Result<()> {
            self.roles.lock().await.push(role_id);
            if self.fail {
                return Err(LibError::message("Policy engine unavailable"));
            }
            Ok(())
        }
    }

    fn principal(user_id: i64) -> Principal {
        Principal {
            user_id: UserId(user_id),
            tenant_id: None,
        }
    }

    fn payload(parent: Option<MenuId>, menu_type: MenuType, name: &str) -> MenuPayload {
        MenuPayload {
            parent_id: parent,
            menu_type,
            name: name.to_string(),
            path: if menu_type.is_routable() {
                format!("/{name}")
            } else {
                String::new()
            },
            component: if menu_type == MenuType::Menu {
                format!("{name}/index")
            } else {
                String::new()
            },
            title: name.to_string(),
            permission: String::new(),
            disabled: false,
            sort_key: 0,
        }
    }

    fn button(parent: MenuId, permission: &str) -> MenuPayload {
        MenuPayload {
            permission: permission.to_string(),
            ..payload(Some(parent), MenuType::Button, permission)
        }
    }

    fn role_definition(name: &str, parent: Option<RoleId>) -> RoleDefinition {
        RoleDefinition {
            parent_id: parent,
            name: name.to_string(),
            description: String::new(),
            sort_key: 0,
            data_scope: Default::default(),
            tenant_id: None,
        }
    }

    struct Fixture {
        ops: MenuOperations<MemoryStore, RecordingPolicy>,
        d1: MenuId,
        m1: MenuId,
        b1: MenuId,
    }

    async fn fixture_with(policy: RecordingPolicy, config: AccessConfig) -> Fixture {
        let ops = MenuOperations::new(MemoryStore::new(), policy, &config);
        let d1 = ops
            .create_menu(ADMIN, payload(None, MenuType::Directory, "system"))
            .await
            .expect("directory")
            .id;
        let m1 = ops
            .create_menu(ADMIN, payload(Some(d1), MenuType::Menu, "users"))
            .await
            .expect("menu")
            .id;
        let b1 = ops
            .create_menu(ADMIN, button(m1, "user:add"))
            .await
            .expect("button")
            .id;
        Fixture { ops, d1, m1, b1 }
    }

    async fn fixture() -> Fixture {
        fixture_with(RecordingPolicy::default(), AccessConfig::default()).await
    }

    #[tokio::test]
    async fn button_grant_yields_permission_and_route() {
        let Fixture { ops, d1, m1, b1 } = fixture().await;
        let role = ops.store().seed_role(role_definition("clerk", None)).await;
        ops.set_role_menus(SetRoleMenusPayload {
            role_id: role,
            menu_ids: vec![b1],
        })
        .await
        .expect("link role");
        ops.store().assign_user_role(UserId(7), role).await;

        let permissions = ops
            .effective_permissions(principal(7))
            .await
            .expect("permissions");
        assert_eq!(permissions, BTreeSet::from(["user:add".to_string()]));

        let routes = ops.routable_menus(principal(7)).await.expect("routes");
        assert_eq!(routes.len(), 1);
        assert_eq!(routes[0].item.id, d1);
        assert_eq!(routes[0].children.len(), 1);
        assert_eq!(routes[0].children[0].item.id, m1);
        assert!(routes[0].children[0].children.is_empty());
    }

    #[tokio::test]
    async fn permissions_are_inherited_from_ancestor_roles() {
        let Fixture { ops, b1, .. } = fixture().await;
        let r1 = ops.store().seed_role(role_definition("r1", None)).await;
        let r2 = ops.store().seed_role(role_definition("r2", Some(r1))).await;
        let r3 = ops.store().seed_role(role_definition("r3", Some(r2))).await;
        ops.set_role_menus(SetRoleMenusPayload {
            role_id: r1,
            menu_ids: vec![b1],
        })
        .await
        .expect("link role");
        ops.store().assign_user_role(UserId(9), r3).await;

        let permissions = ops
            .effective_permissions(principal(9))
            .await
            .expect("permissions");
        assert!(permissions.contains("user:add"));
        assert_eq!(ops.policy.roles.lock().await.as_slice(), &[r1]);
    }

    #[tokio::test]
    async fn bypass_users_skip_role_resolution() {
        let config = AccessConfig {
            permission_bypass_user_ids: vec![UserId(1)],
            routing_bypass_user_ids: vec![UserId(2)],
        };
        let Fixture { ops, d1, .. } = fixture_with(RecordingPolicy::default(), config).await;
        ops.create_menu(ADMIN, MenuPayload {
            disabled: true,
            ..payload(Some(d1), MenuType::Menu, "hidden")
        })
        .await
        .expect("disabled menu");

        let permissions = ops
            .effective_permissions(principal(1))
            .await
            .expect("permissions");
        assert_eq!(permissions, BTreeSet::from(["*:*:*".to_string()]));

        let routes = ops.routable_menus(principal(2)).await.expect("routes");
        let names: Vec<String> = flatten(routes).into_iter().map(|menu| menu.name).collect();
        assert_eq!(names, vec!["system".to_string(), "users".to_string()]);

        let err = ops
            .routable_menus(principal(1))
            .await
            .expect_err("permission bypass does not bypass routing");
        assert_eq!(err.kind, ErrorKind::Forbidden);
    }

    #[tokio::test]
    async fn users_without_roles_get_no_permissions() {
        let Fixture { ops, .. } = fixture().await;
        let permissions = ops
            .effective_permissions(principal(44))
            .await
            .expect("permissions");
        assert!(permissions.is_empty());
    }

    #[tokio::test]
    async fn button_cannot_become_a_parent() {
        let Fixture { ops, d1, m1, b1 } = fixture().await;
        let err = ops
            .update_menu(UpdateMenuPayload {
                id: m1,
                menu: payload(Some(b1), MenuType::Menu, "users"),
            })
            .await
            .expect_err("button cannot parent");
        assert_eq!(err.kind, ErrorKind::InvalidInput);
        assert_eq!(err.public, "Buttons cannot contain children");
        assert_eq!(ops.get_menu(m1).await.expect("menu").parent_id, Some(d1));
    }

    #[tokio::test]
    async fn moving_under_a_descendant_is_rejected() {
        let Fixture { ops, d1, .. } = fixture().await;
        let d2 = ops
            .create_menu(ADMIN, payload(Some(d1), MenuType::Directory, "nested"))
            .await
            .expect("nested directory")
            .id;

        let err = ops
            .update_menu(UpdateMenuPayload {
                id: d1,
                menu: payload(Some(d2), MenuType::Directory, "system"),
            })
            .await
            .expect_err("cycle");
        assert_eq!(err.code, "menu_cycle");

        let err = ops
            .update_menu(UpdateMenuPayload {
                id: d1,
                menu: payload(Some(d1), MenuType::Directory, "system"),
            })
            .await
            .expect_err("self parent");
        assert_eq!(err.code, "menu_self_parent");
    }

    #[tokio::test]
    async fn retyping_must_keep_children_valid() {
        let Fixture { ops, d1, m1, .. } = fixture().await;
        let err = ops
            .update_menu(UpdateMenuPayload {
                id: m1,
                menu: payload(Some(d1), MenuType::Directory, "users"),
            })
            .await
            .expect_err("buttons cannot sit under a directory");
        assert_eq!(err.code, "menu_invalid_parent_type");
    }

    #[tokio::test]
    async fn duplicate_names_and_permissions_are_rejected() {
        let Fixture { ops, d1, m1, .. } = fixture().await;
        let err = ops
            .create_menu(ADMIN, payload(Some(d1), MenuType::Menu, "users"))
            .await
            .expect_err("name taken");
        assert_eq!(err.code, "menu_name_taken");

        let err = ops
            .create_menu(ADMIN, button(m1, "user:add"))
            .await
            .expect_err("permission taken");
        assert_eq!(err.code, "menu_permission_taken");
    }

    #[tokio::test]
    async fn delete_refuses_parents_and_assigned_menus() {
        let Fixture { ops, m1, b1, .. } = fixture().await;
        let err = ops.delete_menu(m1).await.expect_err("has children");
        assert_eq!(err.code, "menu_has_children");

        let role = ops.store().seed_role(role_definition("clerk", None)).await;
        ops.set_role_menus(SetRoleMenusPayload {
            role_id: role,
            menu_ids: vec![b1],
        })
        .await
        .expect("link role");
        let err = ops.delete_menu(b1).await.expect_err("assigned");
        assert_eq!(err.code, "menu_assigned_to_roles");
    }

    #[tokio::test]
    async fn delete_soft_removes_menu_and_its_api_links() {
        let Fixture { ops, b1, .. } = fixture().await;
        let api = ops.store().seed_api("/api/users", "POST").await;
        ops.set_menu_apis(SetMenuApisPayload {
            menu_id: b1,
            api_ids: vec![api],
        })
        .await
        .expect("link api");

        ops.delete_menu(b1).await.expect("delete");
        let err = ops.get_menu(b1).await.expect_err("gone");
        assert_eq!(err.kind, ErrorKind::NotFound);
        assert!(ops.menu_api_ids(b1).await.expect("links").is_empty());
        assert_eq!(ops.store().soft_deleted_menu_ids().await, vec![b1]);
        assert_eq!(ops.store().all_apis().await.len(), 1);
    }

    #[tokio::test]
    async fn batch_delete_removes_subtree_and_orphaned_apis() {
        let Fixture { ops, d1, m1, b1 } = fixture().await;
        let d2 = ops
            .create_menu(ADMIN, payload(None, MenuType::Directory, "audit"))
            .await
            .expect("directory")
            .id;
        let m2 = ops
            .create_menu(ADMIN, payload(Some(d2), MenuType::Menu, "logs"))
            .await
            .expect("menu")
            .id;
        let b2 = ops
            .create_menu(ADMIN, button(m2, "log:view"))
            .await
            .expect("button")
            .id;
        let solo = ops.store().seed_api("/api/users", "POST").await;
        let shared = ops.store().seed_api("/api/logs", "GET").await;
        ops.set_menu_apis(SetMenuApisPayload {
            menu_id: b1,
            api_ids: vec![solo, shared],
        })
        .await
        .expect("link b1");
        ops.set_menu_apis(SetMenuApisPayload {
            menu_id: b2,
            api_ids: vec![shared],
        })
        .await
        .expect("link b2");

        let report = ops
            .batch_delete_menus(BatchDeletePayload {
                menu_ids: vec![d1],
            })
            .await
            .expect("batch delete");
        let deleted: BTreeSet<MenuId> = report.menu_ids.iter().copied().collect();
        assert_eq!(deleted, BTreeSet::from([d1, m1, b1]));
        assert_eq!(report.api_ids, vec![solo]);

        let remaining: Vec<ApiId> = ops
            .store()
            .all_apis()
            .await
            .into_iter()
            .map(|api| api.id)
            .collect();
        assert_eq!(remaining, vec![shared]);
        assert_eq!(ops.menu_api_ids(b2).await.expect("links"), vec![shared]);
        assert!(ops.get_menu(d1).await.is_err());
        assert!(ops.store().soft_deleted_menu_ids().await.is_empty());
    }

    #[tokio::test]
    async fn batch_delete_is_all_or_nothing() {
        let Fixture { ops, d1, m1, b1 } = fixture().await;
        let role = ops.store().seed_role(role_definition("clerk", None)).await;
        ops.set_role_menus(SetRoleMenusPayload {
            role_id: role,
            menu_ids: vec![b1],
        })
        .await
        .expect("link role");

        let err = ops
            .batch_delete_menus(BatchDeletePayload {
                menu_ids: vec![d1],
            })
            .await
            .expect_err("descendant is assigned");
        assert_eq!(err.code, "menu_assigned_to_roles");
        for menu_id in [d1, m1, b1] {
            ops.get_menu(menu_id).await.expect("still present");
        }
    }

    #[tokio::test]
    async fn batch_delete_rejects_empty_and_unknown_ids() {
        let Fixture { ops, .. } = fixture().await;
        let err = ops
            .batch_delete_menus(BatchDeletePayload { menu_ids: vec![] })
            .await
            .expect_err("empty");
        assert_eq!(err.code, "menu_ids_required");

        let err = ops
            .batch_delete_menus(BatchDeletePayload {
                menu_ids: vec![MenuId(999)],
            })
            .await
            .expect_err("unknown");
        assert_eq!(err.kind, ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn set_menu_apis_validates_every_api() {
        let Fixture { ops, b1, .. } = fixture().await;
        let api = ops.store().seed_api("/api/users", "POST").await;
        ops.set_menu_apis(SetMenuApisPayload {
            menu_id: b1,
            api_ids: vec![api],
        })
        .await
        .expect("link");

        let err = ops
            .set_menu_apis(SetMenuApisPayload {
                menu_id: b1,
                api_ids: vec![api, ApiId(404)],
            })
            .await
            .expect_err("missing api");
        assert_eq!(err.code, "menu_api_missing");
        assert_eq!(ops.menu_api_ids(b1).await.expect("links"), vec![api]);
        assert_eq!(ops.policy.menus.lock().await.as_slice(), &[b1]);
    }

    #[tokio::test]
    async fn failed_policy_refresh_is_reported_after_commit() {
        let policy = RecordingPolicy {
            fail: true,
            ..Default::default()
        };
        let Fixture { ops, b1, .. } = fixture_with(policy, AccessConfig::default()).await;
        let api = ops.store().seed_api("/api/users", "POST").await;

        let err = ops
            .set_menu_apis(SetMenuApisPayload {
                menu_id: b1,
                api_ids: vec![api],
            })
            .await
            .expect_err("refresh fails");
        assert_eq!(err.public, "Policy engine unavailable");
        assert_eq!(ops.menu_api_ids(b1).await.expect("links"), vec![api]);
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Shape {
        menu_type: MenuType,
        permission: String,
        apis: Vec<(String, String)>,
        children: Vec<Shape>,
    }

    fn shape(forest: Vec<TreeNode<MenuListing>>) -> Vec<Shape> {
        forest
            .into_iter()
            .map(|node| Shape {
                menu_type: node.item.menu.menu_type,
                permission: node.item.menu.permission.clone(),
                apis: node
                    .item
                    .apis
                    .iter()
                    .map(|api| (api.path.clone(), api.method.clone()))
                    .collect(),
                children: shape(node.children),
            })
            .collect()
    }

    #[tokio::test]
    async fn export_then_import_reproduces_the_tree() {
        let Fixture { ops, d1, m1, b1 } = fixture().await;
        ops.create_menu(ADMIN, button(m1, "user:edit"))
            .await
            .expect("second button");
        let api = ops.store().seed_api("/api/users", "POST").await;
        ops.set_menu_apis(SetMenuApisPayload {
            menu_id: b1,
            api_ids: vec![api],
        })
        .await
        .expect("link");

        let document = ops
            .export_menus(ExportMenusQuery {
                menu_ids: vec![d1],
            })
            .await
            .expect("export");
        assert!(document.filename.starts_with("menu_export_"));
        assert!(document.filename.ends_with(".json"));

        let target = MenuOperations::without_policy_cache(MemoryStore::new(), &AccessConfig::default());
        let report = target
            .import_menus(UserId(3), document.content.as_bytes())
            .await
            .expect("import");
        assert_eq!(report.menus_created, 4);
        assert_eq!(report.apis_created, 1);

        let source_shape = shape(ops.full_menu_tree().await.expect("source tree"));
        let target_tree = target.full_menu_tree().await.expect("target tree");
        assert_eq!(shape(target_tree), source_shape);
    }

    #[tokio::test]
    async fn export_of_a_subtree_detaches_its_top() {
        let Fixture { ops, m1, .. } = fixture().await;
        let document = ops
            .export_menus(ExportMenusQuery {
                menu_ids: vec![m1],
            })
            .await
            .expect("export");
        let value: serde_json::Value =
            serde_json::from_str(&document.content).expect("valid json");
        assert_eq!(value[0]["parentId"], serde_json::json!(0));
        assert_eq!(value[0]["children"][0]["permission"], "user:add");
    }

    #[tokio::test]
    async fn import_rejects_collisions_before_writing() {
        let Fixture { ops, d1, .. } = fixture().await;
        let document = ops
            .export_menus(ExportMenusQuery {
                menu_ids: vec![d1],
            })
            .await
            .expect("export");

        let err = ops
            .import_menus(ADMIN, document.content.as_bytes())
            .await
            .expect_err("everything collides");
        assert_eq!(err.code, "menu_import_collision");
        match err.details {
            Some(ErrorDetails::Collisions {
                components,
                permissions,
                ..
            }) => {
                assert_eq!(components, vec!["users/index".to_string()]);
                assert_eq!(permissions, vec!["user:add".to_string()]);
            }
            other => panic!("unexpected details {other:?}"),
        }
        assert_eq!(flatten(ops.full_menu_tree().await.expect("tree")).len(), 3);
    }

    #[tokio::test]
    async fn import_reports_every_shape_violation() {
        let ops = MenuOperations::without_policy_cache(MemoryStore::new(), &AccessConfig::default());
        let content = serde_json::json!([
            {"id": 1, "parentId": 0, "name": "system", "type": 1, "children": [
                {"id": 2, "parentId": 1, "name": "bad", "type": 3, "permission": "x:y",
                 "children": [{"id": 3, "parentId": 2, "name": "deeper", "type": 2}]}
            ]},
            {"id": 4, "parentId": 77, "name": "lost", "type": 2}
        ])
        .to_string();

        let err = ops
            .import_menus(ADMIN, content.as_bytes())
            .await
            .expect_err("invalid document");
        assert_eq!(err.code, "menu_document_invalid");
        let Some(ErrorDetails::DocumentViolations { violations }) = err.details else {
            panic!("missing violations");
        };
        assert!(violations.contains(&DocumentViolation::InvalidParentType {
            id: MenuId(2),
            parent_type: MenuType::Directory,
            child_type: MenuType::Button,
        }));
        assert!(violations.contains(&DocumentViolation::InvalidParentType {
            id: MenuId(3),
            parent_type: MenuType::Button,
            child_type: MenuType::Menu,
        }));
        assert!(violations.contains(&DocumentViolation::UnknownParent {
            id: MenuId(4),
            parent_id: MenuId(77),
        }));
        assert!(ops.full_menu_tree().await.expect("tree").is_empty());
    }

    #[tokio::test]
    async fn import_nests_flat_entries_under_earlier_parents() {
        let ops = MenuOperations::without_policy_cache(MemoryStore::new(), &AccessConfig::default());
        let content = serde_json::json!([
            {"id": 10, "parentId": 0, "name": "system", "path": "/system", "type": 1},
            {"id": 11, "parentId": 10, "name": "users", "path": "/users", "type": 2}
        ])
        .to_string();

        let report = ops
            .import_menus(ADMIN, content.as_bytes())
            .await
            .expect("import");
        assert_eq!(report.root_ids.len(), 1);
        let tree = ops.full_menu_tree().await.expect("tree");
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].children[0].item.menu.name, "users");
    }

    #[tokio::test]
    async fn role_lifecycle_guards_links_and_cycles() {
        let Fixture { ops, b1, .. } = fixture().await;
        let parent = ops
            .create_role(RolePayload {
                parent_id: None,
                name: "manager".to_string(),
                description: String::new(),
                sort_key: 0,
                data_scope: Default::default(),
                tenant_id: None,
            })
            .await
            .expect("parent role");
        let child = ops
            .create_role(RolePayload {
                parent_id: Some(parent.id),
                name: "clerk".to_string(),
                description: String::new(),
                sort_key: 0,
                data_scope: Default::default(),
                tenant_id: None,
            })
            .await
            .expect("child role");

        let err = ops
            .update_role(UpdateRolePayload {
                id: parent.id,
                role: RolePayload {
                    parent_id: Some(child.id),
                    name: "manager".to_string(),
                    description: String::new(),
                    sort_key: 0,
                    data_scope: Default::default(),
                    tenant_id: None,
                },
            })
            .await
            .expect_err("cycle");
        assert_eq!(err.code, "role_cycle");

        let err = ops.delete_role(parent.id).await.expect_err("has child");
        assert_eq!(err.code, "role_has_children");

        ops.set_role_menus(SetRoleMenusPayload {
            role_id: child.id,
            menu_ids: vec![b1],
        })
        .await
        .expect("link");
        let err = ops.delete_role(child.id).await.expect_err("has menus");
        assert_eq!(err.code, "role_has_menus");

        ops.set_role_menus(SetRoleMenusPayload {
            role_id: child.id,
            menu_ids: vec![],
        })
        .await
        .expect("unlink");
        ops.delete_role(child.id).await.expect("delete child");

        let tree = ops.role_tree().await.expect("role tree");
        assert_eq!(tree.len(), 1);
        assert!(tree[0].children.is_empty());
    }

    #[tokio::test]
    async fn execute_dispatches_tagged_operations() {
        let Fixture { ops, b1, .. } = fixture().await;
        let operation: MenuOperation = serde_json::from_value(serde_json::json!({
            "operation": "get_menu",
            "menu_id": b1.0
        }))
        .expect("operation should deserialize");

        let result = ops.execute(principal(1), operation).await.expect("execute");
        let value = serde_json::to_value(&result).expect("result should serialize");
        assert_eq!(value["result"], "menu");
        assert_eq!(value["menu"]["permission"], "user:add");
        assert_eq!(value["menu"]["type"], 3);
    }

    #[test]
    fn collisions_ignore_empty_values() {
        let entry = DocumentEntry {
            id: MenuId(1),
            parent_id: None,
            name: "fresh".to_string(),
            path: String::new(),
            component: String::new(),
            title: String::new(),
            menu_type: MenuType::Directory,
            permission: String::new(),
            disabled: false,
            sort_key: 0,
            apis: vec![],
        };
        let stored = MenuNode {
            id: MenuId(5),
            parent_id: None,
            menu_type: MenuType::Directory,
            name: "other".to_string(),
            path: String::new(),
            component: String::new(),
            title: String::new(),
            permission: String::new(),
            disabled: false,
            sort_key: 0,
            created_by: None,
        };
        assert_eq!(import_collisions(&[entry], &[stored]), None);
    }
}
