//! In-memory [`MenuStore`] for tests and embedders without a database.
//!
//! Committed state lives behind a `tokio::sync::RwLock`. Writers are serialised by a mutex
//! held for the whole transaction; each transaction works on a private copy that replaces
//! the shared state on commit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use anyhow::anyhow;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use crate::error::{LibError, Result};
use crate::models::{
    Api, ApiId, MenuApiLink, MenuDefinition, MenuId, MenuNode, NewApi, Principal, Role,
    RoleDefinition, RoleId, UserId,
};
use crate::store::{MenuStore, MenuTransaction};

#[derive(Debug, Clone, Default)]
struct MemoryState {
    sequence: i64,
    menus: BTreeMap<MenuId, MenuNode>,
    soft_deleted: BTreeSet<MenuId>,
    roles: BTreeMap<RoleId, Role>,
    apis: BTreeMap<ApiId, Api>,
    role_menus: BTreeSet<(RoleId, MenuId)>,
    menu_apis: BTreeSet<(MenuId, ApiId)>,
    user_roles: BTreeSet<(UserId, RoleId)>,
}

impl MemoryState {
    fn next_id(&mut self) -> i64 {
        self.sequence += 1;
        self.sequence
    }

    fn live_menu(&self, menu_id: MenuId) -> bool {
        self.menus.contains_key(&menu_id) && !self.soft_deleted.contains(&menu_id)
    }
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<RwLock<MemoryState>>,
    writer: Arc<Mutex<()>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn seed_role(&self, definition: RoleDefinition) -> RoleId {
        let _writer = self.writer.lock().await;
        let mut state = self.state.write().await;
        let role_id = RoleId(state.next_id());
        state.roles.insert(role_id, definition.into_role(role_id));
        role_id
    }

    pub async fn seed_api(&self, path: &str, method: &str) -> ApiId {
        let _writer = self.writer.lock().await;
        let mut state = self.state.write().await;
        let api_id = ApiId(state.next_id());
        state.apis.insert(
            api_id,
            Api {
                id: api_id,
                path: path.to_string(),
                method: method.to_string(),
                title: String::new(),
            },
        );
        api_id
    }

    pub async fn assign_user_role(&self, user_id: UserId, role_id: RoleId) {
        let _writer = self.writer.lock().await;
        self.state.write().await.user_roles.insert((user_id, role_id));
    }

    /// Every stored Api, linked or not.
    pub async fn all_apis(&self) -> Vec<Api> {
        self.state.read().await.apis.values().cloned().collect()
    }

    /// Ids of menus that were soft deleted.
    pub async fn soft_deleted_menu_ids(&self) -> Vec<MenuId> {
        self.state.read().await.soft_deleted.iter().copied().collect()
    }
}

impl MenuStore for MemoryStore {
    type Tx = MemoryTransaction;

    async fn begin(&self) -> Result<MemoryTransaction> {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let working = self.state.read().await.clone();
        Ok(MemoryTransaction {
            working,
            shared: Arc::clone(&self.state),
            guard: Some(guard),
        })
    }

    async fn read(&self) -> Result<MemoryTransaction> {
        let working = self.state.read().await.clone();
        Ok(MemoryTransaction {
            working,
            shared: Arc::clone(&self.state),
            guard: None,
        })
    }
}

pub struct MemoryTransaction {
    working: MemoryState,
    shared: Arc<RwLock<MemoryState>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl MemoryTransaction {
    fn writable(&mut self) -> Result<&mut MemoryState> {
        if self.guard.is_none() {
            return Err(LibError::database(
                "Cannot write through a read-only transaction",
                anyhow!("write attempted on read-only memory transaction"),
            ));
        }
        Ok(&mut self.working)
    }
}

impl MenuTransaction for MemoryTransaction {
    async fn menus(&mut self) -> Result<Vec<MenuNode>> {
        let state = &self.working;
        Ok(state
            .menus
            .values()
            .filter(|menu| !state.soft_deleted.contains(&menu.id))
            .cloned()
            .collect())
    }

    async fn roles(&mut self) -> Result<Vec<Role>> {
        Ok(self.working.roles.values().cloned().collect())
    }

    async fn user_role_ids(&mut self, principal: Principal) -> Result<Vec<RoleId>> {
        let state = &self.working;
        Ok(state
            .user_roles
            .iter()
            .filter(|(user_id, _)| *user_id == principal.user_id)
            .filter_map(|(_, role_id)| state.roles.get(role_id))
            .filter(|role| principal.tenant_id.is_none() || role.tenant_id == principal.tenant_id)
            .map(|role| role.id)
            .collect())
    }

    async fn role_menu_ids(&mut self, role_ids: &[RoleId]) -> Result<Vec<MenuId>> {
        let ids: BTreeSet<MenuId> = self
            .working
            .role_menus
            .iter()
            .filter(|(role_id, _)| role_ids.contains(role_id))
            .map(|(_, menu_id)| *menu_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn count_role_links_for_menus(&mut self, menu_ids: &[MenuId]) -> Result<u64> {
        Ok(self
            .working
            .role_menus
            .iter()
            .filter(|(_, menu_id)| menu_ids.contains(menu_id))
            .count() as u64)
    }

    async fn count_menu_links_for_role(&mut self, role_id: RoleId) -> Result<u64> {
        Ok(self
            .working
            .role_menus
            .iter()
            .filter(|(linked, _)| *linked == role_id)
            .count() as u64)
    }

    async fn menu_api_links(&mut self, menu_ids: &[MenuId]) -> Result<Vec<MenuApiLink>> {
        Ok(self
            .working
            .menu_apis
            .iter()
            .filter(|(menu_id, _)| menu_ids.contains(menu_id))
            .map(|(menu_id, api_id)| MenuApiLink {
                menu_id: *menu_id,
                api_id: *api_id,
            })
            .collect())
    }

    async fn api_ids_linked_outside(
        &mut self,
        api_ids: &[ApiId],
        menu_ids: &[MenuId],
    ) -> Result<Vec<ApiId>> {
        let ids: BTreeSet<ApiId> = self
            .working
            .menu_apis
            .iter()
            .filter(|(menu_id, api_id)| api_ids.contains(api_id) && !menu_ids.contains(menu_id))
            .map(|(_, api_id)| *api_id)
            .collect();
        Ok(ids.into_iter().collect())
    }

    async fn count_apis(&mut self, api_ids: &[ApiId]) -> Result<u64> {
        let distinct: BTreeSet<&ApiId> = api_ids.iter().collect();
        Ok(distinct
            .into_iter()
            .filter(|api_id| self.working.apis.contains_key(*api_id))
            .count() as u64)
    }

    async fn apis(&mut self, api_ids: &[ApiId]) -> Result<Vec<Api>> {
        Ok(api_ids
            .iter()
            .filter_map(|api_id| self.working.apis.get(api_id))
            .cloned()
            .collect())
    }

    async fn find_api(&mut self, path: &str, method: &str) -> Result<Option<Api>> {
        Ok(self
            .working
            .apis
            .values()
            .find(|api| api.path == path && api.method == method)
            .cloned())
    }

    async fn insert_menu(
        &mut self,
        definition: &MenuDefinition,
        created_by: Option<UserId>,
    ) -> Result<MenuId> {
        let state = self.writable()?;
        let menu_id = MenuId(state.next_id());
        state
            .menus
            .insert(menu_id, definition.clone().into_node(menu_id, created_by));
        Ok(menu_id)
    }

    async fn update_menu(&mut self, menu_id: MenuId, definition: &MenuDefinition) -> Result<()> {
        let state = self.writable()?;
        if !state.live_menu(menu_id) {
            return Err(LibError::not_found(
                "Menu not found",
                anyhow!("menu {} not found", menu_id),
            ));
        }
        let created_by = state.menus.get(&menu_id).and_then(|menu| menu.created_by);
        state
            .menus
            .insert(menu_id, definition.clone().into_node(menu_id, created_by));
        Ok(())
    }

    async fn soft_delete_menu(&mut self, menu_id: MenuId) -> Result<()> {
        self.writable()?.soft_deleted.insert(menu_id);
        Ok(())
    }

    async fn delete_menus(&mut self, menu_ids: &[MenuId]) -> Result<()> {
        let state = self.writable()?;
        for menu_id in menu_ids {
            state.menus.remove(menu_id);
            state.soft_deleted.remove(menu_id);
        }
        Ok(())
    }

    async fn delete_role_links_for_menus(&mut self, menu_ids: &[MenuId]) -> Result<()> {
        self.writable()?
            .role_menus
            .retain(|(_, menu_id)| !menu_ids.contains(menu_id));
        Ok(())
    }

    async fn delete_menu_api_links(&mut self, menu_ids: &[MenuId]) -> Result<()> {
        self.writable()?
            .menu_apis
            .retain(|(menu_id, _)| !menu_ids.contains(menu_id));
        Ok(())
    }

    async fn insert_menu_api_links(&mut self, links: &[MenuApiLink]) -> Result<()> {
        let state = self.writable()?;
        for link in links {
            if !state.live_menu(link.menu_id) || !state.apis.contains_key(&link.api_id) {
                return Err(LibError::integrity(
                    "menu_api_link_dangling",
                    "Menu or Api disappeared during the update",
                    anyhow!("link {:?} references a missing row", link),
                ));
            }
            state.menu_apis.insert((link.menu_id, link.api_id));
        }
        Ok(())
    }

    async fn insert_api(&mut self, api: &NewApi) -> Result<ApiId> {
        let state = self.writable()?;
        let api_id = ApiId(state.next_id());
        state.apis.insert(
            api_id,
            Api {
                id: api_id,
                path: api.path.clone(),
                method: api.method.clone(),
                title: api.title.clone(),
            },
        );
        Ok(api_id)
    }

    async fn delete_apis(&mut self, api_ids: &[ApiId]) -> Result<()> {
        let state = self.writable()?;
        for api_id in api_ids {
            state.apis.remove(api_id);
        }
        Ok(())
    }

    async fn insert_role(&mut self, definition: &RoleDefinition) -> Result<RoleId> {
        let state = self.writable()?;
        let role_id = RoleId(state.next_id());
        state
            .roles
            .insert(role_id, definition.clone().into_role(role_id));
        Ok(role_id)
    }

    async fn update_role(&mut self, role_id: RoleId, definition: &RoleDefinition) -> Result<()> {
        let state = self.writable()?;
        if !state.roles.contains_key(&role_id) {
            return Err(LibError::not_found(
                "Role not found",
                anyhow!("role {} not found", role_id),
            ));
        }
        state
            .roles
            .insert(role_id, definition.clone().into_role(role_id));
        Ok(())
    }

    async fn delete_role(&mut self, role_id: RoleId) -> Result<()> {
        let state = self.writable()?;
        state.roles.remove(&role_id);
        state.user_roles.retain(|(_, linked)| *linked != role_id);
        Ok(())
    }

    async fn replace_role_menus(&mut self, role_id: RoleId, menu_ids: &[MenuId]) -> Result<()> {
        let state = self.writable()?;
        state.role_menus.retain(|(linked, _)| *linked != role_id);
        for menu_id in menu_ids {
            if !state.live_menu(*menu_id) {
                return Err(LibError::integrity(
                    "role_menu_link_dangling",
                    "Menu disappeared during the update",
                    anyhow!("menu {} missing while linking role {}", menu_id, role_id),
                ));
            }
            state.role_menus.insert((role_id, *menu_id));
        }
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let MemoryTransaction {
            working,
            shared,
            guard,
        } = self;
        if guard.is_some() {
            *shared.write().await = working;
        }
        Ok(())
    }
}
