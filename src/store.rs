use std::future::Future;

use crate::error::Result;
use crate::models::{
    Api, ApiId, MenuApiLink, MenuDefinition, MenuId, MenuNode, NewApi, Principal, Role,
    RoleDefinition, RoleId, UserId,
};

/// A transactional home for menus, roles, Apis and their links.
///
/// Both menu and role trees are small, so reads return whole tables and filtering happens
/// in memory.
pub trait MenuStore: Clone + Send + Sync + 'static {
    type Tx: MenuTransaction;

    /// Starts a read-write unit of work.
    fn begin(&self) -> impl Future<Output = Result<Self::Tx>> + Send;

    /// Starts a read-only unit of work that takes no write locks.
    fn read(&self) -> impl Future<Output = Result<Self::Tx>> + Send;
}

/// One atomic unit of work.
///
/// Nothing is visible to other units until [`MenuTransaction::commit`]; dropping the
/// transaction discards every write made through it.
pub trait MenuTransaction: Send {
    /// All live menus.
    fn menus(&mut self) -> impl Future<Output = Result<Vec<MenuNode>>> + Send;

    fn roles(&mut self) -> impl Future<Output = Result<Vec<Role>>> + Send;

    /// Roles assigned to the principal, restricted to its tenant when it has one.
    fn user_role_ids(
        &mut self,
        principal: Principal,
    ) -> impl Future<Output = Result<Vec<RoleId>>> + Send;

    /// Distinct menus linked to any of the roles.
    fn role_menu_ids(
        &mut self,
        role_ids: &[RoleId],
    ) -> impl Future<Output = Result<Vec<MenuId>>> + Send;

    fn count_role_links_for_menus(
        &mut self,
        menu_ids: &[MenuId],
    ) -> impl Future<Output = Result<u64>> + Send;

    fn count_menu_links_for_role(
        &mut self,
        role_id: RoleId,
    ) -> impl Future<Output = Result<u64>> + Send;

    fn menu_api_links(
        &mut self,
        menu_ids: &[MenuId],
    ) -> impl Future<Output = Result<Vec<MenuApiLink>>> + Send;

    /// Those of `api_ids` still linked to a menu outside `menu_ids`.
    fn api_ids_linked_outside(
        &mut self,
        api_ids: &[ApiId],
        menu_ids: &[MenuId],
    ) -> impl Future<Output = Result<Vec<ApiId>>> + Send;

    fn count_apis(&mut self, api_ids: &[ApiId]) -> impl Future<Output = Result<u64>> + Send;

    fn apis(&mut self, api_ids: &[ApiId]) -> impl Future<Output = Result<Vec<Api>>> + Send;

    fn find_api(
        &mut self,
        path: &str,
        method: &str,
    ) -> impl Future<Output = Result<Option<Api>>> + Send;

    fn insert_menu(
        &mut self,
        definition: &MenuDefinition,
        created_by: Option<UserId>,
    ) -> impl Future<Output = Result<MenuId>> + Send;

    fn update_menu(
        &mut self,
        menu_id: MenuId,
        definition: &MenuDefinition,
    ) -> impl Future<Output = Result<()>> + Send;

    /// Hides a menu from every read while keeping its row.
    fn soft_delete_menu(&mut self, menu_id: MenuId) -> impl Future<Output = Result<()>> + Send;

    fn delete_menus(&mut self, menu_ids: &[MenuId]) -> impl Future<Output = Result<()>> + Send;

    fn delete_role_links_for_menus(
        &mut self,
        menu_ids: &[MenuId],
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_menu_api_links(
        &mut self,
        menu_ids: &[MenuId],
    ) -> impl Future<Output = Result<()>> + Send;

    /// Inserts links, ignoring ones that already exist.
    fn insert_menu_api_links(
        &mut self,
        links: &[MenuApiLink],
    ) -> impl Future<Output = Result<()>> + Send;

    fn insert_api(&mut self, api: &NewApi) -> impl Future<Output = Result<ApiId>> + Send;

    fn delete_apis(&mut self, api_ids: &[ApiId]) -> impl Future<Output = Result<()>> + Send;

    fn insert_role(
        &mut self,
        definition: &RoleDefinition,
    ) -> impl Future<Output = Result<RoleId>> + Send;

    fn update_role(
        &mut self,
        role_id: RoleId,
        definition: &RoleDefinition,
    ) -> impl Future<Output = Result<()>> + Send;

    fn delete_role(&mut self, role_id: RoleId) -> impl Future<Output = Result<()>> + Send;

    fn replace_role_menus(
        &mut self,
        role_id: RoleId,
        menu_ids: &[MenuId],
    ) -> impl Future<Output = Result<()>> + Send;

    fn commit(self) -> impl Future<Output = Result<()>> + Send;
}

/// Cached role-to-endpoint permission mappings kept by an external policy engine.
pub trait PolicyCache: Send + Sync {
    fn refresh_role_api_permissions_for_menu(
        &self,
        menu_id: MenuId,
    ) -> impl Future<Output = Result<()>> + Send;

    fn refresh_role_api_permissions(
        &self,
        role_id: RoleId,
    ) -> impl Future<Output = Result<()>> + Send;
}

/// For hosts without a policy engine.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopPolicyCache;

impl PolicyCache for NoopPolicyCache {
    async fn refresh_role_api_permissions_for_menu(&self, _menu_id: MenuId) -> Result<()> {
        Ok(())
    }

    async fn refresh_role_api_permissions(&self, _role_id: RoleId) -> Result<()> {
        Ok(())
    }
}
