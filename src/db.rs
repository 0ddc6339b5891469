use anyhow::anyhow;
use once_cell::sync::Lazy;
use sqlx::migrate::{MigrateError, Migrator};
use sqlx::{FromRow, PgPool, Postgres, Transaction};

use crate::error::{LibError, Result};
use crate::models::{
    Api, ApiId, DataScope, MenuApiLink, MenuDefinition, MenuId, MenuNode, MenuType, NewApi,
    Principal, Role, RoleDefinition, RoleId, TenantId, UserId,
};
use crate::store::{MenuStore, MenuTransaction};

pub static MIGRATOR: Lazy<Migrator> = Lazy::new(|| {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
});

pub async fn create_menu_tables(pool: &PgPool) -> std::result::Result<(), MigrateError> {
    MIGRATOR.run(pool).await
}

#[derive(Debug, Clone, FromRow)]
struct MenuRow {
    id: i64,
    parent_id: Option<i64>,
    menu_type: i16,
    name: String,
    path: String,
    component: String,
    title: String,
    permission: String,
    disabled: bool,
    sort_key: i32,
    created_by: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
struct RoleRow {
    id: i64,
    parent_id: Option<i64>,
    name: String,
    description: String,
    sort_key: i32,
    data_scope: i16,
    tenant_id: Option<i64>,
}

#[derive(Debug, Clone, FromRow)]
struct ApiRow {
    id: i64,
    path: String,
    method: String,
    title: String,
}

impl TryFrom<MenuRow> for MenuNode {
    type Error = LibError;

    fn try_from(row: MenuRow) -> Result<Self> {
        let menu_type = MenuType::from_db_value(row.menu_type).ok_or_else(|| {
            LibError::integrity(
                "menu_type_unknown",
                "Stored menu has an unknown type",
                anyhow!("menu {} has type {}", row.id, row.menu_type),
            )
        })?;
        Ok(MenuNode {
            id: MenuId(row.id),
            parent_id: row.parent_id.filter(|id| *id != 0).map(MenuId),
            menu_type,
            name: row.name,
            path: row.path,
            component: row.component,
            title: row.title,
            permission: row.permission,
            disabled: row.disabled,
            sort_key: row.sort_key,
            created_by: row.created_by.map(UserId),
        })
    }
}

impl TryFrom<RoleRow> for Role {
    type Error = LibError;

    fn try_from(row: RoleRow) -> Result<Self> {
        let data_scope = DataScope::from_db_value(row.data_scope).ok_or_else(|| {
            LibError::integrity(
                "role_data_scope_unknown",
                "Stored role has an unknown data scope",
                anyhow!("role {} has data scope {}", row.id, row.data_scope),
            )
        })?;
        Ok(Role {
            id: RoleId(row.id),
            parent_id: row.parent_id.filter(|id| *id != 0).map(RoleId),
            name: row.name,
            description: row.description,
            sort_key: row.sort_key,
            data_scope,
            tenant_id: row.tenant_id.map(TenantId),
        })
    }
}

impl From<ApiRow> for Api {
    fn from(row: ApiRow) -> Self {
        Self {
            id: ApiId(row.id),
            path: row.path,
            method: row.method,
            title: row.title,
        }
    }
}

fn db_err(public: &'static str, err: sqlx::Error) -> LibError {
    LibError::database(public, anyhow!(err))
}

/// Foreign key failures mean a referenced row vanished mid-transaction.
fn write_err(public: &'static str, err: sqlx::Error) -> LibError {
    let dangling = err
        .as_database_error()
        .is_some_and(|db| db.is_foreign_key_violation());
    if dangling {
        LibError::integrity("reference_missing", public, anyhow!(err))
    } else {
        db_err(public, err)
    }
}

fn raw_ids<I: Copy + Into<i64>>(ids: &[I]) -> Vec<i64> {
    ids.iter().map(|id| (*id).into()).collect()
}

#[derive(Debug, Clone)]
pub struct PgMenuStore {
    pool: PgPool,
}

impl PgMenuStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl MenuStore for PgMenuStore {
    type Tx = PgMenuTransaction;

    async fn begin(&self) -> Result<PgMenuTransaction> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        Ok(PgMenuTransaction { tx })
    }

    async fn read(&self) -> Result<PgMenuTransaction> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        sqlx::query("SET TRANSACTION READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(|err| db_err("Failed to start transaction", err))?;
        Ok(PgMenuTransaction { tx })
    }
}

/// Rolled back on drop unless committed.
pub struct PgMenuTransaction {
    tx: Transaction<'static, Postgres>,
}

impl MenuTransaction for PgMenuTransaction {
    async fn menus(&mut self) -> Result<Vec<MenuNode>> {
        let rows: Vec<MenuRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, menu_type, name, path, component, title, permission,
                   disabled, sort_key, created_by
            FROM menu.menus
            WHERE deleted_at IS NULL
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query menus", err))?;

        rows.into_iter().map(MenuNode::try_from).collect()
    }

    async fn roles(&mut self) -> Result<Vec<Role>> {
        let rows: Vec<RoleRow> = sqlx::query_as(
            r#"
            SELECT id, parent_id, name, description, sort_key, data_scope, tenant_id
            FROM menu.roles
            ORDER BY id
            "#,
        )
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query roles", err))?;

        rows.into_iter().map(Role::try_from).collect()
    }

    async fn user_role_ids(&mut self, principal: Principal) -> Result<Vec<RoleId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT r.id
            FROM menu.user_roles ur
            JOIN menu.roles r ON r.id = ur.role_id
            WHERE ur.user_id = $1
              AND ($2::BIGINT IS NULL OR r.tenant_id = $2)
            ORDER BY r.id
            "#,
        )
        .bind(principal.user_id.0)
        .bind(principal.tenant_id.map(|id| id.0))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query user roles", err))?;

        Ok(rows.into_iter().map(|(id,)| RoleId(id)).collect())
    }

    async fn role_menu_ids(&mut self, role_ids: &[RoleId]) -> Result<Vec<MenuId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT menu_id
            FROM menu.role_menus
            WHERE role_id = ANY($1)
            ORDER BY menu_id
            "#,
        )
        .bind(raw_ids(role_ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query role menus", err))?;

        Ok(rows.into_iter().map(|(id,)| MenuId(id)).collect())
    }

    async fn count_role_links_for_menus(&mut self, menu_ids: &[MenuId]) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM menu.role_menus
            WHERE menu_id = ANY($1)
            "#,
        )
        .bind(raw_ids(menu_ids))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to count role menus", err))?;

        Ok(count.0 as u64)
    }

    async fn count_menu_links_for_role(&mut self, role_id: RoleId) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM menu.role_menus
            WHERE role_id = $1
            "#,
        )
        .bind(role_id.0)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to count role menus", err))?;

        Ok(count.0 as u64)
    }

    async fn menu_api_links(&mut self, menu_ids: &[MenuId]) -> Result<Vec<MenuApiLink>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            r#"
            SELECT menu_id, api_id
            FROM menu.menu_apis
            WHERE menu_id = ANY($1)
            ORDER BY menu_id, api_id
            "#,
        )
        .bind(raw_ids(menu_ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query menu apis", err))?;

        Ok(rows
            .into_iter()
            .map(|(menu_id, api_id)| MenuApiLink {
                menu_id: MenuId(menu_id),
                api_id: ApiId(api_id),
            })
            .collect())
    }

    async fn api_ids_linked_outside(
        &mut self,
        api_ids: &[ApiId],
        menu_ids: &[MenuId],
    ) -> Result<Vec<ApiId>> {
        let rows: Vec<(i64,)> = sqlx::query_as(
            r#"
            SELECT DISTINCT api_id
            FROM menu.menu_apis
            WHERE api_id = ANY($1)
              AND NOT (menu_id = ANY($2))
            ORDER BY api_id
            "#,
        )
        .bind(raw_ids(api_ids))
        .bind(raw_ids(menu_ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query shared apis", err))?;

        Ok(rows.into_iter().map(|(id,)| ApiId(id)).collect())
    }

    async fn count_apis(&mut self, api_ids: &[ApiId]) -> Result<u64> {
        let count: (i64,) = sqlx::query_as(
            r#"
            SELECT COUNT(*)
            FROM menu.apis
            WHERE id = ANY($1)
            "#,
        )
        .bind(raw_ids(api_ids))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to count apis", err))?;

        Ok(count.0 as u64)
    }

    async fn apis(&mut self, api_ids: &[ApiId]) -> Result<Vec<Api>> {
        let rows: Vec<ApiRow> = sqlx::query_as(
            r#"
            SELECT id, path, method, title
            FROM menu.apis
            WHERE id = ANY($1)
            ORDER BY id
            "#,
        )
        .bind(raw_ids(api_ids))
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query apis", err))?;

        Ok(rows.into_iter().map(Api::from).collect())
    }

    async fn find_api(&mut self, path: &str, method: &str) -> Result<Option<Api>> {
        let row: Option<ApiRow> = sqlx::query_as(
            r#"
            SELECT id, path, method, title
            FROM menu.apis
            WHERE path = $1
              AND method = $2
            LIMIT 1
            "#,
        )
        .bind(path)
        .bind(method)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to query api", err))?;

        Ok(row.map(Api::from))
    }

    async fn insert_menu(
        &mut self,
        definition: &MenuDefinition,
        created_by: Option<UserId>,
    ) -> Result<MenuId> {
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO menu.menus (
                parent_id,
                menu_type,
                name,
                path,
                component,
                title,
                permission,
                disabled,
                sort_key,
                created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING id
            "#,
        )
        .bind(definition.parent_id.map(|id| id.0))
        .bind(definition.menu_type.as_db_value())
        .bind(&definition.name)
        .bind(&definition.path)
        .bind(&definition.component)
        .bind(&definition.title)
        .bind(&definition.permission)
        .bind(definition.disabled)
        .bind(definition.sort_key)
        .bind(created_by.map(|id| id.0))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to create menu", err))?;

        Ok(MenuId(id.0))
    }

    async fn update_menu(&mut self, menu_id: MenuId, definition: &MenuDefinition) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE menu.menus
            SET parent_id = $1,
                menu_type = $2,
                name = $3,
                path = $4,
                component = $5,
                title = $6,
                permission = $7,
                disabled = $8,
                sort_key = $9,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $10
              AND deleted_at IS NULL
            "#,
        )
        .bind(definition.parent_id.map(|id| id.0))
        .bind(definition.menu_type.as_db_value())
        .bind(&definition.name)
        .bind(&definition.path)
        .bind(&definition.component)
        .bind(&definition.title)
        .bind(&definition.permission)
        .bind(definition.disabled)
        .bind(definition.sort_key)
        .bind(menu_id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to update menu", err))?;

        if result.rows_affected() == 0 {
            return Err(LibError::not_found(
                "Menu not found",
                anyhow!("menu {} not found", menu_id),
            ));
        }
        Ok(())
    }

    async fn soft_delete_menu(&mut self, menu_id: MenuId) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE menu.menus
            SET deleted_at = CURRENT_TIMESTAMP
            WHERE id = $1
            "#,
        )
        .bind(menu_id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to delete menu", err))?;

        Ok(())
    }

    async fn delete_menus(&mut self, menu_ids: &[MenuId]) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM menu.menus
            WHERE id = ANY($1)
            "#,
        )
        .bind(raw_ids(menu_ids))
        .execute(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to delete menus", err))?;

        Ok(())
    }

    async fn delete_role_links_for_menus(&mut self, menu_ids: &[MenuId]) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM menu.role_menus
            WHERE menu_id = ANY($1)
            "#,
        )
        .bind(raw_ids(menu_ids))
        .execute(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to delete role menus", err))?;

        Ok(())
    }

    async fn delete_menu_api_links(&mut self, menu_ids: &[MenuId]) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM menu.menu_apis
            WHERE menu_id = ANY($1)
            "#,
        )
        .bind(raw_ids(menu_ids))
        .execute(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to delete menu apis", err))?;

        Ok(())
    }

    async fn insert_menu_api_links(&mut self, links: &[MenuApiLink]) -> Result<()> {
        for link in links {
            sqlx::query(
                r#"
                INSERT INTO menu.menu_apis (menu_id, api_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(link.menu_id.0)
            .bind(link.api_id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to link menu apis", err))?;
        }

        Ok(())
    }

    async fn insert_api(&mut self, api: &NewApi) -> Result<ApiId> {
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO menu.apis (path, method, title, created_by)
            VALUES ($1, $2, $3, $4)
            RETURNING id
            "#,
        )
        .bind(&api.path)
        .bind(&api.method)
        .bind(&api.title)
        .bind(api.created_by.map(|id| id.0))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to create api", err))?;

        Ok(ApiId(id.0))
    }

    async fn delete_apis(&mut self, api_ids: &[ApiId]) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM menu.apis
            WHERE id = ANY($1)
            "#,
        )
        .bind(raw_ids(api_ids))
        .execute(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to delete apis", err))?;

        Ok(())
    }

    async fn insert_role(&mut self, definition: &RoleDefinition) -> Result<RoleId> {
        let id: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO menu.roles (parent_id, name, description, sort_key, data_scope, tenant_id)
            VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING id
            "#,
        )
        .bind(definition.parent_id.map(|id| id.0))
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.sort_key)
        .bind(definition.data_scope.as_db_value())
        .bind(definition.tenant_id.map(|id| id.0))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to create role", err))?;

        Ok(RoleId(id.0))
    }

    async fn update_role(&mut self, role_id: RoleId, definition: &RoleDefinition) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE menu.roles
            SET parent_id = $1,
                name = $2,
                description = $3,
                sort_key = $4,
                data_scope = $5,
                tenant_id = $6,
                updated_at = CURRENT_TIMESTAMP
            WHERE id = $7
            "#,
        )
        .bind(definition.parent_id.map(|id| id.0))
        .bind(&definition.name)
        .bind(&definition.description)
        .bind(definition.sort_key)
        .bind(definition.data_scope.as_db_value())
        .bind(definition.tenant_id.map(|id| id.0))
        .bind(role_id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to update role", err))?;

        if result.rows_affected() == 0 {
            return Err(LibError::not_found(
                "Role not found",
                anyhow!("role {} not found", role_id),
            ));
        }
        Ok(())
    }

    async fn delete_role(&mut self, role_id: RoleId) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM menu.roles
            WHERE id = $1
            "#,
        )
        .bind(role_id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| write_err("Failed to delete role", err))?;

        Ok(())
    }

    async fn replace_role_menus(&mut self, role_id: RoleId, menu_ids: &[MenuId]) -> Result<()> {
        sqlx::query(
            r#"
            DELETE FROM menu.role_menus
            WHERE role_id = $1
            "#,
        )
        .bind(role_id.0)
        .execute(&mut *self.tx)
        .await
        .map_err(|err| db_err("Failed to replace role menus", err))?;

        for menu_id in menu_ids {
            sqlx::query(
                r#"
                INSERT INTO menu.role_menus (role_id, menu_id)
                VALUES ($1, $2)
                ON CONFLICT DO NOTHING
                "#,
            )
            .bind(role_id.0)
            .bind(menu_id.0)
            .execute(&mut *self.tx)
            .await
            .map_err(|err| write_err("Failed to replace role menus", err))?;
        }

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx
            .commit()
            .await
            .map_err(|err| db_err("Failed to commit transaction", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn menu_row(menu_type: i16, parent_id: Option<i64>) -> MenuRow {
        MenuRow {
            id: 4,
            parent_id,
            menu_type,
            name: "users".to_string(),
            path: "/users".to_string(),
            component: "users/index".to_string(),
            title: "Users".to_string(),
            permission: String::new(),
            disabled: false,
            sort_key: 2,
            created_by: Some(9),
        }
    }

    #[test]
    fn menu_rows_map_zero_parent_to_root() {
        let node = MenuNode::try_from(menu_row(2, Some(0))).expect("row should convert");
        assert_eq!(node.parent_id, None);
        assert_eq!(node.menu_type, MenuType::Menu);
        assert_eq!(node.created_by, Some(UserId(9)));

        let node = MenuNode::try_from(menu_row(2, Some(1))).expect("row should convert");
        assert_eq!(node.parent_id, Some(MenuId(1)));
    }

    #[test]
    fn unknown_stored_type_is_an_integrity_error() {
        let err = MenuNode::try_from(menu_row(8, None)).expect_err("type 8 is unknown");
        assert_eq!(err.code, "menu_type_unknown");
    }

    #[test]
    fn raw_ids_unwrap_newtypes() {
        assert_eq!(raw_ids(&[MenuId(3), MenuId(5)]), vec![3, 5]);
    }
}
