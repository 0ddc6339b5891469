use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

use crate::algorithms::TreeItem;
use crate::error::{LibError, Result};

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
        )]
        #[serde(transparent)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = std::num::ParseIntError;

            fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
                i64::from_str(s).map(Self)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl From<$name> for i64 {
            fn from(value: $name) -> Self {
                value.0
            }
        }
    };
}

id_type!(
    /// Store-assigned menu node identifier.
    MenuId
);
id_type!(RoleId);
id_type!(ApiId);
id_type!(UserId);
id_type!(TenantId);

/// Serde adapter for parent references: `0` on the wire is the root, `None` in memory.
pub mod parent_ref {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S, T>(value: &Option<T>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Copy + Into<i64>,
    {
        serializer.serialize_i64(value.map(Into::into).unwrap_or(0))
    }

    pub fn deserialize<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
    where
        D: Deserializer<'de>,
        T: From<i64>,
    {
        let raw = Option::<i64>::deserialize(deserializer)?;
        Ok(match raw {
            None | Some(0) => None,
            Some(id) => Some(T::from(id)),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum MenuType {
    Directory,
    Menu,
    Button,
}

impl MenuType {
    pub const fn as_db_value(self) -> i16 {
        match self {
            MenuType::Directory => 1,
            MenuType::Menu => 2,
            MenuType::Button => 3,
        }
    }

    pub fn from_db_value(value: i16) -> Option<Self> {
        match value {
            1 => Some(MenuType::Directory),
            2 => Some(MenuType::Menu),
            3 => Some(MenuType::Button),
            _ => None,
        }
    }

    /// Directories may hold directories and menus, menus hold buttons, buttons hold nothing.
    pub const fn can_parent(self, child: MenuType) -> bool {
        matches!(
            (self, child),
            (MenuType::Directory, MenuType::Directory)
                | (MenuType::Directory, MenuType::Menu)
                | (MenuType::Menu, MenuType::Button)
        )
    }

    pub const fn is_routable(self) -> bool {
        matches!(self, MenuType::Directory | MenuType::Menu)
    }
}

impl TryFrom<u8> for MenuType {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        MenuType::from_db_value(value as i16).ok_or_else(|| format!("unknown menu type {value}"))
    }
}

impl From<MenuType> for u8 {
    fn from(value: MenuType) -> Self {
        value.as_db_value() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuNode {
    pub id: MenuId,
    #[serde(with = "parent_ref", default)]
    pub parent_id: Option<MenuId>,
    #[serde(rename = "type")]
    pub menu_type: MenuType,
    pub name: String,
    pub path: String,
    pub component: String,
    pub title: String,
    pub permission: String,
    pub disabled: bool,
    pub sort_key: i32,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub created_by: Option<UserId>,
}

impl MenuNode {
    pub fn is_button(&self) -> bool {
        self.menu_type == MenuType::Button
    }
}

impl TreeItem for MenuNode {
    type Id = MenuId;

    fn id(&self) -> MenuId {
        self.id
    }

    fn parent_id(&self) -> Option<MenuId> {
        self.parent_id
    }

    fn sort_key(&self) -> i32 {
        self.sort_key
    }

    fn clear_parent(&mut self) {
        self.parent_id = None;
    }
}

/// A menu together with the backend endpoints it exposes, used for administrative listings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuListing {
    #[serde(flatten)]
    pub menu: MenuNode,
    pub apis: Vec<Api>,
}

impl TreeItem for MenuListing {
    type Id = MenuId;

    fn id(&self) -> MenuId {
        self.menu.id
    }

    fn parent_id(&self) -> Option<MenuId> {
        self.menu.parent_id
    }

    fn sort_key(&self) -> i32 {
        self.menu.sort_key
    }

    fn clear_parent(&mut self) {
        self.menu.parent_id = None;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(try_from = "u8", into = "u8")]
pub enum DataScope {
    #[default]
    All,
    Custom,
    Department,
    DepartmentAndBelow,
}

impl DataScope {
    pub const fn as_db_value(self) -> i16 {
        match self {
            DataScope::All => 1,
            DataScope::Custom => 2,
            DataScope::Department => 3,
            DataScope::DepartmentAndBelow => 4,
        }
    }

    pub fn from_db_value(value: i16) -> Option<Self> {
        match value {
            1 => Some(DataScope::All),
            2 => Some(DataScope::Custom),
            3 => Some(DataScope::Department),
            4 => Some(DataScope::DepartmentAndBelow),
            _ => None,
        }
    }
}

impl TryFrom<u8> for DataScope {
    type Error = String;

    fn try_from(value: u8) -> std::result::Result<Self, Self::Error> {
        DataScope::from_db_value(value as i16).ok_or_else(|| format!("unknown data scope {value}"))
    }
}

impl From<DataScope> for u8 {
    fn from(value: DataScope) -> Self {
        value.as_db_value() as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: RoleId,
    #[serde(with = "parent_ref", default)]
    pub parent_id: Option<RoleId>,
    pub name: String,
    pub description: String,
    pub sort_key: i32,
    pub data_scope: DataScope,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub tenant_id: Option<TenantId>,
}

impl TreeItem for Role {
    type Id = RoleId;

    fn id(&self) -> RoleId {
        self.id
    }

    fn parent_id(&self) -> Option<RoleId> {
        self.parent_id
    }

    fn sort_key(&self) -> i32 {
        self.sort_key
    }

    fn clear_parent(&mut self) {
        self.parent_id = None;
    }
}

/// A backend endpoint a button grants access to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Api {
    pub id: ApiId,
    pub path: String,
    pub method: String,
    #[serde(default)]
    pub title: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewApi {
    pub path: String,
    pub method: String,
    pub title: String,
    pub created_by: Option<UserId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleMenuLink {
    pub role_id: RoleId,
    pub menu_id: MenuId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuApiLink {
    pub menu_id: MenuId,
    pub api_id: ApiId,
}

/// The authenticated caller, as resolved by the host application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Principal {
    pub user_id: UserId,
    /// `None` for principals of the global tenant.
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MenuPayload {
    #[serde(with = "parent_ref", default)]
    pub parent_id: Option<MenuId>,
    #[serde(rename = "type")]
    pub menu_type: MenuType,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub sort_key: i32,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateMenuPayload {
    pub id: MenuId,
    #[serde(flatten)]
    pub menu: MenuPayload,
}

/// A validated menu body, ready to be written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MenuDefinition {
    pub parent_id: Option<MenuId>,
    pub menu_type: MenuType,
    pub name: String,
    pub path: String,
    pub component: String,
    pub title: String,
    pub permission: String,
    pub disabled: bool,
    pub sort_key: i32,
}

impl MenuPayload {
    pub fn normalize(self) -> Result<MenuDefinition> {
        let name = self.name.trim().to_string();
        let path = self.path.trim().to_string();
        if self.menu_type.is_routable() && name.is_empty() {
            return Err(LibError::invalid(
                "Menu name is required",
                anyhow!("routable menu had empty name"),
            ));
        }
        if self.menu_type == MenuType::Button && self.parent_id.is_none() {
            return Err(LibError::invalid_with_code(
                "menu_button_requires_parent",
                "Select a parent menu for the button",
                anyhow!("button {} submitted without parent", name),
            ));
        }

        Ok(MenuDefinition {
            parent_id: self.parent_id,
            menu_type: self.menu_type,
            name,
            path,
            component: self.component.trim().to_string(),
            title: self.title.trim().to_string(),
            permission: self.permission.trim().to_string(),
            disabled: self.disabled,
            sort_key: self.sort_key,
        })
    }
}

impl MenuDefinition {
    pub fn into_node(self, id: MenuId, created_by: Option<UserId>) -> MenuNode {
        MenuNode {
            id,
            parent_id: self.parent_id,
            menu_type: self.menu_type,
            name: self.name,
            path: self.path,
            component: self.component,
            title: self.title,
            permission: self.permission,
            disabled: self.disabled,
            sort_key: self.sort_key,
            created_by,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RolePayload {
    #[serde(with = "parent_ref", default)]
    pub parent_id: Option<RoleId>,
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub sort_key: i32,
    #[serde(default)]
    pub data_scope: DataScope,
    #[serde(default)]
    pub tenant_id: Option<TenantId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRolePayload {
    pub id: RoleId,
    #[serde(flatten)]
    pub role: RolePayload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoleDefinition {
    pub parent_id: Option<RoleId>,
    pub name: String,
    pub description: String,
    pub sort_key: i32,
    pub data_scope: DataScope,
    pub tenant_id: Option<TenantId>,
}

impl RolePayload {
    pub fn normalize(self) -> Result<RoleDefinition> {
        let name = self.name.trim().to_string();
        if name.is_empty() {
            return Err(LibError::invalid(
                "Role name is required",
                anyhow!("empty role name"),
            ));
        }

        Ok(RoleDefinition {
            parent_id: self.parent_id,
            name,
            description: self.description.trim().to_string(),
            sort_key: self.sort_key,
            data_scope: self.data_scope,
            tenant_id: self.tenant_id,
        })
    }
}

impl RoleDefinition {
    pub fn into_role(self, id: RoleId) -> Role {
        Role {
            id,
            parent_id: self.parent_id,
            name: self.name,
            description: self.description,
            sort_key: self.sort_key,
            data_scope: self.data_scope,
            tenant_id: self.tenant_id,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetMenuApisPayload {
    pub menu_id: MenuId,
    pub api_ids: Vec<ApiId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetRoleMenusPayload {
    pub role_id: RoleId,
    pub menu_ids: Vec<MenuId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchDeletePayload {
    pub menu_ids: Vec<MenuId>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportMenusQuery {
    pub menu_ids: Vec<MenuId>,
}

/// A rendered export, ready to be offered as a download.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportDocument {
    pub filename: String,
    pub content: String,
}

impl ExportDocument {
    pub fn filename_at(timestamp: NaiveDateTime) -> String {
        format!("menu_export_{}.json", timestamp.format("%Y%m%d%H%M%S"))
    }
}
