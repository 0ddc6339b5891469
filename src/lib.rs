#![recursion_limit = "256"]

pub mod algorithms;
pub mod config;
#[cfg(feature = "sqlx")]
pub mod db;
pub mod document;
pub mod error;
pub mod import;
pub mod invariants;
pub mod memory;
pub mod models;
pub mod operations;
pub mod permissions;
pub mod store;

pub mod prelude {
    pub use crate::algorithms::{
        TreeItem, TreeNode, TreeWarning, build_forest, build_sorted_forest, descendant_ids,
        fix_orphan_parent_ids, flatten, log_tree_warning, sort_forest,
    };
    pub use crate::config::AccessConfig;
    #[cfg(feature = "sqlx")]
    pub use crate::db::{PgMenuStore, create_menu_tables};
    pub use crate::document::{DocumentApi, DocumentNode};
    pub use crate::error::{ErrorDetails, ErrorKind, LibError, Result};
    pub use crate::import::ImportReport;
    pub use crate::invariants::{DocumentViolation, would_cycle};
    pub use crate::memory::MemoryStore;
    pub use crate::models::{
        Api, ApiId, BatchDeletePayload, DataScope, ExportDocument, ExportMenusQuery, MenuId,
        MenuListing, MenuNode, MenuPayload, MenuType, Principal, Role, RoleId, RolePayload,
        SetMenuApisPayload, SetRoleMenusPayload, TenantId, UpdateMenuPayload, UpdateRolePayload,
        UserId,
    };
    pub use crate::operations::{
        BatchDeleteReport, MenuOperation, MenuOperationResult, MenuOperations,
    };
    pub use crate::permissions::{WILDCARD_PERMISSION, ancestor_closure};
    pub use crate::store::{MenuStore, MenuTransaction, NoopPolicyCache, PolicyCache};
}
