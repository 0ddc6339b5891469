use std::collections::HashMap;

use anyhow::anyhow;
use serde::Serialize;

use crate::algorithms::{TreeNode, flatten};
use crate::document::{DocumentApi, DocumentEntry};
use crate::error::{LibError, Result};
use crate::models::{ApiId, MenuApiLink, MenuDefinition, MenuId, NewApi, UserId};
use crate::store::MenuTransaction;

/// What an import wrote.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportReport {
    /// New ids of the imported roots, in document order.
    pub root_ids: Vec<MenuId>,
    pub menus_created: usize,
    pub apis_created: usize,
    pub apis_reused: usize,
    pub links_created: usize,
}

/// Recreates a document forest under fresh store ids.
///
/// The first pass inserts every menu parent-first and records document id to store id. The
/// second pass resolves each entry's Apis by path and method, creating missing ones, and links
/// them to the new menu ids.
pub struct ImportRemapper {
    created_by: Option<UserId>,
    menu_ids: HashMap<MenuId, MenuId>,
    api_ids: HashMap<DocumentApi, ApiId>,
    report: ImportReport,
}

impl ImportRemapper {
    pub fn new(created_by: Option<UserId>) -> Self {
        Self {
            created_by,
            menu_ids: HashMap::new(),
            api_ids: HashMap::new(),
            report: ImportReport::default(),
        }
    }

    pub async fn import<T: MenuTransaction>(
        mut self,
        tx: &mut T,
        forest: Vec<TreeNode<DocumentEntry>>,
    ) -> Result<ImportReport> {
        let entries = flatten(forest);
        self.create_menus(tx, &entries).await?;
        self.link_apis(tx, &entries).await?;
        Ok(self.report)
    }

    async fn create_menus<T: MenuTransaction>(
        &mut self,
        tx: &mut T,
        entries: &[DocumentEntry],
    ) -> Result<()> {
        for entry in entries {
            let parent_id = match entry.parent_id {
                None => None,
                Some(old_parent) => Some(self.mapped(old_parent)?),
            };
            let definition = MenuDefinition {
                parent_id,
                menu_type: entry.menu_type,
                name: entry.name.clone(),
                path: entry.path.clone(),
                component: entry.component.clone(),
                title: entry.title.clone(),
                permission: entry.permission.clone(),
                disabled: entry.disabled,
                sort_key: entry.sort_key,
            };
            let new_id = tx.insert_menu(&definition, self.created_by).await?;
            self.menu_ids.insert(entry.id, new_id);
            if parent_id.is_none() {
                self.report.root_ids.push(new_id);
            }
            self.report.menus_created += 1;
        }
        Ok(())
    }

    async fn link_apis<T: MenuTransaction>(
        &mut self,
        tx: &mut T,
        entries: &[DocumentEntry],
    ) -> Result<()> {
        for entry in entries.iter().filter(|entry| !entry.apis.is_empty()) {
            let menu_id = self.mapped(entry.id)?;
            let mut links = Vec::with_capacity(entry.apis.len());
            for api in &entry.apis {
                let api_id = self.resolve_api(tx, api).await?;
                links.push(MenuApiLink { menu_id, api_id });
            }
            tx.insert_menu_api_links(&links).await?;
            self.report.links_created += links.len();
        }
        Ok(())
    }

    async fn resolve_api<T: MenuTransaction>(
        &mut self,
        tx: &mut T,
        api: &DocumentApi,
    ) -> Result<ApiId> {
        if let Some(api_id) = self.api_ids.get(api) {
            return Ok(*api_id);
        }

        let api_id = match tx.find_api(&api.path, &api.method).await? {
            Some(existing) => {
                self.report.apis_reused += 1;
                existing.id
            }
            None => {
                let created = tx
                    .insert_api(&NewApi {
                        path: api.path.clone(),
                        method: api.method.clone(),
                        title: String::new(),
                        created_by: self.created_by,
                    })
                    .await?;
                self.report.apis_created += 1;
                created
            }
        };
        self.api_ids.insert(api.clone(), api_id);
        Ok(api_id)
    }

    fn mapped(&self, document_id: MenuId) -> Result<MenuId> {
        self.menu_ids.get(&document_id).copied().ok_or_else(|| {
            LibError::integrity(
                "menu_import_unmapped",
                "Imported menu references a node that was not created",
                anyhow!("document id {} has no new id", document_id),
            )
        })
    }
}
