use anyhow::anyhow;
use serde::{Deserialize, Serialize};

use crate::algorithms::{TreeItem, TreeNode};
use crate::error::{LibError, Result};
use crate::models::{Api, MenuId, MenuListing, MenuType, parent_ref};

/// One node of the export/import document.
///
/// `id` and `parentId` only correlate entries within a single document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocumentNode {
    pub id: MenuId,
    #[serde(with = "parent_ref", default)]
    pub parent_id: Option<MenuId>,
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub component: String,
    #[serde(default)]
    pub title: String,
    #[serde(rename = "type")]
    pub menu_type: MenuType,
    #[serde(default)]
    pub permission: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(default)]
    pub sort_key: i32,
    #[serde(default)]
    pub children: Vec<DocumentNode>,
    #[serde(default)]
    pub apis: Vec<DocumentApi>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DocumentApi {
    pub path: String,
    pub method: String,
}

impl From<&Api> for DocumentApi {
    fn from(value: &Api) -> Self {
        Self {
            path: value.path.clone(),
            method: value.method.clone(),
        }
    }
}

/// A document node detached from its nesting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentEntry {
    pub id: MenuId,
    pub parent_id: Option<MenuId>,
    pub name: String,
    pub path: String,
    pub component: String,
    pub title: String,
    pub menu_type: MenuType,
    pub permission: String,
    pub disabled: bool,
    pub sort_key: i32,
    pub apis: Vec<DocumentApi>,
}

impl TreeItem for DocumentEntry {
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

/// A document entry with the id of the node it was nested under, if any.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedEntry {
    pub entry: DocumentEntry,
    pub enclosing_id: Option<MenuId>,
}

pub fn parse_document(content: &[u8]) -> Result<Vec<DocumentNode>> {
    let nodes: Vec<DocumentNode> = serde_json::from_slice(content).map_err(|err| {
        LibError::invalid_with_code(
            "menu_document_malformed",
            "Menu document is not valid JSON",
            anyhow!(err),
        )
    })?;
    if nodes.is_empty() {
        return Err(LibError::invalid_with_code(
            "menu_document_empty",
            "Menu document is empty",
            anyhow!("document contained no menus"),
        ));
    }
    Ok(nodes)
}

pub fn render_document(nodes: &[DocumentNode]) -> Result<String> {
    serde_json::to_string_pretty(nodes)
        .map_err(|err| LibError::unknown("Failed to serialize menu document", anyhow!(err)))
}

/// Converts an exported forest into document form.
pub fn document_from_forest(forest: Vec<TreeNode<MenuListing>>) -> Vec<DocumentNode> {
    forest.into_iter().map(document_node).collect()
}

fn document_node(node: TreeNode<MenuListing>) -> DocumentNode {
    let TreeNode { item, children } = node;
    DocumentNode {
        id: item.menu.id,
        parent_id: item.menu.parent_id,
        name: item.menu.name,
        path: item.menu.path,
        component: item.menu.component,
        title: item.menu.title,
        menu_type: item.menu.menu_type,
        permission: item.menu.permission,
        disabled: item.menu.disabled,
        sort_key: item.menu.sort_key,
        children: children.into_iter().map(document_node).collect(),
        apis: item.apis.iter().map(DocumentApi::from).collect(),
    }
}

/// Pre-order walk of the document, recording where each node was nested.
pub fn flatten_document(nodes: Vec<DocumentNode>) -> Vec<PlacedEntry> {
    let mut output = Vec::new();
    let mut stack: Vec<(DocumentNode, Option<MenuId>)> =
        nodes.into_iter().rev().map(|node| (node, None)).collect();
    while let Some((node, enclosing_id)) = stack.pop() {
        let DocumentNode {
            id,
            parent_id,
            name,
            path,
            component,
            title,
            menu_type,
            permission,
            disabled,
            sort_key,
            children,
            apis,
        } = node;
        stack.extend(children.into_iter().rev().map(|child| (child, Some(id))));
        output.push(PlacedEntry {
            entry: DocumentEntry {
                id,
                parent_id,
                name,
                path,
                component,
                title,
                menu_type,
                permission,
                disabled,
                sort_key,
                apis,
            },
            enclosing_id,
        });
    }
    output
}
