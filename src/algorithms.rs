use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::fmt::Debug;
use std::hash::Hash;

use serde::Serialize;

/// A flat record that knows its own id and its parent's.
pub trait TreeItem {
    type Id: Copy + Eq + Hash + Ord + Debug;

    fn id(&self) -> Self::Id;
    fn parent_id(&self) -> Option<Self::Id>;
    /// `0` means unset.
    fn sort_key(&self) -> i32;
    fn clear_parent(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TreeNode<T> {
    #[serde(flatten)]
    pub item: T,
    pub children: Vec<TreeNode<T>>,
}

impl<T> TreeNode<T> {
    pub fn leaf(item: T) -> Self {
        Self {
            item,
            children: Vec::new(),
        }
    }
}

/// Nodes dropped while building a forest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TreeWarning<Id> {
    /// The node names itself as parent.
    SelfReference { id: Id },
    /// A second node reused an id already registered.
    DuplicateId { id: Id },
    /// The declared parent is not part of the input.
    Orphan { id: Id, parent_id: Id },
    /// The parent exists but the chain above it never reaches a root.
    Unreachable { id: Id },
}

/// Warning sink that reports through `tracing`.
pub fn log_tree_warning<Id: Debug>(warning: TreeWarning<Id>) {
    match warning {
        TreeWarning::SelfReference { id } => {
            tracing::warn!(node_id = ?id, "skipping self-referencing tree node");
        }
        TreeWarning::DuplicateId { id } => {
            tracing::warn!(node_id = ?id, "skipping duplicate tree node id");
        }
        TreeWarning::Orphan { id, parent_id } => {
            tracing::warn!(node_id = ?id, parent_id = ?parent_id, "dropping orphan tree node");
        }
        TreeWarning::Unreachable { id } => {
            tracing::warn!(node_id = ?id, "dropping tree node detached from any root");
        }
    }
}

/// Builds a forest from a flat parent-pointer list.
///
/// Siblings keep their input order. Every node that does not end up in the forest is
/// reported to `warn` exactly once.
pub fn build_forest<T, F>(items: Vec<T>, mut warn: F) -> Vec<TreeNode<T>>
where
    T: TreeItem,
    F: FnMut(TreeWarning<T::Id>),
{
    let mut slots: Vec<Option<T>> = Vec::with_capacity(items.len());
    let mut index: HashMap<T::Id, usize> = HashMap::with_capacity(items.len());
    for item in items {
        let id = item.id();
        if item.parent_id() == Some(id) {
            warn(TreeWarning::SelfReference { id });
            continue;
        }
        if index.contains_key(&id) {
            warn(TreeWarning::DuplicateId { id });
            continue;
        }
        index.insert(id, slots.len());
        slots.push(Some(item));
    }

    let mut roots = Vec::new();
    let mut children: HashMap<usize, Vec<usize>> = HashMap::new();
    for (position, slot) in slots.iter().enumerate() {
        let Some(item) = slot else { continue };
        match item.parent_id() {
            None => roots.push(position),
            Some(parent_id) => match index.get(&parent_id) {
                Some(parent) => children.entry(*parent).or_default().push(position),
                None => warn(TreeWarning::Orphan {
                    id: item.id(),
                    parent_id,
                }),
            },
        }
    }

    let mut placed = vec![false; slots.len()];
    let mut forest = Vec::with_capacity(roots.len());
    for root in roots {
        forest.push(materialize(root, &mut slots, &children, &mut placed));
    }

    for (position, slot) in slots.iter().enumerate() {
        if let Some(item) = slot {
            let orphaned = item
                .parent_id()
                .is_some_and(|parent_id| !index.contains_key(&parent_id));
            if !placed[position] && !orphaned {
                warn(TreeWarning::Unreachable { id: item.id() });
            }
        }
    }

    forest
}

/// Moves the subtree under `root` out of `slots`, depth first, without recursion.
fn materialize<T>(
    root: usize,
    slots: &mut [Option<T>],
    children: &HashMap<usize, Vec<usize>>,
    placed: &mut [bool],
) -> TreeNode<T> {
    // Post-order: a node is assembled once all of its children are.
    let mut stack: Vec<(usize, bool)> = vec![(root, false)];
    let mut done: HashMap<usize, TreeNode<T>> = HashMap::new();
    while let Some((position, expanded)) = stack.pop() {
        let kids = children.get(&position).map(Vec::as_slice).unwrap_or(&[]);
        if !expanded {
            placed[position] = true;
            stack.push((position, true));
            for kid in kids.iter().rev() {
                if !placed[*kid] {
                    stack.push((*kid, false));
                }
            }
            continue;
        }

        let Some(item) = slots[position].take() else {
            continue;
        };
        let mut node = TreeNode::leaf(item);
        for kid in kids {
            if let Some(child) = done.remove(kid) {
                node.children.push(child);
            }
        }
        done.insert(position, node);
    }

    done.remove(&root)
        .expect("root should be assembled last by the post-order walk")
}

/// Sibling ordering: keyed nodes by key, then unkeyed nodes by id.
pub fn compare_siblings<T: TreeItem>(a: &T, b: &T) -> Ordering {
    match (a.sort_key(), b.sort_key()) {
        (0, 0) => a.id().cmp(&b.id()),
        (0, _) => Ordering::Greater,
        (_, 0) => Ordering::Less,
        (left, right) => left.cmp(&right),
    }
}

/// Stable sort of every sibling group in the forest.
pub fn sort_forest<T: TreeItem>(forest: &mut Vec<TreeNode<T>>) {
    let mut stack: Vec<&mut Vec<TreeNode<T>>> = vec![forest];
    while let Some(level) = stack.pop() {
        level.sort_by(|a, b| compare_siblings(&a.item, &b.item));
        for node in level {
            stack.push(&mut node.children);
        }
    }
}

pub fn build_sorted_forest<T, F>(items: Vec<T>, warn: F) -> Vec<TreeNode<T>>
where
    T: TreeItem,
    F: FnMut(TreeWarning<T::Id>),
{
    let mut forest = build_forest(items, warn);
    sort_forest(&mut forest);
    forest
}

/// Pre-order flattening; the inverse of [`build_forest`] for well-formed input.
pub fn flatten<T>(forest: Vec<TreeNode<T>>) -> Vec<T> {
    let mut output = Vec::new();
    let mut stack: Vec<TreeNode<T>> = forest.into_iter().rev().collect();
    while let Some(node) = stack.pop() {
        output.push(node.item);
        stack.extend(node.children.into_iter().rev());
    }
    output
}

pub fn children_index<T: TreeItem>(items: &[T]) -> HashMap<T::Id, Vec<T::Id>> {
    let mut index: HashMap<T::Id, Vec<T::Id>> = HashMap::with_capacity(items.len());
    for item in items {
        if let Some(parent_id) = item.parent_id() {
            index.entry(parent_id).or_default().push(item.id());
        }
    }
    index
}

/// The requested ids that exist in `items`, plus all of their descendants.
pub fn descendant_ids<T: TreeItem>(requested: &[T::Id], items: &[T]) -> Vec<T::Id> {
    let known: HashSet<T::Id> = items.iter().map(TreeItem::id).collect();
    let index = children_index(items);

    let mut visited = HashSet::with_capacity(items.len());
    let mut output = Vec::new();
    let mut stack: Vec<T::Id> = requested
        .iter()
        .rev()
        .filter(|id| known.contains(*id))
        .copied()
        .collect();
    while let Some(id) = stack.pop() {
        if !visited.insert(id) {
            continue;
        }
        output.push(id);
        if let Some(kids) = index.get(&id) {
            stack.extend(kids.iter().rev().filter(|kid| !visited.contains(*kid)));
        }
    }
    output
}

/// Detaches every node whose parent is not part of the selection.
pub fn fix_orphan_parent_ids<T: TreeItem>(items: &mut [T]) {
    let selected: HashSet<T::Id> = items.iter().map(TreeItem::id).collect();
    for item in items.iter_mut() {
        if item
            .parent_id()
            .is_some_and(|parent_id| !selected.contains(&parent_id))
        {
            item.clear_parent();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use proptest::prelude::*;

    use super::*;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct Item {
        id: i64,
        parent: Option<i64>,
        sort: i32,
    }

    impl TreeItem for Item {
        type Id = i64;

        fn id(&self) -> i64 {
            self.id
        }

        fn parent_id(&self) -> Option<i64> {
            self.parent
        }

        fn sort_key(&self) -> i32 {
            self.sort
        }

        fn clear_parent(&mut self) {
            self.parent = None;
        }
    }

    fn item(id: i64, parent: Option<i64>, sort: i32) -> Item {
        Item { id, parent, sort }
    }

    fn ids(forest: &[TreeNode<Item>]) -> Vec<i64> {
        forest.iter().map(|node| node.item.id).collect()
    }

    #[test]
    fn builds_nested_forest() {
        let mut warnings = Vec::new();
        let forest = build_forest(
            vec![
                item(3, Some(2), 0),
                item(1, None, 0),
                item(2, Some(1), 0),
                item(4, Some(1), 0),
            ],
            |w| warnings.push(w),
        );
        assert!(warnings.is_empty());
        assert_eq!(ids(&forest), vec![1]);
        assert_eq!(ids(&forest[0].children), vec![2, 4]);
        assert_eq!(ids(&forest[0].children[0].children), vec![3]);
    }

    #[test]
    fn orphans_and_their_descendants_are_reported() {
        let mut warnings = Vec::new();
        let forest = build_forest(
            vec![item(1, None, 0), item(5, Some(99), 0), item(6, Some(5), 0)],
            |w| warnings.push(w),
        );
        assert_eq!(ids(&forest), vec![1]);
        assert!(warnings.contains(&TreeWarning::Orphan {
            id: 5,
            parent_id: 99
        }));
        assert!(warnings.contains(&TreeWarning::Unreachable { id: 6 }));
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn self_reference_is_skipped() {
        let mut warnings = Vec::new();
        let forest = build_forest(vec![item(1, None, 0), item(2, Some(2), 0)], |w| {
            warnings.push(w)
        });
        assert_eq!(ids(&forest), vec![1]);
        assert_eq!(warnings, vec![TreeWarning::SelfReference { id: 2 }]);
    }

    #[test]
    fn rootless_cycle_is_reported_not_looped() {
        let mut warnings = Vec::new();
        let forest = build_forest(vec![item(1, Some(2), 0), item(2, Some(1), 0)], |w| {
            warnings.push(w)
        });
        assert!(forest.is_empty());
        assert_eq!(warnings.len(), 2);
    }

    #[test]
    fn sort_puts_keyed_before_unkeyed() {
        let mut forest = build_sorted_forest(
            vec![
                item(5, None, 0),
                item(2, None, 0),
                item(9, None, 3),
                item(7, None, 1),
                item(8, Some(9), 0),
                item(6, Some(9), 4),
            ],
            log_tree_warning,
        );
        assert_eq!(ids(&forest), vec![7, 9, 2, 5]);
        assert_eq!(ids(&forest[1].children), vec![6, 8]);

        sort_forest(&mut forest);
        assert_eq!(ids(&forest), vec![7, 9, 2, 5]);
    }

    #[test]
    fn sort_keeps_input_order_for_equal_keys() {
        let forest = build_sorted_forest(
            vec![item(4, None, 2), item(1, None, 2), item(3, None, 1)],
            log_tree_warning,
        );
        assert_eq!(ids(&forest), vec![3, 4, 1]);
    }

    #[test]
    fn descendants_include_requested_and_skip_unknown() {
        let items = vec![
            item(1, None, 0),
            item(2, Some(1), 0),
            item(3, Some(2), 0),
            item(4, None, 0),
        ];
        let found: BTreeSet<i64> = descendant_ids(&[1, 42], &items).into_iter().collect();
        assert_eq!(found, BTreeSet::from([1, 2, 3]));
    }

    #[test]
    fn descendants_tolerate_cycles() {
        let items = vec![item(1, Some(2), 0), item(2, Some(1), 0)];
        let found: BTreeSet<i64> = descendant_ids(&[1], &items).into_iter().collect();
        assert_eq!(found, BTreeSet::from([1, 2]));
    }

    #[test]
    fn fix_orphans_detaches_selection_tops() {
        let mut items = vec![item(2, Some(1), 0), item(3, Some(2), 0)];
        fix_orphan_parent_ids(&mut items);
        assert_eq!(items[0].parent, None);
        assert_eq!(items[1].parent, Some(2));
    }

    fn flat_items() -> impl Strategy<Value = Vec<Item>> {
        prop::collection::vec((0i64..40, prop::option::of(0i64..48), -3i32..4), 0..40).prop_map(
            |raw| {
                raw.into_iter()
                    .map(|(id, parent, sort)| item(id, parent, sort))
                    .collect()
            },
        )
    }

    proptest! {
        #[test]
        fn build_then_flatten_keeps_every_unreported_node_once(items in flat_items()) {
            let mut dropped = Vec::new();
            let forest = build_forest(items.clone(), |w| dropped.push(w));
            let flattened = flatten(forest);

            let mut seen = HashSet::new();
            for node in &flattened {
                prop_assert!(seen.insert(node.id));
            }
            prop_assert_eq!(flattened.len() + dropped.len(), items.len());
        }

        #[test]
        fn sorted_siblings_follow_key_then_id(items in flat_items()) {
            let forest = build_sorted_forest(items, |_| {});
            let mut stack = vec![&forest];
            while let Some(level) = stack.pop() {
                for pair in level.windows(2) {
                    let (a, b) = (&pair[0].item, &pair[1].item);
                    match (a.sort, b.sort) {
                        (0, 0) => prop_assert!(a.id < b.id),
                        (0, _) => prop_assert!(false, "unkeyed node before keyed node"),
                        (_, 0) => {}
                        (x, y) => prop_assert!(x <= y),
                    }
                }
                for node in level {
                    stack.push(&node.children);
                }
            }
        }
    }
}
