//! # Intrusive List Registry
//!
//! Ordered, circular, doubly-linked lists for the kernel's task bookkeeping.
//!
//! Every task owns two list items — its *state* item (ready / delayed /
//! suspended / terminating lists) and its *event* item (event lists and the
//! pending-ready handoff). Rather than embedding raw pointers in the TCBs,
//! every link is an index: an item is addressed by `(TaskId, ItemKind)` and
//! a list by `ListId`, and all links live together in the [`ListRegistry`].
//! The owner back-reference of an item is simply the `TaskId` in its
//! address, so deleting a task can never leave a dangling owner pointer.
//!
//! ## Layout
//!
//! ```text
//!          ┌────────────────────────────────────────────┐
//!          ▼                                            │
//!   [List sentinel] ⇄ [item k=2] ⇄ [item k=5] ⇄ [item k=5]
//!        cursor ───────────────────────┘
//! ```
//!
//! Each list is circular with its own header as the sentinel. The header
//! also carries a *cursor*: advancing it one position and reading the owner
//! it lands on is what delivers round-robin selection among tasks of equal
//! priority on a ready list.
//!
//! All operations are O(1) except [`ListRegistry::insert_ordered`], which is
//! O(n) in the length of the target list.

use crate::config::{Tick, EVENT_LISTS, MAX_PRIORITIES, MAX_TASKS};
use crate::task::TaskId;

// ---------------------------------------------------------------------------
// List identifiers
// ---------------------------------------------------------------------------

/// Index of a list in the registry's fixed table.
pub type ListId = usize;

/// The ready list for a priority level. Ready lists occupy the first
/// `MAX_PRIORITIES` registry slots.
#[inline]
pub const fn ready_list(priority: u8) -> ListId {
    priority as ListId
}

/// First of the two wake-time-ordered delayed lists.
pub const DELAYED_A: ListId = MAX_PRIORITIES as usize;
/// Second delayed list; holds wakes scheduled past the tick-counter wrap.
pub const DELAYED_B: ListId = DELAYED_A + 1;
/// Tasks parked off the timeline (explicit suspend or indefinite block).
pub const SUSPENDED: ListId = DELAYED_A + 2;
/// Tasks that deleted themselves and await reclamation by the idle task.
pub const TERMINATING: ListId = DELAYED_A + 3;
/// ISR-side ready handoff used while the scheduler is suspended.
pub const PENDING_READY: ListId = DELAYED_A + 4;
/// First of the claimable event lists.
pub const EVENT_BASE: ListId = DELAYED_A + 5;
/// Total number of lists in the registry.
pub const LIST_COUNT: usize = EVENT_BASE + EVENT_LISTS;

/// Marker bit set on an event item's key when the key carries a caller
/// value rather than an encoded priority. While set, priority changes must
/// not rewrite the key.
pub const EVENT_VALUE_IN_USE: Tick = 0x8000_0000;

// ---------------------------------------------------------------------------
// Item addressing
// ---------------------------------------------------------------------------

/// Which of a task's two list items is being addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemKind {
    /// The state item: ready, delayed, suspended or terminating list.
    State = 0,
    /// The event item: event lists and the pending-ready list.
    Event = 1,
}

/// Address of one list item: the owning task plus the item kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ItemRef {
    pub task: TaskId,
    pub kind: ItemKind,
}

impl ItemRef {
    /// The state item of `task`.
    #[inline]
    pub const fn state(task: TaskId) -> Self {
        Self { task, kind: ItemKind::State }
    }

    /// The event item of `task`.
    #[inline]
    pub const fn event(task: TaskId) -> Self {
        Self { task, kind: ItemKind::Event }
    }
}

/// A link target: either a list's own header (the sentinel) or an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Node {
    Head(ListId),
    Item(ItemRef),
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct ListItem {
    next: Node,
    prev: Node,
    /// Sort key: a wake tick on the delayed lists, an inverted priority or
    /// caller value on event lists.
    key: Tick,
    /// The list currently containing this item, if any.
    container: Option<ListId>,
}

impl ListItem {
    const DETACHED: ListItem = ListItem {
        next: Node::Head(0),
        prev: Node::Head(0),
        key: 0,
        container: None,
    };
}

#[derive(Debug, Clone, Copy)]
struct List {
    next: Node,
    prev: Node,
    /// Round-robin cursor; repaired whenever the item it references is
    /// removed.
    cursor: Node,
    len: usize,
}

/// Owner of every kernel list and every task list item.
///
/// The registry never touches TCBs: keys and owners are stored in the items
/// themselves, so callers holding `&mut ListRegistry` need no access to the
/// task arena.
pub struct ListRegistry {
    lists: [List; LIST_COUNT],
    items: [[ListItem; 2]; MAX_TASKS],
    event_used: [bool; EVENT_LISTS],
}

impl ListRegistry {
    /// Create a registry with every list empty and every item detached.
    pub fn new() -> Self {
        Self {
            lists: core::array::from_fn(|id| List {
                next: Node::Head(id),
                prev: Node::Head(id),
                cursor: Node::Head(id),
                len: 0,
            }),
            items: [[ListItem::DETACHED; 2]; MAX_TASKS],
            event_used: [false; EVENT_LISTS],
        }
    }

    // -- link plumbing ------------------------------------------------------

    #[inline]
    fn item(&self, r: ItemRef) -> &ListItem {
        &self.items[r.task][r.kind as usize]
    }

    #[inline]
    fn item_mut(&mut self, r: ItemRef) -> &mut ListItem {
        &mut self.items[r.task][r.kind as usize]
    }

    #[inline]
    fn next_of(&self, node: Node) -> Node {
        match node {
            Node::Head(l) => self.lists[l].next,
            Node::Item(r) => self.item(r).next,
        }
    }

    #[inline]
    fn set_next(&mut self, node: Node, value: Node) {
        match node {
            Node::Head(l) => self.lists[l].next = value,
            Node::Item(r) => self.item_mut(r).next = value,
        }
    }

    #[inline]
    fn set_prev(&mut self, node: Node, value: Node) {
        match node {
            Node::Head(l) => self.lists[l].prev = value,
            Node::Item(r) => self.item_mut(r).prev = value,
        }
    }

    /// Splice `r` in after `prev`, inside `list`.
    fn link_after(&mut self, list: ListId, prev: Node, r: ItemRef) {
        debug_assert!(self.item(r).container.is_none(), "item already linked");
        let next = self.next_of(prev);
        {
            let item = self.item_mut(r);
            item.prev = prev;
            item.next = next;
            item.container = Some(list);
        }
        self.set_next(prev, Node::Item(r));
        self.set_prev(next, Node::Item(r));
        self.lists[list].len += 1;
    }

    // -- item state ---------------------------------------------------------

    /// Detach-initialise an item. Must not be called while linked.
    pub fn init_item(&mut self, r: ItemRef) {
        *self.item_mut(r) = ListItem::DETACHED;
    }

    /// The item's sort key.
    #[inline]
    pub fn key(&self, r: ItemRef) -> Tick {
        self.item(r).key
    }

    /// Set the item's sort key. Only meaningful before insertion; changing
    /// the key of a linked item does not re-sort its list.
    #[inline]
    pub fn set_key(&mut self, r: ItemRef, key: Tick) {
        self.item_mut(r).key = key;
    }

    /// The list currently containing `r`, if any.
    #[inline]
    pub fn container(&self, r: ItemRef) -> Option<ListId> {
        self.item(r).container
    }

    /// Whether `r` is linked into any list.
    #[inline]
    pub fn is_linked(&self, r: ItemRef) -> bool {
        self.item(r).container.is_some()
    }

    /// Whether `r` is linked into `list` specifically.
    #[inline]
    pub fn contains(&self, list: ListId, r: ItemRef) -> bool {
        self.item(r).container == Some(list)
    }

    // -- list state ---------------------------------------------------------

    #[inline]
    pub fn len(&self, list: ListId) -> usize {
        self.lists[list].len
    }

    #[inline]
    pub fn is_empty(&self, list: ListId) -> bool {
        self.lists[list].len == 0
    }

    /// First item of `list`, if any.
    pub fn head(&self, list: ListId) -> Option<ItemRef> {
        match self.lists[list].next {
            Node::Item(r) => Some(r),
            Node::Head(_) => None,
        }
    }

    /// Last item of `list`, if any.
    pub fn tail(&self, list: ListId) -> Option<ItemRef> {
        match self.lists[list].prev {
            Node::Item(r) => Some(r),
            Node::Head(_) => None,
        }
    }

    /// Owner of the first item of `list`, if any.
    #[inline]
    pub fn head_owner(&self, list: ListId) -> Option<TaskId> {
        self.head(list).map(|r| r.task)
    }

    /// Owner of the last item of `list`, if any.
    #[inline]
    pub fn tail_owner(&self, list: ListId) -> Option<TaskId> {
        self.tail(list).map(|r| r.task)
    }

    // -- mutation -----------------------------------------------------------

    /// Insert `r` at the end of `list`, preserving arrival order.
    pub fn insert_end(&mut self, list: ListId, r: ItemRef) {
        let last = self.lists[list].prev;
        self.link_after(list, last, r);
    }

    /// Insert `r` into `list` ordered by its key; equal keys go after the
    /// existing run, so ties keep insertion order.
    pub fn insert_ordered(&mut self, list: ListId, r: ItemRef) {
        let key = self.item(r).key;
        let mut prev = Node::Head(list);
        loop {
            match self.next_of(prev) {
                Node::Head(_) => break,
                Node::Item(n) => {
                    if self.item(n).key > key {
                        break;
                    }
                    prev = Node::Item(n);
                }
            }
        }
        self.link_after(list, prev, r);
    }

    /// Unlink `r` from its containing list.
    ///
    /// # Returns
    /// The number of items remaining in that list.
    ///
    /// # Panics
    /// If `r` is not linked.
    pub fn remove(&mut self, r: ItemRef) -> usize {
        let list = self.item(r).container.expect("removing an unlinked item");
        if self.lists[list].cursor == Node::Item(r) {
            self.lists[list].cursor = self.item(r).prev;
        }
        let (prev, next) = {
            let item = self.item(r);
            (item.prev, item.next)
        };
        self.set_next(prev, next);
        self.set_prev(next, prev);
        {
            let item = self.item_mut(r);
            item.container = None;
            item.next = Node::Head(list);
            item.prev = Node::Head(list);
        }
        self.lists[list].len -= 1;
        self.lists[list].len
    }

    // -- cursor -------------------------------------------------------------

    /// Advance the list's cursor one position (skipping the sentinel) and
    /// return the owner it now references. `None` on an empty list.
    pub fn advance_cursor(&mut self, list: ListId) -> Option<TaskId> {
        if self.is_empty(list) {
            return None;
        }
        let mut cursor = self.next_of(self.lists[list].cursor);
        if let Node::Head(_) = cursor {
            cursor = self.next_of(cursor);
        }
        self.lists[list].cursor = cursor;
        match cursor {
            Node::Item(r) => Some(r.task),
            Node::Head(_) => None,
        }
    }

    /// Park the cursor on `r`, so the next round-robin scan starts just
    /// after it.
    pub fn set_cursor(&mut self, list: ListId, r: ItemRef) {
        debug_assert!(self.contains(list, r));
        self.lists[list].cursor = Node::Item(r);
    }

    // -- iteration ----------------------------------------------------------

    /// Iterate `list` from its head in link order.
    pub fn iter(&self, list: ListId) -> ListIter<'_> {
        ListIter { registry: self, node: self.lists[list].next }
    }

    /// Iterate `list` once around, starting just after the cursor. This is
    /// the scan order used for round-robin-fair selection.
    pub fn iter_round(&self, list: ListId) -> RoundIter<'_> {
        RoundIter {
            registry: self,
            node: self.next_of(self.lists[list].cursor),
            remaining: self.lists[list].len,
        }
    }

    // -- event list pool ----------------------------------------------------

    /// Claim an event list for an IPC-layer object.
    pub fn alloc_event_list(&mut self) -> Option<ListId> {
        for (i, used) in self.event_used.iter_mut().enumerate() {
            if !*used {
                *used = true;
                return Some(EVENT_BASE + i);
            }
        }
        None
    }

    /// Return a claimed event list to the pool. The list must be empty.
    pub fn free_event_list(&mut self, list: ListId) {
        debug_assert!((EVENT_BASE..LIST_COUNT).contains(&list));
        debug_assert!(self.is_empty(list), "freeing a non-empty event list");
        self.event_used[list - EVENT_BASE] = false;
    }
}

/// Head-to-tail iterator over one list.
pub struct ListIter<'a> {
    registry: &'a ListRegistry,
    node: Node,
}

impl Iterator for ListIter<'_> {
    type Item = ItemRef;

    fn next(&mut self) -> Option<ItemRef> {
        match self.node {
            Node::Head(_) => None,
            Node::Item(r) => {
                self.node = self.registry.item(r).next;
                Some(r)
            }
        }
    }
}

/// One full revolution starting after the cursor.
pub struct RoundIter<'a> {
    registry: &'a ListRegistry,
    node: Node,
    remaining: usize,
}

impl Iterator for RoundIter<'_> {
    type Item = ItemRef;

    fn next(&mut self) -> Option<ItemRef> {
        if self.remaining == 0 {
            return None;
        }
        loop {
            match self.node {
                Node::Head(l) => self.node = self.registry.lists[l].next,
                Node::Item(r) => {
                    self.node = self.registry.item(r).next;
                    self.remaining -= 1;
                    return Some(r);
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Unit tests (host-only)
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    const L: ListId = EVENT_BASE;

    fn keys(reg: &ListRegistry, list: ListId) -> Vec<Tick> {
        reg.iter(list).map(|r| reg.key(r)).collect()
    }

    #[test]
    fn test_insert_end_preserves_order() {
        let mut reg = ListRegistry::new();
        for t in 0..4 {
            reg.insert_end(L, ItemRef::state(t));
        }
        let owners: Vec<TaskId> = reg.iter(L).map(|r| r.task).collect();
        assert_eq!(owners, [0, 1, 2, 3]);
        assert_eq!(reg.head_owner(L), Some(0));
        assert_eq!(reg.tail_owner(L), Some(3));
        assert_eq!(reg.len(L), 4);
    }

    #[test]
    fn test_insert_ordered_ties_go_last() {
        let mut reg = ListRegistry::new();
        for (t, key) in [(0, 5), (1, 2), (2, 5), (3, 1)] {
            reg.set_key(ItemRef::state(t), key);
            reg.insert_ordered(L, ItemRef::state(t));
        }
        assert_eq!(keys(&reg, L), [1, 2, 5, 5]);
        // Task 0 was inserted with key 5 before task 2; ties keep that order.
        let owners: Vec<TaskId> = reg.iter(L).map(|r| r.task).collect();
        assert_eq!(owners, [3, 1, 0, 2]);
    }

    #[test]
    fn test_remove_returns_remaining_length() {
        let mut reg = ListRegistry::new();
        for t in 0..3 {
            reg.insert_end(L, ItemRef::state(t));
        }
        assert_eq!(reg.remove(ItemRef::state(1)), 2);
        assert_eq!(reg.remove(ItemRef::state(0)), 1);
        assert_eq!(reg.head_owner(L), Some(2));
        assert_eq!(reg.remove(ItemRef::state(2)), 0);
        assert!(reg.is_empty(L));
        assert!(!reg.is_linked(ItemRef::state(2)));
    }

    #[test]
    fn test_cursor_round_robin() {
        let mut reg = ListRegistry::new();
        for t in 0..3 {
            reg.insert_end(L, ItemRef::state(t));
        }
        let picks: Vec<TaskId> = (0..6).map(|_| reg.advance_cursor(L).unwrap()).collect();
        assert_eq!(picks, [0, 1, 2, 0, 1, 2]);
    }

    #[test]
    fn test_cursor_repaired_on_remove() {
        let mut reg = ListRegistry::new();
        for t in 0..3 {
            reg.insert_end(L, ItemRef::state(t));
        }
        assert_eq!(reg.advance_cursor(L), Some(0));
        assert_eq!(reg.advance_cursor(L), Some(1));
        // Removing the item under the cursor steps the cursor back, so the
        // rotation continues with the removed item's successor.
        reg.remove(ItemRef::state(1));
        assert_eq!(reg.advance_cursor(L), Some(2));
        assert_eq!(reg.advance_cursor(L), Some(0));
    }

    #[test]
    fn test_iter_round_starts_after_cursor() {
        let mut reg = ListRegistry::new();
        for t in 0..4 {
            reg.insert_end(L, ItemRef::state(t));
        }
        reg.set_cursor(L, ItemRef::state(1));
        let owners: Vec<TaskId> = reg.iter_round(L).map(|r| r.task).collect();
        assert_eq!(owners, [2, 3, 0, 1]);
    }

    #[test]
    fn test_containment() {
        let mut reg = ListRegistry::new();
        reg.insert_end(L, ItemRef::event(5));
        assert!(reg.contains(L, ItemRef::event(5)));
        assert!(!reg.contains(L, ItemRef::state(5)));
        assert_eq!(reg.container(ItemRef::event(5)), Some(L));
    }

    #[test]
    fn test_event_list_pool_exhausts_and_recycles() {
        let mut reg = ListRegistry::new();
        let mut claimed = Vec::new();
        while let Some(l) = reg.alloc_event_list() {
            claimed.push(l);
        }
        assert_eq!(claimed.len(), EVENT_LISTS);
        reg.free_event_list(claimed[0]);
        assert_eq!(reg.alloc_event_list(), Some(claimed[0]));
    }

    #[quickcheck]
    fn prop_ordered_insert_is_sorted(raw: Vec<u32>) -> bool {
        let mut reg = ListRegistry::new();
        for (t, key) in raw.iter().take(MAX_TASKS).enumerate() {
            reg.set_key(ItemRef::state(t), *key);
            reg.insert_ordered(L, ItemRef::state(t));
        }
        let keys = keys(&reg, L);
        keys.windows(2).all(|w| w[0] <= w[1])
    }

    #[quickcheck]
    fn prop_len_tracks_inserts_and_removes(raw: Vec<u32>) -> bool {
        let mut reg = ListRegistry::new();
        let n = raw.len().min(MAX_TASKS);
        for (t, key) in raw.iter().take(n).enumerate() {
            reg.set_key(ItemRef::event(t), *key);
            reg.insert_ordered(L, ItemRef::event(t));
        }
        for t in 0..n {
            let expect = n - t - 1;
            if reg.remove(ItemRef::event(t)) != expect {
                return false;
            }
        }
        reg.is_empty(L)
    }
}
