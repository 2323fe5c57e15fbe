//! Rankings lists order live entries by recency of use.  Eviction
//! walks a list from its tail (least recently used), and enumeration
//! from its head.
//!
//! The lists are intrusive: every entry record embeds its own
//! [`Links`], and neighbours are named by [`EntryId`] rather than by
//! pointer.  Links may come from disk (the blockfile backend persists
//! them), so nothing here trusts them: every walk checks that each
//! node resolves, belongs to the list, and points back at the node we
//! came from, and gives up after visiting as many nodes as the list
//! is supposed to hold.  A self-referential or circular chain is thus
//! reported as [`Corruption`] instead of looping forever.
//!
//! Each insertion at the head also stamps the node with a sequence
//! number.  Sequence numbers are strictly increasing, so sorting a
//! list's members by decreasing sequence number recovers the exact
//! list order; [`Rankings::relink`] uses that to rebuild a list after
//! excising a corrupt node.
use std::cmp::Reverse;
use std::fmt;

use crate::arena::Arena;
use crate::arena::EntryId;

pub(crate) const LIST_COUNT: usize = 2;

/// Which rankings list a node lives on.  The LRU policy only uses
/// `NoUse`; the two-list policy promotes reopened entries to `Reused`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub(crate) enum List {
    NoUse = 0,
    Reused = 1,
}

impl List {
    pub const ALL: [List; LIST_COUNT] = [List::NoUse, List::Reused];

    pub fn index(self) -> usize {
        self as usize
    }

    pub fn from_u8(raw: u8) -> Option<List> {
        match raw {
            0 => Some(List::NoUse),
            1 => Some(List::Reused),
            _ => None,
        }
    }

    pub fn other(self) -> List {
        match self {
            List::NoUse => List::Reused,
            List::Reused => List::NoUse,
        }
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Links {
    pub prev: Option<EntryId>,
    pub next: Option<EntryId>,
    /// `None` when the node is not on any list.
    pub list: Option<List>,
    pub seq: u64,
}

/// Anything that embeds rankings links.
pub(crate) trait Ranked {
    fn links(&self) -> &Links;
    fn links_mut(&mut self) -> &mut Links;
}

/// What a bounded walk found wrong with a list.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Corruption {
    /// The walk visited more nodes than the list holds.
    Cycle { list: List },
    /// A link names a node that does not exist.
    Dangling { list: List, node: EntryId },
    /// A node's back link, list tag, or the list's far end does not
    /// match the path we walked.
    BrokenLink { list: List, node: Option<EntryId> },
}

impl Corruption {
    /// Returns the node whose links are inconsistent, if there is one
    /// to excise.
    pub fn culprit(&self) -> Option<EntryId> {
        match self {
            Corruption::Cycle { .. } | Corruption::Dangling { .. } => None,
            Corruption::BrokenLink { node, .. } => *node,
        }
    }

    pub fn list(&self) -> List {
        match self {
            Corruption::Cycle { list }
            | Corruption::Dangling { list, .. }
            | Corruption::BrokenLink { list, .. } => *list,
        }
    }
}

impl fmt::Display for Corruption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corruption::Cycle { list } => write!(f, "rankings list {:?} loops", list),
            Corruption::Dangling { list, node } => {
                write!(f, "rankings list {:?} links to missing {:?}", list, node)
            }
            Corruption::BrokenLink { list, node } => {
                write!(f, "rankings list {:?} has a broken link at {:?}", list, node)
            }
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Direction {
    /// Most recently used first.
    FromHead,
    /// Least recently used first.
    FromTail,
}

#[derive(Debug, Default)]
pub(crate) struct Rankings {
    heads: [Option<EntryId>; LIST_COUNT],
    tails: [Option<EntryId>; LIST_COUNT],
    lens: [usize; LIST_COUNT],
    seq: u64,
    // Nodes whose links changed since the last `take_touched`.
    touched: Vec<EntryId>,
}

impl Rankings {
    pub fn len(&self, list: List) -> usize {
        self.lens[list.index()]
    }

    pub fn total(&self) -> usize {
        self.lens.iter().sum()
    }

    pub fn head(&self, list: List) -> Option<EntryId> {
        self.heads[list.index()]
    }

    pub fn tail(&self, list: List) -> Option<EntryId> {
        self.tails[list.index()]
    }

    fn next_seq(&mut self) -> u64 {
        self.seq += 1;
        self.seq
    }

    /// Links `id` at the head of `list`.  The node must not currently
    /// be on a list.
    pub fn insert_head<T: Ranked>(&mut self, nodes: &mut Arena<T>, id: EntryId, list: List) {
        let seq = self.next_seq();
        let l = list.index();
        let old_head = self.heads[l];

        match nodes.get_mut(id) {
            Some(node) => {
                *node.links_mut() = Links {
                    prev: None,
                    next: old_head,
                    list: Some(list),
                    seq,
                }
            }
            None => return,
        }

        match old_head {
            Some(head) => {
                if let Some(node) = nodes.get_mut(head) {
                    node.links_mut().prev = Some(id);
                    self.touched.push(head);
                }
            }
            None => self.tails[l] = Some(id),
        }

        self.heads[l] = Some(id);
        self.lens[l] += 1;
        self.touched.push(id);
    }

    /// Unlinks `id` from whatever list it is on.  Tolerates broken
    /// neighbours: a neighbour is only patched if it really points
    /// back at `id`.  Returns whether the node was on a list.
    pub fn remove<T: Ranked>(&mut self, nodes: &mut Arena<T>, id: EntryId) -> bool {
        let links = match nodes.get(id) {
            Some(node) => *node.links(),
            None => return false,
        };
        let list = match links.list {
            Some(list) => list,
            None => return false,
        };
        let l = list.index();
        // A self link is as good as no link.
        let prev = links.prev.filter(|p| *p != id);
        let next = links.next.filter(|n| *n != id);

        if let Some(p) = prev {
            if let Some(node) = nodes.get_mut(p) {
                if node.links().next == Some(id) {
                    node.links_mut().next = next;
                    self.touched.push(p);
                }
            }
        }

        if let Some(n) = next {
            if let Some(node) = nodes.get_mut(n) {
                if node.links().prev == Some(id) {
                    node.links_mut().prev = prev;
                    self.touched.push(n);
                }
            }
        }

        if self.heads[l] == Some(id) {
            self.heads[l] = next;
        }
        if self.tails[l] == Some(id) {
            self.tails[l] = prev;
        }

        self.lens[l] = self.lens[l].saturating_sub(1);
        if let Some(node) = nodes.get_mut(id) {
            *node.links_mut() = Links::default();
        }
        self.touched.push(id);
        true
    }

    /// Moves `id` to the head of `list` (which may differ from its
    /// current list).
    pub fn move_to_head<T: Ranked>(&mut self, nodes: &mut Arena<T>, id: EntryId, list: List) {
        if self.heads[list.index()] == Some(id) {
            if let Some(node) = nodes.get_mut(id) {
                if node.links().list == Some(list) {
                    node.links_mut().seq = self.seq + 1;
                    self.seq += 1;
                    return;
                }
            }
        }

        self.remove(nodes, id);
        self.insert_head(nodes, id, list);
    }

    /// Walks `list` in `direction`, validating every link, and
    /// returns the node ids in walk order.
    pub fn walk<T: Ranked>(
        &self,
        nodes: &Arena<T>,
        list: List,
        direction: Direction,
    ) -> Result<Vec<EntryId>, Corruption> {
        let l = list.index();
        let expected = self.lens[l];
        let (start, end) = match direction {
            Direction::FromHead => (self.heads[l], self.tails[l]),
            Direction::FromTail => (self.tails[l], self.heads[l]),
        };

        let mut order = Vec::with_capacity(expected);
        let mut behind: Option<EntryId> = None;
        let mut cursor = start;
        while let Some(id) = cursor {
            if order.len() >= expected {
                return Err(Corruption::Cycle { list });
            }

            let links = match nodes.get(id) {
                Some(node) => *node.links(),
                None => return Err(Corruption::Dangling { list, node: id }),
            };
            let (back, forward) = match direction {
                Direction::FromHead => (links.prev, links.next),
                Direction::FromTail => (links.next, links.prev),
            };

            if links.list != Some(list) || back != behind {
                return Err(Corruption::BrokenLink {
                    list,
                    node: Some(id),
                });
            }

            order.push(id);
            behind = Some(id);
            cursor = forward;
        }

        if order.len() != expected || end != behind {
            return Err(Corruption::BrokenLink { list, node: behind });
        }

        Ok(order)
    }

    /// Rebuilds `list` from the nodes tagged as its members, in
    /// decreasing sequence order.  This drops any corrupt link on the
    /// list and reproduces the exact order of a healthy list.
    pub fn relink<T: Ranked>(&mut self, nodes: &mut Arena<T>, list: List) {
        let mut members: Vec<(u64, EntryId)> = nodes
            .iter()
            .filter(|(_, node)| node.links().list == Some(list))
            .map(|(id, node)| (node.links().seq, id))
            .collect();
        members.sort_by_key(|(seq, id)| (Reverse(*seq), *id));

        let l = list.index();
        for (i, (_, id)) in members.iter().enumerate() {
            let prev = if i > 0 { Some(members[i - 1].1) } else { None };
            let next = members.get(i + 1).map(|(_, id)| *id);

            if let Some(node) = nodes.get_mut(*id) {
                let links = node.links_mut();
                links.prev = prev;
                links.next = next;
            }
            self.touched.push(*id);
        }

        self.heads[l] = members.first().map(|(_, id)| *id);
        self.tails[l] = members.last().map(|(_, id)| *id);
        self.lens[l] = members.len();
        if let Some((seq, _)) = members.first() {
            self.seq = self.seq.max(*seq);
        }
    }

    /// Installs list ends and length as loaded from disk.  The nodes'
    /// links must already be in place; they are validated lazily, on
    /// the next walk.
    pub fn restore(
        &mut self,
        list: List,
        head: Option<EntryId>,
        tail: Option<EntryId>,
        len: usize,
        max_seq: u64,
    ) {
        let l = list.index();
        self.heads[l] = head;
        self.tails[l] = tail;
        self.lens[l] = len;
        self.seq = self.seq.max(max_seq);
    }

    pub fn clear(&mut self) {
        self.heads = [None; LIST_COUNT];
        self.tails = [None; LIST_COUNT];
        self.lens = [0; LIST_COUNT];
        self.touched.clear();
    }

    /// Returns (and forgets) the nodes whose links changed, without
    /// duplicates.
    pub fn take_touched(&mut self) -> Vec<EntryId> {
        let mut touched = std::mem::take(&mut self.touched);
        touched.sort();
        touched.dedup();
        touched
    }

    /// Points `id`'s forward link at `target` without fixing anything
    /// up, the way a torn disk write would.
    #[cfg(test)]
    pub fn corrupt_next<T: Ranked>(&mut self, nodes: &mut Arena<T>, id: EntryId, target: EntryId) {
        if let Some(node) = nodes.get_mut(id) {
            node.links_mut().next = Some(target);
        }
    }
}

#[cfg(test)]
mod test {
    use proptest::prelude::*;
    use proptest_derive::Arbitrary;
    use std::collections::HashMap;
    use std::collections::VecDeque;

    use super::*;

    #[derive(Debug, Default)]
    struct Node(Links);

    impl Ranked for Node {
        fn links(&self) -> &Links {
            &self.0
        }

        fn links_mut(&mut self) -> &mut Links {
            &mut self.0
        }
    }

    fn list_of(reused: bool) -> List {
        if reused {
            List::Reused
        } else {
            List::NoUse
        }
    }

    #[derive(Arbitrary, Clone, Copy, Debug)]
    enum Op {
        Insert(u8, bool),
        Touch(u8, bool),
        Remove(u8),
    }

    fn populate(count: usize) -> (Arena<Node>, Rankings, Vec<EntryId>) {
        let mut nodes = Arena::default();
        let mut rankings = Rankings::default();
        let mut ids = Vec::new();

        for _ in 0..count {
            let id = nodes.insert(Node::default());
            rankings.insert_head(&mut nodes, id, List::NoUse);
            ids.push(id);
        }

        (nodes, rankings, ids)
    }

    #[test]
    fn test_insert_order() {
        let (nodes, rankings, ids) = populate(4);

        let from_head = rankings
            .walk(&nodes, List::NoUse, Direction::FromHead)
            .expect("walk should succeed");
        let expected: Vec<_> = ids.iter().rev().copied().collect();
        assert_eq!(from_head, expected);

        let from_tail = rankings
            .walk(&nodes, List::NoUse, Direction::FromTail)
            .expect("walk should succeed");
        assert_eq!(from_tail, ids);
        assert_eq!(rankings.tail(List::NoUse), Some(ids[0]));
    }

    #[test]
    fn test_move_between_lists() {
        let (mut nodes, mut rankings, ids) = populate(3);

        rankings.move_to_head(&mut nodes, ids[0], List::Reused);
        assert_eq!(rankings.len(List::NoUse), 2);
        assert_eq!(rankings.len(List::Reused), 1);
        assert_eq!(rankings.head(List::Reused), Some(ids[0]));
        assert_eq!(rankings.tail(List::NoUse), Some(ids[1]));

        // Moving the current head is just a sequence bump.
        rankings.move_to_head(&mut nodes, ids[2], List::NoUse);
        assert_eq!(
            rankings.walk(&nodes, List::NoUse, Direction::FromHead),
            Ok(vec![ids[2], ids[1]])
        );
    }

    #[test]
    fn test_self_loop_detected() {
        let (mut nodes, mut rankings, ids) = populate(5);

        rankings.corrupt_next(&mut nodes, ids[3], ids[3]);
        let walked = rankings.walk(&nodes, List::NoUse, Direction::FromHead);
        assert!(walked.is_err());
    }

    // A chain that is longer than the recorded length can only be
    // caught by the iteration bound.
    #[test]
    fn test_bound_catches_overlong_chain() {
        let (nodes, mut rankings, ids) = populate(5);

        rankings.restore(List::NoUse, Some(ids[4]), Some(ids[0]), 3, 0);
        assert_eq!(
            rankings.walk(&nodes, List::NoUse, Direction::FromHead),
            Err(Corruption::Cycle {
                list: List::NoUse
            })
        );
    }

    #[test]
    fn test_dangling_detected() {
        let (mut nodes, mut rankings, ids) = populate(3);

        rankings.corrupt_next(&mut nodes, ids[2], EntryId::DANGLING);
        assert_eq!(
            rankings.walk(&nodes, List::NoUse, Direction::FromHead),
            Err(Corruption::Dangling {
                list: List::NoUse,
                node: EntryId::DANGLING
            })
        );
    }

    #[test]
    fn test_relink_repairs_and_keeps_order() {
        let (mut nodes, mut rankings, ids) = populate(6);
        let before = rankings
            .walk(&nodes, List::NoUse, Direction::FromHead)
            .expect("walk should succeed");

        rankings.corrupt_next(&mut nodes, ids[4], ids[4]);
        assert!(rankings
            .walk(&nodes, List::NoUse, Direction::FromHead)
            .is_err());

        rankings.relink(&mut nodes, List::NoUse);
        assert_eq!(
            rankings.walk(&nodes, List::NoUse, Direction::FromHead),
            Ok(before)
        );
    }

    #[test]
    fn test_remove_tolerates_corrupt_neighbour() {
        let (mut nodes, mut rankings, ids) = populate(3);

        rankings.corrupt_next(&mut nodes, ids[2], ids[2]);
        assert!(rankings.remove(&mut nodes, ids[2]));
        assert!(!rankings.remove(&mut nodes, ids[2]));
        assert_eq!(rankings.head(List::NoUse), None);
        assert_eq!(rankings.len(List::NoUse), 2);

        rankings.relink(&mut nodes, List::NoUse);
        assert_eq!(
            rankings.walk(&nodes, List::NoUse, Direction::FromHead),
            Ok(vec![ids[1], ids[0]])
        );
    }

    #[test]
    fn test_take_touched_dedups() {
        let (mut nodes, mut rankings, ids) = populate(2);
        rankings.take_touched();

        rankings.move_to_head(&mut nodes, ids[0], List::NoUse);
        let touched = rankings.take_touched();
        assert_eq!(touched.len(), 2);
        assert!(touched.contains(&ids[0]));
        assert!(touched.contains(&ids[1]));
        assert!(rankings.take_touched().is_empty());
    }

    proptest! {
        // Compare against a pair of VecDeques, head at the front.
        #[test]
        fn test_against_model(ops in prop::collection::vec(any::<Op>(), 0..200)) {
            let mut nodes = Arena::default();
            let mut rankings = Rankings::default();
            let mut ids: HashMap<u8, EntryId> = HashMap::new();
            let mut model: [VecDeque<u8>; LIST_COUNT] = [VecDeque::new(), VecDeque::new()];

            for op in ops {
                match op {
                    Op::Insert(key, reused) => {
                        let key = key % 16;
                        if ids.contains_key(&key) {
                            continue;
                        }

                        let id = nodes.insert(Node::default());
                        let list = list_of(reused);
                        rankings.insert_head(&mut nodes, id, list);
                        ids.insert(key, id);
                        model[list.index()].push_front(key);
                    }
                    Op::Touch(key, reused) => {
                        let key = key % 16;
                        if let Some(id) = ids.get(&key) {
                            let list = list_of(reused);
                            rankings.move_to_head(&mut nodes, *id, list);
                            for m in model.iter_mut() {
                                m.retain(|k| *k != key);
                            }
                            model[list.index()].push_front(key);
                        }
                    }
                    Op::Remove(key) => {
                        let key = key % 16;
                        if let Some(id) = ids.remove(&key) {
                            prop_assert!(rankings.remove(&mut nodes, id));
                            nodes.remove(id);
                            for m in model.iter_mut() {
                                m.retain(|k| *k != key);
                            }
                        }
                    }
                }
            }

            let names: HashMap<EntryId, u8> = ids.iter().map(|(k, id)| (*id, *k)).collect();
            for list in List::ALL.iter() {
                let walked = rankings
                    .walk(&nodes, *list, Direction::FromHead)
                    .expect("healthy lists must walk");
                let walked: Vec<u8> = walked.iter().map(|id| names[id]).collect();
                let expected: Vec<u8> = model[list.index()].iter().copied().collect();
                prop_assert_eq!(&walked, &expected);

                let reversed = rankings
                    .walk(&nodes, *list, Direction::FromTail)
                    .expect("healthy lists must walk");
                prop_assert_eq!(reversed.len(), expected.len());

                // Relinking a healthy list is the identity.
                rankings.relink(&mut nodes, *list);
                let relinked = rankings
                    .walk(&nodes, *list, Direction::FromHead)
                    .expect("relinked lists must walk");
                let relinked: Vec<u8> = relinked.iter().map(|id| names[id]).collect();
                prop_assert_eq!(relinked, expected);
            }
        }
    }
}
