use rustfst::StateId;
use std::collections::HashMap;

use crate::prob::log_sum_exp;
use crate::scorer::LmState;

/// Index of a node in a [`PrefixArena`]
pub type NodeId = usize;

/// The empty prefix
pub const ROOT: NodeId = 0;

/// One decoded prefix: the path from the root to this node spells it.
#[derive(Debug, Clone)]
pub struct PrefixNode {
    /// Emitted class, `None` for the root
    pub class: Option<usize>,
    /// Node this one extends
    pub parent: Option<NodeId>,
    /// Step at which the class was emitted
    pub timestep: usize,
    /// Log probability of paths ending in blank, previous step
    pub log_prob_b_prev: f64,
    /// Log probability of paths ending in `class`, previous step
    pub log_prob_nb_prev: f64,
    /// Same, accumulating over the current step
    pub log_prob_b_cur: f64,
    pub log_prob_nb_cur: f64,
    /// Total log probability (acoustic plus weighted LM) as of the last step
    pub score: f64,
    /// Weighted LM contribution of extending the parent with `class`
    pub lm_delta: f64,
    /// Weighted LM contribution of the whole prefix
    pub lm_score: f64,
    /// Language model context after this prefix
    pub lm_state: Option<LmState>,
    /// Lexicon state after this prefix
    pub dict_state: Option<StateId>,
    /// Whether the node belongs to the current beam (or is joining it)
    pub exists: bool,
    /// Children still held in the arena
    num_children: usize,
}

impl PrefixNode {
    fn reset_probs(&mut self) {
        self.log_prob_b_prev = f64::NEG_INFINITY;
        self.log_prob_nb_prev = f64::NEG_INFINITY;
        self.log_prob_b_cur = f64::NEG_INFINITY;
        self.log_prob_nb_cur = f64::NEG_INFINITY;
        self.score = f64::NEG_INFINITY;
    }
}

/// Arena holding the prefixes of one decode.
///
/// A prefix is identified by its (parent, class) pair. Pruned nodes that
/// still have children are kept, marked as not existing, and can be revived
/// if the search reaches them again. Pruned leaves are freed together with
/// every dead ancestor they were keeping alive, and their slots are reused,
/// so the arena only holds the paths of the current beam.
#[derive(Debug)]
pub struct PrefixArena {
    nodes: Vec<PrefixNode>,
    children: HashMap<(NodeId, usize), NodeId>,
    /// Freed slots
    free: Vec<NodeId>,
}

impl PrefixArena {
    pub fn new(lm_state: Option<LmState>, dict_state: Option<StateId>) -> Self {
        let root = PrefixNode {
            class: None,
            parent: None,
            timestep: 0,
            log_prob_b_prev: 0.0,
            log_prob_nb_prev: f64::NEG_INFINITY,
            log_prob_b_cur: f64::NEG_INFINITY,
            log_prob_nb_cur: f64::NEG_INFINITY,
            score: 0.0,
            lm_delta: 0.0,
            lm_score: 0.0,
            lm_state,
            dict_state,
            exists: true,
            num_children: 0,
        };
        Self {
            nodes: vec![root],
            children: HashMap::new(),
            free: Vec::new(),
        }
    }

    /// Nodes in use, dead ancestors of live nodes included
    pub fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Slots allocated so far, in use or free
    pub fn slots(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, id: NodeId) -> &PrefixNode {
        &self.nodes[id]
    }

    pub fn node_mut(&mut self, id: NodeId) -> &mut PrefixNode {
        &mut self.nodes[id]
    }

    pub fn child(&self, parent: NodeId, class: usize) -> Option<NodeId> {
        self.children.get(&(parent, class)).copied()
    }

    /// Create the child of `parent` emitting `class` at `timestep`.
    pub fn add_child(
        &mut self,
        parent: NodeId,
        class: usize,
        timestep: usize,
        lm_delta: f64,
        lm_state: Option<LmState>,
        dict_state: Option<StateId>,
    ) -> NodeId {
        let lm_score = self.nodes[parent].lm_score + lm_delta;
        let mut node = PrefixNode {
            class: Some(class),
            parent: Some(parent),
            timestep,
            log_prob_b_prev: 0.0,
            log_prob_nb_prev: 0.0,
            log_prob_b_cur: 0.0,
            log_prob_nb_cur: 0.0,
            score: 0.0,
            lm_delta,
            lm_score,
            lm_state,
            dict_state,
            exists: true,
            num_children: 0,
        };
        node.reset_probs();
        let id = match self.free.pop() {
            Some(id) => {
                self.nodes[id] = node;
                id
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };
        self.nodes[parent].num_children += 1;
        self.children.insert((parent, class), id);
        id
    }

    /// Bring a pruned node back; its emission is now at `timestep`.
    pub fn revive(&mut self, id: NodeId, timestep: usize) {
        let node = &mut self.nodes[id];
        node.reset_probs();
        node.timestep = timestep;
        node.exists = true;
    }

    /// Take a node out of the beam.
    ///
    /// A node without children is freed, and so is each ancestor left both
    /// dead and childless by that. Freed ids must not be used again until
    /// [`add_child`](Self::add_child) hands them out.
    pub fn remove(&mut self, id: NodeId) {
        self.nodes[id].exists = false;
        let mut cur = id;
        while let Some(parent) = self.nodes[cur].parent {
            let node = &self.nodes[cur];
            if node.exists || node.num_children > 0 {
                break;
            }
            if let Some(class) = node.class {
                self.children.remove(&(parent, class));
            }
            self.nodes[cur].parent = None;
            self.free.push(cur);
            self.nodes[parent].num_children -= 1;
            cur = parent;
        }
    }

    /// Close the current step of a node: the accumulated probabilities
    /// become the previous ones and the score is refreshed.
    pub fn commit(&mut self, id: NodeId) {
        let node = &mut self.nodes[id];
        node.log_prob_b_prev = node.log_prob_b_cur;
        node.log_prob_nb_prev = node.log_prob_nb_cur;
        node.log_prob_b_cur = f64::NEG_INFINITY;
        node.log_prob_nb_cur = f64::NEG_INFINITY;
        node.score = log_sum_exp(node.log_prob_b_prev, node.log_prob_nb_prev);
    }

    /// Classes and emission steps from the root to `id`.
    pub fn path(&self, id: NodeId) -> (Vec<usize>, Vec<usize>) {
        let mut tokens = Vec::new();
        let mut timesteps = Vec::new();
        let mut cur = id;
        while let (Some(class), Some(parent)) = (self.nodes[cur].class, self.nodes[cur].parent) {
            tokens.push(class);
            timesteps.push(self.nodes[cur].timestep);
            cur = parent;
        }
        tokens.reverse();
        timesteps.reverse();
        (tokens, timesteps)
    }

    /// Classes of the word that `id` ends, i.e. back to the previous
    /// boundary or the root. Empty if `id` is itself a boundary.
    pub fn trailing_word<F>(&self, id: NodeId, is_boundary: F) -> Vec<usize>
    where
        F: Fn(usize) -> bool,
    {
        let mut word = Vec::new();
        let mut cur = id;
        while let (Some(class), Some(parent)) = (self.nodes[cur].class, self.nodes[cur].parent) {
            if is_boundary(class) {
                break;
            }
            word.push(class);
            cur = parent;
        }
        word.reverse();
        word
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn arena_with(path: &[usize]) -> (PrefixArena, NodeId) {
        let mut arena = PrefixArena::new(None, None);
        let mut id = ROOT;
        for (t, &c) in path.iter().enumerate() {
            id = arena.add_child(id, c, t, 0.0, None, None);
        }
        (arena, id)
    }

    #[test]
    fn it_recovers_paths() {
        let (arena, leaf) = arena_with(&[3, 1, 4]);
        assert_eq!(arena.len(), 4);
        let (tokens, timesteps) = arena.path(leaf);
        assert_eq!(tokens, vec![3, 1, 4]);
        assert_eq!(timesteps, vec![0, 1, 2]);
        assert_eq!(arena.path(ROOT), (vec![], vec![]));
    }

    #[test]
    fn it_finds_children_by_class() {
        let (arena, leaf) = arena_with(&[3, 1]);
        let first = arena.child(ROOT, 3).unwrap();
        assert_eq!(arena.child(first, 1), Some(leaf));
        assert_eq!(arena.child(first, 2), None);
    }

    #[test]
    fn it_extracts_trailing_words() {
        // "ab cd" with 0 as the boundary class
        let (arena, leaf) = arena_with(&[1, 2, 0, 3, 4]);
        assert_eq!(arena.trailing_word(leaf, |c| c == 0), vec![3, 4]);
        let space = arena.node(leaf).parent.and_then(|p| arena.node(p).parent).unwrap();
        assert!(arena.trailing_word(space, |c| c == 0).is_empty());
        let b = arena.node(space).parent.unwrap();
        assert_eq!(arena.trailing_word(b, |c| c == 0), vec![1, 2]);
    }

    #[test]
    fn it_commits_and_revives() {
        let (mut arena, leaf) = arena_with(&[2, 3]);
        let mid = arena.node(leaf).parent.unwrap();
        arena.node_mut(mid).log_prob_nb_cur = 0.25f64.ln();
        arena.node_mut(mid).log_prob_b_cur = 0.25f64.ln();
        arena.commit(mid);
        assert!((arena.node(mid).score - 0.5f64.ln()).abs() < 1e-12);
        assert_eq!(arena.node(mid).log_prob_nb_cur, f64::NEG_INFINITY);

        // still has a child, so it stays reachable
        arena.remove(mid);
        assert!(!arena.node(mid).exists);
        assert_eq!(arena.child(ROOT, 2), Some(mid));
        arena.revive(mid, 7);
        assert!(arena.node(mid).exists);
        assert_eq!(arena.node(mid).timestep, 7);
        assert_eq!(arena.node(mid).score, f64::NEG_INFINITY);
    }

    #[test]
    fn it_frees_dead_branches() {
        let (mut arena, leaf) = arena_with(&[1, 2, 3]);
        let b = arena.node(leaf).parent.unwrap();
        let a = arena.node(b).parent.unwrap();
        arena.remove(a);
        arena.remove(b);
        assert_eq!(arena.len(), 4);
        arena.remove(leaf);
        assert_eq!(arena.len(), 1);
        assert_eq!(arena.child(ROOT, 1), None);
        assert_eq!(arena.child(a, 2), None);
        assert_eq!(arena.node(ROOT).num_children, 0);

        let reused = arena.add_child(ROOT, 5, 9, 0.0, None, None);
        assert!(reused != ROOT && reused < 4);
        assert_eq!(arena.slots(), 4);
        assert_eq!(arena.path(reused), (vec![5], vec![9]));
    }

    #[test]
    fn it_keeps_ancestors_of_live_nodes() {
        let (mut arena, leaf) = arena_with(&[1, 2]);
        let a = arena.node(leaf).parent.unwrap();
        let sibling = arena.add_child(a, 4, 2, 0.0, None, None);
        arena.remove(a);
        arena.remove(leaf);
        // a is dead but still leads to sibling
        assert_eq!(arena.len(), 3);
        assert_eq!(arena.path(sibling), (vec![1, 4], vec![0, 2]));
        arena.remove(sibling);
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn it_accumulates_lm_scores() {
        let mut arena = PrefixArena::new(Some(0), None);
        let a = arena.add_child(ROOT, 1, 0, -1.5, Some(2), None);
        let b = arena.add_child(a, 2, 1, -0.5, Some(3), None);
        assert_eq!(arena.node(b).lm_score, -2.0);
        assert_eq!(arena.node(b).lm_state, Some(3));
    }
}
