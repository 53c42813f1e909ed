//! # Intrusive AVL Tree
//!
//! A height-balanced binary search tree whose nodes live in a [`Slab`] and
//! carry their own links ([`AvlLinks`]). A record can take part in several
//! trees at once by embedding one set of links per tree; an [`AvlAdapter`]
//! tells each tree which links belong to it and how records are ordered.
//!
//! ```text
//!            ┌────────┐
//!            │ h = 3  │
//!            └─┬────┬─┘
//!       ┌──────┘    └──────┐
//!   ┌───▼────┐         ┌───▼────┐
//!   │ h = 2  │         │ h = 1  │
//!   └───┬────┘         └────────┘
//!   ┌───▼────┐
//!   │ h = 1  │          balance = h(left) - h(right) ∈ [-1, 1]
//!   └────────┘
//! ```
//!
//! The height of an absent subtree is 0. Every insert and erase rebalances
//! on the way back up and asserts that the balance factor stays in range.
//! Recursion depth is bounded by the tree height.

use crate::slab::{Handle, Slab};
use core::cmp::Ordering;

/// Child links and subtree height of one tree membership.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct AvlLinks {
    left: Option<Handle>,
    right: Option<Handle>,
    height: u8,
}

impl AvlLinks {
    /// Links of a record that is not in any tree.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            left: None,
            right: None,
            height: 0,
        }
    }
}

/// Binds a tree to the links and ordering of its node type.
pub trait AvlAdapter {
    type Node;
    type Key: Copy;

    fn links(node: &Self::Node) -> &AvlLinks;
    fn links_mut(node: &mut Self::Node) -> &mut AvlLinks;

    /// Ordering key of a node.
    fn key(node: &Self::Node) -> Self::Key;

    /// Three-way comparison; `Equal` means "same node" for insert and erase.
    fn compare(a: &Self::Key, b: &Self::Key) -> Ordering;
}

pub struct AvlTree<A: AvlAdapter> {
    root: Option<Handle>,
    len: usize,
    _adapter: core::marker::PhantomData<A>,
}

impl<A: AvlAdapter> Default for AvlTree<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: AvlAdapter> AvlTree<A> {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            root: None,
            len: 0,
            _adapter: core::marker::PhantomData,
        }
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> usize {
        self.len
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    #[must_use]
    pub const fn root(&self) -> Option<Handle> {
        self.root
    }

    /// Link `node` into the tree.
    ///
    /// # Errors
    /// The handle of the node that already compares equal; the tree is unchanged.
    pub fn insert<const N: usize>(
        &mut self,
        nodes: &mut Slab<A::Node, N>,
        node: Handle,
    ) -> Result<(), Handle> {
        *A::links_mut(&mut nodes[node]) = AvlLinks {
            left: None,
            right: None,
            height: 1,
        };
        let key = A::key(&nodes[node]);
        self.root = Some(Self::insert_at(nodes, self.root, node, &key)?);
        self.len += 1;
        Ok(())
    }

    fn insert_at<const N: usize>(
        nodes: &mut Slab<A::Node, N>,
        at: Option<Handle>,
        node: Handle,
        key: &A::Key,
    ) -> Result<Handle, Handle> {
        let Some(t) = at else {
            return Ok(node);
        };

        match A::compare(key, &A::key(&nodes[t])) {
            Ordering::Equal => return Err(t),
            Ordering::Less => {
                let left = Self::insert_at(nodes, Self::left(nodes, t), node, key)?;
                A::links_mut(&mut nodes[t]).left = Some(left);
            }
            Ordering::Greater => {
                let right = Self::insert_at(nodes, Self::right(nodes, t), node, key)?;
                A::links_mut(&mut nodes[t]).right = Some(right);
            }
        }

        Ok(Self::rebalance(nodes, t))
    }

    /// Unlink the node comparing equal to `key` and return it.
    pub fn erase<const N: usize>(
        &mut self,
        nodes: &mut Slab<A::Node, N>,
        key: &A::Key,
    ) -> Option<Handle> {
        let (root, erased) = Self::erase_at(nodes, self.root, key);
        self.root = root;
        if let Some(erased) = erased {
            *A::links_mut(&mut nodes[erased]) = AvlLinks::new();
            self.len -= 1;
        }
        erased
    }

    fn erase_at<const N: usize>(
        nodes: &mut Slab<A::Node, N>,
        at: Option<Handle>,
        key: &A::Key,
    ) -> (Option<Handle>, Option<Handle>) {
        let Some(t) = at else {
            return (None, None);
        };

        let erased = match A::compare(key, &A::key(&nodes[t])) {
            Ordering::Less => {
                let (left, erased) = Self::erase_at(nodes, Self::left(nodes, t), key);
                A::links_mut(&mut nodes[t]).left = left;
                erased
            }
            Ordering::Greater => {
                let (right, erased) = Self::erase_at(nodes, Self::right(nodes, t), key);
                A::links_mut(&mut nodes[t]).right = right;
                erased
            }
            Ordering::Equal => {
                let links = *A::links(&nodes[t]);
                let replacement = match (links.left, links.right) {
                    (None, None) => None,
                    (Some(child), None) | (None, Some(child)) => Some(child),
                    (Some(left), Some(right)) => {
                        let (right, successor) = Self::take_min(nodes, right);
                        let succ = A::links_mut(&mut nodes[successor]);
                        succ.left = Some(left);
                        succ.right = right;
                        Some(Self::rebalance(nodes, successor))
                    }
                };
                return (replacement, Some(t));
            }
        };

        if erased.is_none() {
            return (Some(t), None);
        }
        (Some(Self::rebalance(nodes, t)), erased)
    }

    /// Detach the leftmost node below `t`; returns the new subtree root and the node.
    fn take_min<const N: usize>(
        nodes: &mut Slab<A::Node, N>,
        t: Handle,
    ) -> (Option<Handle>, Handle) {
        match Self::left(nodes, t) {
            None => (Self::right(nodes, t), t),
            Some(left) => {
                let (left, min) = Self::take_min(nodes, left);
                A::links_mut(&mut nodes[t]).left = left;
                (Some(Self::rebalance(nodes, t)), min)
            }
        }
    }

    /// Find the node comparing equal to `key`.
    #[must_use]
    pub fn find<const N: usize>(&self, nodes: &Slab<A::Node, N>, key: &A::Key) -> Option<Handle> {
        let mut at = self.root;
        while let Some(t) = at {
            at = match A::compare(key, &A::key(&nodes[t])) {
                Ordering::Less => Self::left(nodes, t),
                Ordering::Greater => Self::right(nodes, t),
                Ordering::Equal => return Some(t),
            };
        }
        None
    }

    /// Lowest node in tree order for which `adequate` holds.
    ///
    /// `adequate` must be monotone in tree order (false for a prefix, true
    /// for the rest), like "size is at least n" on a size-ordered tree.
    #[must_use]
    pub fn first_where<const N: usize>(
        &self,
        nodes: &Slab<A::Node, N>,
        adequate: impl Fn(&A::Node) -> bool,
    ) -> Option<Handle> {
        let mut best = None;
        let mut at = self.root;
        while let Some(t) = at {
            if adequate(&nodes[t]) {
                best = Some(t);
                at = Self::left(nodes, t);
            } else {
                at = Self::right(nodes, t);
            }
        }
        best
    }

    /// Visit all nodes in ascending order.
    pub fn for_each<const N: usize>(
        &self,
        nodes: &Slab<A::Node, N>,
        mut f: impl FnMut(Handle, &A::Node),
    ) {
        Self::visit(nodes, self.root, &mut f);
    }

    fn visit<const N: usize>(
        nodes: &Slab<A::Node, N>,
        at: Option<Handle>,
        f: &mut impl FnMut(Handle, &A::Node),
    ) {
        if let Some(t) = at {
            Self::visit(nodes, Self::left(nodes, t), f);
            f(t, &nodes[t]);
            Self::visit(nodes, Self::right(nodes, t), f);
        }
    }

    #[inline]
    fn left<const N: usize>(nodes: &Slab<A::Node, N>, t: Handle) -> Option<Handle> {
        A::links(&nodes[t]).left
    }

    #[inline]
    fn right<const N: usize>(nodes: &Slab<A::Node, N>, t: Handle) -> Option<Handle> {
        A::links(&nodes[t]).right
    }

    #[inline]
    fn height<const N: usize>(nodes: &Slab<A::Node, N>, at: Option<Handle>) -> u8 {
        at.map_or(0, |t| A::links(&nodes[t]).height)
    }

    fn update_height<const N: usize>(nodes: &mut Slab<A::Node, N>, t: Handle) {
        let links = *A::links(&nodes[t]);
        let height = Self::height(nodes, links.left).max(Self::height(nodes, links.right)) + 1;
        A::links_mut(&mut nodes[t]).height = height;
    }

    fn balance<const N: usize>(nodes: &Slab<A::Node, N>, t: Handle) -> i16 {
        let links = A::links(&nodes[t]);
        i16::from(Self::height(nodes, links.left)) - i16::from(Self::height(nodes, links.right))
    }

    fn rotate_right<const N: usize>(nodes: &mut Slab<A::Node, N>, t: Handle) -> Handle {
        let Some(pivot) = Self::left(nodes, t) else {
            unreachable!("right rotation without a left child");
        };
        let moved = Self::right(nodes, pivot);
        A::links_mut(&mut nodes[t]).left = moved;
        A::links_mut(&mut nodes[pivot]).right = Some(t);
        Self::update_height(nodes, t);
        Self::update_height(nodes, pivot);
        pivot
    }

    fn rotate_left<const N: usize>(nodes: &mut Slab<A::Node, N>, t: Handle) -> Handle {
        let Some(pivot) = Self::right(nodes, t) else {
            unreachable!("left rotation without a right child");
        };
        let moved = Self::left(nodes, pivot);
        A::links_mut(&mut nodes[t]).right = moved;
        A::links_mut(&mut nodes[pivot]).left = Some(t);
        Self::update_height(nodes, t);
        Self::update_height(nodes, pivot);
        pivot
    }

    /// Restore the height and balance of `t` after one of its subtrees changed.
    fn rebalance<const N: usize>(nodes: &mut Slab<A::Node, N>, t: Handle) -> Handle {
        Self::update_height(nodes, t);

        let root = match Self::balance(nodes, t) {
            2.. => {
                let Some(left) = Self::left(nodes, t) else {
                    unreachable!("left-heavy node without left child");
                };
                if Self::balance(nodes, left) < 0 {
                    let left = Self::rotate_left(nodes, left);
                    A::links_mut(&mut nodes[t]).left = Some(left);
                }
                Self::rotate_right(nodes, t)
            }
            ..=-2 => {
                let Some(right) = Self::right(nodes, t) else {
                    unreachable!("right-heavy node without right child");
                };
                if Self::balance(nodes, right) > 0 {
                    let right = Self::rotate_right(nodes, right);
                    A::links_mut(&mut nodes[t]).right = Some(right);
                }
                Self::rotate_left(nodes, t)
            }
            _ => t,
        };

        let balance = Self::balance(nodes, root);
        assert!((-1..=1).contains(&balance), "AVL balance factor {balance} after rebalance");
        root
    }
}
