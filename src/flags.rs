/*
  Copyright© 2023 Raúl Wolters(1)

  This file is part of rustronomy-graphcut.

  rustronomy is free software: you can redistribute it and/or modify it under
  the terms of the European Union Public License version 1.2 or later, as
  published by the European Commission.

  rustronomy is distributed in the hope that it will be useful, but WITHOUT ANY
  WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
  A PARTICULAR PURPOSE. See the European Union Public License for more details.

  You should have received a copy of the EUPL in an/all official language(s) of
  the European Union along with rustronomy.  If not, see
  <https://ec.europa.eu/info/european-union-public-licence_en/>.

  (1) Resident of the Kingdom of the Netherlands; agreement between licensor and
  licensee subject to Dutch law as per article 15 of the EUPL.
*/

//! Packed per-node solver state.
//!
//! Layout of the flag word (least significant bit first):
//! ```text
//!  bit  0      in source set
//!  bit  1      in sink set
//!  bit  2      free
//!  bit  3      active
//!  bit  4      orphan
//!  bit  5      tree root (terminal-connected, no parent)
//!  bits 6..9   unused
//!  bits 9..17  parent direction, one bit per direction
//!  bits 17..25 edge saturated, one bit per direction
//! ```
//! Only `9 + 4 * MAX_DIMS` bits are needed, so a `u32` covers every supported
//! dimensionality.

use crate::grid::{Direction, MAX_DIMS};
use std::fmt;

const SOURCE: u32 = 1 << 0;
const SINK: u32 = 1 << 1;
const FREE: u32 = 1 << 2;
const ACTIVE: u32 = 1 << 3;
const ORPHAN: u32 = 1 << 4;
const ROOT: u32 = 1 << 5;
const SET_MASK: u32 = SOURCE | SINK | FREE;

const PARENT_SHIFT: u32 = 9;
const SATURATED_SHIFT: u32 = PARENT_SHIFT + 2 * MAX_DIMS as u32;
const DIRECTION_MASK: u32 = (1 << (2 * MAX_DIMS)) - 1;
const PARENT_MASK: u32 = DIRECTION_MASK << PARENT_SHIFT;

//The whole layout has to fit the flag word
const _: () = assert!(SATURATED_SHIFT + 2 * MAX_DIMS as u32 <= u32::BITS);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// The two search trees of the max-flow solver
pub enum Tree {
  Source,
  Sink,
}

impl Tree {
  pub fn opposite(self) -> Tree {
    match self {
      Tree::Source => Tree::Sink,
      Tree::Sink => Tree::Source,
    }
  }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
/// Flag word of a single node. Always a `u32`, even for 1D grids where 13 bits
/// (a `u16`) would do, so that one atomic cell type serves every grid.
pub struct NodeFlags(u32);

impl Default for NodeFlags {
  fn default() -> Self {
    NodeFlags::free()
  }
}

impl NodeFlags {
  /// A node that belongs to neither tree
  pub const fn free() -> Self {
    NodeFlags(FREE)
  }

  pub const fn from_bits(bits: u32) -> Self {
    NodeFlags(bits)
  }

  pub const fn bits(self) -> u32 {
    self.0
  }

  #[inline(always)]
  pub fn tree(self) -> Option<Tree> {
    if self.0 & SOURCE != 0 {
      Some(Tree::Source)
    } else if self.0 & SINK != 0 {
      Some(Tree::Sink)
    } else {
      None
    }
  }

  #[inline(always)]
  pub fn is_free(self) -> bool {
    self.0 & FREE != 0
  }

  /// Moves the node into `tree`. Parent and root bits are left untouched.
  #[inline(always)]
  pub fn join_tree(&mut self, tree: Tree) {
    self.0 &= !SET_MASK;
    self.0 |= match tree {
      Tree::Source => SOURCE,
      Tree::Sink => SINK,
    };
  }

  /// Detaches the node from its tree. The active bit is kept, it tracks queue
  /// membership rather than tree membership.
  #[inline(always)]
  pub fn make_free(&mut self) {
    self.0 &= !(SET_MASK | PARENT_MASK | ORPHAN | ROOT);
    self.0 |= FREE;
  }

  #[inline(always)]
  pub fn is_active(self) -> bool {
    self.0 & ACTIVE != 0
  }

  #[inline(always)]
  pub fn set_active(&mut self, active: bool) {
    self.set_bit(ACTIVE, active)
  }

  #[inline(always)]
  pub fn is_orphan(self) -> bool {
    self.0 & ORPHAN != 0
  }

  #[inline(always)]
  pub fn set_orphan(&mut self, orphan: bool) {
    self.set_bit(ORPHAN, orphan)
  }

  #[inline(always)]
  pub fn is_root(self) -> bool {
    self.0 & ROOT != 0
  }

  #[inline(always)]
  pub fn set_root(&mut self, root: bool) {
    self.set_bit(ROOT, root)
  }

  /// Direction of the tree parent, `None` for roots, orphans and free nodes
  #[inline(always)]
  pub fn parent(self) -> Option<Direction> {
    let bits = (self.0 & PARENT_MASK) >> PARENT_SHIFT;
    if bits == 0 {
      None
    } else {
      Some(Direction::from_index(bits.trailing_zeros() as usize))
    }
  }

  #[inline(always)]
  pub fn set_parent(&mut self, dir: Direction) {
    self.0 &= !PARENT_MASK;
    self.0 |= 1 << (PARENT_SHIFT + dir.index() as u32);
  }

  #[inline(always)]
  pub fn clear_parent(&mut self) {
    self.0 &= !PARENT_MASK;
  }

  /// True for tree nodes that are still linked to a terminal: roots and nodes
  /// with a parent.
  #[inline(always)]
  pub fn is_connected(self) -> bool {
    self.is_root() || self.0 & PARENT_MASK != 0
  }

  /// Cached `residual == 0` for the edge leaving the node in direction `dir`
  #[inline(always)]
  pub fn is_saturated(self, dir: Direction) -> bool {
    self.0 & (1 << (SATURATED_SHIFT + dir.index() as u32)) != 0
  }

  #[inline(always)]
  pub fn set_saturated(&mut self, dir: Direction, saturated: bool) {
    self.set_bit(1 << (SATURATED_SHIFT + dir.index() as u32), saturated)
  }

  #[inline(always)]
  fn set_bit(&mut self, bit: u32, value: bool) {
    if value {
      self.0 |= bit;
    } else {
      self.0 &= !bit;
    }
  }
}

impl fmt::Debug for NodeFlags {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("NodeFlags")
      .field("tree", &self.tree())
      .field("active", &self.is_active())
      .field("orphan", &self.is_orphan())
      .field("root", &self.is_root())
      .field("parent", &self.parent())
      .field("saturated", &format!("{:#010b}", (self.0 >> SATURATED_SHIFT) & DIRECTION_MASK))
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn starts_free() {
    let flags = NodeFlags::default();
    assert!(flags.is_free());
    assert_eq!(flags.tree(), None);
    assert_eq!(flags.parent(), None);
    assert!(!flags.is_connected());
  }

  #[test]
  fn tree_membership_is_exclusive() {
    let mut flags = NodeFlags::free();
    flags.join_tree(Tree::Source);
    assert_eq!(flags.tree(), Some(Tree::Source));
    assert!(!flags.is_free());
    flags.join_tree(Tree::Sink);
    assert_eq!(flags.tree(), Some(Tree::Sink));
    flags.make_free();
    assert_eq!(flags.tree(), None);
    assert!(flags.is_free());
  }

  #[test]
  fn parent_holds_a_single_direction() {
    let mut flags = NodeFlags::free();
    flags.join_tree(Tree::Sink);
    flags.set_parent(Direction::new(3, true));
    flags.set_parent(Direction::new(1, false));
    assert_eq!(flags.parent(), Some(Direction::new(1, false)));
    assert!(flags.is_connected());
    flags.clear_parent();
    flags.set_orphan(true);
    assert_eq!(flags.parent(), None);
    assert!(!flags.is_connected());
  }

  #[test]
  fn freeing_keeps_saturation_and_queue_state() {
    let mut flags = NodeFlags::free();
    let dir = Direction::new(0, true);
    flags.join_tree(Tree::Source);
    flags.set_root(true);
    flags.set_active(true);
    flags.set_saturated(dir, true);
    flags.make_free();
    assert!(flags.is_free());
    assert!(!flags.is_root());
    assert!(flags.is_active());
    assert!(flags.is_saturated(dir));
    assert!(!flags.is_saturated(dir.opposite()));
  }
}
