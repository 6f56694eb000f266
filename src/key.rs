//! Variable keys: identifiers addressing one independent scalar parameter.
//!
//! A key is an opaque id plus optional matrix coordinates. Two keys with the
//! same id but different coordinates address different independent scalars
//! (cells of the same parameter matrix); the `(-1, -1)` coordinate pair marks
//! a pure scalar variable.

use std::fmt;
use std::hash::Hash;

/// Coordinate value marking a scalar (non-matrix) variable.
pub const SCALAR_COORD: i64 = -1;

/// Bound for the opaque id type carried by a [`VariableKey`].
///
/// Blanket-implemented; any cloneable, hashable, debuggable type works
/// (string names, enums, integers).
pub trait Key: Clone + Eq + Hash + fmt::Debug {}

impl<T: Clone + Eq + Hash + fmt::Debug> Key for T {}

/// Identifier for one independent scalar parameter: opaque id + coordinates.
///
/// Equality and hashing cover all three fields. Immutable: created once when
/// a model's parameter space is declared, never mutated.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct VariableKey<K: Key> {
    id: K,
    row: i64,
    col: i64,
}

impl<K: Key> VariableKey<K> {
    /// Key for a pure scalar variable (coordinates `(-1, -1)`).
    pub fn scalar(id: K) -> Self {
        VariableKey {
            id,
            row: SCALAR_COORD,
            col: SCALAR_COORD,
        }
    }

    /// Key for one cell of a matrix variable.
    pub fn cell(id: K, row: usize, col: usize) -> Self {
        VariableKey {
            id,
            row: row as i64,
            col: col as i64,
        }
    }

    /// Key with raw coordinates, as read back from a persisted record.
    pub fn with_coords(id: K, row: i64, col: i64) -> Self {
        VariableKey { id, row, col }
    }

    /// The opaque id.
    pub fn id(&self) -> &K {
        &self.id
    }

    /// Row coordinate (`-1` for a scalar variable).
    pub fn row(&self) -> i64 {
        self.row
    }

    /// Column coordinate (`-1` for a scalar variable).
    pub fn col(&self) -> i64 {
        self.col
    }

    /// True when this key addresses a scalar rather than a matrix cell.
    pub fn is_scalar(&self) -> bool {
        self.row == SCALAR_COORD && self.col == SCALAR_COORD
    }
}
