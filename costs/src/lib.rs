#![deny(missing_docs)]
//! Cost accounting shared by the ledger crates.
//!
//! Tree operations never log; instead they hand back what they touched
//! (seeks, bytes, node hashes) next to their result so callers can meter or
//! assert on it.

use std::ops::{Add, AddAssign};

/// Approximate resources consumed by an operation.
#[derive(Debug, Default, Clone, Copy, Eq, PartialEq)]
pub struct OperationCost {
    /// Number of node store lookups.
    pub seek_count: u32,
    /// Bytes read from the node store.
    pub storage_loaded_bytes: u64,
    /// Bytes written to the node store.
    pub storage_written_bytes: u64,
    /// Number of 64-byte node hashes computed.
    pub hash_node_calls: u32,
}

impl OperationCost {
    /// Cost of a single store lookup that loaded `loaded` bytes.
    pub fn with_seek(loaded: u64) -> Self {
        OperationCost {
            seek_count: 1,
            storage_loaded_bytes: loaded,
            ..Default::default()
        }
    }
}

impl Add for OperationCost {
    type Output = Self;

    fn add(mut self, rhs: Self) -> Self::Output {
        self += rhs;
        self
    }
}

impl AddAssign for OperationCost {
    fn add_assign(&mut self, rhs: Self) {
        self.seek_count += rhs.seek_count;
        self.storage_loaded_bytes += rhs.storage_loaded_bytes;
        self.storage_written_bytes += rhs.storage_written_bytes;
        self.hash_node_calls += rhs.hash_node_calls;
    }
}

/// A value paired with the cost of producing it.
#[derive(Debug, Eq, PartialEq)]
pub struct CostContext<T> {
    /// The operation's return value.
    pub value: T,
    /// What it cost.
    pub cost: OperationCost,
}

impl<T> CostContext<T> {
    /// Take the value out, adding its cost to `acc_cost`.
    pub fn unwrap_add_cost(self, acc_cost: &mut OperationCost) -> T {
        *acc_cost += self.cost;
        self.value
    }

    /// Take the value out, dropping the cost.
    pub fn unwrap(self) -> T {
        self.value
    }

    /// Map the value, keeping the cost.
    pub fn map<B>(self, f: impl FnOnce(T) -> B) -> CostContext<B> {
        CostContext {
            value: f(self.value),
            cost: self.cost,
        }
    }
}

/// `Result` wrapped into a `CostContext`.
pub type CostResult<T, E> = CostContext<Result<T, E>>;

impl<T, E> CostResult<T, E> {
    /// Map the `Ok` value, keeping the cost.
    pub fn map_ok<B>(self, f: impl FnOnce(T) -> B) -> CostResult<B, E> {
        self.map(|result| result.map(f))
    }

    /// Map the `Err` value, keeping the cost.
    pub fn map_err<B>(self, f: impl FnOnce(E) -> B) -> CostResult<T, B> {
        self.map(|result| result.map_err(f))
    }

    /// Chain another costed fallible operation on `Ok`, summing costs.
    pub fn flat_map_ok<B>(self, f: impl FnOnce(T) -> CostResult<B, E>) -> CostResult<B, E> {
        let mut cost = self.cost;
        let value = match self.value {
            Ok(x) => f(x).unwrap_add_cost(&mut cost),
            Err(e) => Err(e),
        };
        CostContext { value, cost }
    }
}

/// Extension trait to attach a cost to any value.
pub trait CostsExt {
    /// Wrap `self` with the given cost.
    fn wrap_with_cost(self, cost: OperationCost) -> CostContext<Self>
    where
        Self: Sized,
    {
        CostContext { value: self, cost }
    }
}

impl<T> CostsExt for T {}

/// `?` for `CostResult`: on error, return early carrying everything
/// accumulated in `$cost` so far; on success, add the cost and yield the
/// value.
#[macro_export]
macro_rules! cost_return_on_error {
    ( &mut $cost:ident, $($body:tt)+ ) => {
        {
            use $crate::CostsExt;
            let result_with_cost = { $($body)+ };
            let result = result_with_cost.unwrap_add_cost(&mut $cost);
            match result {
                Ok(x) => x,
                Err(e) => return Err(e.into()).wrap_with_cost($cost),
            }
        }
    };
}
