//! Resource ledger and manager.
//!
//! The worker advertises a fixed budget of CPU (millicpu) and memory (MiB).
//! Callers reserve slices of it with [`ResourceManager::allocate`] and hand
//! them back with [`ResourceManager::free`]. There is no admission queue: a
//! request that does not fit fails immediately and the scheduler is expected
//! to try another worker.
//!
//! All reads and writes go through one mutex. Nothing under the lock does
//! I/O, so the critical section is O(1).

use std::collections::HashMap;
use std::fmt;
use std::ops::{Add, AddAssign, Sub, SubAssign};
use std::sync::{Mutex, MutexGuard, PoisonError};

use loom_id::AllocationId;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::error::ErrorClass;

/// Smallest CPU slice a single allocation may request, in millicpu.
pub const MIN_CPU_ALLOCATION: i64 = 100;

/// Smallest memory slice a single allocation may request, in MiB.
pub const MIN_MEMORY_ALLOCATION: i64 = 128;

/// A CPU/memory pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceQuantity {
    /// Millicpu (1000 = one core).
    pub cpu: i64,
    /// MiB.
    pub memory: i64,
}

impl ResourceQuantity {
    pub const ZERO: Self = Self { cpu: 0, memory: 0 };

    pub const fn new(cpu: i64, memory: i64) -> Self {
        Self { cpu, memory }
    }
}

impl fmt::Display for ResourceQuantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}m cpu / {}MiB", self.cpu, self.memory)
    }
}

impl Add for ResourceQuantity {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self::new(self.cpu + rhs.cpu, self.memory + rhs.memory)
    }
}

impl AddAssign for ResourceQuantity {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl Sub for ResourceQuantity {
    type Output = Self;

    fn sub(self, rhs: Self) -> Self {
        Self::new(self.cpu - rhs.cpu, self.memory - rhs.memory)
    }
}

impl SubAssign for ResourceQuantity {
    fn sub_assign(&mut self, rhs: Self) {
        *self = *self - rhs;
    }
}

impl std::iter::Sum for ResourceQuantity {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::ZERO, Add::add)
    }
}

/// Which half of a [`ResourceQuantity`] an error is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceKind::Cpu => f.write_str("cpu"),
            ResourceKind::Memory => f.write_str("memory"),
        }
    }
}

/// Errors from resource operations.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ResourceError {
    #[error("not enough cpu available: requested {requested}m, free {available}m")]
    InsufficientCpu { requested: i64, available: i64 },

    #[error("not enough memory available: requested {requested}MiB, free {available}MiB")]
    InsufficientMemory { requested: i64, available: i64 },

    #[error("{resource} allocation too low: requested {requested}, minimum {minimum}")]
    AllocationTooSmall {
        resource: ResourceKind,
        requested: i64,
        minimum: i64,
    },

    #[error("allocation not found: {0}")]
    AllocationNotFound(AllocationId),
}

impl ResourceError {
    pub fn class(&self) -> ErrorClass {
        match self {
            ResourceError::InsufficientCpu { .. } | ResourceError::InsufficientMemory { .. } => {
                ErrorClass::Capacity
            }
            ResourceError::AllocationTooSmall { .. } => ErrorClass::Policy,
            ResourceError::AllocationNotFound(_) => ErrorClass::NotFound,
        }
    }
}

/// Free capacity plus the outstanding allocations.
///
/// Invariant: `free == total - sum(allocations)` whenever the lock is not held.
#[derive(Debug, Clone)]
struct Ledger {
    free: ResourceQuantity,
    allocations: HashMap<AllocationId, ResourceQuantity>,
}

impl Ledger {
    fn new(total: ResourceQuantity) -> Self {
        Self {
            free: total,
            allocations: HashMap::new(),
        }
    }

    /// Capacity is checked before the minimum-size policy, cpu before memory.
    fn reserve(&mut self, request: ResourceQuantity) -> Result<AllocationId, ResourceError> {
        if request.cpu > self.free.cpu {
            return Err(ResourceError::InsufficientCpu {
                requested: request.cpu,
                available: self.free.cpu,
            });
        }
        if request.memory > self.free.memory {
            return Err(ResourceError::InsufficientMemory {
                requested: request.memory,
                available: self.free.memory,
            });
        }

        if request.cpu < MIN_CPU_ALLOCATION {
            return Err(ResourceError::AllocationTooSmall {
                resource: ResourceKind::Cpu,
                requested: request.cpu,
                minimum: MIN_CPU_ALLOCATION,
            });
        }
        if request.memory < MIN_MEMORY_ALLOCATION {
            return Err(ResourceError::AllocationTooSmall {
                resource: ResourceKind::Memory,
                requested: request.memory,
                minimum: MIN_MEMORY_ALLOCATION,
            });
        }

        let id = AllocationId::generate();
        self.free -= request;
        self.allocations.insert(id, request);
        Ok(id)
    }

    fn release(&mut self, id: &AllocationId) -> Result<ResourceQuantity, ResourceError> {
        let released = self
            .allocations
            .remove(id)
            .ok_or(ResourceError::AllocationNotFound(*id))?;
        self.free += released;
        Ok(released)
    }
}

/// Arbitrates the worker's fixed capacity between concurrent callers.
///
/// Construct one at startup and share it (`Arc<ResourceManager>`) with every
/// component that reserves or frees capacity.
#[derive(Debug)]
pub struct ResourceManager {
    total: ResourceQuantity,
    ledger: Mutex<Ledger>,
}

impl ResourceManager {
    /// Creates a manager whose whole budget is free.
    pub fn new(total: ResourceQuantity) -> Self {
        Self {
            total,
            ledger: Mutex::new(Ledger::new(total)),
        }
    }

    /// Drops every outstanding allocation and frees the whole budget.
    ///
    /// Only safe while nothing else holds allocation ids, i.e. at startup.
    pub fn reset(&self) {
        *self.ledger() = Ledger::new(self.total);
        debug!(free = %self.total, "Resource ledger reset");
    }

    /// Reserves `request` and returns the id that releases it.
    pub fn allocate(&self, request: ResourceQuantity) -> Result<AllocationId, ResourceError> {
        let mut ledger = self.ledger();
        let id = ledger.reserve(request)?;
        debug!(
            allocation_id = %id,
            cpu = request.cpu,
            memory = request.memory,
            free_cpu = ledger.free.cpu,
            free_memory = ledger.free.memory,
            "Allocated resources"
        );
        Ok(id)
    }

    /// Releases an allocation and returns what it held.
    ///
    /// Unknown and already-freed ids are rejected without touching the ledger.
    pub fn free(&self, id: &AllocationId) -> Result<ResourceQuantity, ResourceError> {
        let mut ledger = self.ledger();
        let released = ledger.release(id)?;
        debug!(
            allocation_id = %id,
            free_cpu = ledger.free.cpu,
            free_memory = ledger.free.memory,
            "Freed allocation"
        );
        Ok(released)
    }

    /// Consistent snapshot of the free capacity.
    pub fn query_free(&self) -> ResourceQuantity {
        self.ledger().free
    }

    /// The configured budget. Never changes.
    pub fn total(&self) -> ResourceQuantity {
        self.total
    }

    /// Sum of all outstanding allocations.
    pub fn allocated(&self) -> ResourceQuantity {
        self.ledger().allocations.values().copied().sum()
    }

    /// The quantity held by one allocation, if it is outstanding.
    pub fn allocation(&self, id: &AllocationId) -> Option<ResourceQuantity> {
        self.ledger().allocations.get(id).copied()
    }

    pub fn allocation_count(&self) -> usize {
        self.ledger().allocations.len()
    }

    // Every mutation completes before the guard drops, so a panic elsewhere
    // cannot leave the ledger half-updated and the poison flag is ignored.
    fn ledger(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    fn manager() -> ResourceManager {
        ResourceManager::new(ResourceQuantity::new(1000, 1280))
    }

    #[test]
    fn test_allocate_and_free() {
        let manager = manager();

        let id = manager.allocate(ResourceQuantity::new(100, 128)).unwrap();
        assert_eq!(manager.query_free(), ResourceQuantity::new(900, 1152));
        assert_eq!(manager.allocation(&id), Some(ResourceQuantity::new(100, 128)));

        let released = manager.free(&id).unwrap();
        assert_eq!(released, ResourceQuantity::new(100, 128));
        assert_eq!(manager.query_free(), manager.total());
        assert_eq!(manager.allocation_count(), 0);
    }

    #[test]
    fn test_allocate_too_much() {
        let manager = manager();
        for _ in 0..9 {
            manager.allocate(ResourceQuantity::new(100, 128)).unwrap();
        }

        let err = manager.allocate(ResourceQuantity::new(101, 128)).unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientCpu { .. }));

        let err = manager.allocate(ResourceQuantity::new(100, 129)).unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientMemory { .. }));
        assert_eq!(err.class(), ErrorClass::Capacity);
    }

    #[rstest]
    #[case(ResourceQuantity::new(99, 128), ResourceKind::Cpu)]
    #[case(ResourceQuantity::new(100, 127), ResourceKind::Memory)]
    #[case(ResourceQuantity::new(0, 0), ResourceKind::Cpu)]
    #[case(ResourceQuantity::new(-5, 512), ResourceKind::Cpu)]
    #[case(ResourceQuantity::new(500, -1), ResourceKind::Memory)]
    fn test_allocate_too_little(#[case] request: ResourceQuantity, #[case] kind: ResourceKind) {
        let manager = manager();
        let err = manager.allocate(request).unwrap_err();
        assert!(
            matches!(err, ResourceError::AllocationTooSmall { resource, .. } if resource == kind),
            "unexpected error {err:?}"
        );
        assert_eq!(err.class(), ErrorClass::Policy);
        assert_eq!(manager.query_free(), manager.total());
    }

    #[test]
    fn test_capacity_error_wins_over_minimum() {
        let manager = ResourceManager::new(ResourceQuantity::new(50, 1280));
        let err = manager.allocate(ResourceQuantity::new(60, 64)).unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientCpu { .. }));

        let manager = ResourceManager::new(ResourceQuantity::new(1000, 100));
        let err = manager.allocate(ResourceQuantity::new(50, 120)).unwrap_err();
        assert!(matches!(err, ResourceError::InsufficientMemory { .. }));
    }

    #[test]
    fn test_free_unknown_and_double_free() {
        let manager = manager();
        let unknown = AllocationId::generate();
        assert_eq!(
            manager.free(&unknown),
            Err(ResourceError::AllocationNotFound(unknown))
        );

        let id = manager.allocate(ResourceQuantity::new(200, 256)).unwrap();
        manager.free(&id).unwrap();
        let err = manager.free(&id).unwrap_err();
        assert_eq!(err.class(), ErrorClass::NotFound);
        assert_eq!(manager.query_free(), manager.total());
    }

    #[test]
    fn test_reset_drops_allocations() {
        let manager = manager();
        let id = manager.allocate(ResourceQuantity::new(300, 300)).unwrap();
        manager.reset();
        assert_eq!(manager.query_free(), manager.total());
        assert!(manager.free(&id).is_err());
    }

    #[test]
    fn test_quantity_arithmetic() {
        let a = ResourceQuantity::new(300, 512);
        let b = ResourceQuantity::new(100, 128);
        assert_eq!(a + b, ResourceQuantity::new(400, 640));
        assert_eq!(a - b, ResourceQuantity::new(200, 384));
        let total: ResourceQuantity = [a, b, b].into_iter().sum();
        assert_eq!(total, ResourceQuantity::new(500, 768));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Allocate(i64, i64),
        Free(usize),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            (0i64..600, 0i64..800).prop_map(|(cpu, mem)| Op::Allocate(cpu, mem)),
            (0usize..16).prop_map(Op::Free),
        ]
    }

    proptest! {
        #[test]
        fn prop_free_equals_total_minus_outstanding(ops in prop::collection::vec(op(), 1..64)) {
            let manager = manager();
            let mut held: Vec<AllocationId> = Vec::new();

            for op in ops {
                let before = manager.query_free();
                match op {
                    Op::Allocate(cpu, memory) => {
                        if let Ok(id) = manager.allocate(ResourceQuantity::new(cpu, memory)) {
                            held.push(id);
                        } else {
                            prop_assert_eq!(manager.query_free(), before);
                        }
                    }
                    Op::Free(index) if !held.is_empty() => {
                        let id = held.remove(index % held.len());
                        prop_assert!(manager.free(&id).is_ok());
                    }
                    Op::Free(_) => {
                        prop_assert!(manager.free(&AllocationId::generate()).is_err());
                        prop_assert_eq!(manager.query_free(), before);
                    }
                }

                let free = manager.query_free();
                prop_assert_eq!(free, manager.total() - manager.allocated());
                prop_assert!(free.cpu >= 0 && free.memory >= 0);
                prop_assert_eq!(manager.allocation_count(), held.len());
            }
        }
    }
}
