//! Integration tests for the resource ledger.

use std::collections::HashSet;
use std::sync::Arc;
use std::thread;

use loom_worker::resources::ResourceKind;
use loom_worker::{ErrorClass, ResourceError, ResourceManager, ResourceQuantity};

#[test]
fn test_fill_to_capacity_then_free_one() {
    let manager = ResourceManager::new(ResourceQuantity::new(1000, 1280));
    let slice = ResourceQuantity::new(100, 128);

    let ids: Vec<_> = (0..10).map(|_| manager.allocate(slice).unwrap()).collect();
    assert_eq!(manager.query_free(), ResourceQuantity::ZERO);

    let err = manager.allocate(slice).unwrap_err();
    assert_eq!(
        err,
        ResourceError::InsufficientCpu {
            requested: 100,
            available: 0
        }
    );
    assert_eq!(err.class(), ErrorClass::Capacity);

    assert_eq!(manager.free(&ids[3]).unwrap(), slice);
    assert_eq!(manager.query_free(), slice);
    manager.allocate(slice).unwrap();
    assert_eq!(manager.allocation_count(), 10);
}

#[test]
fn test_minimum_allocation_policy() {
    let manager = ResourceManager::new(ResourceQuantity::new(1000, 1280));

    assert_eq!(
        manager.allocate(ResourceQuantity::new(99, 128)).unwrap_err(),
        ResourceError::AllocationTooSmall {
            resource: ResourceKind::Cpu,
            requested: 99,
            minimum: 100
        }
    );
    assert_eq!(
        manager.allocate(ResourceQuantity::new(100, 127)).unwrap_err(),
        ResourceError::AllocationTooSmall {
            resource: ResourceKind::Memory,
            requested: 127,
            minimum: 128
        }
    );
    assert_eq!(manager.query_free(), manager.total());
}

#[test]
fn test_memory_exhaustion_reported_as_memory() {
    let manager = ResourceManager::new(ResourceQuantity::new(4000, 256));
    manager.allocate(ResourceQuantity::new(100, 200)).unwrap();

    let err = manager
        .allocate(ResourceQuantity::new(100, 128))
        .unwrap_err();
    assert_eq!(
        err,
        ResourceError::InsufficientMemory {
            requested: 128,
            available: 56
        }
    );
}

#[test]
fn test_concurrent_allocations_never_overcommit() {
    let total = ResourceQuantity::new(2000, 4096);
    let manager = Arc::new(ResourceManager::new(total));
    let slice = ResourceQuantity::new(150, 200);

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            thread::spawn(move || {
                (0..10)
                    .filter_map(|_| manager.allocate(slice).ok())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let granted: Vec<_> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();

    // 2000 / 150 = 13 slices by cpu, 4096 / 200 = 20 by memory.
    assert_eq!(granted.len(), 13);
    assert_eq!(granted.iter().collect::<HashSet<_>>().len(), granted.len());
    assert_eq!(manager.query_free() + manager.allocated(), total);

    let frees: Vec<_> = granted
        .chunks(4)
        .map(|chunk| {
            let manager = Arc::clone(&manager);
            let chunk = chunk.to_vec();
            thread::spawn(move || {
                for id in chunk {
                    manager.free(&id).unwrap();
                }
            })
        })
        .collect();
    for h in frees {
        h.join().unwrap();
    }
    assert_eq!(manager.query_free(), total);
    assert_eq!(manager.allocation_count(), 0);
}
