//! Identifier types minted by the worker.

use crate::typed_id;

typed_id!(
    /// Key for a reserved slice of worker capacity. Minted by a successful
    /// allocation and valid until that allocation is freed.
    AllocationId,
    "alloc"
);

typed_id!(
    /// Handle for a workload started on this worker.
    WorkloadId,
    "wrkl"
);
