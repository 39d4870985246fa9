//! CONTEXT: Tests for the exception-stack trapframe image and page-table entry encoding
//! OWNERS: @runtime
//! STATUS: Functional
//! API_STABILITY: Stable
//! TEST_COVERAGE: 2 integration tests
//!
//! TEST_SCOPE:
//!   - UTrapframe little-endian image as pushed by the kernel
//!   - Pte frame/flag packing
//!
//! TEST_SCENARIOS:
//!   - trapframe_matches(): frame survives the exception-stack image
//!   - pte_keeps_cow_marker(): COW survives packing next to a frame number
//!
//! DEPENDENCIES:
//!   - nexus_abi::UTrapframe, nexus_abi::Pte
use nexus_abi::{FaultCode, Pte, PteFlags, UTrapframe, PFTEMP};

#[test]
fn trapframe_matches() {
    let frame = UTrapframe { fault_va: PFTEMP + 12, err: FaultCode::WRITE | FaultCode::USER };
    assert_eq!(UTrapframe::from_le_bytes(frame.to_le_bytes()), frame);
}

#[test]
fn pte_keeps_cow_marker() {
    let pte = Pte::new(0xfffff, PteFlags::PU_COW);
    assert_eq!(pte.frame(), 0xfffff);
    assert!(pte.has(PteFlags::COW));
    assert_eq!(Pte::from_raw(pte.raw()), pte);
}
