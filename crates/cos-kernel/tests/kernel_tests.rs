//! Kernel integration tests
//!
//! Drive `System` end to end against a HAL that records every page-table
//! operation, so the effects the core asks for can be checked against what
//! reached the platform.

extern crate alloc;

use alloc::collections::{BTreeMap, BTreeSet};
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::RefCell;
use core::sync::atomic::{AtomicU64, Ordering};

use cos_hal::{HalError, PgTblId, PhysAddr, VirtAddr, HAL};
use cos_kernel::syscall::*;
use cos_kernel::{
    DomainDesc, DomainId, Region, SecurityKind, SyscallResult, System, ThreadId, SCHED_RETURN,
};

// ============================================================================
// Mock HAL for Testing
// ============================================================================

pub struct MockHal {
    time: AtomicU64,
    page_tables: RefCell<BTreeSet<PgTblId>>,
    destroyed: RefCell<Vec<PgTblId>>,
    installs: RefCell<Vec<PgTblId>>,
    mappings: RefCell<BTreeMap<(PgTblId, VirtAddr), PhysAddr>>,
    meas: RefCell<Vec<u32>>,
    data_pages: RefCell<Vec<(u32, u32)>>,
    debug_log: RefCell<Vec<String>>,
}

impl MockHal {
    pub fn new() -> Self {
        Self {
            time: AtomicU64::new(0),
            page_tables: RefCell::new(BTreeSet::new()),
            destroyed: RefCell::new(Vec::new()),
            installs: RefCell::new(Vec::new()),
            mappings: RefCell::new(BTreeMap::new()),
            meas: RefCell::new(Vec::new()),
            data_pages: RefCell::new(Vec::new()),
            debug_log: RefCell::new(Vec::new()),
        }
    }

    fn installs(&self) -> Vec<PgTblId> {
        self.installs.borrow().clone()
    }

    fn debug_lines(&self) -> Vec<String> {
        self.debug_log.borrow().clone()
    }
}

impl Default for MockHal {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for MockHal {}
unsafe impl Sync for MockHal {}

impl HAL for MockHal {
    fn create_page_table(&self, pgtbl: PgTblId) {
        self.page_tables.borrow_mut().insert(pgtbl);
    }

    fn destroy_page_table(&self, pgtbl: PgTblId) {
        self.page_tables.borrow_mut().remove(&pgtbl);
        self.mappings.borrow_mut().retain(|(pt, _), _| *pt != pgtbl);
        self.destroyed.borrow_mut().push(pgtbl);
    }

    fn install_page_table(&self, pgtbl: PgTblId) {
        self.installs.borrow_mut().push(pgtbl);
    }

    fn copy_region(&self, from: PgTblId, to: PgTblId, base: VirtAddr, size: u64) {
        let mut mappings = self.mappings.borrow_mut();
        let copied: Vec<_> = mappings
            .iter()
            .filter(|((pt, va), _)| *pt == from && *va >= base && *va < base + size)
            .map(|((_, va), pa)| (*va, *pa))
            .collect();
        for (va, pa) in copied {
            mappings.insert((to, va), pa);
        }
    }

    fn clear_region(&self, pgtbl: PgTblId, base: VirtAddr, size: u64) {
        self.mappings
            .borrow_mut()
            .retain(|(pt, va), _| !(*pt == pgtbl && *va >= base && *va < base + size));
    }

    fn pgtbl_add_entry(
        &self,
        pgtbl: PgTblId,
        vaddr: VirtAddr,
        paddr: PhysAddr,
    ) -> Result<(), HalError> {
        if !self.page_tables.borrow().contains(&pgtbl) {
            return Err(HalError::NoSuchPageTable);
        }
        let mut mappings = self.mappings.borrow_mut();
        if mappings.contains_key(&(pgtbl, vaddr)) {
            return Err(HalError::AlreadyMapped);
        }
        mappings.insert((pgtbl, vaddr), paddr);
        Ok(())
    }

    fn pgtbl_rem_entry(&self, pgtbl: PgTblId, vaddr: VirtAddr) -> Result<(), HalError> {
        self.mappings
            .borrow_mut()
            .remove(&(pgtbl, vaddr))
            .map(|_| ())
            .ok_or(HalError::NotMapped)
    }

    fn access_page(&self, mem_id: u64) -> Option<PhysAddr> {
        // 100 pages of backing memory
        (mem_id < 100).then_some(0x8000_0000 + (mem_id << 12))
    }

    fn switch_thread_data_page(&self, old_tid: u32, new_tid: u32) {
        self.data_pages.borrow_mut().push((old_tid, new_tid));
    }

    fn meas_event(&self, event: u32) {
        self.meas.borrow_mut().push(event);
    }

    fn now_nanos(&self) -> u64 {
        self.time.fetch_add(10, Ordering::SeqCst)
    }

    fn debug_write(&self, msg: &str) {
        self.debug_log.borrow_mut().push(String::from(msg));
    }
}

// ============================================================================
// Fixture
// ============================================================================

/// Root scheduler R (privileged) and plain domains A and B.
/// Capabilities: R->A (index 0), A->B (index 4).
struct Fixture {
    system: System<MockHal>,
    r: DomainId,
    a: DomainId,
    b: DomainId,
    boot: ThreadId,
    r_to_a: u32,
    a_to_b: u32,
}

fn desc(base: u64, sched_depth: Option<u8>, privileged: bool) -> DomainDesc {
    DomainDesc {
        region: Region {
            base,
            size: 0x10_0000,
        },
        cap_count: 4,
        parent_sched: None,
        sched_depth,
        upcall_entry: base + 0x100,
        privileged,
    }
}

fn setup() -> Fixture {
    let mut system = System::new(MockHal::new());
    let r = system
        .register_domain(&desc(0x10_0000, Some(0), true))
        .unwrap();
    let a = system.register_domain(&desc(0x40_0000, None, false)).unwrap();
    let b = system.register_domain(&desc(0x50_0000, None, false)).unwrap();
    let r_to_a = system.install_capability(0, r, a, 0xA000).unwrap();
    let a_to_b = system.install_capability(4, a, b, 0xB000).unwrap();
    let boot = system.boot(r).unwrap();
    Fixture {
        system,
        r,
        a,
        b,
        boot,
        r_to_a,
        a_to_b,
    }
}

fn composite_of(f: &Fixture, d: DomainId) -> u32 {
    f.system.state.domains.get(d).unwrap().composite.to_raw()
}

fn assert_consistent(f: &Fixture) {
    let violations = f.system.check_invariants();
    assert!(violations.is_empty(), "{:?}", violations);
}

// ============================================================================
// Boot
// ============================================================================

#[test]
fn test_boot_installs_root_address_space() {
    let f = setup();
    let hal = f.system.hal();

    assert_eq!(hal.page_tables.borrow().len(), 3);
    assert_eq!(hal.installs().len(), 1);
    assert_eq!(hal.data_pages.borrow().as_slice(), &[(0, 1)]);
    assert_eq!(f.boot.to_raw(), 1);
    assert!(f.system.axiom.verify_integrity());
    assert_consistent(&f);
}

#[test]
fn test_get_thread_id_returns_boot_thread() {
    let mut f = setup();
    let (value, _) = f.system.syscall(f.r.to_raw(), SYS_GET_THREAD_ID, [0; 4]);
    assert_eq!(value, 1);
}

// ============================================================================
// Invocation
// ============================================================================

#[test]
fn test_invoke_and_return_switch_address_spaces() {
    let mut f = setup();
    let root_pt = f.system.hal().installs()[0];

    let entry = f.system.invoke_entry(f.r_to_a, 0x7000, 0x7100);
    assert_eq!(entry, 0xA000);
    let installs = f.system.hal().installs();
    assert_eq!(installs.len(), 2);
    assert_ne!(installs[1], root_pt);
    assert_eq!(f.system.hal().meas.borrow().as_slice(), &[0]);

    match f.system.ret() {
        SyscallResult::Returned(frame) => {
            assert_eq!(frame.sp, 0x7000);
            assert_eq!(frame.ip, 0x7100);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(f.system.hal().installs().last(), Some(&root_pt));
    assert_eq!(f.system.stats().invocations, 1);
    assert_consistent(&f);
}

#[test]
fn test_invoke_within_composite_skips_install() {
    let mut f = setup();
    let (ca, cb) = (composite_of(&f, f.a), composite_of(&f, f.b));
    let (value, _) = f.system.syscall(
        f.r.to_raw(),
        SYS_MPD_CNTL,
        [MPD_CNTL_MERGE, ca, f.a.to_raw(), cb],
    );
    assert!(value > 0);

    assert_eq!(f.system.invoke_entry(f.r_to_a, 0, 0), 0xA000);
    let installs = f.system.hal().installs().len();
    assert_eq!(f.system.invoke_entry(f.a_to_b, 0, 0), 0xB000);
    assert_eq!(f.system.hal().installs().len(), installs);

    assert!(matches!(f.system.ret(), SyscallResult::Returned(_)));
    assert_eq!(f.system.hal().installs().len(), installs);
    assert_consistent(&f);
}

#[test]
fn test_invalid_capability_returns_zero() {
    let mut f = setup();
    assert_eq!(f.system.invoke_entry(1000 << 20, 0, 0), 0);
    assert_eq!(f.system.invoke_entry(0xFFFF_FFFF, 0, 0), 0);

    let lines = f.system.hal().debug_lines();
    assert_eq!(lines.len(), 2);
    assert!(lines.iter().all(|l| l.starts_with("cos:")));
    assert_eq!(f.system.hal().installs().len(), 1);
    assert_consistent(&f);
}

#[test]
fn test_trust_violation_is_audited() {
    let mut f = setup();

    // A's capability used from R.
    match f.system.invoke(f.a_to_b, 0, 0) {
        SyscallResult::Err(e) => assert_eq!(e.errno(), -2),
        other => panic!("unexpected {:?}", other),
    }

    let events = f.system.axiom.syslog().security_events();
    assert_eq!(events.len(), 1);
    assert!(matches!(
        events[0].kind,
        SecurityKind::TrustViolation { capability: 4, .. }
    ));
    assert_eq!(events[0].frames, alloc::vec![composite_of(&f, f.r)]);
    assert!(f
        .system
        .hal()
        .debug_lines()
        .iter()
        .any(|l| l.contains("capability 4 owned by composite")));
    assert_eq!(
        f.system.state.thread(f.boot).unwrap().current_domain(),
        f.r
    );
}

#[test]
fn test_return_with_no_caller_faults_thread() {
    let mut f = setup();
    assert_eq!(f.system.ret(), SyscallResult::Fault);

    let events = f.system.axiom.syslog().security_events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, SecurityKind::ProtocolFault);
    assert_eq!(f.system.invoke_entry(f.r_to_a, 0, 0), 0);
}

// ============================================================================
// Composite control
// ============================================================================

#[test]
fn test_merge_then_split_through_syscalls() {
    let mut f = setup();
    let (ca, cb) = (composite_of(&f, f.a), composite_of(&f, f.b));
    let commits = f.system.axiom.commitlog().len();

    let (value, _) = f.system.syscall(
        f.r.to_raw(),
        SYS_MPD_CNTL,
        [MPD_CNTL_MERGE, ca, f.a.to_raw(), cb],
    );
    let survivor = value as u32;
    assert_eq!(composite_of(&f, f.a), survivor);
    assert_eq!(composite_of(&f, f.b), survivor);
    // Nothing held A's old composite, so its page table is gone.
    assert_eq!(f.system.hal().destroyed.borrow().len(), 1);

    let (value, rich) = f.system.syscall(
        f.r.to_raw(),
        SYS_MPD_CNTL,
        [MPD_CNTL_SPLIT, survivor, f.a.to_raw(), survivor],
    );
    let SyscallResult::Split(outcome) = rich else {
        panic!("expected split, got {:?}", rich);
    };
    let packed = ((outcome.split.to_raw() as i64) << 32) | outcome.remainder.to_raw() as i64;
    assert_eq!(value, packed);
    assert_eq!(composite_of(&f, f.a), outcome.split.to_raw());
    assert_eq!(composite_of(&f, f.b), outcome.remainder.to_raw());

    assert!(f.system.axiom.commitlog().len() > commits);
    assert!(f.system.axiom.verify_integrity());
    assert_consistent(&f);
}

#[test]
fn test_mpd_debug_lists_every_domain() {
    let mut f = setup();
    let (value, rich) = f.system.syscall(f.r.to_raw(), SYS_MPD_CNTL, [MPD_CNTL_DEBUG, 0, 0, 0]);
    assert_eq!(value, 3);
    match rich {
        SyscallResult::Composites(list) => {
            assert!(list.iter().any(|(d, _)| *d == f.a));
            assert!(list.iter().any(|(d, _)| *d == f.b));
        }
        other => panic!("unexpected {:?}", other),
    }
}

// ============================================================================
// Brands and upcalls
// ============================================================================

#[test]
fn test_brand_upcall_switches_threads() {
    let mut f = setup();
    f.system.invoke_entry(f.r_to_a, 0x7000, 0x7100);
    let a = f.a.to_raw();

    let (brand, _) = f
        .system
        .syscall(a, SYS_BRAND_CNTL, [BRAND_CNTL_CREATE, 0, 0, 0]);
    let (upcall, _) = f
        .system
        .syscall(a, SYS_BRAND_CNTL, [BRAND_CNTL_ADD_THREAD, brand as u32, 0, 0]);
    assert!(brand > 0 && upcall > 0);

    let (value, rich) = f.system.syscall(a, SYS_BRAND_UPCALL, [brand as u32, 0, 0, 0]);
    assert_eq!(value, 0);
    match rich {
        SyscallResult::Resume { thread, regs, .. } => {
            assert_eq!(thread.to_raw(), upcall as u32);
            assert_eq!(regs.ip, 0x10_0100);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        f.system.hal().data_pages.borrow().last(),
        Some(&(1, upcall as u32))
    );
    assert!(f.system.hal().meas.borrow().contains(&2));

    // Terminal return resumes the interrupted thread.
    match f.system.ret() {
        SyscallResult::Resume {
            thread, preempted, ..
        } => {
            assert_eq!(thread, f.boot);
            assert!(preempted);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(
        f.system.hal().data_pages.borrow().last(),
        Some(&(upcall as u32, 1))
    );
    assert_consistent(&f);
}

#[test]
fn test_upcall_without_trust_is_audited() {
    let mut f = setup();
    let (value, _) = f
        .system
        .syscall(f.r.to_raw(), SYS_UPCALL, [f.b.to_raw(), 0, 0, 0]);
    assert_eq!(value, -3);
    assert_eq!(f.system.axiom.syslog().security_events().len(), 1);
}

// ============================================================================
// Threads
// ============================================================================

#[test]
fn test_kill_policy() {
    let mut f = setup();
    let r = f.r.to_raw();

    let (value, _) = f.system.syscall(r, SYS_KILL, [f.boot.to_raw(), 0, 0, 0]);
    assert_eq!(value, -19);

    let (tid, _) = f
        .system
        .syscall(r, SYS_CREATE_THREAD, [0x1000, 0x2000, 0, 0]);
    assert!(tid > 1);
    let (value, _) = f.system.syscall(r, SYS_KILL, [tid as u32, 0, 0, 0]);
    assert_eq!(value, 0);
    let (value, _) = f.system.syscall(r, SYS_KILL, [tid as u32, 0, 0, 0]);
    assert_eq!(value, -6);
}

#[test]
fn test_switch_thread_cooperative() {
    let mut f = setup();
    let r = f.r.to_raw();
    let (tid, _) = f
        .system
        .syscall(r, SYS_CREATE_THREAD, [0x1000, 0x2000, 5, 0]);
    f.system.write_sched_page(f.r, tid as u32, 0).unwrap();

    let (value, rich) = f.system.syscall(r, SYS_SWITCH_THREAD, [0; 4]);
    assert_eq!(value, 0);
    match rich {
        SyscallResult::Resume { regs, .. } => {
            assert_eq!(regs.ip, 0x2000);
            assert_eq!(regs.args[0], 5);
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(f.system.state.user_data.current_thread, tid as u32);
    assert!(f.system.hal().meas.borrow().contains(&3));
}

// ============================================================================
// Mapping control
// ============================================================================

#[test]
fn test_mmap_grant_and_revoke() {
    let mut f = setup();
    let r = f.r.to_raw();
    let a = f.a.to_raw();

    let (value, _) = f
        .system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_GRANT, a, 0x40_1000, 9]);
    assert_eq!(value, 0);
    assert!(f
        .system
        .hal()
        .mappings
        .borrow()
        .values()
        .any(|pa| *pa == 0x8000_0000 + (9 << 12)));

    let (value, _) = f
        .system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_REVOKE, a, 0x40_1000, 0]);
    assert_eq!(value, 0);
    assert!(f.system.hal().mappings.borrow().is_empty());
}

#[test]
fn test_mmap_failures_record_no_commit() {
    let mut f = setup();
    let r = f.r.to_raw();
    let a = f.a.to_raw();
    f.system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_GRANT, a, 0x40_1000, 9]);
    let commits = f.system.axiom.commitlog().len();

    // Already mapped
    let (value, _) = f
        .system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_GRANT, a, 0x40_1000, 10]);
    assert_eq!(value, -18);
    // No such memory
    let (value, _) = f
        .system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_GRANT, a, 0x40_2000, 500]);
    assert_eq!(value, -18);
    // Not mapped
    let (value, _) = f
        .system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_REVOKE, a, 0x40_3000, 0]);
    assert_eq!(value, -18);
    // Outside A's range
    let (value, _) = f
        .system
        .syscall(r, SYS_MMAP_CNTL, [MMAP_CNTL_GRANT, a, 0x50_0000, 1]);
    assert_eq!(value, -11);

    assert_eq!(f.system.axiom.commitlog().len(), commits);
    assert!(f
        .system
        .hal()
        .debug_lines()
        .iter()
        .any(|l| l.starts_with("cos: syscall 11")));
}

// ============================================================================
// Syscall table
// ============================================================================

#[test]
fn test_unsupported_and_unknown_syscalls() {
    let mut f = setup();
    let r = f.r.to_raw();

    assert_eq!(f.system.syscall(r, SYS_VOID, [0; 4]).0, 0);
    assert_eq!(f.system.syscall(r, SYS_RESUME_RETURN, [0; 4]).0, -19);
    assert_eq!(
        f.system
            .syscall(r, SYS_MPD_CNTL, [MPD_CNTL_SPLIT_MERGE, 0, 0, 0])
            .0,
        -19
    );
    assert_eq!(f.system.syscall(r, 13, [0; 4]).0, 0);
    assert_eq!(f.system.syscall(r, 99, [0; 4]).0, -10);

    let (tid, _) = f
        .system
        .syscall(r, SYS_CREATE_THREAD, [0x1000, 0x2000, 0, 0]);
    f.system
        .write_sched_page(f.r, tid as u32, SCHED_RETURN)
        .unwrap();
    assert_eq!(f.system.syscall(r, SYS_SWITCH_THREAD, [0; 4]).0, -19);
    assert_eq!(f.system.state.user_data.current_thread, 1);
}

#[test]
fn test_syslog_records_request_and_response() {
    let mut f = setup();
    let r = f.r.to_raw();
    for num in [SYS_VOID, SYS_GET_THREAD_ID, 99] {
        f.system.syscall(r, num, [0; 4]);
    }
    assert_eq!(f.system.axiom.syslog().len(), 6);
}

#[test]
fn test_bad_domain_claim() {
    let mut f = setup();
    let (value, _) = f
        .system
        .syscall(f.a.to_raw(), SYS_CREATE_THREAD, [0, 0, 0, 0]);
    assert_eq!(value, -4);
}
