//! Safe-reader strategy selection and fault containment.
//!
//! Environment-variable driven cases share one test body so they cannot
//! race each other through the process environment.

use stackscope::domain::{VmAddr, VmError};
use stackscope::vm::{self, VmReadMode, ALT_VM_READ_FORCE_VAR};

#[test]
fn test_mode_selection_and_fallback() {
    // The kernel primitive probes fine against our own process.
    let effective = vm::init(VmReadMode::Kernel).unwrap();
    assert_eq!(effective, VmReadMode::Kernel);

    // Forcing the alternative path makes the probe fail and the mirror
    // reader take over.
    std::env::set_var(ALT_VM_READ_FORCE_VAR, "yes");
    let effective = vm::init(VmReadMode::Kernel).unwrap();
    assert_eq!(effective, VmReadMode::Mirror);
    std::env::remove_var(ALT_VM_READ_FORCE_VAR);

    // The mirror reader still round-trips reads correctly.
    let data: Vec<u8> = (0u8..=255).collect();
    let mut out = vec![0u8; data.len()];
    vm::read_into(VmAddr(data.as_ptr() as usize), &mut out).unwrap();
    assert_eq!(out, data);

    // Explicitly requesting the mirror is honoured.
    let effective = vm::init(VmReadMode::Mirror).unwrap();
    assert_eq!(effective, VmReadMode::Mirror);

    // Fault containment: every address below the first page is refused
    // without raising any signal, in every mode.
    for mode in [VmReadMode::Kernel, VmReadMode::Mirror] {
        vm::init(mode).unwrap();
        for addr in [0usize, 1, 8, 2048, 4095] {
            let mut buf = [0u8; 16];
            let err = vm::read_into(VmAddr(addr), &mut buf).unwrap_err();
            assert!(
                matches!(err, VmError::ZeroPage { .. }),
                "mode {mode:?} addr {addr:#x}: {err}"
            );
        }
    }
}
