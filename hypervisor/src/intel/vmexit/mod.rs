//! VM-exit dispatch.
//!
//! Every exit lands in [`handle_vmexit`], which routes on the basic exit reason and then decides
//! whether the guest continues past the trapping instruction. No exit reason makes it fail: an
//! internal error is logged and the instruction is retried with the mapping unchanged.

pub mod cpuid;
pub mod cr;
pub mod dr;
pub mod ept;
pub mod exception;
pub mod halt;
pub mod interrupt;
pub mod invd;
pub mod io;
pub mod msr;
pub mod mtf;
pub mod rdtsc;
pub mod vmcall;
pub mod vmx_instruction;
pub mod xsetbv;

use {
    crate::intel::{shared::EptState, support::Cpu, vm::Vm, vmerror::VmxBasicExitReason},
    log::*,
    x86::vmx::vmcs::{guest, ro},
};

/// Represents the type of VM exit.
#[derive(Debug, Clone, Copy, PartialOrd, PartialEq, Eq)]
pub enum ExitType {
    /// VMX operation was left on this core; the guest continues without the hypervisor.
    ExitHypervisor,
    /// Move past the trapping instruction.
    IncrementRIP,
    /// Re-enter the guest at the same RIP.
    Continue,
}

/// Handles one VM exit on the current core.
///
/// Returns true once VMX operation has been left, in which case the caller must not resume the
/// guest through VMRESUME.
pub fn handle_vmexit<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, ept_state: &EptState) -> bool {
    vm.in_root_mode = true;
    vm.suppress_rip_advance = false;

    vm.guest_registers.rip = cpu.vmread(guest::RIP);
    vm.guest_registers.rsp = cpu.vmread(guest::RSP);
    vm.guest_registers.rflags = cpu.vmread(guest::RFLAGS);
    let guest_rsp = vm.guest_registers.rsp;

    let exit_reason = cpu.vmread(ro::EXIT_REASON) as u32;

    let exit_type = match VmxBasicExitReason::from_u32(exit_reason) {
        Some(basic_exit_reason) => dispatch(vm, cpu, ept_state, basic_exit_reason),
        None => {
            error!("Core {}: unknown exit reason {:#x}", vm.core_id, exit_reason);
            ExitType::IncrementRIP
        }
    };

    vm.suppress_rip_advance = exit_type != ExitType::IncrementRIP;

    if !vm.vmxoff_executed {
        if !vm.suppress_rip_advance {
            advance_guest_rip(vm, cpu);
        }

        if vm.guest_registers.rsp != guest_rsp {
            cpu.vmwrite(guest::RSP, vm.guest_registers.rsp);
        }
    }

    vm.in_root_mode = false;

    vm.vmxoff_executed
}

#[rustfmt::skip]
fn dispatch<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, ept_state: &EptState, basic_exit_reason: VmxBasicExitReason) -> ExitType {
    trace!("Core {}: {:?} at {:#x}", vm.core_id, basic_exit_reason, vm.guest_registers.rip);

    let result = match basic_exit_reason {
        // 0
        VmxBasicExitReason::ExceptionOrNmi => Ok(exception::handle_exception_or_nmi(vm, cpu)),
        // 1
        VmxBasicExitReason::ExternalInterrupt => Ok(interrupt::handle_external_interrupt(vm, cpu)),
        // 2
        VmxBasicExitReason::TripleFault => {
            error!("Core {}: triple fault at {:#x}, {:#x?}", vm.core_id, vm.guest_registers.rip, vm.guest_registers);
            Ok(ExitType::Continue)
        }
        // 7
        VmxBasicExitReason::InterruptWindow => Ok(interrupt::handle_interrupt_window(vm, cpu)),
        // 8
        VmxBasicExitReason::NmiWindow => Ok(interrupt::handle_nmi_window(vm, cpu)),
        // 10
        VmxBasicExitReason::Cpuid => Ok(cpuid::handle_cpuid(vm, cpu)),
        // 11, 19-27, 50, 53, 59
        VmxBasicExitReason::Getsec
        | VmxBasicExitReason::Vmclear
        | VmxBasicExitReason::Vmlaunch
        | VmxBasicExitReason::Vmptrld
        | VmxBasicExitReason::Vmptrst
        | VmxBasicExitReason::Vmread
        | VmxBasicExitReason::Vmresume
        | VmxBasicExitReason::Vmwrite
        | VmxBasicExitReason::Vmxoff
        | VmxBasicExitReason::Vmxon
        | VmxBasicExitReason::Invept
        | VmxBasicExitReason::Invvpid
        | VmxBasicExitReason::Vmfunc => Ok(vmx_instruction::handle_vmx_instruction(cpu)),
        // 12
        VmxBasicExitReason::Hlt => Ok(halt::handle_halt()),
        // 13
        VmxBasicExitReason::Invd => Ok(invd::handle_invd(cpu)),
        // 15
        VmxBasicExitReason::Rdpmc => Ok(rdtsc::handle_rdpmc(vm, cpu)),
        // 16
        VmxBasicExitReason::Rdtsc => Ok(rdtsc::handle_rdtsc(vm, cpu)),
        // 18
        VmxBasicExitReason::Vmcall => Ok(vmcall::handle_vmcall(vm, cpu, ept_state)),
        // 28
        VmxBasicExitReason::ControlRegisterAccesses => cr::handle_cr_access(vm, cpu),
        // 29
        VmxBasicExitReason::MovDr => Ok(dr::handle_mov_dr(vm, cpu)),
        // 30
        VmxBasicExitReason::IoInstruction => Ok(io::handle_io_instruction(vm, cpu)),
        // 31
        VmxBasicExitReason::Rdmsr => Ok(msr::handle_msr_access(vm, cpu, msr::MsrAccessType::Read)),
        // 32
        VmxBasicExitReason::Wrmsr => Ok(msr::handle_msr_access(vm, cpu, msr::MsrAccessType::Write)),
        // 37
        VmxBasicExitReason::MonitorTrapFlag => Ok(mtf::handle_monitor_trap_flag(vm, cpu, ept_state)),
        // 48
        VmxBasicExitReason::EptViolation => Ok(ept::handle_ept_violation(vm, cpu, ept_state)),
        // 49
        VmxBasicExitReason::EptMisconfiguration => Ok(ept::handle_ept_misconfiguration(vm, cpu)),
        // 51
        VmxBasicExitReason::Rdtscp => Ok(rdtsc::handle_rdtscp(vm, cpu)),
        // 52
        VmxBasicExitReason::VmxPreemptionTimerExpired => Ok(ExitType::Continue),
        // 55
        VmxBasicExitReason::Xsetbv => Ok(xsetbv::handle_xsetbv(vm, cpu)),
        _ => {
            error!("Core {}: unhandled exit {:?}, qualification {:#x}", vm.core_id, basic_exit_reason, cpu.vmread(ro::EXIT_QUALIFICATION));
            Ok(ExitType::IncrementRIP)
        }
    };

    result.unwrap_or_else(|error| {
        error!("Core {}: failed to handle {:?}: {}", vm.core_id, basic_exit_reason, error);
        ExitType::Continue
    })
}

/// Moves the guest past the instruction that caused the exit.
pub fn advance_guest_rip<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C) {
    let length = cpu.vmread(ro::VMEXIT_INSTRUCTION_LEN);
    vm.guest_registers.rip += length;
    cpu.vmwrite(guest::RIP, vm.guest_registers.rip);
}
