//! The hypercall interface: VMCALL from the guest with the signature in R10-R12, the request in
//! RCX and up to three operands in RDX, R8 and R9. The status goes back in RAX.
//!
//! Every configuration change applies to the core that executed the VMCALL. Callers that want a
//! change on every core issue the hypercall once per core.

use {
    crate::{
        error::HypervisorError,
        intel::{
            events::EventInjection,
            hooks::hook_manager::HookKind,
            invept::{invept_all_contexts, invept_single_context},
            shared::EptState,
            support::{read_effective_guest_cr0, read_effective_guest_cr4, Cpu},
            vm::Vm,
            vmcs::{set_pinbased_controls, set_primary_controls},
            vmexit::ExitType,
        },
    },
    log::*,
    shared::{
        HypercallRequest, HypercallStatus, ALL_EXCEPTIONS, ALL_IO_PORTS, ALL_MSRS, HYPERCALL_SIGNATURE_R10,
        HYPERCALL_SIGNATURE_R11, HYPERCALL_SIGNATURE_R12,
    },
    x86::vmx::vmcs::control::{self, PinbasedControls, PrimaryControls},
};

/// Handles a VMCALL VM exit.
///
/// A VMCALL without the signature is not meant for this hypervisor and gets the #UD it would get
/// on bare metal. After a successful `Vmxoff` request the guest continues outside VMX operation.
pub fn handle_vmcall<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, ept_state: &EptState) -> ExitType {
    let registers = &vm.guest_registers;

    if registers.r10 != HYPERCALL_SIGNATURE_R10
        || registers.r11 != HYPERCALL_SIGNATURE_R11
        || registers.r12 != HYPERCALL_SIGNATURE_R12
    {
        trace!("Core {}: VMCALL without signature at {:#x}", vm.core_id, registers.rip);
        EventInjection::vmentry_inject_ud(cpu);
        return ExitType::Continue;
    }

    let code = registers.rcx;
    let (parameter1, parameter2, parameter3) = (registers.rdx, registers.r8, registers.r9);

    let status = match HypercallRequest::try_from(code) {
        Ok(request) => {
            trace!(
                "Core {}: hypercall {:?} ({:#x}, {:#x}, {:#x})",
                vm.core_id,
                request,
                parameter1,
                parameter2,
                parameter3
            );

            match handle_request(vm, cpu, ept_state, request, parameter1, parameter2, parameter3) {
                Ok(()) => HypercallStatus::Success,
                Err(error) => {
                    warn!("Core {}: hypercall {:?} failed: {}", vm.core_id, request, error);
                    error.into()
                }
            }
        }
        Err(code) => {
            warn!("Core {}: unknown hypercall {:#x}", vm.core_id, code);
            HypervisorError::UnknownHypercall(code).into()
        }
    };

    vm.guest_registers.rax = status.to_u64();

    if vm.vmxoff_executed {
        ExitType::ExitHypervisor
    } else {
        ExitType::IncrementRIP
    }
}

#[rustfmt::skip]
fn handle_request<C: Cpu + ?Sized>(
    vm: &mut Vm,
    cpu: &mut C,
    ept_state: &EptState,
    request: HypercallRequest,
    parameter1: u64,
    parameter2: u64,
    parameter3: u64,
) -> Result<(), HypervisorError> {
    match request {
        HypercallRequest::Test => {
            debug!("Core {}: hypercall test ({:#x}, {:#x}, {:#x})", vm.core_id, parameter1, parameter2, parameter3);
        }
        HypercallRequest::Vmxoff => vm.vmxoff(cpu)?,
        HypercallRequest::ChangePageAttribute => {
            let kind = HookKind::from_operand(parameter2)?;
            let process = (parameter3 != 0).then_some(parameter3);

            ept_state.install_hook(parameter1, kind, process)?;
            invept_single_context(cpu, ept_state.eptp());
        }
        HypercallRequest::InveptAllContexts => invept_all_contexts(cpu),
        HypercallRequest::InveptSingleContext => {
            let eptp = if parameter1 == 0 { ept_state.eptp() } else { parameter1 };
            invept_single_context(cpu, eptp);
        }
        HypercallRequest::UnhookAllPages => {
            let removed = ept_state.remove_all_hooks(cpu);
            debug!("Core {}: removed {} hook(s)", vm.core_id, removed);
        }
        HypercallRequest::UnhookSinglePage => {
            ept_state.remove_hook(cpu, parameter1)?;
        }
        HypercallRequest::ChangeMsrBitmapRead => change_msr_bitmap(vm, parameter1, false)?,
        HypercallRequest::ChangeMsrBitmapWrite => change_msr_bitmap(vm, parameter1, true)?,
        HypercallRequest::ResetMsrBitmapRead => vm.msr_bitmap.reset(false),
        HypercallRequest::ResetMsrBitmapWrite => vm.msr_bitmap.reset(true),
        HypercallRequest::SetRdtscExiting => set_primary_controls(cpu, PrimaryControls::RDTSC_EXITING, true),
        HypercallRequest::UnsetRdtscExiting => set_primary_controls(cpu, PrimaryControls::RDTSC_EXITING, false),
        HypercallRequest::SetRdpmcExiting => set_primary_controls(cpu, PrimaryControls::RDPMC_EXITING, true),
        HypercallRequest::UnsetRdpmcExiting => set_primary_controls(cpu, PrimaryControls::RDPMC_EXITING, false),
        HypercallRequest::SetExceptionBitmap => {
            let bits = exception_bits(parameter1)?;
            let bitmap = cpu.vmread(control::EXCEPTION_BITMAP);
            cpu.vmwrite(control::EXCEPTION_BITMAP, bitmap | bits);
        }
        HypercallRequest::UnsetExceptionBitmap => {
            let bits = exception_bits(parameter1)?;
            let bitmap = cpu.vmread(control::EXCEPTION_BITMAP);
            cpu.vmwrite(control::EXCEPTION_BITMAP, bitmap & !bits);
        }
        HypercallRequest::ResetExceptionBitmap => cpu.vmwrite(control::EXCEPTION_BITMAP, 0),
        HypercallRequest::EnableMovDebugRegistersExiting => set_primary_controls(cpu, PrimaryControls::MOV_DR_EXITING, true),
        HypercallRequest::DisableMovDebugRegistersExiting => set_primary_controls(cpu, PrimaryControls::MOV_DR_EXITING, false),
        HypercallRequest::EnableExternalInterruptExiting => set_external_interrupt_exiting(vm, cpu, true),
        HypercallRequest::DisableExternalInterruptExiting => set_external_interrupt_exiting(vm, cpu, false),
        HypercallRequest::ChangeIoBitmap => {
            if parameter1 == ALL_IO_PORTS {
                vm.io_bitmap.mask_all();
            } else {
                let port = u16::try_from(parameter1).map_err(|_| HypervisorError::InvalidHypercallOperand(parameter1))?;
                vm.io_bitmap.mask(port);
            }
        }
        HypercallRequest::ResetIoBitmap => vm.io_bitmap.reset(),
        HypercallRequest::EnableMovToCr3Exiting => set_primary_controls(cpu, PrimaryControls::CR3_LOAD_EXITING, true),
        HypercallRequest::DisableMovToCr3Exiting => set_primary_controls(cpu, PrimaryControls::CR3_LOAD_EXITING, false),
        HypercallRequest::SetVmExitOnNmis => {
            set_pinbased_controls(cpu, PinbasedControls::NMI_EXITING | PinbasedControls::VIRTUAL_NMIS, true);
        }
        HypercallRequest::UnsetVmExitOnNmis => {
            // The NMI window needs virtual NMIs, so it goes too. A held NMI is delivered now.
            set_primary_controls(cpu, PrimaryControls::NMI_WINDOW_EXITING, false);
            set_pinbased_controls(cpu, PinbasedControls::NMI_EXITING | PinbasedControls::VIRTUAL_NMIS, false);

            if vm.queued_nmis > 0 {
                vm.queued_nmis = 0;
                EventInjection::vmentry_inject_nmi(cpu);
            }
        }
        HypercallRequest::EnableMovToControlRegistersExiting => {
            let (mask_field, shadow_field) = control_register_fields(parameter1)?;

            // The shadow has to hold what the guest sees before any bit becomes host owned.
            let effective = match parameter1 {
                0 => read_effective_guest_cr0(cpu),
                _ => read_effective_guest_cr4(cpu),
            };
            let mask = cpu.vmread(mask_field) | parameter2;

            cpu.vmwrite(shadow_field, effective);
            cpu.vmwrite(mask_field, mask);
        }
        HypercallRequest::DisableMovToControlRegistersExiting => {
            let (mask_field, _) = control_register_fields(parameter1)?;
            let mask = cpu.vmread(mask_field) & !parameter2;

            cpu.vmwrite(mask_field, mask);
        }
    }

    Ok(())
}

fn change_msr_bitmap(vm: &mut Vm, operand: u64, is_write: bool) -> Result<(), HypervisorError> {
    if operand == ALL_MSRS {
        vm.msr_bitmap.mask_all(is_write);
        return Ok(());
    }

    match u32::try_from(operand) {
        Ok(msr) if vm.msr_bitmap.mask(msr, is_write) => Ok(()),
        _ => Err(HypervisorError::InvalidHypercallOperand(operand)),
    }
}

fn exception_bits(operand: u64) -> Result<u64, HypervisorError> {
    match operand {
        ALL_EXCEPTIONS => Ok(u32::MAX as u64),
        vector if vector < 32 => Ok(1 << vector),
        _ => Err(HypervisorError::InvalidHypercallOperand(operand)),
    }
}

/// Records the requested setting. While a hook single-step is in flight the control stays on and
/// the MTF exit applies the recorded value.
fn set_external_interrupt_exiting<C: Cpu + ?Sized>(vm: &mut Vm, cpu: &mut C, enable: bool) {
    vm.external_interrupt_exiting_requested = enable;

    if vm.mtf_restore_target.is_none() {
        set_pinbased_controls(cpu, PinbasedControls::EXTERNAL_INTERRUPT_EXITING, enable);
    }
}

/// Guest/host mask and read shadow fields of CR0 or CR4.
fn control_register_fields(register: u64) -> Result<(u32, u32), HypervisorError> {
    match register {
        0 => Ok((control::CR0_GUEST_HOST_MASK, control::CR0_READ_SHADOW)),
        4 => Ok((control::CR4_GUEST_HOST_MASK, control::CR4_READ_SHADOW)),
        _ => Err(HypervisorError::InvalidHypercallOperand(register)),
    }
}
