use {
    crate::{error::HypervisorError, intel::support::Cpu},
    bit_field::BitField,
    x86::{current::paging::BASE_PAGE_SIZE, msr},
};

/// CR4.VMXE
pub const CR4_VMX_ENABLE_BIT: usize = 13;

/// A representation of the VMXON region in memory.
///
/// Reference: Intel® 64 and IA-32 Architectures Software Developer's Manual: 25.11.5 VMXON Region
#[repr(C, align(4096))]
pub struct Vmxon {
    pub revision_id: u32,
    pub data: [u8; BASE_PAGE_SIZE - 4],
}
static_assertions::const_assert_eq!(core::mem::size_of::<Vmxon>(), BASE_PAGE_SIZE);

/// The VMCS revision identifier, `IA32_VMX_BASIC[30:0]`. Bit 31 of the region header stays clear.
pub fn revision_identifier<C: Cpu + ?Sized>(cpu: &C) -> u32 {
    cpu.rdmsr(msr::IA32_VMX_BASIC).get_bits(0..31) as u32
}

/// Prepares the current core for VMXON.
///
/// Sets CR4.VMXE, locks `IA32_FEATURE_CONTROL` if firmware left it unlocked and applies the
/// CR0/CR4 fixed bits.
pub fn prepare_vmx_operation<C: Cpu + ?Sized>(cpu: &mut C) -> Result<(), HypervisorError> {
    log::trace!("Enabling Virtual Machine Extensions (VMX)");
    enable_vmx_operation(cpu);

    log::trace!("Adjusting IA32_FEATURE_CONTROL MSR");
    adjust_feature_control_msr(cpu)?;

    set_cr0_bits(cpu);
    set_cr4_bits(cpu);

    Ok(())
}

pub fn enable_vmx_operation<C: Cpu + ?Sized>(cpu: &mut C) {
    let mut cr4 = cpu.cr4();
    cr4.set_bit(CR4_VMX_ENABLE_BIT, true);
    cpu.cr4_write(cr4);
}

pub fn disable_vmx_operation<C: Cpu + ?Sized>(cpu: &mut C) {
    let mut cr4 = cpu.cr4();
    cr4.set_bit(CR4_VMX_ENABLE_BIT, false);
    cpu.cr4_write(cr4);
}

/// Sets the lock bit in IA32_FEATURE_CONTROL if necessary.
fn adjust_feature_control_msr<C: Cpu + ?Sized>(cpu: &mut C) -> Result<(), HypervisorError> {
    const VMX_LOCK_BIT: u64 = 1 << 0;
    const VMXON_OUTSIDE_SMX: u64 = 1 << 2;

    let ia32_feature_control = cpu.rdmsr(msr::IA32_FEATURE_CONTROL);

    if (ia32_feature_control & VMX_LOCK_BIT) == 0 {
        cpu.wrmsr(
            msr::IA32_FEATURE_CONTROL,
            VMXON_OUTSIDE_SMX | VMX_LOCK_BIT | ia32_feature_control,
        );
    } else if (ia32_feature_control & VMXON_OUTSIDE_SMX) == 0 {
        return Err(HypervisorError::VMXBIOSLock);
    }

    Ok(())
}

fn set_cr0_bits<C: Cpu + ?Sized>(cpu: &mut C) {
    let fixed0 = cpu.rdmsr(msr::IA32_VMX_CR0_FIXED0);
    let fixed1 = cpu.rdmsr(msr::IA32_VMX_CR0_FIXED1);

    let cr0 = (cpu.cr0() | fixed0) & fixed1;
    cpu.cr0_write(cr0);
}

fn set_cr4_bits<C: Cpu + ?Sized>(cpu: &mut C) {
    let fixed0 = cpu.rdmsr(msr::IA32_VMX_CR4_FIXED0);
    let fixed1 = cpu.rdmsr(msr::IA32_VMX_CR4_FIXED1);

    let cr4 = (cpu.cr4() | fixed0) & fixed1;
    cpu.cr4_write(cr4);
}
