//! Access to the processor: VMX instructions, VMCS fields, MSRs and registers.
//!
//! Every root-mode path goes through [`Cpu`]. [`Intel`] executes the real
//! instructions; unit tests substitute a simulated processor.

use {
    crate::{
        error::HypervisorError,
        intel::invept::{invept, invvpid, InveptType, InvvpidType},
    },
    core::arch::{asm, x86_64::CpuidResult},
    shared::{HYPERCALL_SIGNATURE_R10, HYPERCALL_SIGNATURE_R11, HYPERCALL_SIGNATURE_R12},
    x86::{
        dtables::{lgdt, lidt, DescriptorTablePointer},
        vmx::vmcs::{control, guest},
    },
};

/// Operand width of an I/O or string access.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AccessSize {
    Byte = 1,
    Word = 2,
    Dword = 4,
}

impl AccessSize {
    pub fn mask(self) -> u64 {
        match self {
            AccessSize::Byte => 0xff,
            AccessSize::Word => 0xffff,
            AccessSize::Dword => 0xffff_ffff,
        }
    }
}

/// The processor as seen from VMX root operation.
pub trait Cpu {
    fn vmxon(&mut self, vmxon_region: u64) -> Result<(), HypervisorError>;
    fn vmxoff(&mut self) -> Result<(), HypervisorError>;
    fn vmclear(&mut self, vmcs_region: u64) -> Result<(), HypervisorError>;
    fn vmptrld(&mut self, vmcs_region: u64) -> Result<(), HypervisorError>;

    /// Reads a field of the current VMCS. Unsupported fields read as zero.
    fn vmread(&self, field: u32) -> u64;
    fn vmwrite(&mut self, field: u32, value: u64);

    fn invept(&mut self, invalidation: InveptType, eptp: u64);
    fn invvpid(&mut self, invalidation: InvvpidType, vpid: u16, linear_address: u64);

    fn rdmsr(&self, msr: u32) -> u64;
    fn wrmsr(&mut self, msr: u32, value: u64);
    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult;

    fn cr0(&self) -> u64;
    fn cr0_write(&mut self, value: u64);
    fn cr3(&self) -> u64;
    fn cr3_write(&mut self, value: u64);
    fn cr4(&self) -> u64;
    fn cr4_write(&mut self, value: u64);
    fn xsetbv(&mut self, xcr: u32, value: u64);

    /// Loads GDTR and IDTR, used when handing the processor back to the guest after VMXOFF.
    fn load_descriptor_tables(&mut self, gdt_base: u64, gdt_limit: u16, idt_base: u64, idt_limit: u16);

    fn rdtsc(&self) -> u64;
    /// Returns the timestamp and `IA32_TSC_AUX`.
    fn rdtscp(&self) -> (u64, u32);
    fn rdpmc(&self, counter: u32) -> u64;
    fn wbinvd(&mut self);

    /// Reads DR0-DR3, DR6 or DR7.
    fn dr(&self, index: u8) -> u64;
    fn dr_write(&mut self, index: u8, value: u64);

    fn port_read(&mut self, port: u16, size: AccessSize) -> u32;
    fn port_write(&mut self, port: u16, size: AccessSize, value: u32);

    /// Reads guest memory through the current address space.
    fn guest_read(&self, address: u64, size: AccessSize) -> u32;
    fn guest_write(&mut self, address: u64, size: AccessSize, value: u32);
}

/// The physical processor the code is running on.
#[derive(Debug, Default, Clone, Copy)]
pub struct Intel;

impl Cpu for Intel {
    fn vmxon(&mut self, vmxon_region: u64) -> Result<(), HypervisorError> {
        unsafe { x86::bits64::vmx::vmxon(vmxon_region) }.map_err(|_| HypervisorError::VMXONFailed)
    }

    fn vmxoff(&mut self) -> Result<(), HypervisorError> {
        unsafe { x86::bits64::vmx::vmxoff() }.map_err(|_| HypervisorError::VMXOFFFailed)
    }

    fn vmclear(&mut self, vmcs_region: u64) -> Result<(), HypervisorError> {
        unsafe { x86::bits64::vmx::vmclear(vmcs_region) }.map_err(|_| HypervisorError::VMCLEARFailed)
    }

    fn vmptrld(&mut self, vmcs_region: u64) -> Result<(), HypervisorError> {
        unsafe { x86::bits64::vmx::vmptrld(vmcs_region) }.map_err(|_| HypervisorError::VMPTRLDFailed)
    }

    fn vmread(&self, field: u32) -> u64 {
        unsafe { x86::bits64::vmx::vmread(field) }.unwrap_or(0)
    }

    fn vmwrite(&mut self, field: u32, value: u64) {
        if unsafe { x86::bits64::vmx::vmwrite(field, value) }.is_err() {
            log::error!("VMWRITE failed for field {:#x}", field);
        }
    }

    fn invept(&mut self, invalidation: InveptType, eptp: u64) {
        if !invept(invalidation, eptp) {
            log::error!("INVEPT {:?} failed for {:#x}", invalidation, eptp);
        }
    }

    fn invvpid(&mut self, invalidation: InvvpidType, vpid: u16, linear_address: u64) {
        if !invvpid(invalidation, vpid, linear_address) {
            log::error!("INVVPID {:?} failed for vpid {}", invalidation, vpid);
        }
    }

    fn rdmsr(&self, msr: u32) -> u64 {
        unsafe { x86::msr::rdmsr(msr) }
    }

    fn wrmsr(&mut self, msr: u32, value: u64) {
        unsafe { x86::msr::wrmsr(msr, value) };
    }

    fn cpuid(&self, leaf: u32, sub_leaf: u32) -> CpuidResult {
        unsafe { core::arch::x86_64::__cpuid_count(leaf, sub_leaf) }
    }

    fn cr0(&self) -> u64 {
        x86_64::registers::control::Cr0::read_raw()
    }

    fn cr0_write(&mut self, value: u64) {
        unsafe { x86_64::registers::control::Cr0::write_raw(value) };
    }

    fn cr3(&self) -> u64 {
        unsafe { x86::controlregs::cr3() }
    }

    fn cr3_write(&mut self, value: u64) {
        unsafe { x86::controlregs::cr3_write(value) };
    }

    fn cr4(&self) -> u64 {
        x86_64::registers::control::Cr4::read_raw()
    }

    fn cr4_write(&mut self, value: u64) {
        unsafe { x86_64::registers::control::Cr4::write_raw(value) };
    }

    fn xsetbv(&mut self, xcr: u32, value: u64) {
        unsafe {
            asm!(
                "xsetbv",
                in("ecx") xcr,
                in("eax") value as u32,
                in("edx") (value >> 32) as u32,
                options(nostack)
            );
        }
    }

    fn load_descriptor_tables(&mut self, gdt_base: u64, gdt_limit: u16, idt_base: u64, idt_limit: u16) {
        let gdtr = DescriptorTablePointer::<u64> {
            limit: gdt_limit,
            base: gdt_base as *const u64,
        };
        let idtr = DescriptorTablePointer::<u64> {
            limit: idt_limit,
            base: idt_base as *const u64,
        };

        unsafe {
            lgdt(&gdtr);
            lidt(&idtr);
        }
    }

    fn rdtsc(&self) -> u64 {
        unsafe { core::arch::x86_64::_rdtsc() }
    }

    fn rdtscp(&self) -> (u64, u32) {
        let mut aux = 0u32;
        let tsc = unsafe { core::arch::x86_64::__rdtscp(&mut aux) };
        (tsc, aux)
    }

    fn rdpmc(&self, counter: u32) -> u64 {
        let (low, high): (u32, u32);
        unsafe {
            asm!("rdpmc", in("ecx") counter, out("eax") low, out("edx") high, options(nostack, nomem));
        }
        ((high as u64) << 32) | low as u64
    }

    fn wbinvd(&mut self) {
        unsafe { asm!("wbinvd", options(nostack, nomem)) };
    }

    fn dr(&self, index: u8) -> u64 {
        unsafe {
            match index {
                0 => x86::debugregs::dr0() as u64,
                1 => x86::debugregs::dr1() as u64,
                2 => x86::debugregs::dr2() as u64,
                3 => x86::debugregs::dr3() as u64,
                6 => x86::debugregs::dr6().bits() as u64,
                _ => x86::debugregs::dr7().0 as u64,
            }
        }
    }

    fn dr_write(&mut self, index: u8, value: u64) {
        unsafe {
            match index {
                0 => x86::debugregs::dr0_write(value as usize),
                1 => x86::debugregs::dr1_write(value as usize),
                2 => x86::debugregs::dr2_write(value as usize),
                3 => x86::debugregs::dr3_write(value as usize),
                6 => x86::debugregs::dr6_write(x86::debugregs::Dr6::from_bits_truncate(value as usize)),
                _ => x86::debugregs::dr7_write(x86::debugregs::Dr7(value as usize)),
            }
        }
    }

    fn port_read(&mut self, port: u16, size: AccessSize) -> u32 {
        unsafe {
            match size {
                AccessSize::Byte => x86::io::inb(port) as u32,
                AccessSize::Word => x86::io::inw(port) as u32,
                AccessSize::Dword => x86::io::inl(port),
            }
        }
    }

    fn port_write(&mut self, port: u16, size: AccessSize, value: u32) {
        unsafe {
            match size {
                AccessSize::Byte => x86::io::outb(port, value as u8),
                AccessSize::Word => x86::io::outw(port, value as u16),
                AccessSize::Dword => x86::io::outl(port, value),
            }
        }
    }

    fn guest_read(&self, address: u64, size: AccessSize) -> u32 {
        unsafe {
            match size {
                AccessSize::Byte => core::ptr::read_volatile(address as *const u8) as u32,
                AccessSize::Word => core::ptr::read_unaligned(address as *const u16) as u32,
                AccessSize::Dword => core::ptr::read_unaligned(address as *const u32),
            }
        }
    }

    fn guest_write(&mut self, address: u64, size: AccessSize, value: u32) {
        unsafe {
            match size {
                AccessSize::Byte => core::ptr::write_volatile(address as *mut u8, value as u8),
                AccessSize::Word => core::ptr::write_unaligned(address as *mut u16, value as u16),
                AccessSize::Dword => core::ptr::write_unaligned(address as *mut u32, value),
            }
        }
    }
}

/// Issues a signed hypercall from the guest. Returns the status left in RAX.
///
/// Platforms use this to implement [`crate::platform::Platform::vmcall`].
pub fn vmcall(request: u64, parameter1: u64, parameter2: u64, parameter3: u64) -> u64 {
    let status: u64;

    unsafe {
        asm!(
            "vmcall",
            inout("rcx") request => _,
            inout("rdx") parameter1 => _,
            inout("r8") parameter2 => _,
            inout("r9") parameter3 => _,
            in("r10") HYPERCALL_SIGNATURE_R10,
            in("r11") HYPERCALL_SIGNATURE_R11,
            in("r12") HYPERCALL_SIGNATURE_R12,
            lateout("rax") status,
        );
    }

    status
}

/// Reads the effective guest CR0 using CR0 and the CR0 read shadow.
pub fn read_effective_guest_cr0<C: Cpu + ?Sized>(cpu: &C) -> u64 {
    let mask = cpu.vmread(control::CR0_GUEST_HOST_MASK);
    cpu.vmread(control::CR0_READ_SHADOW) & mask | cpu.vmread(guest::CR0) & !mask
}

/// Reads the effective guest CR4 using CR4 and the CR4 read shadow.
pub fn read_effective_guest_cr4<C: Cpu + ?Sized>(cpu: &C) -> u64 {
    let mask = cpu.vmread(control::CR4_GUEST_HOST_MASK);
    cpu.vmread(control::CR4_READ_SHADOW) & mask | cpu.vmread(guest::CR4) & !mask
}
