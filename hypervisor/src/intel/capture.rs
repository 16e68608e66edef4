//! Snapshot of the processor context used as the initial guest state.
//!
//! A core is virtualized in place: the registers captured here become the guest registers, so
//! the guest resumes right after the call to [`capture_registers`] as if nothing happened.

use core::{arch::global_asm, fmt};

extern "efiapi" {
    /// Stores the general-purpose registers, RFLAGS, XMM0-15 and the caller's RSP/RIP.
    ///
    /// The captured RIP is the return address, so this function returns twice on a core that
    /// gets virtualized: once normally and once more when the guest starts running.
    pub fn capture_registers(registers: &mut GuestRegisters);
}

/// Guest register file saved on VM exit and restored on VM entry.
///
/// RIP, RSP and RFLAGS are mirrors of the VMCS guest fields. They are refreshed on every exit and
/// written back by the exit dispatcher.
#[repr(C, align(16))]
#[derive(Clone, Copy, Default)]
pub struct GuestRegisters {
    pub rax: u64,
    pub rbx: u64,
    pub rcx: u64,
    pub rdx: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rbp: u64,
    pub r8: u64,
    pub r9: u64,
    pub r10: u64,
    pub r11: u64,
    pub r12: u64,
    pub r13: u64,
    pub r14: u64,
    pub r15: u64,
    pub rip: u64,
    pub rsp: u64,
    pub rflags: u64,
    pub xmm0: M128A,
    pub xmm1: M128A,
    pub xmm2: M128A,
    pub xmm3: M128A,
    pub xmm4: M128A,
    pub xmm5: M128A,
    pub xmm6: M128A,
    pub xmm7: M128A,
    pub xmm8: M128A,
    pub xmm9: M128A,
    pub xmm10: M128A,
    pub xmm11: M128A,
    pub xmm12: M128A,
    pub xmm13: M128A,
    pub xmm14: M128A,
    pub xmm15: M128A,
}
static_assertions::const_assert_eq!(core::mem::size_of::<GuestRegisters>(), 0x190);

#[repr(C)]
#[repr(align(16))]
#[derive(Clone, Copy, Default)]
pub struct M128A {
    pub low: u64,
    pub high: i64,
}

impl GuestRegisters {
    /// Reads a general-purpose register by its instruction encoding (0 = RAX, 1 = RCX, ... 15 = R15).
    pub fn gpr(&self, index: u64) -> u64 {
        match index & 0xf {
            0 => self.rax,
            1 => self.rcx,
            2 => self.rdx,
            3 => self.rbx,
            4 => self.rsp,
            5 => self.rbp,
            6 => self.rsi,
            7 => self.rdi,
            8 => self.r8,
            9 => self.r9,
            10 => self.r10,
            11 => self.r11,
            12 => self.r12,
            13 => self.r13,
            14 => self.r14,
            _ => self.r15,
        }
    }

    /// Writes a general-purpose register by its instruction encoding.
    pub fn set_gpr(&mut self, index: u64, value: u64) {
        let register = match index & 0xf {
            0 => &mut self.rax,
            1 => &mut self.rcx,
            2 => &mut self.rdx,
            3 => &mut self.rbx,
            4 => &mut self.rsp,
            5 => &mut self.rbp,
            6 => &mut self.rsi,
            7 => &mut self.rdi,
            8 => &mut self.r8,
            9 => &mut self.r9,
            10 => &mut self.r10,
            11 => &mut self.r11,
            12 => &mut self.r12,
            13 => &mut self.r13,
            14 => &mut self.r14,
            _ => &mut self.r15,
        };
        *register = value;
    }

    /// Splits RAX/RDX style 32-bit halves the way RDMSR, RDTSC and CPUID return them.
    pub fn set_edx_eax(&mut self, value: u64) {
        self.rax = value & 0xffff_ffff;
        self.rdx = value >> 32;
    }

    /// Combines EDX:EAX into one value.
    pub fn edx_eax(&self) -> u64 {
        (self.rdx & 0xffff_ffff) << 32 | (self.rax & 0xffff_ffff)
    }
}

impl fmt::Debug for GuestRegisters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("GuestRegisters {\n")?;
        write!(
            f,
            "  rax: {:#018x}, rbx: {:#018x}, rcx: {:#018x}, rdx: {:#018x}\n",
            self.rax, self.rbx, self.rcx, self.rdx
        )?;
        write!(
            f,
            "  rsi: {:#018x}, rdi: {:#018x}, rbp: {:#018x}, r8: {:#018x}\n",
            self.rsi, self.rdi, self.rbp, self.r8
        )?;
        write!(
            f,
            "  r9: {:#018x}, r10: {:#018x}, r11: {:#018x}, r12: {:#018x}\n",
            self.r9, self.r10, self.r11, self.r12
        )?;
        write!(
            f,
            "  r13: {:#018x}, r14: {:#018x}, r15: {:#018x}, rip: {:#018x}\n",
            self.r13, self.r14, self.r15, self.rip
        )?;
        write!(f, "  rsp: {:#018x}, rflags: {:#018x}\n", self.rsp, self.rflags)?;
        f.write_str("}")
    }
}

impl fmt::Debug for M128A {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:#018x}, {:#018x})", self.low, self.high)
    }
}


global_asm!(
    r#"
// Offsets of the GuestRegisters fields.
.set registers_rax, 0x0
.set registers_rbx, 0x8
.set registers_rcx, 0x10
.set registers_rdx, 0x18
.set registers_rdi, 0x20
.set registers_rsi, 0x28
.set registers_rbp, 0x30
.set registers_r8,  0x38
.set registers_r9,  0x40
.set registers_r10, 0x48
.set registers_r11, 0x50
.set registers_r12, 0x58
.set registers_r13, 0x60
.set registers_r14, 0x68
.set registers_r15, 0x70
.set registers_rip, 0x78
.set registers_rsp, 0x80
.set registers_rflags, 0x88
.set registers_xmm0, 0x90
.set registers_xmm1, 0xA0
.set registers_xmm2, 0xB0
.set registers_xmm3, 0xC0
.set registers_xmm4, 0xD0
.set registers_xmm5, 0xE0
.set registers_xmm6, 0xF0
.set registers_xmm7, 0x100
.set registers_xmm8, 0x110
.set registers_xmm9, 0x120
.set registers_xmm10, 0x130
.set registers_xmm11, 0x140
.set registers_xmm12, 0x150
.set registers_xmm13, 0x160
.set registers_xmm14, 0x170
.set registers_xmm15, 0x180

// extern "efiapi" fn capture_registers(registers: &mut GuestRegisters)
.global capture_registers
capture_registers:
    mov     [rcx + registers_rax], rax
    mov     [rcx + registers_rbx], rbx
    mov     [rcx + registers_rcx], rcx
    mov     [rcx + registers_rdx], rdx
    mov     [rcx + registers_rsi], rsi
    mov     [rcx + registers_rdi], rdi
    mov     [rcx + registers_rbp], rbp
    mov     [rcx + registers_r8],  r8
    mov     [rcx + registers_r9],  r9
    mov     [rcx + registers_r10], r10
    mov     [rcx + registers_r11], r11
    mov     [rcx + registers_r12], r12
    mov     [rcx + registers_r13], r13
    mov     [rcx + registers_r14], r14
    mov     [rcx + registers_r15], r15

    pushfq
    pop     rax
    mov     [rcx + registers_rflags], rax

    // RSP and RIP as they will be once this function returns.
    mov     rax, rsp
    add     rax, 8
    mov     [rcx + registers_rsp], rax
    mov     rax, [rsp]
    mov     [rcx + registers_rip], rax

    movaps  [rcx + registers_xmm0], xmm0
    movaps  [rcx + registers_xmm1], xmm1
    movaps  [rcx + registers_xmm2], xmm2
    movaps  [rcx + registers_xmm3], xmm3
    movaps  [rcx + registers_xmm4], xmm4
    movaps  [rcx + registers_xmm5], xmm5
    movaps  [rcx + registers_xmm6], xmm6
    movaps  [rcx + registers_xmm7], xmm7
    movaps  [rcx + registers_xmm8], xmm8
    movaps  [rcx + registers_xmm9], xmm9
    movaps  [rcx + registers_xmm10], xmm10
    movaps  [rcx + registers_xmm11], xmm11
    movaps  [rcx + registers_xmm12], xmm12
    movaps  [rcx + registers_xmm13], xmm13
    movaps  [rcx + registers_xmm14], xmm14
    movaps  [rcx + registers_xmm15], xmm15

    ret
"#
);
