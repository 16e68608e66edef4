//! Entering and leaving the guest.
//!
//! `launch_vm` returns to the caller on every VM exit, with the guest registers saved in the
//! structure it was given. `switch_stack` moves a core onto its host stack before the first
//! launch, and `resume_guest` returns control to the guest context without VMX, used after
//! VMXOFF or when VM entry failed.
//!
//! Credits: Satoshi's Hypervisor-101 in Rust: https://github.com/tandasat/Hypervisor-101-in-Rust/blob/main/hypervisor/src/hardware_vt/vmx_run_vm.S

use {
    crate::intel::{capture::GuestRegisters, vm::Vm},
    core::{arch::global_asm, ffi::c_void},
};

extern "efiapi" {
    /// Runs the guest until the next VM exit using VMLAUNCH when `launched` is 0 and VMRESUME
    /// otherwise.
    ///
    /// Returns RFLAGS after the operation. CF or ZF set means VM entry failed and the guest never ran.
    pub fn launch_vm(registers: &mut GuestRegisters, launched: u64) -> u64;

    /// Sets RSP to `stack_top` and jumps to `entry`, passing `vm` and `context` as the first two
    /// arguments.
    pub fn switch_stack(vm: *mut Vm, context: *const c_void, entry: usize, stack_top: u64) -> !;

    /// Loads `registers` into the processor and continues at `registers.rip` on `registers.rsp`.
    pub fn resume_guest(registers: &GuestRegisters) -> !;
}

global_asm!(
    r#"
.macro PUSHAQ
    push    rax
    push    rcx
    push    rdx
    push    rbx
    push    rbp
    push    rsi
    push    rdi
    push    r8
    push    r9
    push    r10
    push    r11
    push    r12
    push    r13
    push    r14
    push    r15
.endm

.macro POPAQ
    pop     r15
    pop     r14
    pop     r13
    pop     r12
    pop     r11
    pop     r10
    pop     r9
    pop     r8
    pop     rdi
    pop     rsi
    pop     rbp
    pop     rbx
    pop     rdx
    pop     rcx
    pop     rax
.endm

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

// extern "efiapi" fn launch_vm(registers: &mut GuestRegisters, launched: u64) -> u64
.global launch_vm
launch_vm:
    PUSHAQ
    // xmm6-xmm15 are callee-saved.
    sub     rsp, 0xA0
    movdqu  [rsp + 0x0], xmm6
    movdqu  [rsp + 0x10], xmm7
    movdqu  [rsp + 0x20], xmm8
    movdqu  [rsp + 0x30], xmm9
    movdqu  [rsp + 0x40], xmm10
    movdqu  [rsp + 0x50], xmm11
    movdqu  [rsp + 0x60], xmm12
    movdqu  [rsp + 0x70], xmm13
    movdqu  [rsp + 0x80], xmm14
    movdqu  [rsp + 0x90], xmm15

    mov     r15, rcx
    mov     r14, rdx
    // Kept on the stack for the exit path.
    push    rcx

    mov     rax, [r15 + registers_rax]
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov     r8,  [r15 + registers_r8]
    mov     r9,  [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]
    movdqa  xmm0, [r15 + registers_xmm0]
    movdqa  xmm1, [r15 + registers_xmm1]
    movdqa  xmm2, [r15 + registers_xmm2]
    movdqa  xmm3, [r15 + registers_xmm3]
    movdqa  xmm4, [r15 + registers_xmm4]
    movdqa  xmm5, [r15 + registers_xmm5]
    movdqa  xmm6, [r15 + registers_xmm6]
    movdqa  xmm7, [r15 + registers_xmm7]
    movdqa  xmm8, [r15 + registers_xmm8]
    movdqa  xmm9, [r15 + registers_xmm9]
    movdqa  xmm10, [r15 + registers_xmm10]
    movdqa  xmm11, [r15 + registers_xmm11]
    movdqa  xmm12, [r15 + registers_xmm12]
    movdqa  xmm13, [r15 + registers_xmm13]
    movdqa  xmm14, [r15 + registers_xmm14]
    movdqa  xmm15, [r15 + registers_xmm15]

    test    r14, r14
    je      .Launch

    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]
    vmresume
    jmp     .VmEntryFailure

.Launch:
    // The host resumes on this stack frame after every exit.
    mov     r14, 0x6C14 // VMCS_HOST_RSP
    vmwrite r14, rsp
    lea     r13, [rip + .VmExit]
    mov     r14, 0x6C16 // VMCS_HOST_RIP
    vmwrite r14, r13
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]
    vmlaunch

.VmEntryFailure:
    // RFLAGS still carry CF or ZF from the failed instruction.
    jmp     .Exit

.VmExit:
    xchg    r15, [rsp]
    mov     [r15 + registers_rax], rax
    mov     [r15 + registers_rbx], rbx
    mov     [r15 + registers_rcx], rcx
    mov     [r15 + registers_rdx], rdx
    mov     [r15 + registers_rsi], rsi
    mov     [r15 + registers_rdi], rdi
    mov     [r15 + registers_rbp], rbp
    mov     [r15 + registers_r8],  r8
    mov     [r15 + registers_r9],  r9
    mov     [r15 + registers_r10], r10
    mov     [r15 + registers_r11], r11
    mov     [r15 + registers_r12], r12
    mov     [r15 + registers_r13], r13
    mov     [r15 + registers_r14], r14
    movdqa  [r15 + registers_xmm0], xmm0
    movdqa  [r15 + registers_xmm1], xmm1
    movdqa  [r15 + registers_xmm2], xmm2
    movdqa  [r15 + registers_xmm3], xmm3
    movdqa  [r15 + registers_xmm4], xmm4
    movdqa  [r15 + registers_xmm5], xmm5
    movdqa  [r15 + registers_xmm6], xmm6
    movdqa  [r15 + registers_xmm7], xmm7
    movdqa  [r15 + registers_xmm8], xmm8
    movdqa  [r15 + registers_xmm9], xmm9
    movdqa  [r15 + registers_xmm10], xmm10
    movdqa  [r15 + registers_xmm11], xmm11
    movdqa  [r15 + registers_xmm12], xmm12
    movdqa  [r15 + registers_xmm13], xmm13
    movdqa  [r15 + registers_xmm14], xmm14
    movdqa  [r15 + registers_xmm15], xmm15

    mov     rax, [rsp]
    mov     [r15 + registers_r15], rax

.Exit:
    pop     rax
    movdqu  xmm6, [rsp + 0x0]
    movdqu  xmm7, [rsp + 0x10]
    movdqu  xmm8, [rsp + 0x20]
    movdqu  xmm9, [rsp + 0x30]
    movdqu  xmm10, [rsp + 0x40]
    movdqu  xmm11, [rsp + 0x50]
    movdqu  xmm12, [rsp + 0x60]
    movdqu  xmm13, [rsp + 0x70]
    movdqu  xmm14, [rsp + 0x80]
    movdqu  xmm15, [rsp + 0x90]
    // lea leaves RFLAGS intact.
    lea     rsp, [rsp + 0xA0]
    POPAQ

    pushfq
    pop     rax
    ret

// extern "efiapi" fn switch_stack(vm: *mut Vm, context: *const c_void, entry: usize, stack_top: u64) -> !
.global switch_stack
switch_stack:
    mov     rsp, r9
    jmp     r8

// extern "efiapi" fn resume_guest(registers: &GuestRegisters) -> !
.global resume_guest
resume_guest:
    mov     r15, rcx

    movdqa  xmm0, [r15 + registers_xmm0]
    movdqa  xmm1, [r15 + registers_xmm1]
    movdqa  xmm2, [r15 + registers_xmm2]
    movdqa  xmm3, [r15 + registers_xmm3]
    movdqa  xmm4, [r15 + registers_xmm4]
    movdqa  xmm5, [r15 + registers_xmm5]
    movdqa  xmm6, [r15 + registers_xmm6]
    movdqa  xmm7, [r15 + registers_xmm7]
    movdqa  xmm8, [r15 + registers_xmm8]
    movdqa  xmm9, [r15 + registers_xmm9]
    movdqa  xmm10, [r15 + registers_xmm10]
    movdqa  xmm11, [r15 + registers_xmm11]
    movdqa  xmm12, [r15 + registers_xmm12]
    movdqa  xmm13, [r15 + registers_xmm13]
    movdqa  xmm14, [r15 + registers_xmm14]
    movdqa  xmm15, [r15 + registers_xmm15]

    // Switch to the guest stack and leave RIP and RFLAGS on it for the final popfq/ret.
    mov     rsp, [r15 + registers_rsp]
    push    qword ptr [r15 + registers_rip]
    push    qword ptr [r15 + registers_rflags]

    mov     rax, [r15 + registers_rax]
    mov     rbx, [r15 + registers_rbx]
    mov     rcx, [r15 + registers_rcx]
    mov     rdx, [r15 + registers_rdx]
    mov     rdi, [r15 + registers_rdi]
    mov     rsi, [r15 + registers_rsi]
    mov     rbp, [r15 + registers_rbp]
    mov     r8,  [r15 + registers_r8]
    mov     r9,  [r15 + registers_r9]
    mov     r10, [r15 + registers_r10]
    mov     r11, [r15 + registers_r11]
    mov     r12, [r15 + registers_r12]
    mov     r13, [r15 + registers_r13]
    mov     r14, [r15 + registers_r14]
    mov     r15, [r15 + registers_r15]

    popfq
    ret
"#
);
