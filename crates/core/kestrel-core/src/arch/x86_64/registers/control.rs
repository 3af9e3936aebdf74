//! Wrappers for the x86_64 control registers CR0, CR2, CR3, and CR4.

use crate::addr::PhysAddr;

bitflags::bitflags! {
    /// Flags stored in CR0.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr0Flags: u64 {
        /// Enables protected mode.
        const PROTECTED_MODE_ENABLE = 1 << 0;
        /// Enables monitoring of the coprocessor, causing a `#NM` exception
        /// on `wait`/`fwait` if `TASK_SWITCHED` is set.
        const MONITOR_COPROCESSOR   = 1 << 1;
        /// Forces all x87/MMX/SSE instructions to raise `#NM`.
        const EMULATE_COPROCESSOR   = 1 << 2;
        /// Set on every task switch; cleared by `clts`.
        const TASK_SWITCHED         = 1 << 3;
        /// Enables native x87 error reporting instead of PC-style.
        const NUMERIC_ERROR         = 1 << 5;
        /// Write-protects read-only pages from ring 0.
        const WRITE_PROTECT         = 1 << 16;
        /// Enables alignment checking when combined with RFLAGS.AC and CPL 3.
        const ALIGNMENT_MASK        = 1 << 18;
        /// Globally disables write-back caching.
        const NOT_WRITE_THROUGH     = 1 << 29;
        /// Globally disables memory caching.
        const CACHE_DISABLE         = 1 << 30;
        /// Enables paging. Requires `PROTECTED_MODE_ENABLE`.
        const PAGING                = 1 << 31;
    }
}

/// CR0 — system control flags.
pub struct Cr0;

impl Cr0 {
    /// Reads the current value of CR0.
    #[inline]
    pub fn read() -> Cr0Flags {
        let raw: u64;
        // SAFETY: reading CR0 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr0", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Cr0Flags::from_bits_truncate(raw)
    }

    /// Writes `flags` to CR0.
    ///
    /// # Safety
    ///
    /// Disabling paging or write protection while kernel invariants depend
    /// on them can corrupt memory or crash the CPU.
    #[inline]
    pub unsafe fn write(flags: Cr0Flags) {
        // SAFETY: caller guarantees the new flags leave the CPU in a
        // consistent state for the currently executing code.
        unsafe {
            core::arch::asm!("mov cr0, {}", in(reg) flags.bits(), options(nostack, preserves_flags));
        }
    }
}

/// CR2 — holds the faulting linear address after a page fault.
///
/// The value is intentionally not wrapped in [`crate::addr::VirtAddr`]: a
/// faulting address pushed by the CPU is not guaranteed to be canonical.
pub struct Cr2;

impl Cr2 {
    /// Reads the current value of CR2.
    #[inline]
    pub fn read() -> u64 {
        let raw: u64;
        // SAFETY: reading CR2 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr2", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        raw
    }
}

/// CR3 — physical address of the top-level page table (PML4), plus PCID
/// bits in the low 12 when PCID is enabled.
pub struct Cr3;

impl Cr3 {
    /// Reads the current page table root address (masked to the physical
    /// frame, discarding any PCID bits).
    #[inline]
    pub fn read() -> PhysAddr {
        let raw: u64;
        // SAFETY: reading CR3 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        PhysAddr::new(raw & 0x000F_FFFF_FFFF_F000)
    }

    /// Switches to a new page table root, flushing the TLB (except global
    /// pages).
    ///
    /// # Safety
    ///
    /// `root` must be the physical address of a valid, fully-populated
    /// PML4 table that maps at least the kernel's own code and the
    /// current stack, or execution will fault immediately after the
    /// switch.
    #[inline]
    pub unsafe fn write(root: PhysAddr) {
        // SAFETY: caller guarantees `root` points at a valid PML4.
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) root.as_u64(), options(nostack, preserves_flags));
        }
    }
}

bitflags::bitflags! {
    /// Flags stored in CR4.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Cr4Flags: u64 {
        /// Enables hardware virtual-8086 mode extensions.
        const VIRTUAL_8086_EXTENSIONS = 1 << 0;
        /// Enables protected-mode virtual interrupts.
        const PROTECTED_MODE_VIRTUAL_INTERRUPTS = 1 << 1;
        /// Restricts `rdtsc`/`rdtscp` to ring 0 unless `TIME_STAMP_DISABLE` is clear.
        const TIMESTAMP_DISABLE = 1 << 2;
        /// Enables debug register extensions.
        const DEBUGGING_EXTENSIONS = 1 << 3;
        /// Enables 4 MiB pages (32-bit paging only).
        const PAGE_SIZE_EXTENSION = 1 << 4;
        /// Enables physical address extension (required for long mode).
        const PHYSICAL_ADDRESS_EXTENSION = 1 << 5;
        /// Enables the machine-check exception.
        const MACHINE_CHECK_EXCEPTION = 1 << 6;
        /// Enables global pages (`PageTableFlags::GLOBAL` survives CR3 reloads).
        const PAGE_GLOBAL = 1 << 7;
        /// Enables the `rdpmc` performance-monitoring counter instruction at any CPL.
        const PERFORMANCE_MONITOR_COUNTER = 1 << 8;
        /// Enables `fxsave`/`fxrstor` and SSE instructions.
        const OSFXSR = 1 << 9;
        /// Enables unmasked SSE floating-point exceptions.
        const OSXMMEXCPT_ENABLE = 1 << 10;
        /// Restricts `cpuid` execution to ring 0.
        const USER_MODE_INSTRUCTION_PREVENTION = 1 << 11;
        /// Enables 5-level paging.
        const L5_PAGING = 1 << 12;
        /// Enables VMX instructions.
        const VIRTUAL_MACHINE_EXTENSIONS = 1 << 13;
        /// Enables SMX instructions.
        const SAFER_MODE_EXTENSIONS = 1 << 14;
        /// Enables `rdfsbase`/`rdgsbase`/`wrfsbase`/`wrgsbase`.
        const FSGSBASE = 1 << 16;
        /// Enables PCID (process-context identifiers).
        const PCID = 1 << 17;
        /// Enables XSAVE and the extended processor state, required for AVX.
        const OSXSAVE = 1 << 18;
        /// Prevents supervisor-mode code from executing user-mode pages.
        const SUPERVISOR_MODE_EXECUTION_PROTECTION = 1 << 20;
        /// Prevents supervisor-mode code from accessing user-mode pages.
        const SUPERVISOR_MODE_ACCESS_PREVENTION = 1 << 21;
        /// Enables protection-key checks on user-mode pages.
        const PROTECTION_KEY = 1 << 22;
    }
}

/// CR4 — extended system control flags.
pub struct Cr4;

impl Cr4 {
    /// Reads the current value of CR4.
    #[inline]
    pub fn read() -> Cr4Flags {
        let raw: u64;
        // SAFETY: reading CR4 has no side effects.
        unsafe {
            core::arch::asm!("mov {}, cr4", out(reg) raw, options(nomem, nostack, preserves_flags));
        }
        Cr4Flags::from_bits_truncate(raw)
    }

    /// Writes `flags` to CR4.
    ///
    /// # Safety
    ///
    /// Toggling PAE, PCID, or paging-related bits while page tables or the
    /// TLB assume the previous mode is active can crash the CPU.
    #[inline]
    pub unsafe fn write(flags: Cr4Flags) {
        // SAFETY: caller guarantees the new flags are compatible with the
        // currently loaded page tables and executing code.
        unsafe {
            core::arch::asm!("mov cr4, {}", in(reg) flags.bits(), options(nostack, preserves_flags));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cr0_flags_bits() {
        let flags = Cr0Flags::PROTECTED_MODE_ENABLE | Cr0Flags::PAGING;
        assert_eq!(flags.bits(), (1 << 0) | (1 << 31));
    }

    #[test]
    fn cr4_flags_bits() {
        let flags = Cr4Flags::PHYSICAL_ADDRESS_EXTENSION | Cr4Flags::PAGE_GLOBAL;
        assert_eq!(flags.bits(), (1 << 5) | (1 << 7));
    }
}
