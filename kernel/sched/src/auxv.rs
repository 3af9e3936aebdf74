//! Initial user-stack image: argv/envp/auxv layout for a freshly created
//! user thread, following the System V ABI's process-entry convention.
//!
//! [`build`] is pure — it only ever writes into a caller-supplied byte
//! buffer — so it is exercised directly by host tests without any mapped
//! user memory or running CPU. The kernel caller in
//! [`crate::scheduler::arch_sched_thread_create_user`] passes a slice over
//! the new thread's user stack (reached through the HHDM, before the
//! process is ever scheduled) and `top` as that stack's user-visible
//! virtual address; see [`crate::config::USER_STACK_PAGES`] for its size.

use alloc::vec::Vec;

use kestrel_core::addr::VirtAddr;

/// Marks the end of the auxiliary vector.
pub const AT_NULL: u64 = 0;
/// Address of the program headers, if mapped.
pub const AT_PHDR: u64 = 3;
/// Size of one program header table entry.
pub const AT_PHENT: u64 = 4;
/// Number of program header table entries.
pub const AT_PHNUM: u64 = 5;
/// Program entry point.
pub const AT_ENTRY: u64 = 9;
/// Whether the program should be treated as "secure" (setuid-like); always
/// 0, since processes have no such concept here.
pub const AT_SECURE: u64 = 23;

fn push_bytes(buf: &mut [u8], pos: &mut usize, top: VirtAddr, bytes: &[u8]) -> u64 {
    *pos -= bytes.len() + 1;
    buf[*pos..*pos + bytes.len()].copy_from_slice(bytes);
    buf[*pos + bytes.len()] = 0;
    to_addr(buf.len(), top, *pos)
}

fn push_u64(buf: &mut [u8], pos: &mut usize, value: u64) {
    *pos -= 8;
    buf[*pos..*pos + 8].copy_from_slice(&value.to_le_bytes());
}

fn align_down(pos: usize, align: usize) -> usize {
    pos & !(align - 1)
}

fn to_addr(buf_len: usize, top: VirtAddr, pos: usize) -> u64 {
    top.as_u64() - (buf_len - pos) as u64
}

/// Writes argc/argv/envp/auxv into the top of `buf` (the highest address of
/// `buf` is `top`) and returns the resulting stack pointer.
///
/// `buf.len()` must be at least large enough to hold every string plus the
/// pointer arrays and auxv entries; callers size the user stack generously
/// enough (see [`crate::config::USER_STACK_PAGES`]) that this always holds
/// for realistic argv/envp counts.
#[allow(clippy::too_many_arguments)]
pub fn build(
    buf: &mut [u8],
    top: VirtAddr,
    argv: &[&[u8]],
    envp: &[&[u8]],
    entry: u64,
    phdr: u64,
    phent: u64,
    phnum: u64,
) -> VirtAddr {
    let mut pos = buf.len();

    let mut argv_addrs: Vec<u64> = argv.iter().rev().map(|s| push_bytes(buf, &mut pos, top, s)).collect();
    argv_addrs.reverse();

    let mut envp_addrs: Vec<u64> = envp.iter().rev().map(|s| push_bytes(buf, &mut pos, top, s)).collect();
    envp_addrs.reverse();

    pos = align_down(pos, 16);

    let auxv_entries = [
        (AT_PHDR, phdr),
        (AT_PHENT, phent),
        (AT_PHNUM, phnum),
        (AT_ENTRY, entry),
        (AT_SECURE, 0),
        (AT_NULL, 0),
    ];
    let total_words = 2 * auxv_entries.len() + (envp.len() + 2) + (argv.len() + 2) + 1;
    if total_words % 2 != 0 {
        push_u64(buf, &mut pos, 0);
    }

    for &(key, value) in auxv_entries.iter().rev() {
        push_u64(buf, &mut pos, value);
        push_u64(buf, &mut pos, key);
    }

    push_u64(buf, &mut pos, 0);
    for &addr in envp_addrs.iter().rev() {
        push_u64(buf, &mut pos, addr);
    }

    push_u64(buf, &mut pos, 0);
    for &addr in argv_addrs.iter().rev() {
        push_u64(buf, &mut pos, addr);
    }

    push_u64(buf, &mut pos, argv.len() as u64);

    debug_assert_eq!(pos % 16, 0, "initial user stack pointer must be 16-byte aligned");
    VirtAddr::new_truncate(to_addr(buf.len(), top, pos))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_u64(buf: &[u8], addr: VirtAddr, top: VirtAddr) -> u64 {
        let offset = buf.len() - (top.as_u64() - addr.as_u64()) as usize;
        u64::from_le_bytes(buf[offset..offset + 8].try_into().unwrap())
    }

    #[test]
    fn stack_pointer_is_sixteen_byte_aligned() {
        let mut buf = [0u8; 4096];
        let top = VirtAddr::new(0x7fff_0000_1000);
        let rsp = build(&mut buf, top, &[b"init"], &[b"PATH=/bin"], 0x1000, 0, 56, 3);
        assert_eq!(rsp.as_u64() % 16, 0);
    }

    #[test]
    fn argc_matches_argv_len() {
        let mut buf = [0u8; 4096];
        let top = VirtAddr::new(0x7fff_0000_1000);
        let rsp = build(&mut buf, top, &[b"a", b"b", b"c"], &[], 0, 0, 0, 0);
        let argc = read_u64(&buf, rsp, top);
        assert_eq!(argc, 3);
    }

    #[test]
    fn argv_array_is_null_terminated() {
        let mut buf = [0u8; 4096];
        let top = VirtAddr::new(0x7fff_0000_1000);
        let rsp = build(&mut buf, top, &[b"only"], &[], 0, 0, 0, 0);
        let argv0_ptr_addr = VirtAddr::new(rsp.as_u64() + 8);
        let terminator_addr = VirtAddr::new(rsp.as_u64() + 16);
        assert_ne!(read_u64(&buf, argv0_ptr_addr, top), 0);
        assert_eq!(read_u64(&buf, terminator_addr, top), 0);
    }

    #[test]
    fn empty_argv_and_envp_still_terminate() {
        let mut buf = [0u8; 4096];
        let top = VirtAddr::new(0x7fff_0000_1000);
        let rsp = build(&mut buf, top, &[], &[], 0, 0, 0, 0);
        let argc = read_u64(&buf, rsp, top);
        assert_eq!(argc, 0);
        let argv_terminator = VirtAddr::new(rsp.as_u64() + 8);
        assert_eq!(read_u64(&buf, argv_terminator, top), 0);
    }
}
