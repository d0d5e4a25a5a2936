//! ELF64 loader.
//!
//! Parses an ELF64 executable from the VFS, rejects dynamic binaries, maps
//! each `PT_LOAD` segment page-by-page into the current address space with
//! user+write permissions, copies the file bytes and zero-fills the
//! `memsz - filesz` tail. The image layout (lowest vaddr, total size) is
//! recorded, a heap page is placed above the image and the argv/envp
//! string arrays are copied into it, and a user stack is mapped below the
//! canonical boundary. Control transfer is the caller's job; the entry
//! must never return.

use alloc::{string::String, vec::Vec};

use crate::{
    error::{KernelError, KernelResult},
    process::ProcessImage,
};

const ELF_MAGIC: [u8; 4] = [0x7F, b'E', b'L', b'F'];
const ELF_CLASS_64: u8 = 2;

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;

/// ELF64 file header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64Header {
    pub magic: [u8; 4],
    pub class: u8,
    pub data: u8,
    pub version: u8,
    pub osabi: u8,
    pub abiversion: u8,
    pub pad: [u8; 7],
    pub elf_type: u16,
    pub machine: u16,
    pub version2: u32,
    pub entry: u64,
    pub phoff: u64,
    pub shoff: u64,
    pub flags: u32,
    pub ehsize: u16,
    pub phentsize: u16,
    pub phnum: u16,
    pub shentsize: u16,
    pub shnum: u16,
    pub shstrndx: u16,
}

/// ELF64 program header.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct Elf64ProgramHeader {
    pub p_type: u32,
    pub flags: u32,
    pub offset: u64,
    pub vaddr: u64,
    pub paddr: u64,
    pub filesz: u64,
    pub memsz: u64,
    pub align: u64,
}

/// Where a loaded image starts executing.
#[derive(Debug, Clone, Copy)]
pub struct LoadedImage {
    pub entry_point: u64,
    pub image: ProcessImage,
    pub user_stack_top: u64,
    pub argc: u64,
    pub argv_ptr: u64,
    pub envp_ptr: u64,
}

/// Top of the user stack region (grows down).
pub const USER_STACK_TOP: u64 = 0x0000_7FFF_FFF0_0000;
/// User stack size in pages.
pub const USER_STACK_PAGES: u64 = 16;

fn read_struct<T: Copy>(data: &[u8], offset: usize) -> KernelResult<T> {
    let size = core::mem::size_of::<T>();
    if offset + size > data.len() {
        return Err(KernelError::NotExecutable);
    }
    // SAFETY: bounds checked above; T is a plain repr(C) header type and
    // read_unaligned tolerates any alignment.
    Ok(unsafe { core::ptr::read_unaligned(data.as_ptr().add(offset) as *const T) })
}

/// Validate the header: magic, 64-bit class, and no PT_DYNAMIC segment
/// (dynamic linking is not supported).
pub fn validate(data: &[u8]) -> KernelResult<Elf64Header> {
    let header: Elf64Header = read_struct(data, 0)?;
    if header.magic != ELF_MAGIC || header.class != ELF_CLASS_64 {
        return Err(KernelError::NotExecutable);
    }

    for i in 0..header.phnum as usize {
        let phdr: Elf64ProgramHeader =
            read_struct(data, header.phoff as usize + i * header.phentsize as usize)?;
        if phdr.p_type == PT_DYNAMIC {
            return Err(KernelError::NotExecutable);
        }
    }
    Ok(header)
}

/// Compute `(base, end)` over all PT_LOAD segments.
pub fn image_bounds(data: &[u8], header: &Elf64Header) -> KernelResult<(u64, u64)> {
    let mut base = u64::MAX;
    let mut end = 0u64;
    for i in 0..header.phnum as usize {
        let phdr: Elf64ProgramHeader =
            read_struct(data, header.phoff as usize + i * header.phentsize as usize)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }
        base = base.min(phdr.vaddr);
        end = end.max(phdr.vaddr + phdr.memsz);
    }
    if base == u64::MAX {
        return Err(KernelError::NotExecutable);
    }
    Ok((base, end))
}

/// Load `path` into the current address space and build its heap, argv
/// and stack. The caller must already have torn down the previous user
/// half.
#[cfg(all(target_arch = "x86_64", target_os = "none"))]
pub fn load(path: &str, argv: &[String], envp: &[String]) -> KernelResult<LoadedImage> {
    use crate::mm::{
        self, frame_allocator, AddressSpace, PageFlags, VirtualAddress, FRAME_SIZE,
    };

    let data = crate::fs::read_file(path)?;
    let header = validate(&data)?;
    let (base, end) = image_bounds(&data, &header)?;

    let mut space = AddressSpace::current();
    let user_flags = PageFlags::WRITABLE | PageFlags::USER;

    // Map and populate each PT_LOAD segment.
    for i in 0..header.phnum as usize {
        let phdr: Elf64ProgramHeader =
            read_struct(&data, header.phoff as usize + i * header.phentsize as usize)?;
        if phdr.p_type != PT_LOAD {
            continue;
        }

        let seg_start = mm::align_down(phdr.vaddr, FRAME_SIZE as u64);
        let seg_end = mm::align_up(phdr.vaddr + phdr.memsz, FRAME_SIZE as u64);
        let mut page = seg_start;
        while page < seg_end {
            let frame = frame_allocator::alloc_frame_zeroed()?;
            match space.map_page(VirtualAddress::new(page), frame, user_flags) {
                Ok(()) => {}
                Err(KernelError::Exists) => frame_allocator::free_frame(frame),
                Err(e) => return Err(e),
            }
            page += FRAME_SIZE as u64;
        }

        let file_end = (phdr.offset + phdr.filesz) as usize;
        if file_end > data.len() {
            return Err(KernelError::NotExecutable);
        }
        // SAFETY: the target range was just mapped writable in the
        // current address space; the source is the file buffer.
        unsafe {
            core::ptr::copy_nonoverlapping(
                data.as_ptr().add(phdr.offset as usize),
                phdr.vaddr as *mut u8,
                phdr.filesz as usize,
            );
            core::ptr::write_bytes(
                (phdr.vaddr + phdr.filesz) as *mut u8,
                0,
                (phdr.memsz - phdr.filesz) as usize,
            );
        }
    }

    // Heap page above the image, then argv/envp copied into it.
    let mut heap = mm::align_up(end, FRAME_SIZE as u64);
    let heap_start = heap;
    let mut heap_mapped_end = heap_start;

    let mut ensure_mapped = |space: &mut AddressSpace, up_to: u64| -> KernelResult<()> {
        while heap_mapped_end <= up_to {
            let frame = frame_allocator::alloc_frame_zeroed()?;
            space.map_page(VirtualAddress::new(heap_mapped_end), frame, user_flags)?;
            heap_mapped_end += FRAME_SIZE as u64;
        }
        Ok(())
    };

    let argc = argv.len() as u64;
    let envc = envp.len() as u64;

    // Pointer arrays first.
    let argv_ptr = heap;
    heap += 8 * (argc + 1);
    let envp_ptr = heap;
    heap += 8 * (envc + 1);
    ensure_mapped(&mut space, heap)?;

    // Then the string bodies, pointer slots patched as we go.
    // SAFETY: every address written lies in pages ensure_mapped just
    // installed.
    unsafe {
        for (i, arg) in argv.iter().enumerate() {
            ensure_mapped(&mut space, heap + arg.len() as u64 + 1)?;
            ((argv_ptr + 8 * i as u64) as *mut u64).write(heap);
            core::ptr::copy_nonoverlapping(arg.as_ptr(), heap as *mut u8, arg.len());
            ((heap + arg.len() as u64) as *mut u8).write(0);
            heap += arg.len() as u64 + 1;
        }
        ((argv_ptr + 8 * argc) as *mut u64).write(0);

        for (i, env) in envp.iter().enumerate() {
            ensure_mapped(&mut space, heap + env.len() as u64 + 1)?;
            ((envp_ptr + 8 * i as u64) as *mut u64).write(heap);
            core::ptr::copy_nonoverlapping(env.as_ptr(), heap as *mut u8, env.len());
            ((heap + env.len() as u64) as *mut u8).write(0);
            heap += env.len() as u64 + 1;
        }
        ((envp_ptr + 8 * envc) as *mut u64).write(0);
    }

    // User stack below the canonical boundary.
    let stack_bottom = USER_STACK_TOP - USER_STACK_PAGES * FRAME_SIZE as u64;
    let mut page = stack_bottom;
    while page < USER_STACK_TOP {
        let frame = frame_allocator::alloc_frame_zeroed()?;
        space.map_page(VirtualAddress::new(page), frame, user_flags)?;
        page += FRAME_SIZE as u64;
    }

    Ok(LoadedImage {
        entry_point: header.entry,
        image: ProcessImage {
            entry: base,
            size: end - base,
            heap: heap_start,
            heap_actual: heap,
        },
        user_stack_top: USER_STACK_TOP - 16,
        argc,
        argv_ptr,
        envp_ptr,
    })
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    /// Build a minimal ELF64 image in memory.
    fn build_elf(phdrs: &[(u32, u64, u64, u64)]) -> Vec<u8> {
        let mut data = alloc::vec![0u8; 64 + phdrs.len() * 56];
        data[0..4].copy_from_slice(&ELF_MAGIC);
        data[4] = ELF_CLASS_64;
        data[5] = 1; // little endian
        data[6] = 1; // version
        // e_type = EXEC, machine = x86-64
        data[16..18].copy_from_slice(&2u16.to_le_bytes());
        data[18..20].copy_from_slice(&62u16.to_le_bytes());
        // entry
        data[24..32].copy_from_slice(&0x40_0000u64.to_le_bytes());
        // phoff = 64
        data[32..40].copy_from_slice(&64u64.to_le_bytes());
        // phentsize = 56, phnum
        data[54..56].copy_from_slice(&56u16.to_le_bytes());
        data[56..58].copy_from_slice(&(phdrs.len() as u16).to_le_bytes());

        for (i, &(p_type, vaddr, filesz, memsz)) in phdrs.iter().enumerate() {
            let off = 64 + i * 56;
            data[off..off + 4].copy_from_slice(&p_type.to_le_bytes());
            data[off + 16..off + 24].copy_from_slice(&vaddr.to_le_bytes());
            data[off + 32..off + 40].copy_from_slice(&filesz.to_le_bytes());
            data[off + 40..off + 48].copy_from_slice(&memsz.to_le_bytes());
        }
        data
    }

    #[test]
    fn validate_accepts_wellformed_elf64() {
        let data = build_elf(&[(PT_LOAD, 0x40_0000, 0x100, 0x200)]);
        let header = validate(&data).expect("valid ELF");
        assert_eq!(header.entry, 0x40_0000);
        assert_eq!(header.phnum, 1);
    }

    #[test]
    fn validate_rejects_bad_magic_and_class() {
        let mut data = build_elf(&[]);
        data[0] = 0;
        assert_eq!(validate(&data).unwrap_err(), KernelError::NotExecutable);

        let mut data = build_elf(&[]);
        data[4] = 1; // 32-bit class
        assert_eq!(validate(&data).unwrap_err(), KernelError::NotExecutable);
    }

    #[test]
    fn validate_rejects_dynamic_executables() {
        let data = build_elf(&[(PT_DYNAMIC, 0, 0, 0)]);
        assert_eq!(validate(&data).unwrap_err(), KernelError::NotExecutable);
    }

    #[test]
    fn validate_rejects_truncated_files() {
        let data = build_elf(&[]);
        assert_eq!(validate(&data[..20]).unwrap_err(), KernelError::NotExecutable);
    }

    #[test]
    fn image_bounds_span_all_load_segments() {
        let data = build_elf(&[
            (PT_LOAD, 0x40_0000, 0x100, 0x100),
            (PT_LOAD, 0x60_0000, 0x80, 0x1000),
            (6 /* PT_PHDR */, 0x10_0000, 0, 0),
        ]);
        let header = validate(&data).expect("valid");
        let (base, end) = image_bounds(&data, &header).expect("bounds");
        assert_eq!(base, 0x40_0000);
        assert_eq!(end, 0x60_0000 + 0x1000);
    }

    #[test]
    fn image_bounds_require_a_load_segment() {
        let data = build_elf(&[(6, 0, 0, 0)]);
        let header = validate(&data).expect("valid header");
        assert_eq!(
            image_bounds(&data, &header).unwrap_err(),
            KernelError::NotExecutable
        );
    }
}
