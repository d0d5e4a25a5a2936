//! Panic-time symbolication.
//!
//! Builds a function-symbol table from the ELF section headers the
//! multiboot loader hands over, and resolves source lines from the
//! embedded `.debug_line` section when the image carries one. Both feed
//! the panic and exception reports: nearest symbol plus offset, plus
//! `file:line` when DWARF data is available.

use alloc::{string::String, vec::Vec};

use spin::Once;

use crate::boot::multiboot::ElfSections;

/// One function symbol.
#[derive(Debug, Clone)]
pub struct Symbol {
    pub addr: u64,
    pub size: u64,
    pub name: String,
}

/// The kernel's own symbol table, built once during boot.
pub struct SymbolTable {
    /// Sorted by address.
    symbols: Vec<Symbol>,
    /// Raw `.debug_line` bytes, when the section exists.
    debug_line: Option<&'static [u8]>,
}

static TABLE: Once<SymbolTable> = Once::new();

const SHT_SYMTAB: u32 = 2;

const STT_FUNC: u8 = 2;

fn read_u32(data: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([data[off], data[off + 1], data[off + 2], data[off + 3]])
}

fn read_u64(data: &[u8], off: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&data[off..off + 8]);
    u64::from_le_bytes(bytes)
}

fn read_u16(data: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([data[off], data[off + 1]])
}

/// C string out of a string table.
fn str_at(strtab: &[u8], off: usize) -> &str {
    if off >= strtab.len() {
        return "";
    }
    let end = strtab[off..]
        .iter()
        .position(|&b| b == 0)
        .map(|p| off + p)
        .unwrap_or(strtab.len());
    core::str::from_utf8(&strtab[off..end]).unwrap_or("")
}

/// Parse an ELF64 symbol table against its string table, keeping function
/// symbols with a non-zero address.
pub fn parse_symtab(symtab: &[u8], strtab: &[u8]) -> Vec<Symbol> {
    const SYM_SIZE: usize = 24;
    let mut out = Vec::new();

    for chunk in symtab.chunks_exact(SYM_SIZE) {
        let name_off = read_u32(chunk, 0) as usize;
        let info = chunk[4];
        let value = read_u64(chunk, 8);
        let size = read_u64(chunk, 16);

        if info & 0xF != STT_FUNC || value == 0 {
            continue;
        }
        let name = str_at(strtab, name_off);
        if name.is_empty() {
            continue;
        }
        out.push(Symbol {
            addr: value,
            size,
            name: String::from(name),
        });
    }

    out.sort_by_key(|s| s.addr);
    out
}

/// Nearest symbol at or below `addr`, as `(name, offset)`.
pub fn find_in(symbols: &[Symbol], addr: u64) -> Option<(&Symbol, u64)> {
    let idx = match symbols.binary_search_by_key(&addr, |s| s.addr) {
        Ok(i) => i,
        Err(0) => return None,
        Err(i) => i - 1,
    };
    let sym = &symbols[idx];
    let offset = addr - sym.addr;
    // A sized symbol bounds the match; zero-size symbols match anything
    // up to the next symbol.
    if sym.size != 0 && offset >= sym.size {
        return None;
    }
    Some((sym, offset))
}

/// Build the kernel symbol table from the multiboot ELF-sections tag.
///
/// # Safety
/// The section headers and the section data they point at must be mapped
/// and immutable for the rest of the kernel's lifetime.
pub unsafe fn init_from_multiboot(sections: &ElfSections) {
    const SHDR_SIZE: usize = 64;

    // SAFETY: per the function contract.
    let headers = unsafe {
        core::slice::from_raw_parts(
            sections.headers as *const u8,
            sections.num as usize * sections.entsize as usize,
        )
    };

    let shdr = |i: usize| &headers[i * SHDR_SIZE..(i + 1) * SHDR_SIZE];
    let section_data = |i: usize| -> &'static [u8] {
        let h = shdr(i);
        let addr = read_u64(h, 16);
        let size = read_u64(h, 32);
        if addr == 0 || size == 0 {
            &[]
        } else {
            // SAFETY: loader-provided section data, per the contract.
            unsafe { core::slice::from_raw_parts(addr as *const u8, size as usize) }
        }
    };

    // Section-name string table locates .debug_line by name.
    let shstrtab = section_data(sections.shndx as usize);

    let mut symbols = Vec::new();
    let mut debug_line = None;

    for i in 0..sections.num as usize {
        let h = shdr(i);
        let typ = read_u32(h, 4);
        let name = str_at(shstrtab, read_u32(h, 0) as usize);

        if typ == SHT_SYMTAB {
            let strtab_index = read_u32(h, 40) as usize;
            symbols = parse_symtab(section_data(i), section_data(strtab_index));
        } else if name == ".debug_line" {
            let data = section_data(i);
            if !data.is_empty() {
                debug_line = Some(data);
            }
        }
    }

    log::info!(
        "symbols: {} functions, .debug_line {}",
        symbols.len(),
        if debug_line.is_some() { "present" } else { "absent" }
    );

    TABLE.call_once(|| SymbolTable {
        symbols,
        debug_line,
    });
}

/// Resolve an address against the kernel symbol table.
pub fn lookup(addr: u64) -> Option<(String, u64)> {
    let table = TABLE.get()?;
    find_in(&table.symbols, addr).map(|(sym, off)| (sym.name.clone(), off))
}

/// Resolve an address to `file:line` from `.debug_line`, if embedded.
pub fn source_line(addr: u64) -> Option<(String, u32)> {
    let table = TABLE.get()?;
    dwarf_line::line_for_address(table.debug_line?, addr)
}

/// Print one resolved frame.
fn print_frame(depth: usize, addr: u64) {
    match lookup(addr) {
        Some((name, off)) => match source_line(addr) {
            Some((file, line)) => {
                crate::println!("  #{:02} {:#018x} {}+{:#x} ({}:{})", depth, addr, name, off, file, line)
            }
            None => crate::println!("  #{:02} {:#018x} {}+{:#x}", depth, addr, name, off),
        },
        None => crate::println!("  #{:02} {:#018x} ???", depth, addr),
    }
}

/// Print a symbolic backtrace starting at `rip`, then walking the frame
/// pointer chain.
pub fn print_backtrace(rip: u64) {
    crate::println!("backtrace:");
    print_frame(0, rip);

    #[cfg(all(target_arch = "x86_64", target_os = "none"))]
    {
        let mut rbp: u64;
        // SAFETY: reads the frame pointer register.
        unsafe { core::arch::asm!("mov {}, rbp", out(reg) rbp) };

        for depth in 1..16 {
            if rbp == 0 || rbp % 8 != 0 {
                break;
            }
            // SAFETY: a well-formed frame keeps [rbp] = caller rbp and
            // [rbp+8] = return address; the walk stops at the first
            // implausible value.
            let (next_rbp, ret) = unsafe { ((rbp as *const u64).read(), ((rbp + 8) as *const u64).read()) };
            if ret < 0xFFFF_8000_0000_0000 {
                break;
            }
            print_frame(depth, ret);
            if next_rbp <= rbp {
                break;
            }
            rbp = next_rbp;
        }
    }
}

// ---------------------------------------------------------------------------
// DWARF .debug_line decoding
// ---------------------------------------------------------------------------

/// Minimal DWARF v2-v4 line-number program interpreter: enough to map a
/// code address to `(file, line)`.
pub mod dwarf_line {
    use alloc::{string::String, vec::Vec};

    struct Reader<'a> {
        data: &'a [u8],
        pos: usize,
    }

    impl<'a> Reader<'a> {
        fn new(data: &'a [u8]) -> Self {
            Self { data, pos: 0 }
        }

        fn remaining(&self) -> usize {
            self.data.len().saturating_sub(self.pos)
        }

        fn u8(&mut self) -> Option<u8> {
            let b = *self.data.get(self.pos)?;
            self.pos += 1;
            Some(b)
        }

        fn u16(&mut self) -> Option<u16> {
            Some(u16::from_le_bytes([self.u8()?, self.u8()?]))
        }

        fn u32(&mut self) -> Option<u32> {
            Some(u32::from_le_bytes([
                self.u8()?,
                self.u8()?,
                self.u8()?,
                self.u8()?,
            ]))
        }

        fn u64(&mut self) -> Option<u64> {
            let mut bytes = [0u8; 8];
            for b in &mut bytes {
                *b = self.u8()?;
            }
            Some(u64::from_le_bytes(bytes))
        }

        fn uleb(&mut self) -> Option<u64> {
            let mut result = 0u64;
            let mut shift = 0;
            loop {
                let byte = self.u8()?;
                result |= ((byte & 0x7F) as u64) << shift;
                if byte & 0x80 == 0 {
                    return Some(result);
                }
                shift += 7;
            }
        }

        fn sleb(&mut self) -> Option<i64> {
            let mut result = 0i64;
            let mut shift = 0;
            loop {
                let byte = self.u8()?;
                result |= ((byte & 0x7F) as i64) << shift;
                shift += 7;
                if byte & 0x80 == 0 {
                    if shift < 64 && byte & 0x40 != 0 {
                        result |= -1i64 << shift;
                    }
                    return Some(result);
                }
            }
        }

        fn cstr(&mut self) -> Option<&'a str> {
            let start = self.pos;
            while *self.data.get(self.pos)? != 0 {
                self.pos += 1;
            }
            let s = core::str::from_utf8(&self.data[start..self.pos]).ok()?;
            self.pos += 1; // NUL
            Some(s)
        }

        fn skip(&mut self, n: usize) {
            self.pos = (self.pos + n).min(self.data.len());
        }
    }

    /// Map `target` to `(file_name, line)`. Scans every compilation
    /// unit; only called on the panic path, so linear cost is fine.
    pub fn line_for_address(debug_line: &[u8], target: u64) -> Option<(String, u32)> {
        let mut r = Reader::new(debug_line);

        while r.remaining() > 4 {
            let unit_start = r.pos;
            let unit_length = r.u32()? as usize;
            if unit_length == 0 || unit_length == 0xFFFF_FFFF {
                // 64-bit DWARF or padding: stop.
                return None;
            }
            let unit_end = unit_start + 4 + unit_length;

            if let Some(found) = scan_unit(&mut r, unit_end, target) {
                return Some(found);
            }
            r.pos = unit_end.min(debug_line.len());
        }
        None
    }

    fn scan_unit(r: &mut Reader, unit_end: usize, target: u64) -> Option<(String, u32)> {
        let version = r.u16()?;
        if !(2..=4).contains(&version) {
            return None;
        }
        let header_length = r.u32()? as usize;
        let program_start = r.pos + header_length;

        let min_inst = r.u8()? as u64;
        if version >= 4 {
            let _max_ops = r.u8()?;
        }
        let _default_is_stmt = r.u8()?;
        let line_base = r.u8()? as i8 as i64;
        let line_range = r.u8()? as u64;
        let opcode_base = r.u8()?;

        let mut std_lengths = Vec::with_capacity(opcode_base as usize);
        for _ in 1..opcode_base {
            std_lengths.push(r.u8()?);
        }

        // Include directories (unused: we report bare file names).
        loop {
            let dir = r.cstr()?;
            if dir.is_empty() {
                break;
            }
        }

        // File name table, 1-indexed.
        let mut files: Vec<String> = Vec::new();
        loop {
            let name = r.cstr()?;
            if name.is_empty() {
                break;
            }
            let _dir = r.uleb()?;
            let _mtime = r.uleb()?;
            let _size = r.uleb()?;
            files.push(String::from(name));
        }

        r.pos = program_start;

        // Line-number state machine registers.
        let mut address = 0u64;
        let mut file = 1u64;
        let mut line = 1i64;
        // Best row at or below the target in the current sequence.
        let mut candidate: Option<(u64, u64, i64)> = None;

        let file_name = |files: &[String], index: u64| -> String {
            files
                .get(index.saturating_sub(1) as usize)
                .cloned()
                .unwrap_or_else(|| String::from("?"))
        };

        while r.pos < unit_end {
            let opcode = r.u8()?;

            if opcode >= opcode_base {
                // Special opcode: advance both address and line, emit.
                let adjusted = (opcode - opcode_base) as u64;
                address += (adjusted / line_range) * min_inst;
                line += line_base + (adjusted % line_range) as i64;
                if address <= target {
                    candidate = Some((address, file, line));
                }
                continue;
            }

            match opcode {
                0 => {
                    // Extended opcode.
                    let len = r.uleb()? as usize;
                    let sub_end = r.pos + len;
                    let sub = r.u8()?;
                    match sub {
                        1 => {
                            // end_sequence: `address` is one past the end.
                            if let Some((_, f, l)) = candidate {
                                if target < address {
                                    return Some((file_name(&files, f), l as u32));
                                }
                            }
                            address = 0;
                            file = 1;
                            line = 1;
                            candidate = None;
                        }
                        2 => {
                            address = r.u64()?;
                        }
                        _ => {}
                    }
                    r.pos = sub_end.min(unit_end);
                }
                1 => {
                    // copy: emit a row.
                    if address <= target {
                        candidate = Some((address, file, line));
                    }
                }
                2 => address += r.uleb()? * min_inst,
                3 => line += r.sleb()?,
                4 => file = r.uleb()?,
                5 => {
                    let _column = r.uleb()?;
                }
                6 | 7 => {}
                8 => {
                    // const_add_pc: advance as special opcode 255 would.
                    let adjusted = (255 - opcode_base) as u64;
                    address += (adjusted / line_range) * min_inst;
                }
                9 => address += r.u16()? as u64,
                other => {
                    // Unknown standard opcode: skip its operands.
                    let operands = std_lengths.get(other as usize - 1).copied().unwrap_or(0);
                    for _ in 0..operands {
                        let _ = r.uleb()?;
                    }
                }
            }
        }
        None
    }
}

#[cfg(all(test, not(target_os = "none")))]
mod tests {
    use super::*;

    fn sym(addr: u64, size: u64, name: &str) -> Vec<u8> {
        // Elf64_Sym with STT_FUNC.
        let mut bytes = alloc::vec![0u8; 24];
        bytes[4] = STT_FUNC;
        bytes[8..16].copy_from_slice(&addr.to_le_bytes());
        bytes[16..24].copy_from_slice(&size.to_le_bytes());
        let _ = name;
        bytes
    }

    #[test]
    fn parse_symtab_keeps_function_symbols() {
        // String table: "\0frob\0quux\0"
        let strtab = b"\0frob\0quux\0";
        let mut symtab = Vec::new();
        let mut a = sym(0x1000, 0x40, "frob");
        a[0..4].copy_from_slice(&1u32.to_le_bytes());
        symtab.extend_from_slice(&a);
        let mut b = sym(0x2000, 0, "quux");
        b[0..4].copy_from_slice(&6u32.to_le_bytes());
        symtab.extend_from_slice(&b);
        // A non-function symbol is skipped.
        let mut c = alloc::vec![0u8; 24];
        c[4] = 1; // STT_OBJECT
        c[8..16].copy_from_slice(&0x3000u64.to_le_bytes());
        symtab.extend_from_slice(&c);

        let symbols = parse_symtab(&symtab, strtab);
        assert_eq!(symbols.len(), 2);
        assert_eq!(symbols[0].name, "frob");
        assert_eq!(symbols[1].name, "quux");
    }

    #[test]
    fn find_in_respects_symbol_bounds() {
        let symbols = alloc::vec![
            Symbol { addr: 0x1000, size: 0x40, name: "first".into() },
            Symbol { addr: 0x2000, size: 0, name: "second".into() },
        ];
        let (s, off) = find_in(&symbols, 0x1010).expect("inside first");
        assert_eq!(s.name, "first");
        assert_eq!(off, 0x10);
        // Past first's size, before second: no match.
        assert!(find_in(&symbols, 0x1800).is_none());
        // Zero-size symbols match onward.
        let (s, off) = find_in(&symbols, 0x2345).expect("after second");
        assert_eq!(s.name, "second");
        assert_eq!(off, 0x345);
        // Before everything: no match.
        assert!(find_in(&symbols, 0x10).is_none());
    }

    /// Build a one-unit, one-sequence .debug_line program (DWARF v2):
    /// set_address 0x1000; file main.c; three rows stepping 8 bytes and
    /// one line each; end_sequence at 0x1000 + 24.
    fn build_debug_line() -> Vec<u8> {
        let mut body: Vec<u8> = Vec::new();

        // Header after unit_length: version, header_length, ...
        body.extend_from_slice(&2u16.to_le_bytes()); // version

        let mut header: Vec<u8> = Vec::new();
        header.push(1); // min_inst_length
        header.push(1); // default_is_stmt
        header.push((-5i8) as u8); // line_base
        header.push(14); // line_range
        header.push(13); // opcode_base
        header.extend_from_slice(&[0, 1, 1, 1, 1, 0, 0, 0, 1, 0, 0, 1]); // std lengths
        header.push(0); // empty include_directories
        header.extend_from_slice(b"main.c\0");
        header.push(0); // dir index
        header.push(0); // mtime
        header.push(0); // size
        header.push(0); // end of file table

        body.extend_from_slice(&(header.len() as u32).to_le_bytes());
        body.extend_from_slice(&header);

        // Program: DW_LNE_set_address 0x1000
        body.push(0);
        body.push(9);
        body.push(2);
        body.extend_from_slice(&0x1000u64.to_le_bytes());
        // Three special opcodes: advance 8 bytes, +1 line each.
        // special = (8 / 1) * 14 + (1 - (-5)) + 13 = 112 + 6 + 13 = 131.
        body.push(1); // copy: row (0x1000, line 1)
        body.push(131); // row (0x1008, line 2)
        body.push(131); // row (0x1010, line 3)
        // DW_LNS_advance_pc 8, then end_sequence at 0x1018.
        body.push(2);
        body.push(8);
        body.push(0);
        body.push(1);
        body.push(1);

        let mut unit = Vec::new();
        unit.extend_from_slice(&(body.len() as u32).to_le_bytes());
        unit.extend_from_slice(&body);
        unit
    }

    #[test]
    fn dwarf_line_lookup_finds_rows() {
        let data = build_debug_line();

        let (file, line) = dwarf_line::line_for_address(&data, 0x1000).expect("first row");
        assert_eq!(file, "main.c");
        assert_eq!(line, 1);

        // Mid-row address resolves to the row below it.
        let (_, line) = dwarf_line::line_for_address(&data, 0x100C).expect("second row");
        assert_eq!(line, 2);

        let (_, line) = dwarf_line::line_for_address(&data, 0x1010).expect("third row");
        assert_eq!(line, 3);
    }

    #[test]
    fn dwarf_line_lookup_respects_sequence_end() {
        let data = build_debug_line();
        // Past the end_sequence address: no match.
        assert!(dwarf_line::line_for_address(&data, 0x2000).is_none());
        // Below the first row: no match.
        assert!(dwarf_line::line_for_address(&data, 0x500).is_none());
    }
}
