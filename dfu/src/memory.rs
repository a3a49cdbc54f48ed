//! DfuSe memory layout, parsed from alt-setting name strings such as
//! `@Internal Flash /0x08000000/04*016Kg,01*064Kg,07*128Kg`.

use nonempty::NonEmpty;
use regex::Regex;

use crate::quirks::Quirks;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DfuMemory {
    pub name: String,
    pub segments: NonEmpty<MemorySegment>,
}

/// A contiguous region of device address space with uniform page size
/// and permissions. `end_addr` is inclusive. Segments within a layout
/// are non-overlapping and strictly increasing in start address.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct MemorySegment {
    start_addr: u32,
    end_addr: u32,
    page_size: u32,
    mem_type: u8,
}

impl DfuMemory {
    pub fn find_segment(&self, address: u32) -> Option<&MemorySegment> {
        self.segments.iter().find(|s| s.contains(address))
    }
}

impl MemorySegment {
    pub fn start_addr(&self) -> u32 {
        self.start_addr
    }
    pub fn end_addr(&self) -> u32 {
        self.end_addr
    }
    pub fn page_size(&self) -> u32 {
        self.page_size
    }
    pub fn pages(&self) -> u32 {
        (self.end_addr - self.start_addr + 1) / self.page_size
    }
    pub fn contains(&self, addr: u32) -> bool {
        addr >= self.start_addr && addr <= self.end_addr
    }
    /// Start of the erase page covering `addr`.
    pub fn page_start(&self, addr: u32) -> u32 {
        addr & !(self.page_size - 1)
    }
    pub fn readable(&self) -> bool {
        self.mem_type & 1 == 1
    }
    pub fn erasable(&self) -> bool {
        self.mem_type & 2 == 2
    }
    pub fn writeable(&self) -> bool {
        self.mem_type & 4 == 4
    }
}

/// The type letters `a..g` are chosen so that their low three bits
/// encode the permissions: bit 0 readable, bit 1 erasable, bit 2
/// writeable.
pub fn parse_memory_layout(mem_layout_str: &str) -> Option<DfuMemory> {
    let r = Regex::new(r"@?([^/]*?)\s*/0x([\da-fA-F]+)U?/(.*)").unwrap();
    let captures = r.captures(mem_layout_str)?;

    let name = String::from(&captures[1]);
    let start_addr = u32::from_str_radix(&captures[2], 16).ok()?;

    let sectors = &captures[3];
    let sr = Regex::new(r"(\d+)\*(\d+)([KMB ])([a-g])(?:,|$)").unwrap();

    let mut layout = Vec::new();
    let mut current_addr = start_addr;

    for sector in sr.captures_iter(sectors) {
        let count: u32 = sector[1].parse().unwrap_or(0);
        let mut page_size: u32 = sector[2].parse().unwrap_or(0);

        match &sector[3] {
            "K" => page_size *= 1024,
            "M" => page_size *= 1024 * 1024,
            _ => {}
        }
        if count == 0 || page_size == 0 {
            return None;
        }

        let mem_type =
            (sector[4].chars().next().unwrap_or('a') as u8) & 7;
        let end_addr = current_addr + count * page_size - 1;

        layout.push(MemorySegment {
            start_addr: current_addr,
            end_addr,
            page_size,
            mem_type,
        });
        current_addr = end_addr + 1;
    }

    NonEmpty::from_vec(layout)
        .map(|segments| DfuMemory { name, segments })
}

/// Some devices advertise a layout that does not match the hardware;
/// applied when the `DFUSE_LAYOUT` quirk is set.
pub fn fixup_layout(
    vendor: u16,
    product: u16,
    quirks: Quirks,
    alt_name: &str,
    layout: &mut DfuMemory,
) {
    if !quirks.contains(Quirks::DFUSE_LAYOUT) {
        return;
    }
    /* GD32VF103 rev 1 reports 512 2K pages but has 128 1K pages */
    if vendor == 0x28e9
        && product == 0x0189
        && alt_name == "@Internal Flash  /0x08000000/512*0002Kg"
    {
        log::warn!(
            "Fixing up device memory layout to match GD32VF103 hardware"
        );
        if let Some(fixed) = parse_memory_layout(
            "@Internal Flash  /0x08000000/128*0001Kg",
        ) {
            *layout = fixed;
        }
    }
}
