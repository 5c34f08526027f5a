//! A [Relocator] for module images that start with a function table.
//!
//! Image layout, all addresses little-endian `u32`:
//!
//! ```text
//! 0      num_sub      u8   functions the module subscribes to
//! 1      num_prov     u8   functions the module provides
//! 2..4   reserved
//! 4..8   handler      u32  module message handler
//! 8..    table        num_sub + num_prov entries of ENTRY_LEN bytes
//!        entry + 0    fid  u8
//!        entry + 1    pid  u8
//!        entry + 2..4 reserved
//!        entry + 4..8 ptr  u32
//! ```
//!
//! In transmissible form the handler and every table pointer are offsets
//! from the image start, in resident form they are absolute.

use codefetch_api::*;
use std::sync::Arc;

/// Length of the fixed module header.
pub const HEADER_LEN: usize = 8;

/// Length of one function table entry.
pub const ENTRY_LEN: usize = 8;

const HANDLER_OFFSET: usize = 4;
const ENTRY_PTR_OFFSET: usize = 4;

/// Relocates the handler and function table of a module image.
#[derive(Debug, Default)]
pub struct FnTableRelocator;

impl FnTableRelocator {
    /// Construct a new FnTableRelocator.
    pub fn create() -> DynRelocator {
        let out: DynRelocator = Arc::new(FnTableRelocator);
        out
    }

    /// Build a module image in transmissible form. `funcs` are the table
    /// pointers, the first `num_sub` of them subscribed, the rest
    /// provided. `body` follows the table.
    pub fn build_image(
        num_sub: u8,
        handler: u32,
        funcs: &[u32],
        body: &[u8],
    ) -> Vec<u8> {
        let mut out = vec![0; HEADER_LEN + funcs.len() * ENTRY_LEN];
        out[0] = num_sub;
        out[1] = (funcs.len() as u8).saturating_sub(num_sub);
        out[HANDLER_OFFSET..HEADER_LEN].copy_from_slice(&handler.to_le_bytes());
        for (n, ptr) in funcs.iter().enumerate() {
            let entry = HEADER_LEN + n * ENTRY_LEN;
            out[entry] = n as u8;
            let at = entry + ENTRY_PTR_OFFSET;
            out[at..at + 4].copy_from_slice(&ptr.to_le_bytes());
        }
        out.extend_from_slice(body);
        out
    }

    /// Image offsets of every address slot for `func_count` functions.
    fn slots(func_count: u16) -> impl Iterator<Item = usize> {
        std::iter::once(HANDLER_OFFSET).chain((0..func_count as usize).map(
            |n| HEADER_LEN + n * ENTRY_LEN + ENTRY_PTR_OFFSET,
        ))
    }

    fn patch(
        func_count: u16,
        buf: &mut [u8],
        buf_offset: u32,
        f: impl Fn(u32) -> u32,
    ) {
        let start = buf_offset as usize;
        let end = start + buf.len();
        for slot in Self::slots(func_count) {
            if slot < start || slot + 4 > end {
                continue;
            }
            let at = slot - start;
            let mut raw = [0; 4];
            raw.copy_from_slice(&buf[at..at + 4]);
            let addr = f(u32::from_le_bytes(raw));
            buf[at..at + 4].copy_from_slice(&addr.to_le_bytes());
        }
    }
}

impl Relocator for FnTableRelocator {
    fn header_len(&self) -> usize {
        HEADER_LEN
    }

    fn function_count(&self, header: &[u8]) -> Option<u16> {
        if header.len() < HEADER_LEN {
            return None;
        }
        Some(header[0] as u16 + header[1] as u16)
    }

    fn patch_in(
        &self,
        base: CodeAddr,
        func_count: u16,
        buf: &mut [u8],
        buf_offset: u32,
    ) {
        Self::patch(func_count, buf, buf_offset, |a| a.wrapping_add(*base));
    }

    fn patch_out(
        &self,
        base: CodeAddr,
        func_count: u16,
        buf: &mut [u8],
        buf_offset: u32,
    ) {
        Self::patch(func_count, buf, buf_offset, |a| a.wrapping_sub(*base));
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn read_u32(buf: &[u8], at: usize) -> u32 {
        u32::from_le_bytes(buf[at..at + 4].try_into().unwrap())
    }

    #[test]
    fn function_count_sums_sub_and_prov() {
        let img = FnTableRelocator::build_image(2, 0x40, &[1, 2, 3], &[]);
        let r = FnTableRelocator;
        assert_eq!(Some(3), r.function_count(&img));
        assert_eq!(None, r.function_count(&img[..4]));
    }

    #[test]
    fn patch_in_whole_image() {
        let r = FnTableRelocator;
        let mut img =
            FnTableRelocator::build_image(1, 0x40, &[0x50, 0x60], &[0xaa; 4]);
        r.patch_in(CodeAddr(0x1000), 2, &mut img, 0);
        assert_eq!(0x1040, read_u32(&img, 4));
        assert_eq!(0x1050, read_u32(&img, 12));
        assert_eq!(0x1060, read_u32(&img, 20));
        // body is untouched
        assert_eq!(&[0xaa; 4][..], &img[24..]);

        r.patch_out(CodeAddr(0x1000), 2, &mut img, 0);
        assert_eq!(
            FnTableRelocator::build_image(1, 0x40, &[0x50, 0x60], &[0xaa; 4]),
            img,
        );
    }

    #[test]
    fn only_slots_inside_window_are_patched() {
        let r = FnTableRelocator;
        let funcs: Vec<u32> = (0..10).map(|n| n * 0x10).collect();
        let img = FnTableRelocator::build_image(0, 0, &funcs, &[]);

        // window [64, 88) holds entries 7 and 8 in full
        let mut win = img[64..88].to_vec();
        r.patch_in(CodeAddr(0x100), 10, &mut win, 64);
        assert_eq!(0x170, read_u32(&win, 68 - 64));
        assert_eq!(0x180, read_u32(&win, 76 - 64));

        // a window that cuts a pointer in half leaves it alone
        let mut win = img[66..70].to_vec();
        let before = win.clone();
        r.patch_in(CodeAddr(0x100), 10, &mut win, 66);
        assert_eq!(before, win);
    }
}
