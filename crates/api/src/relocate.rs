//! Relocation of position-dependent code.
//!
//! Module images travel in a position-independent ("patched out") form and
//! are stored in a resident ("patched in") form with absolute addresses.
//! The fetcher does not know the binary format, it only hands fragment
//! windows to a [Relocator].

use crate::*;
use std::sync::Arc;

/// Converts fragment windows of a module image between its resident and
/// transmissible forms.
///
/// Both patch functions work in place on `buf`, which holds the image
/// bytes starting at `buf_offset`. Only addresses that lie entirely within
/// the window are touched.
#[cfg_attr(any(test, feature = "mockall"), mockall::automock)]
pub trait Relocator: 'static + Send + Sync + std::fmt::Debug {
    /// Number of leading image bytes that make up the module header.
    fn header_len(&self) -> usize;

    /// Number of relocatable functions declared by a module header.
    ///
    /// `header` holds at least [Relocator::header_len] bytes starting at
    /// image offset zero. Returns `None` if the header is malformed.
    fn function_count(&self, header: &[u8]) -> Option<u16>;

    /// Rewrite relative addresses to absolute ones based at `base`.
    fn patch_in(
        &self,
        base: CodeAddr,
        func_count: u16,
        buf: &mut [u8],
        buf_offset: u32,
    );

    /// Rewrite absolute addresses based at `base` back to relative ones.
    fn patch_out(
        &self,
        base: CodeAddr,
        func_count: u16,
        buf: &mut [u8],
        buf_offset: u32,
    );
}

/// Trait-object [Relocator].
pub type DynRelocator = Arc<dyn Relocator>;
