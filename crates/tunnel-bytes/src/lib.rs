#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]

mod err;
mod reader;
mod writer;

pub use err::{EncodeError, Error};
pub use reader::Reader;
pub use writer::Writer;

/// Result type returned by this crate for [`Reader`]-related methods.
pub type Result<T> = std::result::Result<T, Error>;
/// Result type returned by this crate for [`Writer`]-related methods.
pub type EncodeResult<T> = std::result::Result<T, EncodeError>;

/// Trait for an object that can be encoded onto a Writer by reference.
///
/// Implement this trait in order to make an object writeable.
///
/// Most code won't need to call this directly, but will instead use
/// it implicitly via the Writer::write() method.
pub trait Writeable {
    /// Encode this object into the writer `b`.
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()>;
}

impl<W: Writeable + ?Sized> Writeable for &W {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        (*self).write_onto(b)
    }
}

/// Trait for an object that can be extracted from a Reader.
///
/// Implement this trait in order to make an object that can (maybe)
/// be decoded from a reader.
///
/// Most code won't need to call this directly, but will instead use
/// it implicitly via the Reader::extract() method.
pub trait Readable: Sized {
    /// Try to extract an object of this type from a Reader.
    ///
    /// Implementations should generally try to be efficient: this is
    /// not the right place to check signatures or perform expensive
    /// operations.  If you have an object that must not be used until
    /// it is finally validated, consider making this method return a
    /// wrapped type that can be unwrapped later on once it gets
    /// checked.
    fn take_from(b: &mut Reader<'_>) -> Result<Self>;
}

// ----------------------------------------------------------------------

/// Vec<u8> is the main type implementing Writer.
impl Writer for Vec<u8> {
    fn write_all(&mut self, bytes: &[u8]) {
        self.extend_from_slice(bytes);
    }
}

impl Readable for u8 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u8()
    }
}

impl Readable for u16 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u16()
    }
}

impl Readable for u32 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u32()
    }
}

impl Readable for u64 {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        b.take_u64()
    }
}

impl<const N: usize> Readable for [u8; N] {
    fn take_from(b: &mut Reader<'_>) -> Result<Self> {
        let mut array = [0_u8; N];
        b.take_into(&mut array[..])?;
        Ok(array)
    }
}

impl Writeable for [u8] {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(self);
        Ok(())
    }
}

impl<const N: usize> Writeable for [u8; N] {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(&self[..]);
        Ok(())
    }
}

impl Writeable for Vec<u8> {
    fn write_onto<B: Writer + ?Sized>(&self, b: &mut B) -> EncodeResult<()> {
        b.write_all(&self[..]);
        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod test {
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn primitive_roundtrip() {
        let mut v: Vec<u8> = Vec::new();
        v.write_u8(0x07);
        v.write_u16(0x1234);
        v.write_u32(0x1234_5678);
        v.write_u64(0x1234_5678_9abc_def0);
        assert_eq!(
            v,
            hex_literal::hex!("07 1234 12345678 123456789abcdef0").to_vec()
        );

        let mut r = Reader::from_slice(&v[..]);
        assert_eq!(r.take_u8().unwrap(), 0x07);
        assert_eq!(r.take_u16().unwrap(), 0x1234);
        assert_eq!(r.take_u32().unwrap(), 0x1234_5678);
        assert_eq!(r.take_u64().unwrap(), 0x1234_5678_9abc_def0);
        assert!(r.should_be_exhausted().is_ok());
    }

    #[test]
    fn array_extract() {
        let bytes = hex_literal::hex!("000102030405");
        let mut r = Reader::from_slice(&bytes[..]);
        let a: [u8; 4] = r.extract().unwrap();
        assert_eq!(a, [0, 1, 2, 3]);
        assert_eq!(r.remaining(), 2);
    }

    #[test]
    fn truncated_input() {
        let bytes = [1_u8, 2];
        let mut r = Reader::from_slice(&bytes[..]);
        assert!(matches!(r.take_u32(), Err(Error::Truncated)));
        // A failed take consumes nothing.
        assert_eq!(r.remaining(), 2);
        assert_eq!(r.take_u16().unwrap(), 0x0102);
    }
}
