use core::fmt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/*
For a cache with 2^s sets and 2^b byte lines:
63           s+b|s+b-1       b|b-1        0|
+---------------+-------------+------------+
|      Tag      |     Set     |   Block    |
+---------------+-------------+------------+
*/

#[derive(Debug, Error, PartialEq, Eq, Clone)]
pub enum GeometryError {
    #[error("{what} must be a non-zero power of two, got {value}")]
    NotPowerOfTwo { what: &'static str, value: usize },
    #[error("{what} bit width {given} does not match the geometry ({expected})")]
    BitWidthMismatch {
        what: &'static str,
        given: u32,
        expected: u32,
    },
    #[error("block bits ({block_bits}) + set bits ({set_bits}) leave no tag bits")]
    NoTagBits { block_bits: u32, set_bits: u32 },
    #[error("associativity must be non-zero")]
    ZeroAssociativity,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressTriple {
    pub tag: u64,
    pub set: u64,
    pub block: u64,
}

impl fmt::Display for AddressTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tag {:#x}, set {}, block {}",
            self.tag, self.set, self.block
        )
    }
}

/// Bit-field codec between linear addresses and (tag, set, block) triples.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressDecoder {
    block_bits: u32,
    set_bits: u32,
}

impl AddressDecoder {
    pub fn new(block_bits: u32, set_bits: u32) -> Result<AddressDecoder, GeometryError> {
        if block_bits + set_bits >= u64::BITS {
            return Err(GeometryError::NoTagBits {
                block_bits,
                set_bits,
            });
        }
        Ok(AddressDecoder {
            block_bits,
            set_bits,
        })
    }

    pub fn block_bits(&self) -> u32 {
        self.block_bits
    }

    pub fn set_bits(&self) -> u32 {
        self.set_bits
    }

    pub fn tag_bits(&self) -> u32 {
        u64::BITS - (self.block_bits + self.set_bits)
    }

    fn set_mask(&self) -> u64 {
        (1u64 << self.set_bits) - 1
    }

    fn block_mask(&self) -> u64 {
        (1u64 << self.block_bits) - 1
    }

    fn tag_mask(&self) -> u64 {
        u64::MAX >> (self.block_bits + self.set_bits)
    }

    pub fn tag(&self, addr: u64) -> u64 {
        addr >> (self.set_bits + self.block_bits)
    }

    pub fn set_index(&self, addr: u64) -> u64 {
        (addr >> self.block_bits) & self.set_mask()
    }

    pub fn block_index(&self, addr: u64) -> u64 {
        addr & self.block_mask()
    }

    pub fn decompose(&self, addr: u64) -> AddressTriple {
        AddressTriple {
            tag: self.tag(addr),
            set: self.set_index(addr),
            block: self.block_index(addr),
        }
    }

    pub fn decompose_ptr<T>(&self, p: *const T) -> AddressTriple {
        self.decompose(p as usize as u64)
    }

    /// Inverse of `decompose`. Fields wider than their configured width are truncated.
    pub fn compose(&self, triple: AddressTriple) -> u64 {
        ((triple.tag & self.tag_mask()) << (self.set_bits + self.block_bits))
            | ((triple.set & self.set_mask()) << self.block_bits)
            | (triple.block & self.block_mask())
    }

    /// Like `compose`, but refuses fields that do not fit instead of truncating them.
    pub fn try_compose(&self, triple: AddressTriple) -> Option<u64> {
        if triple.tag > self.tag_mask()
            || triple.set > self.set_mask()
            || triple.block > self.block_mask()
        {
            None
        } else {
            Some(self.compose(triple))
        }
    }
}

/// Geometry of one set-associative cache level.
///
/// Bit widths are derived from `line_size` and `sets` unless given explicitly, in which
/// case they have to agree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheGeometry {
    pub line_size: usize,
    pub sets: usize,
    pub associativity: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub block_bits: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub set_bits: Option<u32>,
}

fn log2_exact(what: &'static str, value: usize) -> Result<u32, GeometryError> {
    if value.is_power_of_two() {
        Ok(value.trailing_zeros())
    } else {
        Err(GeometryError::NotPowerOfTwo { what, value })
    }
}

fn check_width(what: &'static str, given: Option<u32>, expected: u32) -> Result<(), GeometryError> {
    match given {
        Some(given) if given != expected => Err(GeometryError::BitWidthMismatch {
            what,
            given,
            expected,
        }),
        _ => Ok(()),
    }
}

impl CacheGeometry {
    pub const fn new(line_size: usize, sets: usize, associativity: usize) -> CacheGeometry {
        CacheGeometry {
            line_size,
            sets,
            associativity,
            block_bits: None,
            set_bits: None,
        }
    }

    /// Per-core L2 of the machines the profile was written for.
    pub const L2: CacheGeometry = CacheGeometry::new(64, 512, 8);
    pub const L1D: CacheGeometry = CacheGeometry::new(64, 64, 8);

    pub fn decoder(&self) -> Result<AddressDecoder, GeometryError> {
        if self.associativity == 0 {
            return Err(GeometryError::ZeroAssociativity);
        }
        let block_bits = log2_exact("line size", self.line_size)?;
        let set_bits = log2_exact("set count", self.sets)?;
        check_width("block", self.block_bits, block_bits)?;
        check_width("set", self.set_bits, set_bits)?;
        AddressDecoder::new(block_bits, set_bits)
    }

    pub fn validate(&self) -> Result<(), GeometryError> {
        self.decoder().map(|_| ())
    }

    /// Distance between two consecutive lines of the same congruence class.
    pub fn set_stride(&self) -> usize {
        self.line_size * self.sets
    }

    pub fn size(&self) -> usize {
        self.set_stride() * self.associativity
    }
}
