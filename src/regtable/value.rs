//! # Register Values
//!
//! The typed value universe of the register table: a closed set of eight
//! scalar shapes, their atom-level serialisation, and the validators that
//! guard register writes.

use crate::binfmt;
use crate::regtable::{Atom, Entry};

/// The type of a register entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    /// Unsigned 16 bit integer, one atom.
    U16,
    /// Unsigned 32 bit integer, two atoms.
    U32,
    /// Unsigned 64 bit integer, four atoms.
    U64,
    /// Signed 16 bit integer, one atom.
    S16,
    /// Signed 32 bit integer, two atoms.
    S32,
    /// Signed 64 bit integer, four atoms.
    S64,
    /// IEEE-754 single precision, two atoms.
    F32,
    /// IEEE-754 double precision, four atoms.
    F64,
}

impl Type {
    /// Storage size in atoms.
    #[must_use]
    pub const fn size(self) -> usize {
        match self {
            Self::U16 | Self::S16 => 1,
            Self::U32 | Self::S32 | Self::F32 => 2,
            Self::U64 | Self::S64 | Self::F64 => 4,
        }
    }
}

/// The size of the largest register value, in atoms.
pub const LARGEST_VALUE_ATOMS: usize = 4;

/// A typed register value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    /// Unsigned 16 bit integer.
    U16(u16),
    /// Unsigned 32 bit integer.
    U32(u32),
    /// Unsigned 64 bit integer.
    U64(u64),
    /// Signed 16 bit integer.
    S16(i16),
    /// Signed 32 bit integer.
    S32(i32),
    /// Signed 64 bit integer.
    S64(i64),
    /// IEEE-754 single precision.
    F32(f32),
    /// IEEE-754 double precision.
    F64(f64),
}

impl Value {
    /// The type this value inhabits.
    #[must_use]
    pub const fn type_of(&self) -> Type {
        match self {
            Self::U16(_) => Type::U16,
            Self::U32(_) => Type::U32,
            Self::U64(_) => Type::U64,
            Self::S16(_) => Type::S16,
            Self::S32(_) => Type::S32,
            Self::S64(_) => Type::S64,
            Self::F32(_) => Type::F32,
            Self::F64(_) => Type::F64,
        }
    }

    /// Storage size in atoms.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.type_of().size()
    }

    /// Compare two values for equality; values of different types never
    /// compare equal.
    #[must_use]
    pub fn same_as(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::U16(a), Self::U16(b)) => a == b,
            (Self::U32(a), Self::U32(b)) => a == b,
            (Self::U64(a), Self::U64(b)) => a == b,
            (Self::S16(a), Self::S16(b)) => a == b,
            (Self::S32(a), Self::S32(b)) => a == b,
            (Self::S64(a), Self::S64(b)) => a == b,
            (Self::F32(a), Self::F32(b)) => a == b,
            (Self::F64(a), Self::F64(b)) => a == b,
            _ => false,
        }
    }

    /// `self >= limit` within one type; false across types.
    #[must_use]
    pub fn at_least(&self, limit: &Self) -> bool {
        match (self, limit) {
            (Self::U16(a), Self::U16(b)) => a >= b,
            (Self::U32(a), Self::U32(b)) => a >= b,
            (Self::U64(a), Self::U64(b)) => a >= b,
            (Self::S16(a), Self::S16(b)) => a >= b,
            (Self::S32(a), Self::S32(b)) => a >= b,
            (Self::S64(a), Self::S64(b)) => a >= b,
            (Self::F32(a), Self::F32(b)) => a >= b,
            (Self::F64(a), Self::F64(b)) => a >= b,
            _ => false,
        }
    }

    /// `self <= limit` within one type; false across types.
    #[must_use]
    pub fn at_most(&self, limit: &Self) -> bool {
        match (self, limit) {
            (Self::U16(a), Self::U16(b)) => a <= b,
            (Self::U32(a), Self::U32(b)) => a <= b,
            (Self::U64(a), Self::U64(b)) => a <= b,
            (Self::S16(a), Self::S16(b)) => a <= b,
            (Self::S32(a), Self::S32(b)) => a <= b,
            (Self::S64(a), Self::S64(b)) => a <= b,
            (Self::F32(a), Self::F32(b)) => a <= b,
            (Self::F64(a), Self::F64(b)) => a <= b,
            _ => false,
        }
    }

    /// Serialise into atom storage. The buffer must hold at least
    /// [`Value::size`] atoms. Returns false for values that have no valid
    /// wire image, namely non-finite floating point data.
    #[must_use]
    pub fn serialize(&self, atoms: &mut [Atom], bigendian: bool) -> bool {
        let mut bytes = [0u8; 8];
        let n = self.size() * 2;
        match *self {
            Self::U16(v) if bigendian => {
                binfmt::put_u16_be(&mut bytes, v);
            }
            Self::U16(v) => {
                binfmt::put_u16_le(&mut bytes, v);
            }
            Self::U32(v) if bigendian => {
                binfmt::put_u32_be(&mut bytes, v);
            }
            Self::U32(v) => {
                binfmt::put_u32_le(&mut bytes, v);
            }
            Self::U64(v) if bigendian => {
                binfmt::put_u64_be(&mut bytes, v);
            }
            Self::U64(v) => {
                binfmt::put_u64_le(&mut bytes, v);
            }
            Self::S16(v) if bigendian => {
                binfmt::put_s16_be(&mut bytes, v);
            }
            Self::S16(v) => {
                binfmt::put_s16_le(&mut bytes, v);
            }
            Self::S32(v) if bigendian => {
                binfmt::put_s32_be(&mut bytes, v);
            }
            Self::S32(v) => {
                binfmt::put_s32_le(&mut bytes, v);
            }
            Self::S64(v) if bigendian => {
                binfmt::put_s64_be(&mut bytes, v);
            }
            Self::S64(v) => {
                binfmt::put_s64_le(&mut bytes, v);
            }
            Self::F32(v) => {
                if !v.is_finite() {
                    return false;
                }
                if bigendian {
                    binfmt::put_f32_be(&mut bytes, v);
                } else {
                    binfmt::put_f32_le(&mut bytes, v);
                }
            }
            Self::F64(v) => {
                if !v.is_finite() {
                    return false;
                }
                if bigendian {
                    binfmt::put_f64_be(&mut bytes, v);
                } else {
                    binfmt::put_f64_le(&mut bytes, v);
                }
            }
        }
        for (i, atom) in atoms.iter_mut().take(n / 2).enumerate() {
            *atom = u16::from_le_bytes([bytes[2 * i], bytes[2 * i + 1]]);
        }
        true
    }

    /// Deserialise a value of the given type from atom storage. Returns
    /// `None` for byte patterns that decode to a non-finite floating point
    /// value.
    #[must_use]
    pub fn deserialize(typ: Type, atoms: &[Atom], bigendian: bool) -> Option<Self> {
        let mut bytes = [0u8; 8];
        for (i, atom) in atoms.iter().take(typ.size()).enumerate() {
            bytes[2 * i..2 * i + 2].copy_from_slice(&atom.to_le_bytes());
        }
        let value = match (typ, bigendian) {
            (Type::U16, true) => Self::U16(binfmt::get_u16_be(&bytes)),
            (Type::U16, false) => Self::U16(binfmt::get_u16_le(&bytes)),
            (Type::U32, true) => Self::U32(binfmt::get_u32_be(&bytes)),
            (Type::U32, false) => Self::U32(binfmt::get_u32_le(&bytes)),
            (Type::U64, true) => Self::U64(binfmt::get_u64_be(&bytes)),
            (Type::U64, false) => Self::U64(binfmt::get_u64_le(&bytes)),
            (Type::S16, true) => Self::S16(binfmt::get_s16_be(&bytes)),
            (Type::S16, false) => Self::S16(binfmt::get_s16_le(&bytes)),
            (Type::S32, true) => Self::S32(binfmt::get_s32_be(&bytes)),
            (Type::S32, false) => Self::S32(binfmt::get_s32_le(&bytes)),
            (Type::S64, true) => Self::S64(binfmt::get_s64_be(&bytes)),
            (Type::S64, false) => Self::S64(binfmt::get_s64_le(&bytes)),
            (Type::F32, true) => Self::F32(binfmt::get_f32_be(&bytes)),
            (Type::F32, false) => Self::F32(binfmt::get_f32_le(&bytes)),
            (Type::F64, true) => Self::F64(binfmt::get_f64_be(&bytes)),
            (Type::F64, false) => Self::F64(binfmt::get_f64_le(&bytes)),
        };
        match value {
            Self::F32(v) if !v.is_finite() => None,
            Self::F64(v) if !v.is_finite() => None,
            _ => Some(value),
        }
    }
}

/// A validator callback; receives the entry it guards and the would-be new
/// value.
pub type ValidatorFn = fn(&Entry, &Value) -> bool;

/// The predicate applied to every would-be new value of a register entry.
#[derive(Debug, Clone, Copy, Default)]
pub enum Validator {
    /// Accept everything of the right type.
    #[default]
    Trivial,
    /// Reject every write after initialisation. The default value is still
    /// applied while the table initialises.
    Fail,
    /// Accept values greater than or equal to the limit.
    Min(Value),
    /// Accept values less than or equal to the limit.
    Max(Value),
    /// Accept values within the inclusive bounds.
    Range(Value, Value),
    /// Consult a callback function.
    Callback(ValidatorFn),
}

impl Validator {
    /// Run the predicate. `during_init` makes [`Validator::Fail`] accept
    /// the write, so defaults can be loaded.
    #[must_use]
    pub fn accepts(&self, entry: &Entry, value: &Value, during_init: bool) -> bool {
        if entry.value_type() != value.type_of() {
            return false;
        }
        match self {
            Self::Trivial => true,
            Self::Fail => during_init,
            Self::Min(limit) => value.at_least(limit),
            Self::Max(limit) => value.at_most(limit),
            Self::Range(lo, hi) => value.at_least(lo) && value.at_most(hi),
            Self::Callback(f) => f(entry, value),
        }
    }
}
