//! # Register Table
//!
//! A featureful register table: a linear 32-bit address space of 16-bit
//! atoms, partitioned into areas with access policies, onto which typed and
//! validated register entries are mapped.
//!
//! Tables are meant to be immutable after construction. [`RegisterTable::init`]
//! checks the table's geometry, resolves the entry-to-area links and loads
//! default values; afterwards the table serves typed single-register access
//! as well as raw block access, which is what the wire protocol uses.

pub mod value;

pub use value::{Type, Validator, ValidatorFn, Value, LARGEST_VALUE_ATOMS};

use std::fmt;

/// The smallest addressable storage unit of a register area.
pub type Atom = u16;
/// An address in the register table's linear address space.
pub type Address = u32;
/// A length or offset, counted in atoms.
pub type AtomCount = u32;
/// Opaque index of an area within its table.
pub type AreaHandle = u16;
/// Opaque index of an entry within its table.
pub type RegisterHandle = u32;

const TF_INITIALISED: u16 = 1 << 0;
const TF_DURING_INIT: u16 = 1 << 1;
const TF_BIG_ENDIAN: u16 = 1 << 2;

const AF_READABLE: u16 = 1 << 0;
const AF_WRITEABLE: u16 = 1 << 1;
const AF_SKIP_DEFAULTS: u16 = 1 << 2;

const EF_TOUCHED: u16 = 1 << 0;

/// Result type of register table access operations.
pub type Access<T = ()> = Result<T, AccessError>;

/// Errors of register access operations, paired with the address (or, where
/// an operation identifies registers by handle, the handle) at which the
/// problem occurred.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum AccessError {
    /// The table has not been successfully initialised.
    #[error("register table is not initialised ({address:#x})")]
    Uninitialised {
        /// Address or handle of the failed access.
        address: Address,
    },
    /// The access touched address space no area claims, or used a handle
    /// no entry answers to.
    #[error("nothing is mapped at {address:#x}")]
    NoEntry {
        /// First unmapped address, or the unknown handle.
        address: Address,
    },
    /// A validator rejected the would-be value.
    #[error("value out of range at {address:#x}")]
    Range {
        /// Address of the offending register.
        address: Address,
    },
    /// A value could not be serialised or deserialised, or the operation
    /// does not apply to the entry's type.
    #[error("invalid value at {address:#x}")]
    Invalid {
        /// Address or handle of the offending register.
        address: Address,
    },
    /// The access tried to write through an area that cannot be written.
    #[error("read only memory at {address:#x}")]
    ReadOnly {
        /// Address of the failed write.
        address: Address,
    },
    /// A callback signalled failure.
    #[error("callback failed at {address:#x}")]
    Failure {
        /// Address at which iteration stopped.
        address: Address,
    },
    /// An area's backing store failed.
    #[error("i/o error at {address:#x}")]
    Io {
        /// Address of the failed access.
        address: Address,
    },
}

impl AccessError {
    /// The address (or handle) the error is about.
    #[must_use]
    pub const fn address(&self) -> Address {
        match self {
            Self::Uninitialised { address }
            | Self::NoEntry { address }
            | Self::Range { address }
            | Self::Invalid { address }
            | Self::ReadOnly { address }
            | Self::Failure { address }
            | Self::Io { address } => *address,
        }
    }
}

/// Errors of [`RegisterTable::init`], carrying the offending position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum InitError {
    /// The table defines no areas at all.
    #[error("table has no areas")]
    NoAreas,
    /// More areas than [`AreaHandle`] can address.
    #[error("too many areas ({count})")]
    TooManyAreas {
        /// Number of areas in the table.
        count: usize,
    },
    /// More entries than [`RegisterHandle`] can address.
    #[error("too many entries ({count})")]
    TooManyEntries {
        /// Number of entries in the table.
        count: usize,
    },
    /// Areas are not in strictly ascending address order.
    #[error("area {area} is out of order")]
    AreaOrder {
        /// Handle of the out-of-order area.
        area: AreaHandle,
    },
    /// Two areas overlap.
    #[error("area {area} overlaps its predecessor")]
    AreaOverlap {
        /// Handle of the second of the overlapping areas.
        area: AreaHandle,
    },
    /// Entries are not in strictly ascending address order.
    #[error("entry {entry} is out of order")]
    EntryOrder {
        /// Handle of the out-of-order entry.
        entry: RegisterHandle,
    },
    /// Two entries overlap.
    #[error("entry {entry} overlaps its predecessor")]
    EntryOverlap {
        /// Handle of the second of the overlapping entries.
        entry: RegisterHandle,
    },
    /// An entry does not lie entirely within one area.
    #[error("entry {entry} maps into a memory hole")]
    EntryInMemoryHole {
        /// Handle of the unmapped entry.
        entry: RegisterHandle,
    },
    /// An entry's default value does not serialise or does not pass the
    /// entry's validator.
    #[error("entry {entry} has an invalid default value")]
    EntryInvalidDefault {
        /// Handle of the entry with the broken default.
        entry: RegisterHandle,
    },
}

/// Read callback of a custom area: fill `buf` from the area's storage,
/// starting `offset` atoms into the area.
pub type AreaRead = fn(area: &Area, buf: &mut [Atom], offset: AtomCount) -> Access;
/// Write callback of a custom area: store `buf` into the area's storage,
/// starting `offset` atoms into the area.
pub type AreaWrite = fn(area: &mut Area, buf: &[Atom], offset: AtomCount) -> Access;

/// What implements an area's storage.
pub enum Backing {
    /// Atom memory owned by the table.
    Memory(Vec<Atom>),
    /// Callback-driven storage; either callback may be absent.
    Custom {
        /// Block read callback.
        read: Option<AreaRead>,
        /// Block write callback.
        write: Option<AreaWrite>,
    },
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Memory(mem) => write!(f, "Backing::Memory({} atoms)", mem.len()),
            Self::Custom { read, write } => write!(
                f,
                "Backing::Custom(read: {}, write: {})",
                read.is_some(),
                write.is_some()
            ),
        }
    }
}

/// The entry span of an area, resolved at table initialisation.
#[derive(Debug, Clone, Copy, Default)]
struct EntrySpan {
    first: RegisterHandle,
    last: RegisterHandle,
    count: AtomCount,
}

/// A contiguous window of the register table's address space.
#[derive(Debug)]
pub struct Area {
    base: Address,
    size: AtomCount,
    flags: u16,
    backing: Backing,
    span: EntrySpan,
}

impl Area {
    /// A read/write area backed by table-owned memory.
    #[must_use]
    pub fn memory(base: Address, size: AtomCount) -> Self {
        Self {
            base,
            size,
            flags: AF_READABLE | AF_WRITEABLE,
            backing: Backing::Memory(vec![0; size as usize]),
            span: EntrySpan::default(),
        }
    }

    /// A memory-backed area the remote side may only read.
    ///
    /// The table itself can still write such an area through the typed
    /// entry API; only block writes are refused.
    #[must_use]
    pub fn memory_ro(base: Address, size: AtomCount) -> Self {
        Self {
            flags: AF_READABLE,
            ..Self::memory(base, size)
        }
    }

    /// A memory-backed area that block reads will not look into.
    #[must_use]
    pub fn memory_wo(base: Address, size: AtomCount) -> Self {
        Self {
            flags: AF_WRITEABLE,
            ..Self::memory(base, size)
        }
    }

    /// A read/write area driven by callbacks.
    #[must_use]
    pub fn custom(
        read: Option<AreaRead>,
        write: Option<AreaWrite>,
        base: Address,
        size: AtomCount,
    ) -> Self {
        Self {
            base,
            size,
            flags: AF_READABLE | AF_WRITEABLE,
            backing: Backing::Custom { read, write },
            span: EntrySpan::default(),
        }
    }

    /// A read-only callback area.
    #[must_use]
    pub fn custom_ro(read: AreaRead, base: Address, size: AtomCount) -> Self {
        Self {
            flags: AF_READABLE,
            ..Self::custom(Some(read), None, base, size)
        }
    }

    /// A write-only callback area.
    #[must_use]
    pub fn custom_wo(write: AreaWrite, base: Address, size: AtomCount) -> Self {
        Self {
            flags: AF_WRITEABLE,
            ..Self::custom(None, Some(write), base, size)
        }
    }

    /// Do not load entry defaults into this area during initialisation.
    #[must_use]
    pub fn skip_defaults(mut self) -> Self {
        self.flags |= AF_SKIP_DEFAULTS;
        self
    }

    /// First address of the area.
    #[must_use]
    pub const fn base(&self) -> Address {
        self.base
    }

    /// Size of the area in atoms.
    #[must_use]
    pub const fn size(&self) -> AtomCount {
        self.size
    }

    /// First address past the area.
    #[must_use]
    pub const fn end(&self) -> Address {
        self.base + self.size
    }

    /// Whether the area is backed by table-owned memory.
    #[must_use]
    pub const fn is_memory_backed(&self) -> bool {
        matches!(self.backing, Backing::Memory(_))
    }

    /// Direct access to memory-backed storage.
    #[must_use]
    pub fn memory_mut(&mut self) -> Option<&mut [Atom]> {
        match &mut self.backing {
            Backing::Memory(mem) => Some(mem),
            Backing::Custom { .. } => None,
        }
    }

    const fn contains(&self, address: Address) -> bool {
        address >= self.base && address < self.base + self.size
    }

    /// -1 if the area lies below the range, 1 if above, 0 on contact.
    fn range_relation(&self, address: Address, n: AtomCount) -> i32 {
        if self.end() <= address {
            -1
        } else if address + n <= self.base {
            1
        } else {
            0
        }
    }

    /// There is a way to store data in this area at all.
    fn can_write(&self) -> bool {
        match &self.backing {
            Backing::Memory(_) => true,
            Backing::Custom { write, .. } => write.is_some(),
        }
    }

    fn can_read(&self) -> bool {
        match &self.backing {
            Backing::Memory(_) => true,
            Backing::Custom { read, .. } => read.is_some(),
        }
    }

    /// The remote side may write this area (block access).
    fn is_writeable(&self) -> bool {
        self.can_write() && self.flags & AF_WRITEABLE != 0
    }

    /// The remote side may read this area (block access).
    fn is_readable(&self) -> bool {
        self.can_read() && self.flags & AF_READABLE != 0
    }

    fn read_block(&self, buf: &mut [Atom], offset: AtomCount) -> Access {
        match &self.backing {
            Backing::Memory(mem) => {
                let offset = offset as usize;
                buf.copy_from_slice(&mem[offset..offset + buf.len()]);
                Ok(())
            }
            Backing::Custom { read: Some(f), .. } => f(self, buf, offset),
            Backing::Custom { read: None, .. } => Err(AccessError::Io {
                address: self.base + offset,
            }),
        }
    }

    fn write_block(&mut self, buf: &[Atom], offset: AtomCount) -> Access {
        match &mut self.backing {
            Backing::Memory(mem) => {
                let offset = offset as usize;
                mem[offset..offset + buf.len()].copy_from_slice(buf);
                Ok(())
            }
            Backing::Custom { write: Some(f), .. } => {
                let f = *f;
                f(self, buf, offset)
            }
            Backing::Custom { write: None, .. } => Err(AccessError::ReadOnly {
                address: self.base + offset,
            }),
        }
    }
}

/// A typed, validated register mapped at an address of the table.
#[derive(Debug, Clone)]
pub struct Entry {
    address: Address,
    default: Value,
    check: Validator,
    name: Option<&'static str>,
    user: Option<u64>,
    flags: u16,
    // Resolved by RegisterTable::init().
    area: AreaHandle,
    offset: AtomCount,
}

impl Entry {
    /// A register at `address` with the given default value (which also
    /// fixes the entry's type) and a trivial validator.
    #[must_use]
    pub const fn new(address: Address, default: Value) -> Self {
        Self {
            address,
            default,
            check: Validator::Trivial,
            name: None,
            user: None,
            flags: 0,
            area: 0,
            offset: 0,
        }
    }

    /// Attach a validator.
    #[must_use]
    pub const fn validated(mut self, check: Validator) -> Self {
        self.check = check;
        self
    }

    /// Attach a name.
    #[must_use]
    pub const fn named(mut self, name: &'static str) -> Self {
        self.name = Some(name);
        self
    }

    /// Attach an opaque user cookie, handed back by
    /// [`RegisterTable::user_init`].
    #[must_use]
    pub const fn with_user(mut self, cookie: u64) -> Self {
        self.user = Some(cookie);
        self
    }

    /// The entry's address in the table's address space.
    #[must_use]
    pub const fn address(&self) -> Address {
        self.address
    }

    /// The entry's type.
    #[must_use]
    pub const fn value_type(&self) -> Type {
        self.default.type_of()
    }

    /// The entry's storage size in atoms.
    #[must_use]
    pub const fn size(&self) -> usize {
        self.default.size()
    }

    /// The declared default value.
    #[must_use]
    pub const fn default_value(&self) -> Value {
        self.default
    }

    /// The entry's name, if any.
    #[must_use]
    pub const fn name(&self) -> Option<&'static str> {
        self.name
    }

    /// The entry's user cookie, if any.
    #[must_use]
    pub const fn user(&self) -> Option<u64> {
        self.user
    }

    /// Handle of the area the entry resolved into.
    #[must_use]
    pub const fn area(&self) -> AreaHandle {
        self.area
    }

    /// Atom offset of the entry within its area.
    #[must_use]
    pub const fn offset(&self) -> AtomCount {
        self.offset
    }

    /// First address past the entry.
    #[must_use]
    pub fn end(&self) -> Address {
        self.address + self.size() as Address
    }

    /// -1 if the entry lies below the range, 1 if above, 0 on contact.
    fn range_relation(&self, address: Address, n: AtomCount) -> i32 {
        if self.end() <= address {
            -1
        } else if address + n <= self.address {
            1
        } else {
            0
        }
    }
}

/// The register table: areas plus entries plus table-wide configuration.
#[derive(Debug)]
pub struct RegisterTable {
    flags: u16,
    areas: Vec<Area>,
    entries: Vec<Entry>,
}

impl RegisterTable {
    /// Assemble a table. The table is unusable until [`Self::init`] ran
    /// successfully.
    #[must_use]
    pub fn new(areas: Vec<Area>, entries: Vec<Entry>) -> Self {
        Self {
            flags: 0,
            areas,
            entries,
        }
    }

    /// Select big-endian (true) or little-endian (false) serialisation for
    /// all entries of the table. Call before [`Self::init`].
    pub fn set_big_endian(&mut self, bigendian: bool) {
        if bigendian {
            self.flags |= TF_BIG_ENDIAN;
        } else {
            self.flags &= !TF_BIG_ENDIAN;
        }
    }

    /// Whether the table serialises big-endian.
    #[must_use]
    pub const fn is_big_endian(&self) -> bool {
        self.flags & TF_BIG_ENDIAN != 0
    }

    /// Whether [`Self::init`] ran successfully.
    #[must_use]
    pub const fn is_initialised(&self) -> bool {
        self.flags & TF_INITIALISED != 0
    }

    const fn during_init(&self) -> bool {
        self.flags & TF_DURING_INIT != 0
    }

    /// Number of areas in the table.
    #[must_use]
    pub fn area_count(&self) -> usize {
        self.areas.len()
    }

    /// Number of entries in the table.
    #[must_use]
    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    /// Validate the table structure, resolve entry-to-area links, zero
    /// memory-backed areas and load default values.
    pub fn init(&mut self) -> Result<(), InitError> {
        self.flags &= !TF_INITIALISED;
        self.flags |= TF_DURING_INIT;

        let result = self.run_init();
        if result.is_err() {
            self.flags &= !TF_INITIALISED;
        }
        self.flags &= !TF_DURING_INIT;
        result
    }

    fn run_init(&mut self) -> Result<(), InitError> {
        if self.areas.len() >= AreaHandle::MAX as usize {
            return Err(InitError::TooManyAreas {
                count: self.areas.len(),
            });
        }
        if self.entries.len() >= RegisterHandle::MAX as usize {
            return Err(InitError::TooManyEntries {
                count: self.entries.len(),
            });
        }
        if self.areas.is_empty() {
            return Err(InitError::NoAreas);
        }

        for i in 1..self.areas.len() {
            let previous = &self.areas[i - 1];
            let current = &self.areas[i];
            if current.base < previous.base {
                return Err(InitError::AreaOrder {
                    area: i as AreaHandle,
                });
            }
            if current.base < previous.end() {
                return Err(InitError::AreaOverlap {
                    area: i as AreaHandle,
                });
            }
        }

        for i in 1..self.entries.len() {
            let previous = &self.entries[i - 1];
            let current = &self.entries[i];
            if current.address < previous.address {
                return Err(InitError::EntryOrder {
                    entry: i as RegisterHandle,
                });
            }
            if current.address < previous.end() {
                return Err(InitError::EntryOverlap {
                    entry: i as RegisterHandle,
                });
            }
        }

        for area in &mut self.areas {
            if let Some(mem) = area.memory_mut() {
                mem.fill(0);
            }
        }

        // Entry access APIs require the initialised bit from here on.
        self.flags |= TF_INITIALISED;

        for handle in 0..self.entries.len() {
            let entry = &self.entries[handle];
            let Some(area) = self.find_area(entry.address) else {
                return Err(InitError::EntryInMemoryHole {
                    entry: handle as RegisterHandle,
                });
            };
            if entry.end() > self.areas[area as usize].end() {
                return Err(InitError::EntryInMemoryHole {
                    entry: handle as RegisterHandle,
                });
            }

            let base = self.areas[area as usize].base;
            let entry = &mut self.entries[handle];
            entry.area = area;
            entry.offset = entry.address - base;

            if self.need_to_load_default(handle as RegisterHandle) {
                let default = self.entries[handle].default;
                if self.set(handle as RegisterHandle, default).is_err() {
                    return Err(InitError::EntryInvalidDefault {
                        entry: handle as RegisterHandle,
                    });
                }
            }
        }

        self.link_entry_spans();
        Ok(())
    }

    fn need_to_load_default(&self, handle: RegisterHandle) -> bool {
        let area = &self.areas[self.entries[handle as usize].area as usize];
        area.can_write() && area.flags & AF_SKIP_DEFAULTS == 0
    }

    /// Resolve each area's first/last entry back-references. Areas and
    /// entries are both address sorted, so one pass suffices.
    fn link_entry_spans(&mut self) {
        let mut entry = 0usize;
        for i in 0..self.areas.len() {
            let area = &self.areas[i];
            if entry < self.entries.len() && area.contains(self.entries[entry].address) {
                let first = entry;
                entry += 1;
                while entry < self.entries.len() && area.contains(self.entries[entry].address) {
                    entry += 1;
                }
                self.areas[i].span = EntrySpan {
                    first: first as RegisterHandle,
                    last: (entry - 1) as RegisterHandle,
                    count: (entry - first) as AtomCount,
                };
            } else {
                self.areas[i].span = EntrySpan::default();
            }
        }
    }

    /// Run `f` once per entry, with the entry's user cookie, for custom
    /// setup after [`Self::init`]. A negative return aborts the iteration.
    pub fn user_init(&mut self, f: fn(&mut Self, RegisterHandle, Option<u64>) -> i32) -> Access {
        if !self.is_initialised() {
            return Err(AccessError::Uninitialised { address: 0 });
        }

        for handle in 0..self.entries.len() as RegisterHandle {
            let user = self.entries[handle as usize].user;
            if f(self, handle, user) < 0 {
                return Err(AccessError::Failure {
                    address: self.entries[handle as usize].address,
                });
            }
        }
        Ok(())
    }

    fn find_area(&self, address: Address) -> Option<AreaHandle> {
        self.areas
            .iter()
            .position(|a| a.contains(address))
            .map(|i| i as AreaHandle)
    }

    fn entry_checked(&self, handle: RegisterHandle) -> Access<&Entry> {
        if !self.is_initialised() {
            return Err(AccessError::Uninitialised { address: handle });
        }
        self.entries
            .get(handle as usize)
            .ok_or(AccessError::NoEntry { address: handle })
    }

    /// Access an entry by handle.
    #[must_use]
    pub fn entry(&self, handle: RegisterHandle) -> Option<&Entry> {
        self.entries.get(handle as usize)
    }

    /// Access an area by handle.
    #[must_use]
    pub fn area(&self, handle: AreaHandle) -> Option<&Area> {
        self.areas.get(handle as usize)
    }

    /// Mutable access to an area, e.g. to poke memory-backed storage from
    /// test benches or drivers.
    #[must_use]
    pub fn area_mut(&mut self, handle: AreaHandle) -> Option<&mut Area> {
        self.areas.get_mut(handle as usize)
    }

    fn set_with(&mut self, handle: RegisterHandle, value: Value, validate: bool) -> Access {
        let entry = self.entry_checked(handle)?;
        let address = entry.address;
        let offset = entry.offset;
        let size = entry.size();
        let area = entry.area as usize;

        if validate {
            if !entry.check.accepts(entry, &value, self.during_init()) {
                return Err(AccessError::Range { address });
            }
        } else if entry.value_type() != value.type_of() {
            return Err(AccessError::Invalid { address });
        }

        if !self.areas[area].can_write() {
            return Err(AccessError::ReadOnly { address });
        }

        let mut raw = [0 as Atom; LARGEST_VALUE_ATOMS];
        if !value.serialize(&mut raw[..size], self.is_big_endian()) {
            return Err(AccessError::Invalid { address });
        }

        self.areas[area].write_block(&raw[..size], offset)
    }

    /// Write a value to a register, running the entry's validator.
    pub fn set(&mut self, handle: RegisterHandle, value: Value) -> Access {
        self.set_with(handle, value, true)
    }

    /// Write a value to a register without consulting the validator. The
    /// type check and the serialiser still apply.
    pub fn set_unchecked(&mut self, handle: RegisterHandle, value: Value) -> Access {
        self.set_with(handle, value, false)
    }

    /// Read a register's current value.
    pub fn get(&self, handle: RegisterHandle) -> Access<Value> {
        let entry = self.entry_checked(handle)?;
        let mut raw = [0 as Atom; LARGEST_VALUE_ATOMS];
        let size = entry.size();
        self.areas[entry.area as usize].read_block(&mut raw[..size], entry.offset)?;
        Value::deserialize(entry.value_type(), &raw[..size], self.is_big_endian())
            .ok_or(AccessError::Invalid { address: handle })
    }

    /// Read a register's declared default value.
    pub fn default_value(&self, handle: RegisterHandle) -> Access<Value> {
        Ok(self.entry_checked(handle)?.default)
    }

    /// Set the bits of `mask` in an unsigned integer register,
    /// read-modify-write through the validator.
    pub fn bit_set(&mut self, handle: RegisterHandle, mask: Value) -> Access {
        let current = self.get(handle)?;
        let merged = match (current, mask) {
            (Value::U16(c), Value::U16(m)) => Value::U16(c | m),
            (Value::U32(c), Value::U32(m)) => Value::U32(c | m),
            (Value::U64(c), Value::U64(m)) => Value::U64(c | m),
            _ => return Err(AccessError::Invalid { address: handle }),
        };
        self.set(handle, merged)
    }

    /// Clear the bits of `mask` in an unsigned integer register,
    /// read-modify-write through the validator.
    pub fn bit_clear(&mut self, handle: RegisterHandle, mask: Value) -> Access {
        let current = self.get(handle)?;
        let merged = match (current, mask) {
            (Value::U16(c), Value::U16(m)) => Value::U16(c & !m),
            (Value::U32(c), Value::U32(m)) => Value::U32(c & !m),
            (Value::U64(c), Value::U64(m)) => Value::U64(c & !m),
            _ => return Err(AccessError::Invalid { address: handle }),
        };
        self.set(handle, merged)
    }

    /// Mark an entry as touched.
    pub fn touch(&mut self, handle: RegisterHandle) {
        if let Some(entry) = self.entries.get_mut(handle as usize) {
            entry.flags |= EF_TOUCHED;
        }
    }

    /// Clear an entry's touched mark.
    pub fn untouch(&mut self, handle: RegisterHandle) {
        if let Some(entry) = self.entries.get_mut(handle as usize) {
            entry.flags &= !EF_TOUCHED;
        }
    }

    /// Whether an entry was touched since the last [`Self::untouch`].
    #[must_use]
    pub fn was_touched(&self, handle: RegisterHandle) -> bool {
        self.entries
            .get(handle as usize)
            .map(|e| e.flags & EF_TOUCHED != 0)
            .unwrap_or(false)
    }

    /// Compare two registers' current values.
    ///
    /// Returns [`AccessError::Failure`] when the values differ.
    pub fn compare(&self, a: RegisterHandle, b: RegisterHandle) -> Access {
        let va = self.get(a)?;
        let vb = self.get(b)?;
        if va.same_as(&vb) {
            Ok(())
        } else {
            Err(AccessError::Failure { address: a })
        }
    }

    /// Check that `[address, address + n)` is fully covered by areas.
    /// Returns [`AccessError::NoEntry`] carrying the first unmapped
    /// address.
    pub fn block_touches_hole(&self, address: Address, n: AtomCount) -> Access {
        let mut address = address;
        let mut rest = n;
        while rest > 0 {
            let Some(handle) = self.find_area(address) else {
                return Err(AccessError::NoEntry { address });
            };
            let area = &self.areas[handle as usize];
            let used = (area.end() - address).min(rest);
            rest -= used;
            address += used;
        }
        Ok(())
    }

    /// Every area the range touches must be block-writeable.
    fn block_writeable(&self, address: Address, n: AtomCount) -> Access {
        for area in &self.areas {
            match area.range_relation(address, n) {
                -1 => continue,
                1 => break,
                _ => {
                    if !area.is_writeable() {
                        return Err(AccessError::ReadOnly { address });
                    }
                }
            }
        }
        Ok(())
    }

    /// Check that a block write would leave every touched entry holding a
    /// deserialisable value its validator accepts.
    fn block_write_wellformed(&self, address: Address, n: AtomCount, buf: &[Atom]) -> Access {
        let last = address + n - 1;
        for entry in &self.entries {
            // Skip entries before the block, stop past its end.
            if entry.end() <= address {
                continue;
            }
            if entry.address > last {
                break;
            }

            let overlap_start = address.max(entry.address);
            let overlap_end = (address + n).min(entry.end());

            // The would-be entry image: current storage with the
            // overlapping atoms of the new block patched in.
            let size = entry.size();
            let mut raw = [0 as Atom; LARGEST_VALUE_ATOMS];
            self.areas[entry.area as usize].read_block(&mut raw[..size], entry.offset)?;

            let rs = (overlap_start - entry.address) as usize;
            let bs = (overlap_start - address) as usize;
            let len = (overlap_end - overlap_start) as usize;
            raw[rs..rs + len].copy_from_slice(&buf[bs..bs + len]);

            let Some(datum) =
                Value::deserialize(entry.value_type(), &raw[..size], self.is_big_endian())
            else {
                return Err(AccessError::Invalid {
                    address: overlap_start,
                });
            };
            if !entry.check.accepts(entry, &datum, self.during_init()) {
                return Err(AccessError::Range {
                    address: overlap_start,
                });
            }
        }
        Ok(())
    }

    fn taint_range(&mut self, address: Address, n: AtomCount) {
        for handle in 0..self.entries.len() {
            match self.entries[handle].range_relation(address, n) {
                1 => return,
                -1 => continue,
                _ => self.touch(handle as RegisterHandle),
            }
        }
    }

    /// Read a block of atoms without hole checking. Callers must ensure
    /// the range is fully mapped.
    pub fn block_read_unchecked(
        &self,
        address: Address,
        n: AtomCount,
        buf: &mut [Atom],
    ) -> Access {
        let mut address = address;
        let mut done = 0usize;
        let mut rest = n;
        while rest > 0 {
            let handle = self
                .find_area(address)
                .ok_or(AccessError::NoEntry { address })?;
            let area = &self.areas[handle as usize];
            let offset = address - area.base;
            let run = (area.end() - address).min(rest) as usize;

            if area.is_readable() {
                area.read_block(&mut buf[done..done + run], offset)?;
            } else {
                // Memory that cannot be read reads back zeroes.
                buf[done..done + run].fill(0);
            }

            done += run;
            address += run as Address;
            rest -= run as AtomCount;
        }
        Ok(())
    }

    /// Write a block of atoms without hole or validator checking. Callers
    /// must run the checks themselves beforehand.
    pub fn block_write_unchecked(&mut self, address: Address, n: AtomCount, buf: &[Atom]) -> Access {
        let mut address = address;
        let mut done = 0usize;
        let mut rest = n;
        while rest > 0 {
            let handle = self
                .find_area(address)
                .ok_or(AccessError::NoEntry { address })?;
            let area = &mut self.areas[handle as usize];
            let offset = address - area.base;
            let run = (area.end() - address).min(rest) as usize;

            area.write_block(&buf[done..done + run], offset)?;

            done += run;
            address += run as Address;
            rest -= run as AtomCount;
        }
        Ok(())
    }

    /// Read `n` atoms starting at `address`. The range must be fully
    /// mapped; areas the remote side may not read yield zeroes.
    pub fn block_read(&self, address: Address, n: AtomCount, buf: &mut [Atom]) -> Access {
        if !self.is_initialised() {
            return Err(AccessError::Uninitialised { address });
        }
        if n == 0 {
            return Ok(());
        }
        self.block_touches_hole(address, n)?;
        self.block_read_unchecked(address, n, buf)
    }

    /// Write `n` atoms starting at `address`.
    ///
    /// The whole range must be block-writeable and fully mapped, and every
    /// entry it touches must accept its would-be value. All checks run
    /// before the first atom is stored, so a failed block write leaves the
    /// table unchanged. On success, every touched entry is marked.
    pub fn block_write(&mut self, address: Address, n: AtomCount, buf: &[Atom]) -> Access {
        if !self.is_initialised() {
            return Err(AccessError::Uninitialised { address });
        }
        if n == 0 {
            return Ok(());
        }
        self.block_writeable(address, n)?;
        self.block_touches_hole(address, n)?;
        self.block_write_wellformed(address, n, buf)?;
        self.block_write_unchecked(address, n, buf)?;
        self.taint_range(address, n);
        Ok(())
    }

    /// Write atoms parsed from a hex string, four nibbles per atom,
    /// starting at `address`. A trailing group of fewer than four nibbles
    /// forms the final atom's low bits.
    pub fn set_from_hexstr(&mut self, address: Address, hex: &str) -> Access {
        let nibbles = hex.as_bytes();

        for (i, quartet) in nibbles.chunks(4).enumerate() {
            let current = address + i as Address;

            let handle = self
                .find_area(current)
                .ok_or(AccessError::NoEntry { address: current })?;
            if !self.areas[handle as usize].can_write() {
                return Err(AccessError::ReadOnly { address: current });
            }

            let mut atom: Atom = 0;
            for &c in quartet {
                let digit = (c as char)
                    .to_digit(16)
                    .ok_or(AccessError::Invalid { address: current })?;
                atom = (atom << 4) | digit as Atom;
            }

            let offset = current - self.areas[handle as usize].base;
            self.areas[handle as usize].write_block(&[atom], offset)?;
        }

        Ok(())
    }

    /// Restore consistency: every entry whose stored image does not
    /// deserialise, or does not pass its validator, is reset to its
    /// default. Touched marks are cleared. The operation is idempotent.
    pub fn sanitise(&mut self) -> Access {
        if !self.is_initialised() {
            return Err(AccessError::Uninitialised { address: 0 });
        }

        for handle in 0..self.entries.len() as RegisterHandle {
            let sane = match self.get(handle) {
                Ok(value) => {
                    let entry = &self.entries[handle as usize];
                    if entry.check.accepts(entry, &value, false) {
                        Ok(())
                    } else {
                        Err(AccessError::Range { address: handle })
                    }
                }
                Err(e) => Err(e),
            };

            match sane {
                Ok(()) => {}
                Err(AccessError::Invalid { .. }) | Err(AccessError::Range { .. }) => {
                    let default = self.entries[handle as usize].default;
                    self.set(handle, default)?;
                }
                Err(e) => return Err(e),
            }

            self.untouch(handle);
        }

        Ok(())
    }

    /// Transfer `min(size(src), size(dst))` atoms from one area into
    /// another. At least one of the two must be memory-backed.
    pub fn mcopy(&mut self, dst: AreaHandle, src: AreaHandle) -> Access {
        let (dst, src) = (dst as usize, src as usize);
        if dst == src {
            return Ok(());
        }
        let n = self.areas[dst].size.min(self.areas[src].size) as usize;

        match (
            self.areas[dst].is_memory_backed(),
            self.areas[src].is_memory_backed(),
        ) {
            (true, true) => {
                let (lo, hi) = self.areas.split_at_mut(dst.max(src));
                let (a, b) = (&mut lo[dst.min(src)], &mut hi[0]);
                let (dmem, smem) = if dst < src {
                    (a.memory_mut().unwrap(), b.memory_mut().unwrap())
                } else {
                    (b.memory_mut().unwrap(), a.memory_mut().unwrap())
                };
                dmem[..n].copy_from_slice(&smem[..n]);
                Ok(())
            }
            (false, true) => {
                let mut tmp = vec![0 as Atom; n];
                match &self.areas[src].backing {
                    Backing::Memory(mem) => tmp.copy_from_slice(&mem[..n]),
                    Backing::Custom { .. } => unreachable!("source checked memory-backed"),
                }
                self.areas[dst].write_block(&tmp, 0)
            }
            (true, false) => {
                let mut tmp = vec![0 as Atom; n];
                self.areas[src].read_block(&mut tmp, 0)?;
                match self.areas[dst].memory_mut() {
                    Some(mem) => {
                        mem[..n].copy_from_slice(&tmp);
                        Ok(())
                    }
                    None => unreachable!("destination checked memory-backed"),
                }
            }
            (false, false) => Err(AccessError::Invalid { address: 0 }),
        }
    }

    /// Call `f` for every entry whose address lies within
    /// `[address, address + off)`, in ascending order. The callback
    /// returns a negative value to abort (reported as
    /// [`AccessError::Failure`] with the entry's address), zero to
    /// continue, or a positive value to stop successfully.
    pub fn foreach_in(
        &mut self,
        address: Address,
        off: AtomCount,
        f: &mut dyn FnMut(&mut Self, RegisterHandle) -> i32,
    ) -> Access {
        if !self.is_initialised() {
            return Err(AccessError::Uninitialised { address });
        }
        if off == 0 || self.entries.is_empty() {
            return Ok(());
        }

        // If the start address is mapped, the area's entry span narrows
        // the search for the first entry in the window.
        let hint = self
            .find_area(address)
            .map(|handle| self.areas[handle as usize].span)
            .filter(|span| span.count > 0)
            .map(|span| span.first)
            .unwrap_or(0);

        let mut start = None;
        for handle in hint..self.entries.len() as RegisterHandle {
            if self.entries[handle as usize].address >= address {
                start = Some(handle);
                break;
            }
        }

        match start {
            Some(handle) => self.iterate(handle, address.saturating_add(off - 1), f),
            None => Ok(()),
        }
    }

    fn iterate(
        &mut self,
        start: RegisterHandle,
        end: Address,
        f: &mut dyn FnMut(&mut Self, RegisterHandle) -> i32,
    ) -> Access {
        let last = self.entries.len() as RegisterHandle - 1;
        let mut handle = start;
        while handle <= last && self.entries[handle as usize].address <= end {
            let rc = f(self, handle);
            if rc == 0 {
                handle += 1;
                continue;
            }
            if rc < 0 {
                return Err(AccessError::Failure {
                    address: self.entries[handle as usize].address,
                });
            }
            return Ok(());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests;
