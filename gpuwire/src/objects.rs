//! Per-kind object tables.
//!
//! Both endpoints keep one [`ObjectTable`] per [`ObjectKind`]. The client
//! reserves ids for the objects its calls will create; the server allocates
//! the same ids when the create command arrives. Because ids are reused, each
//! slot carries a generation that is bumped every time it is reallocated:
//! a handle whose generation does not match the live object is stale.

use gpuwire_proto::{IdResolver, LookupOutcome, ObjectHandle, ObjectKind, WireError, WireResult};

/// A live table entry.
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub struct TrackedObject<T> {
    /// Slot index.
    pub id: u32,
    /// Generation the slot was allocated with.
    pub generation: u32,
    /// Endpoint-specific payload; `None` until the object is created.
    pub handle: Option<T>,
    /// `false` when creation failed but the id must stay reserved.
    pub valid: bool,
}

impl<T> TrackedObject<T> {
    /// Wire handle naming this object.
    pub const fn wire_handle(&self) -> ObjectHandle {
        ObjectHandle::new(self.id, self.generation)
    }
}

/// One slot of a table.
#[derive(Debug, Clone)]
struct Slot<T> {
    /// Generation of the last allocation, `0` if never allocated.
    generation: u32,
    /// Live object, if any.
    object: Option<TrackedObject<T>>,
    /// Whether the id sits on the free list. An entry may outlive the free
    /// slot it named; [`ObjectTable::reserve`] skips such entries.
    queued: bool,
}

impl<T> Slot<T> {
    /// A slot that was never allocated.
    const fn empty() -> Self {
        Self {
            generation: 0,
            object: None,
            queued: false,
        }
    }
}

/// Dense id → object table with a free list.
#[derive(Debug, Clone)]
pub struct ObjectTable<T> {
    /// Kind of every object in the table.
    kind: ObjectKind,
    /// Slot 0 is the reserved null id and is never allocated.
    slots: Vec<Slot<T>>,
    /// Freed ids, reused last-in first-out by [`reserve`](Self::reserve).
    /// Ids claimed directly stay listed until popped.
    free: Vec<u32>,
}

impl<T> ObjectTable<T> {
    /// Creates an empty table for `kind`.
    pub fn new(kind: ObjectKind) -> Self {
        Self {
            kind,
            slots: vec![Slot::empty()],
            free: Vec::new(),
        }
    }

    /// Kind of the objects in this table.
    pub const fn kind(&self) -> ObjectKind {
        self.kind
    }

    /// Number of live objects.
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.object.is_some()).count()
    }

    /// The error returned for any misuse of `handle`.
    const fn misuse(&self, handle: ObjectHandle) -> WireError {
        WireError::BadAllocation {
            kind: self.kind,
            handle,
        }
    }

    /// Allocates `id` with the next generation of its slot.
    ///
    /// Fails if `id` is the null id, already live, or more than one past the
    /// end of the table.
    pub fn allocate(&mut self, id: u32) -> WireResult<&mut TrackedObject<T>> {
        self.claim(id, None)
    }

    /// Allocates the exact handle chosen by the peer; its generation must be
    /// the one the slot would get next.
    pub fn allocate_handle(&mut self, handle: ObjectHandle) -> WireResult<&mut TrackedObject<T>> {
        self.claim(handle.id, Some(handle.generation))
    }

    /// Shared body of [`allocate`](Self::allocate) and
    /// [`allocate_handle`](Self::allocate_handle).
    fn claim(&mut self, id: u32, expected: Option<u32>) -> WireResult<&mut TrackedObject<T>> {
        let err = self.misuse(ObjectHandle::new(id, expected.unwrap_or(0)));
        let index = id as usize;
        if id == 0 || index > self.slots.len() {
            return Err(err);
        }
        let previous = self.slots.get(index).map_or(0, |s| s.generation);
        if self.slots.get(index).is_some_and(|s| s.object.is_some()) {
            return Err(err);
        }
        let Some(generation) = previous.checked_add(1) else {
            return Err(err);
        };
        if expected.is_some_and(|g| g != generation) {
            return Err(err);
        }
        if index == self.slots.len() {
            self.slots.push(Slot::empty());
        }
        let slot = &mut self.slots[index];
        slot.generation = generation;
        Ok(slot.object.insert(TrackedObject {
            id,
            generation,
            handle: None,
            valid: true,
        }))
    }

    /// Puts a free `id` on the free list unless it is already there.
    fn enqueue(&mut self, id: u32) {
        if let Some(slot) = self.slots.get_mut(id as usize)
            && !slot.queued
        {
            slot.queued = true;
            self.free.push(id);
        }
    }

    /// Pops the most recently freed id that is still free.
    fn pop_free(&mut self) -> Option<u32> {
        while let Some(id) = self.free.pop() {
            let Some(slot) = self.slots.get_mut(id as usize) else {
                continue;
            };
            slot.queued = false;
            if slot.object.is_none() {
                return Some(id);
            }
        }
        None
    }

    /// Picks an id for a new object (reusing freed ids first) and allocates it.
    pub fn reserve(&mut self) -> WireResult<ObjectHandle> {
        let id = match self.pop_free() {
            Some(id) => id,
            None => u32::try_from(self.slots.len()).map_err(|_| WireError::LengthOverflow)?,
        };
        Ok(self.allocate(id)?.wire_handle())
    }

    /// Undoes a [`reserve`](Self::reserve) whose command never reached the
    /// peer, restoring the slot's previous generation.
    pub fn cancel_reservation(&mut self, handle: ObjectHandle) {
        let index = handle.id as usize;
        let Some(slot) = self.slots.get_mut(index) else {
            return;
        };
        if slot.object.as_ref().map(TrackedObject::wire_handle) != Some(handle) {
            return;
        }
        slot.object = None;
        slot.generation -= 1;
        if slot.generation == 0 && !slot.queued && index + 1 == self.slots.len() {
            self.slots.pop();
        } else {
            self.enqueue(handle.id);
        }
    }

    /// Live object with `id`.
    pub fn get(&self, id: u32) -> Option<&TrackedObject<T>> {
        if id == 0 {
            return None;
        }
        self.slots.get(id as usize)?.object.as_ref()
    }

    /// Mutable live object with `id`.
    pub fn get_mut(&mut self, id: u32) -> Option<&mut TrackedObject<T>> {
        if id == 0 {
            return None;
        }
        self.slots.get_mut(id as usize)?.object.as_mut()
    }

    /// Live object named by `handle`, `None` if the handle is stale.
    pub fn resolve(&self, handle: ObjectHandle) -> Option<&TrackedObject<T>> {
        self.get(handle.id)
            .filter(|o| o.generation == handle.generation)
    }

    /// Mutable counterpart of [`resolve`](Self::resolve).
    pub fn resolve_mut(&mut self, handle: ObjectHandle) -> Option<&mut TrackedObject<T>> {
        self.get_mut(handle.id)
            .filter(|o| o.generation == handle.generation)
    }

    /// Frees `id`, returning the object that lived there.
    pub fn free(&mut self, id: u32) -> Option<TrackedObject<T>> {
        if id == 0 {
            return None;
        }
        let object = self.slots.get_mut(id as usize)?.object.take()?;
        self.enqueue(id);
        Some(object)
    }

    /// Iterates over live objects in id order.
    pub fn iter(&self) -> impl Iterator<Item = &TrackedObject<T>> {
        self.slots.iter().filter_map(|s| s.object.as_ref())
    }

    /// Removes every live object, keeping generations.
    pub fn take_all(&mut self) -> Vec<TrackedObject<T>> {
        let out: Vec<_> = self
            .slots
            .iter_mut()
            .filter_map(|slot| slot.object.take())
            .collect();
        for object in &out {
            self.enqueue(object.id);
        }
        out
    }
}

/// One [`ObjectTable`] per object kind.
#[derive(Debug, Clone)]
pub struct KnownObjects<T> {
    /// Tables indexed by [`ObjectKind::index`].
    tables: [ObjectTable<T>; ObjectKind::COUNT],
}

impl<T> KnownObjects<T> {
    /// Creates empty tables for every kind.
    pub fn new() -> Self {
        Self {
            tables: std::array::from_fn(|i| ObjectTable::new(ObjectKind::ALL[i])),
        }
    }

    /// Table for `kind`.
    pub fn table(&self, kind: ObjectKind) -> &ObjectTable<T> {
        &self.tables[kind.index()]
    }

    /// Mutable table for `kind`.
    pub fn table_mut(&mut self, kind: ObjectKind) -> &mut ObjectTable<T> {
        &mut self.tables[kind.index()]
    }

    /// Iterates over every table.
    pub fn tables_mut(&mut self) -> impl Iterator<Item = &mut ObjectTable<T>> {
        self.tables.iter_mut()
    }
}

impl<T> Default for KnownObjects<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone> IdResolver<T> for KnownObjects<T> {
    fn resolve(&self, kind: ObjectKind, handle: ObjectHandle) -> LookupOutcome<T> {
        if handle.is_null() || handle.generation == 0 {
            return LookupOutcome::Malformed;
        }
        match self.table(kind).resolve(handle) {
            None => LookupOutcome::NotFound,
            Some(TrackedObject {
                valid: true,
                handle: Some(h),
                ..
            }) => LookupOutcome::Found(h.clone()),
            Some(_) => LookupOutcome::Invalid,
        }
    }
}
