//! Managed heap objects and per-type statistics.

use indexmap::IndexMap;

/// Type name reported for free-space filler objects.
pub const FREE_TYPE_NAME: &str = "Free";

/// One object found on the managed heap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeapObject {
    pub address: u64,
    pub method_table: u64,
    pub size: u64,
    pub type_name: String,
}

/// Totals for all objects sharing a method table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeStatistics {
    pub method_table: u64,
    pub count: u64,
    pub total_size: u64,
    pub type_name: String,
}

/// Per-type totals accumulated over a heap walk.
///
/// Types keep the order in which they were first seen so that sorting by
/// size is stable for types with equal totals.
#[derive(Debug, Default)]
pub struct HeapStatistics {
    by_type: IndexMap<u64, TypeStatistics>,
}

impl HeapStatistics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, object: &HeapObject) {
        let entry = self
            .by_type
            .entry(object.method_table)
            .or_insert_with(|| TypeStatistics {
                method_table: object.method_table,
                count: 0,
                total_size: 0,
                type_name: object.type_name.clone(),
            });
        entry.count += 1;
        entry.total_size += object.size;
    }

    /// Number of distinct types seen.
    pub fn type_count(&self) -> usize {
        self.by_type.len()
    }

    pub fn total_objects(&self) -> u64 {
        self.by_type.values().map(|s| s.count).sum()
    }

    pub fn total_size(&self) -> u64 {
        self.by_type.values().map(|s| s.total_size).sum()
    }

    /// Statistics ordered by ascending total size.
    pub fn sorted(&self) -> Vec<&TypeStatistics> {
        let mut stats: Vec<&TypeStatistics> = self.by_type.values().collect();
        stats.sort_by_key(|s| s.total_size);
        stats
    }
}

impl<'a> FromIterator<&'a HeapObject> for HeapStatistics {
    fn from_iter<I: IntoIterator<Item = &'a HeapObject>>(iter: I) -> Self {
        let mut stats = HeapStatistics::new();
        for object in iter {
            stats.record(object);
        }
        stats
    }
}

/// Round `size` up to a multiple of `alignment` (a power of two).
pub fn align_up(size: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (size + alignment - 1) & !(alignment - 1)
}

/// Size of an object as laid out on the GC heap.
///
/// `component_count` is the array length or string length for variable-size
/// types and ignored when `component_size` is zero.
pub fn object_size(base_size: u32, component_size: u32, component_count: u32, pointer_size: u32) -> u64 {
    let mut size = base_size as u64;
    if component_size != 0 {
        size += component_count as u64 * component_size as u64;
    }
    let size = align_up(size, pointer_size as u64);
    size.max(min_object_size(pointer_size))
}

/// Smallest object the GC allocates: method table, header and one field.
pub fn min_object_size(pointer_size: u32) -> u64 {
    3 * pointer_size as u64
}
