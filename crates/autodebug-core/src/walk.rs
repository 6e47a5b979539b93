//! Object-by-object walk of GC heap segments.
//!
//! The walker only needs raw memory reads and method table lookups, so it
//! runs the same over a DAC-backed runtime and an in-memory heap in tests.

use std::collections::{HashMap, HashSet};

use crate::heap::{FREE_TYPE_NAME, align_up, min_object_size, object_size};
use crate::HeapObject;

/// Generation table index of the large object heap.
pub const LOH_GENERATION: usize = 3;

/// Generation table index of the pinned object heap (.NET 5 and later).
pub const POH_GENERATION: usize = 4;

/// Layout and name of a method table, as needed to size its instances.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodTableInfo {
    pub base_size: u32,
    pub component_size: u32,
    pub name: String,
}

impl MethodTableInfo {
    /// Free-space filler types are named [`FREE_TYPE_NAME`] without asking
    /// the runtime; other types fall back to a placeholder when unnamed.
    pub fn resolve<F>(mt: u64, base_size: u32, component_size: u32, is_free: bool, lookup_name: F) -> Self
    where
        F: FnOnce() -> Option<String>,
    {
        let name = if is_free {
            FREE_TYPE_NAME.to_string()
        } else {
            lookup_name().unwrap_or_else(|| format!("<unknown type 0x{:x}>", mt))
        };
        Self {
            base_size,
            component_size,
            name,
        }
    }
}

/// Memory and type lookups the heap walk needs from a runtime.
pub trait HeapReader {
    fn pointer_size(&self) -> u32;
    fn read_pointer(&self, address: u64) -> Option<u64>;
    fn read_u32(&self, address: u64) -> Option<u32>;
    fn method_table(&self, mt: u64) -> Option<MethodTableInfo>;
}

/// An object range of one heap segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapSegment {
    /// Address of the segment descriptor.
    pub address: u64,
    /// First object.
    pub start: u64,
    /// End of allocated objects.
    pub end: u64,
    /// Generation table index the segment was reached from.
    pub generation: usize,
}

impl HeapSegment {
    /// Large and pinned object heaps align objects to 8 bytes.
    pub fn is_large(&self) -> bool {
        self.generation >= LOH_GENERATION
    }
}

/// End of the objects in a segment. The ephemeral segment is only
/// allocated up to the heap's `alloc_allocated`.
pub fn segment_end(segment: u64, allocated: u64, ephemeral_segment: u64, alloc_allocated: u64) -> u64 {
    if segment == ephemeral_segment {
        alloc_allocated
    } else {
        allocated
    }
}

/// Segments listed once each, in address order.
pub fn order_segments(segments: Vec<HeapSegment>) -> Vec<HeapSegment> {
    let mut seen = HashSet::new();
    let mut ordered: Vec<HeapSegment> = segments
        .into_iter()
        .filter(|segment| seen.insert(segment.address))
        .collect();
    ordered.sort_by_key(|segment| segment.start);
    ordered
}

/// Walks segments, caching method tables across the whole heap.
pub struct HeapWalker<'a, R: HeapReader + ?Sized> {
    reader: &'a R,
    /// Allocation context start -> limit.
    contexts: HashMap<u64, u64>,
    method_tables: HashMap<u64, Option<MethodTableInfo>>,
}

impl<'a, R: HeapReader + ?Sized> HeapWalker<'a, R> {
    pub fn new(reader: &'a R, contexts: HashMap<u64, u64>) -> Self {
        Self {
            reader,
            contexts,
            method_tables: HashMap::new(),
        }
    }

    pub fn walk(&mut self, segments: &[HeapSegment], visit: &mut dyn FnMut(&HeapObject)) {
        for segment in segments {
            self.walk_segment(segment, visit);
        }
    }

    fn method_table(&mut self, mt: u64) -> Option<MethodTableInfo> {
        if let Some(cached) = self.method_tables.get(&mt) {
            return cached.clone();
        }
        let info = self.reader.method_table(mt);
        self.method_tables.insert(mt, info.clone());
        info
    }

    pub fn walk_segment(&mut self, segment: &HeapSegment, visit: &mut dyn FnMut(&HeapObject)) {
        let pointer_size = self.reader.pointer_size();
        let min_size = min_object_size(pointer_size);
        let mut address = segment.start;

        while address < segment.end {
            if let Some(&limit) = self.contexts.get(&address) {
                let next = limit + min_size;
                if next <= address {
                    break;
                }
                address = next;
                continue;
            }

            let Some(raw_mt) = self.reader.read_pointer(address) else {
                tracing::warn!(address = format_args!("{:#x}", address), "unreadable object; skipping rest of segment");
                break;
            };
            // Low bits carry GC mark flags.
            let mt = raw_mt & !3;
            if mt == 0 {
                address += pointer_size as u64;
                continue;
            }

            let Some(info) = self.method_table(mt) else {
                tracing::warn!(
                    address = format_args!("{:#x}", address),
                    method_table = format_args!("{:#x}", mt),
                    "invalid method table; skipping rest of segment"
                );
                break;
            };

            let component_count = if info.component_size != 0 {
                match self.reader.read_u32(address + pointer_size as u64) {
                    Some(count) => count,
                    None => break,
                }
            } else {
                0
            };

            let mut size = object_size(info.base_size, info.component_size, component_count, pointer_size);
            if segment.is_large() {
                size = align_up(size, 8);
            }

            visit(&HeapObject {
                address,
                method_table: mt,
                size,
                type_name: info.name,
            });

            address += size;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::cell::Cell;

    use super::*;

    const OBJECT_MT: u64 = 0x7ff0_0000_1000;
    const STRING_MT: u64 = 0x7ff0_0000_2000;
    const FREE_MT: u64 = 0x7ff0_0000_3000;
    const BYTES_MT: u64 = 0x7ff0_0000_4000;

    struct FakeHeap {
        pointer_size: u32,
        words: HashMap<u64, u64>,
        types: HashMap<u64, MethodTableInfo>,
        lookups: Cell<usize>,
    }

    impl FakeHeap {
        fn new(pointer_size: u32) -> Self {
            let mut types = HashMap::new();
            types.insert(OBJECT_MT, MethodTableInfo::resolve(OBJECT_MT, 24, 0, false, || Some("System.Object".into())));
            types.insert(STRING_MT, MethodTableInfo::resolve(STRING_MT, 22, 2, false, || Some("System.String".into())));
            types.insert(FREE_MT, MethodTableInfo::resolve(FREE_MT, 24, 1, true, || None));
            types.insert(BYTES_MT, MethodTableInfo::resolve(BYTES_MT, 12, 1, false, || Some("System.Byte[]".into())));
            Self {
                pointer_size,
                words: HashMap::new(),
                types,
                lookups: Cell::new(0),
            }
        }

        fn object(&mut self, address: u64, mt: u64) -> &mut Self {
            self.words.insert(address, mt);
            self
        }

        fn array(&mut self, address: u64, mt: u64, count: u64) -> &mut Self {
            self.words.insert(address, mt);
            self.words.insert(address + self.pointer_size as u64, count);
            self
        }
    }

    impl HeapReader for FakeHeap {
        fn pointer_size(&self) -> u32 {
            self.pointer_size
        }

        fn read_pointer(&self, address: u64) -> Option<u64> {
            self.words.get(&address).copied()
        }

        fn read_u32(&self, address: u64) -> Option<u32> {
            self.words.get(&address).map(|&w| w as u32)
        }

        fn method_table(&self, mt: u64) -> Option<MethodTableInfo> {
            self.lookups.set(self.lookups.get() + 1);
            self.types.get(&mt).cloned()
        }
    }

    fn segment(address: u64, start: u64, end: u64, generation: usize) -> HeapSegment {
        HeapSegment {
            address,
            start,
            end,
            generation,
        }
    }

    fn collect(heap: &FakeHeap, contexts: HashMap<u64, u64>, segments: &[HeapSegment]) -> Vec<HeapObject> {
        let mut objects = Vec::new();
        HeapWalker::new(heap, contexts).walk(segments, &mut |o| objects.push(o.clone()));
        objects
    }

    fn addresses(objects: &[HeapObject]) -> Vec<u64> {
        objects.iter().map(|o| o.address).collect()
    }

    #[test]
    fn walks_fixed_and_variable_size_objects() {
        let mut heap = FakeHeap::new(8);
        heap.object(0x1000, OBJECT_MT)
            .array(0x1018, STRING_MT, 5)
            .object(0x1038, OBJECT_MT | 1);

        let objects = collect(&heap, HashMap::new(), &[segment(0xA, 0x1000, 0x1050, 2)]);

        assert_eq!(addresses(&objects), [0x1000, 0x1018, 0x1038]);
        assert_eq!(objects[1].size, 32);
        assert_eq!(objects[1].type_name, "System.String");
        // mark bit stripped
        assert_eq!(objects[2].method_table, OBJECT_MT);
    }

    #[test]
    fn free_objects_are_named_free() {
        let mut heap = FakeHeap::new(8);
        heap.array(0x1000, FREE_MT, 16);

        let objects = collect(&heap, HashMap::new(), &[segment(0xA, 0x1000, 0x1028, 2)]);

        assert_eq!(objects.len(), 1);
        assert_eq!(objects[0].type_name, FREE_TYPE_NAME);
        assert_eq!(objects[0].size, 40);
    }

    #[test]
    fn free_type_does_not_look_up_its_name() {
        let asked = Cell::new(false);
        let info = MethodTableInfo::resolve(FREE_MT, 24, 1, true, || {
            asked.set(true);
            Some("ignored".into())
        });
        assert_eq!(info.name, "Free");
        assert!(!asked.get());

        let unnamed = MethodTableInfo::resolve(0xabc0, 24, 0, false, || None);
        assert_eq!(unnamed.name, "<unknown type 0xabc0>");
    }

    #[test]
    fn allocation_context_is_skipped_past_its_limit() {
        let mut heap = FakeHeap::new(8);
        heap.object(0x1000, OBJECT_MT).object(0x1120, OBJECT_MT);
        // Context [0x1018, 0x1108) plus the minimum object trailing it
        let contexts = HashMap::from([(0x1018, 0x1108)]);

        let objects = collect(&heap, contexts, &[segment(0xA, 0x1000, 0x1138, 0)]);

        assert_eq!(addresses(&objects), [0x1000, 0x1120]);
    }

    #[test]
    fn zero_method_table_advances_one_pointer() {
        let mut heap = FakeHeap::new(8);
        heap.object(0x1000, 0).object(0x1008, 0).object(0x1010, OBJECT_MT);

        let objects = collect(&heap, HashMap::new(), &[segment(0xA, 0x1000, 0x1028, 2)]);

        assert_eq!(addresses(&objects), [0x1010]);
    }

    #[test]
    fn large_objects_align_to_eight_bytes() {
        // byte[5] on 32-bit: 12 + 5 = 17 -> 20 on the small heap, 24 on the LOH
        let mut heap = FakeHeap::new(4);
        heap.array(0x2000, BYTES_MT, 5).array(0x2018, BYTES_MT, 5);

        let large = collect(&heap, HashMap::new(), &[segment(0xB, 0x2000, 0x2030, LOH_GENERATION)]);
        assert_eq!(addresses(&large), [0x2000, 0x2018]);
        assert!(large.iter().all(|o| o.size == 24));

        let pinned = segment(0xC, 0x2000, 0x2018, POH_GENERATION);
        assert!(pinned.is_large());

        let mut heap = FakeHeap::new(4);
        heap.array(0x2000, BYTES_MT, 5).array(0x2014, BYTES_MT, 5);
        let small = collect(&heap, HashMap::new(), &[segment(0xA, 0x2000, 0x2028, 2)]);
        assert_eq!(addresses(&small), [0x2000, 0x2014]);
        assert_eq!(small[0].size, 20);
    }

    #[test]
    fn ephemeral_segment_ends_at_alloc_allocated() {
        assert_eq!(segment_end(0xE, 0x9000, 0xE, 0x1030), 0x1030);
        assert_eq!(segment_end(0xA, 0x9000, 0xE, 0x1030), 0x9000);

        let mut heap = FakeHeap::new(8);
        heap.object(0x1000, OBJECT_MT).object(0x1018, OBJECT_MT).object(0x1030, OBJECT_MT);
        let end = segment_end(0xE, 0x9000, 0xE, 0x1030);

        let objects = collect(&heap, HashMap::new(), &[segment(0xE, 0x1000, end, 0)]);

        assert_eq!(addresses(&objects), [0x1000, 0x1018]);
    }

    #[test]
    fn method_tables_are_looked_up_once() {
        let mut heap = FakeHeap::new(8);
        heap.object(0x1000, OBJECT_MT)
            .object(0x1018, OBJECT_MT)
            .object(0x1030, OBJECT_MT)
            .object(0x3000, OBJECT_MT);

        let segments = [segment(0xA, 0x1000, 0x1048, 2), segment(0xB, 0x3000, 0x3018, 2)];
        let objects = collect(&heap, HashMap::new(), &segments);

        assert_eq!(objects.len(), 4);
        assert_eq!(heap.lookups.get(), 1);
    }

    #[test]
    fn bad_method_table_ends_only_that_segment() {
        let mut heap = FakeHeap::new(8);
        heap.object(0x1000, OBJECT_MT)
            .object(0x1018, 0xdead_0000)
            .object(0x1030, OBJECT_MT)
            .object(0x3000, STRING_MT | 2)
            .words
            .insert(0x3008, 0);

        let segments = [segment(0xA, 0x1000, 0x1048, 2), segment(0xB, 0x3000, 0x3018, 2)];
        let objects = collect(&heap, HashMap::new(), &segments);

        assert_eq!(addresses(&objects), [0x1000, 0x3000]);
        assert_eq!(objects[1].size, 24);
    }

    #[test]
    fn segments_are_walked_in_address_order() {
        // Workstation segment GC: gen0 and gen1 both start at the ephemeral
        // segment, which sits above the gen2 chain.
        let gen2_first = segment(0x10, 0x1000, 0x1018, 2);
        let gen2_second = segment(0x20, 0x2000, 0x2018, 2);
        let ephemeral = segment(0x30, 0x3000, 0x3018, 0);
        let loh = segment(0x40, 0x8000, 0x8018, LOH_GENERATION);
        let poh = segment(0x50, 0x6000, 0x6018, POH_GENERATION);

        let ordered = order_segments(vec![ephemeral, ephemeral, gen2_first, gen2_second, ephemeral, loh, poh]);
        let starts: Vec<u64> = ordered.iter().map(|s| s.start).collect();
        assert_eq!(starts, [0x1000, 0x2000, 0x3000, 0x6000, 0x8000]);
        assert_eq!(ordered[2].generation, 0);

        let mut heap = FakeHeap::new(8);
        for start in [0x1000, 0x2000, 0x3000, 0x6000, 0x8000] {
            heap.object(start, OBJECT_MT);
        }
        let objects = collect(&heap, HashMap::new(), &ordered);
        assert_eq!(addresses(&objects), [0x1000, 0x2000, 0x3000, 0x6000, 0x8000]);
    }
}
