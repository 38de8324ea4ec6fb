//! Cache-line-optimized object index
//!
//! Maps 64-bit keys to pointers at log-resident objects. Each slot packs a
//! 16-bit key fingerprint, a 47-bit pointer, and a chain bit into a single
//! 8-byte word; eight slots fill one 64-byte cache line. Buckets that
//! overflow chain through additional cache lines allocated from a pool
//! owned by the table, so a lookup touches as few cache lines as possible.
//!
//! The table is externally synchronized, but every slot is an 8-byte
//! aligned atomic, so a concurrent reader observes either the old or the
//! new word of a slot, never a torn write. That makes single-writer /
//! multi-reader use safe as long as the caller keeps pointed-to objects
//! alive across lookups.

use std::hash::BuildHasher;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};

use ahash::RandomState;
use clocksource::precise::Instant;
use memmap2::MmapMut;

use crate::metrics::Counter;

pub const ENTRIES_PER_CACHE_LINE: usize = 8;

const CHAIN_BIT: u64 = 1 << 63;
const HASH_SHIFT: u32 = 47;
const HASH_MASK: u64 = 0xFFFF;
const PTR_MASK: u64 = (1 << 47) - 1;

/// A single 8-byte index slot.
///
/// Layout: `[1 bit chain][16 bits hash][47 bits ptr]`
///
/// An entry whose whole word is zero is available. When the chain bit is
/// set, `ptr` names another [`CacheLine`] owned by the table and the hash
/// field is meaningless; otherwise `ptr` names an object in the log and
/// the hash field is the fingerprint of that object's key.
#[repr(transparent)]
pub struct PackedEntry {
    value: AtomicU64,
}

/// Decoded form of a [`PackedEntry`], used by tests and debugging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnpackedEntry {
    pub hash: u16,
    pub chain: bool,
    pub ptr: u64,
}

impl PackedEntry {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Pack the three fields into one word.
    ///
    /// Panics if the pointer does not fit in 47 bits; a wider user-space
    /// address would alias another entry if truncated.
    fn pack(hash: u16, chain: bool, ptr: u64) -> u64 {
        assert!(
            ptr & !PTR_MASK == 0,
            "pointer {ptr:#x} exceeds the 47-bit packed range"
        );
        let chain = if chain { CHAIN_BIT } else { 0 };
        chain | ((u64::from(hash)) << HASH_SHIFT) | ptr
    }

    fn fingerprint_of(word: u64) -> u16 {
        ((word >> HASH_SHIFT) & HASH_MASK) as u16
    }

    fn load(&self) -> u64 {
        self.value.load(Ordering::Acquire)
    }

    fn store(&self, word: u64) {
        self.value.store(word, Ordering::Release);
    }

    pub fn unpack(&self) -> UnpackedEntry {
        let word = self.load();
        UnpackedEntry {
            hash: Self::fingerprint_of(word),
            chain: word & CHAIN_BIT != 0,
            ptr: word & PTR_MASK,
        }
    }

    pub fn clear(&self) {
        self.store(0);
    }

    pub fn is_available(&self) -> bool {
        self.load() == 0
    }

    pub fn is_chain_link(&self) -> bool {
        self.load() & CHAIN_BIT != 0
    }

    pub fn set_log_pointer(&self, fingerprint: u16, ptr: u64) {
        self.store(Self::pack(fingerprint, false, ptr));
    }

    pub fn set_chain_pointer(&self, line: NonNull<CacheLine>) {
        self.store(Self::pack(0, true, line.as_ptr() as u64));
    }

    /// Stored object address. The entry must hold a log pointer.
    pub fn log_pointer(&self) -> u64 {
        let word = self.load();
        debug_assert!(word != 0 && word & CHAIN_BIT == 0);
        word & PTR_MASK
    }

    /// Next line in the bucket's chain. The entry must be a chain link.
    pub fn chain_pointer(&self) -> NonNull<CacheLine> {
        let word = self.load();
        debug_assert!(word & CHAIN_BIT != 0);
        NonNull::new((word & PTR_MASK) as *mut CacheLine)
            .expect("chain link holds a null cache line pointer")
    }

    /// True iff the entry is a log pointer whose fingerprint equals
    /// `fingerprint`. Available entries and chain links never match.
    pub fn hash_matches(&self, fingerprint: u16) -> bool {
        let word = self.load();
        word != 0 && word & CHAIN_BIT == 0 && Self::fingerprint_of(word) == fingerprint
    }
}

impl Default for PackedEntry {
    fn default() -> Self {
        Self::new()
    }
}

/// One 64-byte bucket: eight packed entries.
///
/// Entry 7 doubles as the chain link to the next overflow line; a line
/// whose last entry is not a chain link terminates the bucket.
#[repr(C, align(64))]
pub struct CacheLine {
    entries: [PackedEntry; ENTRIES_PER_CACHE_LINE],
}

impl CacheLine {
    fn new() -> Self {
        Self {
            entries: std::array::from_fn(|_| PackedEntry::new()),
        }
    }

    pub fn entry(&self, index: usize) -> &PackedEntry {
        &self.entries[index]
    }
}

/// Fixed-width histogram of per-lookup latency samples, in nanoseconds.
pub struct PerfDistribution {
    min: AtomicU64,
    max: AtomicU64,
    bin_overflows: AtomicU64,
    bins: Box<[AtomicU64]>,
}

impl PerfDistribution {
    pub const NBINS: usize = 5000;
    pub const BIN_WIDTH: u64 = 10;

    fn new() -> Self {
        Self {
            min: AtomicU64::new(u64::MAX),
            max: AtomicU64::new(0),
            bin_overflows: AtomicU64::new(0),
            bins: (0..Self::NBINS).map(|_| AtomicU64::new(0)).collect(),
        }
    }

    pub fn store_sample(&self, sample: u64) {
        self.min.fetch_min(sample, Ordering::Relaxed);
        self.max.fetch_max(sample, Ordering::Relaxed);
        let index = (sample / Self::BIN_WIDTH) as usize;
        if index < Self::NBINS {
            self.bins[index].fetch_add(1, Ordering::Relaxed);
        } else {
            self.bin_overflows.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn min(&self) -> u64 {
        self.min.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u64 {
        self.max.load(Ordering::Relaxed)
    }

    pub fn bin_overflows(&self) -> u64 {
        self.bin_overflows.load(Ordering::Relaxed)
    }

    pub fn bin(&self, index: usize) -> u64 {
        self.bins[index].load(Ordering::Relaxed)
    }
}

impl Default for PerfDistribution {
    fn default() -> Self {
        Self::new()
    }
}

/// Aggregate performance counters for one table instance.
pub struct PerfCounters {
    /// Nanoseconds spent inside `insert`.
    pub insert_ticks: Counter,
    /// Nanoseconds spent inside `lookup`.
    pub lookup_entry_ticks: Counter,
    /// Overflow lines traversed while looking for a free insert slot.
    pub insert_chains_followed: Counter,
    /// Overflow lines traversed during lookups.
    pub lookup_entry_chains_followed: Counter,
    /// Fingerprint matches whose full-key comparison failed.
    pub lookup_entry_hash_collisions: Counter,
    /// Distribution of per-lookup latencies for successful lookups.
    pub lookup_entry_dist: PerfDistribution,
}

impl PerfCounters {
    fn new() -> Self {
        Self {
            insert_ticks: Counter::new(),
            lookup_entry_ticks: Counter::new(),
            insert_chains_followed: Counter::new(),
            lookup_entry_chains_followed: Counter::new(),
            lookup_entry_hash_collisions: Counter::new(),
            lookup_entry_dist: PerfDistribution::new(),
        }
    }
}

/// The object index: 64-bit keys to pointers at objects of type `T`.
///
/// `n_lines` primary cache lines are allocated zeroed from an anonymous
/// mmap at construction; buckets that fill up chain through heap-allocated
/// overflow lines owned by the table. The table never interprets object
/// bytes itself: the `key_of` callback supplied at construction extracts
/// the full key from a candidate object so fingerprint collisions can be
/// rejected.
///
/// Insertion does not check for duplicates; callers that replace an object
/// must remove-then-insert or update in place under their own protocol.
pub struct HashTable<T, K>
where
    K: Fn(&T) -> u64,
{
    hash_builder: RandomState,
    /// Mmap-backed storage for the primary cache lines.
    allocation: MmapMut,
    n_lines: usize,
    /// Overflow lines referenced by chain links. Box addresses are stable,
    /// so published chain pointers stay valid until the table drops.
    overflow: Vec<Box<CacheLine>>,
    key_of: K,
    perf: PerfCounters,
    _object: PhantomData<*const T>,
}

// Slots are whole-word atomics and overflow lines are only published after
// they are fully initialized. Dereferencing stored object pointers is the
// caller's key-extraction contract, which requires T: Sync to share.
unsafe impl<T, K> Send for HashTable<T, K>
where
    T: Sync,
    K: Send + Fn(&T) -> u64,
{
}
unsafe impl<T, K> Sync for HashTable<T, K>
where
    T: Sync,
    K: Sync + Fn(&T) -> u64,
{
}

impl<T, K> HashTable<T, K>
where
    K: Fn(&T) -> u64,
{
    /// Create a table with `n_lines` primary cache lines.
    ///
    /// Panics if `n_lines` is zero. Fails only if the anonymous mapping
    /// for the primary array cannot be created.
    pub fn new(n_lines: usize, key_of: K) -> Result<Self, std::io::Error> {
        // Fixed seeds in tests for deterministic behavior, random seeds in
        // production.
        #[cfg(test)]
        let hash_builder = RandomState::with_seeds(
            0xbb8c484891ec6c86,
            0x0522a25ae9c769f9,
            0xeed2797b9571bc75,
            0x4feb29c1fbbd59d0,
        );
        #[cfg(not(test))]
        let hash_builder = RandomState::new();

        Self::with_hasher(n_lines, key_of, hash_builder)
    }

    /// Create a table with an explicit hasher state.
    ///
    /// Pinning the seeds makes bucket placement reproducible across runs,
    /// which layout-sensitive benchmarks and repeatable capacity tests
    /// rely on.
    pub fn with_hasher(
        n_lines: usize,
        key_of: K,
        hash_builder: RandomState,
    ) -> Result<Self, std::io::Error> {
        if n_lines == 0 {
            panic!("hash table must have at least one cache line");
        }

        // Mmap hands back zeroed, page-aligned memory, so every entry
        // starts out available and every line is 64-byte aligned.
        let allocation = MmapMut::map_anon(n_lines * std::mem::size_of::<CacheLine>())?;

        Ok(Self {
            hash_builder,
            allocation,
            n_lines,
            overflow: Vec::new(),
            key_of,
            perf: PerfCounters::new(),
            _object: PhantomData,
        })
    }

    pub fn n_lines(&self) -> usize {
        self.n_lines
    }

    pub fn perf_counters(&self) -> &PerfCounters {
        &self.perf
    }

    /// Get a reference to a primary line by index.
    #[inline]
    fn line(&self, index: usize) -> &CacheLine {
        debug_assert!(index < self.n_lines);
        unsafe {
            let ptr = self.allocation.as_ptr() as *const CacheLine;
            &*ptr.add(index)
        }
    }

    /// Primary bucket index and 16-bit fingerprint for a key.
    ///
    /// Zero is a legal fingerprint; availability is judged by the whole
    /// entry word, not the fingerprint.
    #[inline]
    fn bucket_and_fingerprint(&self, key: u64) -> (usize, u16) {
        let hash = self.hash_builder.hash_one(key);
        ((hash % self.n_lines as u64) as usize, (hash & HASH_MASK) as u16)
    }

    /// Look up the object stored under `key`.
    ///
    /// Scans the primary line for a fingerprint match, dereferences each
    /// candidate through `key_of` to verify the full key, and follows
    /// chain links through any overflow lines. `None` means the key is
    /// definitely absent.
    pub fn lookup(&self, key: u64) -> Option<NonNull<T>> {
        let start = Instant::now();
        let (bucket, fingerprint) = self.bucket_and_fingerprint(key);

        let mut line = self.line(bucket);
        let mut found = None;
        'search: loop {
            let mut next: Option<NonNull<CacheLine>> = None;
            for index in 0..ENTRIES_PER_CACHE_LINE {
                let word = line.entry(index).load();
                if index == ENTRIES_PER_CACHE_LINE - 1 && word & CHAIN_BIT != 0 {
                    next = NonNull::new((word & PTR_MASK) as *mut CacheLine);
                    break;
                }
                if word == 0 || PackedEntry::fingerprint_of(word) != fingerprint {
                    continue;
                }
                let candidate = (word & PTR_MASK) as *const T;
                if (self.key_of)(unsafe { &*candidate }) == key {
                    found = NonNull::new(candidate as *mut T);
                    break 'search;
                }
                self.perf.lookup_entry_hash_collisions.increment();
            }
            match next {
                Some(chained) => {
                    self.perf.lookup_entry_chains_followed.increment();
                    line = unsafe { chained.as_ref() };
                }
                None => break,
            }
        }

        let elapsed = (Instant::now() - start).as_nanos();
        self.perf.lookup_entry_ticks.add(elapsed);
        if found.is_some() {
            self.perf.lookup_entry_dist.store_sample(elapsed);
        }
        found
    }

    /// Insert a mapping from `key` to `object`.
    ///
    /// The object's address must fit in 47 bits; wider addresses are a
    /// fatal error rather than a silent truncation. The caller must keep
    /// the object alive for as long as the entry is in the table.
    pub fn insert(&mut self, key: u64, object: NonNull<T>) {
        let start = Instant::now();
        let (bucket, fingerprint) = self.bucket_and_fingerprint(key);
        let addr = object.as_ptr() as u64;

        let mut line_ptr: *const CacheLine = self.line(bucket);
        loop {
            let line = unsafe { &*line_ptr };
            let mut next: Option<NonNull<CacheLine>> = None;
            for index in 0..ENTRIES_PER_CACHE_LINE {
                let entry = line.entry(index);
                let word = entry.load();
                if index == ENTRIES_PER_CACHE_LINE - 1 && word & CHAIN_BIT != 0 {
                    next = Some(entry.chain_pointer());
                    break;
                }
                if word == 0 {
                    entry.set_log_pointer(fingerprint, addr);
                    self.perf.insert_ticks.add((Instant::now() - start).as_nanos());
                    return;
                }
            }
            match next {
                Some(chained) => {
                    self.perf.insert_chains_followed.increment();
                    line_ptr = chained.as_ptr();
                }
                None => break,
            }
        }

        // Every slot in every line of this bucket is occupied: grow the
        // chain. The old tail's entry 7 holds data, which moves to slot 0
        // of the new line so repurposing entry 7 as the chain link loses
        // nothing. The new line is fully populated before the chain link
        // is published, so concurrent readers see it complete or not at
        // all.
        let new_line = self.allocate_overflow_line();
        let tail = unsafe { &*line_ptr };
        let displaced = tail.entry(ENTRIES_PER_CACHE_LINE - 1).load();
        unsafe {
            new_line.as_ref().entry(0).store(displaced);
            new_line.as_ref().entry(1).set_log_pointer(fingerprint, addr);
        }
        tail.entry(ENTRIES_PER_CACHE_LINE - 1).set_chain_pointer(new_line);

        self.perf.insert_ticks.add((Instant::now() - start).as_nanos());
    }

    fn allocate_overflow_line(&mut self) -> NonNull<CacheLine> {
        self.overflow.push(Box::new(CacheLine::new()));
        let line: &CacheLine = self.overflow.last().expect("just pushed");
        NonNull::from(line)
    }
}
