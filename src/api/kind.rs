//! Allocator kind tags and the single list they are generated from.

/// Invoke `$callback!` with every allocator kind and its concrete type.
///
/// The kind enum and every dispatch table are generated from this one
/// list, so table order always matches the tag values.
macro_rules! for_each_allocator_kind {
    ($callback:ident) => {
        $callback! {
            Stack => $crate::allocators::StackAllocator,
            Multipool => $crate::allocators::MultipoolAllocator,
            Arena => $crate::allocators::MemoryArena,
            Manager => $crate::allocators::MemoryManager,
            ResizableLinear => $crate::allocators::ResizableLinearAllocator,
            Malloc => $crate::allocators::MallocAllocator,
        }
    };
}

pub(crate) use for_each_allocator_kind;

macro_rules! define_allocator_kind {
    ($($kind:ident => $ty:ty),* $(,)?) => {
        /// Tag identifying the concrete type behind an allocator handle.
        ///
        /// Used as an index into the dispatch tables.
        #[repr(u8)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        pub enum AllocatorKind {
            $(
                #[doc = concat!("Handle points at a ", stringify!($kind), " allocator.")]
                $kind,
            )*
        }

        impl AllocatorKind {
            /// Every kind, in tag order.
            pub const ALL: &'static [AllocatorKind] = &[$(AllocatorKind::$kind),*];

            /// Name of the kind, for logs and the debug dump.
            pub const fn name(self) -> &'static str {
                match self {
                    $(AllocatorKind::$kind => stringify!($kind),)*
                }
            }
        }

        /// Number of allocator kinds, the length of every dispatch table.
        pub const ALLOCATOR_KIND_COUNT: usize = AllocatorKind::ALL.len();
    };
}

for_each_allocator_kind!(define_allocator_kind);

impl std::fmt::Display for AllocatorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Which entry point a handle dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConcurrencyMode {
    /// Unsynchronized fast path; the caller guarantees exclusive access.
    #[default]
    SingleThreaded,
    /// Locking (`_ts`) path; safe to share across threads.
    ThreadSafe,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_are_dense() {
        for (index, kind) in AllocatorKind::ALL.iter().enumerate() {
            assert_eq!(*kind as usize, index);
        }
        assert_eq!(ALLOCATOR_KIND_COUNT, 6);
    }

    #[test]
    fn test_names() {
        assert_eq!(AllocatorKind::Multipool.name(), "Multipool");
        assert_eq!(AllocatorKind::ResizableLinear.to_string(), "ResizableLinear");
    }
}
