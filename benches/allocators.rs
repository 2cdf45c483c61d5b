use bumpalo::Bump;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use polyalloc::{
    allocate, deallocate, kb, mb, AllocatorBase, AllocatorPolymorphic, ConcurrencyMode,
    CreateBaseAllocatorInfo, DebugInfo, MemoryArena, MemoryManager, MemoryManagerConfig,
    MultipoolAllocator, ResizableLinearAllocator, ResizableLinearConfig, StackAllocator,
};
use std::alloc::{alloc, dealloc, Layout};

// =============================================================================
// SINGLE ALLOCATION BENCHMARKS
// =============================================================================

fn bench_single_alloc(c: &mut Criterion) {
    let mut group = c.benchmark_group("single_alloc_64B");
    group.throughput(Throughput::Bytes(64));

    group.bench_function("stack", |b| {
        let mut buffer = vec![0u8; mb(1)];
        let mut stack = unsafe { StackAllocator::new(buffer.as_mut_ptr(), mb(1)) };
        b.iter(|| {
            black_box(stack.allocate(64, 8, DebugInfo::none()));
            stack.undo_last(DebugInfo::none());
        });
    });

    group.bench_function("multipool", |b| {
        let mut buffer = vec![0u8; mb(1)];
        let mut pool = unsafe { MultipoolAllocator::new(buffer.as_mut_ptr(), mb(1), 1024) };
        b.iter(|| unsafe {
            let ptr = pool.allocate(64, 8, DebugInfo::none());
            black_box(ptr);
            pool.deallocate(ptr, DebugInfo::none());
        });
    });

    group.bench_function("manager", |b| {
        let mut manager =
            MemoryManager::new(AllocatorPolymorphic::malloc(), MemoryManagerConfig::default()).unwrap();
        b.iter(|| unsafe {
            let ptr = manager.allocate(64, 8, DebugInfo::none());
            black_box(ptr);
            manager.deallocate(ptr, DebugInfo::none());
        });
    });

    group.bench_function("bumpalo", |b| {
        let mut bump = Bump::with_capacity(mb(1));
        b.iter(|| {
            black_box(bump.alloc([0u8; 64]));
            bump.reset();
        });
    });

    group.bench_function("system_malloc", |b| {
        b.iter(|| unsafe {
            let layout = Layout::from_size_align(64, 8).unwrap();
            let ptr = alloc(layout);
            black_box(ptr);
            dealloc(ptr, layout);
        });
    });

    group.finish();
}

// =============================================================================
// BATCH ALLOCATION BENCHMARKS
// =============================================================================

fn bench_batch(c: &mut Criterion) {
    for count in [100usize, 1000] {
        let mut group = c.benchmark_group(format!("batch_{}x64B", count));
        group.throughput(Throughput::Bytes((count * 64) as u64));

        group.bench_function("stack_marker", |b| {
            let mut buffer = vec![0u8; mb(1)];
            let mut stack = unsafe { StackAllocator::new(buffer.as_mut_ptr(), mb(1)) };
            b.iter(|| {
                stack.set_marker();
                for _ in 0..count {
                    black_box(stack.allocate(64, 8, DebugInfo::none()));
                }
                stack.return_to_marker(DebugInfo::none());
            });
        });

        group.bench_function("resizable_linear", |b| {
            let config = ResizableLinearConfig::default()
                .with_initial_size(kb(16))
                .with_backup_chunk_size(kb(16));
            let mut linear = ResizableLinearAllocator::new(AllocatorPolymorphic::malloc(), config).unwrap();
            b.iter(|| {
                linear.set_marker();
                for _ in 0..count {
                    black_box(linear.allocate(64, 8, DebugInfo::none()));
                }
                linear.return_to_marker(DebugInfo::none());
            });
        });

        group.bench_function("multipool", |b| {
            let mut buffer = vec![0u8; mb(1)];
            let mut pool = unsafe { MultipoolAllocator::new(buffer.as_mut_ptr(), mb(1), 2048) };
            let mut ptrs = Vec::with_capacity(count);
            b.iter(|| unsafe {
                for _ in 0..count {
                    ptrs.push(pool.allocate(64, 8, DebugInfo::none()));
                }
                for ptr in ptrs.drain(..).rev() {
                    pool.deallocate(black_box(ptr), DebugInfo::none());
                }
            });
        });

        group.bench_function("bumpalo", |b| {
            let mut bump = Bump::with_capacity(count * 64 + 4096);
            b.iter(|| {
                for _ in 0..count {
                    black_box(bump.alloc([0u8; 64]));
                }
                bump.reset();
            });
        });

        group.bench_function("system_malloc", |b| {
            let mut ptrs = Vec::with_capacity(count);
            b.iter(|| unsafe {
                let layout = Layout::from_size_align(64, 8).unwrap();
                for _ in 0..count {
                    ptrs.push(alloc(layout));
                }
                for ptr in ptrs.drain(..) {
                    dealloc(black_box(ptr), layout);
                }
            });
        });

        group.finish();
    }
}

// =============================================================================
// DISPATCH OVERHEAD
// =============================================================================

fn bench_dispatch(c: &mut Criterion) {
    let mut group = c.benchmark_group("dispatch_overhead");

    let mut buffer = vec![0u8; mb(1)];
    let mut pool = unsafe { MultipoolAllocator::new(buffer.as_mut_ptr(), mb(1), 1024) };

    group.bench_function("direct", |b| {
        b.iter(|| unsafe {
            let ptr = pool.allocate(64, 8, DebugInfo::none());
            pool.deallocate(black_box(ptr), DebugInfo::none());
        });
    });

    let single = unsafe { pool.polymorphic(ConcurrencyMode::SingleThreaded) };
    group.bench_function("handle_single_threaded", |b| {
        b.iter(|| unsafe {
            let ptr = allocate(single, 64, 8);
            deallocate(single, black_box(ptr));
        });
    });

    let shared = single.with_mode(ConcurrencyMode::ThreadSafe);
    group.bench_function("handle_thread_safe", |b| {
        b.iter(|| unsafe {
            let ptr = allocate(shared, 64, 8);
            deallocate(shared, black_box(ptr));
        });
    });

    group.bench_function("handle_malloc", |b| {
        let handle = AllocatorPolymorphic::malloc();
        b.iter(|| unsafe {
            let ptr = allocate(handle, 64, 8);
            deallocate(handle, black_box(ptr));
        });
    });

    group.finish();
}

// =============================================================================
// MULTITHREADED
// =============================================================================

fn bench_multithreaded(c: &mut Criterion) {
    let mut group = c.benchmark_group("multithreaded");
    let allocs_per_thread = 10000usize;

    for num_threads in [2, 4, 8] {
        group.bench_with_input(
            BenchmarkId::new("manager", num_threads),
            &num_threads,
            |b, &num_threads| {
                let mut manager =
                    MemoryManager::new(AllocatorPolymorphic::malloc(), MemoryManagerConfig::default())
                        .unwrap();
                let handle = unsafe { manager.polymorphic(ConcurrencyMode::ThreadSafe) };
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..num_threads {
                            scope.spawn(move || {
                                for _ in 0..allocs_per_thread {
                                    let ptr = allocate(handle, 64, 8);
                                    unsafe { deallocate(handle, black_box(ptr)) };
                                }
                            });
                        }
                    });
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("arena", num_threads),
            &num_threads,
            |b, &num_threads| {
                let info = CreateBaseAllocatorInfo::multipool(kb(256), 256);
                let mut arena = MemoryArena::new(AllocatorPolymorphic::malloc(), 8, &info).unwrap();
                let handle = unsafe { arena.polymorphic(ConcurrencyMode::ThreadSafe) };
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..num_threads {
                            scope.spawn(move || {
                                for _ in 0..allocs_per_thread {
                                    let ptr = allocate(handle, 64, 8);
                                    unsafe { deallocate(handle, black_box(ptr)) };
                                }
                            });
                        }
                    });
                });
            },
        );

        group.bench_with_input(
            BenchmarkId::new("system_malloc", num_threads),
            &num_threads,
            |b, &num_threads| {
                b.iter(|| {
                    std::thread::scope(|scope| {
                        for _ in 0..num_threads {
                            scope.spawn(move || unsafe {
                                let layout = Layout::from_size_align(64, 8).unwrap();
                                for _ in 0..allocs_per_thread {
                                    let ptr = alloc(layout);
                                    dealloc(black_box(ptr), layout);
                                }
                            });
                        }
                    });
                });
            },
        );
    }

    group.finish();
}

criterion_group!(single_alloc, bench_single_alloc);
criterion_group!(batch_alloc, bench_batch);
criterion_group!(overhead, bench_dispatch);
criterion_group!(advanced, bench_multithreaded);

criterion_main!(single_alloc, batch_alloc, overhead, advanced);
