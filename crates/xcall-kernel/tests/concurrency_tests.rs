//! Concurrency stress tests
//!
//! Refcounts and finalizer triggers are the only state the kernel makes
//! atomic per object; these tests hammer exactly that from several threads.
//!
//! # Running Tests
//! ```bash
//! cargo test -p xcall-kernel --test concurrency_tests
//! ```

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

use common::*;
use xcall_kernel::{method_id, Handle, InstanceState, Kernel, KernelContext};

const THREADS: usize = 8;
const ITERATIONS: usize = 10_000;

// ===== Refcount Stress =====

#[test]
fn test_concurrent_retain_release_on_one_instance() {
    init_logger();
    let kernel = Arc::new(Kernel::new());
    let class = setup_question_taker(&kernel);
    let finalized = Arc::new(AtomicUsize::new(0));
    let args = int_message(&*kernel, 1).unwrap();
    let taker = kernel
        .call_class_constructor(
            class,
            method_id("create_object"),
            Some(counting_finalizer(&finalized)),
            args,
        )
        .unwrap();

    let barrier = Arc::new(Barrier::new(THREADS));
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..ITERATIONS {
                    kernel.retain(Handle::Instance(taker)).unwrap();
                    kernel.release(Handle::Instance(taker)).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(kernel.refcount(Handle::Instance(taker)).unwrap(), 1);
    assert_eq!(finalized.load(Ordering::SeqCst), 0);
    assert_eq!(kernel.instance_state(taker), InstanceState::Live);

    kernel.release(Handle::Instance(taker)).unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}

#[test]
fn test_net_retains_survive_contention() {
    let kernel = Arc::new(Kernel::new());
    let message = kernel.build_message(b"shared").unwrap();

    // Each thread leaves one extra reference behind.
    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                for i in 0..ITERATIONS {
                    kernel.retain(Handle::Message(message)).unwrap();
                    if i + 1 < ITERATIONS {
                        kernel.release(Handle::Message(message)).unwrap();
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(
        kernel.refcount(Handle::Message(message)).unwrap(),
        THREADS + 1
    );
}

#[test]
fn test_racing_final_release_finalizes_once() {
    for _ in 0..50 {
        let kernel = Arc::new(Kernel::new());
        let class = setup_question_taker(&kernel);
        let finalized = Arc::new(AtomicUsize::new(0));
        let args = int_message(&*kernel, 2).unwrap();
        let taker = kernel
            .call_class_constructor(
                class,
                method_id("create_object"),
                Some(counting_finalizer(&finalized)),
                args,
            )
            .unwrap();
        for _ in 1..THREADS {
            kernel.retain(Handle::Instance(taker)).unwrap();
        }

        let barrier = Arc::new(Barrier::new(THREADS));
        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let kernel = Arc::clone(&kernel);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    kernel.release(Handle::Instance(taker)).unwrap();
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(finalized.load(Ordering::SeqCst), 1);
        assert_eq!(kernel.instance_state(taker), InstanceState::Destroyed);
    }
}

// ===== Concurrent Dispatch =====

#[test]
fn test_concurrent_dispatch_on_shared_instance() {
    init_logger();
    let kernel = Arc::new(Kernel::new());
    let class = setup_question_taker(&kernel);
    let args = int_message(&*kernel, 37).unwrap();
    let taker = kernel
        .call_class_constructor(class, method_id("create_object"), None, args)
        .unwrap();

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let kernel = Arc::clone(&kernel);
            thread::spawn(move || {
                for i in 0..200 {
                    let question = format!("q{}-{}", t, i);
                    let args = string_message(&*kernel, &question).unwrap();
                    let answer = kernel
                        .call_instance_method(taker, method_id("ask"), args)
                        .unwrap();
                    let text = read_str(&*kernel, answer, 0).unwrap();
                    assert!(text.ends_with(&question));
                    kernel.release(Handle::Message(answer)).unwrap();
                    kernel.release(Handle::Message(args)).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let stats = kernel.stats();
    assert_eq!(stats.dispatches, 1 + (THREADS * 200) as u64);
    assert_eq!(stats.failed_dispatches, 0);
    // Only the constructor args remain.
    assert_eq!(stats.live_messages, 1);
}

#[test]
fn test_concurrent_construction() {
    let kernel = Arc::new(Kernel::new());
    let class = setup_question_taker(&kernel);
    let finalized = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let kernel = Arc::clone(&kernel);
            let finalized = Arc::clone(&finalized);
            thread::spawn(move || {
                let args = int_message(&*kernel, t as i64).unwrap();
                for _ in 0..500 {
                    let taker = kernel
                        .call_class_constructor(
                            class,
                            method_id("create_object"),
                            Some(counting_finalizer(&finalized)),
                            args,
                        )
                        .unwrap();
                    kernel.release(Handle::Instance(taker)).unwrap();
                }
                kernel.release(Handle::Message(args)).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(finalized.load(Ordering::SeqCst), THREADS * 500);
    let stats = kernel.stats();
    assert_eq!(stats.live_instances, 0);
    assert_eq!(stats.live_messages, 0);
}
