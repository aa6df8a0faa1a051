//! Registration, unregistration and kernel teardown

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::*;
use xcall_kernel::{
    method_id, CallResult, ClassDef, ErrorKind, Handle, InstanceState, Kernel, KernelContext,
    KernelError, MethodDef,
};

// ===== Registration =====

#[test]
fn test_colliding_methods_reject_whole_class() {
    init_logger();
    let kernel = Kernel::new();
    assert_eq!(method_id("method_7188"), method_id("method_46591"));

    let result = kernel.register_class(
        "Colliding",
        vec![
            MethodDef::new("new", |_ctx, _recv, _args| CallResult::new(())),
            MethodDef::new("method_7188", |_ctx, _recv, _args| CallResult::new(())),
        ],
        vec![MethodDef::new("method_46591", |_ctx, _recv, _args| {
            CallResult::error("unreachable")
        })],
    );

    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::MethodIdCollision);
    assert!(err.is_registration_error());
    assert_kind(kernel.lookup("Colliding"), ErrorKind::NotFound);
    assert_eq!(kernel.epoch(), 0);
}

#[test]
fn test_collision_within_one_table() {
    let kernel = Kernel::new();
    let def = ClassDef::new("Colliding")
        .instance_method("method_7188", |_ctx, _recv, _args| CallResult::error("x"))
        .instance_method("method_46591", |_ctx, _recv, _args| CallResult::error("x"));
    assert_kind(kernel.register(def), ErrorKind::MethodIdCollision);
}

#[test]
fn test_duplicate_class_leaves_first_intact() {
    let kernel = Kernel::new();
    let first = kernel.register(question_taker()).unwrap();
    assert_eq!(
        kernel.register(question_taker()).unwrap_err(),
        KernelError::DuplicateClass("Basic::Question::Taker".to_string())
    );
    assert_eq!(kernel.lookup("Basic::Question::Taker").unwrap(), first);
}

#[test]
fn test_unknown_class() {
    let kernel = Kernel::new();
    assert_kind(kernel.lookup("Nope"), ErrorKind::NotFound);
    assert_kind(
        kernel.borrow_class_until_finalized(xcall_kernel::ClassId(42), None),
        ErrorKind::NotFound,
    );
}

#[test]
fn test_kernels_are_independent() {
    let a = Kernel::new();
    let b = Kernel::new();
    a.register(question_taker()).unwrap();

    assert!(a.lookup("Basic::Question::Taker").is_ok());
    assert_kind(b.lookup("Basic::Question::Taker"), ErrorKind::NotFound);
    assert!(b.register(question_taker()).is_ok());
}

// ===== Unregistration =====

#[test]
fn test_unregister_without_references() {
    let kernel = Kernel::new();
    let class = kernel.register(question_taker()).unwrap();
    assert!(kernel.unregister(class).unwrap());
    assert_kind(kernel.lookup("Basic::Question::Taker"), ErrorKind::NotFound);
    assert!(kernel.register(question_taker()).is_ok());
}

#[test]
fn test_unregister_deferred_until_last_instance() {
    init_logger();
    let kernel = Kernel::new();
    let class = kernel.register(question_taker()).unwrap();
    let handle = kernel.borrow_class_until_finalized(class, None).unwrap();
    let args = int_message(&kernel, 3).unwrap();
    let taker = kernel
        .call_class_constructor(handle, method_id("create_object"), None, args)
        .unwrap();

    assert!(!kernel.unregister(class).unwrap());
    assert_kind(kernel.lookup("Basic::Question::Taker"), ErrorKind::NotFound);
    assert_kind(kernel.register(question_taker()), ErrorKind::DuplicateClass);

    // Existing references keep working.
    let question = string_message(&kernel, "Still here?").unwrap();
    let answer = kernel
        .call_instance_method(taker, method_id("ask"), question)
        .unwrap();
    assert!(read_str(&kernel, answer, 0).unwrap().ends_with("Still here?"));

    kernel.release(Handle::Class(handle)).unwrap();
    assert_kind(kernel.register(question_taker()), ErrorKind::DuplicateClass);

    kernel.release(Handle::Instance(taker)).unwrap();
    assert!(kernel.register(question_taker()).is_ok());
}

#[test]
fn test_class_finalizer_runs_once() {
    let kernel = Kernel::new();
    let class = kernel.register(question_taker()).unwrap();
    let finalized = Arc::new(AtomicUsize::new(0));
    let count = Arc::clone(&finalized);

    let handle = kernel
        .borrow_class_until_finalized(
            class,
            Some(Box::new(move |finalized_class| {
                assert_eq!(finalized_class, class);
                count.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    kernel.retain(Handle::Class(handle)).unwrap();
    kernel.release(Handle::Class(handle)).unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 0);

    kernel.release(Handle::Class(handle)).unwrap();
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
    assert_kind(kernel.retain(Handle::Class(handle)), ErrorKind::UseAfterFree);
}

#[test]
fn test_handle_kind_is_checked() {
    let kernel = Kernel::new();
    let message = kernel.build_message(b"x").unwrap();
    let bits = Handle::Message(message).to_bits();

    assert_kind(xcall_kernel::InstanceId::from_bits(bits), ErrorKind::InvalidHandle);
    assert_eq!(Handle::from_bits(bits).unwrap(), Handle::Message(message));
}

// ===== Teardown =====

#[test]
fn test_teardown_finalizes_everything_once() {
    init_logger();
    let kernel = Kernel::new();
    let class = kernel.register(question_taker()).unwrap();
    let instance_finalized = Arc::new(AtomicUsize::new(0));
    let class_finalized = Arc::new(AtomicUsize::new(0));
    let class_count = Arc::clone(&class_finalized);

    let handle = kernel
        .borrow_class_until_finalized(
            class,
            Some(Box::new(move |_| {
                class_count.fetch_add(1, Ordering::SeqCst);
            })),
        )
        .unwrap();
    let args = int_message(&kernel, 8).unwrap();
    let mut instances = Vec::new();
    for _ in 0..10 {
        let taker = kernel
            .call_class_constructor(
                handle,
                method_id("create_object"),
                Some(counting_finalizer(&instance_finalized)),
                args,
            )
            .unwrap();
        // Leaked extra references must not matter.
        kernel.retain(Handle::Instance(taker)).unwrap();
        instances.push(taker);
    }
    // One already gone before teardown.
    kernel.release(Handle::Instance(instances[0])).unwrap();
    kernel.release(Handle::Instance(instances[0])).unwrap();
    assert_eq!(instance_finalized.load(Ordering::SeqCst), 1);
    assert_eq!(kernel.instance_state(instances[0]), InstanceState::Destroyed);

    let stats = kernel.teardown();
    assert_eq!(instance_finalized.load(Ordering::SeqCst), 10);
    assert_eq!(class_finalized.load(Ordering::SeqCst), 1);
    assert_eq!(stats.live_instances, 0);
    assert_eq!(stats.live_class_handles, 0);
    assert_eq!(stats.live_messages, 0);
    assert_eq!(stats.arena_bytes, 0);
    assert_eq!(stats.finalizers_run, 11);
}

#[test]
fn test_drop_runs_teardown() {
    let finalized = Arc::new(AtomicUsize::new(0));
    {
        let kernel = Kernel::new();
        let handle = setup_question_taker(&kernel);
        let args = int_message(&kernel, 1).unwrap();
        kernel
            .call_class_constructor(
                handle,
                method_id("create_object"),
                Some(counting_finalizer(&finalized)),
                args,
            )
            .unwrap();
    }
    assert_eq!(finalized.load(Ordering::SeqCst), 1);
}
