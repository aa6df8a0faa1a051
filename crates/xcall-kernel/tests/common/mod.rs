//! Shared helpers for kernel integration tests
//!
//! Arguments use a tiny fixed encoding: integers are little-endian `i64`,
//! strings are a little-endian `u32` byte length followed by UTF-8.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use xcall_kernel::{
    CallResult, ClassDef, ClassHandleId, InstanceFinalizer, Kernel, KernelContext, KernelError,
    KernelResult, MessageId,
};

/// Install a test logger once per test binary
pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn encode_i64(value: i64) -> Vec<u8> {
    value.to_le_bytes().to_vec()
}

pub fn encode_str(value: &str) -> Vec<u8> {
    let mut bytes = (value.len() as u32).to_le_bytes().to_vec();
    bytes.extend_from_slice(value.as_bytes());
    bytes
}

pub fn read_i64(ctx: &dyn KernelContext, message: MessageId, offset: usize) -> KernelResult<i64> {
    let view = ctx.read(message, offset, 8)?;
    let mut word = [0u8; 8];
    word.copy_from_slice(&view);
    Ok(i64::from_le_bytes(word))
}

pub fn read_str(ctx: &dyn KernelContext, message: MessageId, offset: usize) -> KernelResult<String> {
    let header = ctx.read(message, offset, 4)?;
    let mut len = [0u8; 4];
    len.copy_from_slice(&header);
    let len = u32::from_le_bytes(len) as usize;
    let body = ctx.read(message, offset + 4, len)?;
    body.as_str().map(str::to_string)
}

/// Build a sealed message holding one length-prefixed string
pub fn string_message(ctx: &dyn KernelContext, value: &str) -> KernelResult<MessageId> {
    ctx.build_message(&encode_str(value))
}

/// Build a sealed message holding one integer
pub fn int_message(ctx: &dyn KernelContext, value: i64) -> KernelResult<MessageId> {
    ctx.build_message(&encode_i64(value))
}

/// Payload of a `Basic::Question::Taker`
pub struct QuestionTaker {
    pub constructed_with: i64,
}

/// The question-taker class: `create_object(i64)` and `ask(str) -> str`
pub fn question_taker() -> ClassDef {
    ClassDef::new("Basic::Question::Taker")
        .class_method("create_object", |ctx, _recv, args| {
            match read_i64(ctx, args, 0) {
                Ok(value) => CallResult::new(QuestionTaker {
                    constructed_with: value,
                }),
                Err(e) => CallResult::error(e.to_string()),
            }
        })
        .instance_method("ask", |ctx, recv, args| {
            let taker = match recv.and_then(|r| r.downcast::<QuestionTaker>()) {
                Some(taker) => taker,
                None => return CallResult::error("receiver is not a question taker"),
            };
            let question = match read_str(ctx, args, 0) {
                Ok(question) => question,
                Err(e) => return CallResult::error(e.to_string()),
            };
            let answer = format!(
                "I am an instance constructed with create_object(args = {}) and I was asked: {}",
                taker.constructed_with, question
            );
            string_message(ctx, &answer).into()
        })
}

/// Register the question taker and borrow a handle to it
pub fn setup_question_taker(kernel: &Kernel) -> ClassHandleId {
    let class = kernel.register(question_taker()).expect("register");
    kernel
        .borrow_class_until_finalized(class, None)
        .expect("borrow class")
}

/// Finalizer that counts its invocations
pub fn counting_finalizer(count: &Arc<AtomicUsize>) -> InstanceFinalizer {
    let count = Arc::clone(count);
    Box::new(move |_instance, _payload| {
        count.fetch_add(1, Ordering::SeqCst);
    })
}

/// Assert a result is the given error kind
pub fn assert_kind<T: std::fmt::Debug>(result: KernelResult<T>, kind: xcall_kernel::ErrorKind) {
    match result {
        Err(e) => assert_eq!(e.kind(), kind, "unexpected error {}", e),
        Ok(value) => panic!("expected {:?}, got Ok({:?})", kind, value),
    }
}

/// Shorthand for matching a use-after-free failure
pub fn is_use_after_free<T>(result: &KernelResult<T>) -> bool {
    matches!(result, Err(KernelError::UseAfterFree(_)))
}
