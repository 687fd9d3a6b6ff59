//! Integration tests for per-thread error reporting.
//!
//! Validates:
//! - Messages are isolated per calling thread
//! - The handoff pointer stays readable until the next fetch on the same thread
//! - Successful calls clear the slot, failed calls fill it

use std::ffi::CStr;
use std::thread;

use llama_ffi::error_state;
use llama_ffi::ffi::llama_ffi_get_error;
use llama_ffi::FfiError;

fn fetch() -> Option<String> {
    let p = llama_ffi_get_error();
    if p.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(p) }.to_string_lossy().into_owned())
}

#[test]
fn messages_do_not_cross_threads() {
    error_state::set("main thread failure");

    let seen = thread::spawn(|| {
        let before = fetch();
        error_state::set("worker failure");
        (before, fetch())
    })
    .join()
    .unwrap();

    assert_eq!(seen, (None, Some("worker failure".to_string())));
    assert_eq!(fetch().as_deref(), Some("main thread failure"));
    error_state::clear();
}

#[test]
fn many_threads_keep_their_own_message() {
    let handles: Vec<_> = (0..8)
        .map(|i| {
            thread::spawn(move || {
                for round in 0..100 {
                    error_state::set(format!("thread {i} round {round}"));
                    thread::yield_now();
                    assert_eq!(fetch(), Some(format!("thread {i} round {round}")));
                }
            })
        })
        .collect();
    for h in handles {
        h.join().unwrap();
    }
}

#[test]
fn pointer_valid_until_next_fetch() {
    error_state::set("first");
    let first = llama_ffi_get_error();
    // Setting a new message does not touch the handoff buffer.
    error_state::set("second");
    assert_eq!(unsafe { CStr::from_ptr(first) }.to_str().unwrap(), "first");

    let second = llama_ffi_get_error();
    assert_eq!(unsafe { CStr::from_ptr(second) }.to_str().unwrap(), "second");
    error_state::clear();
    assert!(llama_ffi_get_error().is_null());
}

#[test]
fn record_follows_the_last_call() {
    let failed: Option<()> = error_state::record(Err(FfiError::InvalidSession(4)));
    assert!(failed.is_none());
    assert_eq!(fetch().as_deref(), Some("Invalid session handle: 4"));

    assert_eq!(error_state::record(Ok("fine")), Some("fine"));
    assert_eq!(fetch(), None);
}
