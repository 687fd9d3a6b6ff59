//! Per-thread error reporting for foreign callers.
//!
//! Each calling thread owns one message slot and one handoff buffer. A
//! pointer returned by [`store`] stays valid until the next [`store`] on the
//! same thread; nothing another thread does can free it.

use std::cell::RefCell;
use std::ffi::{c_char, CString};
use std::ptr;

use crate::error::Result;

thread_local! {
    static LAST_ERROR: RefCell<Option<String>> = const { RefCell::new(None) };
    static HANDOFF: RefCell<Option<CString>> = const { RefCell::new(None) };
}

/// Record `message` as the calling thread's last error.
pub fn set(message: impl Into<String>) {
    let message = message.into();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(message));
}

/// The calling thread's last error, if any.
pub fn get() -> Option<String> {
    LAST_ERROR.with(|slot| slot.borrow().clone())
}

pub fn clear() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Copy `message` into this thread's handoff buffer and return a pointer to
/// it, or null for `None`. The previous buffer is freed first.
pub fn store(message: Option<&str>) -> *const c_char {
    HANDOFF.with(|buf| {
        let mut buf = buf.borrow_mut();
        *buf = message.map(to_c_string);
        buf.as_ref().map_or(ptr::null(), |s| s.as_ptr())
    })
}

/// Clear the slot on success, record the message on failure.
pub fn record<T>(result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => {
            clear();
            Some(value)
        }
        Err(e) => {
            tracing::warn!(error = %e, "boundary call failed");
            set(e.to_string());
            None
        }
    }
}

/// Interior NULs would truncate the message on the C side; drop them.
fn to_c_string(message: &str) -> CString {
    CString::new(message.replace('\0', "")).unwrap_or_default()
}
