//! `extern "C"` surface.
//!
//! Every function takes and returns only integers, floats, booleans and raw
//! buffers. Handles are registry indices, never pointers. Fallible calls
//! clear the calling thread's error slot on success and fill it on failure
//! (read it with [`llama_ffi_get_error`]); buffer-too-small results are not
//! failures and leave the slot clear.
//!
//! See `include/llama_ffi.h` for the C declarations.

use std::ffi::{c_char, c_void, CStr};
use std::path::Path;
use std::slice;

use llama_engine::SamplingConfig;
use llama_runtime::{Handle, INVALID_HANDLE};

use crate::error::{FfiError, Result};
use crate::error_state;
use crate::logging;
use crate::runtime::{self, NextOutput, ProgressFn, Runtime, TokenizeOutput};

/// C progress callback: fraction in `[0, 1]` plus the caller's user data.
/// Returning `false` requests cancellation.
pub type ProgressCallback = unsafe extern "C" fn(progress: f32, user_data: *mut c_void) -> bool;

/// A C callback bundled with its user data so it can ride to the executor
/// thread.
struct ForeignProgress {
    callback: ProgressCallback,
    user_data: *mut c_void,
}

// SAFETY: the caller of `llama_ffi_load_model` guarantees the callback and
// its user data may be used from another thread until the call returns, and
// the load blocks until the executor is done with them.
unsafe impl Send for ForeignProgress {}

impl ForeignProgress {
    fn report(&self, fraction: f32) -> bool {
        unsafe { (self.callback)(fraction, self.user_data) }
    }

    fn into_progress_fn(self) -> ProgressFn {
        Box::new(move |fraction| self.report(fraction))
    }
}

fn with_runtime<T>(f: impl FnOnce(&Runtime) -> Result<T>) -> Option<T> {
    error_state::record(runtime::get().and_then(f))
}

fn non_negative(value: i32, what: &str) -> Result<usize> {
    usize::try_from(value).map_err(|_| FfiError::InvalidInput(format!("{what} must be >= 0, got {value}")))
}

fn clamp_count(n: usize) -> i32 {
    i32::try_from(n).unwrap_or(i32::MAX)
}

// ---------- Error handling ----------

/// Last error message for the calling thread, or null. Valid until the next
/// `llama_ffi_get_error` call on the same thread.
#[no_mangle]
pub extern "C" fn llama_ffi_get_error() -> *const c_char {
    error_state::store(error_state::get().as_deref())
}

// ---------- Lifecycle ----------

/// Install the log subscriber and check that a backend registered a runtime.
#[no_mangle]
pub extern "C" fn llama_ffi_init() -> bool {
    with_runtime(|rt| {
        logging::init(&rt.config().log_filter);
        Ok(())
    })
    .is_some()
}

/// Free every session and model.
#[no_mangle]
pub extern "C" fn llama_ffi_shutdown() {
    with_runtime(|rt| {
        rt.shutdown();
        Ok(())
    });
}

// ---------- Models ----------

/// Load the model directory at `model_path`.
///
/// Returns a model handle, or `LLAMA_FFI_INVALID_HANDLE` on failure.
///
/// # Safety
/// `model_path` must be null or a NUL-terminated string. `progress_cb` and
/// `user_data` must stay valid for the duration of the call and tolerate
/// being invoked from another thread.
#[no_mangle]
pub unsafe extern "C" fn llama_ffi_load_model(
    model_path: *const c_char,
    progress_cb: Option<ProgressCallback>,
    user_data: *mut c_void,
) -> Handle {
    if model_path.is_null() {
        error_state::set("model_path is NULL");
        return INVALID_HANDLE;
    }
    let path = match unsafe { CStr::from_ptr(model_path) }.to_str() {
        Ok(path) => path,
        Err(e) => {
            error_state::set(format!("model_path is not UTF-8: {e}"));
            return INVALID_HANDLE;
        }
    };
    let progress = progress_cb.map(|callback| {
        ForeignProgress {
            callback,
            user_data,
        }
        .into_progress_fn()
    });

    with_runtime(|rt| rt.load_model(Path::new(path), progress)).unwrap_or(INVALID_HANDLE)
}

#[no_mangle]
pub extern "C" fn llama_ffi_free_model(model: Handle) {
    with_runtime(|rt| rt.free_model(model));
}

/// Shareable identity of a model, or -1 for an invalid handle.
#[no_mangle]
pub extern "C" fn llama_ffi_model_get_id(model: Handle) -> i64 {
    with_runtime(|rt| rt.model_id(model)).unwrap_or(-1)
}

/// Handle of the live model with identity `model_id`.
#[no_mangle]
pub extern "C" fn llama_ffi_model_from_id(model_id: i64) -> Handle {
    with_runtime(|rt| rt.model_from_id(model_id)).unwrap_or(INVALID_HANDLE)
}

// ---------- Sessions ----------

/// Create a generation session. `max_tokens` caps the KV window (0 = model
/// default).
#[no_mangle]
pub extern "C" fn llama_ffi_create_session(model: Handle, max_tokens: i32) -> Handle {
    with_runtime(|rt| rt.create_session(model, non_negative(max_tokens, "max_tokens")?))
        .unwrap_or(INVALID_HANDLE)
}

#[no_mangle]
pub extern "C" fn llama_ffi_free_session(session: Handle) {
    with_runtime(|rt| rt.free_session(session));
}

#[no_mangle]
pub extern "C" fn llama_ffi_reset_session(session: Handle) -> bool {
    with_runtime(|rt| rt.reset_session(session)).is_some()
}

// ---------- Tokenization ----------

/// Tokenize `text_len` bytes of UTF-8 `text`.
///
/// Returns the token count; with a null `out_tokens` nothing is written.
/// If `max_tokens` is too small, returns the negated required size, never
/// above -2 so it stays distinct from the error sentinel. -1 on error.
///
/// # Safety
/// `text` must point to `text_len` readable bytes. `out_tokens` must be null
/// or point to `max_tokens` writable `int32_t`s.
#[no_mangle]
pub unsafe extern "C" fn llama_ffi_tokenize(
    model: Handle,
    text: *const c_char,
    text_len: i32,
    out_tokens: *mut i32,
    max_tokens: i32,
    add_special: bool,
) -> i32 {
    let result = with_runtime(|rt| {
        if text.is_null() {
            return Err(FfiError::InvalidInput("text is NULL".into()));
        }
        let len = non_negative(text_len, "text_len")?;
        let bytes = unsafe { slice::from_raw_parts(text.cast::<u8>(), len) };
        let text = std::str::from_utf8(bytes)
            .map_err(|e| FfiError::InvalidInput(format!("text is not UTF-8: {e}")))?;

        if out_tokens.is_null() {
            return rt.tokenize(model, text, add_special).map(|t| clamp_count(t.len()));
        }
        let capacity = non_negative(max_tokens, "max_tokens")?;
        Ok(match rt.tokenize_into(model, text, add_special, capacity)? {
            TokenizeOutput::TooSmall(required) => -clamp_count(required),
            TokenizeOutput::Tokens(tokens) => {
                let out = unsafe { slice::from_raw_parts_mut(out_tokens, tokens.len()) };
                out.copy_from_slice(&tokens);
                clamp_count(tokens.len())
            }
        })
    });
    result.unwrap_or(-1)
}

/// Whether `token` ends generation for `model`.
#[no_mangle]
pub extern "C" fn llama_ffi_is_eog(model: Handle, token: i32) -> bool {
    with_runtime(|rt| rt.is_end_of_generation(model, token)).unwrap_or(false)
}

// ---------- Generation ----------

/// Prime `session` with `token_count` tokens, reusing its cache where the
/// prefix matches.
///
/// Pass `temperature <= 0` for greedy, `top_p = 1`, `top_k = 0`, `min_p = 0`
/// and `repeat_penalty = 1` to disable the respective filters, `seed = 0` for
/// a non-deterministic seed.
///
/// # Safety
/// `tokens` must point to `token_count` readable `int32_t`s.
#[no_mangle]
#[allow(clippy::too_many_arguments)]
pub unsafe extern "C" fn llama_ffi_generate_begin(
    session: Handle,
    tokens: *const i32,
    token_count: i32,
    temperature: f32,
    top_p: f32,
    top_k: i32,
    min_p: f32,
    repeat_penalty: f32,
    repeat_window: i32,
    seed: i32,
) -> bool {
    with_runtime(|rt| {
        let count = non_negative(token_count, "token_count")?;
        if tokens.is_null() || count == 0 {
            return Err(FfiError::InvalidInput("tokens is NULL or empty".into()));
        }
        let tokens = unsafe { slice::from_raw_parts(tokens, count) };
        let sampling = SamplingConfig {
            temperature,
            top_p,
            top_k: usize::try_from(top_k).unwrap_or(0),
            min_p,
            repeat_penalty,
            repeat_window: usize::try_from(repeat_window).unwrap_or(0),
            seed: u64::from(seed as u32),
        };
        rt.begin_generation(session, tokens, sampling).map(drop)
    })
    .is_some()
}

/// Pull the next token's bytes into `buf`.
///
/// Returns the byte count (> 0), 0 when the token has no bytes to emit, -1
/// when generation is complete or on error, or the negated required size
/// (< -1) when `buf_len` is too small. Bytes that did not fit are returned by
/// the next call.
///
/// # Safety
/// `buf` must be null or point to `buf_len` writable bytes.
#[no_mangle]
pub unsafe extern "C" fn llama_ffi_generate_next(
    session: Handle,
    buf: *mut c_char,
    buf_len: i32,
) -> i32 {
    let result = with_runtime(|rt| {
        let out: &mut [u8] = if buf.is_null() {
            &mut []
        } else {
            let len = non_negative(buf_len, "buf_len")?;
            unsafe { slice::from_raw_parts_mut(buf.cast::<u8>(), len) }
        };
        Ok(match rt.next_token(session, out)? {
            NextOutput::Written(n) => clamp_count(n),
            NextOutput::Empty => 0,
            NextOutput::Done => -1,
            NextOutput::TooSmall(required) => -clamp_count(required),
        })
    });
    result.unwrap_or(-1)
}

// ---------- KV cache ----------

/// Positions currently cached, or -1 for an invalid handle.
#[no_mangle]
pub extern "C" fn llama_ffi_cache_token_count(session: Handle) -> i32 {
    with_runtime(|rt| rt.cache_token_count(session).map(clamp_count)).unwrap_or(-1)
}

/// Drop the newest `n` cached positions. Returns how many were dropped, or -1.
#[no_mangle]
pub extern "C" fn llama_ffi_cache_trim_end(session: Handle, n: i32) -> i32 {
    with_runtime(|rt| rt.trim_cache_end(session, non_negative(n, "n")?).map(clamp_count))
        .unwrap_or(-1)
}

/// Evict the oldest `n` cached positions. Returns how many were evicted, or -1.
#[no_mangle]
pub extern "C" fn llama_ffi_cache_trim_front(session: Handle, n: i32) -> i32 {
    with_runtime(|rt| rt.trim_cache_front(session, non_negative(n, "n")?).map(clamp_count))
        .unwrap_or(-1)
}
