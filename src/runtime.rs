//! Process-wide shared context.

use once_cell::sync::Lazy;

use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::context::{Context, ContextOptions};

/// State of the shared runtime lifecycle.
#[derive(Debug)]
enum State {
    /// No runtime handle exists.
    Uninitialized,
    /// The shared context is alive with the given reference count.
    Initialized { refcount: usize, context: Context },
    /// The last handle was dropped and the context is shutting down.
    Destroying,
}

/// Process-global runtime manager.
struct RuntimeManager {
    state: Mutex<State>,
    cv: Condvar,
}

impl RuntimeManager {
    const fn new() -> Self {
        Self {
            state: Mutex::new(State::Uninitialized),
            cv: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn acquire(&self, options: impl FnOnce() -> ContextOptions) -> Context {
        let mut state = self.lock();

        loop {
            match &mut *state {
                State::Uninitialized => {
                    let context = Context::new(options());
                    *state = State::Initialized {
                        refcount: 1,
                        context: context.clone(),
                    };
                    debug!("shared runtime initialized");
                    return context;
                }
                State::Initialized { refcount, context } => {
                    *refcount += 1;
                    return context.clone();
                }
                State::Destroying => {
                    // Wait for the previous context to finish shutting down
                    state = self.cv.wait(state).unwrap_or_else(PoisonError::into_inner);
                }
            }
        }
    }

    fn release(&self) {
        let mut state = self.lock();

        let context = match std::mem::replace(&mut *state, State::Destroying) {
            State::Initialized { refcount, context } if refcount > 1 => {
                *state = State::Initialized {
                    refcount: refcount - 1,
                    context,
                };
                return;
            }
            // We're the last reference, shut the context down
            State::Initialized { context, .. } => context,
            other => {
                // This should never happen in correct usage
                debug_assert!(false, "release() called in invalid state: {other:?}");
                *state = other;
                return;
            }
        };
        drop(state); // Shut down without holding the lock

        context.shutdown();
        drop(context);
        debug!("shared runtime shut down");

        let mut state = self.lock();
        *state = State::Uninitialized;
        self.cv.notify_all();
    }

    fn is_running(&self) -> bool {
        matches!(*self.lock(), State::Initialized { .. })
    }
}

static RUNTIME: Lazy<RuntimeManager> = Lazy::new(RuntimeManager::new);

/// Reference-counted handle to the process-wide [`Context`].
///
/// The first handle creates the shared context; later handles share it.
/// When the last handle is dropped the context is shut down, and the next
/// [`Runtime::new`] starts a fresh one.
///
/// # Examples
///
/// ```
/// use framelatch::Runtime;
///
/// let runtime = Runtime::new();
/// let second = runtime.clone(); // Same context
/// assert!(Runtime::is_running());
///
/// drop(second);
/// drop(runtime);
/// ```
#[derive(Debug)]
pub struct Runtime {
    context: Context,
}

impl Runtime {
    /// Acquires the shared context, creating it with default options if
    /// needed.
    pub fn new() -> Self {
        Self::with_options(ContextOptions::default())
    }

    /// Acquires the shared context. `options` only apply if this call
    /// creates it.
    pub fn with_options(options: ContextOptions) -> Self {
        Self {
            context: RUNTIME.acquire(move || options),
        }
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    /// Checks if the shared context is currently alive.
    pub fn is_running() -> bool {
        RUNTIME.is_running()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::ops::Deref for Runtime {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}

impl Clone for Runtime {
    fn clone(&self) -> Self {
        Self {
            context: RUNTIME.acquire(ContextOptions::default),
        }
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        RUNTIME.release();
    }
}
