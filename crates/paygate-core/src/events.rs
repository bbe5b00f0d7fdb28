//! Observer hooks for gateway components.
//!
//! Components report lifecycle events (circuit transitions, rejected calls)
//! to hooks that operators register for alerting or webhook fan-out. Hooks
//! run inline on the calling task, so a broken hook must not take the proxy
//! pipeline down with it: each hook's panic is caught, logged under the label
//! it was registered with, and counted on the hook set.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};

struct Hook<E> {
    label: &'static str,
    callback: Box<dyn Fn(&E) + Send + Sync>,
}

/// Ordered fan-out of one component's events to named observer hooks.
pub struct Hooks<E> {
    hooks: Vec<Hook<E>>,
    panics: AtomicUsize,
}

impl<E> Hooks<E> {
    /// Creates an empty hook set.
    pub fn new() -> Self {
        Self {
            hooks: Vec::new(),
            panics: AtomicUsize::new(0),
        }
    }

    /// Registers a hook. The label names it in panic reports, so pick
    /// something an operator can act on ("billing-webhook", "pager").
    pub fn attach<F>(&mut self, label: &'static str, callback: F)
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        self.hooks.push(Hook {
            label,
            callback: Box::new(callback),
        });
    }

    /// Delivers `event` to every hook in registration order.
    ///
    /// A panicking hook never stops delivery: the remaining hooks still see
    /// the event, the panic is logged under the hook's label, and
    /// [`panic_count`](Hooks::panic_count) ticks up. The panic payload itself
    /// reaches stderr through the standard panic hook before unwinding stops
    /// here, so the log line only needs to say which hook blew up.
    pub fn dispatch(&self, event: &E) {
        for hook in &self.hooks {
            if catch_unwind(AssertUnwindSafe(|| (hook.callback)(event))).is_err() {
                self.panics.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    hook = hook.label,
                    "component hook panicked; event delivery continues"
                );
            }
        }
    }

    /// Total hook panics observed since construction.
    pub fn panic_count(&self) -> usize {
        self.panics.load(Ordering::Relaxed)
    }

    /// Number of registered hooks.
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    /// Returns true when no hook is registered.
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }
}

impl<E> Default for Hooks<E> {
    fn default() -> Self {
        Self::new()
    }
}
