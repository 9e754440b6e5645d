//! Typed observer registry.
//!
//! An [`EventBus`] holds handlers for one event type. Handlers receive the
//! event plus a context value (the store, for store events) and return a
//! `Result`. Dispatch works on a snapshot of the handler list taken before
//! the first call, so a handler may unsubscribe itself or others mid-dispatch
//! without disturbing the iteration.
//!
//! A failing handler (error or panic) is logged and skipped; the remaining
//! handlers for the same event still run.

use std::cell::RefCell;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::rc::{Rc, Weak};

use tracing::warn;

type Handler<E, C> = Rc<dyn Fn(&E, &C) -> anyhow::Result<()>>;

struct Registry<E, C> {
    next_id: u64,
    handlers: Vec<(u64, Handler<E, C>)>,
}

/// Handlers for one event type, dispatched with a context of type `C`.
pub struct EventBus<E, C = ()> {
    registry: Rc<RefCell<Registry<E, C>>>,
}

impl<E: 'static, C: 'static> EventBus<E, C> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            registry: Rc::new(RefCell::new(Registry {
                next_id: 0,
                handlers: Vec::new(),
            })),
        }
    }

    /// Register a handler. It stays registered until the returned
    /// [`Subscription`] is explicitly unsubscribed.
    pub fn subscribe<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&E, &C) -> anyhow::Result<()> + 'static,
    {
        let id = {
            let mut registry = self.registry.borrow_mut();
            let id = registry.next_id;
            registry.next_id += 1;
            registry.handlers.push((id, Rc::new(handler)));
            id
        };

        let weak: Weak<RefCell<Registry<E, C>>> = Rc::downgrade(&self.registry);
        Subscription {
            remove: Some(Box::new(move || {
                if let Some(registry) = weak.upgrade() {
                    registry.borrow_mut().handlers.retain(|(hid, _)| *hid != id);
                }
            })),
        }
    }

    /// Deliver `event` to every handler registered at the moment of the call.
    /// Returns the number of handlers that failed.
    pub fn dispatch(&self, event: &E, ctx: &C) -> usize {
        let snapshot: Vec<(u64, Handler<E, C>)> = self.registry.borrow().handlers.clone();
        let mut failures = 0;

        for (id, handler) in snapshot {
            match catch_unwind(AssertUnwindSafe(|| handler(event, ctx))) {
                Ok(Ok(())) => {}
                Ok(Err(err)) => {
                    failures += 1;
                    warn!(handler = id, error = %err, "event handler failed");
                }
                Err(payload) => {
                    failures += 1;
                    let message = payload
                        .downcast_ref::<&str>()
                        .map(|s| (*s).to_string())
                        .or_else(|| payload.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "unknown panic".to_string());
                    warn!(handler = id, %message, "event handler panicked");
                }
            }
        }

        failures
    }

    /// Number of registered handlers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registry.borrow().handlers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Clones share one handler list.
impl<E, C> Clone for EventBus<E, C> {
    fn clone(&self) -> Self {
        Self {
            registry: Rc::clone(&self.registry),
        }
    }
}

impl<E: 'static, C: 'static> Default for EventBus<E, C> {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[must_use = "dropping a Subscription leaves the handler registered; call unsubscribe() to remove it"]
pub struct Subscription {
    remove: Option<Box<dyn FnOnce()>>,
}

impl Subscription {
    /// Remove the handler. Safe to call from inside a dispatch.
    pub fn unsubscribe(mut self) {
        if let Some(remove) = self.remove.take() {
            remove();
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.remove.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn handlers_receive_events_in_registration_order() {
        let bus: EventBus<u32> = EventBus::new();
        let seen = Rc::new(RefCell::new(Vec::new()));

        let s1 = Rc::clone(&seen);
        let _a = bus.subscribe(move |ev, _| {
            s1.borrow_mut().push(("a", *ev));
            Ok(())
        });
        let s2 = Rc::clone(&seen);
        let _b = bus.subscribe(move |ev, _| {
            s2.borrow_mut().push(("b", *ev));
            Ok(())
        });

        bus.dispatch(&7, &());
        assert_eq!(*seen.borrow(), vec![("a", 7), ("b", 7)]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus: EventBus<u32> = EventBus::new();
        let count = Rc::new(Cell::new(0));
        let c = Rc::clone(&count);
        let sub = bus.subscribe(move |_, _| {
            c.set(c.get() + 1);
            Ok(())
        });
        bus.dispatch(&1, &());
        sub.unsubscribe();
        bus.dispatch(&2, &());
        assert_eq!(count.get(), 1);
        assert!(bus.is_empty());
    }

    #[test]
    fn handler_can_unsubscribe_itself_mid_dispatch() {
        let bus: EventBus<u32> = EventBus::new();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let later = Rc::new(Cell::new(0));

        let slot_in = Rc::clone(&slot);
        let sub = bus.subscribe(move |_, _| {
            if let Some(sub) = slot_in.borrow_mut().take() {
                sub.unsubscribe();
            }
            Ok(())
        });
        *slot.borrow_mut() = Some(sub);

        let later_in = Rc::clone(&later);
        let _other = bus.subscribe(move |_, _| {
            later_in.set(later_in.get() + 1);
            Ok(())
        });

        bus.dispatch(&1, &());
        assert_eq!(later.get(), 1, "second handler still ran in the same dispatch");
        assert_eq!(bus.len(), 1);
        bus.dispatch(&2, &());
        assert_eq!(later.get(), 2);
    }

    #[test]
    fn failing_handlers_are_isolated() {
        let bus: EventBus<u32> = EventBus::new();
        let reached = Rc::new(Cell::new(false));

        let _err = bus.subscribe(|_, _| Err(anyhow::anyhow!("render failed")));
        let _panic = bus.subscribe(|_, _| panic!("boom"));
        let r = Rc::clone(&reached);
        let _ok = bus.subscribe(move |_, _| {
            r.set(true);
            Ok(())
        });

        let failures = bus.dispatch(&1, &());
        assert_eq!(failures, 2);
        assert!(reached.get());
    }

    #[test]
    fn context_is_passed_through() {
        let bus: EventBus<&'static str, Vec<u32>> = EventBus::new();
        let total = Rc::new(Cell::new(0));
        let t = Rc::clone(&total);
        let _s = bus.subscribe(move |_, ctx: &Vec<u32>| {
            t.set(ctx.iter().sum());
            Ok(())
        });
        bus.dispatch(&"sum", &vec![1, 2, 3]);
        assert_eq!(total.get(), 6);
    }
}
