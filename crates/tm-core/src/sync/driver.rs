//! Runs a [`SyncEngine`] against a real transport on a single-threaded
//! tokio runtime.
//!
//! Each loop turn flushes the store's queued notifications, polls the
//! engine, starts whatever requests it asks for, then sleeps until one of:
//! a request settles, the store gains pending notifications, the engine's
//! next deadline passes, or shutdown is requested. Push and pull requests
//! are independent and may be in flight together.
//!
//! Store and engine are shared through `Rc<RefCell<_>>`, so the future
//! returned by [`SyncDriver::run`] is `!Send`. Run it with
//! `LocalSet::run_until` or on a current-thread runtime.

use std::cell::RefCell;
use std::future::Future;
use std::rc::Rc;
use std::time::Duration;

use anyhow::Context;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;
use futures::{FutureExt, StreamExt};
use tokio::sync::Notify;
use tracing::debug;

use crate::clock::Clock;
use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::events::Subscription;
use crate::store::TaskStore;
use crate::sync::engine::{SyncAction, SyncEngine, SyncStatus};
use crate::sync::transport::SyncTransport;
use crate::sync::wire::{Endpoint, PullResponse, decode_pull_response, decode_push_response, encode};

/// [`Clock`] that follows tokio's time, so paused-time tests advance it.
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    origin: tokio::time::Instant,
    origin_millis: i64,
}

impl TokioClock {
    /// Anchor runtime time to `origin_millis` on the Unix-epoch scale.
    #[must_use]
    pub fn starting_at(origin_millis: i64) -> Self {
        Self {
            origin: tokio::time::Instant::now(),
            origin_millis,
        }
    }
}

impl Clock for TokioClock {
    fn now_millis(&self) -> i64 {
        let elapsed = i64::try_from(self.origin.elapsed().as_millis()).unwrap_or(i64::MAX);
        self.origin_millis.saturating_add(elapsed)
    }
}

enum Completion {
    Pushed(Result<(), SyncError>),
    Pulled(Result<PullResponse, SyncError>),
}

enum Wake {
    Shutdown,
    Settled(Completion),
    Store,
    Timer,
}

/// Owns the event loop for one store and one transport.
pub struct SyncDriver<T> {
    store: Rc<RefCell<TaskStore>>,
    engine: SyncEngine,
    transport: Rc<T>,
    clock: Rc<dyn Clock>,
    wake: Rc<Notify>,
}

impl<T: SyncTransport + 'static> SyncDriver<T> {
    /// Attach a synchronizer to `store` and install the store's pending
    /// hook so local edits wake the loop.
    pub fn new(
        store: Rc<RefCell<TaskStore>>,
        transport: Rc<T>,
        clock: Rc<dyn Clock>,
        config: SyncConfig,
    ) -> Self {
        let wake = Rc::new(Notify::new());
        let engine = {
            let mut guard = store.borrow_mut();
            let hook = Rc::clone(&wake);
            guard.on_pending(move || hook.notify_one());
            SyncEngine::attach(&guard, config, clock.now_millis())
        };
        Self {
            store,
            engine,
            transport,
            clock,
            wake,
        }
    }

    pub fn subscribe_status<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&SyncStatus) -> anyhow::Result<()> + 'static,
    {
        self.engine.subscribe_status(handler)
    }

    #[must_use]
    pub const fn engine(&self) -> &SyncEngine {
        &self.engine
    }

    /// Force a full diff and an immediate pull on the next turn.
    pub fn refresh(&mut self) {
        let now = self.clock.now_millis();
        self.engine.refresh(&self.store.borrow(), now);
        self.wake.notify_one();
    }

    fn request(&self, action: SyncAction) -> LocalBoxFuture<'static, Completion> {
        let transport = Rc::clone(&self.transport);
        match action {
            SyncAction::Push(batch) => async move {
                let outcome = match encode(&batch.request) {
                    Ok(body) => transport
                        .send(Endpoint::Save, body)
                        .await
                        .and_then(decode_push_response),
                    Err(err) => Err(err),
                };
                Completion::Pushed(outcome)
            }
            .boxed_local(),
            SyncAction::Pull(request) => async move {
                let outcome = match encode(&request) {
                    Ok(body) => transport
                        .send(Endpoint::Tasks, body)
                        .await
                        .and_then(decode_pull_response),
                    Err(err) => Err(err),
                };
                Completion::Pulled(outcome)
            }
            .boxed_local(),
        }
    }

    fn settle(&mut self, completion: Completion) -> anyhow::Result<()> {
        let now = self.clock.now_millis();
        match completion {
            Completion::Pushed(result) => self.engine.push_settled(result, now),
            Completion::Pulled(result) => {
                let mut store = self.store.borrow_mut();
                self.engine
                    .pull_settled(&mut store, result, now)
                    .context("applying pulled records")?;
            }
        }
        Ok(())
    }

    /// Drive synchronization until `shutdown` resolves. Requests still in
    /// flight at shutdown are dropped; their changes stay unsent.
    ///
    /// # Errors
    ///
    /// Only internal invariant violations end the loop early. Transport and
    /// server failures are reported through [`SyncStatus::Error`] and
    /// retried.
    pub async fn run<F>(mut self, shutdown: F) -> anyhow::Result<Self>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);
        let mut in_flight: FuturesUnordered<LocalBoxFuture<'static, Completion>> =
            FuturesUnordered::new();
        let wake = Rc::clone(&self.wake);

        loop {
            let now = self.clock.now_millis();
            let actions = {
                let mut store = self.store.borrow_mut();
                store.flush();
                self.engine.poll(&mut store, now)
            };
            for action in actions {
                in_flight.push(self.request(action));
            }

            if self.store.borrow().has_pending() || self.engine.sync_due() {
                continue;
            }

            let sleep_for = self
                .engine
                .next_deadline()
                .map(|at| Duration::from_millis(u64::try_from(at.saturating_sub(now)).unwrap_or(0)));
            let timer = async move {
                match sleep_for {
                    Some(duration) => tokio::time::sleep(duration).await,
                    None => std::future::pending::<()>().await,
                }
            };

            let woke = tokio::select! {
                biased;
                () = &mut shutdown => Wake::Shutdown,
                Some(done) = in_flight.next(), if !in_flight.is_empty() => Wake::Settled(done),
                () = wake.notified() => Wake::Store,
                () = timer => Wake::Timer,
            };

            match woke {
                Wake::Shutdown => {
                    debug!(abandoned = in_flight.len(), "sync driver stopping");
                    break;
                }
                Wake::Settled(done) => self.settle(done)?,
                Wake::Store | Wake::Timer => {}
            }
        }
        Ok(self)
    }

    /// Hand back the shared store and the engine, e.g. for inspection after
    /// [`SyncDriver::run`] returns.
    pub fn into_parts(self) -> (Rc<RefCell<TaskStore>>, SyncEngine) {
        (self.store, self.engine)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::memory::MemoryRemote;
    use std::cell::Cell;
    use tokio::task::LocalSet;

    const T0: i64 = 1_760_000_000_000;

    fn setup(latency_ms: u64) -> (Rc<RefCell<TaskStore>>, Rc<MemoryRemote>, Rc<dyn Clock>) {
        let clock: Rc<dyn Clock> = Rc::new(TokioClock::starting_at(T0));
        let store = Rc::new(RefCell::new(TaskStore::new(Rc::clone(&clock))));
        let remote = Rc::new(
            MemoryRemote::new(Rc::clone(&clock)).with_latency(Duration::from_millis(latency_ms)),
        );
        (store, remote, clock)
    }

    #[tokio::test(start_paused = true)]
    async fn local_edit_reaches_server_after_debounce() {
        let (store, remote, clock) = setup(10);
        let driver = SyncDriver::new(
            Rc::clone(&store),
            Rc::clone(&remote),
            Rc::clone(&clock),
            SyncConfig::default(),
        );

        let id = {
            let mut s = store.borrow_mut();
            let id = s.create_task();
            s.edit(&id).unwrap().set_title("A");
            id
        };

        let observer = Rc::clone(&remote);
        let shutdown = async move {
            tokio::time::sleep(Duration::from_millis(1_000)).await;
            assert_eq!(observer.stats().rows, 0, "debounce still holding the push");
            tokio::time::sleep(Duration::from_millis(2_000)).await;
        };
        LocalSet::new()
            .run_until(driver.run(shutdown))
            .await
            .unwrap();

        let records = remote.records();
        let record = &records[id.as_str()];
        assert_eq!(record["title"], serde_json::json!("A"));
        assert_eq!(record["version"], serde_json::json!(T0));
        assert_eq!(remote.stats().saves, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn two_clients_converge_through_polling() {
        let (alice, remote, clock) = setup(5);
        let bob = Rc::new(RefCell::new(TaskStore::new(Rc::clone(&clock))));

        let id = {
            let mut s = alice.borrow_mut();
            let id = s.create_task();
            s.edit(&id).unwrap().set_title("shared");
            id
        };

        let config = SyncConfig::default();
        let alice_driver =
            SyncDriver::new(Rc::clone(&alice), Rc::clone(&remote), Rc::clone(&clock), config);
        let bob_driver =
            SyncDriver::new(Rc::clone(&bob), Rc::clone(&remote), Rc::clone(&clock), config);

        let stop = Duration::from_millis(25_000);
        let (a, b) = tokio::join!(
            alice_driver.run(tokio::time::sleep(stop)),
            bob_driver.run(tokio::time::sleep(stop)),
        );
        a.unwrap();
        b.unwrap();

        let bob = bob.borrow();
        assert_eq!(bob.get(&id).unwrap().title(), "shared");
        assert_eq!(bob.get(&id).unwrap().version(), Some(T0));
    }

    #[tokio::test(start_paused = true)]
    async fn failures_surface_as_status_and_recover() {
        let (store, remote, clock) = setup(0);
        remote.set_offline(true);
        let driver = SyncDriver::new(
            Rc::clone(&store),
            Rc::clone(&remote),
            Rc::clone(&clock),
            SyncConfig::default(),
        );

        let errors = Rc::new(Cell::new(0));
        let sink = Rc::clone(&errors);
        let _sub = driver.subscribe_status(move |status| {
            if matches!(status, SyncStatus::Error(err) if err.is_transport()) {
                sink.set(sink.get() + 1);
            }
            Ok(())
        });

        let toggle = Rc::clone(&remote);
        let shutdown = async move {
            tokio::time::sleep(Duration::from_millis(30_000)).await;
            toggle.set_offline(false);
            tokio::time::sleep(Duration::from_millis(25_000)).await;
        };
        let driver = driver.run(shutdown).await.unwrap();

        assert!(errors.get() >= 2, "initial and follow-up pulls failed");
        assert!(remote.stats().pulls >= 1, "polling kept going after the outage");
        assert_eq!(driver.engine().cursor(), crate::sync::wire::SyncCursor::BEGINNING);
    }
}
