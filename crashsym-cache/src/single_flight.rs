use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crashsym_table::ModuleKey;
use futures::future::{FutureExt, Shared};
use tokio::sync::oneshot;

use crate::inventory::PinGuard;

type SharedFlight<V> = Shared<oneshot::Receiver<V>>;
type FlightMap<V> = Arc<Mutex<HashMap<ModuleKey, SharedFlight<V>>>>;

/// Ensures that at most one fetch-parse-store sequence runs per key.
///
/// The mutex around the flight map is only held to look up or register a
/// flight. Waiting happens on the flight's shared future.
pub struct SingleFlight<V: Clone> {
    flights: FlightMap<V>,
}

/// The result of [`SingleFlight::begin_or_join`].
pub enum Admission<V: Clone> {
    /// Nobody is working on this key. The caller owns the flight and must
    /// call [`WriteTicket::complete`] when done.
    Exclusive(WriteTicket<V>),
    /// Somebody else is working on this key.
    Wait(PendingFlight<V>),
}

/// Ownership of an in-flight computation for one key.
///
/// Dropping the ticket without completing it wakes all waiters with
/// "abandoned", after which they start over.
pub struct WriteTicket<V: Clone> {
    key: ModuleKey,
    sender: Option<oneshot::Sender<V>>,
    flights: FlightMap<V>,
    pub(crate) pin: Option<PinGuard>,
}

/// A handle on somebody else's in-flight computation.
pub struct PendingFlight<V: Clone> {
    flight: SharedFlight<V>,
}

impl<V: Clone> Default for SingleFlight<V> {
    fn default() -> Self {
        Self {
            flights: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<V: Clone> SingleFlight<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_or_join(&self, key: &ModuleKey) -> Admission<V> {
        let mut flights = self.flights.lock().unwrap();
        if let Some(flight) = flights.get(key) {
            return Admission::Wait(PendingFlight {
                flight: flight.clone(),
            });
        }
        let (sender, receiver) = oneshot::channel();
        flights.insert(key.clone(), receiver.shared());
        Admission::Exclusive(WriteTicket {
            key: key.clone(),
            sender: Some(sender),
            flights: Arc::clone(&self.flights),
            pin: None,
        })
    }

    /// The number of keys with a flight in progress.
    pub fn in_flight_count(&self) -> usize {
        self.flights.lock().unwrap().len()
    }
}

impl<V: Clone> WriteTicket<V> {
    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    /// Hands `outcome` to every waiter, including ones that join after this
    /// call but before the flight is unregistered.
    pub fn complete(mut self, outcome: V) {
        if let Some(sender) = self.sender.take() {
            let _ = sender.send(outcome);
        }
        self.unregister();
    }

    fn unregister(&self) {
        if let Ok(mut flights) = self.flights.lock() {
            flights.remove(&self.key);
        }
    }
}

impl<V: Clone> Drop for WriteTicket<V> {
    fn drop(&mut self) {
        if self.sender.is_some() {
            log::debug!("Flight for {} was abandoned", self.key);
            // Unregister before dropping the sender, so that woken waiters
            // which re-run admission don't find the abandoned flight.
            self.unregister();
            self.sender = None;
        }
    }
}

impl<V: Clone> PendingFlight<V> {
    /// Waits for the owner to finish. Returns `None` if the owner dropped its
    /// ticket without completing it.
    pub async fn wait(self) -> Option<V> {
        self.flight.await.ok()
    }
}
