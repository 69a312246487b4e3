//! Scriptable in-memory transport and a manual clock for tests and demos.
//!
//! [`MockTransport`] plays back per-address scripts for each stage of a call (factory open,
//! channel creation, channel open, invoke). Unscripted stages succeed. Every factory and channel
//! it hands out is counted so tests can assert on lifecycle behavior.

use crate::clock::Clock;
use crate::endpoint::Endpoint;
use crate::error::TransportError;
use crate::invocation::Invocation;
use crate::transport::{Channel, ChannelFactory, CommunicationState, ConstructionContext, Transport};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

/// One scripted outcome.
#[derive(Debug, Clone)]
pub enum Step {
    /// Succeed (invoke answers through the response handler).
    Ok,
    /// Invoke answers with this value. Other stages treat it as `Ok`.
    Reply(Value),
    /// Fail with this error.
    Fail(TransportError),
    /// Never complete.
    Hang,
    /// Sleep, then succeed.
    Delay(Duration),
}

/// Call stage a script applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    FactoryOpen,
    CreateChannel,
    ChannelOpen,
    Invoke,
}

/// Lifecycle counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MockStats {
    pub factories_built: usize,
    pub factories_opened: usize,
    pub factories_closed: usize,
    pub factories_aborted: usize,
    pub channels_created: usize,
    pub channels_opened: usize,
    pub channels_closed: usize,
    pub channels_aborted: usize,
    /// Invocations that reached each address, successful or not.
    pub invocations: BTreeMap<String, usize>,
}

impl MockStats {
    pub fn invocations_at(&self, address: &str) -> usize {
        self.invocations.get(address).copied().unwrap_or(0)
    }

    pub fn total_invocations(&self) -> usize {
        self.invocations.values().sum()
    }
}

type Responder = Arc<dyn Fn(&str, &Invocation) -> Result<Value, TransportError> + Send + Sync>;

#[derive(Default)]
struct Scripts {
    queued: HashMap<(String, Stage), VecDeque<Step>>,
    always: HashMap<(String, Stage), Step>,
    stats: MockStats,
    factories: Vec<Weak<MockFactory>>,
    channels: Vec<Weak<MockChannel>>,
}

struct Shared {
    scripts: Mutex<Scripts>,
    responder: Mutex<Option<Responder>>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Scripts> {
        self.scripts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn next_step(&self, address: &str, stage: Stage) -> Step {
        let mut scripts = self.lock();
        let key = (address.to_string(), stage);
        if let Some(step) = scripts.queued.get_mut(&key).and_then(VecDeque::pop_front) {
            return step;
        }
        scripts.always.get(&key).cloned().unwrap_or(Step::Ok)
    }

    fn respond(&self, address: &str, request: &Invocation) -> Result<Value, TransportError> {
        let responder = self.responder.lock().unwrap_or_else(PoisonError::into_inner).clone();
        match responder {
            Some(respond) => respond(address, request),
            None => Ok(json!({ "served_by": address, "operation": request.operation })),
        }
    }
}

/// Runs a non-invoke step. `Reply` behaves like `Ok`.
async fn play(step: Step) -> Result<(), TransportError> {
    match step {
        Step::Ok | Step::Reply(_) => Ok(()),
        Step::Fail(err) => Err(err),
        Step::Hang => futures::future::pending().await,
        Step::Delay(d) => {
            tokio::time::sleep(d).await;
            Ok(())
        }
    }
}

/// In-memory [`Transport`] driven by per-address scripts.
#[derive(Clone)]
pub struct MockTransport {
    shared: Arc<Shared>,
}

impl fmt::Debug for MockTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockTransport").field("stats", &self.stats()).finish()
    }
}

impl Default for MockTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl MockTransport {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                scripts: Mutex::new(Scripts::default()),
                responder: Mutex::new(None),
            }),
        }
    }

    /// Answer successful invokes with `responder(address, request)` instead of the default echo
    /// (`{"served_by": address, "operation": name}`).
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&str, &Invocation) -> Result<Value, TransportError> + Send + Sync + 'static,
    {
        *self.shared.responder.lock().unwrap_or_else(PoisonError::into_inner) =
            Some(Arc::new(responder));
    }

    /// Queue steps for `stage` at `address`, consumed one per call.
    pub fn script(&self, address: &str, stage: Stage, steps: impl IntoIterator<Item = Step>) {
        self.shared
            .lock()
            .queued
            .entry((address.to_string(), stage))
            .or_default()
            .extend(steps);
    }

    /// Behavior of `stage` at `address` once its queue is empty.
    pub fn always(&self, address: &str, stage: Stage, step: Step) {
        self.shared.lock().always.insert((address.to_string(), stage), step);
    }

    /// Make `address` behave like an unreachable host: opens fail, invokes on already-open
    /// channels fail, and existing factories and channels fault.
    pub fn take_down(&self, address: &str) {
        let not_found = TransportError::EndpointNotFound(address.to_string());
        self.always(address, Stage::FactoryOpen, Step::Fail(not_found.clone()));
        self.always(address, Stage::ChannelOpen, Step::Fail(not_found));
        self.always(
            address,
            Stage::Invoke,
            Step::Fail(TransportError::Communication(format!("{address} went away"))),
        );
        self.fault_factories(address);
    }

    /// Undo [`MockTransport::take_down`] and any other persistent behavior for `address`.
    pub fn bring_up(&self, address: &str) {
        self.shared.lock().always.retain(|(a, _), _| a != address);
    }

    pub fn script_factory_open(&self, address: &str, steps: impl IntoIterator<Item = Step>) {
        self.script(address, Stage::FactoryOpen, steps);
    }

    pub fn script_create_channel(&self, address: &str, steps: impl IntoIterator<Item = Step>) {
        self.script(address, Stage::CreateChannel, steps);
    }

    pub fn script_channel_open(&self, address: &str, steps: impl IntoIterator<Item = Step>) {
        self.script(address, Stage::ChannelOpen, steps);
    }

    pub fn script_invoke(&self, address: &str, steps: impl IntoIterator<Item = Step>) {
        self.script(address, Stage::Invoke, steps);
    }

    /// Move every opened factory at `address` to the faulted state.
    pub fn fault_factories(&self, address: &str) {
        let factories: Vec<_> = self.shared.lock().factories.iter().filter_map(Weak::upgrade).collect();
        for factory in factories.iter().filter(|f| f.address == address) {
            factory.set_state_if(CommunicationState::Opened, CommunicationState::Faulted);
        }
    }

    /// Move every opened channel at `address` to the faulted state.
    pub fn fault_channels(&self, address: &str) {
        let channels: Vec<_> = self.shared.lock().channels.iter().filter_map(Weak::upgrade).collect();
        for channel in channels.iter().filter(|c| c.address == address) {
            channel.set_state_if(CommunicationState::Opened, CommunicationState::Faulted);
        }
    }

    pub fn stats(&self) -> MockStats {
        self.shared.lock().stats.clone()
    }

    /// Channels still alive and in the opened state.
    pub fn open_channels(&self) -> usize {
        self.shared
            .lock()
            .channels
            .iter()
            .filter_map(Weak::upgrade)
            .filter(|c| c.state() == CommunicationState::Opened)
            .count()
    }
}

impl Transport for MockTransport {
    fn create_factory(
        &self,
        _contract: &str,
        endpoint: &Endpoint,
        _context: &ConstructionContext,
    ) -> Result<Arc<dyn ChannelFactory>, TransportError> {
        let factory = Arc::new(MockFactory {
            address: endpoint.address().to_string(),
            shared: self.shared.clone(),
            state: Mutex::new(CommunicationState::Created),
        });
        let mut scripts = self.shared.lock();
        scripts.stats.factories_built += 1;
        scripts.factories.retain(|w| w.strong_count() > 0);
        scripts.factories.push(Arc::downgrade(&factory));
        Ok(factory)
    }
}

fn transition(
    state: &Mutex<CommunicationState>,
    from: CommunicationState,
    to: CommunicationState,
) -> bool {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state == from {
        *state = to;
        true
    } else {
        false
    }
}

fn current(state: &Mutex<CommunicationState>) -> CommunicationState {
    *state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Moves to `Closed` unless already there. Returns whether a transition happened.
fn abort_state(state: &Mutex<CommunicationState>) -> bool {
    let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
    if *state == CommunicationState::Closed {
        false
    } else {
        *state = CommunicationState::Closed;
        true
    }
}

fn unusable(state: CommunicationState) -> TransportError {
    match state {
        CommunicationState::Faulted => TransportError::Faulted,
        _ => TransportError::Disposed,
    }
}

struct MockFactory {
    address: String,
    shared: Arc<Shared>,
    state: Mutex<CommunicationState>,
}

impl fmt::Debug for MockFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockFactory")
            .field("address", &self.address)
            .field("state", &current(&self.state))
            .finish()
    }
}

impl MockFactory {
    fn set_state_if(&self, from: CommunicationState, to: CommunicationState) {
        transition(&self.state, from, to);
    }
}

#[async_trait]
impl ChannelFactory for MockFactory {
    fn state(&self) -> CommunicationState {
        current(&self.state)
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        if !transition(&self.state, CommunicationState::Created, CommunicationState::Opening) {
            return Err(unusable(current(&self.state)));
        }
        let step = self.shared.next_step(&self.address, Stage::FactoryOpen);
        match play(step).await {
            Ok(()) => {
                if transition(&self.state, CommunicationState::Opening, CommunicationState::Opened) {
                    self.shared.lock().stats.factories_opened += 1;
                    Ok(())
                } else {
                    Err(TransportError::Aborted)
                }
            }
            Err(err) => {
                transition(&self.state, CommunicationState::Opening, CommunicationState::Faulted);
                Err(err)
            }
        }
    }

    async fn create_channel(&self) -> Result<Arc<dyn Channel>, TransportError> {
        let state = current(&self.state);
        if state != CommunicationState::Opened {
            return Err(unusable(state));
        }
        let step = self.shared.next_step(&self.address, Stage::CreateChannel);
        play(step).await?;
        let channel = Arc::new(MockChannel {
            address: self.address.clone(),
            shared: self.shared.clone(),
            state: Mutex::new(CommunicationState::Created),
        });
        let mut scripts = self.shared.lock();
        scripts.stats.channels_created += 1;
        scripts.channels.retain(|w| w.strong_count() > 0);
        scripts.channels.push(Arc::downgrade(&channel));
        Ok(channel)
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if transition(&self.state, CommunicationState::Opened, CommunicationState::Closed) {
            self.shared.lock().stats.factories_closed += 1;
            Ok(())
        } else {
            Err(unusable(current(&self.state)))
        }
    }

    fn abort(&self) {
        if abort_state(&self.state) {
            self.shared.lock().stats.factories_aborted += 1;
        }
    }
}

struct MockChannel {
    address: String,
    shared: Arc<Shared>,
    state: Mutex<CommunicationState>,
}

impl fmt::Debug for MockChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MockChannel")
            .field("address", &self.address)
            .field("state", &current(&self.state))
            .finish()
    }
}

impl MockChannel {
    fn set_state_if(&self, from: CommunicationState, to: CommunicationState) {
        transition(&self.state, from, to);
    }
}

#[async_trait]
impl Channel for MockChannel {
    fn state(&self) -> CommunicationState {
        current(&self.state)
    }

    async fn open(&self, _timeout: Duration) -> Result<(), TransportError> {
        if !transition(&self.state, CommunicationState::Created, CommunicationState::Opening) {
            return Err(unusable(current(&self.state)));
        }
        let step = self.shared.next_step(&self.address, Stage::ChannelOpen);
        match play(step).await {
            Ok(()) => {
                if transition(&self.state, CommunicationState::Opening, CommunicationState::Opened) {
                    self.shared.lock().stats.channels_opened += 1;
                    Ok(())
                } else {
                    Err(TransportError::Aborted)
                }
            }
            Err(err) => {
                transition(&self.state, CommunicationState::Opening, CommunicationState::Faulted);
                Err(err)
            }
        }
    }

    async fn invoke(&self, request: &Invocation) -> Result<Value, TransportError> {
        let state = current(&self.state);
        if state != CommunicationState::Opened {
            return Err(unusable(state));
        }
        let step = {
            let mut scripts = self.shared.lock();
            *scripts.stats.invocations.entry(self.address.clone()).or_insert(0) += 1;
            drop(scripts);
            self.shared.next_step(&self.address, Stage::Invoke)
        };
        let outcome = match step {
            Step::Reply(value) => Ok(value),
            other => match play(other).await {
                Ok(()) => self.shared.respond(&self.address, request),
                Err(err) => Err(err),
            },
        };
        if let Err(err) = &outcome {
            if !err.is_fault() {
                self.set_state_if(CommunicationState::Opened, CommunicationState::Faulted);
            }
        }
        outcome
    }

    async fn close(&self, _timeout: Duration) -> Result<(), TransportError> {
        if transition(&self.state, CommunicationState::Opened, CommunicationState::Closed) {
            self.shared.lock().stats.channels_closed += 1;
            Ok(())
        } else {
            Err(unusable(current(&self.state)))
        }
    }

    fn abort(&self) {
        if abort_state(&self.state) {
            self.shared.lock().stats.channels_aborted += 1;
        }
    }
}

/// Manually driven [`Clock`]. Clones share the same time.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<AtomicU64>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.fetch_add(u64::try_from(by.as_millis()).unwrap_or(u64::MAX), Ordering::SeqCst);
    }

    pub fn set_millis(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
