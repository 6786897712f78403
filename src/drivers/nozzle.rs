//! Venturi spray nozzle: an air solenoid and a nutrient solenoid driven
//! through a timed four-phase cycle.
//!
//! ```text
//!            air open          nutrient open      nutrient close      air close
//!  Idle ──────────────▶ Pressurizing ─────────▶ Spraying ──────────▶ Purging ─────────▶ Idle
//!        t = 0            hold pressurize        hold spray           hold purge
//! ```
//!
//! The air valve's open interval always contains the nutrient valve's:
//! nutrient only opens from `Pressurizing` and always closes before air.
//!
//! The first step runs on the caller; the holds and later steps run on a
//! dedicated sequence task.  Every step re-checks a cycle counter under the
//! state lock, and [`stop_spray`](VenturiNozzle::stop_spray) bumps that
//! counter, closes both valves and wakes the task, so a stop always wins
//! over a pending phase timer.  Each transition and its phase event happen
//! under one emit lock, so observers see events in transition order.
//!
//! A nozzle whose valves could not be closed is left `Faulted`: air stays
//! open while nutrient may be open, the nozzle reports active and refuses
//! new cycles until a later stop closes both valves.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use log::{info, warn};
use parking_lot::{Mutex, ReentrantMutex};

use super::task_pin::{Core, spawn_on_core};
use super::{Actuator, DriverContext};
use crate::app::events::{Payload, topics};
use crate::config::ActuatorConfig;
use crate::error::ActuatorError;

pub const KIND: &str = "VenturiNozzle";

/// Spray duration used when the config leaves `pulse_width_ms` at zero.
pub const DEFAULT_SPRAY_MS: u64 = 5_000;

/// Extra time past the nominal cycle before `update()` force-closes it.
pub const OVERRUN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NozzlePhase {
    Idle,
    Pressurizing,
    Spraying,
    Purging,
    /// A close failed; at least one valve is still open.
    Faulted,
}

impl NozzlePhase {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Pressurizing => "pressurizing",
            Self::Spraying => "spraying",
            Self::Purging => "purging",
            Self::Faulted => "faulted",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NozzleTiming {
    pub pressurize: Duration,
    pub spray: Duration,
    pub purge: Duration,
}

impl NozzleTiming {
    pub fn from_config(config: &ActuatorConfig) -> Self {
        Self {
            pressurize: Duration::from_millis(config.pressurize_delay_ms),
            spray: Duration::from_millis(if config.pulse_width_ms == 0 {
                DEFAULT_SPRAY_MS
            } else {
                config.pulse_width_ms
            }),
            purge: Duration::from_millis(config.purge_delay_ms),
        }
    }

    pub fn total(&self) -> Duration {
        self.pressurize + self.spray + self.purge
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Valve {
    Air,
    Nutrient,
}

#[derive(Debug)]
struct NozzleState {
    phase: NozzlePhase,
    air_open: bool,
    nutrient_open: bool,
    /// Incremented by every start and every stop; a sequence task only
    /// acts while the counter still holds the value it was started with.
    cycle: u64,
    cycle_started: Option<Instant>,
}

struct Shared {
    config: ActuatorConfig,
    ctx: DriverContext,
    timing: NozzleTiming,
    /// Held from a transition until its events are published.  Taken
    /// before `state`; re-entrant so bus handlers may stop the nozzle.
    emit: ReentrantMutex<()>,
    state: Mutex<NozzleState>,
}

impl Shared {
    fn pin(&self, valve: Valve) -> i32 {
        match valve {
            Valve::Air => self.config.pin,
            Valve::Nutrient => self.config.aux_pin,
        }
    }

    /// Drive one valve; the tracked state only changes on success.
    fn set_valve(&self, st: &mut NozzleState, valve: Valve, open: bool) -> Result<(), ActuatorError> {
        self.ctx
            .hw
            .digital_write(self.pin(valve), open != self.config.invert_logic)?;
        match valve {
            Valve::Air => st.air_open = open,
            Valve::Nutrient => st.nutrient_open = open,
        }
        Ok(())
    }

    /// Close nutrient, then air once nutrient is known closed.  The phase
    /// becomes `Idle` only when both valves are closed, `Faulted` otherwise.
    /// Returns the topics of the valves closed here, plus the first failure.
    fn force_close(&self, st: &mut NozzleState) -> (Vec<&'static str>, Option<ActuatorError>) {
        let mut closed = Vec::new();
        let mut failure = None;

        let nutrient_was_open = st.nutrient_open;
        match self.set_valve(st, Valve::Nutrient, false) {
            Ok(()) if nutrient_was_open => closed.push(topics::NOZZLE_NUTRIENT_CLOSE),
            Ok(()) => {}
            Err(e) => failure = Some(e),
        }
        if !st.nutrient_open {
            let air_was_open = st.air_open;
            match self.set_valve(st, Valve::Air, false) {
                Ok(()) if air_was_open => closed.push(topics::NOZZLE_AIR_CLOSE),
                Ok(()) => {}
                Err(e) => {
                    failure.get_or_insert(e);
                }
            }
        }

        st.phase = if st.air_open || st.nutrient_open {
            NozzlePhase::Faulted
        } else {
            NozzlePhase::Idle
        };
        st.cycle_started = None;
        (closed, failure)
    }

    fn phase_event(&self, topic: &str, phase: NozzlePhase) {
        self.ctx.announce(
            &self.config.name,
            topic,
            Payload::Nozzle {
                name: self.config.name.clone(),
                phase: phase.as_str().into(),
            },
        );
    }

    /// Perform the transition `from → next` if `cycle` is still current.
    /// Returns `false` when the cycle was cancelled or the step failed.
    fn advance(&self, cycle: u64, from: NozzlePhase) -> bool {
        let (to, valve, open, topic) = match from {
            NozzlePhase::Pressurizing => (NozzlePhase::Spraying, Valve::Nutrient, true, topics::NOZZLE_NUTRIENT_OPEN),
            NozzlePhase::Spraying => (NozzlePhase::Purging, Valve::Nutrient, false, topics::NOZZLE_NUTRIENT_CLOSE),
            NozzlePhase::Purging => (NozzlePhase::Idle, Valve::Air, false, topics::NOZZLE_AIR_CLOSE),
            NozzlePhase::Idle | NozzlePhase::Faulted => return false,
        };

        let _emit = self.emit.lock();
        let mut st = self.state.lock();
        if st.cycle != cycle || st.phase != from {
            return false;
        }
        if let Err(e) = self.set_valve(&mut st, valve, open) {
            st.cycle += 1;
            let (closed, _) = self.force_close(&mut st);
            let phase = st.phase;
            drop(st);
            self.ctx.write_failed(&self.config.name, e);
            for topic in closed {
                self.phase_event(topic, phase);
            }
            if phase == NozzlePhase::Idle {
                self.finished(None);
            }
            return false;
        }
        st.phase = to;
        let elapsed = st.cycle_started.map(|t| t.elapsed());
        if to == NozzlePhase::Idle {
            st.cycle_started = None;
        }
        drop(st);

        self.phase_event(topic, to);
        if to == NozzlePhase::Idle {
            self.finished(elapsed);
        }
        true
    }

    fn finished(&self, elapsed: Option<Duration>) {
        self.ctx.announce(
            &self.config.name,
            topics::ACTUATOR_DEACTIVATED,
            Payload::ActuatorState {
                name: self.config.name.clone(),
                active: false,
                duration_ms: elapsed.map(|d| d.as_millis() as u64),
                level: None,
            },
        );
    }
}

/// Body of the sequence task.
fn run_sequence(shared: &Shared, cycle: u64, cancel: &mpsc::Receiver<()>) {
    let steps = [
        (shared.timing.pressurize, NozzlePhase::Pressurizing),
        (shared.timing.spray, NozzlePhase::Spraying),
        (shared.timing.purge, NozzlePhase::Purging),
    ];
    for (hold, phase) in steps {
        match cancel.recv_timeout(hold) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
        if !shared.advance(cycle, phase) {
            return;
        }
    }
}

pub struct VenturiNozzle {
    shared: Arc<Shared>,
    cancel: Mutex<Option<mpsc::Sender<()>>>,
    ready: AtomicBool,
}

impl VenturiNozzle {
    pub fn new(config: ActuatorConfig, ctx: DriverContext) -> Self {
        let timing = NozzleTiming::from_config(&config);
        Self {
            shared: Arc::new(Shared {
                config,
                ctx,
                timing,
                emit: ReentrantMutex::new(()),
                state: Mutex::new(NozzleState {
                    phase: NozzlePhase::Idle,
                    air_open: false,
                    nutrient_open: false,
                    cycle: 0,
                    cycle_started: None,
                }),
            }),
            cancel: Mutex::new(None),
            ready: AtomicBool::new(false),
        }
    }

    pub fn phase(&self) -> NozzlePhase {
        self.shared.state.lock().phase
    }

    /// `(air_open, nutrient_open)` as last driven.
    pub fn valves(&self) -> (bool, bool) {
        let st = self.shared.state.lock();
        (st.air_open, st.nutrient_open)
    }

    pub fn timing(&self) -> NozzleTiming {
        self.shared.timing
    }

    /// Begin a spray cycle.  Fails with `Busy` if one is already running.
    pub fn start_spray(&self) -> Result<(), ActuatorError> {
        if !self.ready.load(Ordering::Acquire) {
            return Err(ActuatorError::NotInitialized);
        }
        let shared = &self.shared;
        let _emit = shared.emit.lock();
        let cycle = {
            let mut st = shared.state.lock();
            if st.phase != NozzlePhase::Idle {
                return Err(ActuatorError::Busy);
            }
            st.cycle += 1;
            if let Err(e) = shared.set_valve(&mut st, Valve::Air, true) {
                drop(st);
                return Err(shared.ctx.write_failed(&shared.config.name, e));
            }
            st.phase = NozzlePhase::Pressurizing;
            st.cycle_started = Some(Instant::now());
            st.cycle
        };

        let (tx, rx) = mpsc::channel();
        let task_shared = Arc::clone(shared);
        let spawned = spawn_on_core(Core::App, 6, 4, "nozzle-seq\0", move || {
            run_sequence(&task_shared, cycle, &rx);
        });
        if let Err(e) = spawned {
            let (closed, phase) = {
                let mut st = shared.state.lock();
                let (closed, _) = shared.force_close(&mut st);
                (closed, st.phase)
            };
            for topic in closed {
                shared.phase_event(topic, phase);
            }
            return Err(shared.ctx.write_failed(&shared.config.name, ActuatorError::Spawn(e.to_string())));
        }
        // A previous, already-finished sequence's sender is simply dropped.
        *self.cancel.lock() = Some(tx);

        info!("Nozzle '{}': spray cycle {cycle} started", shared.config.name);
        shared.phase_event(topics::NOZZLE_AIR_OPEN, NozzlePhase::Pressurizing);
        shared.ctx.announce(
            &shared.config.name,
            topics::ACTUATOR_ACTIVATED,
            Payload::actuator_state(&shared.config.name, true),
        );
        Ok(())
    }

    /// Close both valves now and return to `Idle`, whatever the phase.
    /// If a valve cannot be closed the nozzle stays `Faulted` and active.
    pub fn stop_spray(&self) -> Result<(), ActuatorError> {
        let shared = &self.shared;
        let _emit = shared.emit.lock();
        let (was_active, elapsed, closed, phase, failure) = {
            let mut st = shared.state.lock();
            st.cycle += 1;
            let was_active = st.phase != NozzlePhase::Idle;
            let elapsed = st.cycle_started.map(|t| t.elapsed());
            let (closed, failure) = shared.force_close(&mut st);
            (was_active, elapsed, closed, st.phase, failure)
        };
        if let Some(tx) = self.cancel.lock().take() {
            let _ = tx.send(());
        }

        for topic in closed {
            shared.phase_event(topic, phase);
        }
        if was_active && phase == NozzlePhase::Idle {
            info!("Nozzle '{}': spray stopped", shared.config.name);
            shared.finished(elapsed);
        }
        match failure {
            Some(e) => Err(shared.ctx.write_failed(&shared.config.name, e)),
            None => Ok(()),
        }
    }
}

impl Actuator for VenturiNozzle {
    fn config(&self) -> &ActuatorConfig {
        &self.shared.config
    }

    fn begin(&self) -> Result<(), ActuatorError> {
        let shared = &self.shared;
        shared.ctx.hw.configure_output(shared.config.pin)?;
        shared.ctx.hw.configure_output(shared.config.aux_pin)?;
        {
            let mut st = shared.state.lock();
            shared.set_valve(&mut st, Valve::Nutrient, false)?;
            shared.set_valve(&mut st, Valve::Air, false)?;
        }
        self.ready.store(true, Ordering::Release);
        info!(
            "Nozzle '{}' ready (air GPIO{}, nutrient GPIO{}, {}/{}/{} ms)",
            shared.config.name,
            shared.config.pin,
            shared.config.aux_pin,
            shared.timing.pressurize.as_millis(),
            shared.timing.spray.as_millis(),
            shared.timing.purge.as_millis()
        );
        Ok(())
    }

    fn activate(&self) -> Result<(), ActuatorError> {
        self.start_spray()
    }

    fn deactivate(&self) -> Result<(), ActuatorError> {
        self.stop_spray()
    }

    fn emergency_stop(&self) -> Result<(), ActuatorError> {
        self.stop_spray()
    }

    fn is_active(&self) -> bool {
        self.phase() != NozzlePhase::Idle
    }

    fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    fn update(&self) {
        let overrun = {
            let st = self.shared.state.lock();
            st.phase != NozzlePhase::Idle
                && st
                    .cycle_started
                    .is_some_and(|t| t.elapsed() > self.shared.timing.total() + OVERRUN_GRACE)
        };
        if overrun {
            warn!(
                "Nozzle '{}': cycle overran, forcing valves closed",
                self.shared.config.name
            );
            let _ = self.stop_spray();
        }
    }

    fn shutdown(&self) {
        let _ = self.stop_spray();
        self.ready.store(false, Ordering::Release);
    }
}
