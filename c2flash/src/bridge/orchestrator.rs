//! Multi-baud installation state machine.

use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use super::{BridgeFlasher, InstallConfig, PortOpener, ResetTiming};
use crate::cancel::{CancelToken, CancellablePort};
use crate::error::{Error, Result};
use crate::image::hex::HexImage;
use crate::port::Port;

/// Orchestrator state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlashState {
    /// Nothing attempted yet.
    Idle,
    /// Opening the connection at this baud rate.
    AttemptingBaud(u32),
    /// Pulsing DTR/RTS to start the bootloader.
    Resetting,
    /// The bridge flasher owns the connection.
    DelegatedFlash,
    /// Evaluating the flasher's result.
    Verifying,
    /// Bridge firmware installed.
    Succeeded,
    /// The current attempt failed and its connection is closed.
    FailedAttempt,
    /// Every baud rate failed.
    ExhaustedFailed,
}

/// How one attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    /// The flasher reported success.
    Succeeded,
    /// The deadline fired before the flasher finished.
    TimedOut,
    /// The operator interrupted the installation.
    Cancelled,
    /// Open, reset or flash failed, or the flasher reported failure.
    Failed(String),
}

/// Record of one baud-rate attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashAttempt {
    /// Baud rate tried.
    pub baud_rate: u32,
    /// Deadline applied to the attempt.
    pub deadline: Duration,
    /// Time the attempt took, teardown included.
    pub elapsed: Duration,
    /// How it ended.
    pub outcome: AttemptOutcome,
}

impl FlashAttempt {
    /// Whether the attempt installed the firmware.
    pub fn succeeded(&self) -> bool {
        self.outcome == AttemptOutcome::Succeeded
    }

    /// The attempt's failure as an error, `None` on success.
    pub fn error(&self) -> Option<Error> {
        let reason = match &self.outcome {
            AttemptOutcome::Succeeded => return None,
            AttemptOutcome::TimedOut => format!("no completion within {:?}", self.deadline),
            AttemptOutcome::Cancelled => "interrupted".to_string(),
            AttemptOutcome::Failed(reason) => reason.clone(),
        };
        Some(Error::FlashAttemptFailed {
            baud: self.baud_rate,
            reason,
        })
    }
}

/// Pulse DTR/RTS low then high and drop whatever the board printed.
pub fn reset_bridge(port: &mut dyn Port, timing: &ResetTiming) -> Result<()> {
    debug!("Resetting bridge on {}", port.name());
    port.set_dtr(false)?;
    port.set_rts(false)?;
    thread::sleep(timing.low);
    port.set_dtr(true)?;
    port.set_rts(true)?;
    thread::sleep(timing.high);
    port.clear_buffers()
}

/// Installs bridge firmware, falling back through the configured baud rates.
pub struct FlashOrchestrator<O: PortOpener, F: BridgeFlasher> {
    opener: O,
    flasher: F,
    config: InstallConfig,
    state: FlashState,
    transitions: Vec<FlashState>,
    attempts: Vec<FlashAttempt>,
}

impl<O: PortOpener, F: BridgeFlasher> FlashOrchestrator<O, F> {
    /// Create an idle orchestrator.
    pub fn new(opener: O, flasher: F, config: InstallConfig) -> Self {
        Self {
            opener,
            flasher,
            config,
            state: FlashState::Idle,
            transitions: Vec::new(),
            attempts: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> FlashState {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn transitions(&self) -> &[FlashState] {
        &self.transitions
    }

    /// Attempts made so far, in order.
    pub fn attempts(&self) -> &[FlashAttempt] {
        &self.attempts
    }

    /// Installation settings.
    pub fn config(&self) -> &InstallConfig {
        &self.config
    }

    /// Install `image`, returning the baud rate that worked.
    ///
    /// Stops at the first successful attempt. Every attempt's connection is
    /// closed before the next one opens, whatever the attempt's outcome.
    pub fn install(&mut self, image: &HexImage) -> Result<u32> {
        let bauds = self.config.bauds.clone();
        for baud in bauds {
            if crate::is_interrupted_requested() {
                return Err(Error::Cancelled);
            }

            info!("Attempting to flash bridge firmware at {baud} baud");
            let started = Instant::now();
            let outcome = self.attempt(baud, image);
            let attempt = FlashAttempt {
                baud_rate: baud,
                deadline: self.config.deadline,
                elapsed: started.elapsed(),
                outcome,
            };

            if attempt.succeeded() {
                self.enter(FlashState::Succeeded);
                info!("Bridge firmware installed at {baud} baud");
                self.attempts.push(attempt);
                return Ok(baud);
            }

            self.enter(FlashState::FailedAttempt);
            if let Some(e) = attempt.error() {
                warn!("{e}");
            }
            let cancelled = attempt.outcome == AttemptOutcome::Cancelled;
            self.attempts.push(attempt);
            if cancelled {
                return Err(Error::Cancelled);
            }
        }

        self.enter(FlashState::ExhaustedFailed);
        Err(Error::FlashExhausted {
            tried: self.config.bauds.clone(),
        })
    }

    fn enter(&mut self, state: FlashState) {
        debug!("Bridge install: {:?} -> {state:?}", self.state);
        self.state = state;
        self.transitions.push(state);
    }

    fn attempt(&mut self, baud: u32, image: &HexImage) -> AttemptOutcome {
        self.enter(FlashState::AttemptingBaud(baud));
        let token = CancelToken::with_deadline(self.config.deadline);

        let port = match self.opener.open(baud) {
            Ok(port) => port,
            Err(e) => return AttemptOutcome::Failed(format!("open failed: {e}")),
        };
        let mut port = CancellablePort::new(port, token.clone());

        let outcome = self.delegate(&mut port, image, &token);
        teardown(&mut port);
        outcome
    }

    fn delegate(
        &mut self,
        port: &mut CancellablePort<O::Port>,
        image: &HexImage,
        token: &CancelToken,
    ) -> AttemptOutcome {
        self.enter(FlashState::Resetting);
        if let Err(e) = reset_bridge(port, &self.config.reset) {
            return AttemptOutcome::Failed(format!("reset failed: {e}"));
        }

        self.enter(FlashState::DelegatedFlash);
        let result = self
            .flasher
            .flash(port, image, self.config.board);

        self.enter(FlashState::Verifying);
        match result {
            Ok(true) => AttemptOutcome::Succeeded,
            Ok(false) => AttemptOutcome::Failed("bootloader reported failure".into()),
            Err(_) if crate::is_interrupted_requested() => AttemptOutcome::Cancelled,
            Err(_) if token.is_expired() => AttemptOutcome::TimedOut,
            Err(e) => AttemptOutcome::Failed(e.to_string()),
        }
    }
}

fn teardown<P: Port>(port: &mut P) {
    if let Err(e) = port.close() {
        warn!("Closing {} failed: {e}", port.name());
    }
}
