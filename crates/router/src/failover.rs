use common::{FailoverError, FallbackMode};
use llm::PrimaryStatus;
use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{info, warn};

/// Which side of the failover machine is serving traffic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ActiveState {
    PrimaryActive,
    AlternateActive,
}

/// Change of the active provider caused by one evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub from: String,
    pub to: String,
}

/// Outcome of one evaluation of the state machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Decision {
    pub provider: String,
    pub state: ActiveState,
    pub transition: Option<Transition>,
}

#[derive(Debug)]
struct FailoverState {
    mode: FallbackMode,
    alternates: Vec<String>,
    rotation_index: usize,
    active: String,
}

/// Owns the failover state. Every mutation happens under one short-lived
/// lock, so concurrent failure observations cannot double-rotate.
#[derive(Debug)]
pub struct FailoverController {
    primary_id: String,
    state: Mutex<FailoverState>,
    total_fallbacks: AtomicU64,
}

impl FailoverController {
    pub fn new(primary_id: &str, mode: FallbackMode, alternates: Vec<String>) -> Self {
        Self {
            primary_id: primary_id.to_string(),
            state: Mutex::new(FailoverState {
                mode,
                alternates,
                rotation_index: 0,
                active: primary_id.to_string(),
            }),
            total_fallbacks: AtomicU64::new(0),
        }
    }

    pub fn primary_id(&self) -> &str {
        &self.primary_id
    }

    pub fn mode(&self) -> FallbackMode {
        self.state.lock().mode
    }

    /// Only `auto` consults the health probe.
    pub fn needs_probe(&self) -> bool {
        self.mode() == FallbackMode::Auto
    }

    pub fn alternates(&self) -> Vec<String> {
        self.state.lock().alternates.clone()
    }

    pub fn active_provider(&self) -> String {
        self.state.lock().active.clone()
    }

    pub fn active_state(&self) -> ActiveState {
        let state = self.state.lock();
        self.state_of(&state.active)
    }

    pub fn rotation_index(&self) -> usize {
        self.state.lock().rotation_index
    }

    /// Primary-to-alternate activations since startup.
    pub fn total_fallbacks(&self) -> u64 {
        self.total_fallbacks.load(Ordering::Relaxed)
    }

    /// Pick the provider for one call.
    ///
    /// `health` is the probe outcome in `auto` mode; `None` keeps the current
    /// choice. Other modes ignore it.
    pub fn evaluate(&self, health: Option<PrimaryStatus>) -> Result<Decision, FailoverError> {
        let mut state = self.state.lock();

        let next = match state.mode {
            FallbackMode::Disabled => self.primary_id.clone(),
            FallbackMode::Forced => Self::select_alternate(&mut state).ok_or_else(|| {
                FailoverError::no_provider("forced failover mode has no alternates configured")
            })?,
            FallbackMode::Auto => match health {
                Some(PrimaryStatus::Up) => self.primary_id.clone(),
                Some(PrimaryStatus::Down) => match Self::select_alternate(&mut state) {
                    Some(alternate) => alternate,
                    None => {
                        warn!("Primary is down and no alternates are configured");
                        self.primary_id.clone()
                    }
                },
                None => state.active.clone(),
            },
        };

        let transition = self.apply(&mut state, next);
        Ok(Decision {
            provider: state.active.clone(),
            state: self.state_of(&state.active),
            transition,
        })
    }

    /// Advance the rotation index (wrapping). An active alternate is replaced
    /// by the newly selected one.
    pub fn rotate(&self) -> Option<Decision> {
        let mut state = self.state.lock();
        if state.alternates.is_empty() {
            return None;
        }

        state.rotation_index = (state.rotation_index + 1) % state.alternates.len();
        let selected = state.alternates[state.rotation_index].clone();
        info!(
            "Alternate rotation advanced to {} ({})",
            state.rotation_index, selected
        );

        let transition = if state.active != self.primary_id {
            self.apply(&mut state, selected)
        } else {
            None
        };

        Some(Decision {
            provider: state.active.clone(),
            state: self.state_of(&state.active),
            transition,
        })
    }

    /// Return to the primary until the next probe says otherwise.
    pub fn restore_primary(&self) -> Result<Decision, FailoverError> {
        let mut state = self.state.lock();
        if state.mode == FallbackMode::Forced {
            return Err(FailoverError::InvalidRequest(
                "cannot restore the primary while failover is forced".to_string(),
            ));
        }

        let transition = self.apply(&mut state, self.primary_id.clone());
        Ok(Decision {
            provider: state.active.clone(),
            state: ActiveState::PrimaryActive,
            transition,
        })
    }

    fn select_alternate(state: &mut FailoverState) -> Option<String> {
        if state.alternates.is_empty() {
            return None;
        }
        // The index only wraps when it is out of bounds at selection time
        if state.rotation_index >= state.alternates.len() {
            state.rotation_index = 0;
        }
        Some(state.alternates[state.rotation_index].clone())
    }

    fn apply(&self, state: &mut FailoverState, next: String) -> Option<Transition> {
        if state.active == next {
            return None;
        }

        let from = std::mem::replace(&mut state.active, next);
        let to = state.active.clone();

        if from == self.primary_id {
            self.total_fallbacks.fetch_add(1, Ordering::Relaxed);
            warn!("Failover activated: {} -> {}", from, to);
        } else if to == self.primary_id {
            info!("Primary restored: {} -> {}", from, to);
        } else {
            info!("Alternate switched: {} -> {}", from, to);
        }

        Some(Transition { from, to })
    }

    fn state_of(&self, provider: &str) -> ActiveState {
        if provider == self.primary_id {
            ActiveState::PrimaryActive
        } else {
            ActiveState::AlternateActive
        }
    }
}
