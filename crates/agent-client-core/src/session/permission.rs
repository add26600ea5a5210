//! Permission gate
//!
//! Tracks the single outstanding permission request of a session. While a
//! request is pending new prompts are refused; mode/model switches and
//! cancellation stay available.

use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::session::types::PermissionRequest;

#[derive(Debug, Clone, Default, PartialEq)]
pub enum GateState {
    #[default]
    Idle,
    Pending(PermissionRequest),
}

#[derive(Debug, Default)]
pub struct PermissionGate {
    state: GateState,
}

impl PermissionGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &GateState {
        &self.state
    }

    pub fn pending(&self) -> Option<&PermissionRequest> {
        match &self.state {
            GateState::Idle => None,
            GateState::Pending(request) => Some(request),
        }
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, GateState::Idle)
    }

    /// Enter `pending`. A second request while one is pending means the
    /// adapter broke the protocol.
    pub fn register(&mut self, request: PermissionRequest) -> Result<()> {
        if let GateState::Pending(current) = &self.state {
            warn!(
                pending = %current.request_id,
                rejected = %request.request_id,
                "Permission request arrived while another is pending"
            );
            return Err(Error::ProtocolViolation(format!(
                "permission request {} arrived while {} is pending",
                request.request_id, current.request_id
            )));
        }
        debug!(request_id = %request.request_id, "Permission requested");
        self.state = GateState::Pending(request);
        Ok(())
    }

    /// Fails with `PermissionPending` unless idle
    pub fn ensure_idle(&self) -> Result<()> {
        if self.is_idle() {
            Ok(())
        } else {
            Err(Error::PermissionPending)
        }
    }

    fn matching(&self, request_id: &str) -> Result<&PermissionRequest> {
        match &self.state {
            GateState::Pending(request) if request.request_id == request_id => Ok(request),
            _ => Err(Error::UnknownPermission(request_id.to_string())),
        }
    }

    /// Check an approval without changing state
    pub fn validate_approval(&self, request_id: &str, option_id: &str) -> Result<()> {
        let request = self.matching(request_id)?;
        if request.option(option_id).is_none() {
            return Err(Error::InvalidOption {
                request_id: request_id.to_string(),
                option_id: option_id.to_string(),
            });
        }
        Ok(())
    }

    /// Resolve with one of the request's options
    pub fn approve(&mut self, request_id: &str, option_id: &str) -> Result<PermissionRequest> {
        self.validate_approval(request_id, option_id)?;
        self.resolve(request_id)
    }

    pub fn reject(&mut self, request_id: &str) -> Result<PermissionRequest> {
        self.resolve(request_id)
    }

    /// Force-resolve because the turn was cancelled or failed
    pub fn cancel(&mut self) -> Option<PermissionRequest> {
        match std::mem::take(&mut self.state) {
            GateState::Idle => None,
            GateState::Pending(request) => {
                debug!(request_id = %request.request_id, "Permission request cancelled");
                Some(request)
            }
        }
    }

    fn resolve(&mut self, request_id: &str) -> Result<PermissionRequest> {
        match std::mem::take(&mut self.state) {
            GateState::Pending(request) if request.request_id == request_id => Ok(request),
            other => {
                self.state = other;
                Err(Error::UnknownPermission(request_id.to_string()))
            }
        }
    }
}
