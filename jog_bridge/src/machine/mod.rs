use std::sync::Arc;

use async_trait::async_trait;

use crate::config::{MachineConfig, MachineKind};
use crate::error::MachineError;
use crate::models::Position;

pub mod grbl;
pub mod simulated;

pub use grbl::GrblMachine;
pub use simulated::SimulatedMachine;

/// The controller the bridge drives. Implementations must tolerate calls
/// from several tasks; the bridge never overlaps two G-code calls itself.
#[async_trait]
pub trait MachineInterface: Send + Sync {
    async fn initialize(&self) -> Result<(), MachineError>;
    async fn read_position(&self) -> Result<Position, MachineError>;
    async fn issue_gcode(&self, line: &str) -> Result<(), MachineError>;
    async fn cancel_motion(&self) -> Result<(), MachineError>;
    async fn shutdown(&self);
}

pub fn create_machine(config: &MachineConfig) -> Arc<dyn MachineInterface> {
    match config.kind {
        MachineKind::Grbl => Arc::new(GrblMachine::from_config(config)),
        MachineKind::Simulated => Arc::new(SimulatedMachine::new()),
    }
}
