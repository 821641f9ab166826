/// Failures reported by a machine backend.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MachineError {
    #[error("Failed to connect to machine: {0}")]
    Connect(String),

    #[error("Failed to read machine position: {0}")]
    Read(String),

    #[error("Machine rejected command: {0}")]
    Actuator(String),
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum InstructionError {
    #[error("Malformed instruction: {0}")]
    Malformed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Instruction(#[from] InstructionError),

    #[error(transparent)]
    Machine(#[from] MachineError),
}
