pub mod busy_gate;
pub mod command_executor;
pub mod lazy_tcp;
pub mod line_framer;
