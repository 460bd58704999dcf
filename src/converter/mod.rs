//! Management of the external document-converter processes.
//!
//! [`pool::ConverterPool`] owns one server process per port and hands them
//! out through leases. [`process`] holds the single process-tree termination
//! routine used by conversions, the supervisor and shutdown. [`registry`]
//! lets several service replicas on one host agree on who owns which port.

pub mod command;
pub mod pool;
pub mod process;
pub mod registry;
pub mod worker;
