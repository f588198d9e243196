//! Probe layer of the scanner: the mutation generators that enumerate
//! Transfer-Encoding / Content-Length perturbations, the CL / TE / H2 / h2c
//! probe state machines with their confirmation retries, cookie acquisition,
//! the per-host orchestrator, and the PoC report writer.

pub mod cl;
pub mod cookies;
pub mod h2;
pub mod host;
pub mod mutation;
pub mod probe;
pub mod report;
pub mod te;
pub mod tunnel;
