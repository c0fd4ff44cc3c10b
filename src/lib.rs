//! par3rs - PAR3 recovery-set creation, verification, and repair
//!
//! A Parchive v3 encoder/decoder: it protects files and directories
//! against loss or corruption by creating recovery files, verifies the
//! protected set, and reconstructs missing or damaged files from any
//! sufficient mixture of surviving inputs and recovery data.
//!
//! ## Recovery codes
//!
//! Two Reed-Solomon engines are provided: a Cauchy-matrix code over
//! GF(2^8)/GF(2^16) for small sets, and an additive-FFT code with optional
//! cohort interleaving for large ones. The field is selected automatically
//! from the set geometry.
//!
//! ## Container
//!
//! All metadata and recovery data travel in self-describing, checksummed
//! packets (see [`packets`]); metadata packets are duplicated across every
//! generated file so any single surviving volume can describe the whole
//! set.

pub mod args;
pub mod block;
pub mod checksum;
pub mod codec;
pub mod creator;
pub mod domain;
pub mod error;
pub mod file_ops;
pub mod galois;
pub mod map;
pub mod packets;
pub mod paths;
pub mod repair;
pub mod verify;

pub use error::{Error, Result};
pub use verify::{VerifyOptions, VerifyReport, VerifyVerdict};
