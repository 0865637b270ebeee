//! C ABI over a tensor engine: LibTorch through `tch` with the `torch`
//! feature, otherwise a small pure-Rust reference engine.
//!
//! Conventions shared by every `ct_*` export:
//!
//! * Objects cross as opaque handles. Each producer pairs with one release
//!   function ([`handle::OWNERSHIP`]); alias handles (views, detached
//!   tensors, iterator batches) are still released on their own.
//! * Fallible calls return a [`Status`]: null on success, otherwise an owned
//!   message the caller frees with [`ct_free_string`]. Results are written to
//!   out-parameters, which are unspecified after a failure.
//! * Arrays go in as pointer plus length and come out through a caller
//!   buffer, its capacity and a reported length.
//! * Panics never unwind into the caller.
//!
//! Handles are not validated beyond null checks unless the `audit` feature is
//! enabled; using a closed handle is undefined behaviour otherwise.

#![allow(clippy::missing_safety_doc)]

pub mod backend;
pub mod data;
pub mod device;
pub mod engine;
pub mod error;
pub mod gc;
pub mod handle;
pub mod init;
pub mod logging;
pub mod ops;
pub mod optim;
pub mod pickle;
pub mod script;
pub mod tensor;

pub use data::LoaderOptions;
pub use engine::{DType, Device, EngineError, Module, Tensor, Value};
pub use error::{ct_free_string, BridgeError, Status};
pub use handle::{
    live_count, ByteBufferHandle, DatasetHandle, DeviceHandle, HandleKind, IteratorHandle,
    LoaderHandle, ModuleHandle, OptimizerHandle, TensorHandle, ValueHandle, OWNERSHIP,
};
