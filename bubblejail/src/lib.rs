//! Bubblewrap-based desktop application sandbox launcher.
//!
//! An **instance** is a named directory holding a private sandbox HOME
//! and a declarative `services.toml`. Each activated **service** emits
//! filesystem bindings, environment, D-Bus rules, seccomp rules, and
//! startup hooks; the **merger** folds them into one [`BwrapConfig`],
//! and the **runner** materializes that config into a supervised
//! `bwrap` invocation with an in-sandbox helper as PID 1.
//!
//! The container primitives themselves are delegated to external
//! binaries: `bwrap` for namespaces and mounts, `xdg-dbus-proxy` for
//! bus filtering, and `slirp4netns` / `pasta` for the alternative
//! network stack.

pub mod bwrap;
pub mod compose;
pub mod dbus;
mod error;
pub mod instance;
pub mod namespaces;
pub mod paths;
pub mod profile;
pub mod runner;
pub mod seccomp;
pub mod services;

pub mod desktop;

pub use compose::{compose, BwrapConfig, RunPaths};
pub use error::{Error, Result};
pub use instance::{Instance, InstanceStore, ServicesConfig};
pub use runner::{send_run, Phase, RunOptions, Runner};
pub use services::{Service, ServiceContext, SERVICES};
