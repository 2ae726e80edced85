//! # rust_cockpit
//!
//! Microscope control organised in four layers:
//!
//! - **`devices`**: one object per physical instrument. Devices talk to the
//!   hardware through capability traits and create the handlers for what they
//!   can do.
//! - **`handlers`**: uniform control units, each bound to exactly one device
//!   (a camera, one stage axis, a light source, an objective turret, a
//!   deformable mirror).
//! - **`interfaces`**: coordinated capabilities built over handlers of one or
//!   more devices (XYZ stage movement, imaging, objective lookup).
//! - **`gui`**: windows built from the available handlers and interfaces, and
//!   the event loop that executes user commands.
//!
//! The **`depot`** is the registry of devices and their handlers, and
//! **`app`** owns everything and performs the startup sequence. Supporting
//! modules:
//!
//! - **`config`**: the TOML configuration file read at startup.
//! - **`user_config`**: per-user persistent settings.
//! - **`events`**: the publish/subscribe bus connecting the layers.
//! - **`experiment`**: experiments driving the interfaces.
//! - **`error`**: the `CockpitError` enum.
//! - **`logging`**: `tracing` subscriber setup.

pub mod app;
pub mod config;
pub mod depot;
pub mod devices;
pub mod error;
pub mod events;
pub mod experiment;
pub mod gui;
pub mod handlers;
pub mod interfaces;
pub mod logging;
pub mod user_config;
