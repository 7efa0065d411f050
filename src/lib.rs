//! # Gantry Motion Core
//!
//! This crate drives a CNC-style gantry through a GRBL 1.1 motion controller
//! over a serial link, moving the tool head to cells of a board addressed by
//! logical identifiers such as `"A1"` or `"H8"`. It is organised as a library
//! so the same core can back the `gantry` CLI, a UI, or tests.
//!
//! ## Crate Structure
//!
//! - **`coordinates`**: Pure mapping between cell ids and physical millimetres
//!   (`CoordinateTransformer`).
//! - **`safety`**: Soft limits and feed clamping (`SafetyValidator`). Always
//!   consulted before a motion frame is built.
//! - **`hardware`**: The serial boundary. `ProtocolController` owns the link,
//!   frames commands, classifies response lines and enforces timeouts;
//!   `MockGrbl` simulates a controller in-process.
//! - **`motion`**: `MotionOrchestrator`, the owner of machine state, plus the
//!   background `StatusPoller`.
//! - **`config`**: Figment-based configuration (TOML + `GANTRY_` environment).
//! - **`logging`**: `tracing-subscriber` setup.
//! - **`error`**: `GantryError` and `ValidationError`.
//!
//! ## Example
//!
//! ```no_run
//! use gantry_motion::config::GantryConfig;
//! use gantry_motion::hardware::SerialPortOpener;
//! use std::sync::Arc;
//!
//! # async fn run() -> gantry_motion::error::AppResult<()> {
//! let config = GantryConfig::default();
//! let gantry = config.build_orchestrator(Arc::new(SerialPortOpener))?;
//!
//! gantry.connect(&config.serial.port, config.serial.baud_rate).await?;
//! gantry.home().await?;
//! gantry.move_to_cell("E4").await?;
//! println!("{}", gantry.get_status());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod coordinates;
pub mod error;
pub mod hardware;
pub mod logging;
pub mod motion;
pub mod safety;

pub use coordinates::{CoordinateFrame, CoordinateTransformer, LogicalCellId, PhysicalPosition};
pub use error::{AppResult, GantryError, ValidationError};
pub use motion::{MachineState, MachineStatus, MotionOrchestrator, StateSnapshot, StatusPoller};
pub use safety::{SafetyValidator, TravelEnvelope};
