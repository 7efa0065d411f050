//! Motion Controller Hardware Layer
//!
//! Everything that touches the serial link lives here:
//!
//! - `serial`: type-erased async transport and port openers
//! - `response`: GRBL 1.1 line grammar, parsed once at the boundary
//! - `grbl`: `ProtocolController`, the request/response state machine
//! - `mock`: `MockGrbl`, an in-process simulated controller

pub mod grbl;
pub mod mock;
pub mod response;
pub mod serial;

pub use grbl::{Command, ProtocolController, ProtocolSettings};
pub use mock::{MockFault, MockGrbl};
pub use response::{
    describe_alarm, describe_error, ControllerState, Response, ResponseClass, StatusReport,
};
pub use serial::{available_ports, DynSerial, PortOpener, SerialPortIO, SerialPortOpener};

#[cfg(feature = "tokio_serial")]
pub use serial::open_serial_async;
