pub mod adapter;
pub mod capture;
pub mod decoder;
pub mod hci;

pub use adapter::power_on_adapters;
pub use capture::{CaptureBuffer, CaptureSession, CaptureSettings};
pub use decoder::{decode_all, AllowList, Rejection};
pub use hci::HciRadio;
