//! Wire framing and protocol state machines for the supported instruments.
//!
//! - [`codec`]: tokio-util codecs turning bytes into [`ProtocolUnit`]s
//! - [`reader`]: RFID reader state machine
//! - [`balance`]: weighing balance state machine, including calibration
//! - [`machine`]: [`DeviceProtocol`], the sum type the session drives
//! - [`tag`]: FDX-B tag code decoding

pub mod balance;
pub mod codec;
pub mod machine;
pub mod reader;
pub mod tag;

pub use balance::BalanceProtocol;
pub use codec::{BalanceCodec, DeviceCodec, ProtocolUnit, ReaderCodec};
pub use machine::{DeviceProtocol, ProtocolState};
pub use reader::ReaderProtocol;
pub use tag::AnimalTag;
