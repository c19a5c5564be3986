//! Wire-level constants for the two supported instruments and the default
//! timing used by the session manager.
//!
//! # RFID reader (MULTITAG-125)
//!
//! Commands are single characters and are never followed by a terminator:
//! the reader treats any further character, including `\n`, as a request to
//! abort an in-progress continuous read.
//!
//! ```text
//! host -> 'x'          reader -> "MULTITAG-125 01" CR LF
//! host -> 'c'          reader -> "Z5A2080A70C2C0001" CR LF ...
//! host -> 'p'          reader -> "S" CR LF
//! ```
//!
//! # Balance (AD105 digital transducer)
//!
//! Commands are ASCII terminated by `;`. Replies are terminated by CR LF.
//!
//! ```text
//! host -> "COF3;"      balance -> "0"
//! host -> "IDN?;"      balance -> identification string
//! host -> "ESR?;"      balance -> "000"
//! host -> "ICR4;"      balance -> "0"
//! host -> "MSV?5;"     balance -> five numeric lines
//! host -> "STP;"       (no reply, ends an ongoing MSV? batch)
//! host -> "RES;"       (no reply, warm restart takes up to 3 s)
//! ```
//!
//! # Usage
//!
//! ```
//! use weigh_core::constants::*;
//!
//! assert_eq!(READER_CMD_START, b'c');
//! assert_eq!(BALANCE_TERMINATOR, b';');
//! ```

use std::time::Duration;

// ============================================================================
// RFID reader
// ============================================================================

/// Reset the reader. Replies with the [`READER_BANNER_PREFIX`] banner.
pub const READER_CMD_RESET: u8 = b'x';

/// Start continuous reading. Tag codes follow, one per line.
pub const READER_CMD_START: u8 = b'c';

/// Stop reading (antenna power off). Replies with `S`.
pub const READER_CMD_STOP: u8 = b'p';

/// Reply: the command was not understood.
pub const READER_REPLY_INVALID: &str = "?";

/// Reply: the command was understood but not executed.
pub const READER_REPLY_NOT_EXECUTED: &str = "N";

/// Reply: continuous read stopped.
pub const READER_REPLY_STOPPED: &str = "S";

/// Reply: antenna switched off.
pub const READER_REPLY_ANTENNA_OFF: &str = "P";

/// Prefix of the banner sent after a reset (full banner: `MULTITAG-125 01`).
pub const READER_BANNER_PREFIX: &str = "MULTITAG";

/// Marker byte starting an FDX-B tag code.
pub const TAG_PREFIX: char = 'Z';

/// Number of hex digits following [`TAG_PREFIX`] in a tag code.
pub const TAG_HEX_DIGITS: usize = 16;

/// Longest line the reader is expected to send. Anything longer without a
/// terminator is treated as a malformed frame.
pub const READER_MAX_LINE: usize = 64;

// ============================================================================
// Balance
// ============================================================================

/// Command terminator sent to the balance.
pub const BALANCE_TERMINATOR: u8 = b';';

/// Warm restart, no reply.
pub const BALANCE_CMD_RESTART: &str = "RES";

/// Status query, replies with a 3-digit code.
pub const BALANCE_CMD_STATUS: &str = "ESR?";

/// Switch to ASCII result output, replies `0`.
pub const BALANCE_CMD_ASCII: &str = "COF3";

/// Measured-value query, followed by the number of readings requested.
pub const BALANCE_CMD_READINGS: &str = "MSV?";

/// Stop measuring, no reply.
pub const BALANCE_CMD_STOP: &str = "STP";

/// Identification query, replies with a free-form string.
pub const BALANCE_CMD_IDENTIFY: &str = "IDN?";

/// Measurement rate, followed by a [`BALANCE_RATE_CODES`] code. Replies `0`.
pub const BALANCE_CMD_RATE: &str = "ICR";

/// Measurement rates (readings per second) and their `ICR` codes.
pub const BALANCE_RATE_CODES: [(u32, u8); 8] = [
    (100, 0),
    (50, 1),
    (25, 2),
    (12, 3),
    (6, 4),
    (3, 5),
    (2, 6),
    (1, 7),
];

/// Reply: command not understood.
pub const BALANCE_REPLY_UNKNOWN: &str = "?";

/// Reply: generic acknowledgement.
pub const BALANCE_REPLY_OK: &str = "0";

/// Status bit: the last command was malformed.
pub const BALANCE_STATUS_COMMAND_ERROR: u16 = 0b10_0000;

/// Status bit: the last command could not be executed.
pub const BALANCE_STATUS_EXECUTION_ERROR: u16 = 0b01_0000;

/// Status bit: the transducer reports a hardware fault.
pub const BALANCE_STATUS_HARDWARE_ERROR: u16 = 0b00_1000;

/// Largest partial frame kept while waiting for a terminator.
pub const BALANCE_MAX_FRAME: usize = 256;

// ============================================================================
// Serial defaults
// ============================================================================

/// Baud rate used by both instruments.
pub const DEFAULT_BAUD_RATE: u32 = 9600;

/// Data bits used by both instruments.
pub const DEFAULT_DATA_BITS: u8 = 8;

/// Stop bits used by both instruments.
pub const DEFAULT_STOP_BITS: u8 = 1;

// ============================================================================
// Timing
// ============================================================================

/// Without any byte for this long, the transport probes the port.
pub const DEFAULT_LIVENESS_TIMEOUT: Duration = Duration::from_secs(10);

/// A balance partial frame idle for this long is discarded.
pub const DEFAULT_PARTIAL_FRAME_TIMEOUT: Duration = Duration::from_millis(500);

/// How long a reply to a command is awaited before it is given up on.
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(3);

/// First reconnection delay.
pub const DEFAULT_BACKOFF_INITIAL: Duration = Duration::from_millis(250);

/// Reconnection delays never exceed this.
pub const DEFAULT_BACKOFF_MAX: Duration = Duration::from_secs(30);

// ============================================================================
// Balance measurement defaults
// ============================================================================

/// Readings requested per `MSV?` batch.
pub const DEFAULT_READINGS_PER_REQUEST: u32 = 5;

/// Consecutive readings that must agree for a reading to be stable.
pub const DEFAULT_STABILITY_WINDOW: usize = 2;

/// Largest spread, in grams, between readings considered stable.
pub const DEFAULT_STABILITY_TOLERANCE_GRAMS: f64 = 5.0;

/// Readings lighter than this are never reported stable.
pub const DEFAULT_MIN_MASS_GRAMS: f64 = 0.0;

// ============================================================================
// Event dispatch defaults
// ============================================================================

/// Events buffered for the storage sink before ingestion waits.
pub const DEFAULT_STORAGE_QUEUE: usize = 1024;

/// Events buffered for the network sink before the oldest are dropped.
pub const DEFAULT_NETWORK_QUEUE: usize = 256;

/// How long ingestion waits on a full storage queue before reporting
/// the sink as overloaded. The wait then continues.
pub const DEFAULT_STORAGE_WAIT: Duration = Duration::from_secs(2);

/// First delay before a failed storage write is retried.
pub const DEFAULT_STORAGE_RETRY_INITIAL: Duration = Duration::from_millis(100);

/// Storage retries are never spaced further apart than this.
pub const DEFAULT_STORAGE_RETRY_MAX: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_commands_are_single_bytes() {
        for cmd in [READER_CMD_RESET, READER_CMD_START, READER_CMD_STOP] {
            assert!(cmd.is_ascii_lowercase());
            assert_ne!(cmd, b'\n');
        }
    }

    #[test]
    fn test_status_bits_are_distinct() {
        let all = BALANCE_STATUS_COMMAND_ERROR
            | BALANCE_STATUS_EXECUTION_ERROR
            | BALANCE_STATUS_HARDWARE_ERROR;
        assert_eq!(all.count_ones(), 3);
    }

    #[test]
    fn test_rate_codes_are_distinct() {
        let mut codes: Vec<u8> = BALANCE_RATE_CODES.iter().map(|(_, code)| *code).collect();
        codes.dedup();
        assert_eq!(codes.len(), BALANCE_RATE_CODES.len());
    }

    #[test]
    fn test_backoff_bounds() {
        assert!(DEFAULT_BACKOFF_INITIAL < DEFAULT_BACKOFF_MAX);
    }
}
