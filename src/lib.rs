#![warn(missing_docs)]
/*! Host-side toolkit for talking to automotive ECUs over a pass-through
CAN adapter.

The crate implements three diagnostic protocols and the operations built
on top of them:

* **D2**: a proprietary request/response protocol on CAN id
  `0x000FFFFE` with a single-byte framing header.
* **KWP 2000** (ISO 14230) carried over the **TP 2.0** transport.
* **UDS** (ISO 14229) over ISO-TP.

On top of the protocol stack sit three workhorses:

* [`flasher`]: reflash or read out an ECU (fall asleep → authorize →
  bootloader → erase → transfer → wake up), with progress callbacks.
* [`logger`]: sample live measurement values on a fixed 50 ms grid and
  dispatch decoded records to subscribers.
* [`pinfinder`]: brute-force the security-access PIN, sharing the
  authorize step with the flasher.

# Architecture overview

Everything talks to the adapter through one narrow seam, the
[`adapter::PassThru`] trait. A typical reflash looks like:

```text
      [ VBF artifact ]        [ platform config ]
              ↓                        ↓
         [ Flasher plan: open → sleep → authorize → ... ]
              ↓
    [ request processor (D2 / UDS / TP 2.0 session) ]
              ↓
        [ frame codec (8-byte CAN payloads) ]
              ↓
          [ adapter facade → pass-through driver ]
```

The pass-through driver itself (a J2534 DLL, SocketCAN, ...) is not part
of this crate; anything implementing [`adapter::PassThru`] will do, and
the test suite drives the whole stack through a scripted stub.

# Example

Deriving a security-access key, the way the flasher and the PIN scanner
do it:

```
use candiag::security::generate_key;
let key = generate_key(&[0x00, 0x00, 0xD3, 0x5D, 0x6F], &[0xE5, 0x1E, 0x8F]);
assert_eq!(key, [0x8B, 0x62, 0xCD]);
```
*/

// Protocols.
pub mod d2;
pub mod isotp;
pub mod tp20;
pub mod uds;

// Protocol building blocks.
pub mod d2_steps;
pub mod kwp_steps;
pub mod processor;
pub mod security;
pub mod uds_steps;

// High-level operations.
pub mod flasher;
pub mod logger;
pub mod pinfinder;

// Infrastructure.
pub mod adapter;
pub mod config;
pub mod transceiver;

// Artifacts and support codecs.
pub mod checksum;
pub mod lzss;
pub mod params;
pub mod rle;
pub mod vbf;
pub mod xorcipher;

use adapter::AdapterError;

/// Convenience alias used by the whole crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Toolkit error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    /// Error reported by the pass-through adapter.
    #[error("adapter error: {0}")]
    Adapter(#[from] AdapterError),

    /// A frame failed validation: bad length, wrong series nibble, id
    /// mismatch.
    #[error("frame error: {0}")]
    Frame(String),

    /// Negative response from a UDS service.
    #[error("UDS negative response 0x{code:02X}: {desc}", code = .0, desc = uds::nrc_description(*.0))]
    Uds(u8),

    /// Negative response from a D2 service.
    #[error("D2 negative response 0x{code:02X}: {desc}", code = .0, desc = d2::nrc_description(*.0))]
    D2(u8),

    /// Negative response over TP 2.0.
    #[error("TP 2.0 negative response 0x{code:02X}: {desc}", code = .0, desc = tp20::nrc_description(*.0))]
    Tp20(u8),

    /// The expected response did not arrive in time.
    #[error("timed out waiting for response")]
    Timeout,

    /// Caller handed us something we cannot send or parse.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A flash-plan step did not get the acknowledgement it requires.
    #[error("flash protocol error: {0}")]
    FlashProtocol(String),
}

impl Error {
    pub(crate) fn frame(msg: impl Into<String>) -> Self {
        Error::Frame(msg.into())
    }
    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }
    pub(crate) fn flash(msg: impl Into<String>) -> Self {
        Error::FlashProtocol(msg.into())
    }
}

/// Big-endian u32 → four bytes, the byte order every wire format here
/// uses for addresses and sizes.
pub(crate) fn be32(value: u32) -> [u8; 4] {
    value.to_be_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_descriptions_are_stable() {
        assert_eq!(
            Error::Uds(0x37).to_string(),
            "UDS negative response 0x37: Required time delay has not expired"
        );
        assert_eq!(
            Error::Tp20(0x90).to_string(),
            "TP 2.0 negative response 0x90: No program"
        );
        assert_eq!(
            Error::D2(0x31).to_string(),
            "D2 negative response 0x31: Request out of range"
        );
    }
}
