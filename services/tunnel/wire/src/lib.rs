//! Wire framing for tunnel sessions.
//!
//! This crate defines the frame format carried over a tunnel transport. Each
//! frame is one message on the transport (the transport guarantees message
//! boundaries), so no outer length prefix is needed.
//!
//! ## Wire Format
//!
//! ```text
//! +----------------+----------------------------------+
//! | u8 frame type  | Connect/Data/Error/Ping/Pong     |
//! +----------------+----------------------------------+
//! | u64 conn_id    | connection ID, session-scoped    |
//! +----------------+----------------------------------+
//! | body           | type-specific, see frame.rs      |
//! +----------------+----------------------------------+
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod frame;
pub mod handshake;

pub use error::WireError;
pub use frame::{ConnectRequest, Frame, FrameBody, FrameType, MAX_ADDRESS_LEN, MAX_PROTO_LEN};
pub use handshake::{
    decode_params, encode_params, ClusterParams, NodeParams, ParamsError, RegistrationParams,
    PARAMS_HEADER, TOKEN_HEADER,
};
